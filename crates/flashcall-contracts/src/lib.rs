//! Shared, version-pinned protocol identifiers.
//!
//! These constants are the single source of truth for schema/version strings
//! that appear in machine-readable I/O.

pub const FLASHCALL_INSPECT_REPORT_SCHEMA_VERSION: &str = "flashcall.inspect.report@0.1.0";
pub const FLASHCALL_ENCODE_REPORT_SCHEMA_VERSION: &str = "flashcall.encode.report@0.1.0";
pub const FLASHCALL_SIMULATE_REPORT_SCHEMA_VERSION: &str = "flashcall.simulate.report@0.1.0";

pub const FLASHCALL_WORLD_CONFIG_SCHEMA_VERSION: &str = "flashcall.world@0.1.0";
pub const FLASHCALL_CALL_PLAN_SCHEMA_VERSION: &str = "flashcall.plan@0.1.0";
