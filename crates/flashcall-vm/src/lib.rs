//! Flash-loan call-list interpreter.
//!
//! The core is a small virtual machine invoked from inside a flash-loan
//! callback: it decodes an ordered list of sub-calls (see
//! `flashcall-wire`), executes them one by one, optionally patches a
//! payload with return data captured earlier in the same sequence, and
//! requires the borrowed principal plus fee back at the lender before it
//! returns. The host's atomic transaction boundary is modeled explicitly
//! by the journaled [`TokenLedger`].

pub mod exec;
pub mod ledger;
pub mod world;

pub use exec::{
    CallRouter, ExecutionError, FlashExecutor, FlashLoanError, LoanTerms, RoutedCall, RunReport,
};
pub use ledger::{Checkpoint, LedgerError, TokenLedger};
pub use world::{FlashError, LenderPool, WorldRouter};
