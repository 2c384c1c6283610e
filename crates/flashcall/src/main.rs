use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use flashcall_contracts::{
    FLASHCALL_CALL_PLAN_SCHEMA_VERSION, FLASHCALL_ENCODE_REPORT_SCHEMA_VERSION,
    FLASHCALL_INSPECT_REPORT_SCHEMA_VERSION, FLASHCALL_SIMULATE_REPORT_SCHEMA_VERSION,
    FLASHCALL_WORLD_CONFIG_SCHEMA_VERSION,
};
use flashcall_vm::{FlashExecutor, LenderPool, RunReport, TokenLedger, WorldRouter};
use flashcall_wire::{decode, encode, Address, CallRecord, Patch};

#[derive(Parser, Debug)]
#[command(name = "flashcall")]
#[command(about = "Build, inspect, and simulate flash-loan call lists.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encode a JSON call plan into the wire format.
    Encode {
        #[arg(long)]
        plan: PathBuf,
        /// If set, also write the hex wire buffer to this file.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Decode a wire buffer and print its records.
    Inspect {
        /// Hex wire buffer, or a file containing one.
        #[arg(long)]
        wire: String,
    },
    /// Run a wire buffer through a flash loan against a configured world.
    Simulate {
        #[arg(long)]
        world: PathBuf,
        /// Hex wire buffer, or a file containing one.
        #[arg(long)]
        wire: String,
    },
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Encode { plan, out } => run_encode(&plan, out.as_deref()),
        Command::Inspect { wire } => run_inspect(&wire),
        Command::Simulate { world, wire } => run_simulate(&world, &wire),
    }
}

#[derive(Debug, Deserialize)]
struct CallPlan {
    schema: String,
    calls: Vec<PlanCall>,
}

#[derive(Debug, Deserialize)]
struct PlanCall {
    #[serde(default)]
    patch: Option<PlanPatch>,
    target: String,
    #[serde(default)]
    value: u128,
    /// Hex-encoded call data, with or without a 0x prefix.
    #[serde(default)]
    payload: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct PlanPatch {
    source_index: u32,
    dest_offset: u64,
}

#[derive(Debug, Serialize)]
struct EncodeReport {
    schema: &'static str,
    records: usize,
    bytes: usize,
    wire: String,
}

fn run_encode(plan_path: &Path, out: Option<&Path>) -> Result<()> {
    let raw = std::fs::read_to_string(plan_path)
        .with_context(|| format!("read plan {}", plan_path.display()))?;
    let plan: CallPlan = serde_json::from_str(&raw)
        .with_context(|| format!("parse plan {}", plan_path.display()))?;
    if plan.schema != FLASHCALL_CALL_PLAN_SCHEMA_VERSION {
        bail!(
            "unsupported plan schema {:?} (expected {FLASHCALL_CALL_PLAN_SCHEMA_VERSION:?})",
            plan.schema
        );
    }

    let mut records = Vec::with_capacity(plan.calls.len());
    for (index, call) in plan.calls.iter().enumerate() {
        let patch = match &call.patch {
            None => None,
            Some(p) => Some(
                Patch::new(p.source_index, p.dest_offset)
                    .with_context(|| format!("call {index}: patch fields out of range"))?,
            ),
        };
        let target: Address = call
            .target
            .parse()
            .map_err(anyhow::Error::new)
            .with_context(|| format!("call {index}: bad target"))?;
        let payload = parse_hex(&call.payload)
            .with_context(|| format!("call {index}: bad payload hex"))?;
        records.push(CallRecord {
            patch,
            target,
            value: call.value,
            payload,
        });
    }

    let wire = encode(&records);
    // The codec is the authority on well-formedness; a plan whose patches
    // reference forward records fails here, not at simulation time.
    decode(&wire)
        .map_err(anyhow::Error::new)
        .context("plan encodes to a malformed buffer")?;

    let wire_hex = flashcall_wire::hex_lower(&wire);
    if let Some(out) = out {
        std::fs::write(out, &wire_hex).with_context(|| format!("write {}", out.display()))?;
    }
    let report = EncodeReport {
        schema: FLASHCALL_ENCODE_REPORT_SCHEMA_VERSION,
        records: records.len(),
        bytes: wire.len(),
        wire: wire_hex,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[derive(Debug, Serialize)]
struct InspectReport {
    schema: &'static str,
    records: Vec<RecordReport>,
}

#[derive(Debug, Serialize)]
struct RecordReport {
    index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    patch: Option<PlanPatch>,
    target: String,
    value: u128,
    payload_len: usize,
    payload: String,
}

fn run_inspect(wire_arg: &str) -> Result<()> {
    let wire = load_wire(wire_arg)?;
    let records = decode(&wire).map_err(anyhow::Error::new)?;
    let report = InspectReport {
        schema: FLASHCALL_INSPECT_REPORT_SCHEMA_VERSION,
        records: records
            .iter()
            .enumerate()
            .map(|(index, r)| RecordReport {
                index,
                patch: r.patch.map(|p| PlanPatch {
                    source_index: p.source_index() as u32,
                    dest_offset: p.dest_offset() as u64,
                }),
                target: r.target.to_string(),
                value: r.value,
                payload_len: r.payload.len(),
                payload: flashcall_wire::hex_lower(&r.payload),
            })
            .collect(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[derive(Debug, Deserialize)]
struct WorldConfig {
    schema: String,
    token: String,
    pool: PoolConfig,
    executor: String,
    #[serde(default)]
    balances: Vec<BalanceConfig>,
    loan: LoanConfig,
}

#[derive(Debug, Deserialize)]
struct PoolConfig {
    address: String,
    fee_ppm: u32,
    reserves: u128,
}

#[derive(Debug, Deserialize)]
struct BalanceConfig {
    holder: String,
    amount: u128,
}

#[derive(Debug, Deserialize)]
struct LoanConfig {
    initiator: String,
    amount: u128,
}

#[derive(Debug, Serialize)]
struct SimulateReport {
    schema: &'static str,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<RunReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn run_simulate(world_path: &Path, wire_arg: &str) -> Result<()> {
    let raw = std::fs::read_to_string(world_path)
        .with_context(|| format!("read world {}", world_path.display()))?;
    let config: WorldConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse world {}", world_path.display()))?;
    if config.schema != FLASHCALL_WORLD_CONFIG_SCHEMA_VERSION {
        bail!(
            "unsupported world schema {:?} (expected {FLASHCALL_WORLD_CONFIG_SCHEMA_VERSION:?})",
            config.schema
        );
    }
    let wire = load_wire(wire_arg)?;

    let token = parse_address(&config.token, "world token")?;
    let pool = LenderPool {
        address: parse_address(&config.pool.address, "pool address")?,
        token,
        fee_ppm: config.pool.fee_ppm,
    };
    let executor = FlashExecutor::new(parse_address(&config.executor, "executor address")?);
    let initiator = parse_address(&config.loan.initiator, "loan initiator")?;

    let mut ledger = TokenLedger::new();
    ledger
        .mint(token, pool.address, config.pool.reserves)
        .map_err(anyhow::Error::new)
        .context("seed pool reserves")?;
    for (i, b) in config.balances.iter().enumerate() {
        let holder = parse_address(&b.holder, "balance holder")?;
        ledger
            .mint(token, holder, b.amount)
            .map_err(anyhow::Error::new)
            .with_context(|| format!("seed balance {i}"))?;
    }
    let mut router = WorldRouter::new();
    router.register_token(token);

    let outcome = pool.flash(
        &mut router,
        &mut ledger,
        &executor,
        initiator,
        config.loan.amount,
        &wire,
    );
    let report = match outcome {
        Ok(run) => SimulateReport {
            schema: FLASHCALL_SIMULATE_REPORT_SCHEMA_VERSION,
            ok: true,
            report: Some(run),
            error: None,
        },
        Err(e) => SimulateReport {
            schema: FLASHCALL_SIMULATE_REPORT_SCHEMA_VERSION,
            ok: false,
            report: None,
            error: Some(e.to_string()),
        },
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// `--wire` accepts either a hex string or the path of a file holding one.
fn load_wire(arg: &str) -> Result<Vec<u8>> {
    let trimmed = arg.trim();
    let text = if Path::new(trimmed).is_file() {
        std::fs::read_to_string(trimmed).with_context(|| format!("read wire file {trimmed}"))?
    } else {
        trimmed.to_string()
    };
    parse_hex(&text).context("wire buffer is not valid hex")
}

fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let stripped = s.trim().strip_prefix("0x").unwrap_or_else(|| s.trim());
    Ok(hex::decode(stripped)?)
}

fn parse_address(s: &str, what: &str) -> Result<Address> {
    s.parse()
        .map_err(anyhow::Error::new)
        .with_context(|| format!("{what}: bad address {s:?}"))
}
