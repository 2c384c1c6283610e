use std::path::Path;
use std::process::Command;

use serde_json::{json, Value};

use flashcall_contracts::{
    FLASHCALL_CALL_PLAN_SCHEMA_VERSION, FLASHCALL_ENCODE_REPORT_SCHEMA_VERSION,
    FLASHCALL_INSPECT_REPORT_SCHEMA_VERSION, FLASHCALL_SIMULATE_REPORT_SCHEMA_VERSION,
    FLASHCALL_WORLD_CONFIG_SCHEMA_VERSION,
};
use flashcall_vm::world::{balance_of_payload, mint_payload, transfer_payload};
use flashcall_wire::{Address, ADDRESS_BYTES};

// 6-decimal token units: JSON `Value` cannot hold integers past u64::MAX,
// so the CLI suite stays below it. The vm suite covers 18-decimal amounts.
const SCALAR: u128 = 1_000_000;

fn addr(last: u8) -> String {
    let mut a = [0u8; ADDRESS_BYTES];
    a[ADDRESS_BYTES - 1] = last;
    Address(a).to_string()
}

fn raw_addr(last: u8) -> Address {
    let mut a = [0u8; ADDRESS_BYTES];
    a[ADDRESS_BYTES - 1] = last;
    Address(a)
}

fn run_flashcall(args: &[&str]) -> std::process::Output {
    let exe = env!("CARGO_BIN_EXE_flashcall");
    Command::new(exe).args(args).output().expect("run flashcall")
}

fn parse_json_stdout(out: &std::process::Output) -> Value {
    serde_json::from_slice(&out.stdout).expect("parse stdout JSON")
}

fn write_json(path: &Path, value: &Value) {
    std::fs::write(path, serde_json::to_vec_pretty(value).unwrap()).expect("write json");
}

/// Cyclic-arbitrage plan: mint fee+profit, repay, query the executor
/// balance, forward it to the initiator via a patched transfer.
fn arbitrage_plan(repay_short_by: u128) -> Value {
    let token = addr(0x10);
    let pool = raw_addr(0x20);
    let executor = raw_addr(0x30);
    let initiator = raw_addr(0x40);

    let principal = 10 * SCALAR;
    let fee = principal * (1_000_000 - 500) / 1_000_000;
    let profit = 2 * SCALAR / 10;

    json!({
        "schema": FLASHCALL_CALL_PLAN_SCHEMA_VERSION,
        "calls": [
            { "target": token, "payload": hex::encode(mint_payload(executor, fee + profit)) },
            { "target": token,
              "payload": hex::encode(transfer_payload(pool, principal + fee - repay_short_by)) },
            { "target": token, "payload": hex::encode(balance_of_payload(executor)) },
            { "target": token,
              "patch": { "source_index": 2, "dest_offset": 36 },
              "payload": hex::encode(transfer_payload(initiator, 0)) },
        ],
    })
}

fn world_config() -> Value {
    json!({
        "schema": FLASHCALL_WORLD_CONFIG_SCHEMA_VERSION,
        "token": addr(0x10),
        "pool": { "address": addr(0x20), "fee_ppm": 500, "reserves": 100 * SCALAR },
        "executor": addr(0x30),
        "balances": [],
        "loan": { "initiator": addr(0x40), "amount": 10 * SCALAR },
    })
}

#[test]
fn encode_inspect_simulate_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let plan_path = dir.path().join("plan.json");
    let wire_path = dir.path().join("wire.hex");
    let world_path = dir.path().join("world.json");
    write_json(&plan_path, &arbitrage_plan(0));
    write_json(&world_path, &world_config());

    let out = run_flashcall(&[
        "encode",
        "--plan",
        plan_path.to_str().unwrap(),
        "--out",
        wire_path.to_str().unwrap(),
    ]);
    assert_eq!(
        out.status.code(),
        Some(0),
        "stderr:\n{}",
        String::from_utf8_lossy(&out.stderr)
    );
    let v = parse_json_stdout(&out);
    assert_eq!(v["schema"], FLASHCALL_ENCODE_REPORT_SCHEMA_VERSION);
    assert_eq!(v["records"], 4);
    let wire_hex = std::fs::read_to_string(&wire_path).expect("read wire file");
    assert_eq!(v["wire"], wire_hex.as_str());

    let out = run_flashcall(&["inspect", "--wire", wire_path.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(0));
    let v = parse_json_stdout(&out);
    assert_eq!(v["schema"], FLASHCALL_INSPECT_REPORT_SCHEMA_VERSION);
    let records = v["records"].as_array().expect("records[]");
    assert_eq!(records.len(), 4);
    assert_eq!(records[0]["patch"], Value::Null);
    assert_eq!(records[3]["patch"]["source_index"], 2);
    assert_eq!(records[3]["patch"]["dest_offset"], 36);
    assert_eq!(records[3]["target"], addr(0x10));

    let out = run_flashcall(&[
        "simulate",
        "--world",
        world_path.to_str().unwrap(),
        "--wire",
        wire_path.to_str().unwrap(),
    ]);
    assert_eq!(
        out.status.code(),
        Some(0),
        "stderr:\n{}",
        String::from_utf8_lossy(&out.stderr)
    );
    let v = parse_json_stdout(&out);
    assert_eq!(v["schema"], FLASHCALL_SIMULATE_REPORT_SCHEMA_VERSION);
    assert_eq!(v["ok"], true);
    assert_eq!(v["report"]["records"], 4);
    assert_eq!(v["report"]["patched"], 1);
    let principal = 10 * SCALAR;
    let fee = principal * (1_000_000 - 500) / 1_000_000;
    assert_eq!(
        v["report"]["repaid"].as_u64().expect("repaid") as u128,
        principal + fee
    );
}

#[test]
fn simulate_reports_an_unrepaid_loan_as_a_trap() {
    let dir = tempfile::tempdir().expect("tempdir");
    let plan_path = dir.path().join("plan.json");
    let world_path = dir.path().join("world.json");
    write_json(&plan_path, &arbitrage_plan(1));
    write_json(&world_path, &world_config());

    let out = run_flashcall(&["encode", "--plan", plan_path.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(0));
    let wire_hex = parse_json_stdout(&out)["wire"]
        .as_str()
        .expect("wire hex")
        .to_string();

    let out = run_flashcall(&[
        "simulate",
        "--world",
        world_path.to_str().unwrap(),
        "--wire",
        &wire_hex,
    ]);
    assert_eq!(out.status.code(), Some(0));
    let v = parse_json_stdout(&out);
    assert_eq!(v["ok"], false);
    let error = v["error"].as_str().expect("error string");
    assert!(error.contains("loan unrepaid"), "{error}");
}

#[test]
fn encode_rejects_a_forward_patch_reference() {
    let dir = tempfile::tempdir().expect("tempdir");
    let plan_path = dir.path().join("plan.json");
    let mut plan = arbitrage_plan(0);
    plan["calls"][1]["patch"] = json!({ "source_index": 3, "dest_offset": 36 });
    write_json(&plan_path, &plan);

    let out = run_flashcall(&["encode", "--plan", plan_path.to_str().unwrap()]);
    assert_ne!(out.status.code(), Some(0));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("malformed"), "stderr:\n{stderr}");
}

#[test]
fn encode_rejects_the_wrong_plan_schema() {
    let dir = tempfile::tempdir().expect("tempdir");
    let plan_path = dir.path().join("plan.json");
    let mut plan = arbitrage_plan(0);
    plan["schema"] = json!("flashcall.plan@9.9.9");
    write_json(&plan_path, &plan);

    let out = run_flashcall(&["encode", "--plan", plan_path.to_str().unwrap()]);
    assert_ne!(out.status.code(), Some(0));
}
