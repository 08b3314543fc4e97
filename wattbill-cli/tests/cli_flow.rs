use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::Result;
use assert_cmd::prelude::*;
use serde_json::Value;
use tempfile::tempdir;

const SEED: &str = r#"
[[tariffs]]
id = 1
voltage_type = "medium"
cost_per_kwh = "2.00"
fixed_fee = "5"

[[stations]]
id = 10
name = "north"
water_source = 1

[[stations]]
id = 11
name = "south"
water_source = 1

[[technologies]]
id = 20
name = "filtration"
power_per_water = "0.35"

[[meters]]
account = "ACC-1"
meter_id = "M-1"
factor = 1
final_reading = "0"
tariff_id = 1

[[relations]]
station = 10
technology = 20
account = "ACC-1"

[[relations]]
station = 11
technology = 20
account = "ACC-1"

[[chemical_references]]
technology = 20
water_source = 1
season = "summer"
chlorine = { from = "2", to = "4" }
"#;

const SUBMISSION: &str = r#"{
    "account": "ACC-1",
    "period": { "month": 6, "year": 2024 },
    "previous_reading": "0",
    "current_reading": "100",
    "reading_factor": 1,
    "power_consumption": "100",
    "bill_total": "205"
}"#;

fn wattbill(dir: &Path) -> Command {
    let binary = assert_cmd::cargo::cargo_bin!("wattbill");
    let mut cmd = Command::new(binary);
    cmd.current_dir(dir)
        .env("WATTBILL__DATABASE__PATH", dir.join("wattbill.db"))
        .env("WATTBILL__LOGGING__LEVEL", "warn")
        .env_remove("RUST_LOG")
        .arg("--config-dir")
        .arg(dir.join("config"));
    cmd
}

fn json_output(cmd: &mut Command) -> Result<Value> {
    let output = cmd.assert().success().get_output().stdout.clone();
    Ok(serde_json::from_slice(&output)?)
}

#[test]
fn seeds_bills_and_splits_by_volume() -> Result<()> {
    let temp = tempdir()?;
    let dir = temp.path();
    fs::write(dir.join("seed.toml"), SEED)?;
    fs::write(dir.join("june.json"), SUBMISSION)?;

    wattbill(dir).arg("init").assert().success();
    let summary = json_output(wattbill(dir).arg("seed").arg(dir.join("seed.toml")))?;
    assert_eq!(summary["relations"], 2);

    let accepted = json_output(
        wattbill(dir)
            .args(["bill", "submit"])
            .arg(dir.join("june.json")),
    )?;
    assert_eq!(accepted["allocations"].as_array().map(Vec::len), Some(2));
    assert!(accepted["allocations"][0]["percentage"].is_null());

    json_output(wattbill(dir).args([
        "volume", "record", "--station", "10", "--technology", "20", "--month", "6",
        "--year", "2024", "--volume", "25", "--chlorine", "5",
    ]))?;
    let split = json_output(wattbill(dir).args([
        "volume", "record", "--station", "11", "--technology", "20", "--month", "6",
        "--year", "2024", "--volume", "75",
    ]))?;
    assert_eq!(split["normalized"].as_array().map(Vec::len), Some(1));

    let ledgers = json_output(wattbill(dir).args(["ledger", "list", "--station", "10"]))?;
    assert_eq!(ledgers[0]["power"], "25");
    assert_eq!(ledgers[0]["allocation"]["state"], "normalized");

    let reversed = json_output(wattbill(dir).args([
        "bill", "delete", "--account", "ACC-1", "--month", "6", "--year", "2024",
    ]))?;
    assert_eq!(reversed["restored_reading"], "0");
    Ok(())
}

#[test]
fn rejected_submission_exits_with_error() -> Result<()> {
    let temp = tempdir()?;
    let dir = temp.path();
    fs::write(dir.join("seed.toml"), SEED)?;
    fs::write(dir.join("bad.json"), SUBMISSION.replace("\"205\"", "\"300\""))?;

    wattbill(dir)
        .arg("seed")
        .arg(dir.join("seed.toml"))
        .assert()
        .success();
    let output = wattbill(dir)
        .args(["bill", "submit"])
        .arg(dir.join("bad.json"))
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8(output)?;
    assert!(stderr.contains("does not match computed total"), "{stderr}");

    wattbill(dir)
        .args(["bill", "show", "--account", "ACC-1", "--month", "6", "--year", "2024"])
        .assert()
        .failure();
    Ok(())
}

#[test]
fn config_command_prints_effective_settings() -> Result<()> {
    let temp = tempdir()?;
    let dir = temp.path();
    fs::create_dir_all(dir.join("config"))?;
    fs::write(
        dir.join("config").join("default.toml"),
        "[billing]\ntotal_tolerance = 3\n",
    )?;
    let output = wattbill(dir).arg("config").assert().success().get_output().stdout.clone();
    let rendered = String::from_utf8(output)?;
    assert!(rendered.contains("total_tolerance = 3"), "{rendered}");
    Ok(())
}
