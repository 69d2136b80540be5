//! CLI tests using assert_cmd.
//!
//! Only the offline `convert` path and argument validation run here;
//! `serve` needs PostgreSQL and is covered by the DB-gated tests.

use assert_cmd::Command;
use predicates::prelude::*;

fn xrfcore() -> Command {
    Command::cargo_bin("xrfcore").unwrap()
}

#[test]
fn help_lists_subcommands() {
    xrfcore()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("convert"));
}

#[test]
fn serve_without_database_url_fails() {
    xrfcore()
        .arg("serve")
        .env_remove("DATABASE_URL")
        .assert()
        .failure()
        .stderr(predicate::str::contains("DATABASE_URL"));
}

#[test]
fn convert_missing_input_fails() {
    let dir = tempfile::tempdir().unwrap();
    xrfcore()
        .arg("convert")
        .arg(dir.path().join("nope.csv"))
        .arg(dir.path().join("out.bin"))
        .assert()
        .failure();
}

const SAMPLE_CSV: &str = "PIQUANT version: piquant/3.2.8 DetectorConfig: PIXL/v7\n\
PMC, Fe_%, Fe_int, filename, livetime, SCLK, RTT\n\
12, 4.5, 400, Normal_A, 9.9, 100, 7890\n\
30, 5.5, 500, Normal_A, 9.9, 101, 7890\n";

#[test]
fn convert_round_trip_reaches_fixed_point() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("quant.csv");
    let bin1 = dir.path().join("quant.bin");
    let csv1 = dir.path().join("pass1.csv");
    let bin2 = dir.path().join("pass2.bin");
    let csv2 = dir.path().join("pass2.csv");
    std::fs::write(&input, SAMPLE_CSV).unwrap();

    xrfcore().arg("convert").arg(&input).arg(&bin1).assert().success();
    xrfcore().arg("convert").arg(&bin1).arg(&csv1).assert().success();
    xrfcore().arg("convert").arg(&csv1).arg(&bin2).assert().success();
    xrfcore().arg("convert").arg(&bin2).arg(&csv2).assert().success();

    let pass1 = std::fs::read_to_string(&csv1).unwrap();
    let pass2 = std::fs::read_to_string(&csv2).unwrap();
    assert_eq!(pass1, pass2);
    assert!(pass1.starts_with("PIQUANT version:"));
    assert!(pass1.contains("Fe_%"));
}
