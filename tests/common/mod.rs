#![allow(dead_code)]

use assert_cmd::cargo_bin;
use std::io::Write;
use std::process::Command;
use tempfile::NamedTempFile;

pub const LEDGER_HEADER: &str = "type, org, unit, amount, date";
pub const RESERVATION_HEADER: &str = "type, org, asset, reservation, start, end, amount, at";

/// Writes a header and rows to a temporary CSV file.
pub fn events_file(header: &str, rows: &[&str]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{header}").unwrap();
    for row in rows {
        writeln!(file, "{row}").unwrap();
    }
    file.flush().unwrap();
    file
}

/// The binary with a predictable environment: default policy values and
/// info-level logs on stderr.
pub fn cli() -> Command {
    let mut cmd = Command::new(cargo_bin!("hoa-ledger"));
    for key in [
        "RUST_LOG",
        "HOA_LOG_LEVEL",
        "HOA_PENALTY_RATE",
        "HOA_PENALTY_BASIS",
        "HOA_GRACE_PERIOD_DAYS",
        "HOA_RESERVATION_EXPIRATION_HOURS",
    ] {
        cmd.env_remove(key);
    }
    cmd
}
