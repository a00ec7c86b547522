//! Command-line report for a points ledger database.
//!
//! # Responsibility
//! - Open (and migrate) a ledger file and print its balance and drift report.
//! - Keep output deterministic for quick local sanity checks.
//!
//! Usage: `pointledger <db-path>`. Set `POINTLEDGER_LOG_DIR` (absolute) to
//! enable file logging; `POINTLEDGER_LOG_LEVEL` overrides the default level.

use log::error;
use pointledger_core::db::open_db_with_config;
use pointledger_core::{
    core_version, default_log_level, init_logging, LedgerConfig, OpContext,
    ReconciliationReporter, SqliteStore,
};
use std::process::ExitCode;
use std::time::Duration;

const REPORT_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> ExitCode {
    let Some(db_path) = std::env::args().nth(1) else {
        eprintln!("usage: pointledger <db-path>");
        return ExitCode::from(2);
    };

    if let Ok(log_dir) = std::env::var("POINTLEDGER_LOG_DIR") {
        let level = std::env::var("POINTLEDGER_LOG_LEVEL")
            .unwrap_or_else(|_| default_log_level().to_string());
        if let Err(err) = init_logging(&level, &log_dir) {
            eprintln!("logging disabled: {err}");
        }
    }

    match run(&db_path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("event=cli_report module=cli status=error error={}", message);
            eprintln!("pointledger: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run(db_path: &str) -> Result<(), String> {
    let config = LedgerConfig::default();
    let conn = open_db_with_config(db_path, &config).map_err(|err| err.to_string())?;
    let store = SqliteStore::try_new(&conn)
        .map_err(|err| err.to_string())?
        .with_config(&config);
    let reporter = ReconciliationReporter::new(store);
    let ctx = OpContext::with_timeout(REPORT_TIMEOUT);

    let balance = reporter
        .current_points(&ctx)
        .map_err(|err| err.to_string())?;
    let report = reporter
        .aggregate_points(&ctx)
        .map_err(|err| err.to_string())?;

    println!("pointledger_core version={}", core_version());
    println!("balance={} updated_at={}", balance.point, balance.updated_at);
    println!(
        "achievements={} total_points={} difference={}",
        report.total_achievements, report.total_points, report.difference
    );
    Ok(())
}
