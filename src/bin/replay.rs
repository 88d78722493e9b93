use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use priorquote::audit::{FileAuditStore, replay};
use priorquote::config::PricingConfig;

/// Re-runs the numeric half of a persisted quote and checks it reproduces.
fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(path) = env::args().nth(1).map(PathBuf::from) else {
        eprintln!("usage: replay <audit-record.json>");
        return ExitCode::from(2);
    };

    let record = match FileAuditStore::load(&path) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("replay: {e}");
            return ExitCode::from(2);
        }
    };
    if let Some(failure) = &record.failure {
        eprintln!(
            "replay: request {} failed at {} ({}): {}",
            record.request_id, failure.stage, failure.kind, failure.message
        );
    }

    let simulation = PricingConfig::canonical().simulation;
    let outcome = match replay(&record, &simulation) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("replay: {e}");
            return ExitCode::FAILURE;
        }
    };

    let r = &outcome.result;
    println!("request:        {}", record.request_id);
    println!("seed / years:   {} / {}", record.seed, record.years);
    println!("exchanges:      {}", record.exchanges.len());
    println!("expected loss:  {:.2}", r.expected_loss);
    println!("gross premium:  {:.2}", r.gross_premium);
    println!("VaR / TVaR:     {:.2} / {:.2}", r.var_99, r.tvar_99);
    println!("scenarios:      {}", if outcome.scenarios_match { "MATCH" } else { "MISMATCH" });
    println!("pricing result: {}", if outcome.result_match { "MATCH" } else { "MISMATCH" });

    if outcome.reproduced() { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}
