use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use priorquote::audit::FileAuditStore;
use priorquote::config::PricingConfig;
use priorquote::llm::openai::OpenAiClient;
use priorquote::output::QuoteResponse;
use priorquote::pipeline::{Pipeline, PipelineState, Quote};
use priorquote::stress::{self, STANDARD_SHOCKS};
use priorquote::types::CancelToken;
use priorquote::validator::Check;

const USAGE: &str = "usage: priorquote [--config PATH] [--seed N] [--years N] [--audit-dir DIR] \
                     [--output PATH] [--quiet] [--analysis] <description>";

struct Args {
    description: Option<String>,
    config_path: Option<PathBuf>,
    seed: Option<u64>,
    years: Option<u32>,
    audit_dir: Option<PathBuf>,
    output_path: Option<PathBuf>,
    quiet: bool,
    analysis: bool,
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        description: None,
        config_path: None,
        seed: None,
        years: None,
        audit_dir: None,
        output_path: None,
        quiet: false,
        analysis: false,
    };

    let value = |i: usize, flag: &str| -> Result<String, String> {
        args.get(i).cloned().ok_or_else(|| format!("{flag} requires a value"))
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--description" => {
                i += 1;
                parsed.description = Some(value(i, "--description")?);
            }
            "--config" => {
                i += 1;
                parsed.config_path = Some(value(i, "--config")?.into());
            }
            "--seed" => {
                i += 1;
                parsed.seed = Some(value(i, "--seed")?.parse().map_err(|_| "--seed requires a u64")?);
            }
            "--years" => {
                i += 1;
                parsed.years = Some(value(i, "--years")?.parse().map_err(|_| "--years requires a u32")?);
            }
            "--audit-dir" => {
                i += 1;
                parsed.audit_dir = Some(value(i, "--audit-dir")?.into());
            }
            "--output" => {
                i += 1;
                parsed.output_path = Some(value(i, "--output")?.into());
            }
            "--quiet" => parsed.quiet = true,
            "--analysis" => parsed.analysis = true,
            flag if flag.starts_with("--") => return Err(format!("unknown flag {flag}")),
            text => {
                // Unflagged words form the description.
                let d = parsed.description.get_or_insert_with(String::new);
                if !d.is_empty() {
                    d.push(' ');
                }
                d.push_str(text);
            }
        }
        i += 1;
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = match parse_args() {
        Ok(a) => a,
        Err(msg) => {
            eprintln!("{msg}\n{USAGE}");
            return ExitCode::from(2);
        }
    };
    let Some(description) = args.description.clone() else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };

    let mut config = match &args.config_path {
        Some(path) => match PricingConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::from(2);
            }
        },
        None => PricingConfig::canonical(),
    };
    if let Some(seed) = args.seed {
        config.simulation.seed = seed;
    }
    if let Some(years) = args.years {
        config.simulation.years = years;
    }
    if let Some(dir) = &args.audit_dir {
        config.audit.dir = dir.clone();
    }

    let client = match OpenAiClient::from_config(&config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };
    let store = Arc::new(FileAuditStore::new(config.audit.dir.clone()));
    let config = Arc::new(config);
    let pipeline = Pipeline::new(client, Arc::clone(&config)).with_store(store);

    let outcome = pipeline.quote(description, &CancelToken::new()).await;
    let response = outcome.response();

    if let Err(e) = write_response(&response, args.output_path.as_ref()) {
        eprintln!("failed to write quote: {e}");
        return ExitCode::FAILURE;
    }

    match &outcome.state {
        PipelineState::Reported(quote) => {
            if !args.quiet {
                print_report(quote);
            }
            if args.analysis {
                print_analysis(quote, &config);
            }
        }
        PipelineState::Failed(failure) => {
            eprintln!("request failed at {}: {}", failure.stage, failure.error);
            if let Some(e) = &failure.audit_error {
                eprintln!("failure was not recorded: {e}");
            }
        }
        _ => {}
    }

    match outcome.state {
        PipelineState::Reported(_) => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}

fn write_response(response: &QuoteResponse, path: Option<&PathBuf>) -> std::io::Result<()> {
    match path {
        Some(path) => {
            let mut writer = BufWriter::new(File::create(path)?);
            serde_json::to_writer_pretty(&mut writer, response)?;
            writeln!(writer)?;
            writer.flush()
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            serde_json::to_writer_pretty(&mut stdout, response)?;
            writeln!(stdout)
        }
    }
}

fn print_report(quote: &Quote) {
    let r = &quote.report.result;

    // ── Quote ─────────────────────────────────────────────────────────────────
    eprintln!("\n=== Quote: {} ===", r.peril);
    eprintln!("  Expected loss:        {:>16.2}", r.expected_loss);
    eprintln!("  Std dev:              {:>16.2}", r.std_dev);
    eprintln!("  CoV:                  {:>16.4}", r.coefficient_of_variation);
    eprintln!("  Risk load:            {:>16.4}", r.risk_load);
    eprintln!("  Gross premium:        {:>16.2}", r.gross_premium);
    eprintln!("  VaR {:.0}%:              {:>16.2}", r.confidence_level * 100.0, r.var_99);
    eprintln!("  TVaR {:.0}%:             {:>16.2}", r.confidence_level * 100.0, r.tvar_99);
    eprintln!("  PML ratio:            {:>16.4}", r.pml_ratio);
    eprintln!("  Loss ratio:           {:>16.4}", r.loss_ratio);
    eprintln!("  Risk level:           {:>16}", r.risk_level.to_string());
    eprintln!("  {}", r.recommendation);

    // ── Validation checks ─────────────────────────────────────────────────────
    eprintln!("\n=== Validation checks ===");
    for (n, check) in Check::ALL.iter().enumerate() {
        let verdict = match quote.report.outcome(*check) {
            Some(c) if c.corrected => "CORRECTED",
            Some(c) if c.passed => "PASS",
            Some(_) => "FAIL",
            None => "SKIPPED",
        };
        eprintln!("  [{:>2}] {:<36} {verdict}", n + 1, check.label());
    }
    if quote.report.validation_passed {
        eprintln!("  All checks: PASS");
    } else {
        let failures = quote.report.failures();
        eprintln!("\n  {} failure(s):", failures.len());
        for f in &failures {
            eprintln!("    {f}");
        }
    }
    for alert in &quote.report.alerts {
        eprintln!("  ALERT: {alert}");
    }

    // ── Sanity dashboard ──────────────────────────────────────────────────────
    let d = &quote.report.dashboard;
    let b = &d.benchmark;
    let mark = |ok: bool| if ok { "in range" } else { "OUT OF RANGE" };
    eprintln!("\n=== Sanity dashboard (benchmark: {}) ===", b.peril);
    eprintln!("  Premium / EL:         {:>16.4}", d.premium_to_el_ratio);
    eprintln!("  Tail ratio TVaR/VaR:  {:>16.4}", d.tail_ratio);
    eprintln!("  P(loss > p95):        {:>16.4}", d.extreme_loss_probability);
    eprintln!(
        "  Expected loss:        {:>16.0}  [{:.0}, {:.0}] {}",
        r.expected_loss,
        b.benchmark.expected_loss[0],
        b.benchmark.expected_loss[1],
        mark(b.expected_loss_in_range)
    );
    eprintln!(
        "  CoV:                  {:>16.4}  [{}, {}] {}",
        r.coefficient_of_variation,
        b.benchmark.cov[0],
        b.benchmark.cov[1],
        mark(b.cov_in_range)
    );
    eprintln!(
        "  Rate on line:         {:>16.4}  [{}, {}] {}",
        b.rate_on_line,
        b.benchmark.rate_on_line[0],
        b.benchmark.rate_on_line[1],
        mark(b.rate_on_line_in_range)
    );
    eprintln!("  Risk load vs typical: {:>+16.4}  (typical {})", b.risk_load_gap, b.benchmark.risk_load);

    // ── Annual loss distribution ──────────────────────────────────────────────
    let s = &r.summary;
    let d = &s.annual_loss;
    eprintln!(
        "\n=== Annual loss ({} years + {} tail, {} events, P(zero) {:.3}) ===",
        s.years - s.tail_years,
        s.tail_years,
        s.total_events,
        s.zero_loss_probability
    );
    eprintln!(
        "{:>12} | {:>12} | {:>12} | {:>12} | {:>12} | {:>12} | {:>12}",
        "min", "p25", "p50", "p75", "p95", "p99", "max"
    );
    eprintln!(
        "{:>12.0} | {:>12.0} | {:>12.0} | {:>12.0} | {:>12.0} | {:>12.0} | {:>12.0}",
        d.min, d.p25, d.p50, d.p75, d.p95, d.p99, d.max
    );

    // ── Executive summary ─────────────────────────────────────────────────────
    if let Some(canvas) = &quote.record.canvas {
        eprintln!("\n{}", quote.report.executive_summary(canvas));
    }
}

fn print_analysis(quote: &Quote, config: &PricingConfig) {
    let (Some(scenarios), Some(canvas)) = (&quote.record.scenarios, &quote.record.canvas) else {
        return;
    };

    match stress::stress_test(scenarios, canvas, &config.pricing, &STANDARD_SHOCKS) {
        Ok(outcomes) => {
            eprintln!("\n=== Stress tests ===");
            eprintln!("{:<16} | {:>14} | {:>8} | {:>14} | {:>14}", "Shock", "EL", "ΔEL%", "Gross", "VaR");
            for o in &outcomes {
                eprintln!(
                    "{:<16} | {:>14.0} | {:>7.1}% | {:>14.0} | {:>14.0}",
                    o.shock.label(),
                    o.expected_loss,
                    o.expected_loss_change * 100.0,
                    o.gross_premium,
                    o.var_99,
                );
            }
        }
        Err(e) => eprintln!("stress test failed: {e}"),
    }

    match stress::sensitivity(scenarios, &canvas.peril, &config.pricing, &[0.10, 0.15, 0.20], &[0.95, 0.99, 0.995]) {
        Ok(rows) => {
            eprintln!("\n=== Pricing sensitivity ===");
            eprintln!("{:>7} | {:>7} | {:>9} | {:>14} | {:>14} | {:>14}", "Margin", "Conf", "Load", "Gross", "VaR", "TVaR");
            for row in &rows {
                eprintln!(
                    "{:>7.2} | {:>7.3} | {:>9.4} | {:>14.0} | {:>14.0} | {:>14.0}",
                    row.base_margin, row.confidence_level, row.risk_load, row.gross_premium, row.var, row.tvar,
                );
            }
        }
        Err(e) => eprintln!("sensitivity analysis failed: {e}"),
    }
}
