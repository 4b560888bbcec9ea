use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

use clap::Parser;
use colored::*;
use tracing_subscriber::EnvFilter;

use diagnostic_learning::cli::{Args, Command};
use diagnostic_learning::confidence::ConfidenceReport;
use diagnostic_learning::engine::now_ms;
use diagnostic_learning::{Attempt, ConfidenceMonitor, EngineConfig, LearningEngine, SqliteStore};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

// ---------------------------------------------------------------------------
// Engine construction
// ---------------------------------------------------------------------------

fn open_engine(args: &Args) -> CliResult<LearningEngine> {
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let store = SqliteStore::open(&args.db)?;
    let mut engine = LearningEngine::new(config, Box::new(store));
    let report = engine.load()?;
    if !report.corrupt.is_empty() {
        eprintln!(
            "{} unreadable keys started empty: {}",
            "warning:".yellow().bold(),
            report.corrupt.join(", ")
        );
    }
    Ok(engine)
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

/// Parse one JSON line, filling in an id and timestamp when the record has
/// none.
fn parse_attempt(line: &str) -> Result<Attempt, serde_json::Error> {
    let mut attempt: Attempt = serde_json::from_str(line)?;
    if attempt.issue_id.trim().is_empty() {
        attempt.issue_id = uuid::Uuid::new_v4().to_string();
    }
    if attempt.timestamp_ms == 0 {
        attempt.timestamp_ms = now_ms();
    }
    Ok(attempt)
}

fn ingest(args: &Args, file: &Path, no_compact: bool) -> CliResult<()> {
    let mut engine = open_engine(args)?;
    let reader = BufReader::new(std::fs::File::open(file)?);

    let (mut learned, mut rejected) = (0usize, 0usize);
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_attempt(&line) {
            Ok(attempt) => {
                engine.learn_from_attempt(&attempt);
                learned += 1;
            }
            Err(e) => {
                rejected += 1;
                tracing::warn!(target: "learning::cli", line = n + 1, error = %e, "attempt rejected");
            }
        }
    }
    engine.save()?;
    drop(engine);

    if !no_compact {
        let removed = SqliteStore::open(&args.db)?.compact()?;
        tracing::debug!(target: "learning::cli", removed, "database compacted");
    }

    println!(
        "{} {} attempts learned, {} rejected",
        "ingest:".bright_cyan().bold(),
        learned.to_string().green(),
        if rejected > 0 { rejected.to_string().red() } else { rejected.to_string().normal() }
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

fn score_color(score: f64) -> ColoredString {
    let text = format!("{:5.1}", score);
    if score >= 70.0 {
        text.green()
    } else if score >= 50.0 {
        text.yellow()
    } else {
        text.red()
    }
}

fn print_report(report: &ConfidenceReport) {
    let snap = &report.snapshot;
    println!("{}", "CONFIDENCE REPORT".bright_cyan().bold());
    println!("  overall  {}", score_color(snap.overall_confidence).bold());
    for (factor, score) in snap.factors.iter() {
        println!("  {:<24} {}", factor.to_string(), score_color(score));
    }
    if snap.masking_detected {
        println!("{}", "masking detected".red().bold());
        for w in &snap.warnings {
            println!("  {} [{}] {}", w.source.dimmed(), w.rule, w.reason);
        }
    }
    for d in &report.directives {
        println!(
            "  {} {} -> {} (cycle {})",
            d.priority.to_string().yellow(),
            d.factor,
            d.action,
            d.cycles
        );
    }
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match &args.command {
        Command::Ingest { file, no_compact } => ingest(&args, file, *no_compact)?,
        Command::Report => {
            let mut engine = open_engine(&args)?;
            let report = engine.run_scoring_cycle(now_ms());
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Command::Best { issue_type } => {
            let engine = open_engine(&args)?;
            let rec = engine.get_best_solution(issue_type);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&rec)?);
            } else {
                match rec {
                    Some(r) => {
                        println!(
                            "{} {} ({:.0}% via {})",
                            "best:".bright_cyan().bold(),
                            r.method.green().bold(),
                            r.confidence * 100.0,
                            r.source
                        );
                        for alt in &r.alternatives {
                            println!("  {:<32} {:.0}%", alt.method, alt.success_rate * 100.0);
                        }
                    }
                    None => println!("{} nothing learned for {}", "best:".bright_cyan().bold(), issue_type),
                }
            }
        }
        Command::Prevent { issue_type, error_message, component } => {
            let engine = open_engine(&args)?;
            let prevention = engine.get_misdiagnosis_prevention(issue_type, error_message, component.as_deref());
            if args.json {
                println!("{}", serde_json::to_string_pretty(&prevention)?);
            } else if prevention.is_empty() {
                println!("{}", "no known misdiagnosis".green());
            } else {
                for w in &prevention.warnings {
                    println!("{} {}", "warning:".yellow().bold(), w.key);
                    println!("  commonly mistaken for: {}", w.common_misdiagnosis);
                    println!("  actual root cause:     {}", w.actual_root_cause);
                    println!("  correct approach:      {}", w.correct_approach.green());
                }
                if !prevention.failed_methods.is_empty() {
                    println!("{} {}", "already failed:".red(), prevention.failed_methods.join(", "));
                }
            }
        }
        Command::Monitor { interval } => {
            let engine = open_engine(&args)?;
            let period = interval
                .map(Duration::from_secs)
                .unwrap_or_else(|| engine.config().scoring_interval());
            let mut events = engine.subscribe();
            let mut monitor = ConfidenceMonitor::new(engine.into_shared(), period);
            monitor.start();
            println!("{} every {:?}, Ctrl-C to stop", "monitoring".bright_cyan().bold(), period);

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    ev = events.recv() => match ev {
                        Ok(ev) => println!("{}", serde_json::to_string(&ev)?),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(target: "learning::cli", skipped = n, "event stream lagged");
                        }
                        Err(_) => break,
                    },
                }
            }
            monitor.stop();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_attempt_fills_missing_id_and_timestamp() {
        let a = parse_attempt(r#"{"issue_type":"init_hang","fix_method":"defer","result":"success"}"#).unwrap();
        assert!(uuid::Uuid::parse_str(&a.issue_id).is_ok());
        assert!(a.timestamp_ms > 0);
    }

    #[test]
    fn test_parse_attempt_keeps_given_id() {
        let a = parse_attempt(r#"{"issue_id":"i-1","result":"failure","timestamp_ms":7}"#).unwrap();
        assert_eq!(a.issue_id, "i-1");
        assert_eq!(a.timestamp_ms, 7);
        assert!(a.issue_type().is_none());
    }

    #[test]
    fn test_parse_attempt_rejects_bad_json() {
        assert!(parse_attempt("{not json").is_err());
    }
}
