// CLI module - command-line argument parsing and handlers
//
// Operator surface over the engine:
// - run: scheduler daemon until Ctrl-C (default when no subcommand is given)
// - aggregate / promote / sweep: trigger a job for an explicit window
// - emit: record one activity event
// - query: print a time series as JSON
// - verify / status: consistency check and table counts
// - config: show, reset or locate the config file

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use rollstat::calendar::{last_month, yesterday, YearMonth};
use rollstat::config::{Config, VERSION};
use rollstat::engine::Engine;
use rollstat::events::{EventKind, NewEvent};
use rollstat::query::{Granularity, SeriesRequest};
use rollstat::rollup::{RunOutcome, RunReport};
use serde::Serialize;
use std::io::Write;
use std::time::Instant;

/// rollstat - activity rollups and time-series queries
#[derive(Parser)]
#[command(name = "rollstat")]
#[command(version = VERSION)]
#[command(
    about = "Rolls activity events into daily/weekly/monthly/yearly buckets",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler until Ctrl-C
    Run,

    /// Aggregate events into daily slots (default: yesterday, UTC)
    Aggregate {
        /// Single day to aggregate
        #[arg(long, conflicts_with_all = ["from", "to"])]
        date: Option<NaiveDate>,

        /// First day of a backfill range
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,

        /// Last day of a backfill range (inclusive)
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
    },

    /// Promote monthly totals into yearly buckets (default: last month)
    Promote {
        /// Month to promote, as YYYY-MM
        #[arg(long)]
        month: Option<YearMonth>,
    },

    /// Delete processed events older than the retention horizon
    Sweep,

    /// Record one activity event
    Emit {
        #[arg(long)]
        entity: String,

        /// sale, view, quotation_sent, quotation_accepted, quotation_rejected,
        /// quotation_in_progress
        #[arg(long)]
        kind: String,

        /// Sale amount in minor units
        #[arg(long, default_value_t = 0)]
        amount: i64,

        /// Sale profit in minor units
        #[arg(long, default_value_t = 0)]
        profit: i64,

        /// Occurrence time (RFC 3339, default: now)
        #[arg(long)]
        at: Option<DateTime<Utc>>,

        #[arg(long)]
        actor: Option<String>,
    },

    /// Print a time series as JSON
    Query {
        #[arg(long)]
        from: NaiveDate,

        #[arg(long)]
        to: NaiveDate,

        /// day, week, month or year
        #[arg(long, default_value = "day")]
        granularity: Granularity,

        /// e.g. amount, count, views, popularity
        #[arg(long)]
        metric: String,

        /// Limit to these entities (repeatable; default: all)
        #[arg(long = "entity")]
        entities: Vec<String>,
    },

    /// Check bucket totals against their slots
    Verify,

    /// Show event and bucket counts
    Status,

    /// Manage configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Reset config file to defaults
        #[arg(long)]
        reset: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

/// Print a job outcome; a failed run becomes the command's error
fn report_outcome(
    result: rollstat::error::Result<RunReport>,
    started: Instant,
) -> anyhow::Result<()> {
    print_json(&RunOutcome::from_result(&result, started))?;
    result.map(|_| ()).map_err(Into::into)
}

fn parse_kind(kind: &str, amount: i64, profit: i64) -> anyhow::Result<EventKind> {
    if kind == "sale" {
        return Ok(EventKind::Sale { amount, profit });
    }
    EventKind::decode(kind, "{}").map_err(|e| anyhow::anyhow!(e))
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine commands
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_run(config: &Config) -> anyhow::Result<()> {
    if !config.scheduler.enabled {
        tracing::warn!("Scheduler disabled ([scheduler] enabled = false), nothing to run");
        return Ok(());
    }

    let engine = Engine::open(config)?;
    let scheduler = engine.scheduler(config.scheduler.schedules());
    scheduler.start();
    tracing::info!(db = %config.db_path.display(), "rollstat running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("Shutdown requested");
    scheduler.stop().await;

    let metrics = scheduler.metrics();
    tracing::info!(
        aggregate_runs = metrics.aggregate.succeeded,
        promote_runs = metrics.promote.succeeded,
        sweep_runs = metrics.sweep.succeeded,
        failures = metrics.aggregate.failed + metrics.promote.failed + metrics.sweep.failed,
        "Scheduler summary"
    );
    Ok(())
}

/// Dispatch a subcommand against the loaded configuration
pub async fn dispatch(command: Commands, config: &Config) -> anyhow::Result<()> {
    let started = Instant::now();
    match command {
        Commands::Run => handle_run(config).await,
        Commands::Config { show, reset, path } => handle_config(show, reset, path),
        Commands::Aggregate { date, from, to } => {
            let engine = Engine::open(config)?;
            let result = match (from, to) {
                (Some(from), Some(to)) => {
                    anyhow::ensure!(from <= to, "--from {} is after --to {}", from, to);
                    engine.run_backfill(from, to)
                }
                _ => engine.run_aggregation(date.unwrap_or_else(|| yesterday(Utc::now()))),
            };
            report_outcome(result, started)
        }
        Commands::Promote { month } => {
            let engine = Engine::open(config)?;
            let month = month.unwrap_or_else(|| last_month(Utc::now()));
            report_outcome(engine.run_promotion(month.first_day()), started)
        }
        Commands::Sweep => {
            let engine = Engine::open(config)?;
            report_outcome(engine.run_retention_sweep(), started)
        }
        Commands::Emit {
            entity,
            kind,
            amount,
            profit,
            at,
            actor,
        } => {
            let engine = Engine::open(config)?;
            let mut event = NewEvent::new(
                entity,
                parse_kind(&kind, amount, profit)?,
                at.unwrap_or_else(Utc::now),
            );
            if let Some(actor) = actor {
                event = event.with_actor(actor);
            }
            let id = engine.emit_event(&event)?;
            print_json(&serde_json::json!({ "id": id }))
        }
        Commands::Query {
            from,
            to,
            granularity,
            metric,
            entities,
        } => {
            let engine = Engine::open(config)?;
            let series = engine.query_time_series(&SeriesRequest {
                entity_ids: entities,
                owner: None,
                from,
                to,
                granularity,
                metric,
            })?;
            print_json(&series)
        }
        Commands::Verify => {
            let engine = Engine::open(config)?;
            let report = engine.verify()?;
            print_json(&report)?;
            anyhow::ensure!(
                report.is_consistent(),
                "{} bucket consistency violation(s)",
                report.violations.len()
            );
            Ok(())
        }
        Commands::Status => {
            let engine = Engine::open(config)?;
            print_json(&engine.status()?)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config command
// ─────────────────────────────────────────────────────────────────────────────

/// Handle `config`; runs before the config file is loaded so a broken file
/// can still be located and reset
pub fn handle_config(show: bool, reset: bool, path: bool) -> anyhow::Result<()> {
    if path {
        handle_config_path()
    } else if show {
        handle_config_show()
    } else if reset {
        handle_config_reset()
    } else {
        println!("Usage: rollstat config [--show|--reset|--path]");
        println!();
        println!("Options:");
        println!("  --show    Display effective configuration");
        println!("  --reset   Reset config file to defaults");
        println!("  --path    Show config file path");
        Ok(())
    }
}

fn handle_config_path() -> anyhow::Result<()> {
    let path = Config::config_path().context("could not determine config path")?;
    println!("{}", path.display());
    Ok(())
}

fn handle_config_show() -> anyhow::Result<()> {
    let config = Config::load()?;

    println!("# Effective configuration (env > file > defaults)");
    println!();
    print!("{}", config.to_toml());

    println!();
    if let Some(path) = Config::config_path() {
        if path.exists() {
            println!("# Source: {}", path.display());
        } else {
            println!("# Source: defaults (no config file)");
        }
    }
    Ok(())
}

fn handle_config_reset() -> anyhow::Result<()> {
    let path = Config::config_path().context("could not determine config path")?;

    // Confirm if file exists
    if path.exists() {
        eprint!(
            "Config file exists at {}. Overwrite? [y/N] ",
            path.display()
        );
        std::io::stderr().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    Config::write_default(&path)?;
    println!("Config reset to defaults: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_aggregate_range_requires_both_ends() {
        assert!(Cli::try_parse_from(["rollstat", "aggregate", "--from", "2024-03-01"]).is_err());
        assert!(Cli::try_parse_from([
            "rollstat",
            "aggregate",
            "--date",
            "2024-03-01",
            "--from",
            "2024-03-01",
            "--to",
            "2024-03-02"
        ])
        .is_err());

        let cli = Cli::try_parse_from([
            "rollstat",
            "aggregate",
            "--from",
            "2024-03-01",
            "--to",
            "2024-03-31",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Aggregate { from: Some(_), to: Some(_), date: None })
        ));
    }

    #[test]
    fn test_query_parses_granularity_and_entities() {
        let cli = Cli::try_parse_from([
            "rollstat",
            "query",
            "--from",
            "2024-01-01",
            "--to",
            "2024-01-31",
            "--granularity",
            "week",
            "--metric",
            "views",
            "--entity",
            "p-1",
            "--entity",
            "p-2",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Query {
                granularity,
                entities,
                ..
            }) => {
                assert_eq!(granularity, Granularity::Week);
                assert_eq!(entities, vec!["p-1", "p-2"]);
            }
            _ => panic!("expected query"),
        }
    }

    #[test]
    fn test_promote_month_parses() {
        let cli = Cli::try_parse_from(["rollstat", "promote", "--month", "2024-02"]).unwrap();
        match cli.command {
            Some(Commands::Promote { month }) => {
                assert_eq!(month, YearMonth::new(2024, 2));
            }
            _ => panic!("expected promote"),
        }
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!(
            parse_kind("sale", 500, 120).unwrap(),
            EventKind::Sale {
                amount: 500,
                profit: 120
            }
        );
        assert_eq!(
            parse_kind("quotation_accepted", 0, 0).unwrap(),
            EventKind::QuotationAccepted
        );
        assert!(parse_kind("refund", 0, 0).is_err());
    }
}
