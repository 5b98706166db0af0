//! `watch-payment`: follow a contribution on a running service until it
//! settles.
//!
//! Exit status: 0 completed, 1 failed, 2 gave up waiting, 130 interrupted.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use payments::contribution::{ContributionStatus, StatusSnapshot};
use payments::poller::{watch_status, HttpStatusSource, PollerConfig, StatusObserver, WatchOutcome};
use reqwest::Client;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Contribution id returned by `initiate-payment`
    contribution_id: String,

    /// Base URL of the payments service
    #[arg(long, env = "PAYMENTS_URL", default_value = "http://localhost:3001")]
    url: String,

    /// Seconds between status reads
    #[arg(long, default_value_t = 3)]
    interval: u64,

    /// Reads before giving up
    #[arg(long, default_value_t = 60)]
    max_attempts: u32,
}

struct PrintObserver;

impl StatusObserver for PrintObserver {
    fn on_update(&self, snapshot: &StatusSnapshot) {
        println!("{}: {}", snapshot.id, snapshot.status);
    }

    fn on_terminal(&self, snapshot: &StatusSnapshot) {
        println!(
            "{}: {} ({} from {})",
            snapshot.id, snapshot.status, snapshot.amount, snapshot.contributor_name
        );
    }

    fn on_timeout(&self, attempts: u32, last: Option<&StatusSnapshot>) {
        let last = last.map_or("unknown".to_string(), |s| s.status.to_string());
        eprintln!("No final status after {attempts} reads (last seen: {last})");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
    let source = Arc::new(HttpStatusSource::new(client, cli.url));
    let config = PollerConfig {
        interval: Duration::from_secs(cli.interval.max(1)),
        max_attempts: cli.max_attempts,
    };

    let handle = watch_status(source, cli.contribution_id, config, Arc::new(PrintObserver));

    // Dropping the handle on Ctrl-C cancels the watch.
    let outcome = tokio::select! {
        outcome = handle.outcome() => outcome,
        _ = tokio::signal::ctrl_c() => WatchOutcome::Cancelled,
    };

    let code = match outcome {
        WatchOutcome::Terminal(s) if s.status == ContributionStatus::Completed => 0,
        WatchOutcome::Terminal(_) => 1,
        WatchOutcome::TimedOut { .. } => 2,
        WatchOutcome::Cancelled => 130,
    };
    Ok(ExitCode::from(code))
}
