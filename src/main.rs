//! dnatprobe - DNS-over-UDP NAT blackhole probe
//!
//! Sends a DNS query every interval, waits for the matching reply and then
//! deletes the pre-NAT conntrack entry so the next query is NAT'd afresh.

mod config;
mod probe;
mod scheduler;

use clap::Parser;
use config::{Args, ProbeConfig};
use probe::{ConntrackFlusher, ProbeError};
use scheduler::ProbeLoop;

use tracing_subscriber::filter::Directive;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), ProbeError> {
    init_logging(&args.log_level)?;

    let cfg = ProbeConfig::from_args(&args).await?;
    tracing::info!(
        "Probing {} for {:?} every {:?} (timeout {:?})",
        cfg.remote,
        cfg.name,
        cfg.interval,
        cfg.timeout
    );

    let flusher = ConntrackFlusher::new(&args.conntrack_bin);
    tracing::debug!("Flushing conntrack entries with {}", flusher.program());
    let probe = ProbeLoop::bind(&cfg, flusher)?;
    probe.run().await;

    Ok(())
}

fn init_logging(level: &str) -> Result<(), ProbeError> {
    let directive: Directive = format!("dnatprobe={}", level)
        .parse()
        .map_err(|e| ProbeError::Config(format!("invalid log level {:?}: {}", level, e)))?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .init();

    Ok(())
}
