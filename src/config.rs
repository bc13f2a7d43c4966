//! Configuration module for dnatprobe.
//!
//! Flags are read from the command line, falling back to `DNATPROBE_*`
//! environment variables. Everything is fixed once the loop starts.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::probe::conntrack::DEFAULT_CONNTRACK_BIN;
use crate::probe::{resolve_local_endpoint, resolve_remote_endpoint, ProbeError};

/// Default receive deadline for a single probe.
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Parser, Debug, Clone)]
#[command(name = "dnatprobe")]
#[command(about = "Repeatedly probe a DNS server over UDP and flush its conntrack entry", long_about = None)]
pub struct Args {
    /// Source IP address and port for the DNS client. Inferred from interfaces if empty.
    #[arg(short = 's', long = "src", env = "DNATPROBE_SRC", default_value = "")]
    pub src: String,

    /// Destination IP address (or host) and port of the DNS server.
    #[arg(short = 'd', long = "dst", env = "DNATPROBE_DST", default_value = "")]
    pub dst: String,

    /// DNS domain to query for, must end in '.'.
    #[arg(short = 'n', long = "name", env = "DNATPROBE_NAME", default_value = "example.com.")]
    pub name: String,

    /// Seconds to wait between DNS queries.
    #[arg(short = 'i', long = "interval", env = "DNATPROBE_INTERVAL", default_value_t = 1)]
    pub interval: u64,

    /// Seconds to wait for a reply before giving up on a query.
    #[arg(long = "timeout", env = "DNATPROBE_TIMEOUT", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout: u64,

    /// conntrack binary used to flush flow entries.
    #[arg(long = "conntrack-bin", env = "DNATPROBE_CONNTRACK_BIN", default_value = DEFAULT_CONNTRACK_BIN)]
    pub conntrack_bin: String,

    /// Default log level when RUST_LOG is unset.
    #[arg(long = "log-level", env = "DNATPROBE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Resolved probe parameters.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Endpoint to bind; port 0 lets the OS choose.
    pub local: SocketAddr,
    /// DNS server to query.
    pub remote: SocketAddr,
    pub name: String,
    pub interval: Duration,
    pub timeout: Duration,
}

impl ProbeConfig {
    /// Resolve source and destination endpoints from parsed flags.
    ///
    /// Any failure here is fatal.
    pub async fn from_args(args: &Args) -> Result<Self, ProbeError> {
        if args.timeout == 0 {
            return Err(ProbeError::Config("timeout must be at least 1 second".to_string()));
        }

        if args.dst.trim().is_empty() {
            return Err(ProbeError::Config("destination address is required".to_string()));
        }

        let local = resolve_local_endpoint(Some(args.src.as_str()))?;
        let remote = resolve_remote_endpoint(&args.dst, local).await?;

        Ok(Self {
            local,
            remote,
            name: args.name.clone(),
            interval: Duration::from_secs(args.interval),
            timeout: Duration::from_secs(args.timeout),
        })
    }
}
