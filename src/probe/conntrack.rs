//! Connection-tracking flush via the `conntrack` utility.
//!
//! Deleting the pre-NAT UDP entry after every probe forces the next query
//! through the NAT rules again instead of riding a cached flow. The
//! `--dst-nat` filter keeps the bad service-VIP entry around, so a missing
//! DNAT rule keeps blackholing traffic and the fault stays reproducible.

use std::net::SocketAddr;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::ProbeError;

/// Default flush utility, looked up on `PATH`.
pub const DEFAULT_CONNTRACK_BIN: &str = "conntrack";

/// Removes the flow-table entry owned by a local UDP endpoint.
#[async_trait]
pub trait FlowFlusher: Send + Sync {
    async fn flush(&self, local: SocketAddr) -> Result<(), ProbeError>;
}

/// Shells out to `conntrack -D`.
#[derive(Debug, Clone)]
pub struct ConntrackFlusher {
    program: String,
}

impl ConntrackFlusher {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl FlowFlusher for ConntrackFlusher {
    async fn flush(&self, local: SocketAddr) -> Result<(), ProbeError> {
        let args = conntrack_args(local);
        tracing::debug!("conntrack cmd: {} {}", self.program, args.join(" "));

        let output = Command::new(&self.program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ProbeError::Exec(format!("failed to execute {}: {}", self.program, e)))?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(ProbeError::Exec(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                combined.trim()
            )));
        }

        Ok(())
    }
}

/// Arguments deleting the UDP entry sourced at `local`, restricted to
/// DNAT'd flows.
pub fn conntrack_args(local: SocketAddr) -> Vec<String> {
    let mut args = vec!["-D".to_string()];
    if local.is_ipv6() {
        args.extend(["-f".to_string(), "ipv6".to_string()]);
    }
    args.extend([
        "-p".to_string(),
        "udp".to_string(),
        "--src".to_string(),
        local.ip().to_string(),
        "--sport".to_string(),
        local.port().to_string(),
        "--dst-nat".to_string(),
    ]);
    args
}
