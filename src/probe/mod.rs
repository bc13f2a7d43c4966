//! Probe building blocks.
//!
//! DNS wire codec, local/remote endpoint resolution and the conntrack
//! flush invoker used by the probe loop.

pub mod conntrack;
pub mod dns;
pub mod resolver;

pub use conntrack::{ConntrackFlusher, FlowFlusher};
pub use dns::{decode_reply, encode_query};
pub use resolver::{resolve_local_endpoint, resolve_remote_endpoint};

use std::time::Duration;
use thiserror::Error;

/// Probe error types.
///
/// `Config`, `Lookup` and `Bind` are fatal at startup. Everything else is
/// handled inside a single probe cycle.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("source address lookup failed: {0}")]
    Lookup(String),
    #[error("failed to bind socket: {0}")]
    Bind(String),
    #[error("failed to encode query: {0}")]
    Encode(String),
    #[error("failed to decode reply: {0}")]
    Decode(String),
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("command failed: {0}")]
    Exec(String),
}
