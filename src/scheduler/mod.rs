//! Probe loop: send a query, wait for one reply, flush the flow entry.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::config::ProbeConfig;
use crate::probe::{decode_reply, encode_query, FlowFlusher, ProbeError};

/// Largest datagram a reply can occupy.
const RECV_BUF_LEN: usize = 65536;

/// How a single probe cycle ended.
#[derive(Debug)]
pub enum CycleOutcome {
    /// Reply carried the ID we just sent.
    Matched {
        id: u16,
        from: SocketAddr,
        rcode: u8,
        answers: u16,
        elapsed: Duration,
    },
    /// A reply arrived but for a different ID. No second read is attempted.
    Mismatched {
        expected: u16,
        received: u16,
        from: SocketAddr,
    },
    TimedOut {
        id: u16,
        error: ProbeError,
    },
    Malformed {
        id: u16,
        from: SocketAddr,
        error: ProbeError,
    },
    ReceiveFailed {
        id: u16,
        error: ProbeError,
    },
    /// Encode or send failed; nothing was waited on or flushed.
    SendFailed {
        id: u16,
        error: ProbeError,
    },
}

impl CycleOutcome {
    /// Whether the flow-table flush runs after this outcome.
    pub fn should_flush(&self) -> bool {
        !matches!(self, CycleOutcome::SendFailed { .. })
    }
}

/// Owns the socket and transaction counter for the lifetime of the process.
pub struct ProbeLoop<F> {
    socket: UdpSocket,
    local: SocketAddr,
    remote: SocketAddr,
    name: String,
    interval: Duration,
    timeout: Duration,
    last_id: u16,
    flusher: F,
    recv_buf: Vec<u8>,
}

impl<F: FlowFlusher> ProbeLoop<F> {
    /// Bind the local endpoint. Failure here is fatal.
    pub fn bind(config: &ProbeConfig, flusher: F) -> Result<Self, ProbeError> {
        let socket = bind_udp(config.local)?;
        let local = socket
            .local_addr()
            .map_err(|e| ProbeError::Bind(format!("failed to read local address: {}", e)))?;

        Ok(Self {
            socket,
            local,
            remote: config.remote,
            name: config.name.clone(),
            interval: config.interval,
            timeout: config.timeout,
            last_id: 0,
            flusher,
            recv_buf: vec![0u8; RECV_BUF_LEN],
        })
    }

    /// Actual bound address, with the OS-assigned port filled in.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Run cycles until the process is killed.
    pub async fn run(mut self) {
        tracing::info!("Created UDP socket with local addr {}", self.local);

        loop {
            tokio::time::sleep(self.interval).await;
            let outcome = self.run_cycle().await;
            log_outcome(&outcome);
        }
    }

    /// Advance the transaction counter, wrapping from 65535 to 0.
    fn next_id(&mut self) -> u16 {
        self.last_id = self.last_id.wrapping_add(1);
        self.last_id
    }

    /// Run one send/wait/flush cycle. Never fails; every error becomes an outcome.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let id = self.next_id();

        tracing::info!(
            "Sending DNS query for {:?} with id {} to {}",
            self.name,
            id,
            self.remote
        );
        if let Err(error) = self.send_query(id).await {
            return CycleOutcome::SendFailed { id, error };
        }

        let outcome = self.wait_for_reply(id).await;

        if outcome.should_flush() {
            tracing::info!("Deleting UDP conntrack from src {}", self.local);
            if let Err(e) = self.flusher.flush(self.local).await {
                tracing::warn!("Error deleting conntrack: {}", e);
            }
        }

        outcome
    }

    async fn send_query(&self, id: u16) -> Result<(), ProbeError> {
        let packet = encode_query(&self.name, id)?;
        self.socket
            .send_to(&packet, self.remote)
            .await
            .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))?;
        Ok(())
    }

    /// Read at most one datagram before the deadline.
    async fn wait_for_reply(&mut self, id: u16) -> CycleOutcome {
        let start = Instant::now();
        let received =
            tokio::time::timeout(self.timeout, self.socket.recv_from(&mut self.recv_buf)).await;

        let (n, from) = match received {
            Err(_) => {
                return CycleOutcome::TimedOut {
                    id,
                    error: ProbeError::Timeout(self.timeout),
                }
            }
            Ok(Err(e)) => {
                return CycleOutcome::ReceiveFailed {
                    id,
                    error: ProbeError::Network(format!("failed to recv: {}", e)),
                }
            }
            Ok(Ok(r)) => r,
        };
        let elapsed = start.elapsed();

        match decode_reply(&self.recv_buf[..n]) {
            Err(error) => CycleOutcome::Malformed { id, from, error },
            Ok(header) => {
                tracing::info!(
                    "Received msg from {} with ID {}, expected {}",
                    from,
                    header.id,
                    id
                );
                if !header.is_response() {
                    tracing::debug!("Reply from {} does not have the QR bit set", from);
                }
                if header.id == id {
                    CycleOutcome::Matched {
                        id,
                        from,
                        rcode: header.rcode(),
                        answers: header.answer_count,
                        elapsed,
                    }
                } else {
                    CycleOutcome::Mismatched {
                        expected: id,
                        received: header.id,
                        from,
                    }
                }
            }
        }
    }
}

/// Single sink for cycle outcomes.
pub fn log_outcome(outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Matched {
            id,
            from,
            rcode,
            answers,
            elapsed,
        } => tracing::info!(
            id,
            rcode,
            answers,
            elapsed_ms = elapsed.as_millis() as u64,
            "Matched DNS reply from {}",
            from
        ),
        CycleOutcome::Mismatched {
            expected,
            received,
            from,
        } => tracing::warn!(
            expected,
            received,
            "Transaction ID mismatch in reply from {}",
            from
        ),
        CycleOutcome::TimedOut { id, error } => {
            tracing::warn!(id, "Error receiving DNS resp: {}", error)
        }
        CycleOutcome::Malformed { id, from, error } => {
            tracing::warn!(id, "Malformed reply from {}: {}", from, error)
        }
        CycleOutcome::ReceiveFailed { id, error } => {
            tracing::warn!(id, "Error receiving DNS resp: {}", error)
        }
        CycleOutcome::SendFailed { id, error } => {
            tracing::error!(id, "Error sending DNS query: {}", error)
        }
    }
}

/// Create a UDP socket bound to `local` and hand it to tokio.
fn bind_udp(local: SocketAddr) -> Result<UdpSocket, ProbeError> {
    let domain = if local.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| ProbeError::Bind(format!("failed to create socket: {}", e)))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| ProbeError::Bind(format!("failed to set nonblocking: {}", e)))?;
    socket
        .bind(&local.into())
        .map_err(|e| ProbeError::Bind(format!("{}: {}", local, e)))?;

    UdpSocket::from_std(socket.into()).map_err(|e| ProbeError::Bind(e.to_string()))
}
