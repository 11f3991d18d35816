//! Interception layer.
//!
//! Receives DNS datagrams from clients, runs each one through the pipeline
//! as its own task and carries out the pipeline's decision.

pub mod udp;

use std::time::Duration;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

/// How long a forwarded query waits for the upstream answer.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);
