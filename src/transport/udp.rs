//! UDP transport for DNS queries.
//!
//! Every client datagram becomes one flow handled on its own task. Allowed
//! queries are forwarded from a fresh socket connected to the upstream, so
//! the response lands on the task that owns the flow without a shared
//! pending-query table. Flow tasks belong to the receive loop and are
//! aborted with it.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::UdpSocket;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::error::ActivationError;
use crate::pipeline::{Evaluation, FlowContext, MonitorContext, RawPacket, TrafficDecision};
use crate::record::Direction;

use super::{MAX_DNS_PACKET_SIZE, UPSTREAM_TIMEOUT};

/// UDP transport for the monitor.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind the client-facing socket.
    pub async fn bind(addr: SocketAddr) -> Result<Self, ActivationError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ActivationError::Bind { addr, source })?;

        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Start the receive loop. Aborting the returned handle stops the transport
    /// and every flow it started.
    pub fn start(self, upstream: SocketAddr, context: Arc<MonitorContext>) -> JoinHandle<()> {
        tokio::spawn(run(self.socket, upstream, context))
    }
}

async fn run(socket: Arc<UdpSocket>, upstream: SocketAddr, context: Arc<MonitorContext>) {
    let next_flow = AtomicU64::new(1);
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
    let mut flows = JoinSet::new();

    loop {
        let (len, client) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "UDP recv error");
                continue;
            }
        };

        let packet = RawPacket {
            bytes: buf[..len].to_vec(),
            direction: Direction::Query,
            flow: FlowContext {
                id: next_flow.fetch_add(1, Ordering::Relaxed),
                pid: None,
                client: Some(client),
            },
        };

        while flows.try_join_next().is_some() {}
        flows.spawn(handle_flow(socket.clone(), upstream, context.clone(), packet));
    }
}

/// Carry one flow from query to (optional) response.
async fn handle_flow(
    socket: Arc<UdpSocket>,
    upstream: SocketAddr,
    context: Arc<MonitorContext>,
    query: RawPacket,
) {
    let Some(client) = query.flow.client else {
        return;
    };

    let Evaluation { decision, draft } = context.evaluate(&query);
    let owner = context.spawn_record(draft);

    match decision {
        TrafficDecision::Respond(answer) => {
            if let Err(e) = socket.send_to(&answer, client).await {
                warn!(error = %e, %client, "UDP response error");
            }
        }
        TrafficDecision::Drop => {
            debug!(flow = query.flow.id, "dropped blocked query");
        }
        TrafficDecision::Forward => {
            let response = match forward_to_upstream(&query.bytes, upstream).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(flow = query.flow.id, error = %e, "upstream exchange failed");
                    return;
                }
            };

            let response = RawPacket {
                bytes: response,
                direction: Direction::Response,
                flow: query.flow,
            };
            // Responses are never blocked; the decision is always to relay.
            let mut draft = context.evaluate(&response).draft;
            if let Err(e) = socket.send_to(&response.bytes, client).await {
                warn!(error = %e, %client, "UDP response error");
            }

            // The query's lookup already found the owner; the response reuses it.
            draft.attribute(owner.await.ok().flatten());
            context.spawn_record(draft);
        }
    }
}

/// Send a query upstream and wait for the datagram that answers it.
///
/// Datagrams whose transaction id does not match the query are ignored.
/// Queries too short to carry an id take the first datagram back.
async fn forward_to_upstream(query: &[u8], upstream: SocketAddr) -> io::Result<Vec<u8>> {
    let local: SocketAddr = match upstream {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(upstream).await?;
    socket.send(query).await?;

    let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
    let exchange = async {
        loop {
            let len = socket.recv(&mut buf).await?;
            if query.len() < 2 || (len >= 2 && buf[..2] == query[..2]) {
                return io::Result::Ok(len);
            }
        }
    };
    let len = tokio::time::timeout(UPSTREAM_TIMEOUT, exchange)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream did not answer"))??;

    buf.truncate(len);
    Ok(buf)
}
