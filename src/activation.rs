//! Activation and deactivation requests.
//!
//! A running monitor listens on a local control socket. Deactivation is a
//! single datagram request answered with `ok`; anything else is refused.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::ActivationError;

const UNLOAD_REQUEST: &[u8] = b"unload";
const ACK: &[u8] = b"ok";

/// How long [`request_unload`] waits for the monitor to answer.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Control endpoint of a running monitor.
pub struct ControlChannel {
    socket: UdpSocket,
}

impl ControlChannel {
    pub async fn bind(addr: SocketAddr) -> Result<Self, ActivationError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ActivationError::Bind { addr, source })?;

        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Resolve once a deactivation request has been received and acknowledged.
    pub async fn wait_for_unload(&self) -> Result<SocketAddr, ActivationError> {
        let mut buf = [0u8; 64];

        loop {
            let (len, from) = self
                .socket
                .recv_from(&mut buf)
                .await
                .map_err(ActivationError::Control)?;

            if !from.ip().is_loopback() {
                warn!(%from, "ignoring control request from non-local peer");
                continue;
            }

            if buf[..len].trim_ascii() == UNLOAD_REQUEST {
                if let Err(e) = self.socket.send_to(ACK, from).await {
                    warn!(error = %e, %from, "failed to acknowledge unload");
                }
                return Ok(from);
            }

            debug!(%from, "unknown control request");
            let _ = self.socket.send_to(b"unknown request", from).await;
        }
    }
}

/// Ask the monitor listening on `control` to deactivate.
pub async fn request_unload(control: SocketAddr, timeout: Duration) -> Result<(), ActivationError> {
    let local: SocketAddr = match control {
        SocketAddr::V4(_) => (Ipv4Addr::LOCALHOST, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::LOCALHOST, 0).into(),
    };
    let socket = UdpSocket::bind(local).await.map_err(ActivationError::Control)?;
    socket.connect(control).await.map_err(ActivationError::Control)?;
    socket
        .send(UNLOAD_REQUEST)
        .await
        .map_err(ActivationError::Control)?;

    let mut buf = [0u8; 64];
    let len = match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
        Ok(Ok(len)) => len,
        // Nothing listening shows up as a refused connection on the reply.
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
            return Err(ActivationError::Timeout(control));
        }
        Ok(Err(e)) => return Err(ActivationError::Control(e)),
        Err(_) => return Err(ActivationError::Timeout(control)),
    };

    if &buf[..len] == ACK {
        Ok(())
    } else {
        Err(ActivationError::Refused(
            String::from_utf8_lossy(&buf[..len]).into_owned(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unload_request_is_acknowledged() {
        let channel = ControlChannel::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = channel.local_addr().unwrap();

        let (served, requested) = tokio::join!(
            channel.wait_for_unload(),
            request_unload(addr, Duration::from_secs(1))
        );

        assert!(served.is_ok());
        assert!(requested.is_ok());
    }

    #[tokio::test]
    async fn unload_without_monitor_fails() {
        let addr = {
            let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            socket.local_addr().unwrap()
        };

        let err = request_unload(addr, Duration::from_millis(100))
            .await
            .unwrap_err();

        assert!(matches!(err, ActivationError::Timeout(_)));
    }

    #[tokio::test]
    async fn unknown_request_is_refused() {
        let channel = ControlChannel::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = channel.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let serve = tokio::time::timeout(Duration::from_millis(200), channel.wait_for_unload());
        let ask = async {
            client.send_to(b"reload", addr).await.unwrap();
            let mut buf = [0u8; 64];
            let (len, _) = client.recv_from(&mut buf).await.unwrap();
            buf[..len].to_vec()
        };
        let (served, reply) = tokio::join!(serve, ask);

        assert!(served.is_err());
        assert_eq!(reply, b"unknown request");
    }
}
