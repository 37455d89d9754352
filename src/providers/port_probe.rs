//! TCP connect probing for well-known proxy and Tor ports.

use super::PortProber;
use async_trait::async_trait;
use futures::future::join_all;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Probes ports concurrently, each with its own connect timeout.
pub struct TcpPortProber {
    timeout: Duration,
}

impl TcpPortProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl PortProber for TcpPortProber {
    async fn probe(&self, ip: &IpAddr, ports: &[u16]) -> Vec<u16> {
        let attempts = ports.iter().map(|&port| {
            let addr = SocketAddr::new(*ip, port);
            async move {
                match timeout(self.timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(_stream)) => Some(port),
                    _ => None,
                }
            }
        });

        let open: Vec<u16> = join_all(attempts).await.into_iter().flatten().collect();
        debug!(ip = %ip, open = ?open, "Port probe complete");
        open
    }
}
