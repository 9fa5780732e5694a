//! # Shared-Socket Transport
//!
//! One UDP socket serves both traffic planes:
//!
//! ```text
//! ┌───────────┐        DGRM-prefixed         ┌─────────────┐
//! │ SplitSock │ ───────────────────────────► │  DHT plane  │
//! └─────┬─────┘         datagrams            └─────────────┘
//!       │
//!       ▼ everything else
//! QUIC endpoint (sessions)
//! ```
//!
//! [`SplitSock`] implements quinn's `AsyncUdpSocket`. Inbound datagrams that
//! start with the 4-byte [`DGRAM_MAGIC`] are peeled off inside `poll_recv`
//! and handed to a channel the router drains into the DHTs; all other
//! datagrams flow to the QUIC state machine unchanged. Outbound DHT frames
//! go through [`SplitSock::send_dgram`], which attaches the prefix.
//!
//! Because both planes share one socket, the `host:port` a peer observes in
//! DHT traffic is the same address its QUIC dial must target.

use std::io::{self, IoSliceMut};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, UdpPoller};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::PortRange;

/// Discriminator prefix marking a DHT datagram on the shared socket.
pub const DGRAM_MAGIC: [u8; 4] = *b"DGRM";

/// Capacity of the inbound datagram channel. Overflow drops datagrams, which
/// UDP semantics already permit.
pub const DGRAM_CHANNEL_CAPACITY: usize = 100;

/// An inbound DHT datagram: payload with the prefix stripped, plus origin.
pub type Datagram = (Vec<u8>, SocketAddr);

pub struct SplitSock {
    inner: Arc<tokio::net::UdpSocket>,
    dgram_tx: mpsc::Sender<Datagram>,
    local_addr: SocketAddr,
}

impl SplitSock {
    /// Bind the first free port of the range on all interfaces.
    pub async fn bind_in_range(ports: &PortRange) -> anyhow::Result<(Self, mpsc::Receiver<Datagram>)> {
        for port in ports.iter() {
            match tokio::net::UdpSocket::bind(("0.0.0.0", port)).await {
                Ok(socket) => {
                    let local_addr = socket.local_addr()?;
                    let (dgram_tx, dgram_rx) = mpsc::channel(DGRAM_CHANNEL_CAPACITY);
                    debug!(addr = %local_addr, "transport socket bound");
                    return Ok((
                        Self {
                            inner: Arc::new(socket),
                            dgram_tx,
                            local_addr,
                        },
                        dgram_rx,
                    ));
                }
                Err(e) => {
                    debug!(port = port, error = %e, "port unavailable");
                }
            }
        }
        anyhow::bail!("no free port in range {}", ports)
    }

    /// Wrap the socket into a QUIC endpoint. The endpoint drives `poll_recv`,
    /// which is what pumps the datagram channel; nothing is received on
    /// either plane until this has been called.
    pub fn into_endpoint(
        self,
        server_config: Option<quinn::ServerConfig>,
    ) -> io::Result<(quinn::Endpoint, Arc<Self>)> {
        let sock = Arc::new(self);
        let runtime = quinn::default_runtime()
            .ok_or_else(|| io::Error::other("no async runtime found"))?;
        let endpoint = quinn::Endpoint::new_with_abstract_socket(
            quinn::EndpointConfig::default(),
            server_config,
            sock.clone(),
            runtime,
        )?;
        Ok((endpoint, sock))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send one DHT frame, prefix attached.
    pub async fn send_dgram(&self, payload: &[u8], dest: SocketAddr) -> io::Result<()> {
        let mut frame = Vec::with_capacity(DGRAM_MAGIC.len() + payload.len());
        frame.extend_from_slice(&DGRAM_MAGIC);
        frame.extend_from_slice(payload);
        self.inner.send_to(&frame, dest).await.map(|_| ())
    }
}

impl std::fmt::Debug for SplitSock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitSock")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

struct SplitSockPoller {
    inner: Arc<tokio::net::UdpSocket>,
}

impl std::fmt::Debug for SplitSockPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitSockPoller").finish_non_exhaustive()
    }
}

impl UdpPoller for SplitSockPoller {
    fn poll_writable(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        self.inner.poll_send_ready(cx)
    }
}

impl AsyncUdpSocket for SplitSock {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        Box::pin(SplitSockPoller {
            inner: self.inner.clone(),
        })
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        self.inner
            .try_send_to(transmit.contents, transmit.destination)
            .map(|_| ())
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        debug_assert!(!bufs.is_empty() && !meta.is_empty());

        let mut buf = [0u8; 65535];
        let mut read_buf = tokio::io::ReadBuf::new(&mut buf);

        match self.inner.poll_recv_from(cx, &mut read_buf) {
            Poll::Ready(Ok(src_addr)) => {
                let received = read_buf.filled();

                if received.len() >= DGRAM_MAGIC.len() && received[..4] == DGRAM_MAGIC {
                    let payload = received[DGRAM_MAGIC.len()..].to_vec();
                    if self.dgram_tx.try_send((payload, src_addr)).is_err() {
                        warn!(src = %src_addr, "datagram channel full, dropping DHT frame");
                    }
                    // Handled outside QUIC; ask to be polled again.
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }

                let copy_len = received.len().min(bufs[0].len());
                bufs[0][..copy_len].copy_from_slice(&received[..copy_len]);
                meta[0] = RecvMeta {
                    addr: src_addr,
                    len: copy_len,
                    stride: copy_len,
                    ecn: None,
                    dst_ip: None,
                };
                Poll::Ready(Ok(1))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn max_transmit_segments(&self) -> usize {
        1
    }

    fn max_receive_segments(&self) -> usize {
        1
    }

    fn may_fragment(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::time::Duration;

    static PORT_COUNTER: AtomicU16 = AtomicU16::new(42100);

    fn test_range() -> PortRange {
        let start = PORT_COUNTER.fetch_add(4, Ordering::SeqCst);
        PortRange {
            start,
            end: start + 3,
        }
    }

    #[tokio::test]
    async fn binds_distinct_ports_from_the_range() {
        let range = test_range();
        let (a, _rx_a) = SplitSock::bind_in_range(&range).await.unwrap();
        let (b, _rx_b) = SplitSock::bind_in_range(&range).await.unwrap();

        for sock in [&a, &b] {
            let port = sock.local_addr().port();
            assert!((range.start..=range.end).contains(&port));
        }
        assert_ne!(a.local_addr().port(), b.local_addr().port());
    }

    #[tokio::test]
    async fn exhausted_range_reports_bind_failure() {
        let range = test_range();
        let narrow = PortRange::single(range.start);
        let (_held, _rx) = SplitSock::bind_in_range(&narrow).await.unwrap();
        assert!(SplitSock::bind_in_range(&narrow).await.is_err());
    }

    #[tokio::test]
    async fn dgram_frames_bypass_quic() {
        let (a, _rx_a) = SplitSock::bind_in_range(&test_range()).await.unwrap();
        let (b, mut rx_b) = SplitSock::bind_in_range(&test_range()).await.unwrap();
        let b_port = b.local_addr().port();

        // The endpoint drives poll_recv; without it nothing is pumped.
        let (_endpoint, b) = b.into_endpoint(None).unwrap();

        let dest: SocketAddr = format!("127.0.0.1:{}", b_port).parse().unwrap();
        a.send_dgram(b"frame-payload", dest).await.unwrap();

        let (payload, src) = tokio::time::timeout(Duration::from_secs(5), rx_b.recv())
            .await
            .expect("datagram within timeout")
            .expect("channel open");
        assert_eq!(payload, b"frame-payload");
        assert_eq!(src.port(), a.local_addr().port());
        drop(b);
    }
}
