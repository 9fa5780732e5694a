//! An authenticated, framed packet stream to one peer.
//!
//! A session wraps a QUIC connection plus one bidirectional stream. The
//! remote identity comes from the TLS handshake, not from anything the peer
//! claims in-band: `id()` is the SHA-1 digest of the public key in the
//! peer's certificate, and every inbound packet's source digest must match
//! it. Frames are a 4-byte big-endian length followed by a msgpack packet.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use quinn::{ClientConfig, Connection, Endpoint};
use tokio::sync::Mutex;
use tracing::warn;

use crate::crypto::{digest_to_sni, verified_peer_digest};
use crate::identity::Digest;
use crate::messages::{self, Packet, MAX_FRAME_SIZE};

pub struct Session {
    conn: Connection,
    remote: Digest,
    tx: Mutex<quinn::SendStream>,
    rx: Mutex<quinn::RecvStream>,
}

impl Session {
    /// Dial a peer whose digest is already known from routing. The TLS
    /// verifier pins the server certificate to the digest carried in the
    /// SNI, so an established connection is already authenticated.
    pub async fn connect(
        endpoint: &Endpoint,
        client_config: ClientConfig,
        addr: SocketAddr,
        expected: Digest,
    ) -> Result<Self> {
        let conn = endpoint
            .connect_with(client_config, addr, &digest_to_sni(&expected))
            .with_context(|| format!("failed to initiate connection to {addr}"))?
            .await
            .with_context(|| format!("failed to establish connection to {addr}"))?;
        let remote =
            verified_peer_digest(&conn).context("peer presented no usable certificate")?;
        if remote != expected {
            conn.close(0u32.into(), b"identity mismatch");
            anyhow::bail!("peer identity {remote} does not match dialed identity {expected}");
        }
        let (tx, rx) = conn.open_bi().await.context("failed to open session stream")?;
        Ok(Self {
            conn,
            remote,
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
        })
    }

    /// Adopt an inbound connection. Client certificates are mandatory, so
    /// the remote digest is always recoverable here. Blocks until the dialer
    /// opens its stream.
    pub async fn accept(conn: Connection) -> Result<Self> {
        let remote =
            verified_peer_digest(&conn).context("peer presented no usable certificate")?;
        let (tx, rx) = conn
            .accept_bi()
            .await
            .context("peer closed before opening session stream")?;
        Ok(Self {
            conn,
            remote,
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
        })
    }

    /// The authenticated remote digest.
    pub fn id(&self) -> Digest {
        self.remote
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    pub async fn write(&self, packet: &Packet) -> Result<()> {
        let bytes = messages::encode(packet)?;
        if bytes.len() > MAX_FRAME_SIZE {
            anyhow::bail!("packet of {} bytes exceeds frame limit", bytes.len());
        }
        let mut tx = self.tx.lock().await;
        tx.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
        tx.write_all(&bytes).await?;
        Ok(())
    }

    /// The next well-formed inbound packet. Malformed frames and packets
    /// whose source does not match the authenticated identity are logged and
    /// skipped; only transport errors end the stream.
    pub async fn read(&self) -> Result<Packet> {
        let mut rx = self.rx.lock().await;
        loop {
            let mut len_buf = [0u8; 4];
            rx.read_exact(&mut len_buf)
                .await
                .context("session stream closed")?;
            let len = u32::from_be_bytes(len_buf) as usize;
            if len > MAX_FRAME_SIZE {
                anyhow::bail!("peer sent oversized frame of {len} bytes");
            }
            let mut frame = vec![0u8; len];
            rx.read_exact(&mut frame)
                .await
                .context("session stream closed mid-frame")?;

            let packet: Packet = match messages::decode_bounded(&frame) {
                Ok(p) => p,
                Err(e) => {
                    warn!(peer = %self.remote, error = %e, "dropping undecodable packet");
                    continue;
                }
            };
            if packet.src.digest != self.remote {
                warn!(
                    peer = %self.remote,
                    claimed = %packet.src,
                    "dropping packet with forged source"
                );
                continue;
            }
            return Ok(packet);
        }
    }

    pub fn close(&self) {
        self.conn.close(0u32.into(), b"session closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("remote", &self.remote)
            .field("addr", &self.conn.remote_address())
            .finish()
    }
}
