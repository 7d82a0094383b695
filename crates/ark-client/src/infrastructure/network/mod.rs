//! Encrypted request/response channel to the remote service.
//!
//! # One exchange (for beginners)
//!
//! ```text
//!  client                                       service
//!  ──────                                       ───────
//!  connect ───────────────────────────────────►
//!  "ARKS" 01 <len> <token(json request)>  ────►
//!         ◄──── "ARKS" 01 <len> <token(json response)>
//!  close
//! ```
//!
//! Every request opens a fresh TCP connection, writes one frame, reads one
//! frame, and closes.  The request JSON is `{endpoint, data, timestamp}`; the
//! token is produced by [`TokenCipher`] from the shared passphrase.
//!
//! The whole exchange (connect, write, and both reads) runs under a single
//! deadline.  [`SecureChannel::exchange`] never returns an error: transport,
//! framing, and decryption failures are logged and surface as `None`.

use std::time::Duration;

use ark_core::protocol::frame::HEADER_SIZE;
use ark_core::{encode_frame, CipherError, FrameError, FrameHeader, RequestEnvelope, TokenCipher};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, warn};

use crate::application::automate::RequestExchanger;

/// Largest response body accepted (64 MiB).
pub const MAX_RESPONSE_LEN: usize = 64 * 1024 * 1024;

/// Errors produced by a single exchange.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The exchange did not finish within the configured timeout.
    #[error("exchange timed out after {0:?}")]
    Timeout(Duration),

    /// The service closed the connection before a full frame arrived.
    #[error("connection closed after {received} of {expected} bytes")]
    PrematureClose { expected: usize, received: usize },

    #[error("response frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("decryption failed: {0}")]
    Cipher(#[from] CipherError),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// The encrypted, length-framed channel to the remote service.
#[derive(Clone)]
pub struct SecureChannel {
    addr: String,
    cipher: TokenCipher,
    timeout: Duration,
}

impl SecureChannel {
    /// Derives the channel key from `passphrase`.
    pub fn new(host: &str, port: u16, passphrase: &str, timeout: Duration) -> Self {
        Self::with_cipher(host, port, TokenCipher::from_passphrase(passphrase), timeout)
    }

    /// Uses an already derived cipher.
    pub fn with_cipher(host: &str, port: u16, cipher: TokenCipher, timeout: Duration) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            cipher,
            timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Performs one exchange, reporting failures as errors.
    pub async fn try_exchange(&self, endpoint: &str, data: Value) -> Result<Value, ChannelError> {
        let request = serde_json::to_vec(&RequestEnvelope::new(endpoint, data))?;
        let frame = encode_frame(&self.cipher.encrypt(&request))?;

        match time::timeout(self.timeout, self.round_trip(&frame)).await {
            Ok(result) => {
                let body = result?;
                let plaintext = self.cipher.decrypt(&body)?;
                Ok(serde_json::from_slice(&plaintext)?)
            }
            Err(_) => Err(ChannelError::Timeout(self.timeout)),
        }
    }

    async fn round_trip(&self, frame: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let mut stream =
            TcpStream::connect(&self.addr)
                .await
                .map_err(|source| ChannelError::Connect {
                    addr: self.addr.clone(),
                    source,
                })?;
        stream.write_all(frame).await?;
        stream.flush().await?;

        let mut header = [0u8; HEADER_SIZE];
        read_full(&mut stream, &mut header).await?;
        let header = FrameHeader::parse(&header)?;
        let len = header.payload_len();
        if len > MAX_RESPONSE_LEN {
            return Err(ChannelError::FrameTooLarge(len));
        }

        let mut body = vec![0u8; len];
        read_full(&mut stream, &mut body).await?;
        debug!(addr = %self.addr, len, "response frame received");
        Ok(body)
    }
}

/// Fills `buf` completely, failing with [`ChannelError::PrematureClose`] on EOF.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ChannelError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(ChannelError::PrematureClose {
                expected: buf.len(),
                received: filled,
            });
        }
        filled += n;
    }
    Ok(())
}

#[async_trait]
impl RequestExchanger for SecureChannel {
    async fn exchange(&self, endpoint: &str, data: Value) -> Option<Value> {
        match self.try_exchange(endpoint, data).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(addr = %self.addr, endpoint, error = %e, "exchange failed");
                None
            }
        }
    }
}
