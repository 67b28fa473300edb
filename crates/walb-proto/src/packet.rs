//! Length-prefixed packet framing.
//!
//! Typed messages are bincode-encoded and framed with a u32 length;
//! bulk payloads travel as raw frames with a larger cap. Every read and
//! write honours the per-socket timeout.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use walb_core::{Error, Result};

/// Wire protocol version, checked during negotiation.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frame cap for typed messages.
const MAX_MSG_FRAME: usize = 1 << 20;

/// Frame cap for bulk payloads.
const MAX_BULK_FRAME: usize = 64 << 20;

/// Negotiation / acknowledgement answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Answer {
    /// The peer accepted.
    Ok,
    /// The peer refused.
    Ng {
        /// Machine-readable code.
        code: u32,
        /// Human-readable reason.
        msg: String,
    },
}

impl Answer {
    /// Turn an `Ng` into an error.
    ///
    /// # Errors
    ///
    /// Returns a protocol error carrying the peer's reason.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Ok => Ok(()),
            Self::Ng { code, msg } => {
                Err(Error::protocol(format!("peer refused (code {code}): {msg}")))
            }
        }
    }
}

/// A framed, buffered, timeout-guarded packet stream.
pub struct Packet<S> {
    stream: BufStream<S>,
    timeout: Option<Duration>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Packet<S> {
    /// Wrap a stream with no timeout.
    pub fn new(stream: S) -> Self {
        Self { stream: BufStream::new(stream), timeout: None }
    }

    /// Wrap a stream with a per-operation timeout.
    pub fn with_timeout(stream: S, timeout: Duration) -> Self {
        Self { stream: BufStream::new(stream), timeout: Some(timeout) }
    }

    /// Write one typed message.
    ///
    /// # Errors
    ///
    /// Fails on serialization or I/O error.
    pub async fn write<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let data = bincode::serialize(value).map_err(|e| Error::protocol(e.to_string()))?;
        if data.len() > MAX_MSG_FRAME {
            return Err(Error::protocol(format!("message frame too large: {}", data.len())));
        }
        let timeout = self.timeout;
        let stream = &mut self.stream;
        let fut = async move {
            stream.write_all(&(data.len() as u32).to_le_bytes()).await?;
            stream.write_all(&data).await?;
            Ok(())
        };
        match timeout {
            None => fut.await.map_err(Error::Io),
            Some(dur) => match tokio::time::timeout(dur, fut).await {
                Ok(res) => res.map_err(Error::Io),
                Err(_) => Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "socket write timed out",
                ))),
            },
        }
    }

    /// Read one typed message.
    ///
    /// # Errors
    ///
    /// Fails on a too-large frame, decode error or I/O error.
    pub async fn read<T: DeserializeOwned>(&mut self) -> Result<T> {
        let data = self.read_frame(MAX_MSG_FRAME).await?;
        bincode::deserialize(&data).map_err(|e| Error::protocol(e.to_string()))
    }

    /// Write one raw bulk frame.
    ///
    /// # Errors
    ///
    /// Fails on a too-large frame or I/O error.
    pub async fn write_buf(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > MAX_BULK_FRAME {
            return Err(Error::protocol(format!("bulk frame too large: {}", data.len())));
        }
        let timeout = self.timeout;
        let stream = &mut self.stream;
        let fut = async move {
            stream.write_all(&(data.len() as u32).to_le_bytes()).await?;
            stream.write_all(data).await?;
            Ok(())
        };
        match timeout {
            None => fut.await.map_err(Error::Io),
            Some(dur) => match tokio::time::timeout(dur, fut).await {
                Ok(res) => res.map_err(Error::Io),
                Err(_) => Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "socket write timed out",
                ))),
            },
        }
    }

    /// Read one raw bulk frame.
    ///
    /// # Errors
    ///
    /// Fails on a too-large frame or I/O error.
    pub async fn read_buf(&mut self) -> Result<Vec<u8>> {
        self.read_frame(MAX_BULK_FRAME).await
    }

    async fn read_frame(&mut self, cap: usize) -> Result<Vec<u8>> {
        let timeout = self.timeout;
        let stream = &mut self.stream;
        let fut = async move {
            let mut len_bytes = [0u8; 4];
            stream.read_exact(&mut len_bytes).await?;
            let len = u32::from_le_bytes(len_bytes) as usize;
            if len > cap {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("frame length {len} exceeds cap {cap}"),
                ));
            }
            let mut data = vec![0u8; len];
            stream.read_exact(&mut data).await?;
            Ok(data)
        };
        match timeout {
            None => fut.await.map_err(Error::Io),
            Some(dur) => match tokio::time::timeout(dur, fut).await {
                Ok(res) => res.map_err(Error::Io),
                Err(_) => Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "socket read timed out",
                ))),
            },
        }
    }

    /// Flush buffered writes to the peer.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub async fn flush(&mut self) -> Result<()> {
        let timeout = self.timeout;
        let stream = &mut self.stream;
        let fut = stream.flush();
        match timeout {
            None => fut.await.map_err(Error::Io),
            Some(dur) => match tokio::time::timeout(dur, fut).await {
                Ok(res) => res.map_err(Error::Io),
                Err(_) => Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "socket flush timed out",
                ))),
            },
        }
    }

    /// Send an acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub async fn send_ack(&mut self) -> Result<()> {
        self.write(&Answer::Ok).await?;
        self.flush().await
    }

    /// Receive an acknowledgement, failing on `Ng`.
    ///
    /// # Errors
    ///
    /// Fails when the peer answered `Ng` or on I/O error.
    pub async fn recv_ack(&mut self) -> Result<()> {
        let answer: Answer = self.read().await?;
        answer.into_result()
    }
}
