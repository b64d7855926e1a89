//! Message framing for terminal connections.
//!
//! Two modes:
//! - `raw`: a request is every byte the terminal sends until it
//!   half-closes or goes quiet for the idle timeout; the reply is written
//!   as-is and the connection closes. This is what deployed terminals
//!   speak.
//! - `length`: every message is prefixed with its length as a 4-byte
//!   big-endian integer.
//!
//! In both modes a message larger than `max_message_size` is an error,
//! never a silent truncation.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use bytes::BufMut;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Framing error
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("Frame too large: {0} bytes (max: {1})")]
    TooLarge(usize, usize),

    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FramingMode {
    #[default]
    Raw,
    Length,
}

impl fmt::Display for FramingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingMode::Raw => write!(f, "raw"),
            FramingMode::Length => write!(f, "length"),
        }
    }
}

impl FromStr for FramingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(FramingMode::Raw),
            "length" => Ok(FramingMode::Length),
            other => Err(format!("unknown framing mode: {} (expected raw or length)", other)),
        }
    }
}

pub const DEFAULT_RAW_IDLE_TIMEOUT: Duration = Duration::from_millis(200);

/// Frame codec for one side of a terminal connection
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    mode: FramingMode,
    max_message_size: usize,
    raw_idle_timeout: Duration,
}

impl FrameCodec {
    pub fn new(mode: FramingMode, max_message_size: usize) -> Self {
        Self {
            mode,
            max_message_size,
            raw_idle_timeout: DEFAULT_RAW_IDLE_TIMEOUT,
        }
    }

    /// Set how long a raw-mode read waits for more bytes after the first
    /// chunk before treating the request as complete.
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.raw_idle_timeout = idle;
        self
    }

    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    /// Encode a message for the wire.
    /// Length mode format: length (4 bytes BE) || data
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>, FramingError> {
        if data.len() > self.max_message_size {
            return Err(FramingError::TooLarge(data.len(), self.max_message_size));
        }

        match self.mode {
            FramingMode::Raw => Ok(data.to_vec()),
            FramingMode::Length => {
                let mut encoded = Vec::with_capacity(4 + data.len());
                encoded.put_u32(data.len() as u32);
                encoded.extend_from_slice(data);
                Ok(encoded)
            }
        }
    }

    /// Read one request from a terminal.
    ///
    /// In raw mode the first read waits as long as the caller lets it; after
    /// that, bytes keep accumulating until EOF or until the peer has been
    /// quiet for the idle timeout.
    ///
    /// # Returns
    /// `None` when the peer closed the connection before sending anything.
    pub async fn read_request<R>(&self, reader: &mut R) -> Result<Option<String>, FramingError>
    where
        R: AsyncRead + Unpin,
    {
        match self.mode {
            FramingMode::Raw => self.read_raw(reader).await,
            FramingMode::Length => self.read_frame(reader).await,
        }
    }

    async fn read_raw<R>(&self, reader: &mut R) -> Result<Option<String>, FramingError>
    where
        R: AsyncRead + Unpin,
    {
        // One byte of headroom tells an exact fit from an oversize send
        let mut buf = vec![0u8; self.max_message_size + 1];
        let mut filled = reader.read(&mut buf).await?;
        if filled == 0 {
            return Ok(None);
        }

        while filled < buf.len() {
            match tokio::time::timeout(self.raw_idle_timeout, reader.read(&mut buf[filled..])).await
            {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        if filled > self.max_message_size {
            return Err(FramingError::TooLarge(filled, self.max_message_size));
        }
        buf.truncate(filled);
        into_text(buf).map(Some)
    }

    /// Read the reply to a request, as the terminal side.
    ///
    /// In raw mode the reply runs until the relay closes the connection, so
    /// an empty reply reads as `Some("")`.
    pub async fn read_reply<R>(&self, reader: &mut R) -> Result<Option<String>, FramingError>
    where
        R: AsyncRead + Unpin,
    {
        match self.mode {
            FramingMode::Raw => {
                let mut buf = Vec::new();
                let limit = self.max_message_size as u64 + 1;
                reader.take(limit).read_to_end(&mut buf).await?;
                if buf.len() > self.max_message_size {
                    return Err(FramingError::TooLarge(buf.len(), self.max_message_size));
                }
                into_text(buf).map(Some)
            }
            FramingMode::Length => self.read_frame(reader).await,
        }
    }

    /// Write one message and flush.
    pub async fn write_message<W>(&self, writer: &mut W, message: &str) -> Result<(), FramingError>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = self.encode(message.as_bytes())?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_frame<R>(&self, reader: &mut R) -> Result<Option<String>, FramingError>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            let n = reader.read(&mut len_buf[filled..]).await?;
            if n == 0 {
                return if filled == 0 {
                    Ok(None)
                } else {
                    Err(FramingError::Incomplete(len_buf.len() - filled))
                };
            }
            filled += n;
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > self.max_message_size {
            return Err(FramingError::TooLarge(len, self.max_message_size));
        }

        let mut payload = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = reader.read(&mut payload[filled..]).await?;
            if n == 0 {
                return Err(FramingError::Incomplete(len - filled));
            }
            filled += n;
        }
        into_text(payload).map(Some)
    }
}

fn into_text(bytes: Vec<u8>) -> Result<String, FramingError> {
    String::from_utf8(bytes).map_err(|_| FramingError::InvalidUtf8)
}
