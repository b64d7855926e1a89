//! Terminal-side client for the relay.
//!
//! Each call opens a connection, sends one request, reads one reply and
//! closes, the same way an in-car terminal talks to the relay. In raw mode
//! the write side is shut down once the request is sent.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::NaiveDateTime;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use carshare_core::types::{PersonId, VehicleId};

use crate::framing::{FrameCodec, FramingError, FramingMode};
use crate::protocol::Request;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("relay did not answer within {0:?}")]
    Timeout(Duration),

    #[error("unexpected reply: {0:?}")]
    UnexpectedReply(String),
}

pub struct TerminalClient {
    addr: SocketAddr,
    codec: FrameCodec,
    timeout: Duration,
}

impl TerminalClient {
    pub fn new(addr: SocketAddr, mode: FramingMode, max_message_size: usize) -> Self {
        Self {
            addr,
            codec: FrameCodec::new(mode, max_message_size),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Log in; returns the person id on success.
    pub async fn credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<PersonId>, ClientError> {
        let request = Request::Credentials {
            username: username.to_string(),
            password: password.to_string(),
        };
        match self.send(&request).await? {
            Some(reply) => reply
                .parse()
                .map(Some)
                .map_err(|_| ClientError::UnexpectedReply(reply)),
            None => Ok(None),
        }
    }

    pub async fn unlock(
        &self,
        person_id: PersonId,
        vehicle_id: VehicleId,
        begin_time: NaiveDateTime,
    ) -> Result<bool, ClientError> {
        let request = Request::Unlock {
            person_id,
            vehicle_id,
            begin_time,
        };
        self.expect_literal(&request, "unlocked").await
    }

    pub async fn lock(&self, person_id: PersonId, vehicle_id: VehicleId) -> Result<bool, ClientError> {
        let request = Request::Lock {
            person_id,
            vehicle_id,
        };
        self.expect_literal(&request, "locked").await
    }

    /// Addresses of the trusted maintenance devices.
    pub async fn trusted_devices(&self) -> Result<Vec<String>, ClientError> {
        Ok(self
            .send(&Request::Bluetooth)
            .await?
            .map(|reply| reply.split_whitespace().map(String::from).collect())
            .unwrap_or_default())
    }

    async fn expect_literal(&self, request: &Request, expected: &str) -> Result<bool, ClientError> {
        match self.send(request).await? {
            Some(reply) if reply == expected => Ok(true),
            Some(reply) => Err(ClientError::UnexpectedReply(reply)),
            None => Ok(false),
        }
    }

    pub async fn send(&self, request: &Request) -> Result<Option<String>, ClientError> {
        self.send_raw(&request.to_wire()).await
    }

    /// Send an arbitrary message. `None` means the relay answered with an
    /// empty reply or closed without answering.
    pub async fn send_raw(&self, message: &str) -> Result<Option<String>, ClientError> {
        timeout(self.timeout, self.exchange(message))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))?
    }

    async fn exchange(&self, message: &str) -> Result<Option<String>, ClientError> {
        let mut stream = TcpStream::connect(self.addr).await?;
        self.codec.write_message(&mut stream, message).await?;
        if self.codec.mode() == FramingMode::Raw {
            // Marks the end of the request so the relay need not wait out its idle timeout
            stream.shutdown().await?;
        }

        let reply = match self.codec.read_reply(&mut stream).await {
            Ok(reply) => reply,
            // Relay hung up on a request it rejected
            Err(FramingError::Io(e)) if e.kind() == io::ErrorKind::ConnectionReset => None,
            Err(e) => return Err(e.into()),
        };
        debug!("Relay replied {:?}", reply);
        Ok(reply.filter(|r| !r.is_empty()))
    }
}
