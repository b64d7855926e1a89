//! carshare-relay: command relay for carshare terminals
//!
//! Terminals open a TCP connection, send one tagged request (credentials,
//! unlock, lock or bluetooth) and read one reply. The relay drives the
//! booking state machine in `carshare-core` and closes the connection.

pub mod admin;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod framing;
pub mod metrics;
pub mod protocol;
pub mod server;

pub use client::TerminalClient;
pub use config::RelayConfig;
pub use protocol::{ProtocolError, Reply, Request};
pub use server::{RelayServer, ShutdownHandle};
