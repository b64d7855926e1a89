//! Carshare Core - Booking state machine and storage for carshare terminals.
//!
//! This crate implements:
//! - Reservation lifecycle (reserve, unlock, lock, cancel)
//! - Booking store abstraction with in-memory and SQLite backends
//! - Credential verification against the person registry
//! - Proximity scanning for trusted maintenance devices

#![forbid(unsafe_code)]

// State machine
pub mod booking;

// Services
pub mod auth;
pub mod proximity;

// Infrastructure
pub mod store;

// Supporting modules
pub mod errors;
pub mod types;
pub mod harness;

// Optional storage implementations
#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use booking::BookingService;
pub use errors::{AuthError, BookingError};
pub use store::{BookingStore, InMemoryStore, StoreError};
