//! Error types for booking transitions and authentication.
//!
//! Store-level failures are defined next to the [`Store`](crate::store::BookingStore)
//! trait; this module lifts them into the errors the relay maps onto replies.

use thiserror::Error;

use crate::store::StoreError;
use crate::types::VehicleId;

/// Errors raised by the booking state machine.
#[derive(Debug, Error, Clone)]
pub enum BookingError {
    /// No reservation matches the request
    #[error("not found: {0}")]
    NotFound(String),

    /// Another reservation of the vehicle is already in rental
    #[error("vehicle {0} is already in an active rental")]
    VehicleBusy(VehicleId),

    /// The reservation is not in a state that allows the transition
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// The booking request was refused (vehicle booked, bad window, duplicate)
    #[error("booking rejected: {0}")]
    Rejected(String),

    /// The backing store failed; the transition was rolled back
    #[error("storage error: {0}")]
    Storage(StoreError),
}

impl BookingError {
    /// Whether the failure means the store itself is gone, as opposed to a
    /// request that simply could not be honoured.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, BookingError::Storage(StoreError::Unavailable(_)))
    }
}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => BookingError::NotFound(what),
            StoreError::AlreadyExists(what) => BookingError::Rejected(format!("already exists: {}", what)),
            StoreError::Conflict(what) => BookingError::Rejected(what),
            other => BookingError::Storage(other),
        }
    }
}

/// Authentication errors.
#[derive(Debug, Error, Clone)]
pub enum AuthError {
    /// Stored hash is not in a recognised format
    #[error("malformed password hash for user {0}")]
    MalformedHash(String),

    #[error("password hashing failed: {0}")]
    Hashing(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}
