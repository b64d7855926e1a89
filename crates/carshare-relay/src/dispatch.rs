//! Request dispatch.
//!
//! Turns one parsed [`Request`] into one [`Reply`]. Every failure a terminal
//! can act on becomes [`Reply::Failure`]; only loss of the store is reported
//! as an error, which ends the connection without a reply.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use carshare_core::auth::Authenticator;
use carshare_core::proximity::RosterSource;
use carshare_core::{AuthError, BookingError, BookingService, BookingStore, StoreError};

use crate::protocol::{Reply, Request};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("booking store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Routes terminal requests to the booking service, the authenticator and
/// the trusted-device roster.
pub struct Dispatcher {
    booking: Arc<BookingService<dyn BookingStore>>,
    auth: Arc<dyn Authenticator>,
    roster: Arc<dyn RosterSource>,
}

impl Dispatcher {
    pub fn new(
        booking: Arc<BookingService<dyn BookingStore>>,
        auth: Arc<dyn Authenticator>,
        roster: Arc<dyn RosterSource>,
    ) -> Self {
        Self {
            booking,
            auth,
            roster,
        }
    }

    pub async fn dispatch(&self, request: Request) -> Result<Reply, DispatchError> {
        match request {
            Request::Credentials { username, password } => {
                match self.auth.authenticate(&username, &password).await {
                    Ok(Some(person_id)) => Ok(Reply::PersonId(person_id)),
                    Ok(None) => Ok(Reply::Failure),
                    Err(AuthError::Storage(StoreError::Unavailable(e))) => {
                        Err(DispatchError::StoreUnavailable(e))
                    }
                    Err(e) => {
                        warn!(username = %username, error = %e, "credential check failed");
                        Ok(Reply::Failure)
                    }
                }
            }

            Request::Unlock {
                person_id,
                vehicle_id,
                begin_time,
            } => {
                let result = self.booking.unlock(person_id, vehicle_id, begin_time).await;
                booking_reply(result.map(|_| Reply::Unlocked), "unlock")
            }

            Request::Lock {
                person_id,
                vehicle_id,
            } => {
                let result = self.booking.lock(person_id, vehicle_id).await;
                booking_reply(result.map(|_| Reply::Locked), "lock")
            }

            Request::Bluetooth => match self.roster.trusted_devices().await {
                Ok(devices) => Ok(Reply::Devices(
                    devices.into_iter().map(|d| d.device_address).collect(),
                )),
                Err(StoreError::Unavailable(e)) => Err(DispatchError::StoreUnavailable(e)),
                Err(e) => {
                    warn!(error = %e, "trusted device lookup failed");
                    Ok(Reply::Failure)
                }
            },
        }
    }
}

fn booking_reply(
    result: Result<Reply, BookingError>,
    operation: &str,
) -> Result<Reply, DispatchError> {
    match result {
        Ok(reply) => Ok(reply),
        Err(BookingError::Storage(StoreError::Unavailable(e))) => {
            Err(DispatchError::StoreUnavailable(e))
        }
        Err(e @ BookingError::Storage(_)) => {
            warn!(operation, error = %e, "transition rolled back");
            Ok(Reply::Failure)
        }
        Err(e) => {
            debug!(operation, error = %e, "request refused");
            Ok(Reply::Failure)
        }
    }
}
