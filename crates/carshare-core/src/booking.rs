//! Booking state machine.
//!
//! A reservation moves RESERVED -> ACTIVE on unlock and ACTIVE -> COMPLETED
//! on lock. Completion is a single store operation that records history,
//! removes the reservation and releases the vehicle together.
//!
//! Transitions on the same vehicle are serialized through a per-vehicle
//! async mutex; transitions on different vehicles never wait on each other.

use std::sync::Arc;

use chrono::NaiveDateTime;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::errors::BookingError;
use crate::store::{BookingStore, StoreError};
use crate::types::{
    HistoryRecord, NewReservation, PersonId, Reservation, ReservationQuery, Vehicle, VehicleId,
};

/// Exclusive hold on one vehicle's transitions.
///
/// Dropping it releases the mutex and removes the map entry when no other
/// task holds or waits on it, so ids that are never seen again do not
/// accumulate.
struct VehicleGuard<'a> {
    locks: &'a DashMap<VehicleId, Arc<Mutex<()>>>,
    vehicle_id: VehicleId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for VehicleGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters keep a clone of the Arc, so a count of one is the map's own
        self.locks
            .remove_if(&self.vehicle_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Drives reservations through their lifecycle on top of a [`BookingStore`].
pub struct BookingService<S: BookingStore + ?Sized> {
    store: Arc<S>,
    vehicle_locks: DashMap<VehicleId, Arc<Mutex<()>>>,
}

impl<S: BookingStore + ?Sized> BookingService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            vehicle_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    async fn lock_vehicle(&self, vehicle_id: VehicleId) -> VehicleGuard<'_> {
        let lock = Arc::clone(self.vehicle_locks.entry(vehicle_id).or_default().value());
        VehicleGuard {
            locks: &self.vehicle_locks,
            vehicle_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    // ---- Rental Transitions ----

    /// Start the rental booked by `person_id` on `vehicle_id` at `begin_time`.
    ///
    /// # Arguments
    /// * `person_id` - Person who made the booking
    /// * `vehicle_id` - Vehicle being unlocked
    /// * `begin_time` - Begin time of the booking, matched exactly
    ///
    /// # Returns
    /// The reservation, now ongoing. Unlocking a rental that is already
    /// ongoing succeeds again without changing anything.
    pub async fn unlock(
        &self,
        person_id: PersonId,
        vehicle_id: VehicleId,
        begin_time: NaiveDateTime,
    ) -> Result<Reservation, BookingError> {
        let _guard = self.lock_vehicle(vehicle_id).await;

        let reservation = self
            .store
            .find_reservation(&ReservationQuery::booking(person_id, vehicle_id, begin_time))
            .await?
            .ok_or_else(|| {
                BookingError::NotFound(format!(
                    "no booking of vehicle {} by person {} at {}",
                    vehicle_id, person_id, begin_time
                ))
            })?;

        if reservation.ongoing {
            debug!(
                reservation = %reservation.id,
                vehicle = %vehicle_id,
                "unlock of a rental already in progress"
            );
            return Ok(reservation);
        }

        let in_rental = ReservationQuery {
            vehicle_id: Some(vehicle_id),
            ongoing: Some(true),
            ..ReservationQuery::default()
        };
        if let Some(other) = self.store.find_reservation(&in_rental).await? {
            warn!(
                vehicle = %vehicle_id,
                active = %other.id,
                requested = %reservation.id,
                "unlock refused, vehicle already in rental"
            );
            return Err(BookingError::VehicleBusy(vehicle_id));
        }

        self.store
            .transition_to_active(reservation.id)
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => BookingError::VehicleBusy(vehicle_id),
                other => other.into(),
            })?;

        info!(
            reservation = %reservation.id,
            person = %person_id,
            vehicle = %vehicle_id,
            "rental started"
        );
        Ok(Reservation {
            ongoing: true,
            ..reservation
        })
    }

    /// Finish the ongoing rental of `person_id` on `vehicle_id`.
    ///
    /// On success the reservation is gone, a history record exists and the
    /// vehicle is free again. On failure none of that has happened.
    pub async fn lock(
        &self,
        person_id: PersonId,
        vehicle_id: VehicleId,
    ) -> Result<HistoryRecord, BookingError> {
        let _guard = self.lock_vehicle(vehicle_id).await;

        let reservation = self
            .store
            .find_reservation(&ReservationQuery::active(person_id, vehicle_id))
            .await?
            .ok_or_else(|| {
                BookingError::NotFound(format!(
                    "no ongoing rental of vehicle {} by person {}",
                    vehicle_id, person_id
                ))
            })?;

        let record = self
            .store
            .complete_reservation(reservation.id)
            .await
            .map_err(|e| match e {
                StoreError::Conflict(msg) => BookingError::InvalidTransition(msg),
                other => other.into(),
            })?;

        info!(
            history = %record.id,
            person = %person_id,
            vehicle = %vehicle_id,
            "rental completed"
        );
        Ok(record)
    }

    // ---- Booking Operations ----

    /// Book a free vehicle for a rental window.
    pub async fn reserve(&self, new: NewReservation) -> Result<Reservation, BookingError> {
        if new.return_time <= new.begin_time {
            return Err(BookingError::Rejected(format!(
                "return time {} is not after begin time {}",
                new.return_time, new.begin_time
            )));
        }

        let _guard = self.lock_vehicle(new.vehicle_id).await;
        let reservation = self.store.create_reservation(new).await?;

        info!(
            reservation = %reservation.id,
            person = %reservation.person_id,
            vehicle = %reservation.vehicle_id,
            "vehicle reserved"
        );
        Ok(reservation)
    }

    /// Cancel a booking that has not been unlocked yet.
    pub async fn cancel(
        &self,
        person_id: PersonId,
        vehicle_id: VehicleId,
        begin_time: NaiveDateTime,
    ) -> Result<Reservation, BookingError> {
        let _guard = self.lock_vehicle(vehicle_id).await;

        let reservation = self
            .store
            .find_reservation(&ReservationQuery::booking(person_id, vehicle_id, begin_time))
            .await?
            .ok_or_else(|| {
                BookingError::NotFound(format!(
                    "no booking of vehicle {} by person {} at {}",
                    vehicle_id, person_id, begin_time
                ))
            })?;
        if reservation.ongoing {
            return Err(BookingError::InvalidTransition(format!(
                "reservation {} is in rental and must be locked instead",
                reservation.id
            )));
        }

        let cancelled = self.store.cancel_reservation(reservation.id).await?;
        info!(reservation = %cancelled.id, vehicle = %vehicle_id, "booking cancelled");
        Ok(cancelled)
    }

    // ---- Vehicle Issues ----

    /// Flag a vehicle for repair. Refused when an issue is already reported.
    pub async fn report_issue(&self, vehicle_id: VehicleId) -> Result<Vehicle, BookingError> {
        let _guard = self.lock_vehicle(vehicle_id).await;
        let vehicle = self.store.report_issue(vehicle_id).await?;
        info!(vehicle = %vehicle_id, booked = vehicle.booked, "issue reported");
        Ok(vehicle)
    }

    /// Vehicles waiting for an engineer.
    pub async fn vehicles_with_issues(&self) -> Result<Vec<Vehicle>, BookingError> {
        Ok(self.store.list_vehicles_with_issues().await?)
    }

    // ---- Queries ----

    pub async fn history(
        &self,
        person_id: Option<PersonId>,
    ) -> Result<Vec<HistoryRecord>, BookingError> {
        Ok(self.store.list_history(person_id).await?)
    }

    pub async fn available_vehicles(&self) -> Result<Vec<Vehicle>, BookingError> {
        Ok(self.store.list_vehicles(true).await?)
    }

    pub async fn reservations_of(
        &self,
        person_id: PersonId,
    ) -> Result<Vec<Reservation>, BookingError> {
        let query = ReservationQuery {
            person_id: Some(person_id),
            ..ReservationQuery::default()
        };
        Ok(self.store.list_reservations(&query).await?)
    }
}
