//! Storage abstraction for vehicles, reservations, rental history and the
//! personnel registry.
//!
//! This module defines the `BookingStore` trait and provides an in-memory
//! implementation for tests and single-process deployments.
//!
//! Every mutating operation is atomic: either all of its writes are visible
//! to other readers or none are.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::types::{
    HistoryId, HistoryRecord, NewReservation, Person, PersonId, Reservation, ReservationId,
    ReservationQuery, Role, TrustedDevice, Vehicle, VehicleId,
};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during store operations.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    AlreadyExists(String),

    /// The write would break a booking invariant (vehicle already booked,
    /// second ongoing rental, ...)
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    /// The backing store can no longer be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// Store Trait
// ============================================================================

/// Storage abstraction for booking data.
///
/// The relay and the booking state machine only ever talk to the store through
/// this trait, so the same logic runs against SQLite in production and the
/// in-memory store in tests.
#[async_trait]
pub trait BookingStore: Send + Sync {
    // -------------------------------------------------------------------------
    // Vehicle Operations
    // -------------------------------------------------------------------------

    /// Insert or replace a vehicle.
    async fn save_vehicle(&self, vehicle: Vehicle) -> Result<(), StoreError>;

    /// Retrieve a vehicle by id.
    ///
    /// # Returns
    /// * `Ok(Some(vehicle))` if found
    /// * `Ok(None)` if not found
    /// * `Err(StoreError)` if the operation fails
    async fn load_vehicle(&self, vehicle_id: VehicleId) -> Result<Option<Vehicle>, StoreError>;

    /// List vehicles ordered by id. With `available_only`, vehicles that are
    /// booked or have a reported issue are skipped.
    async fn list_vehicles(&self, available_only: bool) -> Result<Vec<Vehicle>, StoreError>;

    /// Flag a vehicle as needing repair. A flagged vehicle cannot be booked.
    ///
    /// # Returns
    /// * `Ok(vehicle)` - the vehicle with its issue flag set
    /// * `Err(StoreError::NotFound)` if the vehicle doesn't exist
    /// * `Err(StoreError::Conflict)` if an issue is already reported
    async fn report_issue(&self, vehicle_id: VehicleId) -> Result<Vehicle, StoreError>;

    /// Vehicles with a reported issue, ordered by id.
    async fn list_vehicles_with_issues(&self) -> Result<Vec<Vehicle>, StoreError>;

    // -------------------------------------------------------------------------
    // Personnel Registry
    // -------------------------------------------------------------------------

    /// Insert or replace a person.
    async fn save_person(&self, person: Person) -> Result<(), StoreError>;

    /// Retrieve a person by username.
    async fn find_person_by_username(&self, username: &str) -> Result<Option<Person>, StoreError>;

    /// Registered device addresses of all engineers.
    async fn list_trusted_devices(&self) -> Result<Vec<TrustedDevice>, StoreError>;

    // -------------------------------------------------------------------------
    // Reservation Operations
    // -------------------------------------------------------------------------

    /// Create a reservation in the reserved state and mark the vehicle booked.
    ///
    /// # Returns
    /// * `Ok(reservation)` on success
    /// * `Err(StoreError::NotFound)` if the vehicle doesn't exist
    /// * `Err(StoreError::Conflict)` if the vehicle is booked or has an issue
    /// * `Err(StoreError::AlreadyExists)` if the (person, vehicle, begin time)
    ///   booking already exists
    async fn create_reservation(&self, new: NewReservation) -> Result<Reservation, StoreError>;

    /// First reservation (lowest id) matching the query.
    async fn find_reservation(
        &self,
        query: &ReservationQuery,
    ) -> Result<Option<Reservation>, StoreError>;

    /// All reservations matching the query, ordered by id.
    async fn list_reservations(
        &self,
        query: &ReservationQuery,
    ) -> Result<Vec<Reservation>, StoreError>;

    /// Mark a reservation as ongoing.
    ///
    /// Idempotent for a reservation that is already ongoing.
    ///
    /// # Returns
    /// * `Err(StoreError::NotFound)` if the reservation doesn't exist
    /// * `Err(StoreError::Conflict)` if another reservation of the same vehicle
    ///   is ongoing
    async fn transition_to_active(&self, reservation_id: ReservationId) -> Result<(), StoreError>;

    /// Finish an ongoing rental as one unit: write the history record, delete
    /// the reservation and clear the vehicle's booked flag.
    ///
    /// # Returns
    /// * `Ok(history)` on success
    /// * `Err(StoreError::NotFound)` if the reservation doesn't exist
    /// * `Err(StoreError::Conflict)` if the reservation is not ongoing
    async fn complete_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<HistoryRecord, StoreError>;

    /// Delete a reservation that has not started and release the vehicle.
    ///
    /// # Returns
    /// * `Ok(reservation)` - the removed reservation
    /// * `Err(StoreError::NotFound)` if the reservation doesn't exist
    /// * `Err(StoreError::Conflict)` if the rental is already ongoing
    async fn cancel_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Reservation, StoreError>;

    // -------------------------------------------------------------------------
    // History
    // -------------------------------------------------------------------------

    /// Completed rentals ordered by id, optionally restricted to one person.
    async fn list_history(
        &self,
        person_id: Option<PersonId>,
    ) -> Result<Vec<HistoryRecord>, StoreError>;
}

// ============================================================================
// In-Memory Store Implementation
// ============================================================================

/// Everything the store knows about one vehicle. Keeping reservations and
/// history next to the vehicle lets a completion update all three under the
/// vehicle's own map entry.
#[derive(Clone, Debug)]
struct VehicleSlot {
    vehicle: Vehicle,
    reservations: Vec<Reservation>,
    history: Vec<HistoryRecord>,
}

/// Thread-safe in-memory store.
///
/// Vehicles live in a sharded `DashMap`, so writes to different vehicles do
/// not contend on a single lock.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    /// Vehicle slots indexed by vehicle id
    vehicles: Arc<DashMap<VehicleId, VehicleSlot>>,
    /// Reservation id -> owning vehicle
    reservation_index: Arc<DashMap<ReservationId, VehicleId>>,
    /// Persons indexed by id
    persons: Arc<RwLock<HashMap<PersonId, Person>>>,
    next_reservation_id: Arc<AtomicI64>,
    next_history_id: Arc<AtomicI64>,
}

impl InMemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new in-memory store wrapped in an Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn allocate_reservation_id(&self) -> ReservationId {
        ReservationId(self.next_reservation_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn allocate_history_id(&self) -> HistoryId {
        HistoryId(self.next_history_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn owner_of(&self, reservation_id: ReservationId) -> Result<VehicleId, StoreError> {
        self.reservation_index
            .get(&reservation_id)
            .map(|v| *v)
            .ok_or_else(|| StoreError::NotFound(format!("reservation {}", reservation_id)))
    }

    fn collect_reservations(&self, query: &ReservationQuery) -> Vec<Reservation> {
        let mut found: Vec<Reservation> = match query.vehicle_id {
            Some(vehicle_id) => self
                .vehicles
                .get(&vehicle_id)
                .map(|slot| {
                    slot.reservations
                        .iter()
                        .filter(|r| query.matches(r))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
            None => self
                .vehicles
                .iter()
                .flat_map(|slot| {
                    slot.reservations
                        .iter()
                        .filter(|r| query.matches(r))
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .collect(),
        };
        found.sort_by_key(|r| r.id);
        found
    }
}

#[async_trait]
impl BookingStore for InMemoryStore {
    // -------------------------------------------------------------------------
    // Vehicle Operations
    // -------------------------------------------------------------------------

    async fn save_vehicle(&self, vehicle: Vehicle) -> Result<(), StoreError> {
        match self.vehicles.get_mut(&vehicle.id) {
            Some(mut slot) => slot.vehicle = vehicle,
            None => {
                self.vehicles.insert(
                    vehicle.id,
                    VehicleSlot {
                        vehicle,
                        reservations: Vec::new(),
                        history: Vec::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn load_vehicle(&self, vehicle_id: VehicleId) -> Result<Option<Vehicle>, StoreError> {
        Ok(self.vehicles.get(&vehicle_id).map(|slot| slot.vehicle.clone()))
    }

    async fn list_vehicles(&self, available_only: bool) -> Result<Vec<Vehicle>, StoreError> {
        let mut vehicles: Vec<Vehicle> = self
            .vehicles
            .iter()
            .map(|slot| slot.vehicle.clone())
            .filter(|v| !available_only || (!v.booked && !v.has_issue))
            .collect();
        vehicles.sort_by_key(|v| v.id);
        Ok(vehicles)
    }

    async fn report_issue(&self, vehicle_id: VehicleId) -> Result<Vehicle, StoreError> {
        let mut slot = self
            .vehicles
            .get_mut(&vehicle_id)
            .ok_or_else(|| StoreError::NotFound(format!("vehicle {}", vehicle_id)))?;
        if slot.vehicle.has_issue {
            return Err(StoreError::Conflict(format!(
                "vehicle {} already has a reported issue",
                vehicle_id
            )));
        }
        slot.vehicle.has_issue = true;
        Ok(slot.vehicle.clone())
    }

    async fn list_vehicles_with_issues(&self) -> Result<Vec<Vehicle>, StoreError> {
        let mut vehicles: Vec<Vehicle> = self
            .vehicles
            .iter()
            .filter(|slot| slot.vehicle.has_issue)
            .map(|slot| slot.vehicle.clone())
            .collect();
        vehicles.sort_by_key(|v| v.id);
        Ok(vehicles)
    }

    // -------------------------------------------------------------------------
    // Personnel Registry
    // -------------------------------------------------------------------------

    async fn save_person(&self, person: Person) -> Result<(), StoreError> {
        let mut persons = self.persons.write().await;
        if persons
            .values()
            .any(|p| p.username == person.username && p.id != person.id)
        {
            return Err(StoreError::AlreadyExists(format!("username {}", person.username)));
        }
        persons.insert(person.id, person);
        Ok(())
    }

    async fn find_person_by_username(&self, username: &str) -> Result<Option<Person>, StoreError> {
        let persons = self.persons.read().await;
        Ok(persons.values().find(|p| p.username == username).cloned())
    }

    async fn list_trusted_devices(&self) -> Result<Vec<TrustedDevice>, StoreError> {
        let persons = self.persons.read().await;
        let mut devices: Vec<TrustedDevice> = persons
            .values()
            .filter(|p| p.role == Role::Engineer)
            .filter_map(|p| {
                p.device_address.as_ref().map(|addr| TrustedDevice {
                    person_id: p.id,
                    device_address: addr.clone(),
                })
            })
            .collect();
        devices.sort_by_key(|d| d.person_id);
        Ok(devices)
    }

    // -------------------------------------------------------------------------
    // Reservation Operations
    // -------------------------------------------------------------------------

    async fn create_reservation(&self, new: NewReservation) -> Result<Reservation, StoreError> {
        let mut slot = self
            .vehicles
            .get_mut(&new.vehicle_id)
            .ok_or_else(|| StoreError::NotFound(format!("vehicle {}", new.vehicle_id)))?;

        if slot.reservations.iter().any(|r| {
            r.person_id == new.person_id && r.begin_time == new.begin_time
        }) {
            return Err(StoreError::AlreadyExists(format!(
                "reservation of vehicle {} by person {} at {}",
                new.vehicle_id, new.person_id, new.begin_time
            )));
        }
        if slot.vehicle.booked {
            return Err(StoreError::Conflict(format!("vehicle {} is booked", new.vehicle_id)));
        }
        if slot.vehicle.has_issue {
            return Err(StoreError::Conflict(format!(
                "vehicle {} has a reported issue",
                new.vehicle_id
            )));
        }

        let reservation = Reservation {
            id: self.allocate_reservation_id(),
            person_id: new.person_id,
            vehicle_id: new.vehicle_id,
            begin_time: new.begin_time,
            return_time: new.return_time,
            ongoing: false,
        };
        slot.reservations.push(reservation.clone());
        slot.vehicle.booked = true;
        self.reservation_index.insert(reservation.id, reservation.vehicle_id);
        Ok(reservation)
    }

    async fn find_reservation(
        &self,
        query: &ReservationQuery,
    ) -> Result<Option<Reservation>, StoreError> {
        Ok(self.collect_reservations(query).into_iter().next())
    }

    async fn list_reservations(
        &self,
        query: &ReservationQuery,
    ) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.collect_reservations(query))
    }

    async fn transition_to_active(&self, reservation_id: ReservationId) -> Result<(), StoreError> {
        let vehicle_id = self.owner_of(reservation_id)?;
        let mut slot = self
            .vehicles
            .get_mut(&vehicle_id)
            .ok_or_else(|| StoreError::NotFound(format!("vehicle {}", vehicle_id)))?;

        if slot
            .reservations
            .iter()
            .any(|r| r.ongoing && r.id != reservation_id)
        {
            return Err(StoreError::Conflict(format!(
                "vehicle {} already has an ongoing rental",
                vehicle_id
            )));
        }

        let reservation = slot
            .reservations
            .iter_mut()
            .find(|r| r.id == reservation_id)
            .ok_or_else(|| StoreError::NotFound(format!("reservation {}", reservation_id)))?;
        reservation.ongoing = true;
        Ok(())
    }

    async fn complete_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<HistoryRecord, StoreError> {
        let vehicle_id = self.owner_of(reservation_id)?;
        let mut slot = self
            .vehicles
            .get_mut(&vehicle_id)
            .ok_or_else(|| StoreError::NotFound(format!("vehicle {}", vehicle_id)))?;

        // Validate everything before the first write so a failure leaves the
        // slot untouched.
        let position = slot
            .reservations
            .iter()
            .position(|r| r.id == reservation_id)
            .ok_or_else(|| StoreError::NotFound(format!("reservation {}", reservation_id)))?;
        if !slot.reservations[position].ongoing {
            return Err(StoreError::Conflict(format!(
                "reservation {} is not ongoing",
                reservation_id
            )));
        }

        let reservation = slot.reservations.remove(position);
        let record = HistoryRecord {
            id: self.allocate_history_id(),
            person_id: reservation.person_id,
            vehicle_id: reservation.vehicle_id,
            begin_time: reservation.begin_time,
            return_time: reservation.return_time,
        };
        slot.history.push(record.clone());
        slot.vehicle.booked = false;
        drop(slot);

        self.reservation_index.remove(&reservation_id);
        Ok(record)
    }

    async fn cancel_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Reservation, StoreError> {
        let vehicle_id = self.owner_of(reservation_id)?;
        let mut slot = self
            .vehicles
            .get_mut(&vehicle_id)
            .ok_or_else(|| StoreError::NotFound(format!("vehicle {}", vehicle_id)))?;

        let position = slot
            .reservations
            .iter()
            .position(|r| r.id == reservation_id)
            .ok_or_else(|| StoreError::NotFound(format!("reservation {}", reservation_id)))?;
        if slot.reservations[position].ongoing {
            return Err(StoreError::Conflict(format!(
                "reservation {} is an ongoing rental",
                reservation_id
            )));
        }

        let reservation = slot.reservations.remove(position);
        slot.vehicle.booked = false;
        drop(slot);

        self.reservation_index.remove(&reservation_id);
        Ok(reservation)
    }

    // -------------------------------------------------------------------------
    // History
    // -------------------------------------------------------------------------

    async fn list_history(
        &self,
        person_id: Option<PersonId>,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        let mut history: Vec<HistoryRecord> = self
            .vehicles
            .iter()
            .flat_map(|slot| slot.history.clone())
            .filter(|h| person_id.map_or(true, |p| p == h.person_id))
            .collect();
        history.sort_by_key(|h| h.id);
        Ok(history)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
