//! Test harness for carshare core functionality.
//!
//! Seeding helpers shared by unit tests, integration tests and the relay's
//! end-to-end tests.

use argon2::Params;

use crate::auth::hash_password_with_params;
use crate::store::{BookingStore, StoreError};
use crate::types::{NewReservation, Person, PersonId, Reservation, Role, Vehicle, VehicleId};

/// A free vehicle with plausible attributes.
pub fn make_test_vehicle(id: i64) -> Vehicle {
    Vehicle {
        id: VehicleId(id),
        make: "Toyota Corolla".into(),
        body_type: "Sedan".into(),
        colour: "White".into(),
        seats: 5,
        location: "-37.8080, 144.9633".into(),
        cost_per_hour: 12.5,
        booked: false,
        has_issue: false,
    }
}

/// A person whose stored hash matches `password`.
///
/// Hashed with the minimum argon2 cost so seeding stays fast.
pub fn make_test_person(
    id: i64,
    username: &str,
    password: &str,
    role: Role,
    device_address: Option<&str>,
) -> Person {
    Person {
        id: PersonId(id),
        username: username.to_string(),
        password_hash: hash_password_with_params(password, fast_params())
            .expect("argon2 hashing with minimum params"),
        role,
        device_address: device_address.map(str::to_string),
    }
}

fn fast_params() -> Params {
    Params::new(Params::MIN_M_COST, Params::MIN_T_COST, 1, None).expect("minimum argon2 params")
}

/// Save vehicles `1..=count`.
pub async fn seed_fleet<S: BookingStore + ?Sized>(store: &S, count: i64) -> Result<(), StoreError> {
    for id in 1..=count {
        store.save_vehicle(make_test_vehicle(id)).await?;
    }
    Ok(())
}

/// Create a reservation even if the vehicle is already booked.
///
/// The booking web service does not always keep `booked` in step with the
/// reservations table; this reproduces rows written that way.
pub async fn seed_overlapping_reservation<S: BookingStore + ?Sized>(
    store: &S,
    new: NewReservation,
) -> Result<Reservation, StoreError> {
    let mut vehicle = store
        .load_vehicle(new.vehicle_id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("vehicle {}", new.vehicle_id)))?;
    if vehicle.booked {
        vehicle.booked = false;
        store.save_vehicle(vehicle).await?;
    }
    store.create_reservation(new).await
}
