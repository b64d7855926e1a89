//! Domain types shared by the store, the booking state machine and the relay.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Canonical text form of booking times, as persisted and sent on the wire.
pub const BOOKING_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Accepted input forms, most precise first.
const BOOKING_TIME_INPUT_FORMATS: [&str; 2] = [BOOKING_TIME_FORMAT, "%Y-%m-%d %H:%M"];

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<i64>().map($name)
            }
        }
    };
}

id_type!(
    /// Identifier of a registered person (customer, engineer, ...).
    PersonId
);
id_type!(
    /// Identifier of a vehicle in the fleet.
    VehicleId
);
id_type!(ReservationId);
id_type!(HistoryId);

/// Parse a booking time in `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD HH:MM` form.
pub fn parse_booking_time(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    BOOKING_TIME_INPUT_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

/// Format a booking time in its canonical form.
pub fn format_booking_time(t: &NaiveDateTime) -> String {
    t.format(BOOKING_TIME_FORMAT).to_string()
}

/// Role of a registered person.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Engineer,
    Manager,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Engineer => "engineer",
            Role::Manager => "manager",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer" => Ok(Role::Customer),
            "engineer" => Ok(Role::Engineer),
            "manager" => Ok(Role::Manager),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// A vehicle of the shared fleet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: VehicleId,
    pub make: String,
    pub body_type: String,
    pub colour: String,
    pub seats: u32,
    /// "lat, lng" as entered by the fleet manager
    pub location: String,
    pub cost_per_hour: f64,
    /// Reserved or in rental
    pub booked: bool,
    pub has_issue: bool,
}

/// A booking spanning a planned rental window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub person_id: PersonId,
    pub vehicle_id: VehicleId,
    pub begin_time: NaiveDateTime,
    pub return_time: NaiveDateTime,
    pub ongoing: bool,
}

impl Reservation {
    pub fn state(&self) -> ReservationState {
        if self.ongoing {
            ReservationState::Active
        } else {
            ReservationState::Reserved
        }
    }
}

/// Lifecycle state of a reservation that still exists in the store.
/// Completed rentals only exist as [`HistoryRecord`]s.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationState {
    Reserved,
    Active,
}

/// Fields of a reservation that has not been stored yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewReservation {
    pub person_id: PersonId,
    pub vehicle_id: VehicleId,
    pub begin_time: NaiveDateTime,
    pub return_time: NaiveDateTime,
}

/// A completed rental. Immutable once written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: HistoryId,
    pub person_id: PersonId,
    pub vehicle_id: VehicleId,
    pub begin_time: NaiveDateTime,
    pub return_time: NaiveDateTime,
}

/// A registered person.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id: PersonId,
    pub username: String,
    /// argon2 PHC string
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    /// Hardware address of the person's registered device, if any
    pub device_address: Option<String>,
}

/// Device pre-registered by maintenance personnel for proximity unlock.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrustedDevice {
    pub person_id: PersonId,
    pub device_address: String,
}

/// Filter for reservation lookups. `None` fields match anything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReservationQuery {
    pub person_id: Option<PersonId>,
    pub vehicle_id: Option<VehicleId>,
    pub begin_time: Option<NaiveDateTime>,
    pub ongoing: Option<bool>,
}

impl ReservationQuery {
    /// Exact (person, vehicle, begin time) match used by unlock and cancel.
    pub fn booking(person_id: PersonId, vehicle_id: VehicleId, begin_time: NaiveDateTime) -> Self {
        Self {
            person_id: Some(person_id),
            vehicle_id: Some(vehicle_id),
            begin_time: Some(begin_time),
            ongoing: None,
        }
    }

    /// The active rental of a person on a vehicle, used by lock.
    pub fn active(person_id: PersonId, vehicle_id: VehicleId) -> Self {
        Self {
            person_id: Some(person_id),
            vehicle_id: Some(vehicle_id),
            begin_time: None,
            ongoing: Some(true),
        }
    }

    pub fn matches(&self, r: &Reservation) -> bool {
        self.person_id.map_or(true, |p| p == r.person_id)
            && self.vehicle_id.map_or(true, |v| v == r.vehicle_id)
            && self.begin_time.map_or(true, |t| t == r.begin_time)
            && self.ongoing.map_or(true, |o| o == r.ongoing)
    }
}
