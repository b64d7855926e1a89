//! Terminal wire protocol.
//!
//! ```text
//! REQUEST ::= "credentials" SP user SP pass
//!           | "unlock" SP personId SP vehicleId SP beginTime   ; beginTime may contain SP
//!           | "lock" SP personId SP vehicleId
//!           | "bluetooth"
//! REPLY   ::= personId | "unlocked" | "locked" | deviceAddr (SP deviceAddr)* | ""
//! ```
//!
//! An empty reply always means failure.

use std::fmt;

use chrono::NaiveDateTime;
use thiserror::Error;

use carshare_core::types::{format_booking_time, parse_booking_time, PersonId, VehicleId};

pub const TAG_CREDENTIALS: &str = "credentials";
pub const TAG_UNLOCK: &str = "unlock";
pub const TAG_LOCK: &str = "lock";
pub const TAG_BLUETOOTH: &str = "bluetooth";

/// Request that could not be understood. The relay closes the connection
/// without replying.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty request")]
    Empty,

    #[error("unknown tag: {0}")]
    UnknownTag(String),

    #[error("{tag}: missing {field}")]
    MissingField {
        tag: &'static str,
        field: &'static str,
    },

    #[error("{tag}: invalid {field} {value:?}")]
    InvalidField {
        tag: &'static str,
        field: &'static str,
        value: String,
    },

    #[error("{0}: unexpected trailing input")]
    TrailingInput(&'static str),

    #[error("request too large: {0} bytes (max: {1})")]
    Oversize(usize, usize),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// One parsed terminal request.
#[derive(Clone, PartialEq, Eq)]
pub enum Request {
    Credentials { username: String, password: String },
    Unlock {
        person_id: PersonId,
        vehicle_id: VehicleId,
        begin_time: NaiveDateTime,
    },
    Lock { person_id: PersonId, vehicle_id: VehicleId },
    Bluetooth,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Credentials { username, .. } => f
                .debug_struct("Credentials")
                .field("username", username)
                .finish_non_exhaustive(),
            Request::Unlock {
                person_id,
                vehicle_id,
                begin_time,
            } => f
                .debug_struct("Unlock")
                .field("person_id", person_id)
                .field("vehicle_id", vehicle_id)
                .field("begin_time", begin_time)
                .finish(),
            Request::Lock {
                person_id,
                vehicle_id,
            } => f
                .debug_struct("Lock")
                .field("person_id", person_id)
                .field("vehicle_id", vehicle_id)
                .finish(),
            Request::Bluetooth => f.write_str("Bluetooth"),
        }
    }
}

/// Split off the next whitespace-delimited token.
fn next_token(input: &str) -> Option<(&str, &str)> {
    let input = input.trim_start();
    if input.is_empty() {
        return None;
    }
    match input.find(char::is_whitespace) {
        Some(end) => Some((&input[..end], &input[end..])),
        None => Some((input, "")),
    }
}

fn field<'a>(
    rest: &mut &'a str,
    tag: &'static str,
    name: &'static str,
) -> Result<&'a str, ProtocolError> {
    let (token, remainder) =
        next_token(*rest).ok_or(ProtocolError::MissingField { tag, field: name })?;
    *rest = remainder;
    Ok(token)
}

fn id_field<T: std::str::FromStr>(
    rest: &mut &str,
    tag: &'static str,
    name: &'static str,
) -> Result<T, ProtocolError> {
    let token = field(rest, tag, name)?;
    token.parse().map_err(|_| ProtocolError::InvalidField {
        tag,
        field: name,
        value: token.to_string(),
    })
}

fn expect_end(rest: &str, tag: &'static str) -> Result<(), ProtocolError> {
    if rest.trim().is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::TrailingInput(tag))
    }
}

impl Request {
    /// Parse one request message.
    pub fn parse(message: &str) -> Result<Self, ProtocolError> {
        let (tag, mut rest) = next_token(message).ok_or(ProtocolError::Empty)?;

        match tag {
            TAG_CREDENTIALS => {
                let username = field(&mut rest, TAG_CREDENTIALS, "username")?.to_string();
                let password = field(&mut rest, TAG_CREDENTIALS, "password")?.to_string();
                expect_end(rest, TAG_CREDENTIALS)?;
                Ok(Request::Credentials { username, password })
            }
            TAG_UNLOCK => {
                let person_id = id_field(&mut rest, TAG_UNLOCK, "person id")?;
                let vehicle_id = id_field(&mut rest, TAG_UNLOCK, "vehicle id")?;
                // The begin time is everything after the ids, spaces included
                let raw_time = rest.trim();
                if raw_time.is_empty() {
                    return Err(ProtocolError::MissingField {
                        tag: TAG_UNLOCK,
                        field: "begin time",
                    });
                }
                let begin_time =
                    parse_booking_time(raw_time).ok_or_else(|| ProtocolError::InvalidField {
                        tag: TAG_UNLOCK,
                        field: "begin time",
                        value: raw_time.to_string(),
                    })?;
                Ok(Request::Unlock {
                    person_id,
                    vehicle_id,
                    begin_time,
                })
            }
            TAG_LOCK => {
                let person_id = id_field(&mut rest, TAG_LOCK, "person id")?;
                let vehicle_id = id_field(&mut rest, TAG_LOCK, "vehicle id")?;
                expect_end(rest, TAG_LOCK)?;
                Ok(Request::Lock {
                    person_id,
                    vehicle_id,
                })
            }
            TAG_BLUETOOTH => {
                expect_end(rest, TAG_BLUETOOTH)?;
                Ok(Request::Bluetooth)
            }
            other => Err(ProtocolError::UnknownTag(other.to_string())),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Request::Credentials { .. } => TAG_CREDENTIALS,
            Request::Unlock { .. } => TAG_UNLOCK,
            Request::Lock { .. } => TAG_LOCK,
            Request::Bluetooth => TAG_BLUETOOTH,
        }
    }

    /// Wire form, as a terminal sends it.
    pub fn to_wire(&self) -> String {
        match self {
            Request::Credentials { username, password } => {
                format!("{} {} {}", TAG_CREDENTIALS, username, password)
            }
            Request::Unlock {
                person_id,
                vehicle_id,
                begin_time,
            } => format!(
                "{} {} {} {}",
                TAG_UNLOCK,
                person_id,
                vehicle_id,
                format_booking_time(begin_time)
            ),
            Request::Lock {
                person_id,
                vehicle_id,
            } => format!("{} {} {}", TAG_LOCK, person_id, vehicle_id),
            Request::Bluetooth => TAG_BLUETOOTH.to_string(),
        }
    }
}

/// Reply to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    PersonId(PersonId),
    Unlocked,
    Locked,
    Devices(Vec<String>),
    Failure,
}

impl Reply {
    /// Whether the terminal will read this reply as a failure.
    pub fn is_failure(&self) -> bool {
        match self {
            Reply::Failure => true,
            Reply::Devices(devices) => devices.is_empty(),
            _ => false,
        }
    }

    pub fn to_wire(&self) -> String {
        match self {
            Reply::PersonId(id) => id.to_string(),
            Reply::Unlocked => "unlocked".to_string(),
            Reply::Locked => "locked".to_string(),
            Reply::Devices(devices) => devices.join(" "),
            Reply::Failure => String::new(),
        }
    }
}
