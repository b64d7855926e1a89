//! SQLite-based persistent storage for booking data.
//!
//! Connections come from an r2d2 pool and every statement runs on the
//! blocking thread pool, so operations on different vehicles do not queue
//! behind one another. Multi-row operations (reserve, unlock, lock, cancel)
//! each run inside a single `BEGIN IMMEDIATE` transaction, so a failure at
//! any step rolls the whole operation back.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};

use crate::store::{BookingStore, StoreError};
use crate::types::{
    format_booking_time, HistoryId, HistoryRecord, NewReservation, Person, PersonId, Reservation,
    ReservationId, ReservationQuery, Role, TrustedDevice, Vehicle, VehicleId, BOOKING_TIME_FORMAT,
};

// ============================================================================
// Schema Version
// ============================================================================

/// Current schema version for migrations.
/// Increment this when adding new migrations.
const SCHEMA_VERSION: i32 = 1;

/// Connections kept open against a database file.
pub const DEFAULT_POOL_SIZE: u32 = 8;

/// How long a writer waits for SQLite's write lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const VEHICLE_COLUMNS: &str =
    "id, make, body_type, colour, seats, location, cost_per_hour, booked, has_issue";
const RESERVATION_COLUMNS: &str = "id, person_id, vehicle_id, begin_time, return_time, ongoing";
const HISTORY_COLUMNS: &str = "id, person_id, vehicle_id, begin_time, return_time";
const PERSON_COLUMNS: &str = "id, username, password_hash, role, device_address";

// ============================================================================
// SQLite Store Implementation
// ============================================================================

/// SQLite-based persistent store implementation.
///
/// The database file is shared with the booking web service, which creates
/// vehicles, persons and reservations; the relay drives them through the
/// rental lifecycle.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` with [`DEFAULT_POOL_SIZE`]
    /// connections and run migrations.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::with_pool_size(path, DEFAULT_POOL_SIZE)
    }

    /// Open the database at `path` with `pool_size` connections.
    pub fn with_pool_size<P: AsRef<Path>>(path: P, pool_size: u32) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            // WAL lets readers run next to the writer and the web service
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
        });
        Self::from_manager(manager, pool_size)
    }

    /// Create a new in-memory SQLite store for testing.
    ///
    /// Every in-memory connection is a separate database, so the pool holds
    /// exactly one.
    pub fn new_in_memory() -> Result<Self, StoreError> {
        Self::from_manager(SqliteConnectionManager::memory(), 1)
    }

    fn from_manager(manager: SqliteConnectionManager, pool_size: u32) -> Result<Self, StoreError> {
        // Connections are never recycled: an in-memory database lives only as
        // long as its one connection
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)
            .map_err(|e| StoreError::Unavailable(format!("failed to open database: {}", e)))?;

        {
            let conn = pool
                .get()
                .map_err(|e| StoreError::Unavailable(format!("no database connection: {}", e)))?;
            Self::run_migrations(&conn)?;
        }

        Ok(Self { pool })
    }

    /// Run `f` with a pooled connection on the blocking thread pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| StoreError::Unavailable(format!("no database connection: {}", e)))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::OperationFailed(format!("database task failed: {}", e)))?
    }

    /// Run database migrations to ensure schema is up to date.
    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )
        .map_err(|e| store_err("failed to create schema_version", e))?;

        let current_version: i32 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
                row.get(0)
            })
            .map_err(|e| store_err("failed to read schema version", e))?;

        if current_version > SCHEMA_VERSION {
            return Err(StoreError::DataCorruption(format!(
                "database schema version {} is newer than supported version {}",
                current_version, SCHEMA_VERSION
            )));
        }

        if current_version < 1 {
            Self::migrate_v1(conn)?;
        }

        Ok(())
    }

    /// Migration to schema version 1 - initial schema.
    fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS vehicles (
                id INTEGER PRIMARY KEY,
                make TEXT NOT NULL,
                body_type TEXT NOT NULL,
                colour TEXT NOT NULL,
                seats INTEGER NOT NULL,
                location TEXT NOT NULL,
                cost_per_hour REAL NOT NULL,
                booked INTEGER NOT NULL DEFAULT 0,
                has_issue INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS persons (
                id INTEGER PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL,
                device_address TEXT
            );

            CREATE TABLE IF NOT EXISTS reservations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                person_id INTEGER NOT NULL,
                vehicle_id INTEGER NOT NULL,
                begin_time TEXT NOT NULL,
                return_time TEXT NOT NULL,
                ongoing INTEGER NOT NULL DEFAULT 0,
                UNIQUE(person_id, vehicle_id, begin_time)
            );
            CREATE INDEX IF NOT EXISTS idx_reservations_vehicle ON reservations(vehicle_id);
            -- At most one rental in progress per vehicle
            CREATE UNIQUE INDEX IF NOT EXISTS idx_reservations_one_ongoing
                ON reservations(vehicle_id) WHERE ongoing = 1;

            CREATE TABLE IF NOT EXISTS histories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                person_id INTEGER NOT NULL,
                vehicle_id INTEGER NOT NULL,
                begin_time TEXT NOT NULL,
                return_time TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_histories_person ON histories(person_id);

            INSERT INTO schema_version (version) VALUES (1);
            "#,
        )
        .map_err(|e| store_err("migration v1 failed", e))?;

        Ok(())
    }
}

// ============================================================================
// Error Mapping
// ============================================================================

fn store_err(context: &str, e: rusqlite::Error) -> StoreError {
    let message = format!("{}: {}", context, e);
    match &e {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::CannotOpen | ErrorCode::NotADatabase | ErrorCode::SystemIoFailure => {
                StoreError::Unavailable(message)
            }
            ErrorCode::DatabaseCorrupt => StoreError::DataCorruption(message),
            _ => StoreError::OperationFailed(message),
        },
        _ => StoreError::OperationFailed(message),
    }
}

/// Like [`store_err`], but reports uniqueness violations as conflicts. Only
/// used on statements where a constraint can fire for a booking reason.
fn conflict_aware_err(context: &str, e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            StoreError::Conflict(format!("{}: {}", context, e))
        }
        _ => store_err(context, e),
    }
}

fn parse_time(idx: usize, text: String) -> rusqlite::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(&text, BOOKING_TIME_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

// ============================================================================
// Store Trait Implementation
// ============================================================================

#[async_trait]
impl BookingStore for SqliteStore {
    // -------------------------------------------------------------------------
    // Vehicle Operations
    // -------------------------------------------------------------------------

    async fn save_vehicle(&self, vehicle: Vehicle) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO vehicles (id, make, body_type, colour, seats, location, cost_per_hour, booked, has_issue)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    make = excluded.make, body_type = excluded.body_type, colour = excluded.colour,
                    seats = excluded.seats, location = excluded.location,
                    cost_per_hour = excluded.cost_per_hour, booked = excluded.booked,
                    has_issue = excluded.has_issue",
                params![
                    vehicle.id.0,
                    vehicle.make,
                    vehicle.body_type,
                    vehicle.colour,
                    vehicle.seats,
                    vehicle.location,
                    vehicle.cost_per_hour,
                    vehicle.booked,
                    vehicle.has_issue,
                ],
            )
            .map_err(|e| store_err("failed to save vehicle", e))?;
            Ok(())
        })
        .await
    }

    async fn load_vehicle(&self, vehicle_id: VehicleId) -> Result<Option<Vehicle>, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM vehicles WHERE id = ?1", VEHICLE_COLUMNS),
                params![vehicle_id.0],
                Self::row_to_vehicle,
            )
            .optional()
            .map_err(|e| store_err("failed to load vehicle", e))
        })
        .await
    }

    async fn list_vehicles(&self, available_only: bool) -> Result<Vec<Vehicle>, StoreError> {
        self.with_conn(move |conn| {
            query_vehicles(
                conn,
                "WHERE ?1 = 0 OR (booked = 0 AND has_issue = 0)",
                params![available_only],
            )
        })
        .await
    }

    async fn report_issue(&self, vehicle_id: VehicleId) -> Result<Vehicle, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| store_err("failed to begin transaction", e))?;

            let mut vehicle = tx
                .query_row(
                    &format!("SELECT {} FROM vehicles WHERE id = ?1", VEHICLE_COLUMNS),
                    params![vehicle_id.0],
                    Self::row_to_vehicle,
                )
                .optional()
                .map_err(|e| store_err("failed to load vehicle", e))?
                .ok_or_else(|| StoreError::NotFound(format!("vehicle {}", vehicle_id)))?;
            if vehicle.has_issue {
                return Err(StoreError::Conflict(format!(
                    "vehicle {} already has a reported issue",
                    vehicle_id
                )));
            }

            tx.execute(
                "UPDATE vehicles SET has_issue = 1 WHERE id = ?1",
                params![vehicle_id.0],
            )
            .map_err(|e| store_err("failed to report issue", e))?;
            tx.commit()
                .map_err(|e| store_err("failed to commit issue report", e))?;

            vehicle.has_issue = true;
            Ok(vehicle)
        })
        .await
    }

    async fn list_vehicles_with_issues(&self) -> Result<Vec<Vehicle>, StoreError> {
        self.with_conn(|conn| query_vehicles(conn, "WHERE has_issue = 1", params![]))
            .await
    }

    // -------------------------------------------------------------------------
    // Personnel Registry
    // -------------------------------------------------------------------------

    async fn save_person(&self, person: Person) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO persons (id, username, password_hash, role, device_address)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    username = excluded.username, password_hash = excluded.password_hash,
                    role = excluded.role, device_address = excluded.device_address",
                params![
                    person.id.0,
                    person.username,
                    person.password_hash,
                    person.role.as_str(),
                    person.device_address,
                ],
            )
            .map_err(|e| match &e {
                rusqlite::Error::SqliteFailure(failure, _)
                    if failure.code == ErrorCode::ConstraintViolation =>
                {
                    StoreError::AlreadyExists(format!("username {}", person.username))
                }
                _ => store_err("failed to save person", e),
            })?;
            Ok(())
        })
        .await
    }

    async fn find_person_by_username(&self, username: &str) -> Result<Option<Person>, StoreError> {
        let username = username.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM persons WHERE username = ?1", PERSON_COLUMNS),
                params![username],
                Self::row_to_person,
            )
            .optional()
            .map_err(|e| store_err("failed to load person", e))
        })
        .await
    }

    async fn list_trusted_devices(&self) -> Result<Vec<TrustedDevice>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, device_address FROM persons
                     WHERE role = ?1 AND device_address IS NOT NULL
                     ORDER BY id",
                )
                .map_err(|e| store_err("failed to prepare query", e))?;

            let devices = stmt
                .query_map(params![Role::Engineer.as_str()], |row| {
                    Ok(TrustedDevice {
                        person_id: PersonId(row.get(0)?),
                        device_address: row.get(1)?,
                    })
                })
                .map_err(|e| store_err("failed to list trusted devices", e))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| store_err("failed to collect trusted devices", e))?;
            Ok(devices)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Reservation Operations
    // -------------------------------------------------------------------------

    async fn create_reservation(&self, new: NewReservation) -> Result<Reservation, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| store_err("failed to begin transaction", e))?;

            let flags: Option<(bool, bool)> = tx
                .query_row(
                    "SELECT booked, has_issue FROM vehicles WHERE id = ?1",
                    params![new.vehicle_id.0],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(|e| store_err("failed to load vehicle", e))?;
            let (booked, has_issue) =
                flags.ok_or_else(|| StoreError::NotFound(format!("vehicle {}", new.vehicle_id)))?;

            let begin = format_booking_time(&new.begin_time);
            let duplicate: Option<i64> = tx
                .query_row(
                    "SELECT id FROM reservations
                     WHERE person_id = ?1 AND vehicle_id = ?2 AND begin_time = ?3",
                    params![new.person_id.0, new.vehicle_id.0, begin],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| store_err("failed to check duplicate reservation", e))?;
            if duplicate.is_some() {
                return Err(StoreError::AlreadyExists(format!(
                    "reservation of vehicle {} by person {} at {}",
                    new.vehicle_id, new.person_id, begin
                )));
            }
            if booked {
                return Err(StoreError::Conflict(format!("vehicle {} is booked", new.vehicle_id)));
            }
            if has_issue {
                return Err(StoreError::Conflict(format!(
                    "vehicle {} has a reported issue",
                    new.vehicle_id
                )));
            }

            tx.execute(
                "INSERT INTO reservations (person_id, vehicle_id, begin_time, return_time, ongoing)
                 VALUES (?1, ?2, ?3, ?4, 0)",
                params![
                    new.person_id.0,
                    new.vehicle_id.0,
                    begin,
                    format_booking_time(&new.return_time),
                ],
            )
            .map_err(|e| conflict_aware_err("failed to insert reservation", e))?;
            let id = ReservationId(tx.last_insert_rowid());

            tx.execute(
                "UPDATE vehicles SET booked = 1 WHERE id = ?1",
                params![new.vehicle_id.0],
            )
            .map_err(|e| store_err("failed to mark vehicle booked", e))?;

            tx.commit()
                .map_err(|e| store_err("failed to commit reservation", e))?;

            Ok(Reservation {
                id,
                person_id: new.person_id,
                vehicle_id: new.vehicle_id,
                begin_time: new.begin_time,
                return_time: new.return_time,
                ongoing: false,
            })
        })
        .await
    }

    async fn find_reservation(
        &self,
        query: &ReservationQuery,
    ) -> Result<Option<Reservation>, StoreError> {
        Ok(self.list_reservations(query).await?.into_iter().next())
    }

    async fn list_reservations(
        &self,
        query: &ReservationQuery,
    ) -> Result<Vec<Reservation>, StoreError> {
        let query = query.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM reservations
                     WHERE (?1 IS NULL OR person_id = ?1)
                       AND (?2 IS NULL OR vehicle_id = ?2)
                       AND (?3 IS NULL OR begin_time = ?3)
                       AND (?4 IS NULL OR ongoing = ?4)
                     ORDER BY id",
                    RESERVATION_COLUMNS
                ))
                .map_err(|e| store_err("failed to prepare query", e))?;

            let reservations = stmt
                .query_map(
                    params![
                        query.person_id.map(|p| p.0),
                        query.vehicle_id.map(|v| v.0),
                        query.begin_time.as_ref().map(format_booking_time),
                        query.ongoing,
                    ],
                    Self::row_to_reservation,
                )
                .map_err(|e| store_err("failed to list reservations", e))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| store_err("failed to collect reservations", e))?;
            Ok(reservations)
        })
        .await
    }

    async fn transition_to_active(&self, reservation_id: ReservationId) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| store_err("failed to begin transaction", e))?;

            let row: Option<(i64, bool)> = tx
                .query_row(
                    "SELECT vehicle_id, ongoing FROM reservations WHERE id = ?1",
                    params![reservation_id.0],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(|e| store_err("failed to load reservation", e))?;
            let (vehicle_id, ongoing) = row
                .ok_or_else(|| StoreError::NotFound(format!("reservation {}", reservation_id)))?;
            if ongoing {
                return Ok(());
            }

            let other: Option<i64> = tx
                .query_row(
                    "SELECT id FROM reservations WHERE vehicle_id = ?1 AND ongoing = 1 AND id != ?2",
                    params![vehicle_id, reservation_id.0],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| store_err("failed to check ongoing rentals", e))?;
            if other.is_some() {
                return Err(StoreError::Conflict(format!(
                    "vehicle {} already has an ongoing rental",
                    vehicle_id
                )));
            }

            tx.execute(
                "UPDATE reservations SET ongoing = 1 WHERE id = ?1",
                params![reservation_id.0],
            )
            .map_err(|e| conflict_aware_err("failed to activate reservation", e))?;

            tx.commit()
                .map_err(|e| store_err("failed to commit activation", e))?;
            Ok(())
        })
        .await
    }

    async fn complete_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<HistoryRecord, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| store_err("failed to begin transaction", e))?;

            let reservation = tx
                .query_row(
                    &format!("SELECT {} FROM reservations WHERE id = ?1", RESERVATION_COLUMNS),
                    params![reservation_id.0],
                    Self::row_to_reservation,
                )
                .optional()
                .map_err(|e| store_err("failed to load reservation", e))?
                .ok_or_else(|| StoreError::NotFound(format!("reservation {}", reservation_id)))?;
            if !reservation.ongoing {
                return Err(StoreError::Conflict(format!(
                    "reservation {} is not ongoing",
                    reservation_id
                )));
            }

            tx.execute(
                "INSERT INTO histories (person_id, vehicle_id, begin_time, return_time)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    reservation.person_id.0,
                    reservation.vehicle_id.0,
                    format_booking_time(&reservation.begin_time),
                    format_booking_time(&reservation.return_time),
                ],
            )
            .map_err(|e| store_err("failed to record history", e))?;
            let history_id = HistoryId(tx.last_insert_rowid());

            tx.execute(
                "DELETE FROM reservations WHERE id = ?1",
                params![reservation_id.0],
            )
            .map_err(|e| store_err("failed to delete reservation", e))?;

            let updated = tx
                .execute(
                    "UPDATE vehicles SET booked = 0 WHERE id = ?1",
                    params![reservation.vehicle_id.0],
                )
                .map_err(|e| store_err("failed to release vehicle", e))?;
            if updated == 0 {
                return Err(StoreError::DataCorruption(format!(
                    "reservation {} references missing vehicle {}",
                    reservation_id, reservation.vehicle_id
                )));
            }

            tx.commit()
                .map_err(|e| store_err("failed to commit completion", e))?;

            Ok(HistoryRecord {
                id: history_id,
                person_id: reservation.person_id,
                vehicle_id: reservation.vehicle_id,
                begin_time: reservation.begin_time,
                return_time: reservation.return_time,
            })
        })
        .await
    }

    async fn cancel_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Reservation, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| store_err("failed to begin transaction", e))?;

            let reservation = tx
                .query_row(
                    &format!("SELECT {} FROM reservations WHERE id = ?1", RESERVATION_COLUMNS),
                    params![reservation_id.0],
                    Self::row_to_reservation,
                )
                .optional()
                .map_err(|e| store_err("failed to load reservation", e))?
                .ok_or_else(|| StoreError::NotFound(format!("reservation {}", reservation_id)))?;
            if reservation.ongoing {
                return Err(StoreError::Conflict(format!(
                    "reservation {} is an ongoing rental",
                    reservation_id
                )));
            }

            tx.execute(
                "DELETE FROM reservations WHERE id = ?1",
                params![reservation_id.0],
            )
            .map_err(|e| store_err("failed to delete reservation", e))?;
            tx.execute(
                "UPDATE vehicles SET booked = 0 WHERE id = ?1",
                params![reservation.vehicle_id.0],
            )
            .map_err(|e| store_err("failed to release vehicle", e))?;

            tx.commit()
                .map_err(|e| store_err("failed to commit cancellation", e))?;
            Ok(reservation)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // History
    // -------------------------------------------------------------------------

    async fn list_history(
        &self,
        person_id: Option<PersonId>,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM histories WHERE (?1 IS NULL OR person_id = ?1) ORDER BY id",
                    HISTORY_COLUMNS
                ))
                .map_err(|e| store_err("failed to prepare query", e))?;

            let history = stmt
                .query_map(params![person_id.map(|p| p.0)], Self::row_to_history)
                .map_err(|e| store_err("failed to list history", e))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| store_err("failed to collect history", e))?;
            Ok(history)
        })
        .await
    }
}

fn query_vehicles<P: rusqlite::Params>(
    conn: &Connection,
    filter: &str,
    params: P,
) -> Result<Vec<Vehicle>, StoreError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM vehicles {} ORDER BY id",
            VEHICLE_COLUMNS, filter
        ))
        .map_err(|e| store_err("failed to prepare query", e))?;

    let vehicles = stmt
        .query_map(params, SqliteStore::row_to_vehicle)
        .map_err(|e| store_err("failed to list vehicles", e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| store_err("failed to collect vehicles", e))?;
    Ok(vehicles)
}

// ============================================================================
// Helper Methods for Row Conversion
// ============================================================================

impl SqliteStore {
    fn row_to_vehicle(row: &Row) -> rusqlite::Result<Vehicle> {
        Ok(Vehicle {
            id: VehicleId(row.get(0)?),
            make: row.get(1)?,
            body_type: row.get(2)?,
            colour: row.get(3)?,
            seats: row.get(4)?,
            location: row.get(5)?,
            cost_per_hour: row.get(6)?,
            booked: row.get(7)?,
            has_issue: row.get(8)?,
        })
    }

    fn row_to_reservation(row: &Row) -> rusqlite::Result<Reservation> {
        Ok(Reservation {
            id: ReservationId(row.get(0)?),
            person_id: PersonId(row.get(1)?),
            vehicle_id: VehicleId(row.get(2)?),
            begin_time: parse_time(3, row.get(3)?)?,
            return_time: parse_time(4, row.get(4)?)?,
            ongoing: row.get(5)?,
        })
    }

    fn row_to_history(row: &Row) -> rusqlite::Result<HistoryRecord> {
        Ok(HistoryRecord {
            id: HistoryId(row.get(0)?),
            person_id: PersonId(row.get(1)?),
            vehicle_id: VehicleId(row.get(2)?),
            begin_time: parse_time(3, row.get(3)?)?,
            return_time: parse_time(4, row.get(4)?)?,
        })
    }

    fn row_to_person(row: &Row) -> rusqlite::Result<Person> {
        let role: String = row.get(3)?;
        let role = role.parse::<Role>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, Type::Text, e.into())
        })?;
        Ok(Person {
            id: PersonId(row.get(0)?),
            username: row.get(1)?,
            password_hash: row.get(2)?,
            role,
            device_address: row.get(4)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::booking::BookingService;
    use crate::errors::BookingError;
    use crate::types::parse_booking_time;

    fn make_test_vehicle(id: i64) -> Vehicle {
        Vehicle {
            id: VehicleId(id),
            make: "Mazda".into(),
            body_type: "Hatchback".into(),
            colour: "Red".into(),
            seats: 5,
            location: "-37.8136, 144.9631".into(),
            cost_per_hour: 9.0,
            booked: false,
            has_issue: false,
        }
    }

    fn make_new_reservation(person: i64, vehicle: i64, begin: &str) -> NewReservation {
        let begin_time = parse_booking_time(begin).unwrap();
        NewReservation {
            person_id: PersonId(person),
            vehicle_id: VehicleId(vehicle),
            begin_time,
            return_time: begin_time + chrono::Duration::hours(3),
        }
    }

    async fn inject_sql(store: &SqliteStore, sql: &str) {
        let sql = sql.to_string();
        store
            .with_conn(move |conn| {
                conn.execute_batch(&sql)
                    .map_err(|e| store_err("injected sql failed", e))
            })
            .await
            .unwrap();
    }

    // -------------------------------------------------------------------------
    // Vehicle & Person Tests
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_sqlite_vehicle_save_and_load() {
        let store = SqliteStore::new_in_memory().unwrap();
        store.save_vehicle(make_test_vehicle(1)).await.unwrap();

        let mut updated = make_test_vehicle(1);
        updated.colour = "Blue".into();
        store.save_vehicle(updated).await.unwrap();

        let loaded = store.load_vehicle(VehicleId(1)).await.unwrap().unwrap();
        assert_eq!(loaded.colour, "Blue");
        assert_eq!(store.list_vehicles(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_person_roundtrip_and_trusted_devices() {
        let store = SqliteStore::new_in_memory().unwrap();
        store
            .save_person(Person {
                id: PersonId(3),
                username: "eve".into(),
                password_hash: "$argon2id$v=19$m=8,t=1,p=1$c2FsdHNhbHQ$aGFzaA".into(),
                role: Role::Engineer,
                device_address: Some("B8:27:EB:00:00:01".into()),
            })
            .await
            .unwrap();

        let eve = store.find_person_by_username("eve").await.unwrap().unwrap();
        assert_eq!(eve.role, Role::Engineer);
        assert!(store.find_person_by_username("nobody").await.unwrap().is_none());

        let devices = store.list_trusted_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_address, "B8:27:EB:00:00:01");
    }

    #[tokio::test]
    async fn test_sqlite_duplicate_username() {
        let store = SqliteStore::new_in_memory().unwrap();
        let person = |id: i64| Person {
            id: PersonId(id),
            username: "bob".into(),
            password_hash: String::new(),
            role: Role::Customer,
            device_address: None,
        };
        store.save_person(person(1)).await.unwrap();
        let result = store.save_person(person(2)).await;
        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
    }

    // -------------------------------------------------------------------------
    // Reservation Tests
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_sqlite_reservation_lifecycle() {
        let store = SqliteStore::new_in_memory().unwrap();
        store.save_vehicle(make_test_vehicle(1)).await.unwrap();

        let r = store
            .create_reservation(make_new_reservation(5, 1, "2020-05-02 10:00:00"))
            .await
            .unwrap();
        assert!(store.load_vehicle(VehicleId(1)).await.unwrap().unwrap().booked);

        let found = store
            .find_reservation(&ReservationQuery::booking(PersonId(5), VehicleId(1), r.begin_time))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, r);

        store.transition_to_active(r.id).await.unwrap();
        // Idempotent
        store.transition_to_active(r.id).await.unwrap();

        let record = store.complete_reservation(r.id).await.unwrap();
        assert_eq!(record.begin_time, r.begin_time);
        assert_eq!(record.return_time, r.return_time);
        assert!(store.list_reservations(&ReservationQuery::default()).await.unwrap().is_empty());
        assert!(!store.load_vehicle(VehicleId(1)).await.unwrap().unwrap().booked);
        assert_eq!(store.list_history(None).await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn test_sqlite_reservation_conflicts() {
        let store = SqliteStore::new_in_memory().unwrap();
        store.save_vehicle(make_test_vehicle(1)).await.unwrap();

        let first = store
            .create_reservation(make_new_reservation(5, 1, "2020-05-02 10:00:00"))
            .await
            .unwrap();
        let booked = store
            .create_reservation(make_new_reservation(6, 1, "2020-05-04 10:00:00"))
            .await;
        assert!(matches!(booked, Err(StoreError::Conflict(_))));

        let duplicate = store
            .create_reservation(make_new_reservation(5, 1, "2020-05-02 10:00:00"))
            .await;
        assert!(matches!(duplicate, Err(StoreError::AlreadyExists(_))));

        // Overlap written behind the store's back
        store.save_vehicle(make_test_vehicle(1)).await.unwrap();
        let second = store
            .create_reservation(make_new_reservation(6, 1, "2020-05-04 10:00:00"))
            .await
            .unwrap();
        store.transition_to_active(first.id).await.unwrap();
        let result = store.transition_to_active(second.id).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_sqlite_cancel() {
        let store = SqliteStore::new_in_memory().unwrap();
        store.save_vehicle(make_test_vehicle(1)).await.unwrap();
        let r = store
            .create_reservation(make_new_reservation(5, 1, "2020-05-02 10:00:00"))
            .await
            .unwrap();

        store.cancel_reservation(r.id).await.unwrap();
        assert!(!store.load_vehicle(VehicleId(1)).await.unwrap().unwrap().booked);
        assert!(matches!(
            store.cancel_reservation(r.id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sqlite_completion_rolls_back_on_failure() {
        let store = SqliteStore::new_in_memory().unwrap();
        store.save_vehicle(make_test_vehicle(1)).await.unwrap();
        let r = store
            .create_reservation(make_new_reservation(5, 1, "2020-05-02 10:00:00"))
            .await
            .unwrap();
        store.transition_to_active(r.id).await.unwrap();

        // Fail the last step of the group, after history insert and delete
        inject_sql(
            &store,
            "CREATE TRIGGER fail_release BEFORE UPDATE ON vehicles
             BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
        )
        .await;

        let result = store.complete_reservation(r.id).await;
        assert!(matches!(result, Err(StoreError::OperationFailed(_))));

        assert!(store.list_history(None).await.unwrap().is_empty());
        let still_there = store
            .find_reservation(&ReservationQuery::active(PersonId(5), VehicleId(1)))
            .await
            .unwrap();
        assert_eq!(still_there.map(|x| x.id), Some(r.id));
        assert!(store.load_vehicle(VehicleId(1)).await.unwrap().unwrap().booked);
    }

    #[tokio::test]
    async fn test_lock_surfaces_storage_error_without_partial_writes() {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        store.save_vehicle(make_test_vehicle(1)).await.unwrap();
        let service = BookingService::new(store.clone());

        let begin = parse_booking_time("2020-05-02 10:00:00").unwrap();
        service
            .reserve(make_new_reservation(5, 1, "2020-05-02 10:00:00"))
            .await
            .unwrap();
        service.unlock(PersonId(5), VehicleId(1), begin).await.unwrap();

        inject_sql(
            &store,
            "CREATE TRIGGER fail_delete BEFORE DELETE ON reservations
             BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
        )
        .await;

        let result = service.lock(PersonId(5), VehicleId(1)).await;
        assert!(matches!(result, Err(BookingError::Storage(_))));
        assert!(store.list_history(None).await.unwrap().is_empty());
        assert_eq!(
            store.list_reservations(&ReservationQuery::default()).await.unwrap().len(),
            1
        );

        // Once the fault clears the same lock goes through
        inject_sql(&store, "DROP TRIGGER fail_delete;").await;
        let record = service.lock(PersonId(5), VehicleId(1)).await.unwrap();
        assert_eq!(record.begin_time, begin);
    }

    #[tokio::test]
    async fn test_sqlite_report_issue() {
        let store = SqliteStore::new_in_memory().unwrap();
        store.save_vehicle(make_test_vehicle(1)).await.unwrap();
        store.save_vehicle(make_test_vehicle(2)).await.unwrap();

        let reported = store.report_issue(VehicleId(2)).await.unwrap();
        assert!(reported.has_issue);
        assert!(matches!(
            store.report_issue(VehicleId(2)).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            store.report_issue(VehicleId(9)).await,
            Err(StoreError::NotFound(_))
        ));

        let with_issues = store.list_vehicles_with_issues().await.unwrap();
        assert_eq!(with_issues.iter().map(|v| v.id).collect::<Vec<_>>(), vec![VehicleId(2)]);
        let available = store.list_vehicles(true).await.unwrap();
        assert_eq!(available.iter().map(|v| v.id).collect::<Vec<_>>(), vec![VehicleId(1)]);

        let refused = store
            .create_reservation(make_new_reservation(5, 2, "2020-05-02 10:00:00"))
            .await;
        assert!(matches!(refused, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_sqlite_reads_proceed_while_a_write_is_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("carshare.db")).unwrap();
        store.save_vehicle(make_test_vehicle(1)).await.unwrap();

        // Hold the database write lock on one pooled connection
        let writer = store.pool.get().unwrap();
        writer
            .execute_batch("BEGIN IMMEDIATE; UPDATE vehicles SET colour = 'Green' WHERE id = 1;")
            .unwrap();

        let loaded = tokio::time::timeout(
            Duration::from_secs(2),
            store.load_vehicle(VehicleId(1)),
        )
        .await
        .expect("read blocked behind the open write")
        .unwrap()
        .unwrap();
        assert_eq!(loaded.colour, "Red");

        writer.execute_batch("COMMIT;").unwrap();
        drop(writer);
        let loaded = store.load_vehicle(VehicleId(1)).await.unwrap().unwrap();
        assert_eq!(loaded.colour, "Green");
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("carshare.db");

        {
            let store = SqliteStore::new(&path).unwrap();
            store.save_vehicle(make_test_vehicle(4)).await.unwrap();
            store
                .create_reservation(make_new_reservation(5, 4, "2020-05-02 10:00"))
                .await
                .unwrap();
        }

        let store = SqliteStore::new(&path).unwrap();
        assert!(store.load_vehicle(VehicleId(4)).await.unwrap().unwrap().booked);
        assert_eq!(
            store.list_reservations(&ReservationQuery::default()).await.unwrap().len(),
            1
        );
    }
}
