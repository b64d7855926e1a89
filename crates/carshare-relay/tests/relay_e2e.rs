//! End-to-end tests: a real relay on a loopback socket, driven by the
//! terminal client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use carshare_core::harness::{make_test_person, seed_fleet};
use carshare_core::types::{
    parse_booking_time, HistoryRecord, NewReservation, Person, PersonId, Reservation,
    ReservationId, ReservationQuery, Role, TrustedDevice, Vehicle, VehicleId,
};
use carshare_core::{BookingStore, InMemoryStore, StoreError};
use carshare_relay::framing::FramingMode;
use carshare_relay::metrics::RelayMetrics;
use carshare_relay::{RelayConfig, RelayServer, ShutdownHandle, TerminalClient};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

struct TestRelay {
    addr: SocketAddr,
    store: Arc<InMemoryStore>,
    metrics: Arc<RelayMetrics>,
    shutdown: ShutdownHandle,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestRelay {
    fn client(&self, mode: FramingMode) -> TerminalClient {
        TerminalClient::new(self.addr, mode, 4096).with_timeout(Duration::from_secs(5))
    }

    async fn stop(self) {
        self.shutdown.shutdown();
        self.task.await.unwrap().unwrap();
    }
}

fn relay_config(framing: FramingMode, max_message_size: usize) -> RelayConfig {
    RelayConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        framing,
        max_message_size,
        request_timeout_secs: 5,
        shutdown_timeout_secs: 5,
        ..RelayConfig::default()
    }
}

async fn seeded_store() -> Arc<InMemoryStore> {
    let store = InMemoryStore::new_shared();
    seed_fleet(store.as_ref(), 3).await.unwrap();
    store
        .save_person(make_test_person(5, "bob", "secret", Role::Customer, None))
        .await
        .unwrap();
    store
}

async fn start_relay(framing: FramingMode, max_message_size: usize) -> TestRelay {
    let store = seeded_store().await;
    start_relay_over(relay_config(framing, max_message_size), store.clone(), store).await
}

/// Start a relay whose dispatcher runs on `backing`; `store` is what the
/// test inspects afterwards.
async fn start_relay_over<S: BookingStore + 'static>(
    config: RelayConfig,
    store: Arc<InMemoryStore>,
    backing: Arc<S>,
) -> TestRelay {
    let server = RelayServer::with_store(config, backing).await.unwrap();
    let addr = server.local_addr().unwrap();
    let metrics = server.metrics();
    let shutdown = server.shutdown_handle();
    let task = tokio::spawn(server.run());

    TestRelay {
        addr,
        store,
        metrics,
        shutdown,
        task,
    }
}

async fn reserve(store: &InMemoryStore, person: i64, vehicle: i64, begin: &str) {
    let begin = parse_booking_time(begin).unwrap();
    store
        .create_reservation(NewReservation {
            person_id: PersonId(person),
            vehicle_id: VehicleId(vehicle),
            begin_time: begin,
            return_time: begin + chrono::Duration::hours(2),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_credentials_known_and_unknown_user() {
    let relay = start_relay(FramingMode::Raw, 4096).await;
    let client = relay.client(FramingMode::Raw);

    assert_eq!(
        client.send_raw("credentials bob secret").await.unwrap().as_deref(),
        Some("5")
    );
    assert_eq!(client.credentials("bob", "secret").await.unwrap(), Some(PersonId(5)));
    assert_eq!(client.credentials("bob", "wrong").await.unwrap(), None);
    assert_eq!(client.credentials("carol", "secret").await.unwrap(), None);

    relay.stop().await;
}

#[tokio::test]
async fn test_bluetooth_roster() {
    let relay = start_relay(FramingMode::Raw, 4096).await;
    let client = relay.client(FramingMode::Raw);

    assert_eq!(client.send_raw("bluetooth").await.unwrap(), None);
    assert!(client.trusted_devices().await.unwrap().is_empty());

    for (id, addr) in [(20, "B8:27:EB:00:00:01"), (21, "B8:27:EB:00:00:02")] {
        relay
            .store
            .save_person(make_test_person(id, &format!("eng{}", id), "x", Role::Engineer, Some(addr)))
            .await
            .unwrap();
    }

    let raw = client.send_raw("bluetooth").await.unwrap().unwrap();
    let mut listed: Vec<&str> = raw.split(' ').collect();
    listed.sort_unstable();
    assert_eq!(listed, vec!["B8:27:EB:00:00:01", "B8:27:EB:00:00:02"]);

    relay.stop().await;
}

#[tokio::test]
async fn test_unlock_lock_round_trip() {
    let relay = start_relay(FramingMode::Raw, 4096).await;
    reserve(&relay.store, 5, 3, "2020-05-02 10:00:00").await;
    let client = relay.client(FramingMode::Raw);
    let begin = parse_booking_time("2020-05-02 10:00:00").unwrap();

    assert_eq!(
        client.send_raw("unlock 5 3 2020-05-02 11:00:00").await.unwrap(),
        None
    );
    assert_eq!(
        client.send_raw("unlock 5 3 2020-05-02 10:00:00").await.unwrap().as_deref(),
        Some("unlocked")
    );
    // Repeat unlock of the same rental is accepted
    assert!(client.unlock(PersonId(5), VehicleId(3), begin).await.unwrap());

    assert!(client.lock(PersonId(5), VehicleId(3)).await.unwrap());
    assert!(!client.lock(PersonId(5), VehicleId(3)).await.unwrap());

    let history = relay.store.list_history(Some(PersonId(5))).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].begin_time, begin);
    let vehicle = relay.store.load_vehicle(VehicleId(3)).await.unwrap().unwrap();
    assert!(!vehicle.booked);

    relay.stop().await;
}

#[tokio::test]
async fn test_unknown_tag_closes_without_reply() {
    let relay = start_relay(FramingMode::Raw, 4096).await;
    let client = relay.client(FramingMode::Raw);

    assert_eq!(client.send_raw("honk 3").await.unwrap(), None);
    assert_eq!(client.send_raw("lock five 3").await.unwrap(), None);
    assert_eq!(relay.metrics.protocol_errors(), 2);

    relay.stop().await;
}

#[tokio::test]
async fn test_oversize_request_rejected() {
    let relay = start_relay(FramingMode::Raw, 64).await;

    let mut stream = TcpStream::connect(relay.addr).await.unwrap();
    let message = format!("credentials bob {}", "x".repeat(200));
    stream.write_all(message.as_bytes()).await.unwrap();

    let mut reply = Vec::new();
    // The relay may reset instead of closing cleanly; either way nothing comes back
    let _ = stream.read_to_end(&mut reply).await;
    assert!(reply.is_empty());
    assert_eq!(relay.metrics.protocol_errors(), 1);

    relay.stop().await;
}

#[tokio::test]
async fn test_empty_connection_gets_no_reply() {
    let relay = start_relay(FramingMode::Raw, 4096).await;

    let mut stream = TcpStream::connect(relay.addr).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert!(reply.is_empty());
    assert_eq!(relay.metrics.protocol_errors(), 0);

    relay.stop().await;
}

#[tokio::test]
async fn test_length_framing_flow() {
    let relay = start_relay(FramingMode::Length, 4096).await;
    reserve(&relay.store, 5, 1, "2020-05-02 10:00").await;
    let client = relay.client(FramingMode::Length);
    let begin = parse_booking_time("2020-05-02 10:00").unwrap();

    assert_eq!(client.credentials("bob", "secret").await.unwrap(), Some(PersonId(5)));
    assert!(client.unlock(PersonId(5), VehicleId(1), begin).await.unwrap());
    assert!(client.lock(PersonId(5), VehicleId(1)).await.unwrap());
    assert!(client.trusted_devices().await.unwrap().is_empty());

    relay.stop().await;
}

#[tokio::test]
async fn test_concurrent_terminals() {
    let relay = start_relay(FramingMode::Raw, 4096).await;
    for v in 1..=3 {
        reserve(&relay.store, v, v, "2020-05-02 10:00:00").await;
    }
    let begin = parse_booking_time("2020-05-02 10:00:00").unwrap();

    let tasks: Vec<_> = (1..=3)
        .map(|v| {
            let client = relay.client(FramingMode::Raw);
            tokio::spawn(async move {
                let unlocked = client.unlock(PersonId(v), VehicleId(v), begin).await.unwrap();
                let locked = client.lock(PersonId(v), VehicleId(v)).await.unwrap();
                unlocked && locked
            })
        })
        .collect();

    for task in tasks {
        assert!(task.await.unwrap());
    }
    assert_eq!(relay.store.list_history(None).await.unwrap().len(), 3);

    relay.stop().await;
}

/// Wait until `condition` holds; metrics are recorded just after the relay
/// closes the socket, so the client can observe the close first.
async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

#[tokio::test]
async fn test_half_closed_terminals_still_get_replies() {
    let relay = start_relay(FramingMode::Raw, 4096).await;

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let addr = relay.addr;
            tokio::spawn(async move {
                let mut stream = TcpStream::connect(addr).await.unwrap();
                stream.write_all(b"credentials bob secret").await.unwrap();
                stream.shutdown().await.unwrap();
                let mut reply = String::new();
                stream.read_to_string(&mut reply).await.unwrap();
                reply
            })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap(), "5");
    }
    assert_eq!(relay.metrics.requests("credentials"), 20);
    assert_eq!(relay.metrics.abandoned_requests(), 0);

    relay.stop().await;
}

#[tokio::test]
async fn test_oversize_request_split_across_writes_rejected() {
    let store = seeded_store().await;
    let config = RelayConfig {
        raw_idle_timeout_ms: 1000,
        ..relay_config(FramingMode::Raw, 64)
    };
    let relay = start_relay_over(config, store.clone(), store).await;

    let mut stream = TcpStream::connect(relay.addr).await.unwrap();
    stream.write_all(b"credentials bob secret").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    // The relay may already have hung up once it saw 65 bytes
    let _ = stream.write_all(&[b'x'; 101]).await;
    let _ = stream.shutdown().await;

    let mut reply = Vec::new();
    let _ = stream.read_to_end(&mut reply).await;
    assert!(reply.is_empty());
    eventually(|| relay.metrics.protocol_errors() == 1).await;
    assert_eq!(relay.metrics.requests("credentials"), 0);

    relay.stop().await;
}

#[tokio::test]
async fn test_stalled_terminal_counts_as_handler_error() {
    let store = seeded_store().await;
    let config = RelayConfig {
        request_timeout_secs: 1,
        ..relay_config(FramingMode::Raw, 4096)
    };
    let relay = start_relay_over(config, store.clone(), store).await;

    // Connect and never send anything
    let mut stream = TcpStream::connect(relay.addr).await.unwrap();
    let mut reply = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut reply)).await;
    assert!(closed.is_ok(), "relay kept a silent connection open");
    assert!(reply.is_empty());

    eventually(|| relay.metrics.handler_errors() == 1).await;
    assert_eq!(relay.metrics.protocol_errors(), 0);
    eventually(|| relay.metrics.active_connections() == 0).await;

    relay.stop().await;
}

/// Store whose logins never finish; signals when one has started.
struct StuckLogins {
    inner: Arc<InMemoryStore>,
    entered: Arc<Notify>,
}

#[async_trait]
impl BookingStore for StuckLogins {
    async fn save_vehicle(&self, vehicle: Vehicle) -> Result<(), StoreError> {
        self.inner.save_vehicle(vehicle).await
    }

    async fn load_vehicle(&self, vehicle_id: VehicleId) -> Result<Option<Vehicle>, StoreError> {
        self.inner.load_vehicle(vehicle_id).await
    }

    async fn list_vehicles(&self, available_only: bool) -> Result<Vec<Vehicle>, StoreError> {
        self.inner.list_vehicles(available_only).await
    }

    async fn report_issue(&self, vehicle_id: VehicleId) -> Result<Vehicle, StoreError> {
        self.inner.report_issue(vehicle_id).await
    }

    async fn list_vehicles_with_issues(&self) -> Result<Vec<Vehicle>, StoreError> {
        self.inner.list_vehicles_with_issues().await
    }

    async fn save_person(&self, person: Person) -> Result<(), StoreError> {
        self.inner.save_person(person).await
    }

    async fn find_person_by_username(&self, _username: &str) -> Result<Option<Person>, StoreError> {
        self.entered.notify_one();
        std::future::pending().await
    }

    async fn list_trusted_devices(&self) -> Result<Vec<TrustedDevice>, StoreError> {
        self.inner.list_trusted_devices().await
    }

    async fn create_reservation(&self, new: NewReservation) -> Result<Reservation, StoreError> {
        self.inner.create_reservation(new).await
    }

    async fn find_reservation(
        &self,
        query: &ReservationQuery,
    ) -> Result<Option<Reservation>, StoreError> {
        self.inner.find_reservation(query).await
    }

    async fn list_reservations(
        &self,
        query: &ReservationQuery,
    ) -> Result<Vec<Reservation>, StoreError> {
        self.inner.list_reservations(query).await
    }

    async fn transition_to_active(&self, reservation_id: ReservationId) -> Result<(), StoreError> {
        self.inner.transition_to_active(reservation_id).await
    }

    async fn complete_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<HistoryRecord, StoreError> {
        self.inner.complete_reservation(reservation_id).await
    }

    async fn cancel_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Reservation, StoreError> {
        self.inner.cancel_reservation(reservation_id).await
    }

    async fn list_history(
        &self,
        person_id: Option<PersonId>,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        self.inner.list_history(person_id).await
    }
}

#[tokio::test]
async fn test_terminal_reset_mid_dispatch_abandons_request() {
    let store = seeded_store().await;
    let entered = Arc::new(Notify::new());
    let backing = Arc::new(StuckLogins {
        inner: store.clone(),
        entered: entered.clone(),
    });
    let relay = start_relay_over(relay_config(FramingMode::Raw, 4096), store, backing).await;

    let mut stream = TcpStream::connect(relay.addr).await.unwrap();
    stream.write_all(b"credentials bob secret").await.unwrap();
    entered.notified().await;

    // Zero linger turns the close into a reset
    stream.set_linger(Some(Duration::ZERO)).unwrap();
    drop(stream);

    eventually(|| relay.metrics.abandoned_requests() == 1).await;
    eventually(|| relay.metrics.active_connections() == 0).await;
    assert_eq!(relay.metrics.requests("credentials"), 0);
    assert_eq!(relay.metrics.handler_errors(), 0);

    relay.stop().await;
}
