//! Admin API for fleet and rental queries

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, put, Router},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use carshare_core::types::{HistoryRecord, PersonId, Vehicle, VehicleId};
use carshare_core::{BookingError, BookingService, BookingStore};

use crate::metrics::RelayMetrics;

#[derive(Clone)]
pub struct AdminState {
    pub booking: Arc<BookingService<dyn BookingStore>>,
    pub metrics: Arc<RelayMetrics>,
    pub admin_token: String,
}

/// Admin API server
pub struct AdminApi {
    state: AdminState,
}

impl AdminApi {
    pub fn new(
        booking: Arc<BookingService<dyn BookingStore>>,
        metrics: Arc<RelayMetrics>,
        admin_token: String,
    ) -> Self {
        Self {
            state: AdminState {
                booking,
                metrics,
                admin_token,
            },
        }
    }

    /// Create admin API router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/admin/history", get(list_history))
            .route("/admin/history/:person_id", get(person_history))
            .route("/admin/vehicles", get(list_vehicles))
            .route("/admin/vehicles/issues", get(list_vehicles_with_issues))
            .route("/admin/vehicles/:vehicle_id/issue", put(report_issue))
            .route("/admin/stats", get(get_stats))
            .with_state(self.state.clone())
    }
}

/// Check admin authentication
fn check_auth(headers: &HeaderMap, expected_token: &str) -> bool {
    let auth_header = headers.get("authorization");
    let token = auth_header
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .unwrap_or("");

    !token.is_empty() && token == expected_token
}

fn authorize(headers: &HeaderMap, state: &AdminState) -> Result<(), StatusCode> {
    if check_auth(headers, &state.admin_token) {
        Ok(())
    } else {
        warn!("Admin API authentication failed");
        Err(StatusCode::UNAUTHORIZED)
    }
}

fn internal_error(e: BookingError) -> StatusCode {
    error!("Admin API query failed: {}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}

/// List all completed rentals
async fn list_history(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> Result<Json<HistoryResponse>, StatusCode> {
    authorize(&headers, &state)?;
    let history = state.booking.history(None).await.map_err(internal_error)?;

    info!("Admin API: List history ({} records)", history.len());
    Ok(Json(HistoryResponse::from(history)))
}

/// List completed rentals of one person
async fn person_history(
    State(state): State<AdminState>,
    Path(person_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<HistoryResponse>, StatusCode> {
    authorize(&headers, &state)?;
    let history = state
        .booking
        .history(Some(PersonId(person_id)))
        .await
        .map_err(internal_error)?;

    info!("Admin API: History of person {} ({} records)", person_id, history.len());
    Ok(Json(HistoryResponse::from(history)))
}

#[derive(Debug, Default, Deserialize)]
pub struct VehicleFilter {
    #[serde(default)]
    pub available: bool,
}

/// List vehicles, optionally only those free to book
async fn list_vehicles(
    State(state): State<AdminState>,
    Query(filter): Query<VehicleFilter>,
    headers: HeaderMap,
) -> Result<Json<VehiclesResponse>, StatusCode> {
    authorize(&headers, &state)?;
    let vehicles = if filter.available {
        state.booking.available_vehicles().await
    } else {
        state
            .booking
            .store()
            .list_vehicles(false)
            .await
            .map_err(BookingError::from)
    }
    .map_err(internal_error)?;

    let total = vehicles.len();
    Ok(Json(VehiclesResponse { vehicles, total }))
}

/// Engineer work queue: vehicles with a reported issue
async fn list_vehicles_with_issues(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> Result<Json<VehiclesResponse>, StatusCode> {
    authorize(&headers, &state)?;
    let vehicles = state
        .booking
        .vehicles_with_issues()
        .await
        .map_err(internal_error)?;

    let total = vehicles.len();
    Ok(Json(VehiclesResponse { vehicles, total }))
}

/// Report an issue with a vehicle
async fn report_issue(
    State(state): State<AdminState>,
    Path(vehicle_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Vehicle>, StatusCode> {
    authorize(&headers, &state)?;
    match state.booking.report_issue(VehicleId(vehicle_id)).await {
        Ok(vehicle) => {
            info!("Admin API: Issue reported for vehicle {}", vehicle_id);
            Ok(Json(vehicle))
        }
        Err(BookingError::NotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(BookingError::Rejected(reason)) => {
            warn!("Admin API: Issue report refused: {}", reason);
            Err(StatusCode::CONFLICT)
        }
        Err(e) => Err(internal_error(e)),
    }
}

/// Get relay statistics
async fn get_stats(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> Result<Json<RelayStats>, StatusCode> {
    authorize(&headers, &state)?;

    Ok(Json(RelayStats {
        active_connections: state.metrics.active_connections(),
        total_connections: state.metrics.total_connections(),
        protocol_errors: state.metrics.protocol_errors(),
        uptime_seconds: state.metrics.uptime().as_secs(),
    }))
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub history: Vec<HistoryRecord>,
    pub total: usize,
}

impl From<Vec<HistoryRecord>> for HistoryResponse {
    fn from(history: Vec<HistoryRecord>) -> Self {
        let total = history.len();
        Self { history, total }
    }
}

#[derive(Debug, Serialize)]
pub struct VehiclesResponse {
    pub vehicles: Vec<Vehicle>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct RelayStats {
    pub active_connections: u64,
    pub total_connections: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use carshare_core::harness::seed_fleet;
    use axum::http::Method;
    use carshare_core::types::{parse_booking_time, NewReservation};
    use carshare_core::InMemoryStore;
    use tower::ServiceExt;

    const TOKEN: &str = "admin-secret";

    async fn make_test_router() -> (Router, Arc<BookingService<dyn BookingStore>>) {
        let store: Arc<dyn BookingStore> = InMemoryStore::new_shared();
        seed_fleet(store.as_ref(), 3).await.unwrap();
        let booking = Arc::new(BookingService::new(store));
        let api = AdminApi::new(
            booking.clone(),
            Arc::new(RelayMetrics::new().unwrap()),
            TOKEN.to_string(),
        );
        (api.router(), booking)
    }

    async fn get_json(router: Router, uri: &str, token: Option<&str>) -> (StatusCode, serde_json::Value) {
        send(router, Method::GET, uri, token).await
    }

    async fn send(
        router: Router,
        method: Method,
        uri: &str,
        token: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let response = router.oneshot(builder.body(Body::empty()).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_requires_token() {
        let (router, _) = make_test_router().await;
        let (status, _) = get_json(router.clone(), "/admin/history", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = get_json(router, "/admin/history", Some("wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_vehicles_and_history() {
        let (router, booking) = make_test_router().await;
        let begin = parse_booking_time("2020-05-02 10:00").unwrap();
        booking
            .reserve(NewReservation {
                person_id: PersonId(5),
                vehicle_id: VehicleId(1),
                begin_time: begin,
                return_time: begin + chrono::Duration::hours(1),
            })
            .await
            .unwrap();

        let (status, body) = get_json(router.clone(), "/admin/vehicles?available=true", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);

        let (_, body) = get_json(router.clone(), "/admin/vehicles", Some(TOKEN)).await;
        assert_eq!(body["total"], 3);

        booking.unlock(PersonId(5), VehicleId(1), begin).await.unwrap();
        booking.lock(PersonId(5), VehicleId(1)).await.unwrap();

        let (_, body) = get_json(router.clone(), "/admin/history/5", Some(TOKEN)).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["history"][0]["vehicle_id"], 1);

        let (_, body) = get_json(router, "/admin/history/6", Some(TOKEN)).await;
        assert_eq!(body["total"], 0);
    }

    #[tokio::test]
    async fn test_report_issue_and_work_queue() {
        let (router, booking) = make_test_router().await;

        let (status, body) = get_json(router.clone(), "/admin/vehicles/issues", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 0);

        let (status, _) = send(router.clone(), Method::PUT, "/admin/vehicles/2/issue", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(router.clone(), Method::PUT, "/admin/vehicles/2/issue", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["has_issue"], true);

        let (status, _) = send(router.clone(), Method::PUT, "/admin/vehicles/2/issue", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = send(router.clone(), Method::PUT, "/admin/vehicles/9/issue", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = get_json(router.clone(), "/admin/vehicles/issues", Some(TOKEN)).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["vehicles"][0]["id"], 2);

        let (_, body) = get_json(router, "/admin/vehicles?available=true", Some(TOKEN)).await;
        assert_eq!(body["total"], 2);
        assert_eq!(booking.vehicles_with_issues().await.unwrap().len(), 1);
    }
}
