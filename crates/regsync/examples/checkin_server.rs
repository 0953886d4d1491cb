use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use regsync::{
    AttendanceLog, Guest, MemoryTransport, QrCode, QrOwner, SyncConfig, SyncProvider, SyncState,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, Level};
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    provider: SyncProvider<MemoryTransport>,
    backend: MemoryTransport,
    next_guest_id: Arc<AtomicI64>,
    next_log_id: Arc<AtomicI64>,
}

#[derive(Debug, Deserialize)]
struct RegisterGuestRequest {
    full_name: String,
    email: String,
    phone: Option<String>,
    affiliation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecordScanRequest {
    qr_id: Uuid,
    station: String,
}

async fn list_guests(State(state): State<AppState>) -> Json<Vec<Guest>> {
    Json(state.provider.guests().rows())
}

async fn register_guest(
    State(state): State<AppState>,
    Json(request): Json<RegisterGuestRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let guest = Guest {
        guest_id: state.next_guest_id.fetch_add(1, Ordering::Relaxed),
        full_name: request.full_name,
        email: request.email,
        phone: request.phone,
        affiliation: request.affiliation,
        created_at: Utc::now(),
    };
    let code = QrCode {
        qr_id: Uuid::new_v4(),
        owner: QrOwner::Guest {
            guest_id: guest.guest_id,
        },
        issued_at: Utc::now(),
    };

    state
        .backend
        .insert_record(&guest)
        .and_then(|_| state.backend.insert_record(&code))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    info!("Registered guest {} with code {}", guest.guest_id, code.qr_id);
    Ok(Json(json!({ "guest": guest, "qr_code": code })))
}

async fn record_scan(
    State(state): State<AppState>,
    Json(request): Json<RecordScanRequest>,
) -> Result<Json<AttendanceLog>, StatusCode> {
    // Scans are only valid against an issued code.
    if state.provider.qr_codes().get(request.qr_id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }

    let log = AttendanceLog {
        log_id: state.next_log_id.fetch_add(1, Ordering::Relaxed),
        qr_id: request.qr_id,
        scanned_at: Utc::now(),
        station: request.station,
    };
    state
        .backend
        .insert_record(&log)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    info!("Recorded scan of {} at {}", log.qr_id, log.station);
    Ok(Json(log))
}

async fn connection_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let status = state.provider.connection_status();
    Json(json!({
        "connection": status,
        "guests": state.provider.guests().len(),
        "students": state.provider.students().len(),
        "attendance_logs": state.provider.attendance_logs().len(),
    }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting check-in server...");

    let backend = MemoryTransport::new();
    let provider = SyncProvider::mount(backend.clone(), SyncConfig::from_env()).await;

    let sync_state = SyncState::new(provider.clone());
    let sync_router = regsync::router_with_sync_state(sync_state.clone()).with_state(sync_state);

    let app_state = AppState {
        provider,
        backend,
        next_guest_id: Arc::new(AtomicI64::new(1)),
        next_log_id: Arc::new(AtomicI64::new(1)),
    };
    let api = Router::new()
        .route("/guests", get(list_guests).post(register_guest))
        .route("/scans", post(record_scan))
        .route("/status", get(connection_status))
        .with_state(app_state);

    let app: Router = sync_router.merge(api);

    let listener = TcpListener::bind("127.0.0.1:3400").await?;
    info!("Server running on http://127.0.0.1:3400");
    info!("Sync WebSocket endpoint at ws://127.0.0.1:3400/sync");
    info!("API endpoints:");
    info!("  GET    /guests  - List registered guests");
    info!("  POST   /guests  - Register a guest and issue a QR code");
    info!("  POST   /scans   - Record a check-in scan");
    info!("  GET    /status  - Connection status and collection sizes");

    axum::serve(listener, app).await?;

    Ok(())
}
