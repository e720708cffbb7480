use axum::{
    extract::State as AxumState,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, get_service},
    Router,
};
use std::{fs, path::PathBuf};
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

use crate::controller::{BracketEvent, BracketListener};
use crate::types::SharedBracketState;

// ── Listeners ──────────────────────────────────────────────────────────

impl BracketListener for SharedBracketState {
    fn on_event(&mut self, event: &BracketEvent) {
        let mut guard = self.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(event.clone());
    }
}

/// Writes every bracket event to `<dir>/<eventId>.json`.
pub struct SnapshotWriter {
    dir: PathBuf,
}

impl SnapshotWriter {
    pub fn new(dir: PathBuf) -> Self {
        SnapshotWriter { dir }
    }

    pub fn path_for(&self, event_id: &str) -> PathBuf {
        self.dir.join(format!("{event_id}.json"))
    }
}

impl BracketListener for SnapshotWriter {
    fn on_event(&mut self, event: &BracketEvent) {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!("Failed to create bracket dir {}: {e}", self.dir.display());
            return;
        }
        let path = self.path_for(&event.event_id);
        let payload = match serde_json::to_string_pretty(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to serialize bracket snapshot: {e}");
                return;
            }
        };
        if let Err(e) = fs::write(&path, payload) {
            warn!("Failed to write bracket snapshot {}: {e}", path.display());
        }
    }
}

// ── HTTP ───────────────────────────────────────────────────────────────

pub fn state_router(state: SharedBracketState, bracket_dir: PathBuf) -> Router {
    let snapshots = get_service(ServeDir::new(bracket_dir));

    Router::new()
        .route("/state.json", get(get_bracket_state_json))
        .nest_service("/brackets", snapshots)
        .with_state(state)
}

pub async fn start_state_server(state: SharedBracketState, bracket_dir: PathBuf, addr: String) {
    let app = state_router(state, bracket_dir);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Bracket state server failed to bind {addr}: {e}");
            return;
        }
    };
    info!("Bracket state server listening at http://{addr}/state.json");
    if let Err(e) = axum::serve(listener, app).await {
        error!("Bracket state server error: {e}");
    }
}

/// Run the state server on its own runtime so the blocking controller loop keeps the main thread.
pub fn spawn_state_server(state: SharedBracketState, bracket_dir: PathBuf, addr: String) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Failed to start the state server runtime: {e}");
                return;
            }
        };
        runtime.block_on(start_state_server(state, bracket_dir, addr));
    });
}

async fn get_bracket_state_json(AxumState(state): AxumState<SharedBracketState>) -> impl IntoResponse {
    let event = {
        let guard = state.lock().unwrap_or_else(|e| e.into_inner());
        guard.clone()
    };
    let headers = [
        ("Content-Type", "application/json"),
        ("Cache-Control", "no-store"),
    ];
    match event {
        Some(event) => {
            let body = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            (StatusCode::OK, headers, body)
        }
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            headers,
            r#"{"error":"bracket not seeded yet"}"#.to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bracket::BracketTree;
    use crate::controller::TournamentState;
    use crate::types::Competitor;
    use std::sync::{Arc, Mutex};

    fn event() -> BracketEvent {
        let field = (1..=5)
            .map(|seed| Competitor::new(format!("player{seed}"), 2000 - seed * 10, seed))
            .collect();
        let bracket = BracketTree::seed(field, 1).unwrap();
        BracketEvent {
            event_id: "swiss42".to_string(),
            state: TournamentState::Seeding,
            platform_round: 0,
            emitted_at_ms: 1_000,
            bracket: bracket.snapshot(),
        }
    }

    #[test]
    fn test_shared_state_keeps_latest_event() {
        let mut shared: SharedBracketState = Arc::new(Mutex::new(None));
        let mut later = event();
        shared.on_event(&event());
        later.platform_round = 3;
        shared.on_event(&later);
        let guard = shared.lock().unwrap();
        assert_eq!(guard.as_ref().map(|e| e.platform_round), Some(3));
    }

    #[test]
    fn test_snapshot_writer_names_file_after_event() {
        let dir = std::env::temp_dir().join(format!("knockout-brackets-{}", std::process::id()));
        let mut writer = SnapshotWriter::new(dir.clone());
        writer.on_event(&event());
        let data = fs::read_to_string(writer.path_for("swiss42")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert_eq!(value["eventId"], "swiss42");
        assert_eq!(value["state"]["state"], "seeding");
        assert_eq!(value["bracket"]["size"], 8);
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_state_json_reports_unseeded_bracket() {
        let shared: SharedBracketState = Arc::new(Mutex::new(None));
        let response = get_bracket_state_json(AxumState(shared.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let mut listener = shared.clone();
        listener.on_event(&event());
        let response = get_bracket_state_json(AxumState(shared)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["bracket"]["competitors"].as_array().map(Vec::len), Some(5));
    }
}
