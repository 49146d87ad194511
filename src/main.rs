//! ==============================================================================
//! main.rs - alco-relay entry point
//! ==============================================================================
//!
//! purpose:
//!     relays breath-alcohol readings from one esp32 sensor to any number of
//!     browser dashboards, stores the readings worth keeping, and shares a
//!     single "recording armed" flag between everyone.
//!
//! responsibilities:
//!     - load configuration and start logging
//!     - open the readings database (the only fatal step)
//!     - wire register, hub, ingestion and toggle services together
//!     - serve the json api and the server-sent event stream
//!
//! relationships:
//!     - uses: store/ (sqlite + trace file)
//!     - uses: register.rs (live snapshot)
//!     - uses: hub.rs (observer registry and fan-out)
//!     - uses: ingest.rs, toggle.rs (the write paths)
//!
//! architecture:
//!
//!     ┌──────────┐  POST /push            ┌─────────────────────────────┐
//!     │  esp32   │ ─────────────────────► │ IngestionService            │
//!     └──────────┘  GET /data             │   ├─► ReadingStore (sqlite) │
//!                                         │   ├─► StateRegister         │
//!     ┌──────────┐  POST /guardar         │   └─► BroadcastHub ──┐      │
//!     │ browser  │ ─────────────────────► │ ToggleService ───────┤      │
//!     │ observer │  POST /toggle          │                      │      │
//!     │          │ ◄───── GET /events ─── │ ◄────────────────────┘      │
//!     └──────────┘   (sse stream)         └─────────────────────────────┘
//!
//! ==============================================================================

mod config;
mod domain;
mod error;
mod hub;
mod ingest;
mod register;
mod store;
mod toggle;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

use config::{ReadingsConfig, RelayConfig};
use domain::{ArmedPayload, ManualReading, Reading, StateSnapshot};
use error::ApiError;
use hub::{BroadcastHub, HubEvent};
use ingest::{IngestOutcome, IngestionService};
use register::StateRegister;
use store::ReadingStore;
use toggle::ToggleService;

// ==============================================================================
// shared state
// ==============================================================================
// every handler gets a clone of this. the pieces are Arc'd or internally
// shared, so cloning is a handful of refcount bumps.

#[derive(Clone)]
pub struct AppState {
    pub register: Arc<StateRegister>,
    pub store: ReadingStore,
    pub hub: BroadcastHub,
    pub ingest: Arc<IngestionService>,
    pub toggle: Arc<ToggleService>,
    pub readings: ReadingsConfig,
    pub keep_alive: Duration,
}

impl AppState {
    pub fn new(config: &RelayConfig, store: ReadingStore) -> Self {
        let register = Arc::new(StateRegister::new());
        let hub = BroadcastHub::new(register.clone(), config.broadcast.observer_buffer);
        let ingest = Arc::new(IngestionService::new(
            store.clone(),
            register.clone(),
            hub.clone(),
            config.operator.clone(),
            config.logging.show_sensor_data,
        ));
        let toggle = Arc::new(ToggleService::new(register.clone(), hub.clone()));

        Self {
            register,
            store,
            hub,
            ingest,
            toggle,
            readings: config.readings.clone(),
            keep_alive: Duration::from_secs(config.broadcast.keep_alive_seconds.max(1)),
        }
    }
}

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    println!("===========================================================");
    println!("  alco-relay - Breath Alcohol Live Relay");
    println!("===========================================================");

    // step 1: load configuration
    let config = RelayConfig::load_or_default();
    config.print_summary();

    // step 2: logging (RUST_LOG overrides the config level)
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .format_timestamp_millis()
    .init();

    // step 3: open the readings store
    println!("\n[STARTUP] Opening readings store...");
    let store = ReadingStore::open(
        config.storage.db_path.clone(),
        config.storage.trace_path.clone(),
    )
    .context("failed to open readings store")?;
    println!("[STARTUP] ✓ Database at {}", store.path().display());
    println!("[STARTUP] ✓ Trace file at {}", store.trace_path().display());

    // step 4: wire services and serve
    let state = AppState::new(&config, store);
    println!("[STARTUP] ✓ Relay live at http://{}", config.server.bind);
    println!("────────────────────────────────────────────────────────────");

    run_server(state, &config.server.bind).await
}

// ==============================================================================
// web server
// ==============================================================================

fn router(state: AppState) -> Router {
    Router::new()
        .route("/events", get(events_handler))
        .route("/push", post(push_handler))
        .route("/guardar", post(save_handler))
        .route("/toggle", post(toggle_handler))
        .route("/data", get(data_handler))
        .route("/readings", get(readings_handler))
        .route("/setuser", post(set_user_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn run_server(state: AppState, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// live event stream: init first, then whatever gets published.
/// the observer is unsubscribed when axum drops the stream on disconnect.
async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let conn = state.hub.subscribe();
    log::info!(
        "[HTTP] Observer {} connected ({} live)",
        conn.id(),
        state.hub.observer_count()
    );

    let stream = conn.into_stream().map(|ev| Ok(to_sse_event(&ev)));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(state.keep_alive))
}

fn to_sse_event(ev: &HubEvent) -> Event {
    let event = Event::default().data(&*ev.data);
    match ev.kind.sse_name() {
        Some(name) => event.event(name),
        None => event,
    }
}

/// device push. the body is parsed by hand so that garbage still counts as
/// a (zero) measurement instead of a 4xx.
async fn push_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let raw = match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(value) => value,
        Err(e) => {
            if !body.is_empty() {
                log::warn!("[HTTP] /push body is not json ({}), treating as empty", e);
            }
            serde_json::Value::Null
        }
    };

    match state.ingest.ingest_measurement(&raw).await {
        Ok(IngestOutcome::Persisted(entry)) => Json(serde_json::json!({
            "ok": true,
            "latest": state.register.current(),
            "entry": entry,
        }))
        .into_response(),
        Ok(IngestOutcome::Live(latest)) => {
            Json(serde_json::json!({ "ok": true, "latest": latest })).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "ok": false,
                "error": e.to_string(),
                "latest": state.register.current(),
            })),
        )
            .into_response(),
    }
}

/// observer "save now"
async fn save_handler(
    State(state): State<AppState>,
    Json(manual): Json<ManualReading>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entry = state.ingest.ingest_manual_reading(manual).await?;
    Ok(Json(serde_json::json!({
        "message": "Registro guardado",
        "entry": entry,
    })))
}

/// POST /toggle flips; POST /toggle {"activo": bool} sets
async fn toggle_handler(State(state): State<AppState>, body: Bytes) -> Json<ArmedPayload> {
    let activo = match serde_json::from_slice::<ArmedPayload>(&body) {
        Ok(requested) => state.toggle.set(requested.activo),
        Err(_) => state.toggle.toggle(),
    };
    Json(ArmedPayload { activo })
}

async fn data_handler(State(state): State<AppState>) -> Json<StateSnapshot> {
    Json(state.register.current())
}

#[derive(Deserialize)]
struct ReadingsParams {
    limit: Option<usize>,
}

async fn readings_handler(
    State(state): State<AppState>,
    Query(params): Query<ReadingsParams>,
) -> Result<Json<Vec<Reading>>, ApiError> {
    let limit = state.readings.clamp(params.limit);
    Ok(Json(state.store.list_recent(limit).await?))
}

#[derive(Deserialize)]
struct SetUserRequest {
    #[serde(default)]
    identificacion: String,
}

async fn set_user_handler(
    State(state): State<AppState>,
    Json(req): Json<SetUserRequest>,
) -> Json<serde_json::Value> {
    let id = state.ingest.set_operator(&req.identificacion);
    Json(serde_json::json!({ "identificacion": id }))
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "observers": state.hub.observer_count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn test_state() -> (TempDir, AppState) {
        let dir = tempdir().unwrap();
        let mut config = RelayConfig::default();
        config.readings.max_limit = 2;
        let store = ReadingStore::open(dir.path().join("r.db"), dir.path().join("r.txt")).unwrap();
        let state = AppState::new(&config, store);
        (dir, state)
    }

    #[tokio::test]
    async fn test_push_with_garbage_body_is_accepted() {
        let (_dir, state) = test_state();
        state.register.set_measurement(5.0, "t".into());

        let resp = push_handler(State(state.clone()), Bytes::from_static(b"not json")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.register.current().alcohol, 0.0);
    }

    #[tokio::test]
    async fn test_push_storage_failure_is_500() {
        let (_dir, state) = test_state();
        state
            .store
            .execute(|conn| Ok(conn.execute_batch("DROP TABLE readings")?))
            .await
            .unwrap()
            .unwrap();

        let body = Bytes::from_static(br#"{"alcohol": 2.5, "save": true}"#);
        let resp = push_handler(State(state.clone()), body).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(state.register.current().alcohol, 2.5);
    }

    #[tokio::test]
    async fn test_toggle_handler_flips_and_sets() {
        let (_dir, state) = test_state();

        let Json(first) = toggle_handler(State(state.clone()), Bytes::new()).await;
        assert!(first.activo);

        let Json(set) =
            toggle_handler(State(state.clone()), Bytes::from_static(br#"{"activo": true}"#)).await;
        assert!(set.activo);

        let Json(data) = data_handler(State(state.clone())).await;
        assert!(data.activo);
    }

    #[tokio::test]
    async fn test_readings_limit_is_capped() {
        let (_dir, state) = test_state();
        for _ in 0..3 {
            state
                .ingest
                .ingest_manual_reading(ManualReading::default())
                .await
                .unwrap();
        }

        let Json(rows) = readings_handler(
            State(state.clone()),
            Query(ReadingsParams { limit: Some(50) }),
        )
        .await
        .unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 2]);
    }

    #[tokio::test]
    async fn test_set_user_then_save() {
        let (_dir, state) = test_state();
        set_user_handler(
            State(state.clone()),
            Json(SetUserRequest { identificacion: "op-9".into() }),
        )
        .await;

        let Json(resp) = save_handler(State(state.clone()), Json(ManualReading::default()))
            .await
            .unwrap();
        assert_eq!(resp["entry"]["user"], "op-9");
        assert_eq!(resp["message"], "Registro guardado");
    }

    async fn next_frame<S>(body: &mut S) -> String
    where
        S: Stream<Item = Result<Bytes, axum::Error>> + Unpin,
    {
        let chunk = tokio::time::timeout(Duration::from_secs(2), body.next())
            .await
            .expect("no sse frame within 2s")
            .unwrap()
            .unwrap();
        String::from_utf8(chunk.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_events_stream_frames_init_then_named_events() {
        let (_dir, state) = test_state();

        let resp = events_handler(State(state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()["content-type"].to_str().unwrap(),
            "text/event-stream"
        );
        assert_eq!(state.hub.observer_count(), 1);

        let mut body = resp.into_body().into_data_stream();

        // init is an unnamed message so EventSource.onmessage sees it
        let init = next_frame(&mut body).await;
        assert!(init.starts_with(r#"data: {"type":"init","latest":{"#), "{init}");
        assert!(!init.contains("event:"), "{init}");
        assert!(init.ends_with("\n\n"));

        state.toggle.toggle();
        let toggle = next_frame(&mut body).await;
        assert!(toggle.contains("event: toggle\n"), "{toggle}");
        assert!(toggle.contains(r#"data: {"activo":true}"#), "{toggle}");

        drop(body);
        assert_eq!(state.hub.observer_count(), 0);
    }
}
