pub mod adapters;
pub mod app;
pub mod domain;
pub mod ports;
pub mod telemetry;

use adapters::auth::SessionDirectory;
use adapters::bus::{BroadcastBus, DEFAULT_BUS_CAPACITY};
use adapters::store::{InMemoryCollabStore, InstrumentedStore};
use anyhow::{Context, Result as AnyResult};
use app::lifecycle::{error_frame, ConnectionManager, LifecycleSettings, ServerFrame};
use app::reclamation::{spawn_sweep_task, EvictionCallback, IdleSweep};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use domain::session::ProjectId;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::ctrl_c;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

type CollabStore = InstrumentedStore<InMemoryCollabStore>;
type CollabManager = ConnectionManager<CollabStore>;

#[derive(Clone)]
struct AppState {
    manager: Arc<CollabManager>,
    health_check_interval: Duration,
    started_at: Instant,
}

pub struct Settings {
    pub listen: SocketAddr,
    pub auth_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub message_timeout: Duration,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub tool_operation_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_session_age: Duration,
    pub operation_ttl: Duration,
    pub sessions_file: Option<PathBuf>,
    pub bus_capacity: usize,
    pub otlp_endpoint: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let lifecycle = LifecycleSettings::default();
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 17817)),
            auth_timeout: lifecycle.auth_timeout,
            disconnect_timeout: lifecycle.disconnect_timeout,
            message_timeout: lifecycle.message_timeout,
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: lifecycle.health_check_timeout,
            tool_operation_timeout: lifecycle.tool_operation_timeout,
            sweep_interval: Duration::from_secs(60),
            max_session_age: Duration::from_secs(60 * 60),
            operation_ttl: Duration::from_secs(15 * 60),
            sessions_file: None,
            bus_capacity: DEFAULT_BUS_CAPACITY,
            otlp_endpoint: None,
        }
    }
}

impl Settings {
    fn lifecycle(&self) -> LifecycleSettings {
        LifecycleSettings {
            auth_timeout: self.auth_timeout,
            disconnect_timeout: self.disconnect_timeout,
            message_timeout: self.message_timeout,
            health_check_timeout: self.health_check_timeout,
            tool_operation_timeout: self.tool_operation_timeout,
        }
    }
}

pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let (metrics, provider) = if let Some(ref endpoint) = settings.otlp_endpoint {
        let (provider, metrics) = telemetry::init_metrics(Some(endpoint.clone()), "quire-collabd")?;
        (Some(Arc::new(metrics)), Some(provider))
    } else {
        (None, None)
    };

    let directory = match &settings.sessions_file {
        Some(path) => SessionDirectory::from_file(path)
            .with_context(|| format!("loading session directory {}", path.display()))?,
        None => SessionDirectory::new(),
    };
    let grants = directory.grant_count().await;
    info!(grants, "session directory loaded");

    let store = Arc::new(InstrumentedStore::new(
        InMemoryCollabStore::with_operation_ttl(settings.operation_ttl),
        metrics.clone(),
    ));
    let manager = ConnectionManager::new(
        settings.lifecycle(),
        Arc::clone(&store),
        Arc::new(BroadcastBus::new(settings.bus_capacity)),
        Arc::new(directory),
        metrics,
    );
    let bus_listener = manager.spawn_bus_listener();

    let evict: EvictionCallback = {
        let manager = Arc::downgrade(&manager);
        Arc::new(move |project: ProjectId| {
            let manager = manager.clone();
            async move {
                if let Some(manager) = manager.upgrade() {
                    let evicted = manager.evict_project(&project).await;
                    debug!(%project, evicted, "idle project evicted");
                }
            }
            .boxed()
        })
    };
    let sweep = Arc::new(IdleSweep::new(
        manager.clone(),
        store,
        evict,
        settings.max_session_age,
    ));
    let sweep_handle = spawn_sweep_task(sweep, settings.sweep_interval);

    let state = AppState {
        manager,
        health_check_interval: settings.health_check_interval,
        started_at: Instant::now(),
    };
    let app = Router::new()
        .route("/health", get(health))
        .route("/ws", get(collab_ws_upgrade))
        .with_state(state);

    let listener = TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("binding {}", settings.listen))?;
    info!("listening" = %settings.listen, "msg" = "quire-collabd started");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweep_handle.shutdown().await;
    bus_listener.abort();

    if let Some(provider) = provider {
        if let Err(e) = telemetry::shutdown_metrics(provider) {
            warn!("Failed to shutdown telemetry: {}", e);
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let _ = ctrl_c().await;
    info!("msg" = "shutdown signal received");
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "connections": state.manager.connection_count().await,
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn collab_ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = handle_collab_socket(socket, state).await {
            warn!("collaboration socket terminated: {err:#}");
        }
    })
}

async fn handle_collab_socket(socket: WebSocket, state: AppState) -> AnyResult<()> {
    let manager = state.manager;
    let (id, mut outbound) = manager.accept().await;
    let outcome = pump_socket(socket, &manager, id, &mut outbound, state.health_check_interval).await;
    manager.on_close(id).await;
    outcome
}

async fn pump_socket(
    socket: WebSocket,
    manager: &CollabManager,
    id: domain::connection::ConnectionId,
    outbound: &mut tokio::sync::mpsc::UnboundedReceiver<ServerFrame>,
    health_check_interval: Duration,
) -> AnyResult<()> {
    let (mut sink, mut stream) = socket.split();
    let mut probe = time::interval_at(Instant::now() + health_check_interval, health_check_interval);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Err(err) = manager.handle_text(id, &text).await {
                        warn!(connection = %id, code = err.code(), %err, "frame failed");
                        sink.send(Message::Text(error_frame(&err))).await?;
                    }
                }
                Some(Ok(Message::Binary(_))) => debug!(connection = %id, "binary frame ignored"),
                Some(Ok(Message::Ping(payload))) => sink.send(Message::Pong(payload)).await?,
                Some(Ok(Message::Pong(_))) => manager.on_pong(id),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(err)) => {
                    warn!(connection = %id, "WebSocket receive error: {err}");
                    break;
                }
            },
            frame = outbound.recv() => match frame {
                Some(ServerFrame::Text(text)) => sink.send(Message::Text(text)).await?,
                Some(ServerFrame::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = probe.tick() => {
                sink.send(Message::Ping(Vec::new())).await?;
                manager.on_health_probe(id);
            }
        }
    }
    Ok(())
}
