//! # Broker Server
//!
//! HTTP and WebSocket front end of the broker. One axum router serves the
//! viewer socket and a small read-only admin surface; all state lives in the
//! [`SessionRegistry`].
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐   /ws    ┌──────────────────────────┐        ┌─────────────┐
//! │  Viewers        │◄────────►│  Broker                  │◄──────►│  Shells     │
//! │  (browsers,     │          │  - ConnectionHandler     │  PTY   │  (one per   │
//! │   ptyshare      │          │  - SessionRegistry       │        │   session)  │
//! │   attach)       │          │  - idle sweeper          │        │             │
//! └─────────────────┘          └──────────────────────────┘        └─────────────┘
//!                                   ▲
//!                /api/sessions      │
//!  ptyshare sessions ───────────────┘
//! ```
//!
//! ## Endpoints
//!
//! - `WS /ws` - viewer protocol, see [`protocol`](crate::protocol)
//! - `GET /api/sessions` - every session as JSON, oldest first
//! - `GET /api/sessions/{id}` - one session, `404` if unknown
//! - `GET /health` - `{"status":"ok","sessions":N}`
//!
//! ## Shutdown
//!
//! `SIGINT`/`SIGTERM` flip a watch channel. Open sockets close, every
//! session's process is killed, then the listener stops.
//!
//! ## Transport limits
//!
//! Inbound messages are capped at 1 MB. The server pings every viewer every
//! 25 s and drops one that has sent nothing for 60 s.
//!
//! ## Example Usage
//!
//! ```bash
//! # Independent sessions, created on demand by viewers
//! ptyshare serve --host 0.0.0.0 --port 3000
//!
//! # One supervised session everybody joins
//! ptyshare serve --shared --shell /bin/zsh
//! ```

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::{
    BrokerConfig, DEFAULT_COLS, DEFAULT_ROWS, HeartbeatConfig, RateLimitConfig, RestartPolicy,
    ShellConfig, default_shell,
};
use crate::connection::ConnectionHandler;
use crate::history::HISTORY_CAPACITY;
use crate::protocol::{
    ClientMessage, FRAME_HISTORY, FRAME_OUTPUT, Outbound, SessionInfo, encode_frame,
};
use crate::rate_limit::{DEFAULT_CAPACITY, DEFAULT_REFILL_PER_SEC};
use crate::registry::SessionRegistry;
use crate::session::SessionId;

/// How long a closing socket may spend flushing its outbox.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);
/// Largest inbound WebSocket message accepted from a viewer.
pub const MAX_MESSAGE_SIZE: usize = 1_000_000;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Run the PTY session broker")]
pub struct Args {
    /// Host to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port for the server
    #[arg(long, default_value_t = 3000)]
    pub port: u16,

    /// Program started inside every session
    #[arg(long, default_value_t = default_shell())]
    pub shell: String,

    /// Extra argument for the shell (repeatable)
    #[arg(long = "shell-arg", allow_hyphen_values = true)]
    pub shell_args: Vec<String>,

    /// Working directory for new sessions (defaults to $HOME)
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Initial terminal width
    #[arg(long, default_value_t = DEFAULT_COLS)]
    pub cols: u16,

    /// Initial terminal height
    #[arg(long, default_value_t = DEFAULT_ROWS)]
    pub rows: u16,

    /// Run one supervised session that every viewer joins on connect
    #[arg(long, default_value_t = false)]
    pub shared: bool,

    /// Reclaim viewer-less sessions idle for longer than this
    #[arg(long, default_value_t = 24)]
    pub idle_retention_hours: u64,

    /// How often to look for idle sessions
    #[arg(long, default_value_t = 3600)]
    pub sweep_interval_secs: u64,

    /// Input burst allowed per connection, in bytes
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    pub rate_capacity: u32,

    /// Input refill per connection, in bytes per second
    #[arg(long, default_value_t = DEFAULT_REFILL_PER_SEC)]
    pub rate_refill: f64,
}

impl Args {
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            shell: ShellConfig {
                program: self.shell.clone(),
                args: self.shell_args.clone(),
                cwd: self.cwd.clone(),
                cols: self.cols,
                rows: self.rows,
            },
            rate_limit: RateLimitConfig {
                capacity: self.rate_capacity,
                refill_per_sec: self.rate_refill,
            },
            heartbeat: HeartbeatConfig::default(),
            history_capacity: HISTORY_CAPACITY,
            idle_retention: Duration::from_secs(self.idle_retention_hours.saturating_mul(3600)),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    /// Session every new connection is attached to (`--shared`).
    pub shared_session: Option<SessionId>,
    pub shutdown: watch::Receiver<bool>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(handle_ws))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", get(get_session))
        .route("/health", get(health))
        .with_state(state)
}

/// Starts the broker and serves until a shutdown signal arrives.
pub async fn run_server(args: Args) -> Result<()> {
    let config = args.broker_config();
    info!(
        "Broker config - shell: {}, geometry: {}x{}, shared: {}",
        config.shell.program, config.shell.cols, config.shell.rows, args.shared
    );

    let registry = SessionRegistry::new(config.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(true);
    })?;

    let shared_session = if args.shared {
        let session = registry
            .create_with_policy(RestartPolicy::backoff())
            .await;
        info!("Shared session ready: {}", session.id());
        Some(session.id().to_string())
    } else {
        None
    };

    tokio::spawn(registry.clone().run_idle_sweeper(
        config.sweep_interval,
        config.idle_retention,
        shutdown_rx.clone(),
    ));

    let app = router(AppState {
        registry: registry.clone(),
        shared_session,
        shutdown: shutdown_rx.clone(),
    });

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on {} (WebSocket /ws, admin /api/sessions)", addr);

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_rx, registry.clone()));

    if let Err(e) = server.await {
        error!("Server error: {:?}", e);
    }

    registry.shutdown();
    info!("Broker stopped");
    Ok(())
}

/// Resolves once `signal` turns `true` (or its sender is dropped), after
/// every session has been terminated.
pub async fn shutdown_signal(mut signal: watch::Receiver<bool>, registry: SessionRegistry) {
    while !*signal.borrow_and_update() {
        if signal.changed().await.is_err() {
            break;
        }
    }
    info!("Shutdown signal received, terminating sessions");
    registry.shutdown();
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.registry.list())
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, StatusCode> {
    let session = state.registry.get(&session_id).ok_or_else(|| {
        warn!("Session not found: {}", session_id);
        StatusCode::NOT_FOUND
    })?;
    Ok(Json(session.info()))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.registry.len(),
    }))
}

async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Outbound>();
    let mut handler = ConnectionHandler::new(state.registry.clone(), outbox.clone());
    let connection_id = handler.id().to_string();

    info!(connection_id = %connection_id, "viewer connected");

    // Single writer for the socket; everything else goes through the outbox.
    let mut forward = tokio::spawn(async move {
        while let Some(outbound) = outbox_rx.recv().await {
            let Some(message) = to_ws_message(outbound) else {
                continue;
            };
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    if let Some(shared) = &state.shared_session {
        handler.attach(shared);
    }

    let heartbeat = state.registry.config().heartbeat;
    let mut ping = tokio::time::interval(heartbeat.ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;
    let mut last_seen = Instant::now();

    let mut shutdown = state.shutdown.clone();
    loop {
        tokio::select! {
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    last_seen = Instant::now();
                    match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(msg) => handler.handle(msg).await,
                        Err(e) => {
                            debug!(connection_id = %connection_id, error = %e, "invalid message");
                            handler.reject(format!("invalid message: {e}"));
                        }
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    last_seen = Instant::now();
                    handler.input(data.to_vec());
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => last_seen = Instant::now(),
                Some(Err(e)) => {
                    warn!(connection_id = %connection_id, error = %e, "viewer socket error");
                    break;
                }
            },
            _ = ping.tick() => {
                if last_seen.elapsed() > heartbeat.peer_timeout {
                    info!(connection_id = %connection_id, "viewer heartbeat timed out");
                    break;
                }
                let _ = outbox.send(Outbound::Ping);
            }
            _ = shutdown.changed() => break,
        }
    }

    // Dropping the handler detaches it and releases every outbox sender, so
    // the forward task drains what is left and ends.
    drop(handler);
    drop(outbox);
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut forward).await.is_err() {
        forward.abort();
    }

    info!(connection_id = %connection_id, "viewer disconnected");
}

fn to_ws_message(outbound: Outbound) -> Option<Message> {
    match outbound {
        Outbound::Message(msg) => match serde_json::to_string(&msg) {
            Ok(json) => Some(Message::Text(json.into())),
            Err(e) => {
                error!(error = %e, "failed to encode server message");
                None
            }
        },
        Outbound::Output(bytes) => Some(Message::Binary(encode_frame(FRAME_OUTPUT, &bytes).into())),
        Outbound::History(bytes) => {
            Some(Message::Binary(encode_frame(FRAME_HISTORY, &bytes).into()))
        }
        Outbound::Ping => Some(Message::Ping(Bytes::new())),
    }
}
