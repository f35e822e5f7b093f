//! # ptyshare - Shared PTY Session Broker
//!
//! ptyshare runs interactive shells inside pseudo-terminals on a host and
//! lets any number of remote viewers watch and type into them over a
//! WebSocket. Sessions outlive their viewers: a late joiner first receives
//! the recent output history, then the live stream.
//!
//! ## Quick Start
//!
//! ```bash
//! # Start the broker
//! ptyshare serve --port 3000 &
//!
//! # Open a new session in this terminal
//! ptyshare attach
//!
//! # See what is running
//! ptyshare sessions
//! ```
//!
//! ## Library Usage
//!
//! The broker can be embedded by building the router yourself:
//!
//! ```rust,no_run
//! use ptyshare::config::BrokerConfig;
//! use ptyshare::registry::SessionRegistry;
//! use ptyshare::server::{AppState, router};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let registry = SessionRegistry::new(BrokerConfig::default());
//! let (_shutdown_tx, shutdown) = tokio::sync::watch::channel(false);
//! let app = router(AppState {
//!     registry: registry.clone(),
//!     shared_session: None,
//!     shutdown,
//! });
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//! axum::serve(listener, app).await?;
//! registry.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **[Server](server)**: axum router, viewer sockets, admin endpoints
//! - **[Connection](connection)**: per-viewer command handling
//! - **[Registry](registry)**: live sessions and connections, idle sweeper
//! - **[Session](session)**: one shell in a PTY, its history and viewers
//! - **[History](history)** and **[Rate Limit](rate_limit)**: bounded
//!   output replay and per-connection input throttling
//! - **[Client](client)**: `sessions` and `attach` command-line clients

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod protocol;
pub mod rate_limit;
pub mod registry;
pub mod server;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;
