//! # Session Registry
//!
//! Process-wide table of live sessions and connected viewers.
//!
//! - Sessions are keyed by a random UUIDv4; an id is never reused after
//!   deletion.
//! - Every connection is registered here too, so lifecycle events
//!   (`session-created`, `session-deleted`) reach all viewers, not only
//!   those attached to the affected session.
//! - A background sweeper reclaims sessions that nobody is watching and
//!   that produced no activity within the retention window.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BrokerConfig, RestartPolicy};
use crate::error::BrokerError;
use crate::protocol::{Outbound, Outbox, ServerMessage, SessionInfo};
use crate::session::{ConnectionId, SessionId, TerminalSession};

#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, Arc<TerminalSession>>>,
    connections: Arc<DashMap<ConnectionId, Outbox>>,
    config: Arc<BrokerConfig>,
}

impl SessionRegistry {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Spawns a new session that stays exited once its shell ends.
    pub async fn create(&self) -> Arc<TerminalSession> {
        self.create_with_policy(RestartPolicy::Never).await
    }

    /// Spawns a new session and announces it to every connection.
    ///
    /// A shell that fails to start still yields a registered session in the
    /// `exited` state, so the failure is visible to viewers.
    pub async fn create_with_policy(&self, policy: RestartPolicy) -> Arc<TerminalSession> {
        let id = Uuid::new_v4().to_string();
        let session = TerminalSession::new(
            id.clone(),
            self.config.shell.clone(),
            self.config.history_capacity,
            policy,
        );
        self.sessions.insert(id.clone(), Arc::clone(&session));

        if let Err(e) = session.start().await {
            warn!(session_id = %id, error = %e, "session registered without a running process");
        }
        info!(session_id = %id, program = %self.config.shell.program, "session created");

        self.broadcast_all(&ServerMessage::SessionCreated(session.info()).into());
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Snapshot of every session, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<Arc<TerminalSession>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        sessions.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        sessions.iter().map(|s| s.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Removes and terminates a session, then tells every connection.
    pub fn delete(&self, id: &str) -> Result<(), BrokerError> {
        let (_, session) = self
            .sessions
            .remove(id)
            .ok_or_else(|| BrokerError::SessionNotFound(id.to_string()))?;
        session.terminate();
        info!(session_id = %id, "session deleted");

        self.broadcast_all(
            &ServerMessage::SessionDeleted {
                session_id: id.to_string(),
            }
            .into(),
        );
        Ok(())
    }

    /// Deletes every session with no viewers and no activity within
    /// `retention`. Supervised sessions (backoff policy) are never
    /// reclaimed. Returns the ids that were reclaimed.
    pub fn reap_idle(&self, retention: Duration) -> Vec<SessionId> {
        let idle: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                session.restart_policy() == RestartPolicy::Never && session.is_idle(retention)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = Vec::with_capacity(idle.len());
        for id in idle {
            // Re-check: a viewer may have attached since the scan.
            let still_idle = self
                .get(&id)
                .map(|s| s.is_idle(retention))
                .unwrap_or(false);
            if still_idle && self.delete(&id).is_ok() {
                info!(session_id = %id, "reclaimed idle session");
                reaped.push(id);
            }
        }
        reaped
    }

    /// Periodically reclaims idle sessions until `shutdown` flips to `true`.
    pub async fn run_idle_sweeper(
        self,
        interval: Duration,
        retention: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = self.reap_idle(retention);
                    debug!(reaped = reaped.len(), remaining = self.len(), "idle sweep finished");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("idle sweeper stopped");
    }

    /// Terminates every session. Used on shutdown.
    pub fn shutdown(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            if let Some((_, session)) = self.sessions.remove(id) {
                session.terminate();
            }
        }
        info!(sessions = ids.len(), "all sessions terminated");
    }

    pub fn register_connection(&self, id: &str, outbox: Outbox) {
        self.connections.insert(id.to_string(), outbox);
    }

    pub fn unregister_connection(&self, id: &str) {
        self.connections.remove(id);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Sends `msg` to every registered connection. A closed outbox is
    /// skipped; the connection's own teardown removes it.
    pub fn broadcast_all(&self, msg: &Outbound) {
        for entry in self.connections.iter() {
            if entry.value().send(msg.clone()).is_err() {
                debug!(connection_id = %entry.key(), "connection outbox closed, skipping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{drain, outbox, test_shell};

    fn registry_with(program: &str, args: &[&str]) -> SessionRegistry {
        SessionRegistry::new(BrokerConfig {
            shell: test_shell(program, args),
            ..BrokerConfig::default()
        })
    }

    #[tokio::test]
    async fn create_announces_to_all_connections() {
        let registry = registry_with("cat", &[]);
        let (tx, mut rx) = outbox();
        registry.register_connection("watcher", tx);

        let session = registry.create().await;
        let msgs = drain(&mut rx);
        assert!(msgs.iter().any(|m| matches!(
            m,
            Outbound::Message(ServerMessage::SessionCreated(info)) if info.id == session.id()
        )));
        assert_eq!(registry.list().len(), 1);

        registry.shutdown();
    }

    #[tokio::test]
    async fn delete_removes_and_never_reuses_ids() {
        let registry = registry_with("cat", &[]);
        let (tx, mut rx) = outbox();
        registry.register_connection("watcher", tx);

        let first = registry.create().await;
        let first_id = first.id().to_string();
        registry.delete(&first_id).expect("delete existing");

        assert!(registry.list().is_empty());
        assert!(registry.get(&first_id).is_none());
        assert!(first.is_closed());
        assert!(drain(&mut rx).iter().any(|m| matches!(
            m,
            Outbound::Message(ServerMessage::SessionDeleted { session_id }) if *session_id == first_id
        )));

        assert!(matches!(
            registry.delete(&first_id),
            Err(BrokerError::SessionNotFound(_))
        ));

        let second = registry.create().await;
        assert_ne!(second.id(), first_id);

        registry.shutdown();
    }

    #[tokio::test]
    async fn list_is_oldest_first() {
        let registry = registry_with("cat", &[]);
        let a = registry.create().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = registry.create().await;

        let ids: Vec<String> = registry.list().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![a.id().to_string(), b.id().to_string()]);

        registry.shutdown();
    }

    #[tokio::test]
    async fn reaps_only_unwatched_idle_sessions() {
        let registry = registry_with("cat", &[]);
        let retention = Duration::from_secs(60);

        let idle = registry.create().await;
        let watched = registry.create().await;
        let fresh = registry.create().await;

        let (tx, _rx) = outbox();
        assert!(watched.add_viewer("viewer", tx));

        idle.backdate_activity(Duration::from_secs(120));
        watched.backdate_activity(Duration::from_secs(120));

        let supervised = registry.create_with_policy(RestartPolicy::backoff()).await;
        supervised.backdate_activity(Duration::from_secs(120));

        let reaped = registry.reap_idle(retention);
        assert_eq!(reaped, vec![idle.id().to_string()]);
        assert!(idle.is_closed());
        assert!(registry.contains(watched.id()));
        assert!(registry.contains(fresh.id()));
        assert!(registry.contains(supervised.id()));

        registry.shutdown();
    }

    #[tokio::test]
    async fn shutdown_terminates_everything() {
        let registry = registry_with("cat", &[]);
        let a = registry.create().await;
        let b = registry.create().await;

        registry.shutdown();
        assert!(registry.is_empty());
        assert!(a.is_closed() && b.is_closed());
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown_signal() {
        let registry = registry_with("cat", &[]);
        let (tx, rx) = watch::channel(false);
        let sweeper = tokio::spawn(registry.clone().run_idle_sweeper(
            Duration::from_millis(10),
            Duration::from_secs(3600),
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).expect("sweeper listening");
        tokio::time::timeout(Duration::from_secs(5), sweeper)
            .await
            .expect("sweeper exits")
            .expect("sweeper task");
    }
}
