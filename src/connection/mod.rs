//! Per-connection command handling.
//!
//! A [`ConnectionHandler`] holds the state of one viewer socket: its outbox,
//! the session it is attached to (at most one), and its input token bucket.
//! The socket layer in [`server`](crate::server) decodes frames and calls
//! into it; everything the viewer should see is pushed to the outbox.

use tracing::{debug, info};
use uuid::Uuid;

use crate::protocol::{ClientMessage, Outbound, Outbox, ServerMessage};
use crate::rate_limit::TokenBucket;
use crate::registry::SessionRegistry;
use crate::session::{ConnectionId, SessionId};

pub struct ConnectionHandler {
    id: ConnectionId,
    registry: SessionRegistry,
    outbox: Outbox,
    attached: Option<SessionId>,
    bucket: TokenBucket,
}

impl ConnectionHandler {
    /// Registers a new connection so it receives registry-wide events.
    pub fn new(registry: SessionRegistry, outbox: Outbox) -> Self {
        let id = Uuid::new_v4().to_string();
        let limits = registry.config().rate_limit;
        registry.register_connection(&id, outbox.clone());
        debug!(connection_id = %id, "connection registered");
        Self {
            id,
            bucket: TokenBucket::new(limits.capacity, limits.refill_per_sec),
            registry,
            outbox,
            attached: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn attached(&self) -> Option<&str> {
        self.attached.as_deref()
    }

    pub async fn handle(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::ListSessions => self.list_sessions(),
            ClientMessage::CreateSession => self.create_session().await,
            ClientMessage::JoinSession { session_id } => self.attach(&session_id),
            ClientMessage::LeaveSession => self.detach(),
            ClientMessage::Input { data } => self.input(data.into_bytes()),
            ClientMessage::Resize { cols, rows } => self.resize(cols, rows),
            ClientMessage::DeleteSession { session_id } => self.delete_session(&session_id),
        }
    }

    pub fn list_sessions(&self) {
        self.send(ServerMessage::SessionsList {
            sessions: self.registry.list(),
        });
    }

    /// Creates a session and attaches this connection to it.
    pub async fn create_session(&mut self) {
        let session = self.registry.create().await;
        info!(connection_id = %self.id, session_id = %session.id(), "session created by viewer");
        self.attach(session.id());
    }

    /// Attaches to `session_id`, leaving the previous session first. An
    /// unknown id is reported and leaves the current attachment untouched.
    pub fn attach(&mut self, session_id: &str) {
        let Some(session) = self.registry.get(session_id) else {
            self.reject(format!("session not found: {session_id}"));
            return;
        };

        self.detach();
        if session.add_viewer(&self.id, self.outbox.clone()) {
            debug!(connection_id = %self.id, session_id, "attached");
            self.attached = Some(session_id.to_string());
        } else {
            self.reject(format!("session not found: {session_id}"));
        }
    }

    pub fn detach(&mut self) {
        let Some(previous) = self.attached.take() else {
            return;
        };
        if let Some(session) = self.registry.get(&previous) {
            session.remove_viewer(&self.id);
        }
    }

    /// Forwards keyboard input to the attached session, subject to the
    /// connection's token bucket. Input is dropped silently when detached,
    /// throttled or when the shell is not running.
    pub fn input(&mut self, data: Vec<u8>) {
        let Some(session_id) = self.attached.as_deref() else {
            return;
        };
        if data.is_empty() {
            return;
        }
        if !self.bucket.try_take(data.len()) {
            debug!(
                connection_id = %self.id,
                session_id,
                bytes = data.len(),
                "input throttled"
            );
            return;
        }
        if let Some(session) = self.registry.get(session_id) {
            session.write(data);
        }
    }

    pub fn resize(&mut self, cols: u32, rows: u32) {
        let Some(session_id) = self.attached.as_deref() else {
            return;
        };
        if let Some(session) = self.registry.get(session_id) {
            session.resize(cols, rows);
        }
    }

    pub fn delete_session(&mut self, session_id: &str) {
        match self.registry.delete(session_id) {
            Ok(()) => {
                if self.attached.as_deref() == Some(session_id) {
                    self.attached = None;
                }
                self.send(ServerMessage::Success {
                    message: format!("session {session_id} deleted"),
                });
            }
            Err(e) => self.reject(e.to_string()),
        }
    }

    /// Reports a problem to this viewer only.
    pub fn reject(&self, message: impl Into<String>) {
        self.send(ServerMessage::Error {
            message: message.into(),
        });
    }

    fn send(&self, msg: ServerMessage) {
        if self.outbox.send(Outbound::Message(msg)).is_err() {
            debug!(connection_id = %self.id, "outbox closed");
        }
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.detach();
        self.registry.unregister_connection(&self.id);
        debug!(connection_id = %self.id, "connection closed");
    }
}
