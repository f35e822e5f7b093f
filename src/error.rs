use thiserror::Error;

use crate::session::SessionId;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session {0} has been closed")]
    SessionClosed(SessionId),

    #[error("failed to spawn shell: {0}")]
    Spawn(String),

    #[error("pty error: {0}")]
    Pty(String),
}
