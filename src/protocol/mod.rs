//! # Viewer Wire Protocol
//!
//! Messages exchanged with viewers over the `/ws` WebSocket.
//!
//! ## Frames
//!
//! - **Text frames** carry JSON control messages tagged by `"type"`
//!   (kebab-case event names, camelCase fields).
//! - **Binary frames from the server** carry terminal bytes. The first byte
//!   is the frame kind ([`FRAME_OUTPUT`] or [`FRAME_HISTORY`]), the rest is
//!   raw output exactly as the shell produced it.
//! - **Binary frames from a viewer** are raw keyboard input.
//!
//! ```text
//! ┌──────┬──────────────────────────────┐
//! │ kind │ terminal bytes ...           │
//! └──────┴──────────────────────────────┘
//!   u8
//! ```

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Binary frame kind: realtime output.
pub const FRAME_OUTPUT: u8 = 0x00;
/// Binary frame kind: one-time history replay sent on attach.
pub const FRAME_HISTORY: u8 = 0x01;

/// Outbound queue of a single connection.
///
/// Unbounded so that fan-out from a session never waits on a slow viewer.
pub type Outbox = mpsc::UnboundedSender<Outbound>;

/// Viewer-to-server control messages (JSON text frames).
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Request the current session list.
    ListSessions,
    /// Spawn a new session; the requester is attached to it.
    CreateSession,
    /// Attach as a viewer, detaching from any previous session.
    #[serde(alias = "attach", alias = "join")]
    JoinSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Detach from the current session.
    LeaveSession,
    /// Keystrokes for the attached session.
    Input { data: String },
    /// Resize the attached session.
    Resize { cols: u32, rows: u32 },
    /// Kill and remove a session.
    DeleteSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

/// Lifecycle of the process behind a session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Spawning,
    Ready,
    Exited,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ProcessState::Spawning => "spawning",
            ProcessState::Ready => "ready",
            ProcessState::Exited => "exited",
        };
        f.write_str(label)
    }
}

/// Session metadata as reported to viewers and the admin endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub state: ProcessState,
    pub ready: bool,
    pub viewers: usize,
    pub cols: u16,
    pub rows: u16,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Seconds since the session was created.
    pub uptime: u64,
    pub history_bytes: usize,
    pub exit_code: Option<u32>,
}

/// Server-to-viewer control messages (JSON text frames).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    SessionsList {
        sessions: Vec<SessionInfo>,
    },
    SessionCreated(SessionInfo),
    JoinedSession {
        #[serde(rename = "sessionId")]
        session_id: String,
        info: SessionInfo,
    },
    Resized {
        #[serde(rename = "sessionId")]
        session_id: String,
        cols: u16,
        rows: u16,
    },
    SessionDeleted {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    SessionExited {
        #[serde(rename = "sessionId")]
        session_id: String,
        code: Option<u32>,
    },
    SessionUpdated(SessionInfo),
    Error {
        message: String,
    },
    Success {
        message: String,
    },
}

/// Everything a connection can be asked to deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    /// Realtime output chunk, shared between all viewers of a session.
    Output(Bytes),
    /// History snapshot sent once on attach.
    History(Bytes),
    /// Transport keep-alive, sent only by the socket loop.
    Ping,
}

impl From<ServerMessage> for Outbound {
    fn from(msg: ServerMessage) -> Self {
        Outbound::Message(msg)
    }
}

/// Builds a server binary frame: `[kind][bytes...]`.
pub fn encode_frame(kind: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + data.len());
    frame.push(kind);
    frame.extend_from_slice(data);
    frame
}

/// Splits a server binary frame into its kind and payload.
pub fn decode_frame(frame: &[u8]) -> Option<(u8, &[u8])> {
    let (kind, data) = frame.split_first()?;
    match *kind {
        FRAME_OUTPUT | FRAME_HISTORY => Some((*kind, data)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_info() -> SessionInfo {
        let now = Utc::now();
        SessionInfo {
            id: "abc".to_string(),
            state: ProcessState::Ready,
            ready: true,
            viewers: 2,
            cols: 80,
            rows: 30,
            created_at: now,
            last_activity: now,
            uptime: 5,
            history_bytes: 12,
            exit_code: None,
        }
    }

    #[test]
    fn parses_client_messages() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"list-sessions"}"#).unwrap();
        assert_eq!(msg, ClientMessage::ListSessions);

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"join-session","sessionId":"s-1"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinSession {
                session_id: "s-1".to_string()
            }
        );

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"attach","sessionId":"s-2"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinSession {
                session_id: "s-2".to_string()
            }
        );

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!(msg, ClientMessage::Resize { cols: 120, rows: 40 });

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"delete-session","sessionId":"s-3"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::DeleteSession {
                session_id: "s-3".to_string()
            }
        );
    }

    #[test]
    fn rejects_unknown_message_type() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"format-disk"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"resize","cols":-1,"rows":2}"#).is_err());
    }

    #[test]
    fn session_info_uses_camel_case() {
        let value = serde_json::to_value(sample_info()).unwrap();
        assert_eq!(value["historyBytes"], json!(12));
        assert_eq!(value["state"], json!("ready"));
        assert!(value.get("createdAt").is_some());
        assert!(value.get("lastActivity").is_some());
        assert_eq!(value["exitCode"], json!(null));
    }

    #[test]
    fn server_messages_are_tagged() {
        let value = serde_json::to_value(ServerMessage::SessionExited {
            session_id: "abc".to_string(),
            code: Some(3),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "session-exited", "sessionId": "abc", "code": 3})
        );

        let value = serde_json::to_value(ServerMessage::SessionCreated(sample_info())).unwrap();
        assert_eq!(value["type"], json!("session-created"));
        assert_eq!(value["id"], json!("abc"));
    }

    #[test]
    fn binary_frames_carry_kind_prefix() {
        let frame = encode_frame(FRAME_HISTORY, b"\x1b[1mhi");
        assert_eq!(frame[0], FRAME_HISTORY);
        assert_eq!(decode_frame(&frame), Some((FRAME_HISTORY, &b"\x1b[1mhi"[..])));
        assert_eq!(decode_frame(&[FRAME_OUTPUT]), Some((FRAME_OUTPUT, &b""[..])));
        assert!(decode_frame(&[]).is_none());
        assert!(decode_frame(&[0x7f, 1, 2]).is_none());
    }
}
