//! # Command-line Clients
//!
//! Two small clients for a running broker:
//!
//! - **`ptyshare sessions`** queries the read-only admin endpoint and prints
//!   a table (or raw JSON with `--json`).
//! - **`ptyshare attach [SESSION_ID]`** turns the local terminal into a
//!   viewer: it joins a session over `/ws` (creating one when no id is
//!   given), forwards keystrokes, and prints the session's output.
//!
//! ## Attach Data Flow
//!
//! ```text
//! ┌─────────────┐   stdin (raw)  ┌─────────────┐  binary frames  ┌─────────────┐
//! │   Local     │───────────────►│   attach    │────────────────►│   Broker    │
//! │   Terminal  │                │   client    │                 │   /ws       │
//! │             │◄───────────────│             │◄────────────────│             │
//! └─────────────┘     stdout     └─────────────┘  history/output └─────────────┘
//! ```
//!
//! Press `Ctrl-]` to detach without touching the remote shell.
//!
//! ## Example Usage
//!
//! ```bash
//! ptyshare sessions --port 3000
//! ptyshare sessions --json
//! ptyshare attach
//! ptyshare attach 4f1c2a9e-...
//! ```

use std::io::{Read, Write};

use anyhow::{Context, Result, ensure};
use clap::Parser;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};

use crate::protocol::{ClientMessage, ProcessState, ServerMessage, SessionInfo, decode_frame};

/// `Ctrl-]`: ends `attach` locally.
pub const DETACH_KEY: u8 = 0x1d;

#[derive(Parser, Debug)]
#[command(author, version, about = "List the sessions of a running broker")]
pub struct SessionsArgs {
    /// Broker host
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Broker port
    #[arg(long, default_value_t = 3000)]
    pub port: u16,

    /// Print the raw JSON returned by the broker
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Attach the local terminal to a shared session")]
pub struct AttachArgs {
    /// Session to join. A new session is created when omitted.
    pub session_id: Option<String>,

    /// Broker host
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Broker port
    #[arg(long, default_value_t = 3000)]
    pub port: u16,
}

/// Fetches `/api/sessions` and prints it.
pub async fn run_sessions(args: SessionsArgs) -> Result<()> {
    let url = format!("http://{}:{}/api/sessions", args.host, args.port);
    info!("Fetching sessions from {}", url);

    let response = Client::new()
        .get(&url)
        .send()
        .await
        .with_context(|| format!("broker unreachable at {}:{}", args.host, args.port))?;
    ensure!(
        response.status().is_success(),
        "broker returned unexpected status: {}",
        response.status()
    );

    let sessions: Vec<SessionInfo> = response.json().await?;
    info!("Received {} sessions", sessions.len());

    if args.json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
    } else {
        print!("{}", format_table(&sessions));
    }
    Ok(())
}

/// Renders sessions as a fixed-width table.
pub fn format_table(sessions: &[SessionInfo]) -> String {
    if sessions.is_empty() {
        return "no sessions\n".to_string();
    }

    let mut out = format!(
        "{:<36}  {:<10}  {:>7}  {:>9}  {:>8}  {:>9}\n",
        "ID", "STATE", "VIEWERS", "SIZE", "UPTIME", "HISTORY"
    );
    for session in sessions {
        let state = match (session.state, session.exit_code) {
            (ProcessState::Exited, Some(code)) => format!("exited({code})"),
            (state, _) => state.to_string(),
        };
        out.push_str(&format!(
            "{:<36}  {:<10}  {:>7}  {:>9}  {:>8}  {:>9}\n",
            session.id,
            state,
            session.viewers,
            format!("{}x{}", session.cols, session.rows),
            format_uptime(session.uptime),
            session.history_bytes,
        ));
    }
    out
}

fn format_uptime(secs: u64) -> String {
    let (hours, minutes, seconds) = (secs / 3600, secs / 60 % 60, secs % 60);
    if hours > 0 {
        format!("{hours}h{minutes:02}m")
    } else if minutes > 0 {
        format!("{minutes}m{seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

/// What the attach loop should do after a control message.
#[derive(Debug, PartialEq, Eq)]
enum Control {
    Continue,
    Joined(String),
    Stop(String),
}

fn interpret(msg: &ServerMessage, joined: Option<&str>) -> Control {
    match msg {
        ServerMessage::JoinedSession { session_id, .. } => Control::Joined(session_id.clone()),
        ServerMessage::SessionExited { session_id, code } if joined == Some(session_id.as_str()) => {
            Control::Stop(match code {
                Some(code) => format!("session exited with code {code}"),
                None => "session exited".to_string(),
            })
        }
        ServerMessage::SessionDeleted { session_id } if joined == Some(session_id.as_str()) => {
            Control::Stop("session deleted".to_string())
        }
        ServerMessage::Error { message } if joined.is_none() => Control::Stop(message.clone()),
        _ => Control::Continue,
    }
}

/// Cuts `data` at the detach key. Returns the bytes to forward and whether
/// the key was pressed.
fn split_at_detach(mut data: Vec<u8>) -> (Vec<u8>, bool) {
    match data.iter().position(|&b| b == DETACH_KEY) {
        Some(pos) => {
            data.truncate(pos);
            (data, true)
        }
        None => (data, false),
    }
}

fn text(msg: &ClientMessage) -> Result<Message> {
    Ok(Message::Text(serde_json::to_string(msg)?.into()))
}

/// Attaches the local terminal to a session until it exits, is deleted,
/// the connection drops or the user detaches.
pub async fn run_attach(args: AttachArgs) -> Result<()> {
    let url = format!("ws://{}:{}/ws", args.host, args.port);
    info!("Connecting to broker WebSocket: {}", url);

    let (ws_stream, _) = connect_async(&url)
        .await
        .with_context(|| format!("broker unreachable at {}:{}", args.host, args.port))?;
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    let request = match &args.session_id {
        Some(id) => ClientMessage::JoinSession {
            session_id: id.clone(),
        },
        None => ClientMessage::CreateSession,
    };
    ws_sink.send(text(&request)?).await?;

    enable_raw_mode().unwrap_or_else(|e| {
        eprintln!("Failed to enable raw mode: {e}");
    });
    ctrlc::set_handler(move || {
        let _ = disable_raw_mode();
        std::process::exit(0);
    })
    .unwrap_or_else(|e| {
        eprintln!("Failed to set signal handler: {e}");
    });

    // A plain thread: a blocked stdin read must not hold up runtime shutdown.
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buffer = [0u8; 1024];
        loop {
            match stdin.read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdin_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut joined: Option<String> = None;
    let outcome: Result<String> = loop {
        tokio::select! {
            input = stdin_rx.recv() => {
                let Some(data) = input else {
                    break Ok("stdin closed".to_string());
                };
                let (data, detach) = split_at_detach(data);
                if !data.is_empty() && joined.is_some() {
                    if let Err(e) = ws_sink.send(Message::Binary(data.into())).await {
                        break Err(e.into());
                    }
                }
                if detach {
                    break Ok("detached".to_string());
                }
            }
            frame = ws_stream.next() => {
                match frame {
                    Some(Ok(Message::Binary(frame))) => {
                        if let Some((_, bytes)) = decode_frame(&frame) {
                            let mut stdout = std::io::stdout().lock();
                            if stdout.write_all(bytes).and_then(|()| stdout.flush()).is_err() {
                                break Ok("stdout closed".to_string());
                            }
                        }
                    }
                    Some(Ok(Message::Text(body))) => {
                        let msg = match serde_json::from_str::<ServerMessage>(&body) {
                            Ok(msg) => msg,
                            Err(e) => {
                                warn!("Ignoring unparseable broker message: {}", e);
                                continue;
                            }
                        };
                        match interpret(&msg, joined.as_deref()) {
                            Control::Joined(id) => {
                                info!("Joined session: {}", id);
                                if let Ok((cols, rows)) = crossterm::terminal::size() {
                                    let resize = ClientMessage::Resize {
                                        cols: cols.into(),
                                        rows: rows.into(),
                                    };
                                    let sent = match text(&resize) {
                                        Ok(frame) => ws_sink.send(frame).await.map_err(anyhow::Error::from),
                                        Err(e) => Err(e),
                                    };
                                    if let Err(e) = sent {
                                        break Err(e);
                                    }
                                }
                                joined = Some(id);
                            }
                            Control::Stop(reason) => break Ok(reason),
                            Control::Continue => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok("connection closed".to_string()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e.into()),
                }
            }
        }
    };

    let _ = disable_raw_mode();
    let _ = ws_sink.send(Message::Close(None)).await;

    match outcome {
        Ok(reason) => {
            println!("\r\n[ptyshare: {reason}]");
            info!("Attach ended: {}", reason);
            Ok(())
        }
        Err(e) => {
            error!("Attach failed: {}", e);
            Err(e)
        }
    }
}
