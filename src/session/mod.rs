//! # Terminal Sessions
//!
//! A [`TerminalSession`] owns one shell running inside a pseudo-terminal,
//! the history of what it printed, the queue of pending keyboard input and
//! the set of connections currently watching it.
//!
//! ## Process lifecycle
//!
//! ```text
//!   spawning ──► ready ──► exited
//!      ▲                     │
//!      └──── backoff ◄───────┘   (RestartPolicy::Backoff only)
//! ```
//!
//! ## Tasks per running process
//!
//! - **Output pump** (blocking pool): reads PTY output, appends it to the
//!   history and fans it out to every viewer under the session lock, so the
//!   history always reflects a chunk before any viewer receives it.
//! - **Write drain** (async): pops one queued input chunk, writes it to the
//!   PTY on the blocking pool, then yields before the next chunk. Only this
//!   task ever writes to the PTY, so input from one connection reaches the
//!   shell in the order it was sent.
//! - **Exit waiter** (async): waits for the child, lets the output pump
//!   finish, then moves the session to `exited` and notifies viewers.
//!
//! Viewer delivery never blocks: every connection has an unbounded
//! [`Outbox`] drained by its own socket task.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{RestartPolicy, ShellConfig};
use crate::error::BrokerError;
use crate::history::HistoryBuffer;
use crate::protocol::{Outbound, Outbox, ProcessState, ServerMessage, SessionInfo};

pub type SessionId = String;
pub type ConnectionId = String;

pub const MIN_COLS: u32 = 40;
pub const MAX_COLS: u32 = 1000;
pub const MIN_ROWS: u32 = 10;
pub const MAX_ROWS: u32 = 400;

const READ_CHUNK: usize = 8192;
/// How long the exit waiter lets the output pump flush after the child exits.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

pub struct TerminalSession {
    id: SessionId,
    created_at: DateTime<Utc>,
    shell: ShellConfig,
    restart_policy: RestartPolicy,
    state: Mutex<SessionState>,
}

struct SessionState {
    process_state: ProcessState,
    process: Option<PtyProcess>,
    /// Bumped on every successful spawn; stale pumps and waiters compare
    /// against it and back off.
    generation: u64,
    exit_code: Option<u32>,
    cols: u16,
    rows: u16,
    history: HistoryBuffer,
    viewers: HashMap<ConnectionId, Outbox>,
    last_activity: DateTime<Utc>,
    restart: RestartState,
    closed: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct RestartState {
    attempts: u32,
    next_attempt_at: Option<Instant>,
}

struct SpawnedPty {
    master: Box<dyn MasterPty + Send>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
}

struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    writes: mpsc::UnboundedSender<Vec<u8>>,
    pid: Option<u32>,
}

impl SessionState {
    fn broadcast(&self, msg: &Outbound) {
        for (connection_id, outbox) in &self.viewers {
            if outbox.send(msg.clone()).is_err() {
                debug!(connection_id = %connection_id, "viewer outbox closed, skipping");
            }
        }
    }

    fn is_ready(&self) -> bool {
        self.process_state == ProcessState::Ready && self.process.is_some()
    }
}

impl TerminalSession {
    /// Creates a session in the `spawning` state. Call [`start`](Self::start)
    /// to launch the shell.
    pub fn new(
        id: SessionId,
        shell: ShellConfig,
        history_capacity: usize,
        restart_policy: RestartPolicy,
    ) -> Arc<Self> {
        let now = Utc::now();
        let (cols, rows) = (shell.cols, shell.rows);
        Arc::new(Self {
            id,
            created_at: now,
            shell,
            restart_policy,
            state: Mutex::new(SessionState {
                process_state: ProcessState::Spawning,
                process: None,
                generation: 0,
                exit_code: None,
                cols,
                rows,
                history: HistoryBuffer::new(history_capacity),
                viewers: HashMap::new(),
                last_activity: now,
                restart: RestartState::default(),
                closed: false,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        self.restart_policy
    }

    /// Launches the shell. On failure the session is left `exited` and, under
    /// a backoff policy, a respawn is scheduled.
    pub async fn start(self: &Arc<Self>) -> Result<(), BrokerError> {
        match self.spawn_process().await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(session_id = %self.id, error = %e, "failed to start session process");
                if self.record_spawn_failure() {
                    self.schedule_restart();
                }
                Err(e)
            }
        }
    }

    async fn spawn_process(self: &Arc<Self>) -> Result<(), BrokerError> {
        let (cols, rows) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(BrokerError::SessionClosed(self.id.clone()));
            }
            state.process_state = ProcessState::Spawning;
            (state.cols, state.rows)
        };

        // openpty and fork/exec block, so they run off the async workers.
        let shell = self.shell.clone();
        let SpawnedPty {
            master,
            reader,
            writer,
            child,
        } = tokio::task::spawn_blocking(move || open_pty(&shell, cols, rows))
            .await
            .map_err(|e| BrokerError::Spawn(e.to_string()))??;

        let mut killer = child.clone_killer();
        let pid = child.process_id();
        let (writes_tx, writes_rx) = mpsc::unbounded_channel();

        let generation = {
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                let _ = killer.kill();
                tokio::spawn(wait_for_exit(child));
                return Err(BrokerError::SessionClosed(self.id.clone()));
            }
            state.generation += 1;
            state.process = Some(PtyProcess {
                master,
                killer,
                writes: writes_tx,
                pid,
            });
            state.process_state = ProcessState::Ready;
            state.exit_code = None;
            state.restart = RestartState::default();
            state.generation
        };

        let reader_task = {
            let session = Arc::clone(self);
            tokio::task::spawn_blocking(move || session.pump_output(generation, reader))
        };
        tokio::spawn(drain_writes(self.id.clone(), writer, writes_rx));

        let session = Arc::clone(self);
        tokio::spawn(async move {
            let code = wait_for_exit(child).await;
            if tokio::time::timeout(OUTPUT_DRAIN_GRACE, reader_task)
                .await
                .is_err()
            {
                debug!(session_id = %session.id, "output pump still running after exit");
            }
            session.handle_exit(generation, code);
        });

        info!(
            session_id = %self.id,
            pid = ?pid,
            cols,
            rows,
            "session process ready"
        );
        Ok(())
    }

    fn pump_output(&self, generation: u64, mut reader: Box<dyn Read + Send>) {
        let mut buffer = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => self.handle_output(generation, &buffer[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Linux reports EIO once the child side is gone.
                    debug!(session_id = %self.id, error = %e, "pty reader finished");
                    break;
                }
            }
        }
    }

    fn handle_output(&self, generation: u64, data: &[u8]) {
        let mut state = self.state.lock();
        // A background job can hold the pty open after the shell is reaped.
        if state.closed || state.generation != generation || state.process.is_none() {
            return;
        }
        state.history.append(data);
        state.last_activity = Utc::now();
        state.broadcast(&Outbound::Output(Bytes::copy_from_slice(data)));
    }

    fn handle_exit(self: &Arc<Self>, generation: u64, code: Option<u32>) {
        let restart = {
            let mut state = self.state.lock();
            if state.closed || state.generation != generation {
                return;
            }
            if state.process.take().is_none() {
                return;
            }
            state.process_state = ProcessState::Exited;
            state.exit_code = code;

            state.broadcast(
                &ServerMessage::SessionExited {
                    session_id: self.id.clone(),
                    code,
                }
                .into(),
            );
            let info = self.info_locked(&state);
            state.broadcast(&ServerMessage::SessionUpdated(info).into());

            state.restart.next_attempt_at = None;
            self.plan_restart(&mut state)
        };

        info!(session_id = %self.id, code = ?code, "session process exited");
        if restart {
            self.schedule_restart();
        }
    }

    /// Marks a failed spawn and plans the next attempt. Returns `true` when a
    /// respawn should be scheduled.
    fn record_spawn_failure(&self) -> bool {
        let mut state = self.state.lock();
        state.process_state = ProcessState::Exited;
        state.exit_code = None;
        state.restart.next_attempt_at = None;
        state.restart.attempts = state.restart.attempts.saturating_add(1);
        let planned = self.plan_restart(&mut state);

        let info = self.info_locked(&state);
        state.broadcast(&ServerMessage::SessionUpdated(info).into());
        planned
    }

    fn plan_restart(&self, state: &mut SessionState) -> bool {
        if state.closed {
            return false;
        }
        match self.restart_policy.delay_for(state.restart.attempts) {
            Some(delay) => {
                state.restart.next_attempt_at = Some(Instant::now() + delay);
                debug!(
                    session_id = %self.id,
                    attempts = state.restart.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "respawn scheduled"
                );
                true
            }
            None => false,
        }
    }

    fn next_restart_at(&self) -> Option<Instant> {
        let state = self.state.lock();
        if state.closed {
            None
        } else {
            state.restart.next_attempt_at
        }
    }

    fn schedule_restart(self: &Arc<Self>) {
        let session = Arc::clone(self);
        tokio::spawn(async move { session.supervise_restart().await });
    }

    async fn supervise_restart(self: Arc<Self>) {
        while let Some(deadline) = self.next_restart_at() {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            match self.spawn_process().await {
                Ok(()) => {
                    info!(session_id = %self.id, "session process restarted");
                    self.broadcast_info();
                    return;
                }
                Err(BrokerError::SessionClosed(_)) => return,
                Err(e) => {
                    warn!(session_id = %self.id, error = %e, "session restart failed");
                    self.record_spawn_failure();
                }
            }
        }
    }

    /// Queues input for the shell. Returns `false` (input dropped) unless the
    /// process is ready.
    pub fn write(&self, data: Vec<u8>) -> bool {
        if data.is_empty() {
            return false;
        }
        let mut state = self.state.lock();
        if !state.is_ready() {
            return false;
        }
        let queued = match &state.process {
            Some(process) => process.writes.send(data).is_ok(),
            None => false,
        };
        if queued {
            state.last_activity = Utc::now();
        }
        queued
    }

    /// Resizes the terminal for every viewer. Geometries outside
    /// `[40, 1000] x [10, 400]` are ignored and `false` is returned.
    pub fn resize(&self, cols: u32, rows: u32) -> bool {
        if !(MIN_COLS..=MAX_COLS).contains(&cols) || !(MIN_ROWS..=MAX_ROWS).contains(&rows) {
            debug!(session_id = %self.id, cols, rows, "ignoring out-of-range resize");
            return false;
        }
        let (cols, rows) = (cols as u16, rows as u16);

        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.cols = cols;
        state.rows = rows;
        if let Some(process) = &state.process {
            let size = PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            };
            if let Err(e) = process.master.resize(size) {
                warn!(session_id = %self.id, error = %e, "failed to resize pty");
            }
        }
        state.broadcast(
            &ServerMessage::Resized {
                session_id: self.id.clone(),
                cols,
                rows,
            }
            .into(),
        );
        true
    }

    /// Adds a viewer: it receives `joined-session`, then the full history
    /// snapshot, then every later output chunk. Returns `false` if the
    /// session has already been closed.
    pub fn add_viewer(&self, connection_id: &str, outbox: Outbox) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state
            .viewers
            .insert(connection_id.to_string(), outbox.clone());

        let info = self.info_locked(&state);
        let _ = outbox.send(
            ServerMessage::JoinedSession {
                session_id: self.id.clone(),
                info: info.clone(),
            }
            .into(),
        );
        let history = state.history.snapshot();
        debug!(
            session_id = %self.id,
            connection_id,
            history_bytes = history.len(),
            "viewer attached"
        );
        let _ = outbox.send(Outbound::History(Bytes::from(history)));
        state.broadcast(&ServerMessage::SessionUpdated(info).into());
        true
    }

    /// Removes a viewer. Returns whether it was attached.
    pub fn remove_viewer(&self, connection_id: &str) -> bool {
        let mut state = self.state.lock();
        if state.viewers.remove(connection_id).is_none() {
            return false;
        }
        debug!(session_id = %self.id, connection_id, "viewer detached");
        let info = self.info_locked(&state);
        state.broadcast(&ServerMessage::SessionUpdated(info).into());
        true
    }

    fn broadcast_info(&self) {
        let state = self.state.lock();
        let info = self.info_locked(&state);
        state.broadcast(&ServerMessage::SessionUpdated(info).into());
    }

    /// Kills the process (if alive), drops all viewers and prevents any
    /// further respawn. Returns once the kill signal has been sent.
    pub fn terminate(&self) {
        let process = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.viewers.clear();
            state.restart.next_attempt_at = None;
            state.process_state = ProcessState::Exited;
            state.process.take()
        };

        if let Some(mut process) = process {
            if let Err(e) = process.killer.kill() {
                debug!(session_id = %self.id, error = %e, "kill failed, process likely gone");
            }
            info!(session_id = %self.id, pid = ?process.pid, "session process killed");
        }
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.state.lock();
        self.info_locked(&state)
    }

    fn info_locked(&self, state: &SessionState) -> SessionInfo {
        let uptime = Utc::now()
            .signed_duration_since(self.created_at)
            .num_seconds()
            .max(0) as u64;
        SessionInfo {
            id: self.id.clone(),
            state: state.process_state,
            ready: state.is_ready(),
            viewers: state.viewers.len(),
            cols: state.cols,
            rows: state.rows,
            created_at: self.created_at,
            last_activity: state.last_activity,
            uptime,
            history_bytes: state.history.len(),
            exit_code: state.exit_code,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().is_ready()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn viewer_count(&self) -> usize {
        self.state.lock().viewers.len()
    }

    pub fn dimensions(&self) -> (u16, u16) {
        let state = self.state.lock();
        (state.cols, state.rows)
    }

    pub fn history_snapshot(&self) -> Vec<u8> {
        self.state.lock().history.snapshot()
    }

    /// True when nobody is watching and nothing happened for longer than
    /// `retention`.
    pub fn is_idle(&self, retention: Duration) -> bool {
        let state = self.state.lock();
        if !state.viewers.is_empty() {
            return false;
        }
        Utc::now()
            .signed_duration_since(state.last_activity)
            .to_std()
            .map(|idle| idle > retention)
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub(crate) fn backdate_activity(&self, by: Duration) {
        let mut state = self.state.lock();
        let by = chrono::Duration::from_std(by).expect("duration in range");
        state.last_activity -= by;
    }
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.id)
            .field("program", &self.shell.program)
            .field("restart_policy", &self.restart_policy)
            .finish_non_exhaustive()
    }
}

fn open_pty(shell: &ShellConfig, cols: u16, rows: u16) -> Result<SpawnedPty, BrokerError> {
    let pair = native_pty_system()
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| BrokerError::Pty(e.to_string()))?;
    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| BrokerError::Pty(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| BrokerError::Pty(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&shell.program);
    cmd.args(&shell.args);
    if let Some(cwd) = shell.cwd.clone().or_else(home_dir) {
        cmd.cwd(cwd);
    }
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| BrokerError::Spawn(e.to_string()))?;
    // Only the master side is needed; keeping the slave open would hide EOF.
    drop(pair.slave);

    Ok(SpawnedPty {
        master: pair.master,
        reader,
        writer,
        child,
    })
}

/// Writes queued input to the PTY one chunk at a time, yielding between
/// chunks so a large backlog cannot starve other sessions.
async fn drain_writes(
    session_id: SessionId,
    mut writer: Box<dyn Write + Send>,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(chunk) = queue.recv().await {
        let len = chunk.len();
        let result = tokio::task::spawn_blocking(move || {
            let outcome = writer.write_all(&chunk).and_then(|()| writer.flush());
            (writer, outcome)
        })
        .await;

        match result {
            Ok((returned, Ok(()))) => writer = returned,
            Ok((returned, Err(e))) => {
                warn!(session_id = %session_id, bytes = len, error = %e, "pty write failed");
                writer = returned;
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "pty writer task failed");
                break;
            }
        }
        tokio::task::yield_now().await;
    }
    debug!(session_id = %session_id, "write queue closed");
}

async fn wait_for_exit(mut child: Box<dyn Child + Send + Sync>) -> Option<u32> {
    match tokio::task::spawn_blocking(move || child.wait()).await {
        Ok(Ok(status)) => Some(status.exit_code()),
        Ok(Err(e)) => {
            warn!(error = %e, "failed to wait for shell process");
            None
        }
        Err(e) => {
            error!(error = %e, "shell waiter task failed");
            None
        }
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{outbox, output_bytes, recv_until, test_shell};

    const WAIT: Duration = Duration::from_secs(10);

    fn exited_messages(msgs: &[Outbound]) -> usize {
        msgs.iter()
            .filter(|m| matches!(m, Outbound::Message(ServerMessage::SessionExited { .. })))
            .count()
    }

    #[tokio::test]
    async fn writes_reach_the_shell_in_order() {
        let session = TerminalSession::new(
            "order".to_string(),
            test_shell("cat", &[]),
            4096,
            RestartPolicy::Never,
        );
        let (tx, mut rx) = outbox();
        assert!(session.add_viewer("viewer", tx));
        session.start().await.expect("spawn cat");

        for word in ["alpha\n", "bravo\n", "charlie\n"] {
            assert!(session.write(word.as_bytes().to_vec()));
        }

        let mut seen = Vec::new();
        recv_until(&mut rx, WAIT, |msg| {
            if let Outbound::Output(chunk) = msg {
                seen.extend_from_slice(chunk);
            }
            String::from_utf8_lossy(&seen).matches("charlie").count() >= 2
        })
        .await;

        let text = String::from_utf8_lossy(&seen).to_string();
        let a = text.find("alpha").expect("alpha echoed");
        let b = text.find("bravo").expect("bravo echoed");
        let c = text.find("charlie").expect("charlie echoed");
        assert!(a < b && b < c, "out of order: {text:?}");
        assert!(session.history_snapshot().starts_with(&seen));

        session.terminate();
    }

    #[tokio::test]
    async fn out_of_range_resize_is_ignored() {
        let session = TerminalSession::new(
            "resize".to_string(),
            test_shell("cat", &[]),
            4096,
            RestartPolicy::Never,
        );
        session.start().await.expect("spawn cat");
        let (tx, mut rx) = outbox();
        assert!(session.add_viewer("viewer", tx));
        while rx.try_recv().is_ok() {}

        assert!(!session.resize(20, 30));
        assert!(!session.resize(80, 401));
        assert_eq!(session.dimensions(), (80, 30));
        assert!(rx.try_recv().is_err(), "no resized broadcast expected");

        assert!(session.resize(132, 43));
        assert_eq!(session.dimensions(), (132, 43));
        match rx.try_recv() {
            Ok(Outbound::Message(ServerMessage::Resized { cols, rows, .. })) => {
                assert_eq!((cols, rows), (132, 43));
            }
            other => panic!("expected resized, got {other:?}"),
        }

        session.terminate();
    }

    #[tokio::test]
    async fn exit_is_reported_once_and_input_is_dropped() {
        let session = TerminalSession::new(
            "exit".to_string(),
            test_shell("/bin/sh", &["-c", "exit 3"]),
            4096,
            RestartPolicy::Never,
        );
        let (tx, mut rx) = outbox();
        assert!(session.add_viewer("viewer", tx));
        session.start().await.expect("spawn sh");

        let msgs = recv_until(&mut rx, WAIT, |msg| {
            matches!(msg, Outbound::Message(ServerMessage::SessionExited { .. }))
        })
        .await;
        match msgs.last() {
            Some(Outbound::Message(ServerMessage::SessionExited { session_id, code })) => {
                assert_eq!(session_id, "exit");
                assert_eq!(*code, Some(3));
            }
            other => panic!("expected session-exited, got {other:?}"),
        }

        assert!(!session.is_ready());
        assert_eq!(session.info().state, ProcessState::Exited);
        assert_eq!(session.info().exit_code, Some(3));
        assert!(!session.write(b"echo hi\n".to_vec()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut rest = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            rest.push(msg);
        }
        assert_eq!(exited_messages(&rest), 0);
        assert_eq!(session.info().state, ProcessState::Exited);

        session.terminate();
    }

    #[tokio::test]
    async fn backoff_policy_respawns_until_terminated() {
        let session = TerminalSession::new(
            "shared".to_string(),
            test_shell("/bin/sh", &["-c", "exit 0"]),
            4096,
            RestartPolicy::Backoff {
                initial: Duration::from_millis(50),
                max: Duration::from_millis(200),
            },
        );
        let (tx, mut rx) = outbox();
        assert!(session.add_viewer("viewer", tx));
        session.start().await.expect("spawn sh");

        let mut exits = 0;
        recv_until(&mut rx, WAIT, |msg| {
            if matches!(msg, Outbound::Message(ServerMessage::SessionExited { .. })) {
                exits += 1;
            }
            exits >= 2
        })
        .await;

        session.terminate();
        assert!(session.is_closed());
        assert!(session.next_restart_at().is_none());
    }

    #[tokio::test]
    async fn failed_spawn_leaves_session_exited() {
        let session = TerminalSession::new(
            "broken".to_string(),
            test_shell("/nonexistent/ptyshare-shell", &[]),
            4096,
            RestartPolicy::Never,
        );
        let _ = session.start().await;

        let deadline = Instant::now() + WAIT;
        while session.info().state != ProcessState::Exited {
            assert!(Instant::now() < deadline, "session never reached exited");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!session.is_ready());
        assert!(!session.write(b"x".to_vec()));

        session.terminate();
    }

    #[tokio::test]
    async fn closed_viewer_does_not_starve_the_others() {
        let session = TerminalSession::new(
            "fanout".to_string(),
            test_shell("cat", &[]),
            4096,
            RestartPolicy::Never,
        );
        let (gone_tx, gone_rx) = outbox();
        let (tx, mut rx) = outbox();
        assert!(session.add_viewer("gone", gone_tx));
        assert!(session.add_viewer("viewer", tx));
        drop(gone_rx);
        session.start().await.expect("spawn cat");

        for word in ["one\n", "two\n", "three\n"] {
            assert!(session.write(word.as_bytes().to_vec()));
        }

        let mut seen = Vec::new();
        recv_until(&mut rx, WAIT, |msg| {
            if let Outbound::Output(chunk) = msg {
                seen.extend_from_slice(chunk);
            }
            String::from_utf8_lossy(&seen).matches("three").count() >= 2
        })
        .await;

        let text = String::from_utf8_lossy(&seen);
        for word in ["one", "two", "three"] {
            assert_eq!(text.matches(word).count(), 2, "{text:?}");
        }
        assert_eq!(session.viewer_count(), 2);

        session.terminate();
    }

    #[tokio::test]
    async fn consecutive_spawn_failures_double_the_delay() {
        let session = TerminalSession::new(
            "flaky".to_string(),
            test_shell("cat", &[]),
            4096,
            RestartPolicy::Backoff {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(60),
            },
        );

        let before = Instant::now();
        assert!(session.record_spawn_failure());
        let first = session.next_restart_at().expect("respawn planned") - before;
        assert!(
            first >= Duration::from_secs(2) && first < Duration::from_secs(3),
            "{first:?}"
        );

        let before = Instant::now();
        assert!(session.record_spawn_failure());
        let second = session.next_restart_at().expect("respawn planned") - before;
        assert!(
            second >= Duration::from_secs(4) && second < Duration::from_secs(5),
            "{second:?}"
        );

        session.terminate();
        assert!(session.next_restart_at().is_none());
    }

    #[tokio::test]
    async fn output_without_a_live_process_is_discarded() {
        let session = TerminalSession::new(
            "stray".to_string(),
            test_shell("cat", &[]),
            4096,
            RestartPolicy::Never,
        );
        let (tx, mut rx) = outbox();
        assert!(session.add_viewer("viewer", tx));
        while rx.try_recv().is_ok() {}

        // Same generation as the reaped process, but nothing is running.
        session.handle_output(0, b"late");
        assert!(session.history_snapshot().is_empty());
        assert!(rx.try_recv().is_err());

        session.terminate();
    }

    #[tokio::test]
    async fn history_is_replayed_to_late_viewers() {
        let session = TerminalSession::new(
            "replay".to_string(),
            test_shell("/bin/sh", &["-c", "printf one; printf two; printf three; sleep 5"]),
            4096,
            RestartPolicy::Never,
        );
        session.start().await.expect("spawn sh");

        let deadline = Instant::now() + WAIT;
        while !String::from_utf8_lossy(&session.history_snapshot()).contains("three") {
            assert!(Instant::now() < deadline, "output never arrived");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let (tx, mut rx) = outbox();
        assert!(session.add_viewer("late", tx));
        let msgs = recv_until(&mut rx, WAIT, |msg| matches!(msg, Outbound::History(_))).await;
        assert!(matches!(
            msgs.first(),
            Some(Outbound::Message(ServerMessage::JoinedSession { .. }))
        ));
        match msgs.last() {
            Some(Outbound::History(bytes)) => assert_eq!(&bytes[..], b"onetwothree"),
            other => panic!("expected history, got {other:?}"),
        }
        assert!(output_bytes(&msgs).is_empty());

        session.terminate();
    }
}
