//! Helpers shared by the unit tests.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::ShellConfig;
use crate::protocol::{Outbound, Outbox};

pub(crate) fn test_shell(program: &str, args: &[&str]) -> ShellConfig {
    ShellConfig {
        program: program.to_string(),
        args: args.iter().map(|s| s.to_string()).collect(),
        cwd: Some(std::env::temp_dir()),
        cols: 80,
        rows: 30,
    }
}

pub(crate) fn outbox() -> (Outbox, mpsc::UnboundedReceiver<Outbound>) {
    mpsc::unbounded_channel()
}

/// Receives until `done` matches a message (inclusive). Panics on timeout.
pub(crate) async fn recv_until<F>(
    rx: &mut mpsc::UnboundedReceiver<Outbound>,
    within: Duration,
    mut done: F,
) -> Vec<Outbound>
where
    F: FnMut(&Outbound) -> bool,
{
    let mut received = Vec::new();
    let result = tokio::time::timeout(within, async {
        while let Some(msg) = rx.recv().await {
            let finished = done(&msg);
            received.push(msg);
            if finished {
                return true;
            }
        }
        false
    })
    .await;

    match result {
        Ok(true) => received,
        Ok(false) => panic!("outbox closed early after {received:?}"),
        Err(_) => panic!("timed out waiting, received {received:?}"),
    }
}

/// Concatenates the realtime output chunks in `msgs`.
pub(crate) fn output_bytes(msgs: &[Outbound]) -> Vec<u8> {
    msgs.iter()
        .filter_map(|m| match m {
            Outbound::Output(chunk) => Some(&chunk[..]),
            _ => None,
        })
        .flatten()
        .copied()
        .collect()
}

pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
    let mut msgs = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        msgs.push(msg);
    }
    msgs
}
