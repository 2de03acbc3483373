//! Sync Loop.
//!
//! A cooperative, single-threaded loop: submit a `Synchronize` request
//! describing the current run (if any), wait for the reply, dispatch
//! every command in the response's document order, then sleep for
//! whatever the response's `<wait>` commands accumulated (last one
//! wins) before looping again. A malformed response — most likely a
//! protocol version mismatch between this agent and the coordinator —
//! is logged and treated like a permanent failure rather than crashing
//! the loop.

use std::time::Duration;

use tracing::{info, warn};

use crate::errors::ProtocolError;
use crate::protocol::{self, Command};
use crate::queue::{QueueOutcome, RequestQueueHandle};
use crate::run::RunDescriptor;
use crate::status::{CurrentRun, StatusHandle};

/// Backoff applied after a permanently-failed `Synchronize` request or
/// an unparseable response, so a persistent mismatch doesn't turn into
/// a tight retry loop.
const DEFAULT_SYNC_DELAY_MS: u64 = 10_000;

/// Drives the loop until the coordinator sends `<exit/>` or the request
/// queue shuts down underneath it.
pub async fn run(status: StatusHandle, queue: RequestQueueHandle, host: String, runner_version: String) {
    let mut delay_ms: u64 = 0;

    loop {
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        let current = status.current_run().await;
        let body_current = current.as_ref().map(as_protocol_current_run);
        let request = protocol::build_synchronize_request(&host, &runner_version, body_current);

        let outcome = match queue.submit(request).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("request queue worker is gone, stopping sync loop");
                return;
            }
        };

        let xml = match outcome {
            QueueOutcome::Replied(text) => text,
            QueueOutcome::Failed(err) => {
                warn!(error = %err, "synchronize request failed permanently, backing off");
                delay_ms = DEFAULT_SYNC_DELAY_MS;
                continue;
            }
        };

        let commands = match protocol::parse_response(&xml) {
            Ok(commands) => commands,
            Err(err) => {
                warn!(error = %err, "malformed response, probable protocol version mismatch");
                delay_ms = DEFAULT_SYNC_DELAY_MS;
                continue;
            }
        };

        let (next_delay_ms, exit_requested) = apply_commands(&status, commands);
        if exit_requested {
            info!("exit command received, stopping sync loop");
            return;
        }
        delay_ms = next_delay_ms;
    }
}

fn as_protocol_current_run(current: &CurrentRun) -> protocol::CurrentRun<'_> {
    match current {
        CurrentRun::Execution(run) => protocol::CurrentRun::Execution(run),
        CurrentRun::Extraction(shadow_id) => protocol::CurrentRun::Extraction(shadow_id.as_str()),
    }
}

/// Dispatches every command in document order, starting/aborting runs
/// through `status` as a side effect, and returns the delay accumulated
/// from `<wait>` commands (last one wins) plus whether `<exit/>` was
/// seen. A parse error for one element is logged and otherwise ignored
/// — the stream keeps being processed.
fn apply_commands(
    status: &StatusHandle,
    commands: Vec<Result<Command, ProtocolError>>,
) -> (u64, bool) {
    let mut next_delay_ms = 0u64;
    let mut exit_requested = false;

    for command in commands {
        match command {
            Ok(Command::Start(info)) => status.start_task(RunDescriptor::Execution(info)),
            Ok(Command::Extract(info)) => status.start_task(RunDescriptor::Extraction(info)),
            Ok(Command::Abort) => status.abort_task(),
            Ok(Command::Wait { seconds }) => next_delay_ms = seconds * 1000,
            Ok(Command::Exit) => {
                exit_requested = true;
                next_delay_ms = 0;
            }
            Err(err) => {
                warn!(error = %err, "invalid command in response, probable protocol version mismatch");
            }
        }
    }

    (next_delay_ms, exit_requested)
}
