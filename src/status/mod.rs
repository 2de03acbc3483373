//! Run Status.
//!
//! Owns the "is a run in progress, and if so which one" state as a
//! single-threaded actor rather than a shared mutable slot guarded by a
//! monitor — the actor processes one message at a time from an `mpsc`
//! channel, which gives the same mutual exclusion a monitor would
//! without a lock anyone can forget to take. This is the one place the
//! at-most-one-run invariant and the "a finished run's report is
//! enqueued atomically with clearing the slot" guarantee both live:
//! since `Finished` handling enqueues the report and clears the slot in
//! the same synchronous step before the actor looks at its next message,
//! no interleaved `Snapshot` request can observe "no run in progress"
//! while the report is still unsent.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::config::AgentConfig;
use crate::protocol::RunIdentity;
use crate::queue::{OutgoingRequest, RequestQueueHandle};
use crate::run::{self, AbortSignal, RunDescriptor};

/// An owned snapshot of the in-progress run's identity, for building a
/// `Synchronize` request body outside the actor.
#[derive(Debug, Clone)]
pub enum CurrentRun {
    Execution(RunIdentity),
    Extraction(String),
}

impl CurrentRun {
    fn from_descriptor(descriptor: &RunDescriptor) -> Self {
        match descriptor {
            RunDescriptor::Execution(info) => CurrentRun::Execution(info.run.clone()),
            RunDescriptor::Extraction(info) => CurrentRun::Extraction(info.shadow_id.clone()),
        }
    }
}

enum Msg {
    Start(RunDescriptor),
    Abort,
    Snapshot(oneshot::Sender<Option<CurrentRun>>),
    Finished { report: Option<OutgoingRequest> },
}

/// Handle used by the sync loop to drive the run-status actor.
#[derive(Clone)]
pub struct StatusHandle {
    sender: mpsc::UnboundedSender<Msg>,
}

impl StatusHandle {
    /// Starts a new run if none is in progress; logs and ignores the
    /// request otherwise (the sync loop should not issue overlapping
    /// `<start>`/`<extract>` commands, but a protocol hiccup on the
    /// coordinator's side shouldn't crash the agent).
    pub fn start_task(&self, descriptor: RunDescriptor) {
        let _ = self.sender.send(Msg::Start(descriptor));
    }

    /// Delegates to the current run's abort signal, if any. A no-op
    /// when no run is in progress.
    pub fn abort_task(&self) {
        let _ = self.sender.send(Msg::Abort);
    }

    /// Returns a point-in-time snapshot of the in-progress run, if any,
    /// consistent with the atomicity guarantee above.
    pub async fn current_run(&self) -> Option<CurrentRun> {
        let (reply, rx) = oneshot::channel();
        if self.sender.send(Msg::Snapshot(reply)).is_err() {
            return None;
        }
        rx.await.unwrap_or(None)
    }
}

struct RunSlot {
    current: CurrentRun,
    abort: AbortSignal,
}

/// Spawns the run-status actor. `windows` is threaded through to every
/// run it starts (it never changes once the agent decides which
/// platform it runs on).
pub fn spawn(
    config: Arc<AgentConfig>,
    queue: RequestQueueHandle,
    windows: bool,
) -> (StatusHandle, tokio::task::JoinHandle<()>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let handle = StatusHandle { sender: sender.clone() };
    let worker = tokio::spawn(actor_loop(config, queue, windows, sender, receiver));
    (handle, worker)
}

async fn actor_loop(
    config: Arc<AgentConfig>,
    queue: RequestQueueHandle,
    windows: bool,
    self_sender: mpsc::UnboundedSender<Msg>,
    mut receiver: mpsc::UnboundedReceiver<Msg>,
) {
    let mut slot: Option<RunSlot> = None;

    while let Some(msg) = receiver.recv().await {
        match msg {
            Msg::Start(descriptor) => {
                if slot.is_some() {
                    warn!("start/extract received while a run is already in progress, ignoring");
                    continue;
                }
                let current = CurrentRun::from_descriptor(&descriptor);
                let abort = AbortSignal::new();
                slot = Some(RunSlot { current, abort: abort.clone() });

                let config = config.clone();
                let queue = queue.clone();
                let reply_to = self_sender.clone();
                tokio::spawn(async move {
                    let report = run::execute(descriptor, config, queue, windows, abort).await;
                    let _ = reply_to.send(Msg::Finished { report });
                });
            }
            Msg::Abort => {
                if let Some(run_slot) = &slot {
                    run_slot.abort.request();
                } else {
                    warn!("abort received with no run in progress, ignoring");
                }
            }
            Msg::Snapshot(reply) => {
                let _ = reply.send(slot.as_ref().map(|s| s.current.clone()));
            }
            Msg::Finished { report } => {
                if let Some(report) = report {
                    let _ = queue.submit(report);
                }
                slot = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControlCenterConfig, GenericConfig, OutputConfig};
    use crate::protocol::{ExecuteRunInfo, Task};
    use indexmap::IndexMap;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn sample_config() -> Arc<AgentConfig> {
        Arc::new(AgentConfig {
            control_center: ControlCenterConfig {
                server_base_url: "http://cc.example/".into(),
                token_id: "a".into(),
                token_pass: "b".into(),
            },
            output: OutputConfig {
                report_base_dir: PathBuf::from("/var/reports"),
                product_base_dir: PathBuf::from("/var/products"),
                report_base_url: None,
                product_base_url: None,
            },
            generic: GenericConfig { log_file: None, log_level: "INFO".into(), process_wrapper: None },
            wrapper_dirs: vec![],
            parameters: HashMap::new(),
        })
    }

    fn sample_descriptor() -> RunDescriptor {
        let mut task = Task::default();
        task.parameters.insert("sf.wrapper".into(), "never-resolves".into());
        RunDescriptor::Execution(ExecuteRunInfo {
            run: crate::protocol::RunIdentity {
                job_id: "J".into(),
                task_id: "T".into(),
                run_id: "0".into(),
            },
            task,
            inputs: IndexMap::new(),
            outputs: vec![],
            resources: IndexMap::new(),
        })
    }

    #[tokio::test]
    async fn snapshot_is_none_with_no_run_in_progress() {
        let config = sample_config();
        let (queue, _worker) = crate::queue::spawn(reqwest::Client::new(), config.clone());
        let (status, _worker) = spawn(config, queue, false);
        assert!(status.current_run().await.is_none());
    }

    #[tokio::test]
    async fn start_then_finish_clears_the_slot() {
        let config = sample_config();
        let (queue, _worker) = crate::queue::spawn(reqwest::Client::new(), config.clone());
        let (status, _worker) = spawn(config, queue, false);

        status.start_task(sample_descriptor());
        // The wrapper never resolves (empty wrapper_dirs), so the run
        // finishes almost immediately with an error result.
        for _ in 0..50 {
            if status.current_run().await.is_none() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("run slot never cleared");
    }

    #[tokio::test]
    async fn second_start_while_busy_is_ignored() {
        let config = sample_config();
        let (queue, _worker) = crate::queue::spawn(reqwest::Client::new(), config.clone());
        let (status, _worker) = spawn(config, queue, false);

        status.start_task(sample_descriptor());
        let first = status.current_run().await;
        status.start_task(sample_descriptor());
        let second = status.current_run().await;
        // Whether or not the first run had already finished by the time
        // we call start_task again is a race, but the actor never lets
        // two runs coexist: this just exercises the no-op path without
        // asserting on timing.
        let _ = (first, second);
    }

    #[tokio::test]
    async fn abort_with_no_run_is_a_no_op() {
        let config = sample_config();
        let (queue, _worker) = crate::queue::spawn(reqwest::Client::new(), config.clone());
        let (status, _worker) = spawn(config, queue, false);
        status.abort_task();
        assert!(status.current_run().await.is_none());
    }
}
