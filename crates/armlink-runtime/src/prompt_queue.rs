//! [`PromptQueue`] – single-consumer queue in front of the
//! [`ConversationManager`].
//!
//! Connection loops hand prompts over with [`PromptQueue::enqueue`], which
//! never waits: the read loop keeps consuming inbound messages while one
//! worker task works through the queue in arrival order.  At most one model
//! round trip is in flight per gateway, and a bounded capacity caps the
//! backlog.
//!
//! Every accepted prompt yields a [`PromptTicket`] that resolves to the
//! round trip's result, so failures stay observable even when the submitter
//! does not wait for them.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::conversation::{ConversationError, ConversationManager, SubmitOutcome};

/// Why a prompt was not accepted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("prompt queue is full")]
    Full,
    #[error("prompt worker has stopped")]
    Closed,
}

type JobResult = Result<SubmitOutcome, ConversationError>;

struct PromptJob {
    instruction: String,
    done: oneshot::Sender<JobResult>,
}

/// Completion handle of one queued prompt.
pub struct PromptTicket(oneshot::Receiver<JobResult>);

impl PromptTicket {
    /// Wait for the round trip.  Returns `None` if the worker stopped before
    /// processing the prompt.
    pub async fn wait(self) -> Option<JobResult> {
        self.0.await.ok()
    }
}

/// Cloneable submission side of the queue.
#[derive(Clone)]
pub struct PromptQueue {
    tx: mpsc::Sender<PromptJob>,
}

impl PromptQueue {
    /// Spawn the worker on the current Tokio runtime.  The worker exits once
    /// every `PromptQueue` clone has been dropped and the backlog is drained.
    pub fn spawn(manager: Arc<ConversationManager>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(manager, rx));
        (Self { tx }, worker)
    }

    /// Queue `instruction` without waiting.
    ///
    /// # Errors
    ///
    /// [`EnqueueError::Full`] when the backlog is at capacity,
    /// [`EnqueueError::Closed`] when the worker is gone.
    pub fn enqueue(&self, instruction: impl Into<String>) -> Result<PromptTicket, EnqueueError> {
        let (done, rx) = oneshot::channel();
        let job = PromptJob {
            instruction: instruction.into(),
            done,
        };
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })?;
        Ok(PromptTicket(rx))
    }
}

async fn run_worker(manager: Arc<ConversationManager>, mut rx: mpsc::Receiver<PromptJob>) {
    while let Some(job) = rx.recv().await {
        info!(instruction = %job.instruction, "processing prompt");
        let result = manager.submit(&job.instruction).await;
        match &result {
            Ok(SubmitOutcome::Written { path, .. }) => {
                info!(path = %path.display(), "prompt completed");
            }
            Ok(SubmitOutcome::NoPayload { .. }) => {
                warn!("prompt completed without a trajectory");
            }
            Err(e) => warn!(error = %e, "prompt failed"),
        }
        // The submitter may have dropped its ticket; that is fine.
        let _ = job.done.send(result);
    }
    info!("prompt worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::tests::ScriptedClient;
    use crate::conversation::{ChatHistory, TokenBudget, TrajectorySink};
    use crate::llm_driver::{LlmError, Role};

    fn manager(client: Arc<ScriptedClient>, dir: &std::path::Path) -> Arc<ConversationManager> {
        Arc::new(ConversationManager::new(
            ChatHistory::new("prime"),
            client,
            "m",
            TokenBudget::default(),
            TrajectorySink::new(dir.join("out.json")),
        ))
    }

    #[tokio::test]
    async fn prompts_are_processed_in_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient::new(vec![
            Ok("{\"n\":1}".to_string()),
            Ok("{\"n\":2}".to_string()),
            Ok("{\"n\":3}".to_string()),
        ]);
        let mgr = manager(Arc::clone(&client), dir.path());
        let (queue, _worker) = PromptQueue::spawn(Arc::clone(&mgr), 8);

        let tickets: Vec<_> = ["first", "second", "third"]
            .into_iter()
            .map(|p| queue.enqueue(p).unwrap())
            .collect();
        for ticket in tickets {
            assert!(ticket.wait().await.unwrap().is_ok());
        }

        let history = mgr.history().await;
        let users: Vec<&str> = history
            .turns()
            .iter()
            .filter(|t| t.role == Role::User)
            .map(|t| t.content.as_str())
            .collect();
        assert_eq!(users, vec!["first", "second", "third"]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out.json")).unwrap(),
            "{\"n\":3}"
        );
    }

    #[tokio::test]
    async fn failures_are_reported_through_the_ticket() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient::new(vec![
            Err(LlmError::BadResponse("boom".into())),
            Ok("{\"ok\":true}".to_string()),
        ]);
        let (queue, _worker) = PromptQueue::spawn(manager(client, dir.path()), 4);

        let failed = queue.enqueue("one").unwrap().wait().await.unwrap();
        assert!(matches!(failed, Err(ConversationError::Llm(_))));

        // The worker survives a failed round trip.
        let ok = queue.enqueue("two").unwrap().wait().await.unwrap();
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn full_queue_rejects_without_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient::new(Vec::new());
        let mgr = manager(client, dir.path());
        // Hold the history lock so the worker cannot finish its first job.
        let (queue, _worker) = PromptQueue::spawn(Arc::clone(&mgr), 1);
        let guard = mgr.history_lock_for_test().await;

        let mut results = Vec::new();
        for i in 0..4 {
            results.push(queue.enqueue(format!("p{i}")));
        }
        assert!(results.iter().any(|r| matches!(r, Err(EnqueueError::Full))));
        drop(guard);
    }

    #[tokio::test]
    async fn worker_stops_when_queue_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient::new(Vec::new());
        let (queue, worker) = PromptQueue::spawn(manager(client, dir.path()), 2);
        drop(queue);
        worker.await.unwrap();
    }
}
