// src/feedback.rs
//! Stats persistence off the request path.
//!
//! A single worker drains a bounded FIFO queue, so a confirmation sent after a
//! record always sees that record. `flush()` resolves once everything queued
//! before it has been written. When the store falls behind and the queue is
//! full, new stats records are dropped (and counted) instead of blocking
//! detection; confirmations and flushes wait for room.

use std::sync::Arc;

use metrics::counter;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::DetectionError;
use crate::model::{CategoryId, DetectionStats, Feedback, FeedbackOutcome, StatsId};
use crate::store::DetectionStore;

#[derive(Debug, Clone, Copy)]
enum Answer {
    Explicit(Feedback),
    CorrectCategory(CategoryId),
}

enum Command {
    Record(Box<DetectionStats>),
    Confirm {
        id: StatsId,
        answer: Answer,
        reply: oneshot::Sender<Result<FeedbackOutcome, DetectionError>>,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct FeedbackRecorder {
    tx: mpsc::Sender<Command>,
}

impl FeedbackRecorder {
    /// Start the worker on the current tokio runtime with room for
    /// `capacity` pending commands.
    pub fn spawn(store: Arc<dyn DetectionStore>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(run(store, rx));
        Self { tx }
    }

    /// Queue a stats record without waiting. Returns false when it was dropped.
    pub fn record(&self, stats: DetectionStats) -> bool {
        let id = stats.id;
        match self.tx.try_send(Command::Record(Box::new(stats))) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                counter!("detection_stats_dropped_total").increment(1);
                warn!(target: "feedback", stats_id = %id, "feedback queue full, stats record dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                counter!("detection_stats_write_failures_total").increment(1);
                warn!(target: "feedback", stats_id = %id, "feedback worker gone, stats record dropped");
                false
            }
        }
    }

    /// Attach explicit feedback once.
    pub async fn confirm(
        &self,
        id: StatsId,
        confirmed: bool,
        corrected_category_id: Option<CategoryId>,
    ) -> Result<FeedbackOutcome, DetectionError> {
        self.send_confirm(
            id,
            Answer::Explicit(Feedback {
                confirmed,
                corrected_category_id,
            }),
        )
        .await
    }

    /// Attach feedback derived from the category the user settled on.
    pub async fn confirm_category(
        &self,
        id: StatsId,
        correct_category_id: CategoryId,
    ) -> Result<FeedbackOutcome, DetectionError> {
        self.send_confirm(id, Answer::CorrectCategory(correct_category_id))
            .await
    }

    async fn send_confirm(&self, id: StatsId, answer: Answer) -> Result<FeedbackOutcome, DetectionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Confirm { id, answer, reply })
            .await
            .map_err(|_| worker_gone())?;
        rx.await.map_err(|_| worker_gone())?
    }

    /// Wait until every command queued before this call has been processed.
    pub async fn flush(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

fn worker_gone() -> DetectionError {
    DetectionError::Persistence("feedback worker stopped".into())
}

async fn run(store: Arc<dyn DetectionStore>, mut rx: mpsc::Receiver<Command>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Record(stats) => {
                let id = stats.id;
                match store.insert_stats(*stats).await {
                    Ok(()) => debug!(target: "feedback", stats_id = %id, "stats recorded"),
                    Err(e) => {
                        counter!("detection_stats_write_failures_total").increment(1);
                        warn!(target: "feedback", stats_id = %id, error = %format!("{e:#}"), "stats write failed");
                    }
                }
            }
            Command::Confirm { id, answer, reply } => {
                let out = apply_confirm(store.as_ref(), id, answer).await;
                let _ = reply.send(out);
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!(target: "feedback", "worker stopped");
}

async fn apply_confirm(
    store: &dyn DetectionStore,
    id: StatsId,
    answer: Answer,
) -> Result<FeedbackOutcome, DetectionError> {
    let feedback = match answer {
        Answer::Explicit(f) => f,
        Answer::CorrectCategory(correct) => {
            let stats = store
                .get_stats(id)
                .await
                .map_err(DetectionError::persistence)?;
            match stats {
                None => return Ok(FeedbackOutcome::NotFound),
                Some(s) if s.has_feedback() => return Ok(FeedbackOutcome::AlreadySet),
                Some(s) => Feedback::from_correct_category(s.category_id, correct),
            }
        }
    };
    let outcome = store
        .set_feedback(id, feedback)
        .await
        .map_err(DetectionError::persistence)?;
    debug!(
        target: "feedback",
        stats_id = %id,
        confirmed = feedback.confirmed,
        outcome = ?outcome,
        "feedback"
    );
    Ok(outcome)
}
