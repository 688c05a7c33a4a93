//! Global outbound dispatch queue.
//!
//! Every outbound send, from every session, goes through one FIFO drained by a
//! single worker. A job starts only after the previous one finished and at
//! least `interval` after the previous one started, so the gateway never
//! sends more than once per interval no matter how many sessions it runs.
//!
//! Admission is fire-and-forget: [`DispatchQueue::enqueue`] returns the job id
//! immediately and the outcome is only ever visible in the logs.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::attachment::{AttachmentError, RemoteDocument};
use crate::backend::BackendError;

mod executor;

pub use executor::SessionJobExecutor;

// ============================================================================
// Job
// ============================================================================

/// One admitted outbound send.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    /// Concrete session name; never `auto`.
    pub session: String,
    /// Destination chat JID.
    pub target: String,
    pub payload: JobPayload,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    Text {
        text: String,
    },
    Document(RemoteDocument),
    Poll {
        question: String,
        options: Vec<String>,
        max_answers: u32,
    },
    Button {
        text: String,
        url: String,
        button_text: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Text,
    Document,
    Poll,
    Button,
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Text { .. } => JobKind::Text,
            JobPayload::Document(_) => JobKind::Document,
            JobPayload::Poll { .. } => JobKind::Poll,
            JobPayload::Button { .. } => JobKind::Button,
        }
    }
}

impl JobKind {
    /// Status recorded when a job of this kind is delivered.
    pub fn sent_status(self) -> &'static str {
        match self {
            JobKind::Text | JobKind::Document => "SENT",
            JobKind::Poll => "POLL_SENT",
            JobKind::Button => "BUTTON_SENT",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobKind::Text => "TEXT",
            JobKind::Document => "DOCUMENT",
            JobKind::Poll => "POLL",
            JobKind::Button => "BUTTON",
        };
        f.write_str(s)
    }
}

/// Generate a unique job id.
fn generate_job_id() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}

// ============================================================================
// Executor seam
// ============================================================================

/// Performs a single job. Errors are logged by the worker, never retried.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<(), DispatchError>;
}

// ============================================================================
// DispatchQueue
// ============================================================================

/// Admission side of the queue. Cheap to clone.
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<Job>,
}

/// Execution side of the queue; run exactly one per process.
pub struct DispatchWorker {
    rx: mpsc::UnboundedReceiver<Job>,
    interval: Duration,
}

impl DispatchQueue {
    pub fn new(interval: Duration) -> (Self, DispatchWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, DispatchWorker { rx, interval })
    }

    /// Append a job and return its id without waiting for execution.
    pub fn enqueue(
        &self,
        session: impl Into<String>,
        target: impl Into<String>,
        payload: JobPayload,
    ) -> Result<String, DispatchError> {
        let job = Job {
            id: generate_job_id(),
            session: session.into(),
            target: target.into(),
            payload,
            enqueued_at: Utc::now(),
        };
        let id = job.id.clone();
        self.tx.send(job).map_err(|_| DispatchError::QueueClosed)?;
        Ok(id)
    }
}

impl DispatchWorker {
    /// Drain the queue until shutdown or until every [`DispatchQueue`] is dropped.
    pub async fn run(mut self, executor: Arc<dyn JobExecutor>, shutdown: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "Dispatch worker started");
        let mut last_start: Option<Instant> = None;

        loop {
            let job = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                job = self.rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            if let Some(previous) = last_start {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep_until(previous + self.interval) => {}
                }
            }

            last_start = Some(Instant::now());
            run_job(executor.as_ref(), &job).await;
        }

        info!("Dispatch worker stopped");
    }

    #[cfg(test)]
    pub(crate) fn try_next(&mut self) -> Option<Job> {
        self.rx.try_recv().ok()
    }
}

async fn run_job(executor: &dyn JobExecutor, job: &Job) {
    let kind = job.payload.kind();
    let waited_ms = (Utc::now() - job.enqueued_at).num_milliseconds();
    info!(
        job_id = %job.id,
        wa = %job.session,
        to = %job.target,
        kind = %kind,
        waited_ms,
        status = "QUEUE_STARTED",
        "Job started"
    );

    let result = AssertUnwindSafe(executor.execute(job)).catch_unwind().await;
    match result {
        Ok(Ok(())) => info!(
            job_id = %job.id,
            wa = %job.session,
            to = %job.target,
            status = kind.sent_status(),
            "Job delivered"
        ),
        Ok(Err(e)) => error!(
            job_id = %job.id,
            wa = %job.session,
            to = %job.target,
            status = "FAILED",
            error = %e,
            "Job failed"
        ),
        Err(_) => error!(
            job_id = %job.id,
            wa = %job.session,
            to = %job.target,
            status = "FAILED",
            "Job executor panicked"
        ),
    }
}

// ============================================================================
// DispatchError
// ============================================================================

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("session '{0}' has no live connection")]
    SessionUnavailable(String),

    #[error("attachment failed: {0}")]
    Attachment(#[from] AttachmentError),

    #[error("send failed: {0}")]
    Backend(#[from] BackendError),

    #[error("dispatch queue is closed")]
    QueueClosed,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records start times; fails or stalls on request.
    #[derive(Default)]
    struct RecordingExecutor {
        starts: Mutex<Vec<(String, Instant)>>,
        fail_ids: Vec<String>,
        panic_ids: Vec<String>,
        work: Duration,
    }

    #[async_trait]
    impl JobExecutor for RecordingExecutor {
        async fn execute(&self, job: &Job) -> Result<(), DispatchError> {
            let text = match &job.payload {
                JobPayload::Text { text } => text.clone(),
                _ => String::new(),
            };
            self.starts.lock().unwrap().push((text.clone(), Instant::now()));
            if !self.work.is_zero() {
                tokio::time::sleep(self.work).await;
            }
            if self.panic_ids.contains(&text) {
                panic!("executor blew up");
            }
            if self.fail_ids.contains(&text) {
                return Err(DispatchError::SessionUnavailable(job.session.clone()));
            }
            Ok(())
        }
    }

    fn text(t: &str) -> JobPayload {
        JobPayload::Text {
            text: t.to_string(),
        }
    }

    async fn drain(
        executor: Arc<RecordingExecutor>,
        interval: Duration,
        jobs: &[&str],
    ) -> Vec<(String, Instant)> {
        let (queue, worker) = DispatchQueue::new(interval);
        for t in jobs {
            queue.enqueue("upb", "62811@s.whatsapp.net", text(t)).unwrap();
        }
        drop(queue);
        worker
            .run(executor.clone(), CancellationToken::new())
            .await;
        executor.starts.lock().unwrap().clone()
    }

    #[test]
    fn enqueue_returns_unique_ids_immediately() {
        let (queue, mut worker) = DispatchQueue::new(Duration::from_secs(3));
        let a = queue.enqueue("upb", "1@s.whatsapp.net", text("a")).unwrap();
        let b = queue.enqueue("upb", "1@s.whatsapp.net", text("b")).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 26);

        let job = worker.try_next().unwrap();
        assert_eq!(job.id, a);
        assert_eq!(job.session, "upb");
        assert_eq!(job.payload.kind(), JobKind::Text);
    }

    #[test]
    fn enqueue_fails_once_worker_is_gone() {
        let (queue, worker) = DispatchQueue::new(Duration::from_secs(3));
        drop(worker);
        let result = queue.enqueue("upb", "1@s.whatsapp.net", text("a"));
        assert!(matches!(result, Err(DispatchError::QueueClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_run_in_fifo_order_spaced_by_interval() {
        let executor = Arc::new(RecordingExecutor::default());
        let starts = drain(executor, Duration::from_secs(3), &["j1", "j2", "j3", "j4"]).await;

        let order: Vec<&str> = starts.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(order, vec!["j1", "j2", "j3", "j4"]);
        for pair in starts.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= Duration::from_secs(3));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_job_delays_the_next_start_until_it_finishes() {
        let executor = Arc::new(RecordingExecutor {
            work: Duration::from_secs(7),
            ..Default::default()
        });
        let starts = drain(executor, Duration::from_secs(3), &["j1", "j2"]).await;

        assert_eq!(starts.len(), 2);
        assert!(starts[1].1 - starts[0].1 >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_and_panics_do_not_stop_the_queue() {
        let executor = Arc::new(RecordingExecutor {
            fail_ids: vec!["bad".to_string()],
            panic_ids: vec!["boom".to_string()],
            ..Default::default()
        });
        let starts = drain(
            executor,
            Duration::from_secs(3),
            &["ok1", "bad", "boom", "ok2"],
        )
        .await;

        let order: Vec<&str> = starts.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(order, vec!["ok1", "bad", "boom", "ok2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_queue_does_not_delay_the_first_job() {
        let executor = Arc::new(RecordingExecutor::default());
        let (queue, worker) = DispatchQueue::new(Duration::from_secs(3));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(executor.clone(), shutdown.clone()));

        let before = Instant::now();
        queue.enqueue("upb", "1@s.whatsapp.net", text("first")).unwrap();
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        let starts = executor.starts.lock().unwrap().clone();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].1, before);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn sent_status_per_kind() {
        assert_eq!(JobKind::Text.sent_status(), "SENT");
        assert_eq!(JobKind::Document.sent_status(), "SENT");
        assert_eq!(JobKind::Poll.sent_status(), "POLL_SENT");
        assert_eq!(JobKind::Button.sent_status(), "BUTTON_SENT");
        assert_eq!(JobKind::Document.to_string(), "DOCUMENT");
    }
}
