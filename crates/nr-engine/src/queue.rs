//! In-process job queue with bounded retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::jobs::{Job, JobContext, JobOutcome};
use crate::{Error, Services};

/// A job together with its execution bookkeeping.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub job: Job,
    pub ctx: JobContext,
}

/// Sending half of the queue. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Envelope>,
    policy: RetryPolicy,
}

impl JobQueue {
    pub fn new(policy: RetryPolicy) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, policy }, rx)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Queue a job for immediate execution. Returns its execution id.
    pub fn dispatch(&self, job: Job) -> Uuid {
        let envelope = Envelope {
            job,
            ctx: JobContext::new(self.policy.max_attempts),
        };
        let id = envelope.ctx.execution_id;
        info!(job = envelope.job.name(), execution_id = %id, actor_id = ?envelope.job.actor_id(), "job queued");
        self.send(envelope);
        id
    }

    pub fn dispatch_after(&self, job: Job, delay: Duration) -> Uuid {
        let envelope = Envelope {
            job,
            ctx: JobContext::new(self.policy.max_attempts),
        };
        let id = envelope.ctx.execution_id;
        info!(job = envelope.job.name(), execution_id = %id, delay_secs = delay.as_secs(), "job queued with delay");
        self.requeue(envelope, delay);
        id
    }

    /// Put an envelope back after `delay`, keeping its context.
    pub fn requeue(&self, envelope: Envelope, delay: Duration) {
        if delay.is_zero() {
            self.send(envelope);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.send(envelope);
        });
    }

    fn send(&self, envelope: Envelope) {
        if let Err(e) = self.tx.send(envelope) {
            error!(job = e.0.job.name(), execution_id = %e.0.ctx.execution_id, "job queue closed, dropping job");
        }
    }
}

/// What the worker does after one execution.
#[derive(Debug)]
pub enum Next {
    Done,
    Requeue { envelope: Envelope, delay: Duration },
    /// Retries exhausted or the error was permanent; the failure hook already ran.
    Failed(Error),
}

/// Run one attempt of a job and decide what happens next.
pub async fn execute(svc: &Services, envelope: Envelope) -> Next {
    let Envelope { job, mut ctx } = envelope;
    let policy = svc.queue.policy();

    let result = match tokio::time::timeout(policy.attempt_timeout, job.run(svc, &ctx)).await {
        Ok(result) => result,
        Err(_) => Err(Error::AttemptTimeout(policy.attempt_timeout)),
    };

    match result {
        Ok(JobOutcome::Done) => {
            info!(job = job.name(), execution_id = %ctx.execution_id, attempt = ctx.attempt, "job done");
            Next::Done
        }
        Ok(JobOutcome::Reschedule(delay)) => {
            ctx.waits += 1;
            debug!(job = job.name(), execution_id = %ctx.execution_id, waits = ctx.waits, "job rescheduled");
            Next::Requeue {
                envelope: Envelope { job, ctx },
                delay,
            }
        }
        Err(e) if e.is_permanent() || ctx.is_final_attempt() => {
            error!(
                job = job.name(),
                execution_id = %ctx.execution_id,
                attempt = ctx.attempt,
                max_attempts = ctx.max_attempts,
                permanent = e.is_permanent(),
                error = %e,
                "job failed"
            );
            job.failed(svc, &e).await;
            Next::Failed(e)
        }
        Err(e) => {
            warn!(
                job = job.name(),
                execution_id = %ctx.execution_id,
                attempt = ctx.attempt,
                max_attempts = ctx.max_attempts,
                error = %e,
                "job attempt failed, retrying"
            );
            ctx.attempt += 1;
            Next::Requeue {
                envelope: Envelope { job, ctx },
                delay: policy.backoff,
            }
        }
    }
}

/// Start `count` workers draining the queue.
pub fn spawn_workers(
    svc: Services,
    rx: mpsc::UnboundedReceiver<Envelope>,
    count: usize,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..count.max(1))
        .map(|worker| {
            let svc = svc.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(envelope) = next else {
                        debug!(worker, "job queue closed, worker exiting");
                        break;
                    };
                    if let Next::Requeue { envelope, delay } = execute(&svc, envelope).await {
                        svc.queue.requeue(envelope, delay);
                    }
                }
            })
        })
        .collect()
}
