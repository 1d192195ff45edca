#![forbid(unsafe_code)]

//! Bounded-concurrency executor for video tasks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::retry::RetryPolicy;

/// Without cookies the host throttles hard; more than two parallel downloads
/// mostly buys rate-limit errors.
pub const UNAUTHENTICATED_WORKER_CAP: usize = 2;

/// Worker count before clamping to the amount of pending work.
///
/// An explicit value always wins. Otherwise authenticated runs use the
/// available parallelism and anonymous runs are capped.
pub fn resolve_worker_count(
    has_auth: bool,
    explicit: Option<usize>,
    available_parallelism: usize,
) -> usize {
    let count = match explicit {
        Some(explicit) => explicit,
        None if has_auth => available_parallelism,
        None => available_parallelism.min(UNAUTHENTICATED_WORKER_CAP),
    };
    count.max(1)
}

/// Host parallelism, falling back to a single worker when unknown.
pub fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

/// What happened to the submitted jobs.
#[derive(Debug)]
pub struct PoolOutcome<J, R> {
    pub completed: Vec<R>,
    /// Jobs never dispatched because the run was cancelled.
    pub not_started: Vec<J>,
    /// Jobs whose task panicked before producing a result.
    pub panicked: Vec<J>,
}

pub struct WorkerPool {
    workers: usize,
    policy: RetryPolicy,
}

impl WorkerPool {
    pub fn new(workers: usize, policy: RetryPolicy) -> Self {
        Self {
            workers: workers.max(1),
            policy,
        }
    }

    /// Runs `handler` for every job with at most `workers` in flight.
    ///
    /// `on_complete` sees each result as soon as its task finishes, in
    /// completion order. Once `cancel` fires no further job is dispatched;
    /// tasks already running are awaited, never aborted.
    ///
    /// Only the first wave, one job per worker, is staggered by the policy's
    /// dispatch delay. Every later job starts as soon as a permit frees up.
    pub async fn run<J, R, F, Fut>(
        &self,
        jobs: Vec<J>,
        cancel: &CancellationToken,
        handler: F,
        mut on_complete: impl FnMut(&R),
    ) -> PoolOutcome<J, R>
    where
        J: Clone + Send + 'static,
        R: Send + 'static,
        F: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let handler = Arc::new(handler);
        let mut running = JoinSet::new();
        let mut in_flight: HashMap<task::Id, J> = HashMap::new();
        let mut completed = Vec::with_capacity(jobs.len());
        let mut panicked = Vec::new();
        let mut queue = jobs.into_iter().enumerate().peekable();

        loop {
            let dispatching = !cancel.is_cancelled() && queue.peek().is_some();
            if !dispatching && running.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                Some(joined) = running.join_next_with_id(), if !running.is_empty() => match joined {
                    Ok((id, result)) => {
                        in_flight.remove(&id);
                        on_complete(&result);
                        completed.push(result);
                    }
                    Err(err) => {
                        error!(error = %err, "worker task panicked");
                        if let Some(job) = in_flight.remove(&err.id()) {
                            panicked.push(job);
                        }
                    }
                },
                _ = cancel.cancelled(), if dispatching => {
                    debug!("cancellation requested, dispatch stopped");
                }
                permit = semaphore.clone().acquire_owned(), if dispatching => {
                    let Ok(permit) = permit else { break };
                    let Some((index, job)) = queue.next() else { break };
                    let delay = if index < self.workers {
                        self.policy.stagger_delay(index)
                    } else {
                        std::time::Duration::ZERO
                    };
                    let handler = handler.clone();
                    let cancel = cancel.clone();
                    let tracked = job.clone();
                    let handle = running.spawn(async move {
                        let _permit = permit;
                        if !delay.is_zero() {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        handler(job).await
                    });
                    in_flight.insert(handle.id(), tracked);
                }
                else => break,
            }
        }

        PoolOutcome {
            completed,
            not_started: queue.map(|(_, job)| job).collect(),
            panicked,
        }
    }
}
