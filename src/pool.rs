//! Bounded concurrency for batches of asynchronous units.
//!
//! At most `max_concurrent` units are polled at any time; the rest wait in a
//! FIFO queue and start the moment a slot frees up. Results come back indexed
//! by submission order regardless of completion order.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tracing::debug;

use crate::retry::{RetryPolicy, RetryState};

#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyPool {
    max_concurrent: usize,
}

impl ConcurrencyPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Fail-fast policy: the first error aborts the batch. Units still in
    /// flight are dropped and queued units never start.
    pub async fn run<T, E, F, Fut>(&self, units: Vec<F>) -> Result<Vec<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let total = units.len();
        let mut results: Vec<Option<T>> = (0..total).map(|_| None).collect();
        let mut queue = units.into_iter().enumerate();
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < self.max_concurrent {
                let Some((index, unit)) = queue.next() else {
                    break;
                };
                in_flight.push(async move { (index, unit().await) });
            }
            match in_flight.next().await {
                Some((index, Ok(value))) => results[index] = Some(value),
                Some((_, Err(err))) => return Err(err),
                None => break,
            }
        }

        Ok(results.into_iter().flatten().collect())
    }

    /// Retry-queue policy: a unit failing with a retryable error goes to the
    /// back of the queue and waits out its backoff before running again. Only
    /// non-retryable errors, or a unit exhausting its attempts, fail the batch.
    ///
    /// A unit waiting out its backoff holds its slot.
    pub async fn run_retrying<T, E, F, Fut, P>(
        &self,
        units: Vec<F>,
        policy: &RetryPolicy,
        is_retryable: P,
    ) -> Result<Vec<T>, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let total = units.len();
        let mut results: Vec<Option<T>> = (0..total).map(|_| None).collect();
        // (unit, attempt about to run, delay before running it)
        let mut queue: VecDeque<(usize, u32, Duration)> =
            (0..total).map(|i| (i, 1, Duration::ZERO)).collect();
        let mut in_flight = FuturesUnordered::new();
        let units = &units;

        loop {
            while in_flight.len() < self.max_concurrent {
                let Some((index, attempt, delay)) = queue.pop_front() else {
                    break;
                };
                in_flight.push(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    (index, attempt, units[index]().await)
                });
            }
            match in_flight.next().await {
                Some((index, _, Ok(value))) => results[index] = Some(value),
                Some((index, attempt, Err(err))) if is_retryable(&err) => {
                    match policy.after_failure(attempt) {
                        RetryState::Waiting { attempt, delay } => {
                            debug!(unit = index, attempt, "requeueing unit that is not ready");
                            queue.push_back((index, attempt + 1, delay));
                        }
                        RetryState::Attempting(_) | RetryState::Exhausted => return Err(err),
                    }
                }
                Some((_, _, Err(err))) => return Err(err),
                None => break,
            }
        }

        Ok(results.into_iter().flatten().collect())
    }
}
