// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Transfer Scheduler
//!
//! Owns the queue of pending input transfers and the bounded pool that runs
//! them.
//!
//! - [`TransferQueue`] is the cheap, cloneable producer side used by API
//!   callers. Pushing never blocks.
//! - [`TransferScheduler`] is the consumer side driven by the worker loop:
//!   it dequeues one request at a time, dispatches it onto the pool, and
//!   polls the pool for completions without ever waiting on a transfer.
//!
//! At most `pool_size` transfers execute concurrently. Executor errors and
//! panics are folded into a `Failed` [`TransferResult`]; nothing raised by a
//! transfer reaches the worker loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::domain::transfer::{TransferExecutor, TransferRequest, TransferResult};

/// Producer side of the transfer queue.
#[derive(Clone)]
pub struct TransferQueue {
    sender: mpsc::UnboundedSender<TransferRequest>,
    pending: Arc<AtomicUsize>,
}

impl TransferQueue {
    /// Queue a request. Hands the request back if the scheduler has shut down.
    pub fn push(&self, request: TransferRequest) -> Result<(), TransferRequest> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.sender.send(request).map_err(|rejected| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            rejected.0
        })
    }

    /// Requests queued but not yet dispatched.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

pub struct TransferScheduler {
    executor: Arc<dyn TransferExecutor>,
    receiver: mpsc::UnboundedReceiver<TransferRequest>,
    pending: Arc<AtomicUsize>,
    pool: JoinSet<TransferResult>,
    in_flight: HashMap<Id, TransferRequest>,
    in_flight_count: Arc<AtomicUsize>,
    permits: Arc<Semaphore>,
    pool_size: usize,
    shut_down: bool,
}

impl TransferScheduler {
    /// Create a scheduler running at most `pool_size` transfers at once,
    /// together with the queue that feeds it.
    pub fn new(executor: Arc<dyn TransferExecutor>, pool_size: usize) -> (TransferQueue, Self) {
        let pool_size = pool_size.max(1);
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        let queue = TransferQueue {
            sender,
            pending: pending.clone(),
        };
        let scheduler = Self {
            executor,
            receiver,
            pending,
            pool: JoinSet::new(),
            in_flight: HashMap::new(),
            in_flight_count: Arc::new(AtomicUsize::new(0)),
            permits: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            shut_down: false,
        };
        (queue, scheduler)
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Transfers dispatched and not yet collected.
    pub fn in_flight(&self) -> usize {
        self.pool.len()
    }

    /// Shared counter mirroring [`TransferScheduler::in_flight`], readable
    /// without access to the scheduler.
    pub fn in_flight_counter(&self) -> Arc<AtomicUsize> {
        self.in_flight_count.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Pop the next queued request, if any.
    pub fn try_dequeue(&mut self) -> Option<TransferRequest> {
        let request = self.receiver.try_recv().ok()?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(request)
    }

    /// Hand a request to the pool.
    pub fn dispatch(&mut self, request: TransferRequest) {
        let executor = self.executor.clone();
        let permits = self.permits.clone();
        let task_request = request.clone();

        let handle = self.pool.spawn(async move {
            // Held for the whole transfer; bounds concurrent transfers to pool_size.
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return TransferResult::failed(&task_request, "transfer pool closed"),
            };
            match executor.transfer(&task_request).await {
                Ok(result) => result,
                Err(e) => TransferResult::failed(&task_request, e),
            }
        });

        debug!(
            unit_id = %request.unit_uid,
            pilot_id = %request.pilot_uid,
            files = request.input_data.len(),
            "Dispatched input transfer"
        );
        self.in_flight.insert(handle.id(), request);
        self.update_in_flight();
        metrics::counter!("unit_manager_transfers_dispatched_total").increment(1);
    }

    /// Collect every transfer that has finished since the last call.
    /// Never waits on a running transfer.
    pub fn drain_ready(&mut self) -> Vec<TransferResult> {
        let mut ready = Vec::new();
        while let Some(joined) = self.pool.try_join_next_with_id() {
            if let Some(result) = self.collect(joined) {
                ready.push(result);
            }
        }
        self.update_in_flight();
        ready
    }

    /// Stop accepting requests, give running transfers up to `grace` to
    /// finish, then abort and join whatever is left.
    ///
    /// Returns the results of transfers that completed during the grace
    /// period plus a `Failed` result for each aborted one. Requests still
    /// queued are dropped. Safe to call more than once.
    pub async fn shutdown(&mut self, grace: Duration) -> Vec<TransferResult> {
        if self.shut_down {
            return Vec::new();
        }
        self.shut_down = true;
        self.receiver.close();
        let mut results = Vec::new();
        while let Some(request) = self.try_dequeue() {
            results.push(TransferResult::canceled(&request, "unit manager stopped before dispatch"));
        }
        if !results.is_empty() {
            warn!(dropped = results.len(), "Canceling queued transfers on shutdown");
        }

        let deadline = tokio::time::Instant::now() + grace;
        while !self.pool.is_empty() {
            match tokio::time::timeout_at(deadline, self.pool.join_next_with_id()).await {
                Ok(Some(joined)) => {
                    if let Some(result) = self.collect(joined) {
                        results.push(result);
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        remaining = self.pool.len(),
                        "Shutdown grace period elapsed, aborting in-flight transfers"
                    );
                    break;
                }
            }
        }

        self.pool.abort_all();
        while let Some(joined) = self.pool.join_next_with_id().await {
            if let Some(result) = self.collect(joined) {
                results.push(result);
            }
        }
        self.permits.close();
        self.update_in_flight();

        info!(completed = results.len(), "Transfer pool shut down");
        results
    }

    fn collect(&mut self, joined: Result<(Id, TransferResult), JoinError>) -> Option<TransferResult> {
        let result = match joined {
            Ok((id, result)) => {
                self.in_flight.remove(&id);
                result
            }
            Err(join_error) => {
                let request = self.in_flight.remove(&join_error.id())?;
                if join_error.is_panic() {
                    error!(unit_id = %request.unit_uid, "Transfer task panicked");
                    TransferResult::failed(&request, "transfer task panicked")
                } else {
                    TransferResult::failed(&request, "transfer aborted during shutdown")
                }
            }
        };

        let outcome = if result.state.is_final() { "failed" } else { "succeeded" };
        metrics::counter!("unit_manager_transfers_completed_total", "outcome" => outcome).increment(1);
        Some(result)
    }

    fn update_in_flight(&self) {
        let count = self.pool.len();
        self.in_flight_count.store(count, Ordering::SeqCst);
        metrics::gauge!("unit_manager_transfers_in_flight").set(count as f64);
    }
}
