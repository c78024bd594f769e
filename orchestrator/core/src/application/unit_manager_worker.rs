// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Unit Manager Worker
//!
//! Background coordinator for the compute units of one unit manager.
//!
//! # Loop
//!
//! One dedicated task repeats, once per `poll_interval`:
//!
//! 1. Dequeue at most one pending transfer, mark the unit
//!    `TransferringInput`, and hand it to the transfer pool.
//! 2. Apply every finished transfer; units that reached `PendingExecution`
//!    are assigned to their pilot.
//! 3. Poll the store for every unit of this manager and fire callbacks for
//!    each state that differs from the cache.
//! 4. Signal that the first cycle has completed.
//!
//! # Concurrency
//!
//! Writers (the loop iteration, [`UnitManagerWorker::schedule`] and
//! [`UnitManagerWorker::cancel_compute_units`]) are serialised by one async
//! lock so that a store poll never races a concurrent write. Readers only
//! touch the [`SharedStateCache`] and never wait for writers. Callbacks run
//! without any cache lock held.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::state_cache::{invoke_callbacks, CacheError, SharedStateCache, Transition, UnitCallback};
use crate::application::transfer_scheduler::{TransferQueue, TransferScheduler};
use crate::domain::events::UnitEvent;
use crate::domain::manager_config::UnitManagerConfig;
use crate::domain::repository::{StoreError, UnitStore};
use crate::domain::transfer::{Credentials, TransferExecutor, TransferRequest, TransferResult};
use crate::domain::unit::{
    ComputePilot, ComputeUnit, LogEntry, ManagerId, PilotId, UnitHandle, UnitId, UnitState,
};
use crate::infrastructure::event_bus::{EventBusError, UnitEventBus, UnitEventReceiver};

#[derive(Debug, thiserror::Error)]
pub enum UnitManagerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Unknown compute unit: {0}")]
    UnknownUnit(UnitId),

    #[error("Compute unit already scheduled: {0}")]
    DuplicateUnit(UnitId),

    #[error("Illegal state transition for {unit_id}: {from} -> {to}")]
    InvalidTransition {
        unit_id: UnitId,
        from: UnitState,
        to: UnitState,
    },

    #[error("Unit manager has been stopped")]
    Stopped,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Timed out waiting for units")]
    Timeout,
}

impl From<CacheError> for UnitManagerError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::UnknownUnit(unit_id) => UnitManagerError::UnknownUnit(unit_id),
            CacheError::InvalidTransition { unit_id, from, to } => {
                UnitManagerError::InvalidTransition { unit_id, from, to }
            }
        }
    }
}

/// State shared between the public handle and the loop task.
struct WorkerShared {
    manager_uid: ManagerId,
    config: UnitManagerConfig,
    store: Arc<dyn UnitStore>,
    cache: SharedStateCache,
    queue: TransferQueue,
    events: UnitEventBus,
    writer: AsyncMutex<()>,
    initialized: watch::Sender<bool>,
    in_flight: Arc<AtomicUsize>,
}

pub struct UnitManagerWorker {
    shared: Arc<WorkerShared>,
    scheduler: Arc<AsyncMutex<TransferScheduler>>,
    cancel: CancellationToken,
    loop_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl UnitManagerWorker {
    /// Validate `config` and spawn the worker loop on the current tokio runtime.
    pub fn start(
        manager_uid: ManagerId,
        store: Arc<dyn UnitStore>,
        executor: Arc<dyn TransferExecutor>,
        config: UnitManagerConfig,
    ) -> Result<Self, UnitManagerError> {
        config
            .validate()
            .map_err(|e| UnitManagerError::Config(e.to_string()))?;

        let (queue, scheduler) = TransferScheduler::new(executor, config.transfer_pool_size);
        let (initialized, _) = watch::channel(false);
        let shared = Arc::new(WorkerShared {
            manager_uid,
            events: UnitEventBus::new(config.event_bus_capacity),
            in_flight: scheduler.in_flight_counter(),
            config,
            store,
            cache: SharedStateCache::new(),
            queue,
            writer: AsyncMutex::new(()),
            initialized,
        });
        let scheduler = Arc::new(AsyncMutex::new(scheduler));
        let cancel = CancellationToken::new();

        info!(
            manager_id = %shared.manager_uid,
            pool_size = shared.config.transfer_pool_size,
            poll_interval = ?shared.config.poll_interval,
            "Starting unit manager worker"
        );
        let handle = tokio::spawn(run_loop(shared.clone(), scheduler.clone(), cancel.clone()));

        Ok(Self {
            shared,
            scheduler,
            cancel,
            loop_handle: parking_lot::Mutex::new(Some(handle)),
        })
    }

    pub fn manager_uid(&self) -> &ManagerId {
        &self.shared.manager_uid
    }

    /// Persist `units` for `pilot` and route them: units without input data
    /// are assigned to the pilot right away, the others are queued for input
    /// transfer.
    pub async fn schedule(
        &self,
        pilot: &ComputePilot,
        units: &[Arc<UnitHandle>],
        credentials: &Credentials,
    ) -> Result<(), UnitManagerError> {
        if self.cancel.is_cancelled() {
            return Err(UnitManagerError::Stopped);
        }
        if units.is_empty() {
            return Ok(());
        }
        let shared = &self.shared;
        let _writer = shared.writer.lock().await;
        if self.cancel.is_cancelled() {
            return Err(UnitManagerError::Stopped);
        }

        let mut uids = HashSet::with_capacity(units.len());
        for handle in units {
            if !uids.insert(&handle.uid) || shared.cache.state(&handle.uid).is_some() {
                return Err(UnitManagerError::DuplicateUnit(handle.uid.clone()));
            }
        }

        let records: Vec<ComputeUnit> = units
            .iter()
            .map(|handle| ComputeUnit::new(handle.uid.clone(), handle.description.clone()))
            .collect();
        let inserted = shared
            .store
            .insert_compute_units(
                &pilot.uid,
                &pilot.sandbox,
                &shared.manager_uid,
                &records,
                &[format!("scheduled for pilot {}", pilot.uid)],
            )
            .await?;

        let documents = units
            .iter()
            .map(|handle| {
                inserted.get(&handle.uid).map(|document| (handle, document)).ok_or_else(|| {
                    StoreError::NotFound(format!("inserted unit {} missing from store reply", handle.uid))
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let mut ready = Vec::new();
        let mut transfers = Vec::new();
        for (handle, document) in documents {
            shared.cache.insert(document.clone(), Some(handle));

            if handle.description.needs_input_transfer() {
                let unit_sandbox = if document.sandbox.is_empty() {
                    pilot.unit_sandbox(&handle.uid)
                } else {
                    document.sandbox.clone()
                };
                transfers.push(TransferRequest {
                    pilot_uid: pilot.uid.clone(),
                    unit_uid: handle.uid.clone(),
                    credentials: credentials.clone(),
                    unit_sandbox,
                    input_data: handle.description.input_data.clone().unwrap_or_default(),
                });
            } else {
                ready.push(handle.uid.clone());
            }
        }

        if !ready.is_empty() {
            shared.assign_to_pilot(&ready, &pilot.uid).await?;
            for unit_id in &ready {
                shared
                    .set_state(
                        unit_id,
                        UnitState::PendingExecution,
                        vec![LogEntry::new(format!("assigned to pilot {}", pilot.uid))],
                    )
                    .await?;
            }
        }

        let transfer_count = transfers.len();
        let mut stopped = false;
        for request in transfers {
            match shared.enqueue_transfer(request).await {
                Ok(()) => {}
                Err(UnitManagerError::Stopped) => stopped = true,
                Err(e) => return Err(e),
            }
        }
        if stopped {
            return Err(UnitManagerError::Stopped);
        }

        info!(
            manager_id = %shared.manager_uid,
            pilot_id = %pilot.uid,
            assigned = ready.len(),
            transfers = transfer_count,
            "Scheduled compute units"
        );
        Ok(())
    }

    /// Call `callback` on every state change of `unit_id`. It is invoked once
    /// immediately with the unit's current state.
    ///
    /// Registration holds the writer lock until that first call returns, so
    /// no transition can reach the callback ahead of the replayed state.
    pub async fn register_unit_callback<F>(&self, unit_id: &UnitId, callback: F) -> Result<(), UnitManagerError>
    where
        F: Fn(&UnitHandle, &UnitState) + Send + Sync + 'static,
    {
        let callback: UnitCallback = Arc::new(callback);
        let _writer = self.shared.writer.lock().await;
        let (handle, state) = self
            .shared
            .cache
            .register_unit_callback(unit_id, callback.clone())?;
        invoke_callbacks(&[callback], &handle, &state);
        Ok(())
    }

    /// Call `callback` on every state change of any unit of this manager. It
    /// is invoked once immediately for each unit already known.
    pub async fn register_manager_callback<F>(&self, callback: F)
    where
        F: Fn(&UnitHandle, &UnitState) + Send + Sync + 'static,
    {
        let callback: UnitCallback = Arc::new(callback);
        let _writer = self.shared.writer.lock().await;
        let current = self.shared.cache.register_manager_callback(callback.clone());
        let callbacks = [callback];
        for (handle, state) in current {
            invoke_callbacks(&callbacks, &handle, &state);
        }
    }

    /// The cached document of `unit_id`, once the first loop cycle has completed.
    pub async fn get_compute_unit_data(&self, unit_id: &UnitId) -> Result<ComputeUnit, UnitManagerError> {
        self.wait_initialized().await?;
        self.shared
            .cache
            .get(unit_id)
            .ok_or_else(|| UnitManagerError::UnknownUnit(unit_id.clone()))
    }

    /// Cached states of `unit_ids`, in the same order.
    pub async fn get_compute_unit_states(&self, unit_ids: &[UnitId]) -> Result<Vec<UnitState>, UnitManagerError> {
        self.wait_initialized().await?;
        unit_ids
            .iter()
            .map(|unit_id| {
                self.shared
                    .cache
                    .state(unit_id)
                    .ok_or_else(|| UnitManagerError::UnknownUnit(unit_id.clone()))
            })
            .collect()
    }

    /// Every unit this manager currently knows about.
    pub fn unit_uids(&self) -> Vec<UnitId> {
        self.shared.cache.unit_ids()
    }

    /// Move every live unit in `unit_ids` to `Canceled`. Units already in a
    /// final state are left alone; a queued transfer for a canceled unit is
    /// never dispatched.
    pub async fn cancel_compute_units(&self, unit_ids: &[UnitId]) -> Result<(), UnitManagerError> {
        let shared = &self.shared;
        let _writer = shared.writer.lock().await;

        let mut live = Vec::with_capacity(unit_ids.len());
        for unit_id in unit_ids {
            let state = shared
                .cache
                .state(unit_id)
                .ok_or_else(|| UnitManagerError::UnknownUnit(unit_id.clone()))?;
            if !state.is_final() {
                live.push(unit_id);
            }
        }

        for unit_id in live {
            shared
                .set_state(unit_id, UnitState::Canceled, vec![LogEntry::new("canceled by unit manager")])
                .await?;
        }
        Ok(())
    }

    /// Stream of unit events, in the order the worker detects them.
    pub fn subscribe(&self) -> UnitEventReceiver {
        self.shared.events.subscribe()
    }

    /// Wait until every unit in `unit_ids` is in one of `targets` or in a
    /// final state. Returns the states reached.
    pub async fn wait_units(
        &self,
        unit_ids: &[UnitId],
        targets: &[UnitState],
        timeout: Duration,
    ) -> Result<Vec<UnitState>, UnitManagerError> {
        // Subscribe before reading the cache so no transition slips between the two.
        let mut events = self.shared.events.subscribe();
        let reached = |state: &UnitState| state.is_final() || targets.contains(state);

        let wait = async {
            loop {
                let states = match unit_ids
                    .iter()
                    .map(|unit_id| {
                        self.shared
                            .cache
                            .state(unit_id)
                            .ok_or_else(|| UnitManagerError::UnknownUnit(unit_id.clone()))
                    })
                    .collect::<Result<Vec<UnitState>, UnitManagerError>>()
                {
                    Ok(states) => states,
                    Err(e) => return Err(e),
                };
                if states.iter().all(reached) {
                    return Ok(states);
                }

                match events.recv().await {
                    Ok(_) | Err(EventBusError::Lagged(_)) | Err(EventBusError::Empty) => continue,
                    Err(EventBusError::Closed) => return Err(UnitManagerError::Stopped),
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| UnitManagerError::Timeout)?
    }

    /// Transfers running in the pool.
    pub fn in_flight_transfers(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Transfers queued but not yet handed to the pool.
    pub fn pending_transfers(&self) -> usize {
        self.shared.queue.pending()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() && self.loop_handle.lock().is_none()
    }

    /// Stop the loop and wait for it, then make sure the transfer pool is shut
    /// down and joined. Safe to call more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(manager_id = %self.shared.manager_uid, error = %e, "Unit manager loop exited abnormally");
            }
        }

        // The loop normally shuts the pool down itself; this covers a loop that died early.
        let results = {
            let mut scheduler = self.scheduler.lock().await;
            scheduler.shutdown(self.shared.config.shutdown_grace).await
        };
        if !results.is_empty() {
            let _writer = self.shared.writer.lock().await;
            for result in results {
                self.shared.apply_transfer_result(result).await;
            }
        }

        info!(manager_id = %self.shared.manager_uid, "Unit manager worker stopped");
    }

    async fn wait_initialized(&self) -> Result<(), UnitManagerError> {
        let mut initialized = self.shared.initialized.subscribe();
        tokio::select! {
            ready = initialized.wait_for(|ready| *ready) => {
                ready.map(|_| ()).map_err(|_| UnitManagerError::Stopped)
            }
            _ = self.cancel.cancelled() => {
                if *self.shared.initialized.borrow() {
                    Ok(())
                } else {
                    Err(UnitManagerError::Stopped)
                }
            }
        }
    }
}

impl Drop for UnitManagerWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_loop(
    shared: Arc<WorkerShared>,
    scheduler: Arc<AsyncMutex<TransferScheduler>>,
    cancel: CancellationToken,
) {
    loop {
        {
            let _writer = shared.writer.lock().await;
            shared.dispatch_next_transfer(&scheduler).await;
            shared.apply_completed_transfers(&scheduler).await;
            shared.poll_store().await;
        }

        shared.initialized.send_if_modified(|ready| {
            let first = !*ready;
            *ready = true;
            first
        });

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(shared.config.poll_interval) => {}
        }
    }

    debug!(manager_id = %shared.manager_uid, "Unit manager loop shutting down transfer pool");
    let results = {
        let mut scheduler = scheduler.lock().await;
        scheduler.shutdown(shared.config.shutdown_grace).await
    };
    let _writer = shared.writer.lock().await;
    for result in results {
        shared.apply_transfer_result(result).await;
    }
}

impl WorkerShared {
    /// The single path through which the manager changes a unit's state:
    /// store first, then cache, then callbacks and events.
    async fn set_state(
        &self,
        unit_id: &UnitId,
        state: UnitState,
        log: Vec<LogEntry>,
    ) -> Result<(), UnitManagerError> {
        let current = self
            .cache
            .state(unit_id)
            .ok_or_else(|| UnitManagerError::UnknownUnit(unit_id.clone()))?;
        if current == state {
            return Ok(());
        }
        self.cache.check_transition(unit_id, &state)?;

        self.store.set_compute_unit_state(unit_id, &state, &log).await?;
        if let Some(transition) = self.cache.apply_state(unit_id, &state, &log)? {
            self.fire(transition);
        }
        Ok(())
    }

    async fn assign_to_pilot(&self, unit_ids: &[UnitId], pilot_uid: &PilotId) -> Result<(), UnitManagerError> {
        self.store.assign_compute_units_to_pilot(unit_ids, pilot_uid).await?;
        self.cache.assign_pilot(unit_ids, pilot_uid);
        Ok(())
    }

    async fn enqueue_transfer(&self, request: TransferRequest) -> Result<(), UnitManagerError> {
        self.set_state(
            &request.unit_uid,
            UnitState::PendingInputTransfer,
            vec![LogEntry::new("scheduled for data transfer")],
        )
        .await?;

        if let Err(request) = self.queue.push(request) {
            warn!(unit_id = %request.unit_uid, "Transfer queue closed, canceling unit");
            self.set_state(
                &request.unit_uid,
                UnitState::Canceled,
                vec![LogEntry::new("unit manager stopped before input transfer")],
            )
            .await?;
            return Err(UnitManagerError::Stopped);
        }
        Ok(())
    }

    async fn dispatch_next_transfer(&self, scheduler: &AsyncMutex<TransferScheduler>) {
        let Some(request) = scheduler.lock().await.try_dequeue() else {
            return;
        };
        let unit_id = request.unit_uid.clone();

        match self.cache.state(&unit_id) {
            Some(state) if state.is_final() => {
                debug!(unit_id = %unit_id, state = %state, "Skipping transfer for finished unit");
                return;
            }
            None => {
                warn!(unit_id = %unit_id, "Dropping transfer for unknown unit");
                return;
            }
            Some(_) => {}
        }

        let marked = self
            .set_state(
                &unit_id,
                UnitState::TransferringInput,
                vec![LogEntry::new("transferring input data")],
            )
            .await;
        match marked {
            Ok(()) => {}
            Err(UnitManagerError::Store(e)) => {
                warn!(unit_id = %unit_id, error = %e, "Could not mark transfer start, retrying next cycle");
                if self.queue.push(request).is_err() {
                    debug!(unit_id = %unit_id, "Transfer queue closed, dropping request");
                }
                return;
            }
            Err(e) => {
                warn!(unit_id = %unit_id, error = %e, "Not dispatching transfer");
                return;
            }
        }

        self.events.publish(UnitEvent::TransferDispatched {
            unit_id: unit_id.clone(),
            pilot_id: request.pilot_uid.clone(),
            file_count: request.input_data.len(),
            dispatched_at: Utc::now(),
        });
        scheduler.lock().await.dispatch(request);
    }

    async fn apply_completed_transfers(&self, scheduler: &AsyncMutex<TransferScheduler>) {
        let results = scheduler.lock().await.drain_ready();
        for result in results {
            self.apply_transfer_result(result).await;
        }
    }

    async fn apply_transfer_result(&self, result: TransferResult) {
        let unit_id = result.unit_uid.clone();
        self.events.publish(UnitEvent::transfer_completed(&result));

        match self.cache.state(&unit_id) {
            Some(state) if state.is_final() => {
                debug!(unit_id = %unit_id, state = %state, "Discarding transfer result for finished unit");
                return;
            }
            None => {
                warn!(unit_id = %unit_id, "Transfer result for unknown unit");
                return;
            }
            Some(_) => {}
        }

        if result.state == UnitState::Failed {
            error!(unit_id = %unit_id, log = ?result.log, "Input transfer failed");
        }

        let mut state = result.state.clone();
        let mut log: Vec<LogEntry> = result.log.iter().map(LogEntry::new).collect();

        // Bind to the pilot before the unit is announced as ready to run.
        if state == UnitState::PendingExecution {
            if let Err(e) = self.assign_to_pilot(&[unit_id.clone()], &result.pilot_uid).await {
                warn!(unit_id = %unit_id, pilot_id = %result.pilot_uid, error = %e, "Could not assign unit to pilot");
                state = UnitState::Failed;
                log.push(LogEntry::new(format!("assignment to pilot {} failed: {}", result.pilot_uid, e)));
            }
        }

        if let Err(e) = self.set_state(&unit_id, state, log).await {
            warn!(unit_id = %unit_id, error = %e, "Could not record transfer result");
        }
    }

    async fn poll_store(&self) {
        let units = match self.store.get_compute_units(&self.manager_uid).await {
            Ok(units) => units,
            Err(e) => {
                warn!(manager_id = %self.manager_uid, error = %e, "Polling unit store failed, retrying next cycle");
                metrics::counter!("unit_manager_poll_failures_total").increment(1);
                return;
            }
        };

        let mut seen = HashSet::with_capacity(units.len());
        for unit in units {
            if !seen.insert(unit.uid.clone()) {
                continue;
            }
            if let Some(transition) = self.cache.observe(unit) {
                self.fire(transition);
            }
        }
    }

    fn fire(&self, transition: Transition) {
        debug!(
            unit_id = %transition.unit_id,
            previous = ?transition.previous,
            state = %transition.state,
            "Unit state changed"
        );
        metrics::counter!("unit_manager_state_transitions_total").increment(1);

        let failures = transition.notify();
        if failures > 0 {
            warn!(unit_id = %transition.unit_id, failures, "Some unit callbacks failed");
        }

        self.events.publish(UnitEvent::StateChanged {
            unit_id: transition.unit_id,
            pilot_id: transition.pilot_id,
            previous: transition.previous,
            state: transition.state,
            changed_at: Utc::now(),
        });
    }
}
