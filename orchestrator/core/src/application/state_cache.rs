// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Shared State Cache
//!
//! Thread-safe mirror of the unit documents owned by one unit manager, plus
//! the callbacks registered on them.
//!
//! The whole cache sits behind a single mutex. It is held only while the map
//! is read or mutated: callbacks are collected under the lock and invoked
//! after it is released, so a callback may call back into the manager
//! without deadlocking the worker loop.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::{debug, error};

use crate::domain::unit::{ComputeUnit, LogEntry, PilotId, UnitHandle, UnitId, UnitState};

/// Invoked with the unit's application handle and its new state.
pub type UnitCallback = Arc<dyn Fn(&UnitHandle, &UnitState) + Send + Sync>;

/// Cached view of one unit.
pub struct CacheEntry {
    pub data: ComputeUnit,
    callbacks: Vec<UnitCallback>,
    facade: Option<Weak<UnitHandle>>,
}

impl CacheEntry {
    fn new(data: ComputeUnit) -> Self {
        Self {
            data,
            callbacks: Vec::new(),
            facade: None,
        }
    }

    fn handle(&self) -> Arc<UnitHandle> {
        self.facade
            .as_ref()
            .and_then(Weak::upgrade)
            .unwrap_or_else(|| Arc::new(UnitHandle::from(&self.data)))
    }
}

/// A detected state change together with the callbacks it must fire.
pub struct Transition {
    pub unit_id: UnitId,
    pub pilot_id: Option<PilotId>,
    pub previous: Option<UnitState>,
    pub state: UnitState,
    handle: Arc<UnitHandle>,
    callbacks: Vec<UnitCallback>,
}

impl Transition {
    /// Run every callback, unit-level first, each inside its own failure boundary.
    /// Returns the number of callbacks that panicked.
    pub fn notify(&self) -> usize {
        invoke_callbacks(&self.callbacks, &self.handle, &self.state)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Unit not cached: {0}")]
    UnknownUnit(UnitId),

    #[error("Illegal transition for {unit_id}: {from} -> {to}")]
    InvalidTransition {
        unit_id: UnitId,
        from: UnitState,
        to: UnitState,
    },
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<UnitId, CacheEntry>,
    manager_callbacks: Vec<UnitCallback>,
}

impl CacheState {
    fn transition(&self, unit_id: &UnitId, previous: Option<UnitState>) -> Option<Transition> {
        let entry = self.entries.get(unit_id)?;
        let callbacks = entry
            .callbacks
            .iter()
            .chain(self.manager_callbacks.iter())
            .cloned()
            .collect();
        Some(Transition {
            unit_id: unit_id.clone(),
            pilot_id: entry.data.pilot_uid.clone(),
            previous,
            state: entry.data.state.clone(),
            handle: entry.handle(),
            callbacks,
        })
    }
}

#[derive(Default)]
pub struct SharedStateCache {
    inner: Mutex<CacheState>,
}

impl SharedStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache a unit unless it is already known. Returns true if it was added.
    pub fn insert(&self, unit: ComputeUnit, facade: Option<&Arc<UnitHandle>>) -> bool {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&unit.uid) {
            return false;
        }
        let mut entry = CacheEntry::new(unit);
        entry.facade = facade.map(Arc::downgrade);
        inner.entries.insert(entry.data.uid.clone(), entry);
        true
    }

    /// Merge an authoritative document from the store.
    ///
    /// Unknown units are cached silently. For known units the document
    /// replaces the cached one, and a [`Transition`] is returned when the
    /// state differs.
    pub fn observe(&self, unit: ComputeUnit) -> Option<Transition> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&unit.uid) else {
            debug!(unit_id = %unit.uid, state = %unit.state, "Caching newly observed unit");
            inner.entries.insert(unit.uid.clone(), CacheEntry::new(unit));
            return None;
        };

        let previous = entry.data.state.clone();
        let changed = previous != unit.state;
        let unit_id = unit.uid.clone();
        entry.data = unit;

        if changed {
            inner.transition(&unit_id, Some(previous))
        } else {
            None
        }
    }

    /// Check that `unit_id` may move to `state` without changing anything.
    pub fn check_transition(&self, unit_id: &UnitId, state: &UnitState) -> Result<(), CacheError> {
        let inner = self.inner.lock();
        let entry = inner
            .entries
            .get(unit_id)
            .ok_or_else(|| CacheError::UnknownUnit(unit_id.clone()))?;
        if entry.data.state.can_transition_to(state) {
            Ok(())
        } else {
            Err(CacheError::InvalidTransition {
                unit_id: unit_id.clone(),
                from: entry.data.state.clone(),
                to: state.clone(),
            })
        }
    }

    /// Record a state change made by the manager itself. Setting the state
    /// a unit already has is a no-op.
    pub fn apply_state(
        &self,
        unit_id: &UnitId,
        state: &UnitState,
        log_entries: &[LogEntry],
    ) -> Result<Option<Transition>, CacheError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(unit_id)
            .ok_or_else(|| CacheError::UnknownUnit(unit_id.clone()))?;
        if &entry.data.state == state {
            return Ok(None);
        }
        if !entry.data.state.can_transition_to(state) {
            return Err(CacheError::InvalidTransition {
                unit_id: unit_id.clone(),
                from: entry.data.state.clone(),
                to: state.clone(),
            });
        }

        let previous = std::mem::replace(&mut entry.data.state, state.clone());
        entry.data.append_log(log_entries.iter().cloned());
        Ok(inner.transition(unit_id, Some(previous)))
    }

    pub fn assign_pilot(&self, unit_ids: &[UnitId], pilot_id: &PilotId) {
        let mut inner = self.inner.lock();
        for unit_id in unit_ids {
            if let Some(entry) = inner.entries.get_mut(unit_id) {
                entry.data.pilot_uid = Some(pilot_id.clone());
            }
        }
    }

    /// Add a callback for one unit. Returns what the caller needs to fire it
    /// once with the unit's current state.
    pub fn register_unit_callback(
        &self,
        unit_id: &UnitId,
        callback: UnitCallback,
    ) -> Result<(Arc<UnitHandle>, UnitState), CacheError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(unit_id)
            .ok_or_else(|| CacheError::UnknownUnit(unit_id.clone()))?;
        entry.callbacks.push(callback);
        Ok((entry.handle(), entry.data.state.clone()))
    }

    /// Add a callback for every unit. Returns the current state of all
    /// cached units so the caller can replay them.
    pub fn register_manager_callback(&self, callback: UnitCallback) -> Vec<(Arc<UnitHandle>, UnitState)> {
        let mut inner = self.inner.lock();
        inner.manager_callbacks.push(callback);
        let mut current: Vec<(Arc<UnitHandle>, UnitState)> = inner
            .entries
            .values()
            .map(|entry| (entry.handle(), entry.data.state.clone()))
            .collect();
        current.sort_by(|a, b| a.0.uid.cmp(&b.0.uid));
        current
    }

    pub fn get(&self, unit_id: &UnitId) -> Option<ComputeUnit> {
        self.inner.lock().entries.get(unit_id).map(|entry| entry.data.clone())
    }

    pub fn state(&self, unit_id: &UnitId) -> Option<UnitState> {
        self.inner
            .lock()
            .entries
            .get(unit_id)
            .map(|entry| entry.data.state.clone())
    }

    pub fn unit_ids(&self) -> Vec<UnitId> {
        let mut ids: Vec<UnitId> = self.inner.lock().entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run callbacks in order; a panicking callback is logged and skipped.
pub fn invoke_callbacks(callbacks: &[UnitCallback], handle: &UnitHandle, state: &UnitState) -> usize {
    let mut failures = 0;
    for callback in callbacks {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(handle, state))) {
            failures += 1;
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(unit_id = %handle.uid, state = %state, error = %message, "Unit callback failed");
            metrics::counter!("unit_manager_callback_failures_total").increment(1);
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::unit::UnitDescription;
    use std::sync::Mutex as StdMutex;

    fn unit(uid: &str, state: UnitState) -> ComputeUnit {
        let mut unit = ComputeUnit::new(UnitId::from(uid), UnitDescription::new("/bin/true"));
        unit.state = state;
        unit
    }

    fn recorder() -> (UnitCallback, Arc<StdMutex<Vec<(String, UnitState)>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: UnitCallback = Arc::new(move |handle: &UnitHandle, state: &UnitState| {
            sink.lock().unwrap().push((handle.uid.to_string(), state.clone()));
        });
        (callback, seen)
    }

    #[test]
    fn test_observe_new_unit_is_silent() {
        let cache = SharedStateCache::new();
        assert!(cache.observe(unit("U1", UnitState::Active)).is_none());
        assert_eq!(cache.state(&UnitId::from("U1")), Some(UnitState::Active));
    }

    #[test]
    fn test_observe_changed_state_returns_transition() {
        let cache = SharedStateCache::new();
        cache.insert(unit("U1", UnitState::PendingExecution), None);
        let (callback, seen) = recorder();
        cache.register_unit_callback(&UnitId::from("U1"), callback).unwrap();

        assert!(cache.observe(unit("U1", UnitState::PendingExecution)).is_none());

        let transition = cache.observe(unit("U1", UnitState::Active)).unwrap();
        assert_eq!(transition.previous, Some(UnitState::PendingExecution));
        assert_eq!(transition.state, UnitState::Active);
        assert_eq!(transition.notify(), 0);
        assert_eq!(seen.lock().unwrap().as_slice(), &[("U1".to_string(), UnitState::Active)]);
    }

    #[test]
    fn test_apply_state_rejects_backward_moves() {
        let cache = SharedStateCache::new();
        cache.insert(unit("U1", UnitState::PendingExecution), None);

        let err = cache
            .apply_state(&UnitId::from("U1"), &UnitState::TransferringInput, &[])
            .err()
            .unwrap();
        assert!(matches!(err, CacheError::InvalidTransition { .. }));
        assert!(cache.check_transition(&UnitId::from("U1"), &UnitState::Canceled).is_ok());

        let missing = cache.apply_state(&UnitId::from("nope"), &UnitState::Done, &[]);
        assert!(matches!(missing, Err(CacheError::UnknownUnit(_))));

        let same = cache.apply_state(&UnitId::from("U1"), &UnitState::PendingExecution, &[LogEntry::new("again")]);
        assert!(matches!(same, Ok(None)));
        assert!(cache.get(&UnitId::from("U1")).unwrap().log().is_empty());
    }

    #[test]
    fn test_apply_state_appends_log() {
        let cache = SharedStateCache::new();
        cache.insert(unit("U1", UnitState::New), None);

        cache
            .apply_state(&UnitId::from("U1"), &UnitState::PendingInputTransfer, &[LogEntry::new("queued")])
            .unwrap();

        let data = cache.get(&UnitId::from("U1")).unwrap();
        assert_eq!(data.state, UnitState::PendingInputTransfer);
        assert_eq!(data.log().len(), 1);
    }

    #[test]
    fn test_unit_callbacks_fire_before_manager_callbacks() {
        let cache = SharedStateCache::new();
        cache.insert(unit("U1", UnitState::New), None);

        let order = Arc::new(StdMutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        cache.register_manager_callback(Arc::new(move |_: &UnitHandle, _: &UnitState| {
            o1.lock().unwrap().push("manager")
        }));
        cache
            .register_unit_callback(
                &UnitId::from("U1"),
                Arc::new(move |_: &UnitHandle, _: &UnitState| o2.lock().unwrap().push("unit")),
            )
            .unwrap();

        let transition = cache
            .apply_state(&UnitId::from("U1"), &UnitState::PendingExecution, &[])
            .unwrap()
            .unwrap();
        transition.notify();

        assert_eq!(order.lock().unwrap().as_slice(), &["unit", "manager"]);
    }

    #[test]
    fn test_panicking_callback_does_not_stop_the_rest() {
        let cache = SharedStateCache::new();
        cache.insert(unit("U1", UnitState::New), None);
        let (callback, seen) = recorder();
        cache
            .register_unit_callback(
                &UnitId::from("U1"),
                Arc::new(|_: &UnitHandle, _: &UnitState| panic!("subscriber bug")),
            )
            .unwrap();
        cache.register_unit_callback(&UnitId::from("U1"), callback).unwrap();

        let transition = cache
            .apply_state(&UnitId::from("U1"), &UnitState::Failed, &[])
            .unwrap()
            .unwrap();

        assert_eq!(transition.notify(), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_facade_is_not_owned() {
        let cache = SharedStateCache::new();
        let description = UnitDescription::new("/bin/hostname");
        let facade = Arc::new(UnitHandle::new(UnitId::from("U1"), description.clone()));
        let mut data = ComputeUnit::new(UnitId::from("U1"), description);
        data.state = UnitState::New;
        cache.insert(data, Some(&facade));

        let (handle, _) = cache
            .register_unit_callback(&UnitId::from("U1"), Arc::new(|_: &UnitHandle, _: &UnitState| {}))
            .unwrap();
        assert!(Arc::ptr_eq(&handle, &facade));
        drop(handle);

        assert_eq!(Arc::strong_count(&facade), 1);
        drop(facade);

        // Falls back to a detached handle once the application drops it.
        let (handle, _) = cache
            .register_unit_callback(&UnitId::from("U1"), Arc::new(|_: &UnitHandle, _: &UnitState| {}))
            .unwrap();
        assert_eq!(handle.uid, UnitId::from("U1"));
    }

    #[test]
    fn test_manager_callback_registration_returns_current_states() {
        let cache = SharedStateCache::new();
        cache.insert(unit("U2", UnitState::Active), None);
        cache.insert(unit("U1", UnitState::New), None);

        let current = cache.register_manager_callback(Arc::new(|_: &UnitHandle, _: &UnitState| {}));
        let summary: Vec<(String, UnitState)> = current
            .into_iter()
            .map(|(handle, state)| (handle.uid.to_string(), state))
            .collect();
        assert_eq!(
            summary,
            vec![("U1".to_string(), UnitState::New), ("U2".to_string(), UnitState::Active)]
        );
    }
}
