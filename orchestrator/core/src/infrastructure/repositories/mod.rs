// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the [`UnitStore`] abstraction defined in
//! the domain layer.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve compute units
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! - **InMemoryUnitStore** - Thread-safe HashMap-backed storage for
//!   development and testing. Supports simulating an outage with
//!   [`InMemoryUnitStore::set_available`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::domain::repository::{StoreError, UnitStore};
use crate::domain::unit::{ComputeUnit, LogEntry, ManagerId, PilotId, UnitId, UnitState};

#[derive(Debug, Clone)]
struct StoredUnit {
    unit: ComputeUnit,
    manager_uid: ManagerId,
    scheduled_pilot: PilotId,
}

#[derive(Clone, Default)]
pub struct InMemoryUnitStore {
    units: Arc<RwLock<HashMap<UnitId, StoredUnit>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryUnitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle a simulated outage; while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Units currently bound to `pilot_uid`, sorted by id.
    pub fn assigned_units(&self, pilot_uid: &PilotId) -> Vec<UnitId> {
        let units = self.units.read().unwrap_or_else(|e| e.into_inner());
        let mut assigned: Vec<UnitId> = units
            .values()
            .filter(|stored| stored.unit.pilot_uid.as_ref() == Some(pilot_uid))
            .map(|stored| stored.unit.uid.clone())
            .collect();
        assigned.sort();
        assigned
    }

    /// The pilot a unit was scheduled for, whether or not it is assigned yet.
    pub fn scheduled_pilot(&self, unit_uid: &UnitId) -> Option<PilotId> {
        let units = self.units.read().unwrap_or_else(|e| e.into_inner());
        units.get(unit_uid).map(|stored| stored.scheduled_pilot.clone())
    }

    pub fn get(&self, unit_uid: &UnitId) -> Option<ComputeUnit> {
        let units = self.units.read().unwrap_or_else(|e| e.into_inner());
        units.get(unit_uid).map(|stored| stored.unit.clone())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl UnitStore for InMemoryUnitStore {
    async fn insert_compute_units(
        &self,
        pilot_uid: &PilotId,
        pilot_sandbox: &str,
        manager_uid: &ManagerId,
        units: &[ComputeUnit],
        log: &[String],
    ) -> Result<HashMap<UnitId, ComputeUnit>, StoreError> {
        self.check_available()?;

        let mut stored = self.units.write().unwrap_or_else(|e| e.into_inner());
        let mut inserted = HashMap::with_capacity(units.len());
        for unit in units {
            let mut unit = unit.clone();
            unit.sandbox = format!("{}/{}", pilot_sandbox.trim_end_matches('/'), unit.uid);
            unit.append_log(log.iter().map(LogEntry::new));

            stored.insert(
                unit.uid.clone(),
                StoredUnit {
                    unit: unit.clone(),
                    manager_uid: manager_uid.clone(),
                    scheduled_pilot: pilot_uid.clone(),
                },
            );
            inserted.insert(unit.uid.clone(), unit);
        }
        Ok(inserted)
    }

    async fn get_compute_units(&self, manager_uid: &ManagerId) -> Result<Vec<ComputeUnit>, StoreError> {
        self.check_available()?;

        let units = self.units.read().unwrap_or_else(|e| e.into_inner());
        let mut owned: Vec<ComputeUnit> = units
            .values()
            .filter(|stored| &stored.manager_uid == manager_uid)
            .map(|stored| stored.unit.clone())
            .collect();
        owned.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then_with(|| a.uid.cmp(&b.uid)));
        Ok(owned)
    }

    async fn set_compute_unit_state(
        &self,
        unit_uid: &UnitId,
        state: &UnitState,
        log_entries: &[LogEntry],
    ) -> Result<(), StoreError> {
        self.check_available()?;

        let mut units = self.units.write().unwrap_or_else(|e| e.into_inner());
        let stored = units
            .get_mut(unit_uid)
            .ok_or_else(|| StoreError::NotFound(unit_uid.to_string()))?;
        stored.unit.state = state.clone();
        stored.unit.append_log(log_entries.iter().cloned());
        Ok(())
    }

    async fn assign_compute_units_to_pilot(
        &self,
        unit_uids: &[UnitId],
        pilot_uid: &PilotId,
    ) -> Result<(), StoreError> {
        self.check_available()?;

        let mut units = self.units.write().unwrap_or_else(|e| e.into_inner());
        if let Some(missing) = unit_uids.iter().find(|uid| !units.contains_key(*uid)) {
            return Err(StoreError::NotFound(missing.to_string()));
        }
        for uid in unit_uids {
            if let Some(stored) = units.get_mut(uid) {
                stored.unit.pilot_uid = Some(pilot_uid.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::unit::UnitDescription;

    fn unit(uid: &str) -> ComputeUnit {
        ComputeUnit::new(UnitId::from(uid), UnitDescription::new("/bin/true"))
    }

    #[tokio::test]
    async fn test_insert_and_query_by_manager() {
        let store = InMemoryUnitStore::new();
        let manager = ManagerId::from("umgr.1");
        let other = ManagerId::from("umgr.2");
        let pilot = PilotId::from("P1");

        let inserted = store
            .insert_compute_units(&pilot, "/sandbox/P1/", &manager, &[unit("U1"), unit("U2")], &["created".to_string()])
            .await
            .unwrap();
        store
            .insert_compute_units(&pilot, "/sandbox/P1", &other, &[unit("U3")], &[])
            .await
            .unwrap();

        assert_eq!(inserted.len(), 2);
        assert_eq!(inserted[&UnitId::from("U1")].sandbox, "/sandbox/P1/U1");
        assert_eq!(inserted[&UnitId::from("U1")].log()[0].message, "created");
        assert_eq!(inserted[&UnitId::from("U1")].pilot_uid, None);

        let owned = store.get_compute_units(&manager).await.unwrap();
        assert_eq!(owned.len(), 2);
        assert_eq!(store.scheduled_pilot(&UnitId::from("U3")), Some(pilot));
    }

    #[tokio::test]
    async fn test_set_state_appends_log() {
        let store = InMemoryUnitStore::new();
        let manager = ManagerId::from("umgr.1");
        store
            .insert_compute_units(&PilotId::from("P1"), "/s", &manager, &[unit("U1")], &[])
            .await
            .unwrap();

        store
            .set_compute_unit_state(&UnitId::from("U1"), &UnitState::Active, &[LogEntry::new("started")])
            .await
            .unwrap();
        store
            .set_compute_unit_state(&UnitId::from("U1"), &UnitState::Done, &[LogEntry::new("finished")])
            .await
            .unwrap();

        let stored = store.get(&UnitId::from("U1")).unwrap();
        assert_eq!(stored.state, UnitState::Done);
        let messages: Vec<&str> = stored.log().iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["started", "finished"]);
    }

    #[tokio::test]
    async fn test_assign_rejects_unknown_units_atomically() {
        let store = InMemoryUnitStore::new();
        let pilot = PilotId::from("P1");
        store
            .insert_compute_units(&pilot, "/s", &ManagerId::from("m"), &[unit("U1")], &[])
            .await
            .unwrap();

        let result = store
            .assign_compute_units_to_pilot(&[UnitId::from("U1"), UnitId::from("missing")], &pilot)
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert!(store.assigned_units(&pilot).is_empty());

        store.assign_compute_units_to_pilot(&[UnitId::from("U1")], &pilot).await.unwrap();
        assert_eq!(store.assigned_units(&pilot), vec![UnitId::from("U1")]);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = InMemoryUnitStore::new();
        store.set_available(false);

        let result = store.get_compute_units(&ManagerId::from("m")).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));

        store.set_available(true);
        assert!(store.get_compute_units(&ManagerId::from("m")).await.is_ok());
    }
}
