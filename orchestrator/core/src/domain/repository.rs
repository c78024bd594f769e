// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Unit Store Interface
//!
//! Persistence contract for compute units. The store is the source of truth
//! for unit state that survives a restart; the unit manager's cache is only a
//! read-optimised mirror of it.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `UnitStore` | `ComputeUnit` | `InMemoryUnitStore` |
//!
//! Implementations are expected to serialise concurrent writers themselves;
//! callers perform no locking around store operations.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::domain::unit::{ComputeUnit, LogEntry, ManagerId, PilotId, UnitId, UnitState};

#[async_trait]
pub trait UnitStore: Send + Sync {
    /// Persist a batch of new units scheduled for `pilot_uid` and owned by
    /// `manager_uid`. Each unit gets `pilot_sandbox` as the root of its sandbox
    /// and `log` as its initial log. `pilot_uid` on the stored unit stays
    /// unset until [`UnitStore::assign_compute_units_to_pilot`].
    async fn insert_compute_units(
        &self,
        pilot_uid: &PilotId,
        pilot_sandbox: &str,
        manager_uid: &ManagerId,
        units: &[ComputeUnit],
        log: &[String],
    ) -> Result<HashMap<UnitId, ComputeUnit>, StoreError>;

    /// All units owned by `manager_uid`.
    async fn get_compute_units(&self, manager_uid: &ManagerId) -> Result<Vec<ComputeUnit>, StoreError>;

    /// Overwrite the unit's state and append `log_entries` to its log.
    async fn set_compute_unit_state(
        &self,
        unit_uid: &UnitId,
        state: &UnitState,
        log_entries: &[LogEntry],
    ) -> Result<(), StoreError>;

    /// Bind units to a pilot so that its agent picks them up.
    async fn assign_compute_units_to_pilot(
        &self,
        unit_uids: &[UnitId],
        pilot_uid: &PilotId,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
