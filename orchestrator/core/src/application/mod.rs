// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod state_cache;
pub mod transfer_scheduler;
pub mod unit_manager_worker;

// Re-export the worker for convenience
pub use state_cache::{CacheEntry, SharedStateCache, UnitCallback};
pub use transfer_scheduler::{TransferQueue, TransferScheduler};
pub use unit_manager_worker::{UnitManagerError, UnitManagerWorker};
