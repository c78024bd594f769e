// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod repositories;
pub mod event_bus;
pub mod transfer;
pub mod logging;

pub use event_bus::{EventBusError, UnitEventBus, UnitEventReceiver};
pub use repositories::InMemoryUnitStore;
pub use logging::{init_logging, LogFormat};
pub use transfer::LocalFileTransferExecutor;
