// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Unit Manager Core
//!
//! Tracks the lifecycle of compute units bound to pilots, stages their input
//! data through a bounded transfer pool, and notifies subscribers of every
//! state transition.
//!
//! # Architecture
//!
//! - **Domain:** units, pilots, transfer contracts, store interface, configuration
//! - **Application:** shared state cache, transfer scheduler, unit manager worker
//! - **Infrastructure:** in-memory store, local file transfers, event bus, logging

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
pub use application::{UnitManagerError, UnitManagerWorker};
