// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Unit and pilot records, the unit state machine, transfer contracts and
//! the store interface the worker persists through.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer

pub mod unit;
pub mod transfer;
pub mod events;
pub mod repository;
pub mod manager_config;
