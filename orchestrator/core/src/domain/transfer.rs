// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Input staging contracts.
//!
//! A [`TransferRequest`] asks for a unit's input files to be staged into its
//! sandbox on the pilot. The actual copy is performed by a [`TransferExecutor`]
//! which is treated as an opaque collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::unit::{PilotId, UnitId, UnitState};

/// Opaque credentials handed through to the transfer executor.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub entries: HashMap<String, String>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }
}

// Values are secrets; only keys are printed.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort();
        f.debug_struct("Credentials").field("keys", &keys).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub pilot_uid: PilotId,
    pub unit_uid: UnitId,
    pub credentials: Credentials,
    pub unit_sandbox: String,
    pub input_data: Vec<String>,
}

/// Outcome of one staging operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub unit_uid: UnitId,
    pub pilot_uid: PilotId,
    pub state: UnitState,
    pub log: Vec<String>,
}

impl TransferResult {
    pub fn succeeded(request: &TransferRequest, log: Vec<String>) -> Self {
        Self {
            unit_uid: request.unit_uid.clone(),
            pilot_uid: request.pilot_uid.clone(),
            state: UnitState::PendingExecution,
            log,
        }
    }

    pub fn failed(request: &TransferRequest, error: impl std::fmt::Display) -> Self {
        Self {
            unit_uid: request.unit_uid.clone(),
            pilot_uid: request.pilot_uid.clone(),
            state: UnitState::Failed,
            log: vec![format!("input transfer failed: {}", error)],
        }
    }

    /// The transfer never ran; the unit is withdrawn rather than failed.
    pub fn canceled(request: &TransferRequest, reason: impl std::fmt::Display) -> Self {
        Self {
            unit_uid: request.unit_uid.clone(),
            pilot_uid: request.pilot_uid.clone(),
            state: UnitState::Canceled,
            log: vec![format!("input transfer canceled: {}", reason)],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Input file not found: {0}")]
    SourceNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transfer rejected: {0}")]
    Rejected(String),
}

/// Stages input data for a single unit.
///
/// Implementations may fail either by returning `Err` or by returning a
/// result whose state is `Failed`; the scheduler treats both the same way.
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferResult, TransferError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_hides_values() {
        let creds = Credentials::new().with("ssh_key", "-----BEGIN SECRET-----");
        let printed = format!("{:?}", creds);
        assert!(printed.contains("ssh_key"));
        assert!(!printed.contains("BEGIN SECRET"));
    }

    #[test]
    fn test_failed_result_carries_error_text() {
        let request = TransferRequest {
            pilot_uid: PilotId::from("P1"),
            unit_uid: UnitId::from("U1"),
            credentials: Credentials::new(),
            unit_sandbox: "/tmp/P1/U1".to_string(),
            input_data: vec!["a.txt".to_string()],
        };
        let result = TransferResult::failed(&request, TransferError::SourceNotFound("a.txt".into()));
        assert_eq!(result.state, UnitState::Failed);
        assert_eq!(result.log, vec!["input transfer failed: Input file not found: a.txt"]);
    }
}
