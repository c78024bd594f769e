// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Compute Units and Pilots
//!
//! A compute unit is a schedulable piece of work (a command plus optional input
//! data) that is bound to a pilot, a remote execution slot. The unit manager
//! tracks each unit through the lifecycle below and relays every observed
//! transition to subscribers.
//!
//! ```text
//! New ─▶ PendingInputTransfer ─▶ TransferringInput ─▶ PendingExecution ─▶ Active ─▶ Done
//!  │                                                        ▲                  ╲
//!  └────────────── (no input data) ─────────────────────────┘                   ╲▶ Failed | Canceled
//! ```
//!
//! `Active` and the final states belong to the execution engine; this crate only
//! observes them through the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(format!(concat!($prefix, ".{}"), Uuid::new_v4().simple()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(UnitId, "unit");
string_id!(PilotId, "pilot");
string_id!(ManagerId, "umgr");

/// Lifecycle state of a compute unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitState {
    New,
    PendingInputTransfer,
    TransferringInput,
    PendingExecution,
    Active,
    Done,
    Failed,
    Canceled,
    /// A state reported by the execution engine that this crate does not model.
    #[serde(untagged)]
    Unknown(String),
}

impl UnitState {
    pub fn is_final(&self) -> bool {
        matches!(self, UnitState::Done | UnitState::Failed | UnitState::Canceled)
    }

    fn rank(&self) -> Option<u8> {
        match self {
            UnitState::New => Some(0),
            UnitState::PendingInputTransfer => Some(1),
            UnitState::TransferringInput => Some(2),
            UnitState::PendingExecution => Some(3),
            UnitState::Active => Some(4),
            UnitState::Done | UnitState::Failed | UnitState::Canceled => Some(5),
            UnitState::Unknown(_) => None,
        }
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// Final states are terminal. `Failed` and `Canceled` are reachable from
    /// every other state; everything else must move strictly forward.
    /// Transitions involving an `Unknown` state are allowed since their
    /// ordering is owned by the execution engine.
    pub fn can_transition_to(&self, next: &UnitState) -> bool {
        if self.is_final() {
            return false;
        }
        if matches!(next, UnitState::Failed | UnitState::Canceled) {
            return true;
        }
        match (self.rank(), next.rank()) {
            (Some(current), Some(next)) => next > current,
            _ => true,
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitState::New => "NEW",
            UnitState::PendingInputTransfer => "PENDING_INPUT_TRANSFER",
            UnitState::TransferringInput => "TRANSFERRING_INPUT",
            UnitState::PendingExecution => "PENDING_EXECUTION",
            UnitState::Active => "ACTIVE",
            UnitState::Done => "DONE",
            UnitState::Failed => "FAILED",
            UnitState::Canceled => "CANCELED",
            UnitState::Unknown(other) => other.as_str(),
        };
        f.write_str(name)
    }
}

/// What a unit runs and which files it needs staged first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitDescription {
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_data: Option<Vec<String>>,
}

impl UnitDescription {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            arguments: Vec::new(),
            input_data: None,
        }
    }

    pub fn with_arguments(mut self, arguments: Vec<String>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_input_data(mut self, input_data: Vec<String>) -> Self {
        self.input_data = Some(input_data);
        self
    }

    /// True when at least one input file must be staged before execution.
    pub fn needs_input_transfer(&self) -> bool {
        self.input_data.as_ref().is_some_and(|files| !files.is_empty())
    }
}

/// One timestamped line of a unit's append-only log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The persisted record of a compute unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeUnit {
    pub uid: UnitId,
    pub description: UnitDescription,
    pub state: UnitState,
    log: Vec<LogEntry>,
    pub pilot_uid: Option<PilotId>,
    pub sandbox: String,
    pub submitted_at: DateTime<Utc>,
}

impl ComputeUnit {
    pub fn new(uid: UnitId, description: UnitDescription) -> Self {
        Self {
            uid,
            description,
            state: UnitState::New,
            log: Vec::new(),
            pilot_uid: None,
            sandbox: String::new(),
            submitted_at: Utc::now(),
        }
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    pub fn append_log<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = LogEntry>,
    {
        self.log.extend(entries);
    }
}

/// A remote execution slot. Only its identity and sandbox matter here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputePilot {
    pub uid: PilotId,
    pub sandbox: String,
}

impl ComputePilot {
    pub fn new(uid: PilotId, sandbox: impl Into<String>) -> Self {
        Self {
            uid,
            sandbox: sandbox.into(),
        }
    }

    /// Working directory for `unit` under this pilot's sandbox.
    pub fn unit_sandbox(&self, unit: &UnitId) -> String {
        format!("{}/{}", self.sandbox.trim_end_matches('/'), unit)
    }
}

/// Application-visible handle for a unit.
///
/// The manager keeps only a weak reference to it; its lifetime belongs to
/// application code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitHandle {
    pub uid: UnitId,
    pub description: UnitDescription,
}

impl UnitHandle {
    pub fn new(uid: UnitId, description: UnitDescription) -> Self {
        Self { uid, description }
    }
}

impl From<&ComputeUnit> for UnitHandle {
    fn from(unit: &ComputeUnit) -> Self {
        Self::new(unit.uid.clone(), unit.description.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_are_allowed() {
        assert!(UnitState::New.can_transition_to(&UnitState::PendingInputTransfer));
        assert!(UnitState::New.can_transition_to(&UnitState::PendingExecution));
        assert!(UnitState::TransferringInput.can_transition_to(&UnitState::PendingExecution));
        assert!(UnitState::Active.can_transition_to(&UnitState::Done));
    }

    #[test]
    fn test_backward_and_final_transitions_are_rejected() {
        assert!(!UnitState::PendingExecution.can_transition_to(&UnitState::TransferringInput));
        assert!(!UnitState::TransferringInput.can_transition_to(&UnitState::TransferringInput));
        assert!(!UnitState::Done.can_transition_to(&UnitState::Failed));
        assert!(!UnitState::Canceled.can_transition_to(&UnitState::PendingExecution));
    }

    #[test]
    fn test_failure_and_cancel_reachable_from_any_live_state() {
        for state in [
            UnitState::New,
            UnitState::PendingInputTransfer,
            UnitState::TransferringInput,
            UnitState::PendingExecution,
            UnitState::Active,
        ] {
            assert!(state.can_transition_to(&UnitState::Failed), "{state}");
            assert!(state.can_transition_to(&UnitState::Canceled), "{state}");
        }
    }

    #[test]
    fn test_state_serializes_as_screaming_snake_case() {
        let json = serde_json::to_string(&UnitState::PendingInputTransfer).unwrap();
        assert_eq!(json, "\"PENDING_INPUT_TRANSFER\"");

        let unknown: UnitState = serde_json::from_str("\"EXECUTING_ON_GPU\"").unwrap();
        assert_eq!(unknown, UnitState::Unknown("EXECUTING_ON_GPU".to_string()));
    }

    #[test]
    fn test_needs_input_transfer() {
        assert!(!UnitDescription::new("/bin/date").needs_input_transfer());
        assert!(!UnitDescription::new("/bin/date")
            .with_input_data(vec![])
            .needs_input_transfer());
        assert!(UnitDescription::new("/bin/cat")
            .with_input_data(vec!["a.txt".to_string()])
            .needs_input_transfer());
    }

    #[test]
    fn test_unit_sandbox_path() {
        let pilot = ComputePilot::new(PilotId::from("P1"), "/scratch/pilot/");
        assert_eq!(
            pilot.unit_sandbox(&UnitId::from("unit.0001")),
            "/scratch/pilot/unit.0001"
        );
    }
}
