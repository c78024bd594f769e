// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::unit::{PilotId, UnitId, UnitState};
use crate::domain::transfer::TransferResult;

/// Unit lifecycle events, published in the order the unit manager detects them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UnitEvent {
    StateChanged {
        unit_id: UnitId,
        pilot_id: Option<PilotId>,
        previous: Option<UnitState>,
        state: UnitState,
        changed_at: DateTime<Utc>,
    },
    TransferDispatched {
        unit_id: UnitId,
        pilot_id: PilotId,
        file_count: usize,
        dispatched_at: DateTime<Utc>,
    },
    TransferCompleted {
        unit_id: UnitId,
        pilot_id: PilotId,
        state: UnitState,
        completed_at: DateTime<Utc>,
    },
}

impl UnitEvent {
    pub fn unit_id(&self) -> &UnitId {
        match self {
            UnitEvent::StateChanged { unit_id, .. }
            | UnitEvent::TransferDispatched { unit_id, .. }
            | UnitEvent::TransferCompleted { unit_id, .. } => unit_id,
        }
    }

    pub fn transfer_completed(result: &TransferResult) -> Self {
        UnitEvent::TransferCompleted {
            unit_id: result.unit_uid.clone(),
            pilot_id: result.pilot_uid.clone(),
            state: result.state.clone(),
            completed_at: Utc::now(),
        }
    }
}
