//! Board cell status (spec §3 "Board") and the enable/disable decision a
//! user module makes for each cell during `PoolPrepare` (spec §4.4 / §6.3
//! `BoardPrepare`). The board array itself lives in `mech-board`; these are
//! the value types both `mech-board` and `mech-module` need.

use serde::{Deserialize, Serialize};

/// Slot-0 status of a board cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellStatus {
    Available = 0,
    InUse = -1,
    ToBeRestarted = -2,
    Finished = 1,
}

impl CellStatus {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(CellStatus::Available),
            -1 => Some(CellStatus::InUse),
            -2 => Some(CellStatus::ToBeRestarted),
            1 => Some(CellStatus::Finished),
            _ => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Result of the `BoardPrepare` user callback for one cell (spec §6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardCell {
    Enabled,
    Disabled,
}
