//! Task value type (spec §3 "Task").

use std::collections::HashMap;

use crate::schema::Schema;

/// A task's processing state, distinct from its board `CellStatus` (spec
/// §4 "Task carries `state`..."). Needed to disambiguate "sent but not yet
/// replied" from "replied, pending checkpoint flush" in the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskProcessingState {
    Idle,
    Running,
    Checkpointed,
    Finished,
}

/// One unit of work, mapped 1-to-1 to a board cell via `TaskBoardMap`
/// (spec §3).
#[derive(Debug, Clone)]
pub struct Task {
    pub pid: u32,
    pub tid: usize,
    pub cid: u64,
    pub rid: u32,
    pub state: TaskProcessingState,
    pub location: [usize; 3],
    pub node: i32,
    /// Named per-task buffers, keyed by schema name; populated by the
    /// arena (`mech-arena`) and consumed by the codec (`mech-codec`).
    pub storage: HashMap<String, Vec<u8>>,
}

impl Task {
    pub fn new(pid: u32, tid: usize) -> Self {
        Self {
            pid,
            tid,
            cid: 0,
            rid: 0,
            state: TaskProcessingState::Idle,
            location: [0, 0, 0],
            node: 0,
            storage: HashMap::new(),
        }
    }

    /// Default row-major `TaskBoardMap` (spec §3: "default: row-major").
    /// `board = [x, y, z]` dims; `tid` is the linear index with `z` fastest,
    /// then `y`, then `x` slowest (matches S1's expected cell ordering).
    pub fn row_major_location(tid: usize, board: [usize; 3]) -> [usize; 3] {
        let [_bx, by, bz] = board;
        let x = tid / (by * bz);
        let rem = tid % (by * bz);
        let y = rem / bz;
        let z = rem % bz;
        [x, y, z]
    }

    /// Byte size of the task's synchronized payload for the given schema
    /// set (spec §4.10): concatenation of every `sync` schema's buffer.
    pub fn synced_payload_len(&self, schemas: &[Schema]) -> usize {
        schemas
            .iter()
            .filter(|s| s.sync)
            .map(|s| self.storage.get(&s.name).map(|b| b.len()).unwrap_or(0))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_major_matches_s1_hello_layout() {
        // S1: xres=2 yres=2 zres=1, expects row-major
        // [[0,0,0],[0,1,0],[1,0,0],[1,1,0]] for tid = 0..4
        let board = [2, 2, 1];
        let expected = [[0, 0, 0], [0, 1, 0], [1, 0, 0], [1, 1, 0]];
        for (tid, exp) in expected.iter().enumerate() {
            assert_eq!(Task::row_major_location(tid, board), *exp);
        }
    }
}
