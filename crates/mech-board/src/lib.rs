//! Task board (spec §4.4): the 3-D status cube plus the mask/enable/disable
//! policy applied during `PoolPrepare`.

use mech_types::{BoardCell, CellStatus};
use tracing::trace;

/// The 4-D status cube: `[X, Y, Z, 3]`, slot 0 status / slot 1 owner / slot
/// 2 checkpoint id (spec §3 "Board"), stored as three parallel flat arrays
/// indexed by the cell's linear location index.
#[derive(Debug, Clone)]
pub struct Board {
    pub dims: [usize; 3],
    status: Vec<CellStatus>,
    owner: Vec<i32>,
    cid: Vec<u64>,
}

/// Row-major linear index of `(x, y, z)` within `dims`, matching
/// `Task::row_major_location`'s inverse (x slowest, z fastest).
pub fn location_index(loc: [usize; 3], dims: [usize; 3]) -> usize {
    let [x, y, z] = loc;
    let [_dx, dy, dz] = dims;
    x * (dy * dz) + y * dz + z
}

impl Board {
    /// Every cell starts `Finished` (spec §4.4: "board first filled with
    /// FINISHED"); `prepare` below is what opens cells to `Available`.
    pub fn new(dims: [usize; 3]) -> Self {
        let size = dims[0] * dims[1] * dims[2];
        Self {
            dims,
            status: vec![CellStatus::Finished; size],
            owner: vec![0; size],
            cid: vec![0; size],
        }
    }

    pub fn pool_size(&self) -> usize {
        self.status.len()
    }

    fn idx(&self, loc: [usize; 3]) -> usize {
        location_index(loc, self.dims)
    }

    pub fn status(&self, loc: [usize; 3]) -> CellStatus {
        self.status[self.idx(loc)]
    }

    pub fn owner(&self, loc: [usize; 3]) -> i32 {
        self.owner[self.idx(loc)]
    }

    pub fn cid(&self, loc: [usize; 3]) -> u64 {
        self.cid[self.idx(loc)]
    }

    pub fn set_status(&mut self, loc: [usize; 3], status: CellStatus) {
        let i = self.idx(loc);
        self.status[i] = status;
    }

    pub fn set_owner(&mut self, loc: [usize; 3], owner: i32) {
        let i = self.idx(loc);
        self.owner[i] = owner;
    }

    pub fn set_cid(&mut self, loc: [usize; 3], cid: u64) {
        let i = self.idx(loc);
        self.cid[i] = cid;
    }

    /// Applies the `BoardPrepare` decisions (spec §4.4). `decisions[tid]`
    /// is the user module's enable/disable call for that task, already
    /// evaluated in tid order; `locations[tid]` is its `TaskBoardMap`
    /// result. `mask_size`, when `Some` and `< pool_size`, reverses the
    /// policy: only the first `mask_size` tids whose decision is `Enabled`
    /// are opened to `Available`; every other cell stays `Finished`.
    ///
    /// Returns the number of cells left `Finished` (bumps the pool's
    /// `completed` counter).
    pub fn prepare(
        &mut self,
        decisions: &[BoardCell],
        locations: &[[usize; 3]],
        mask_size: Option<usize>,
    ) -> usize {
        assert_eq!(decisions.len(), locations.len());
        let mut finished = 0usize;
        let mut opened = 0usize;
        let limit = mask_size.unwrap_or(decisions.len());
        for (decision, &loc) in decisions.iter().zip(locations.iter()) {
            let enabled = matches!(decision, BoardCell::Enabled);
            let open_this_one = enabled && opened < limit;
            if open_this_one {
                self.set_status(loc, CellStatus::Available);
                opened += 1;
            } else {
                self.set_status(loc, CellStatus::Finished);
                finished += 1;
            }
        }
        trace!(target: "board", opened, finished, mask_size = ?mask_size, "prepare");
        finished
    }

    /// Restart recovery (spec §3 "Board"): every `InUse` cell becomes
    /// `ToBeRestarted`; if `reset_checkpoints`, slot 2 is cleared to 0 for
    /// those cells. Per the resolved Open Question (spec §9), the pre-clear
    /// read is always discarded when `reset_checkpoints` is set — callers
    /// must not read `cid` before calling this if they want the pre-restart
    /// value, since it is unconditionally overwritten here.
    pub fn recover_for_restart(&mut self, reset_checkpoints: bool) {
        for i in 0..self.status.len() {
            if self.status[i] == CellStatus::InUse {
                self.status[i] = CellStatus::ToBeRestarted;
                if reset_checkpoints {
                    self.cid[i] = 0;
                }
                trace!(target: "board", cell = i, reset_checkpoints, "recovered_in_use_cell");
            }
        }
    }

    /// Walks `tid` forward from `start` looking for the next dispatchable
    /// cell (spec §4.6 `GetNewTask`), skipping `Finished`/`InUse` cells.
    /// `ToBeRestarted` cells are dispatchable too (the original reference's
    /// `GetNewTask` breaks on `TASK_AVAILABLE || TASK_TO_BE_RESTARTED`
    /// under `RESTART_MODE`) since they carry a cell that was mid-flight
    /// when the prior run stopped. `locations[tid]` gives the cell for
    /// each tid. Returns `None` (`NO_MORE_TASKS`) when no task remains.
    pub fn get_new_task(
        &self,
        start: usize,
        locations: &[[usize; 3]],
    ) -> Option<usize> {
        (start..locations.len()).find(|&tid| {
            matches!(
                self.status(locations[tid]),
                CellStatus::Available | CellStatus::ToBeRestarted
            )
        })
    }

    /// Number of cells currently `Finished` (spec §4.9: used to seed a
    /// resumed pool's `completed` counter from the restored board).
    pub fn count_finished(&self) -> usize {
        self.status.iter().filter(|&&s| s == CellStatus::Finished).count()
    }

    /// Restart-aware variant of [`prepare`](Self::prepare): applied to a
    /// board already restored from the archive (spec §4.9), where
    /// `Finished` cells must stay finished (at-most-once compute, spec §8
    /// Invariant 2) and `ToBeRestarted` cells must stay put so
    /// `get_new_task` redispatches them with their prior `cid` intact.
    /// Only cells that are neither go through the ordinary enable/disable
    /// + mask decision. Returns the count of cells newly turned `Finished`
    /// by this call (callers add this to an already-seeded `completed`,
    /// not reset it — see [`count_finished`](Self::count_finished)).
    pub fn prepare_after_restart(
        &mut self,
        decisions: &[BoardCell],
        locations: &[[usize; 3]],
        mask_size: Option<usize>,
    ) -> usize {
        assert_eq!(decisions.len(), locations.len());
        let mut finished = 0usize;
        let mut opened = 0usize;
        let limit = mask_size.unwrap_or(decisions.len());
        for (decision, &loc) in decisions.iter().zip(locations.iter()) {
            match self.status(loc) {
                CellStatus::Finished | CellStatus::ToBeRestarted => {}
                _ => {
                    let enabled = matches!(decision, BoardCell::Enabled);
                    if enabled && opened < limit {
                        self.set_status(loc, CellStatus::Available);
                        opened += 1;
                    } else {
                        self.set_status(loc, CellStatus::Finished);
                        finished += 1;
                    }
                }
            }
        }
        trace!(target: "board", opened, finished, mask_size = ?mask_size, "prepare_after_restart");
        finished
    }

    /// True once every cell is `Finished` (spec §8 Invariant 1 "Board
    /// closure").
    pub fn is_closed(&self) -> bool {
        self.status.iter().all(|&s| s == CellStatus::Finished)
    }

    /// Flattens the board into the `[X, Y, Z, 3]` row-major `i32` layout
    /// the archive dataset uses (spec §3, §4.3): one `[status, owner, cid]`
    /// triple per cell, in the same linear order as `location_index`.
    /// `cid` is truncated to `i32`; checkpoint ids are small counters in
    /// practice (spec §3 "Board ... a 4-D array of small integers").
    pub fn to_rows(&self) -> Vec<i32> {
        let mut out = Vec::with_capacity(self.status.len() * 3);
        for i in 0..self.status.len() {
            out.push(self.status[i].as_i32());
            out.push(self.owner[i]);
            out.push(self.cid[i] as i32);
        }
        out
    }

    /// Inverse of [`to_rows`](Self::to_rows): rebuilds a board of the given
    /// `dims` from its flattened archive representation (spec §4.9 restart
    /// step 4 "read the board ... back into the arena").
    pub fn from_rows(dims: [usize; 3], rows: &[i32]) -> Result<Self, mech_types::MechError> {
        let size = dims[0] * dims[1] * dims[2];
        if rows.len() != size * 3 {
            return Err(mech_types::MechError::Restart(format!(
                "board row count mismatch: expected {} got {}",
                size * 3,
                rows.len()
            )));
        }
        let mut board = Board::new(dims);
        for i in 0..size {
            let status = CellStatus::from_i32(rows[i * 3]).ok_or_else(|| {
                mech_types::MechError::Restart(format!(
                    "board cell {i}: unknown status value {}",
                    rows[i * 3]
                ))
            })?;
            board.status[i] = status;
            board.owner[i] = rows[i * 3 + 1];
            board.cid[i] = rows[i * 3 + 2] as u64;
        }
        Ok(board)
    }

    /// The fixed `[X, Y, Z, 3]` schema for the archive's `board` dataset
    /// (spec §4.3 layout: "4-D small int dataset").
    pub fn schema(dims: [usize; 3]) -> mech_types::Schema {
        mech_types::Schema {
            name: "board".to_string(),
            rank: 4,
            dims: vec![dims[0], dims[1], dims[2], 3],
            datatype: mech_types::Datatype::Int,
            storage_type: mech_types::StorageDiscipline::Board,
            sync: false,
            use_hdf: mech_types::HdfVisibility::Normal,
        }
    }
}
