//! Pool value type and the run-wide context threaded through every entry
//! point (spec §3 "Pool", §9 "Global state").

use crate::schema::Schema;
use crate::task::Task;

/// Maximum number of pools a single run may declare.
pub const MAX_POOLS: usize = 1024;

/// The five outcomes `PoolProcess` may return (spec §6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolAction {
    CreateNew,
    Stage,
    StageReset,
    Reset,
    Finalize,
}

/// A pool's lifecycle marker: `Prepared` once every per-task setup
/// completes, `Processed` once all tasks are `Finished` and the user
/// post-hook has run (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolLifecycle {
    Created,
    Prepared,
    Processed,
}

impl PoolLifecycle {
    /// Numeric encoding for the archive's `@Status` attribute (spec §4.3).
    pub fn as_i32(self) -> i32 {
        match self {
            PoolLifecycle::Created => 0,
            PoolLifecycle::Prepared => 1,
            PoolLifecycle::Processed => 2,
        }
    }
}

/// One iteration of board + schema + tasks (spec §3).
#[derive(Debug, Clone)]
pub struct Pool {
    pub pid: u32,
    pub rid: u32,
    pub sid: u32,
    pub srid: u32,
    pub board_dims: [usize; 3],
    pub pool_size: usize,
    pub completed: usize,
    pub lifecycle: PoolLifecycle,
    /// Pool-level dataset schemas (written once per pool, not per task).
    pub pool_datasets: Vec<Schema>,
    /// Per-task dataset schemas shared by every task in this pool.
    pub task_schema: Vec<Schema>,
    /// Present only for `Group`-discipline datasets (spec §3 "Ownership").
    pub tasks: Vec<Task>,
    /// Reversed-mask size (spec §4.4); `None` means no mask is active.
    pub mask_size: Option<usize>,
}

impl Pool {
    pub fn new(pid: u32, board_dims: [usize; 3]) -> Self {
        let pool_size = board_dims[0] * board_dims[1] * board_dims[2];
        Self {
            pid,
            rid: 0,
            sid: 0,
            srid: 0,
            board_dims,
            pool_size,
            completed: 0,
            lifecycle: PoolLifecycle::Created,
            pool_datasets: Vec::new(),
            task_schema: Vec::new(),
            tasks: Vec::new(),
            mask_size: None,
        }
    }

    /// Number of declared pool-level dataset schemas (replaces the
    /// original's redundant `pool_banks` counter; derived from the `Vec`).
    pub fn dataset_count(&self) -> usize {
        self.pool_datasets.len()
    }

    /// Number of declared per-task dataset schemas (`task_banks`).
    pub fn task_dataset_count(&self) -> usize {
        self.task_schema.len()
    }

    pub fn group_discipline_in_use(&self) -> bool {
        self.task_schema
            .iter()
            .any(|s| matches!(s.storage_type, crate::schema::StorageDiscipline::Group))
    }
}

/// Identifies a process in the run: rank 0 is the master, rank > 0 a worker
/// (spec GLOSSARY "Master / worker").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeId(pub i32);

impl NodeId {
    pub fn is_master(self) -> bool {
        self.0 == 0
    }
}

/// Replaces the reference's file-scope globals for rank and popt context
/// (spec §9 "Global state") with an explicit context passed through every
/// entry point. The transport handle is the one value acquired once and
/// scoped around the whole run.
#[derive(Debug, Clone, Copy)]
pub struct RunContext {
    pub node: NodeId,
    pub world_size: i32,
    pub restart_mode: bool,
    pub blocking: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_size_is_product_of_board_dims() {
        let p = Pool::new(0, [8, 8, 1]);
        assert_eq!(p.pool_size, 64);
    }

    #[test]
    fn node_zero_is_master() {
        assert!(NodeId(0).is_master());
        assert!(!NodeId(1).is_master());
    }
}
