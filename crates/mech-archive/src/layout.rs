//! The fixed on-disk layout (spec §4.3).
//!
//! ```text
//! /                        archive root
//!     @API                 (double)  protocol version
//!     @MODULE              (string)  module identity
//!     @CPU_Time_s          (double)  walltime, written only with --stats
//!     @MPI_size            (int)     number of workers at write time
//! /Pools/pool-%04d/
//!     @ID, @RID, @SID, @SRID, @Status, @CPU_Time_s
//!     board                4-D small int dataset, attributes = every config option
//!     <pool datasets>      per Schema
//!     Tasks/
//!         <aggregate datasets for PM3D/LIST/BOARD/TEXTURE>
//!         task-%04d/       present only when any task dataset uses GROUP
//!             <per-task datasets>
//! /Pools/last               hard link to the most recently PREPARED pool group
//! ```

/// Current protocol version written as the root `@API` attribute.
pub const API_VERSION: f64 = 2.0;

pub const ATTR_API: &str = "API";
pub const ATTR_MODULE: &str = "MODULE";
pub const ATTR_CPU_TIME_S: &str = "CPU_Time_s";
pub const ATTR_MPI_SIZE: &str = "MPI_size";
pub const ATTR_ID: &str = "ID";
pub const ATTR_RID: &str = "RID";
pub const ATTR_SID: &str = "SID";
pub const ATTR_SRID: &str = "SRID";
pub const ATTR_STATUS: &str = "Status";

/// Board-dataset attribute names for the resolved run configuration
/// (this file's own layout doc: board "attributes = every config
/// option"). One per §6.1 CLI option that carries a run-wide value;
/// written once, alongside `board`'s creation, by `mech_pool::pool_prepare`.
pub const ATTR_OPT_NAME: &str = "opt_name";
pub const ATTR_OPT_MODULE: &str = "opt_module";
pub const ATTR_OPT_MODE: &str = "opt_mode";
pub const ATTR_OPT_XRES: &str = "opt_xres";
pub const ATTR_OPT_YRES: &str = "opt_yres";
pub const ATTR_OPT_ZRES: &str = "opt_zres";
pub const ATTR_OPT_CHECKPOINT: &str = "opt_checkpoint";
pub const ATTR_OPT_CHECKPOINT_FILES: &str = "opt_checkpoint_files";
pub const ATTR_OPT_NO_BACKUP: &str = "opt_no_backup";
pub const ATTR_OPT_RESTART_MODE: &str = "opt_restart_mode";
pub const ATTR_OPT_RESET_CHECKPOINTS: &str = "opt_reset_checkpoints";
pub const ATTR_OPT_BLOCKING: &str = "opt_blocking";
pub const ATTR_OPT_STATS: &str = "opt_stats";

pub const BOARD_DATASET: &str = "board";
pub const POOLS_GROUP: &str = "/Pools";
pub const LAST_POOL_LINK: &str = "/Pools/last";

pub fn pool_group_path(pid: u32) -> String {
    format!("/Pools/pool-{pid:04}")
}

pub fn board_path(pid: u32) -> String {
    format!("{}/{BOARD_DATASET}", pool_group_path(pid))
}

pub fn tasks_group_path(pid: u32) -> String {
    format!("{}/Tasks", pool_group_path(pid))
}

pub fn pool_dataset_path(pid: u32, name: &str) -> String {
    format!("{}/{name}", pool_group_path(pid))
}

pub fn task_aggregate_dataset_path(pid: u32, name: &str) -> String {
    format!("{}/{name}", tasks_group_path(pid))
}

pub fn task_group_path(pid: u32, tid: usize) -> String {
    format!("{}/task-{tid:04}", tasks_group_path(pid))
}

pub fn task_dataset_path(pid: u32, tid: usize, name: &str) -> String {
    format!("{}/{name}", task_group_path(pid, tid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_group_path_is_zero_padded_to_four_digits() {
        assert_eq!(pool_group_path(3), "/Pools/pool-0003");
        assert_eq!(pool_group_path(1234), "/Pools/pool-1234");
    }

    #[test]
    fn task_group_path_nests_under_tasks() {
        assert_eq!(task_group_path(0, 7), "/Pools/pool-0000/Tasks/task-0007");
    }
}
