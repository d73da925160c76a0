//! Shared value types for the Mechanic workspace: schemas and the
//! storage-layout engine, board cell status, tasks, pools, attributes, and
//! the domain error type every other `mech-*` crate propagates.

pub mod attr;
pub mod board;
pub mod error;
pub mod pool;
pub mod schema;
pub mod task;

pub use attr::{AttrValue, Attribute};
pub use board::{BoardCell, CellStatus};
pub use error::MechError;
pub use pool::{NodeId, Pool, PoolAction, PoolLifecycle, RunContext, MAX_POOLS};
pub use schema::{
    apply_hdf_forcing, check_layout, pad_compound, CompoundField, Datatype, HdfVisibility,
    Schema, StorageDiscipline, COMPOUND_ALIGN, CONFIG_LEN, CONFIG_MAX_LINE_LENGTH, MAX_RANK,
    TASK_BOARD_RANK,
};
pub use task::{Task, TaskProcessingState};
