//! Master Dispatcher (spec §4.6): one-pending-task-per-worker blocking
//! dispatch loop, backed by the checkpoint engine.
//!
//! Grounded on `core-actions::dispatcher`'s `dispatch()`/`DispatchResult`
//! shape and its sub-module decomposition: a seed phase, a steady-state
//! receive/reissue loop, and a drain-on-exit phase map directly onto
//! spec §4.6 steps 1-4.

use std::path::Path;

use mech_arena::Arena;
use mech_archive::ArchiveBackend;
use mech_board::Board;
use mech_checkpoint::{flush, CheckpointBuffer, CheckpointRecord};
use mech_codec::{pack, unpack, Header, Tag};
use mech_module::ModuleRegistry;
use mech_pool::{task_locations, PoolRuntime};
use mech_transport::Transport;
use mech_types::{CellStatus, MechError, Task};
use tracing::{debug, trace};

/// Reads a task's previously committed synced buffers back out of the
/// arena so a freshly dispatched message carries the cell's last known
/// state (fresh work sees zeros; a resumed `ToBeRestarted` cell sees what
/// the last successful flush wrote — this is the "restore" spec §4.7
/// expects the worker to see, pushed onto the master side instead of
/// requiring the worker to special-case restart).
fn load_task_storage(
    runtime: &PoolRuntime,
    arena: &Arena,
    tid: usize,
    loc: [usize; 3],
) -> Result<Task, MechError> {
    let mut task = Task::new(runtime.pool.pid, tid);
    task.location = loc;
    task.cid = runtime.board.cid(loc);
    for schema in runtime.pool.task_schema.iter().filter(|s| s.sync) {
        match schema.pool_dims(runtime.board.dims, runtime.pool.pool_size) {
            Some(_) => {
                let offset = schema.task_offset(loc, tid, runtime.board.dims).ok_or_else(|| {
                    MechError::Transport(format!(
                        "schema '{}' has pool_dims but no task_offset",
                        schema.name
                    ))
                })?;
                let buf = arena.read(&schema.name, &offset, &schema.dims)?;
                task.storage.insert(schema.name.clone(), buf);
            }
            None => {
                if let Some(stored) = runtime
                    .pool
                    .tasks
                    .iter()
                    .find(|t| t.tid == tid)
                    .and_then(|t| t.storage.get(&schema.name))
                {
                    task.storage.insert(schema.name.clone(), stored.clone());
                }
            }
        }
    }
    Ok(task)
}

#[allow(clippy::too_many_arguments)]
fn send_task<T: Transport>(
    transport: &T,
    registry: &ModuleRegistry,
    runtime: &mut PoolRuntime,
    arena: &Arena,
    tid: usize,
    loc: [usize; 3],
    dest: i32,
) -> Result<(), MechError> {
    let mut task = load_task_storage(runtime, arena, tid, loc)?;
    task.node = dest;
    registry.module.task_prepare(&runtime.pool, &mut task);

    runtime.board.set_status(loc, CellStatus::InUse);
    runtime.board.set_owner(loc, dest);

    let header = Header {
        tag: Tag::Data,
        tid: tid as i32,
        status: 0,
        loc: [loc[0] as i32, loc[1] as i32, loc[2] as i32],
        cid: task.cid as i32,
    };
    let wire = pack(header, &task, &runtime.pool.task_schema);
    transport.send(dest, Tag::Data, &wire)?;
    trace!(target: "master", tid, dest, "dispatched_data");
    Ok(())
}

/// Runs one full master dispatch pass over the currently active pool's
/// stage-reset iteration (spec §4.6). Matches the `FnMut(&mut PoolRuntime,
/// &mut Arena) -> Result<(), MechError>` shape `mech_pool::run_pools`
/// expects for its master-dispatch closure.
#[allow(clippy::too_many_arguments)]
pub fn dispatch<T: Transport, B: ArchiveBackend>(
    transport: &T,
    archive: &B,
    registry: &ModuleRegistry,
    master_path: &Path,
    checkpoint_files: usize,
    checkpoint_capacity: usize,
    runtime: &mut PoolRuntime,
    arena: &mut Arena,
) -> Result<(), MechError> {
    let locations = task_locations(registry, &runtime.pool);
    let world_size = transport.world_size();
    let w = world_size - 1;
    let farm_res = runtime.pool.pool_size as i32;

    if farm_res < w {
        for rank in (farm_res + 1)..=w {
            transport.send(rank, Tag::Terminate, &[])?;
            trace!(target: "master", rank, "surplus_worker_terminated");
        }
    }

    let mut cursor = 0usize;
    let mut next_task = |board: &Board, cursor: &mut usize| -> Option<(usize, [usize; 3])> {
        let tid = board.get_new_task(*cursor, &locations)?;
        *cursor = tid + 1;
        Some((tid, locations[tid]))
    };

    let active_workers = w.min(farm_res).max(0);
    let mut outstanding = 0usize;
    let mut buffer = CheckpointBuffer::new(checkpoint_capacity);

    for rank in 1..=active_workers {
        match next_task(&runtime.board, &mut cursor) {
            Some((tid, loc)) => {
                send_task(transport, registry, runtime, arena, tid, loc, rank)?;
                outstanding += 1;
            }
            None => transport.send(rank, Tag::Terminate, &[])?,
        }
    }

    while outstanding > 0 {
        let (source, _tag, payload) = transport.recv(None)?;
        let (header, storage) = unpack(&payload, &runtime.pool.task_schema)?;
        outstanding -= 1;

        let full = buffer.push(CheckpointRecord { header, storage });
        if full {
            flush(
                master_path,
                checkpoint_files,
                archive,
                arena,
                &mut runtime.pool,
                &mut runtime.board,
                &mut buffer,
            )?;
        }

        match next_task(&runtime.board, &mut cursor) {
            Some((tid, loc)) => {
                send_task(transport, registry, runtime, arena, tid, loc, source)?;
                outstanding += 1;
            }
            None => transport.send(source, Tag::Terminate, &[])?,
        }
    }

    if !buffer.is_empty() {
        flush(
            master_path,
            checkpoint_files,
            archive,
            arena,
            &mut runtime.pool,
            &mut runtime.board,
            &mut buffer,
        )?;
    }

    debug!(
        target: "master",
        pid = runtime.pool.pid,
        completed = runtime.pool.completed,
        "dispatch_complete"
    );
    Ok(())
}
