//! Restart protocol (spec §4.9): validate archive identity, copy the
//! restart file over the working master file, read back every pool up to
//! and including the one recorded at `/Pools/last`, and resume the outer
//! loop from there.
//!
//! Grounded on `core-state::undo`'s snapshot/restore shape: recovering a
//! pool from the archive is the same shape as restoring a buffer from a
//! snapshot stack, just keyed by `pid` instead of a generation counter.

use std::path::Path;

use mech_archive::{layout, validate, ArchiveBackend};
use mech_arena::Arena;
use mech_board::Board;
use mech_module::{ModuleRegistry, PoolSet};
use mech_pool::{build_pool, PoolRuntime, ResumePoint};
use mech_transport::Transport;
use mech_types::{AttrValue, MechError, Pool, PoolLifecycle, RunContext};
use tracing::{debug, trace};

/// Everything a caller needs to hand back into `mech_pool::run_pools` to
/// continue a run from where it stopped.
pub struct RestartOutcome {
    /// Every pool strictly before the resumed one, its counters and
    /// `completed` tally read back from the archive (spec §6.3 `pools`
    /// parameter needs this history for modules that consult prior pools).
    pub pools: PoolSet,
    /// The resumed pool itself: board restored (master) or blank (worker,
    /// spec §4.6/§4.7 never touch the board off the master rank), counters
    /// from `/Pools/pool-%04d/@RID`/`@SID`/`@SRID`.
    pub runtime: PoolRuntime,
    pub resume: ResumePoint,
}

fn read_u32_attr<B: ArchiveBackend>(
    archive: &B,
    target: &str,
    name: &str,
) -> Result<u32, MechError> {
    match archive.read_attribute(target, name)? {
        AttrValue::Int(v) => Ok(v as u32),
        other => Err(MechError::Restart(format!(
            "attribute '{name}' on '{target}' has unexpected type: {other:?}"
        ))),
    }
}

fn read_board<B: ArchiveBackend>(
    archive: &B,
    pid: u32,
    board_dims: [usize; 3],
) -> Result<Board, MechError> {
    let [x, y, z] = board_dims;
    let size = x * y * z;
    let mut buf = vec![0u8; size * 3 * 4];
    archive.read_hyperslab(&layout::board_path(pid), &[0, 0, 0, 0], &[x, y, z, 3], &mut buf)?;
    let rows: Vec<i32> = buf
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    Board::from_rows(board_dims, &rows)
}

/// Rebuilds pool `pid`'s metadata only (schema is a pure function of the
/// module, so it is recomputed rather than re-read) for a pool strictly
/// before the resumed one (spec §4.9 "per-pool rebuild"). Its board is read
/// only to recompute `completed`; the board itself is not kept since a
/// finished pool's arena buffers have already been freed by the run that
/// wrote them (`mech_pool::build_pool` frees the prior pool on every new
/// `pid`) and nothing downstream needs them again.
fn rebuild_history<B: ArchiveBackend>(
    registry: &ModuleRegistry,
    archive: &B,
    pid: u32,
    board_dims: [usize; 3],
) -> Result<Pool, MechError> {
    let mut pool = Pool::new(pid, board_dims);
    registry.module.storage(&mut pool);

    let group = layout::pool_group_path(pid);
    pool.rid = read_u32_attr(archive, &group, layout::ATTR_RID)?;
    pool.sid = read_u32_attr(archive, &group, layout::ATTR_SID)?;
    pool.srid = read_u32_attr(archive, &group, layout::ATTR_SRID)?;
    pool.completed = read_board(archive, pid, board_dims)?.count_finished();
    pool.lifecycle = PoolLifecycle::Processed;

    trace!(target: "restart", pid, completed = pool.completed, "history_pool_rebuilt");
    Ok(pool)
}

/// Rebuilds the resumed pool's full `PoolRuntime`: schema + arena
/// allocation via `build_pool`, then the real board and every declared
/// dataset's bytes read back from the archive into the arena (spec §4.9
/// step 4 "read the board ... back into the arena"). `InUse` cells become
/// `ToBeRestarted` per `Board::recover_for_restart`.
fn rebuild_current<B: ArchiveBackend>(
    registry: &ModuleRegistry,
    arena: &mut Arena,
    archive: &B,
    pid: u32,
    board_dims: [usize; 3],
    reset_checkpoints: bool,
) -> Result<PoolRuntime, MechError> {
    let mut runtime = build_pool(registry, arena, pid, board_dims)?;

    let group = layout::pool_group_path(pid);
    runtime.pool.rid = read_u32_attr(archive, &group, layout::ATTR_RID)?;
    runtime.pool.sid = read_u32_attr(archive, &group, layout::ATTR_SID)?;
    runtime.pool.srid = read_u32_attr(archive, &group, layout::ATTR_SRID)?;

    runtime.board = read_board(archive, pid, board_dims)?;
    runtime.board.recover_for_restart(reset_checkpoints);
    runtime.pool.completed = runtime.board.count_finished();
    runtime.pool.lifecycle = PoolLifecycle::Prepared;

    for schema in &runtime.pool.pool_datasets {
        let zero_offsets = vec![0usize; schema.dims.len()];
        let mut bytes = vec![0u8; schema.dims.iter().product::<usize>() * schema.datatype.size()];
        archive.read_hyperslab(
            &layout::pool_dataset_path(pid, &schema.name),
            &zero_offsets,
            &schema.dims,
            &mut bytes,
        )?;
        arena.write(&schema.name, &zero_offsets, &schema.dims, &bytes)?;
    }
    for schema in &runtime.pool.task_schema {
        if let Some(dims) = schema.pool_dims(board_dims, runtime.pool.pool_size) {
            let zero_offsets = vec![0usize; dims.len()];
            let mut bytes = vec![0u8; dims.iter().product::<usize>() * schema.datatype.size()];
            archive.read_hyperslab(
                &layout::task_aggregate_dataset_path(pid, &schema.name),
                &zero_offsets,
                &dims,
                &mut bytes,
            )?;
            arena.write(&schema.name, &zero_offsets, &dims, &bytes)?;
        }
    }

    debug!(
        target: "restart",
        pid,
        completed = runtime.pool.completed,
        rid = runtime.pool.rid,
        sid = runtime.pool.sid,
        srid = runtime.pool.srid,
        "current_pool_rebuilt"
    );
    Ok(runtime)
}

/// Master-only recovery: every pool `0..recovered_pid` plus the resumed
/// pool itself. Split out from [`restart`] so it is testable against an
/// in-memory `ArchiveBackend` without a real restart file on disk.
fn recover_pools<B: ArchiveBackend>(
    registry: &ModuleRegistry,
    arena: &mut Arena,
    archive: &B,
    recovered_pid: u32,
    board_dims: [usize; 3],
    reset_checkpoints: bool,
) -> Result<(PoolSet, PoolRuntime), MechError> {
    let mut pools = PoolSet::default();
    for pid in 0..recovered_pid {
        pools.push(rebuild_history(registry, archive, pid, board_dims)?);
    }
    let runtime = rebuild_current(
        registry,
        arena,
        archive,
        recovered_pid,
        board_dims,
        reset_checkpoints,
    )?;
    Ok((pools, runtime))
}

const RESUME_WIRE_LEN: usize = 16;

fn encode_resume(r: ResumePoint) -> Vec<u8> {
    [r.pid, r.rid, r.sid, r.srid]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

fn decode_resume(bytes: &[u8]) -> Result<ResumePoint, MechError> {
    if bytes.len() != RESUME_WIRE_LEN {
        return Err(MechError::Restart(format!(
            "resume broadcast wrong length: expected {RESUME_WIRE_LEN}, got {}",
            bytes.len()
        )));
    }
    let mut fields = [0u32; 4];
    for (i, field) in fields.iter_mut().enumerate() {
        let start = i * 4;
        *field = u32::from_le_bytes(bytes[start..start + 4].try_into().unwrap());
    }
    Ok(ResumePoint {
        pid: fields[0],
        rid: fields[1],
        sid: fields[2],
        srid: fields[3],
    })
}

/// The master rank in every transport this core builds (spec GLOSSARY
/// "Master / worker": rank 0).
const MASTER_RANK: i32 = 0;

/// Full restart protocol (spec §4.9). On the master rank: validate the
/// restart file's `@MODULE`/`@API`, copy it over `master_file`, open the
/// result, rebuild every pool through `recovered_pid`, then broadcast the
/// resume point so every worker rank starts its own `run_pools` loop at
/// the same `pid`/`rid`/`sid`/`srid`. Worker ranks only receive the
/// broadcast; they never touch the filesystem or the archive, matching
/// spec §4.6/§4.7's split of board/archive ownership to the master alone.
#[allow(clippy::too_many_arguments)]
pub fn restart<T: Transport, B: ArchiveBackend>(
    ctx: &RunContext,
    transport: &T,
    registry: &ModuleRegistry,
    arena: &mut Arena,
    restart_file: &Path,
    master_file: &Path,
    board_dims: [usize; 3],
    running_api_version: f64,
    reset_checkpoints: bool,
) -> Result<RestartOutcome, MechError> {
    if !ctx.node.is_master() {
        let mut wire = Vec::new();
        transport.broadcast(MASTER_RANK, &mut wire)?;
        let resume = decode_resume(&wire)?;
        let mut pool = Pool::new(resume.pid, board_dims);
        registry.module.storage(&mut pool);
        return Ok(RestartOutcome {
            pools: PoolSet::default(),
            runtime: PoolRuntime {
                pool,
                board: Board::new(board_dims),
            },
            resume,
        });
    }

    let probe = B::open(restart_file)?;
    validate(&probe, &registry.name, running_api_version)?;
    drop(probe);

    std::fs::copy(restart_file, master_file)
        .map_err(|e| MechError::Restart(format!("copy restart file over master file: {e}")))?;

    let archive = B::open(master_file)?;
    let recovered_pid = match archive.read_attribute(layout::LAST_POOL_LINK, layout::ATTR_ID)? {
        AttrValue::Int(v) => v as u32,
        other => {
            return Err(MechError::Restart(format!(
                "/Pools/last @ID has unexpected type: {other:?}"
            )))
        }
    };

    let (pools, runtime) = recover_pools(
        registry,
        arena,
        &archive,
        recovered_pid,
        board_dims,
        reset_checkpoints,
    )?;
    let resume = ResumePoint {
        pid: recovered_pid,
        rid: runtime.pool.rid,
        sid: runtime.pool.sid,
        srid: runtime.pool.srid,
    };

    let mut wire = encode_resume(resume);
    transport.broadcast(MASTER_RANK, &mut wire)?;

    debug!(target: "restart", pid = resume.pid, "restart_complete");
    Ok(RestartOutcome {
        pools,
        runtime,
        resume,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mech_archive::ArchiveBackend;
    use mech_module::UserModule;
    use mech_transport::ThreadTransport;
    use mech_types::{BoardCell, CellStatus, Datatype, HdfVisibility, NodeId, Schema, StorageDiscipline, Task};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::thread;

    #[derive(Default)]
    struct FakeArchive {
        datasets: RefCell<HashMap<String, Vec<u8>>>,
        attrs: RefCell<HashMap<String, AttrValue>>,
    }

    impl ArchiveBackend for FakeArchive {
        fn create(_path: &Path) -> Result<Self, MechError> {
            Ok(Self::default())
        }
        fn open(_path: &Path) -> Result<Self, MechError> {
            Ok(Self::default())
        }
        fn create_group(&self, _path: &str) -> Result<(), MechError> {
            Ok(())
        }
        fn create_dataset(&self, group: &str, schema: &Schema) -> Result<(), MechError> {
            let size = schema.dims.iter().product::<usize>() * schema.datatype.size();
            self.datasets
                .borrow_mut()
                .insert(format!("{group}/{}", schema.name), vec![0u8; size]);
            Ok(())
        }
        fn write_hyperslab(
            &self,
            dataset: &str,
            _offsets: &[usize],
            _dims: &[usize],
            bytes: &[u8],
        ) -> Result<(), MechError> {
            self.datasets.borrow_mut().insert(dataset.to_string(), bytes.to_vec());
            Ok(())
        }
        fn read_hyperslab(
            &self,
            dataset: &str,
            _offsets: &[usize],
            _dims: &[usize],
            buf: &mut [u8],
        ) -> Result<(), MechError> {
            let data = self
                .datasets
                .borrow()
                .get(dataset)
                .cloned()
                .ok_or_else(|| MechError::Archive(format!("no such dataset {dataset}")))?;
            buf.copy_from_slice(&data);
            Ok(())
        }
        fn write_attribute(
            &self,
            target: &str,
            name: &str,
            value: &AttrValue,
        ) -> Result<(), MechError> {
            self.attrs.borrow_mut().insert(format!("{target}@{name}"), value.clone());
            Ok(())
        }
        fn read_attribute(&self, target: &str, name: &str) -> Result<AttrValue, MechError> {
            self.attrs
                .borrow()
                .get(&format!("{target}@{name}"))
                .cloned()
                .ok_or_else(|| MechError::Archive(format!("no such attribute {target}@{name}")))
        }
        fn hard_link(&self, _src: &str, _dst: &str) -> Result<(), MechError> {
            Ok(())
        }
        fn delete_dataset(&self, path: &str) -> Result<(), MechError> {
            self.datasets.borrow_mut().remove(path);
            Ok(())
        }
    }

    struct HelloModule;
    impl UserModule for HelloModule {
        fn storage(&self, pool: &mut Pool) {
            pool.task_schema.push(Schema {
                name: "result".into(),
                rank: 2,
                dims: vec![pool.pool_size, 1],
                datatype: Datatype::Int,
                storage_type: StorageDiscipline::List,
                sync: true,
                use_hdf: HdfVisibility::Normal,
            });
        }
    }

    /// Seeds a `FakeArchive` with one pool's group: counters, a board with
    /// one `InUse` cell (the cell that was mid-flight when the run
    /// stopped), and the `result` aggregate dataset's bytes.
    fn seed_pool(archive: &FakeArchive, pid: u32, board_dims: [usize; 3], rid: u32, sid: u32, srid: u32) {
        let group = layout::pool_group_path(pid);
        archive
            .write_attribute(&group, layout::ATTR_RID, &AttrValue::Int(rid as i64))
            .unwrap();
        archive
            .write_attribute(&group, layout::ATTR_SID, &AttrValue::Int(sid as i64))
            .unwrap();
        archive
            .write_attribute(&group, layout::ATTR_SRID, &AttrValue::Int(srid as i64))
            .unwrap();

        let mut board = Board::new(board_dims);
        let pool_size = board_dims[0] * board_dims[1] * board_dims[2];
        let decisions = vec![BoardCell::Enabled; pool_size];
        let locations: Vec<[usize; 3]> = (0..pool_size)
            .map(|tid| Task::row_major_location(tid, board_dims))
            .collect();
        board.prepare(&decisions, &locations, None);
        // Every cell but the first finishes; the first is still in flight.
        for &loc in locations.iter().skip(1) {
            board.set_status(loc, CellStatus::Finished);
        }
        board.set_status(locations[0], CellStatus::InUse);
        board.set_owner(locations[0], 1);

        archive
            .write_hyperslab(&layout::board_path(pid), &[0, 0, 0, 0], &[board_dims[0], board_dims[1], board_dims[2], 3], &board.to_rows().iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>())
            .unwrap();

        let result_bytes: Vec<u8> = (0..pool_size as i32).flat_map(|v| v.to_le_bytes()).collect();
        archive
            .write_hyperslab(
                &layout::task_aggregate_dataset_path(pid, "result"),
                &[0, 0],
                &[pool_size, 1],
                &result_bytes,
            )
            .unwrap();
        archive
            .write_attribute(layout::LAST_POOL_LINK, layout::ATTR_ID, &AttrValue::Int(pid as i64))
            .unwrap();
    }

    #[test]
    fn recover_pools_restores_board_counters_and_arena() {
        let registry = ModuleRegistry::new("hello", Box::new(HelloModule));
        let archive = FakeArchive::default();
        let board_dims = [2, 2, 1];
        seed_pool(&archive, 0, board_dims, 3, 1, 2);

        let mut arena = Arena::new();
        let (pools, runtime) =
            recover_pools(&registry, &mut arena, &archive, 0, board_dims, false).unwrap();

        assert!(pools.is_empty());
        assert_eq!(runtime.pool.rid, 3);
        assert_eq!(runtime.pool.sid, 1);
        assert_eq!(runtime.pool.srid, 2);
        // 3 of 4 cells were Finished; the InUse one becomes ToBeRestarted,
        // not Finished, so completed stays at 3.
        assert_eq!(runtime.pool.completed, 3);

        let locations: Vec<[usize; 3]> = (0..4).map(|tid| Task::row_major_location(tid, board_dims)).collect();
        assert_eq!(runtime.board.status(locations[0]), CellStatus::ToBeRestarted);

        let restored = arena.read("result", &[0, 0], &[4, 1]).unwrap();
        let values: Vec<i32> = restored
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(values, vec![0, 1, 2, 3]);
    }

    #[test]
    fn reset_checkpoints_clears_in_use_cells_cid() {
        let registry = ModuleRegistry::new("hello", Box::new(HelloModule));
        let archive = FakeArchive::default();
        let board_dims = [1, 1, 1];
        let group = layout::pool_group_path(0);
        archive.write_attribute(&group, layout::ATTR_RID, &AttrValue::Int(0)).unwrap();
        archive.write_attribute(&group, layout::ATTR_SID, &AttrValue::Int(0)).unwrap();
        archive.write_attribute(&group, layout::ATTR_SRID, &AttrValue::Int(0)).unwrap();
        let mut board = Board::new(board_dims);
        board.set_status([0, 0, 0], CellStatus::InUse);
        board.set_cid([0, 0, 0], 42);
        archive
            .write_hyperslab(&layout::board_path(0), &[0, 0, 0, 0], &[1, 1, 1, 3], &board.to_rows().iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>())
            .unwrap();
        let result_bytes: Vec<u8> = 0i32.to_le_bytes().to_vec();
        archive
            .write_hyperslab(&layout::task_aggregate_dataset_path(0, "result"), &[0, 0], &[1, 1], &result_bytes)
            .unwrap();

        let mut arena = Arena::new();
        let (_pools, runtime) =
            recover_pools(&registry, &mut arena, &archive, 0, board_dims, true).unwrap();
        assert_eq!(runtime.board.cid([0, 0, 0]), 0);
    }

    #[test]
    fn resume_point_round_trips_through_encode_decode() {
        let resume = ResumePoint { pid: 7, rid: 2, sid: 5, srid: 1 };
        let wire = encode_resume(resume);
        let decoded = decode_resume(&wire).unwrap();
        assert_eq!(decoded.pid, resume.pid);
        assert_eq!(decoded.rid, resume.rid);
        assert_eq!(decoded.sid, resume.sid);
        assert_eq!(decoded.srid, resume.srid);
    }

    #[test]
    fn worker_receives_resume_point_via_broadcast() {
        let world = ThreadTransport::build_world(2);
        let mut it = world.into_iter();
        let master = it.next().unwrap();
        let worker = it.next().unwrap();

        let worker_ctx = RunContext {
            node: NodeId(1),
            world_size: 2,
            restart_mode: true,
            blocking: true,
        };
        let board_dims = [2, 2, 1];
        let handle = thread::spawn(move || {
            let registry = ModuleRegistry::new("hello", Box::new(HelloModule));
            let mut arena = Arena::new();
            restart::<ThreadTransport, FakeArchive>(
                &worker_ctx,
                &worker,
                &registry,
                &mut arena,
                Path::new("unused-restart.h5"),
                Path::new("unused-master.h5"),
                board_dims,
                2.0,
                false,
            )
        });

        let resume = ResumePoint { pid: 4, rid: 1, sid: 0, srid: 0 };
        let mut wire = encode_resume(resume);
        master.broadcast(0, &mut wire).unwrap();

        let outcome = handle.join().unwrap().unwrap();
        assert_eq!(outcome.resume.pid, 4);
        assert_eq!(outcome.resume.rid, 1);
        assert!(outcome.pools.is_empty());
    }
}
