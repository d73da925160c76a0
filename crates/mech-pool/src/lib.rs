//! Pool State Machine (spec §4.5): the pool -> stage -> reset -> task
//! outer loop. Builds and validates each pool's layout, drives the user
//! module's optional hooks in the order spec §4.5's pseudocode contract
//! names, and delegates the task loop itself to caller-supplied
//! master/worker closures (the runtime-mode override point, spec §6.3
//! `Master`/`Worker`).
//!
//! Grounded on `core-model`'s `EditorModel`/`ViewManager` orchestration
//! layer: this crate owns the board + schema + tasks the way `EditorModel`
//! owns views + buffers + mode, and exposes the same "one driver function,
//! pluggable leaf behavior" shape.

use mech_archive::{layout, ArchiveBackend};
use mech_arena::Arena;
use mech_board::Board;
use mech_module::{ModuleRegistry, PoolSet};
use mech_types::{
    BoardCell, MechError, Pool, PoolAction, PoolLifecycle, RunContext, Task, MAX_POOLS,
};
use tracing::{debug, info, trace};

/// A pool's board bundled with its value type; threaded through the
/// dispatch/worker closures for one pool's lifetime (spec §3 "Pool").
pub struct PoolRuntime {
    pub pool: Pool,
    pub board: Board,
}

/// Options controlling the outer loop (spec §4.5, §6.1).
#[derive(Debug, Clone, Default)]
pub struct OuterLoopOptions {
    /// §4.5 "if disable-task-loop is unset": when true, the task loop
    /// (master dispatch / worker loop) is skipped for every stage-reset.
    pub disable_task_loop: bool,
    /// Forwarded to `Board::recover_for_restart` on the first stage-reset
    /// of a resumed pool (spec §3, §9 Open Question #3).
    pub reset_checkpoints: bool,
    /// The resolved run configuration (spec §4.3 board "attributes = every
    /// config option"), committed onto a pool's `board` dataset the first
    /// time it is created. Empty on worker ranks, which never touch the
    /// archive (spec §4.6/§4.7).
    pub config_attrs: Vec<(String, mech_types::AttrValue)>,
}

/// Where to resume the outer loop (spec §4.9 restart step 6). `None`
/// starts a fresh run at `pid = 0`.
#[derive(Debug, Clone, Copy)]
pub struct ResumePoint {
    pub pid: u32,
    pub rid: u32,
    pub sid: u32,
    pub srid: u32,
}

/// Builds every per-task location once via `TaskBoardMap` (spec §3, §6.3),
/// used both to prepare the board and to drive `GetNewTask`.
pub fn task_locations(registry: &ModuleRegistry, pool: &Pool) -> Vec<[usize; 3]> {
    (0..pool.pool_size)
        .map(|tid| {
            let mut t = Task::new(pool.pid, tid);
            registry.module.task_board_map(pool, &mut t);
            t.location
        })
        .collect()
}

/// Builds pool `pid`'s schema (spec §6.3 `Storage`, called "once per pool,
/// master and workers"), validates every declared schema (spec §4.1
/// `CheckLayout`), and allocates pool-wide arena buffers for every
/// non-`Group` task schema and pool-level dataset.
pub fn build_pool(
    registry: &ModuleRegistry,
    arena: &mut Arena,
    pid: u32,
    board_dims: [usize; 3],
) -> Result<PoolRuntime, MechError> {
    let mut pool = Pool::new(pid, board_dims);
    registry.module.storage(&mut pool);

    for schema in pool.pool_datasets.iter_mut().chain(pool.task_schema.iter_mut()) {
        mech_types::check_layout(schema)?;
        mech_types::apply_hdf_forcing(schema);
    }

    // Each pool owns the arena exclusively for its lifetime: free the prior
    // pool's buffers (no-op on the first pool) before allocating this one's,
    // rather than keeping every pool's buffers resident for the whole run.
    for schema in pool.pool_datasets.iter().chain(pool.task_schema.iter()) {
        arena.free(&schema.name);
    }
    arena.free("board");

    for schema in &pool.pool_datasets {
        arena.allocate(&schema.name, schema.dims.clone(), schema.datatype.size())?;
    }
    for schema in &pool.task_schema {
        if let Some(dims) = schema.pool_dims(board_dims, pool.pool_size) {
            arena.allocate(&schema.name, dims, schema.datatype.size())?;
        }
    }
    arena.allocate(
        "board",
        vec![board_dims[0], board_dims[1], board_dims[2], 3],
        4,
    )?;

    info!(
        target: "pool",
        pid,
        pool_size = pool.pool_size,
        pool_datasets = pool.dataset_count(),
        task_datasets = pool.task_dataset_count(),
        "storage_built"
    );
    Ok(PoolRuntime {
        pool,
        board: Board::new(board_dims),
    })
}

/// Applies `BoardPrepare` (spec §4.4, §6.3) across every tid, then opens
/// the board via `Board::prepare`, and (master only) commits the board
/// plus every pool dataset to the archive and repoints `/Pools/last`
/// (spec §4.5 "After PoolPrepare the board is committed to the archive").
#[allow(clippy::too_many_arguments)]
fn pool_prepare<B: ArchiveBackend>(
    ctx: &RunContext,
    registry: &ModuleRegistry,
    archive: &B,
    pools: &PoolSet,
    opts: &OuterLoopOptions,
    runtime: &mut PoolRuntime,
    locations: &[[usize; 3]],
    restart_mode: bool,
) -> Result<(), MechError> {
    if !ctx.node.is_master() {
        return Ok(());
    }
    registry.module.pool_prepare(pools, &mut runtime.pool);

    let decisions: Vec<BoardCell> = (0..runtime.pool.pool_size)
        .map(|tid| {
            let mut t = Task::new(runtime.pool.pid, tid);
            t.location = locations[tid];
            registry.module.board_prepare(pools, &runtime.pool, &t)
        })
        .collect();
    // Restart mode: the board was already restored from the archive
    // (spec §4.9) with `Finished`/`ToBeRestarted` cells intact; only cells
    // still pending get the ordinary enable/disable decision. A fresh
    // pool has no restored state, so every cell goes through `prepare`.
    let finished = if restart_mode {
        runtime.board.prepare_after_restart(&decisions, locations, runtime.pool.mask_size)
    } else {
        runtime.board.prepare(&decisions, locations, runtime.pool.mask_size)
    };
    runtime.pool.completed += finished;

    // Group/dataset creation is a one-time-per-pool archive operation, not
    // a per-stage-reset one: a multi-stage pool (`PoolProcess` returning
    // `Stage`/`StageReset`/`Reset`) calls `pool_prepare` again for the same
    // `pid` without ever restarting, and re-running `create_group`/
    // `create_dataset` against an already-populated real archive fails
    // ("name already exists"). `Created` only ever holds on the very first
    // call for a given `PoolRuntime`: a fresh pool starts there and this
    // function advances it to `Prepared` below; a resumed pool already
    // arrives as `Prepared` (`mech_restart::rebuild_current`), so this
    // reduces to the old `restart_mode` check on a pool's first call while
    // also covering every call after the first on an ordinary run.
    let first_prepare = runtime.pool.lifecycle == PoolLifecycle::Created;
    runtime.pool.lifecycle = PoolLifecycle::Prepared;

    if first_prepare {
        let group = layout::pool_group_path(runtime.pool.pid);
        archive.create_group(&group)?;
        archive.create_group(&layout::tasks_group_path(runtime.pool.pid))?;
        archive.create_dataset(&group, &Board::schema(runtime.board.dims))?;
        commit_config_attrs(archive, runtime.pool.pid, &opts.config_attrs)?;
        commit_board(archive, &runtime.pool.pid, &runtime.board)?;
        for schema in &runtime.pool.pool_datasets {
            archive.create_dataset(&group, schema)?;
        }
        for schema in &runtime.pool.task_schema {
            if schema.pool_dims(runtime.board.dims, runtime.pool.pool_size).is_some() {
                archive.create_dataset(&layout::tasks_group_path(runtime.pool.pid), schema)?;
            }
        }
        let _ = archive.hard_link(&group, layout::LAST_POOL_LINK);
    } else {
        commit_board(archive, &runtime.pool.pid, &runtime.board)?;
    }
    trace!(target: "pool", pid = runtime.pool.pid, restart_mode, first_prepare, "board_committed_and_last_repointed");
    Ok(())
}

/// Writes `@ID`/`@RID`/`@SID`/`@SRID`/`@Status` onto the pool's own group
/// (spec §4.3 layout: "`@ID, @RID, @SID, @SRID, @Status, @CPU_Time_s`").
/// Called once per stage-reset on the master so a restart's `@RID`/`@SID`/
/// `@SRID` reads (`mech-restart::rebuild_history`/`rebuild_current`) see
/// the exact counters of the stage-reset that was interrupted, not a
/// stale value from an earlier one.
pub fn commit_pool_attrs<B: ArchiveBackend>(archive: &B, pool: &Pool) -> Result<(), MechError> {
    let group = layout::pool_group_path(pool.pid);
    archive.write_attribute(&group, layout::ATTR_ID, &mech_types::AttrValue::Int(pool.pid as i64))?;
    archive.write_attribute(&group, layout::ATTR_RID, &mech_types::AttrValue::Int(pool.rid as i64))?;
    archive.write_attribute(&group, layout::ATTR_SID, &mech_types::AttrValue::Int(pool.sid as i64))?;
    archive.write_attribute(&group, layout::ATTR_SRID, &mech_types::AttrValue::Int(pool.srid as i64))?;
    archive.write_attribute(
        &group,
        layout::ATTR_STATUS,
        &mech_types::AttrValue::Int(pool.lifecycle.as_i32() as i64),
    )?;
    Ok(())
}

/// Upserts every resolved run-configuration option onto the pool's `board`
/// dataset (spec §4.3 layout: "board ... attributes = every config
/// option"). Called once, right after `board` is created, so the archive
/// is self-describing about the run that produced it regardless of
/// whether any downstream code ever reads the attributes back.
fn commit_config_attrs<B: ArchiveBackend>(
    archive: &B,
    pid: u32,
    config_attrs: &[(String, mech_types::AttrValue)],
) -> Result<(), MechError> {
    let path = layout::board_path(pid);
    for (name, value) in config_attrs {
        archive.write_attribute(&path, name, value)?;
    }
    Ok(())
}

/// Writes the board's current rows into the archive `board` dataset
/// (shared by `pool_prepare` above and by the checkpoint engine's flush).
pub fn commit_board<B: ArchiveBackend>(
    archive: &B,
    pid: &u32,
    board: &Board,
) -> Result<(), MechError> {
    let dims = board.dims;
    let path = layout::board_path(*pid);
    let rows = board.to_rows();
    let bytes: Vec<u8> = rows.iter().flat_map(|v| v.to_le_bytes()).collect();
    archive.write_hyperslab(&path, &[0, 0, 0, 0], &[dims[0], dims[1], dims[2], 3], &bytes)
}

/// Runs one stage-reset iteration: `NodePrepare`/`PoolPrepare`/
/// `LoopPrepare`, the task loop (master dispatch or worker loop, unless
/// disabled), `LoopProcess`, `PoolProcess`, `NodeProcess` (spec §4.5).
#[allow(clippy::too_many_arguments)]
fn run_stage_reset<B: ArchiveBackend>(
    ctx: &RunContext,
    registry: &ModuleRegistry,
    archive: &B,
    arena: &mut Arena,
    pools: &PoolSet,
    opts: &OuterLoopOptions,
    runtime: &mut PoolRuntime,
    locations: &[[usize; 3]],
    restart_mode: bool,
    master_dispatch: &mut impl FnMut(&mut PoolRuntime, &mut Arena) -> Result<(), MechError>,
    worker_loop: &mut impl FnMut(&Pool) -> Result<(), MechError>,
) -> Result<PoolAction, MechError> {
    registry.module.node_prepare(ctx, pools, &runtime.pool);
    pool_prepare(ctx, registry, archive, pools, opts, runtime, locations, restart_mode)?;
    registry.module.loop_prepare(ctx, pools, &runtime.pool);

    if !opts.disable_task_loop {
        if ctx.node.is_master() {
            master_dispatch(runtime, arena)?;
        } else {
            worker_loop(&runtime.pool)?;
        }
    }

    registry.module.loop_process(ctx, pools, &runtime.pool);
    let rc = if ctx.node.is_master() {
        registry.module.pool_process(pools, &mut runtime.pool)
    } else {
        PoolAction::Finalize
    };
    registry.module.node_process(ctx, pools, &runtime.pool);

    if ctx.node.is_master() {
        commit_pool_attrs(archive, &runtime.pool)?;
    }

    debug!(
        target: "pool",
        pid = runtime.pool.pid,
        rid = runtime.pool.rid,
        sid = runtime.pool.sid,
        srid = runtime.pool.srid,
        completed = runtime.pool.completed,
        action = ?rc,
        "stage_reset_complete"
    );
    Ok(rc)
}

/// Drives the full outer loop across every declared pool (spec §4.5's
/// pseudocode contract). `master_dispatch` implements §4.6, `worker_loop`
/// implements §4.7; both are supplied by the caller (`mech-bin`) so this
/// crate stays agnostic of the concrete master/worker strategy, matching
/// the `Master(m, p)` / `Worker(m, p)` override point of spec §6.3.
#[allow(clippy::too_many_arguments)]
pub fn run_pools<B: ArchiveBackend>(
    ctx: &RunContext,
    registry: &ModuleRegistry,
    archive: &B,
    arena: &mut Arena,
    pools: &mut PoolSet,
    board_dims: [usize; 3],
    opts: OuterLoopOptions,
    resume: Option<ResumePoint>,
    initial_runtime: Option<PoolRuntime>,
    mut master_dispatch: impl FnMut(&mut PoolRuntime, &mut Arena) -> Result<(), MechError>,
    mut worker_loop: impl FnMut(&Pool) -> Result<(), MechError>,
) -> Result<(), MechError> {
    let mut pid = resume.map(|r| r.pid).unwrap_or(0);
    // True for exactly the first stage-reset iteration of a resumed pool
    // (spec §4.9): the restored board must be prepared with
    // `prepare_after_restart`, and `GetNewTask` must pick up
    // `ToBeRestarted` cells, only that once. Every later pool (or later
    // iteration of the same pool) runs the ordinary fresh path.
    let mut restart_mode = resume.is_some();
    let mut pending_initial = initial_runtime;

    loop {
        if pid as usize >= MAX_POOLS {
            break;
        }
        // A resumed pool's `PoolRuntime` (board + arena contents already
        // restored by the caller, spec §4.9) is used as-is instead of
        // `build_pool`'s blank board; every other pool is built fresh.
        let mut runtime = match pending_initial.take() {
            Some(rt) if rt.pool.pid == pid => rt,
            _ => build_pool(registry, arena, pid, board_dims)?,
        };
        if let Some(r) = resume.filter(|r| r.pid == pid) {
            runtime.pool.rid = r.rid;
            runtime.pool.sid = r.sid;
            runtime.pool.srid = r.srid;
        }
        let locations = task_locations(registry, &runtime.pool);

        let mut rc = PoolAction::Finalize;
        'reset: loop {
            if !restart_mode {
                // "PoolReset": spec §4.5's pseudocode names this step but
                // §6.3's callback table has no `PoolReset` entry; treated
                // as internal bookkeeping only (the board is always
                // rebuilt fresh by the next `PoolPrepare` below).
                trace!(target: "pool", pid, rid = runtime.pool.rid, "pool_reset");
            } else {
                runtime.board.recover_for_restart(opts.reset_checkpoints);
            }

            'stage: loop {
                // A resumed pool's `srid` came from the archive and must
                // survive into the first `run_stage_reset` call below;
                // every later stage starts counting resets from zero.
                if !restart_mode {
                    runtime.pool.srid = 0;
                }
                loop {
                    rc = run_stage_reset(
                        ctx,
                        registry,
                        archive,
                        arena,
                        pools,
                        &opts,
                        &mut runtime,
                        &locations,
                        restart_mode,
                        &mut master_dispatch,
                        &mut worker_loop,
                    )?;
                    runtime.pool.srid += 1;
                    restart_mode = false;
                    if rc != PoolAction::StageReset {
                        break;
                    }
                }
                runtime.pool.sid += 1;
                if rc != PoolAction::Stage {
                    break 'stage;
                }
            }
            runtime.pool.rid += 1;
            if rc != PoolAction::Reset {
                break 'reset;
            }
        }

        runtime.pool.lifecycle = PoolLifecycle::Processed;
        pools.push(runtime.pool.clone());

        let next_pid = pid + 1;
        match rc {
            PoolAction::Finalize => break,
            _ if next_pid as usize >= MAX_POOLS => break,
            _ => pid = next_pid,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mech_archive::ArchiveBackend;
    use mech_module::UserModule;
    use mech_types::{AttrValue, Datatype, HdfVisibility, NodeId, Schema, StorageDiscipline};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::path::Path;

    /// Minimal in-memory `ArchiveBackend` for exercising `mech-pool`
    /// without libhdf5, mirroring the split in `mech-archive`'s own tests.
    #[derive(Default)]
    struct FakeArchive {
        groups: RefCell<Vec<String>>,
        datasets: RefCell<HashMap<String, Vec<u8>>>,
        attrs: RefCell<HashMap<String, AttrValue>>,
        links: RefCell<Vec<(String, String)>>,
    }

    impl ArchiveBackend for FakeArchive {
        fn create(_path: &Path) -> Result<Self, MechError> {
            Ok(Self::default())
        }
        fn open(_path: &Path) -> Result<Self, MechError> {
            Ok(Self::default())
        }
        fn create_group(&self, path: &str) -> Result<(), MechError> {
            self.groups.borrow_mut().push(path.to_string());
            Ok(())
        }
        fn create_dataset(&self, group: &str, schema: &Schema) -> Result<(), MechError> {
            let size: usize = schema.dims.iter().product::<usize>() * schema.datatype.size();
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
            self.datasets
                .borrow_mut()
                .insert(dataset.to_string(), bytes.to_vec());
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
            self.attrs
                .borrow_mut()
                .insert(format!("{target}@{name}"), value.clone());
            Ok(())
        }
        fn read_attribute(&self, target: &str, name: &str) -> Result<AttrValue, MechError> {
            self.attrs
                .borrow()
                .get(&format!("{target}@{name}"))
                .cloned()
                .ok_or_else(|| MechError::Archive(format!("no such attribute {target}@{name}")))
        }
        fn hard_link(&self, src: &str, dst: &str) -> Result<(), MechError> {
            self.links.borrow_mut().push((src.to_string(), dst.to_string()));
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
                dims: vec![3, 1],
                datatype: Datatype::Int,
                storage_type: StorageDiscipline::List,
                sync: true,
                use_hdf: HdfVisibility::Normal,
            });
        }

        fn pool_process(&self, _pools: &PoolSet, p: &mut Pool) -> PoolAction {
            if p.completed >= p.pool_size {
                PoolAction::Finalize
            } else {
                PoolAction::StageReset
            }
        }
    }

    #[test]
    fn s1_hello_closes_board_in_one_stage_reset() {
        let registry = ModuleRegistry::new("hello", Box::new(HelloModule));
        let archive = FakeArchive::default();
        let mut arena = Arena::new();
        let mut pools = PoolSet::default();
        let ctx = RunContext {
            node: NodeId(0),
            world_size: 1,
            restart_mode: false,
            blocking: true,
        };

        let result = run_pools(
            &ctx,
            &registry,
            &archive,
            &mut arena,
            &mut pools,
            [2, 2, 1],
            OuterLoopOptions::default(),
            None,
            None,
            |runtime, _arena| {
                // All-enabled board means every cell opens AVAILABLE; a
                // trivial master dispatch marks everything FINISHED right
                // away to exercise board closure without a real transport.
                for x in 0..runtime.board.dims[0] {
                    for y in 0..runtime.board.dims[1] {
                        for z in 0..runtime.board.dims[2] {
                            let loc = [x, y, z];
                            if runtime.board.status(loc) == mech_types::CellStatus::Available {
                                runtime.board.set_status(loc, mech_types::CellStatus::Finished);
                                runtime.pool.completed += 1;
                            }
                        }
                    }
                }
                Ok(())
            },
            |_pool| Ok(()),
        );

        assert!(result.is_ok());
        assert_eq!(pools.len(), 1);
        let pool = pools.get(0).unwrap();
        assert_eq!(pool.completed, 4);
        assert!(matches!(pool.lifecycle, PoolLifecycle::Processed));

        // The single stage-reset that ran commits @RID/@SID/@SRID at its own
        // (pre-increment) counters, so a restart reads the exact point the
        // run was interrupted at (spec §4.3, §4.9), not the post-loop value.
        let group = layout::pool_group_path(pool.pid);
        assert_eq!(
            archive.read_attribute(&group, layout::ATTR_RID).unwrap(),
            AttrValue::Int(0)
        );
        assert_eq!(
            archive.read_attribute(&group, layout::ATTR_SID).unwrap(),
            AttrValue::Int(0)
        );
    }

    #[test]
    fn mask_reversal_opens_exactly_mask_size_before_dispatch() {
        struct MaskModule;
        impl UserModule for MaskModule {
            fn storage(&self, pool: &mut Pool) {
                pool.mask_size = Some(1);
            }
            fn pool_process(&self, _pools: &PoolSet, _p: &mut Pool) -> PoolAction {
                PoolAction::Finalize
            }
        }
        let registry = ModuleRegistry::new("mask", Box::new(MaskModule));
        let archive = FakeArchive::default();
        let mut arena = Arena::new();
        let mut pools = PoolSet::default();
        let ctx = RunContext {
            node: NodeId(0),
            world_size: 1,
            restart_mode: false,
            blocking: true,
        };
        let mut opened = 0usize;
        run_pools(
            &ctx,
            &registry,
            &archive,
            &mut arena,
            &mut pools,
            [2, 2, 1],
            OuterLoopOptions::default(),
            None,
            None,
            |runtime, _arena| {
                for x in 0..2 {
                    for y in 0..2 {
                        if runtime.board.status([x, y, 0]) == mech_types::CellStatus::Available {
                            opened += 1;
                        }
                    }
                }
                Ok(())
            },
            |_pool| Ok(()),
        )
        .unwrap();
        assert_eq!(opened, 1);
    }
}
