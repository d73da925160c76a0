//! Wires the ambient stack (spec §6.1, §6.2, §6.4) together into the
//! core's outer loop (spec §4.5/§4.6/§4.7/§4.9): parse flags, load the
//! config file, check the `mechanic.ice` sentinel, build the archive and
//! transport, then drive every rank's `mech_pool::run_pools` loop to
//! completion.
//!
//! Kept as a library so the example modules under `demos/` can drive a
//! complete run against their own [`ModuleRegistry`] (spec's "user
//! module loader is out of scope, the core consumes a registry of
//! callbacks", §1) without re-implementing the bootstrap sequence.
//! Grounded on `ox-bin::main`'s `AppStartup`/`configure_logging`/
//! `install_panic_hook` shape, generalized from one hardcoded editor to
//! any caller-supplied [`ModuleRegistry`].

use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Instant;

use mech_archive::{layout, ArchiveBackend, Hdf5Backend};
use mech_arena::Arena;
use mech_checkpoint::{delete_temp_datasets, DEFAULT_CHECKPOINT_FILES};
use mech_codec::Tag;
pub use mech_config::cli::Args;
use mech_config::ini;
use mech_module::{InitSpec, ModuleRegistry, PoolSet, SetupSpec};
use mech_pool::{run_pools, OuterLoopOptions, PoolRuntime};
use mech_transport::{ThreadTransport, Transport};
use mech_types::{AttrValue, MechError, NodeId, RunContext};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

/// Cooperative abort sentinel (spec §6.4): its presence in the working
/// directory at bootstrap causes a graceful world-wide abort before any
/// pool is processed and before any archive is created.
const ICE_FILE: &str = "mechanic.ice";

/// Number of `ThreadTransport` ranks to simulate beyond the master
/// (launcher-only knob; under the reference's MPI transport this comes
/// from `mpirun -n N`, which has no equivalent CLI surface here since
/// `mech-transport`'s thread-per-rank simulation is itself a stand-in,
/// not a recognised option in spec §6.1's table). Overridable via
/// `MECHANIC_WORKERS` so tests/demos can exercise small and large farms
/// without recompiling.
const DEFAULT_WORKER_COUNT: i32 = 4;

fn worker_count() -> i32 {
    std::env::var("MECHANIC_WORKERS")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_WORKER_COUNT)
}

/// Installs a rolling, non-blocking file logger (`mechanic.log` in cwd),
/// mirroring `ox-bin::AppStartup::configure_logging`. Returns the guard
/// the caller must keep alive for the process lifetime.
pub fn configure_logging() -> Option<WorkerGuard> {
    let log_dir = Path::new(".");
    let log_path = log_dir.join("mechanic.log");
    if log_path.exists() {
        let _ = std::fs::remove_file(&log_path);
    }
    let file_appender = tracing_appender::rolling::never(log_dir, "mechanic.log");
    let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
    match tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(nb_writer)
        .try_init()
    {
        Ok(_) => Some(guard),
        Err(_) => None,
    }
}

/// Logs panics before the default hook prints them, mirroring
/// `ox-bin::AppStartup::install_panic_hook`.
pub fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            tracing::error!(target: "runtime.panic", ?info, "panic");
            default_panic(info);
        }));
    });
}

fn master_file_path(args: &Args) -> PathBuf {
    PathBuf::from(format!("{}-master.h5", args.name))
}

/// Builds the `KnownNamespaces` the config-file parser validates against:
/// one namespace named after `--module`, whose known keys are exactly
/// what the module's `Setup` callback populated (spec §6.2 "known per
/// namespace, defined by the user module"; §6.1's CLI table and §6.3's
/// callback table never spell out how the two meet, so this is the
/// resolved mapping, recorded in DESIGN.md).
fn known_namespaces<'a>(module_name: &'a str, setup: &'a SetupSpec) -> Vec<(&'a str, Vec<&'a str>)> {
    vec![(
        module_name,
        setup.known_options.iter().map(|(k, _)| k).collect(),
    )]
}

/// Resolves every run-wide §6.1 CLI option into the board-dataset
/// attributes spec §4.3 requires ("board ... attributes = every config
/// option"), keyed by `layout`'s `ATTR_OPT_*` constants.
fn config_board_attrs(args: &Args, module_name: &str) -> Vec<(String, AttrValue)> {
    vec![
        (layout::ATTR_OPT_NAME.into(), AttrValue::Text(args.name.clone())),
        (layout::ATTR_OPT_MODULE.into(), AttrValue::Text(module_name.to_string())),
        (layout::ATTR_OPT_MODE.into(), AttrValue::Text(args.mode.clone())),
        (layout::ATTR_OPT_XRES.into(), AttrValue::Int(args.board_dims()[0] as i64)),
        (layout::ATTR_OPT_YRES.into(), AttrValue::Int(args.board_dims()[1] as i64)),
        (layout::ATTR_OPT_ZRES.into(), AttrValue::Int(args.board_dims()[2] as i64)),
        (layout::ATTR_OPT_CHECKPOINT.into(), AttrValue::Int(args.checkpoint as i64)),
        (
            layout::ATTR_OPT_CHECKPOINT_FILES.into(),
            AttrValue::Int(args.checkpoint_files.unwrap_or(DEFAULT_CHECKPOINT_FILES) as i64),
        ),
        (layout::ATTR_OPT_NO_BACKUP.into(), AttrValue::Int(i64::from(args.no_backup))),
        (layout::ATTR_OPT_RESTART_MODE.into(), AttrValue::Int(i64::from(args.restart_mode))),
        (
            layout::ATTR_OPT_RESET_CHECKPOINTS.into(),
            AttrValue::Int(i64::from(args.reset_checkpoints)),
        ),
        (layout::ATTR_OPT_BLOCKING.into(), AttrValue::Int(i64::from(args.blocking))),
        (layout::ATTR_OPT_STATS.into(), AttrValue::Int(i64::from(args.stats))),
    ]
}

fn check_ice<T: Transport>(transport: &T, ctx: &RunContext) -> Result<(), MechError> {
    let present = ctx.node.is_master() && Path::new(ICE_FILE).exists();
    let mut wire = vec![u8::from(present)];
    transport.broadcast(0, &mut wire)?;
    if wire.first() == Some(&1) {
        if ctx.node.is_master() {
            warn!(target: "bootstrap", "ice_sentinel_present");
            for rank in 1..ctx.world_size {
                transport.send(rank, Tag::Terminate, &[])?;
            }
        }
        return Err(MechError::Ice);
    }
    Ok(())
}

/// One rank's full run: bootstrap (ICE, config, archive open/create or
/// restart) then the pool outer loop, dispatched as master or worker
/// depending on `transport.rank()` (spec §4.5 via `ctx.node.is_master()`).
fn run_rank<T: Transport>(
    transport: &T,
    registry: &ModuleRegistry,
    args: &Args,
) -> Result<(), MechError> {
    let ctx = RunContext {
        node: NodeId(transport.rank()),
        world_size: transport.world_size(),
        restart_mode: args.restart_mode,
        blocking: args.blocking,
    };

    check_ice(transport, &ctx)?;
    run_rank_inner::<T>(transport, registry, args, ctx)
}

fn run_rank_inner<T: Transport>(
    transport: &T,
    registry: &ModuleRegistry,
    args: &Args,
    ctx: RunContext,
) -> Result<(), MechError> {
    let mut init = InitSpec::default();
    registry.module.init(&mut init);
    let mut setup = SetupSpec::default();
    registry.module.setup(&mut setup);

    // §6.2's config file is only ever read by the master (spec §5 "read
    // only on workers for the remainder of the run"); the resolved
    // namespaces are handed to every worker as a `TAG_STANDBY` broadcast
    // (spec §4.10) rather than re-parsed independently on each rank.
    let resolved_config = if ctx.node.is_master() {
        let parsed = if let Some(path) = &args.config {
            let namespaces = known_namespaces(&registry.name, &setup);
            let known: Vec<(&str, &[&str])> = namespaces
                .iter()
                .map(|(name, keys)| (*name, keys.as_slice()))
                .collect();
            ini::load_file(path, &known)?
        } else {
            Vec::new()
        };
        let mut wire = ini::encode_namespaces(&parsed);
        transport.broadcast(0, &mut wire)?;
        parsed
    } else {
        let mut wire = Vec::new();
        transport.broadcast(0, &mut wire)?;
        ini::decode_namespaces(&wire)?
    };
    debug!(
        target: "bootstrap",
        rank = transport.rank(),
        namespaces = resolved_config.len(),
        "config_broadcast_received"
    );

    let board_dims = args.board_dims();
    let master_path = master_file_path(args);
    let start = Instant::now();
    let mut arena = Arena::new();
    let mut pools = PoolSet::default();

    let (resume, initial_runtime) = if args.restart_mode {
        let restart_file = args
            .restart_file
            .clone()
            .ok_or_else(|| MechError::Setup("--restart-mode requires --restart-file".into()))?;
        let outcome = mech_restart::restart::<T, Hdf5Backend>(
            &ctx,
            transport,
            registry,
            &mut arena,
            &restart_file,
            &master_path,
            board_dims,
            layout::API_VERSION,
            args.reset_checkpoints,
        )?;
        pools = outcome.pools;
        (Some(outcome.resume), Some(outcome.runtime))
    } else {
        if ctx.node.is_master() {
            let archive = Hdf5Backend::create(&master_path)?;
            archive.write_attribute("/", layout::ATTR_MODULE, &AttrValue::Text(registry.name.clone()))?;
            archive.write_attribute("/", layout::ATTR_API, &AttrValue::Double(layout::API_VERSION))?;
        }
        transport.barrier()?;
        (None, None)
    };

    let archive = Hdf5Backend::open(&master_path)?;
    // Held for the rest of the run so a panic or early `?` return mid-run
    // still flushes the archive to disk (mirrors `TerminalGuard`'s restore
    // on drop).
    let _flush_guard = archive.flush_guard();

    registry.module.prepare(ctx.node, &args.name);

    let checkpoint_files = if args.no_backup {
        0
    } else {
        args.checkpoint_files.unwrap_or(DEFAULT_CHECKPOINT_FILES)
    };

    let opts = OuterLoopOptions {
        disable_task_loop: false,
        reset_checkpoints: args.reset_checkpoints,
        config_attrs: config_board_attrs(args, &registry.name),
    };

    run_pools(
        &ctx,
        registry,
        &archive,
        &mut arena,
        &mut pools,
        board_dims,
        opts,
        resume,
        initial_runtime,
        |runtime: &mut PoolRuntime, arena: &mut Arena| {
            mech_master::dispatch(
                transport,
                &archive,
                registry,
                &master_path,
                checkpoint_files,
                args.checkpoint,
                runtime,
                arena,
            )
        },
        |pool| mech_worker::run(transport, registry, pool),
    )?;

    if ctx.node.is_master() {
        for pool in pools.iter() {
            delete_temp_datasets(&archive, &mut arena, pool)?;
        }
        if args.stats {
            archive.write_attribute(
                "/",
                layout::ATTR_MPI_SIZE,
                &AttrValue::Int(transport.world_size()),
            )?;
            archive.write_attribute(
                "/",
                layout::ATTR_CPU_TIME_S,
                &AttrValue::Double(start.elapsed().as_secs_f64()),
            )?;
        }
    }
    transport.barrier()?;

    debug!(target: "bootstrap", rank = transport.rank(), elapsed_s = start.elapsed().as_secs_f64(), "run_complete");
    Ok(())
}

/// Runs a complete `mechanic` invocation against `registry`: builds the
/// in-process `ThreadTransport` world, spawns one thread per simulated
/// rank, and returns the master's (`rank == 0`) result — every rank's
/// failure is fatal to the whole world (spec §7 "non-success ... aborts
/// the whole world"), so the first error observed on any rank is
/// returned.
pub fn run(registry: ModuleRegistry, args: Args) -> Result<(), MechError> {
    let world_size = 1 + worker_count();
    info!(target: "bootstrap", world_size, board_dims = ?args.board_dims(), "starting");

    let world = ThreadTransport::build_world(world_size);
    let results: Vec<Result<(), MechError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = world
            .into_iter()
            .map(|transport| {
                let registry = &registry;
                let args = &args;
                scope.spawn(move || run_rank(&transport, registry, args))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err(MechError::Transport("rank thread panicked".into()))))
            .collect()
    });

    results.into_iter().find(|r| r.is_err()).unwrap_or(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn known_namespaces_uses_module_name_and_setup_keys() {
        let mut setup = SetupSpec::default();
        setup.known_options.set("xres", "");
        setup.known_options.set("yres", "");
        let namespaces = known_namespaces("hello", &setup);
        assert_eq!(namespaces.len(), 1);
        assert_eq!(namespaces[0].0, "hello");
        assert_eq!(namespaces[0].1, vec!["xres", "yres"]);
    }

    #[test]
    fn worker_count_reads_env_override() {
        // SAFETY: test-only; no other test in this crate reads or writes
        // MECHANIC_WORKERS, so there is no cross-test race on the var.
        unsafe { std::env::set_var("MECHANIC_WORKERS", "2") };
        assert_eq!(worker_count(), 2);
        unsafe { std::env::remove_var("MECHANIC_WORKERS") };
        assert_eq!(worker_count(), DEFAULT_WORKER_COUNT);
    }

    #[test]
    fn master_file_path_derives_from_archive_name() {
        let args = Args::parse_from(["mechanic", "--name", "run42"]);
        assert_eq!(master_file_path(&args), PathBuf::from("run42-master.h5"));
    }

    #[test]
    fn check_ice_passes_when_sentinel_absent() {
        let world = ThreadTransport::build_world(1);
        let ctx = RunContext {
            node: NodeId(0),
            world_size: 1,
            restart_mode: false,
            blocking: false,
        };
        assert!(check_ice(&world[0], &ctx).is_ok());
    }
}
