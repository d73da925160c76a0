//! "hello" example module (spec §1 "the example user modules"):
//! `TaskProcess` writes its own cell coordinates into a `LIST` dataset
//! named `result`. Mirrors the reference's
//! `examples/hello/mechanic_module_hello.c`, kept in the workspace's
//! idiom rather than translated line-by-line (`hello_pixelCompute` writes
//! `r->res[0..2] = coords[0..2]`; `hello_slaveOUT` is folded into a
//! `tracing` log line instead of a direct `printf`).

use clap::Parser;
use mech_module::{ModuleRegistry, UserModule};
use mech_types::{Datatype, HdfVisibility, Pool, PoolAction, Schema, StorageDiscipline, Task};
use mechanic::Args;

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

    fn task_process(&self, _p: &Pool, t: &mut Task) -> Result<(), mech_module::ModuleError> {
        let buf = t.storage.get_mut("result").expect("result buffer allocated by Storage");
        for (axis, slot) in t.location.iter().zip(buf.chunks_exact_mut(4)) {
            slot.copy_from_slice(&(*axis as i32).to_le_bytes());
        }
        tracing::info!(target: "hello", tid = t.tid, node = t.node, "hello from worker");
        Ok(())
    }

    fn pool_process(&self, _pools: &mech_module::PoolSet, p: &mut Pool) -> PoolAction {
        if p.completed >= p.pool_size {
            PoolAction::Finalize
        } else {
            PoolAction::StageReset
        }
    }
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();
    let _log_guard = mechanic::configure_logging();
    mechanic::install_panic_hook();

    let registry = ModuleRegistry::new("hello", Box::new(HelloModule));
    match mechanic::run(registry, args) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(target: "bootstrap", error = %err, "run_failed");
            std::process::ExitCode::from((err.exit_code() & 0xff) as u8)
        }
    }
}
