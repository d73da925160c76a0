//! Mandelbrot example module (spec §1, S2): each cell's `TaskProcess`
//! computes an escape-time iteration count for the complex point its
//! `(x, y)` board coordinate maps to, clipped at 256, and stores it in a
//! `BOARD`-discipline dataset named `result`. Mirrors the reference's
//! `mechanic_module_ex_mandelbrot.h` (`int fractal(double a, double b,
//! double c)`) in the workspace's idiom; the header carries no body, so
//! the escape-time loop itself follows the textbook algorithm the spec
//! names directly ("the standard iteration count clipped at 256").

use clap::Parser;
use mech_module::{ModuleRegistry, PoolSet, UserModule};
use mech_types::{Datatype, HdfVisibility, Pool, PoolAction, Schema, StorageDiscipline, Task};
use mechanic::Args;

const MAX_ITER: i32 = 256;
const RE_MIN: f64 = -2.0;
const RE_MAX: f64 = 1.0;
const IM_MIN: f64 = -1.5;
const IM_MAX: f64 = 1.5;

/// Escape-time iteration count for `c = a + bi` under `z_{n+1} = z_n^2 + c`,
/// clipped at `MAX_ITER` (spec S2).
fn fractal(a: f64, b: f64) -> i32 {
    let (mut zr, mut zi) = (0.0f64, 0.0f64);
    for n in 0..MAX_ITER {
        if zr * zr + zi * zi > 4.0 {
            return n;
        }
        let next_zr = zr * zr - zi * zi + a;
        let next_zi = 2.0 * zr * zi + b;
        zr = next_zr;
        zi = next_zi;
    }
    MAX_ITER
}

struct MandelbrotModule;

impl UserModule for MandelbrotModule {
    fn storage(&self, pool: &mut Pool) {
        pool.task_schema.push(Schema {
            name: "result".into(),
            rank: 3,
            dims: vec![1, 1, 1],
            datatype: Datatype::Int,
            storage_type: StorageDiscipline::Board,
            sync: true,
            use_hdf: HdfVisibility::Normal,
        });
    }

    fn task_process(&self, p: &Pool, t: &mut Task) -> Result<(), mech_module::ModuleError> {
        let [x, y, _z] = t.location;
        let [bx, by, _bz] = p.board_dims;
        let a = RE_MIN + (RE_MAX - RE_MIN) * (x as f64 / bx.max(1) as f64);
        let b = IM_MIN + (IM_MAX - IM_MIN) * (y as f64 / by.max(1) as f64);
        let count = fractal(a, b);

        let buf = t.storage.get_mut("result").expect("result buffer allocated by Storage");
        buf[..4].copy_from_slice(&count.to_le_bytes());
        Ok(())
    }

    fn pool_process(&self, _pools: &PoolSet, p: &mut Pool) -> PoolAction {
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

    let registry = ModuleRegistry::new("mandelbrot", Box::new(MandelbrotModule));
    match mechanic::run(registry, args) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(target: "bootstrap", error = %err, "run_failed");
            std::process::ExitCode::from((err.exit_code() & 0xff) as u8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_never_escapes() {
        assert_eq!(fractal(0.0, 0.0), MAX_ITER);
    }

    #[test]
    fn far_point_escapes_immediately() {
        assert_eq!(fractal(5.0, 5.0), 0);
    }
}
