//! `mechanic` entry point: parses the CLI surface (spec §6.1), handles
//! `--help`/`--usage` with their nonstandard exit codes, installs logging
//! and the panic hook (`ox-bin::main`'s `AppStartup` shape), then hands
//! off to [`mechanic::run`] with the built-in no-op module.
//!
//! Loading a real user module (spec §1's "out of scope" dynamic-library
//! loader) is left to callers of the `mechanic` library crate — see
//! `demos/` for worked examples.

use clap::Parser;
use mech_types::MechError;
use mechanic::Args;

const CORE_HELP: i32 = 212;
const CORE_USAGE: i32 = 213;

fn print_help() {
    println!(
        "mechanic — distributed task-farm framework for parameter sweeps\n\n\
         USAGE:\n    mechanic [OPTIONS]\n\n\
         OPTIONS:\n\
         \x20   --name <NAME>                Archive basename [default: mechanic]\n\
         \x20   --module <MODULE>            User module identity [default: core]\n\
         \x20   --config <PATH>              Configuration file\n\
         \x20   --mode <MODE>                Runtime mode [default: taskfarm]\n\
         \x20   --xres/--yres/--zres <N>     Board dimensions\n\
         \x20   --checkpoint <N>             Checkpoint batch size [default: 2048]\n\
         \x20   --checkpoint-files <N>       Archive rotation limit\n\
         \x20   --no-backup                  Skip backup of an existing master file\n\
         \x20   --restart-mode               Resume from --restart-file\n\
         \x20   --restart-file <PATH>        Archive to resume from\n\
         \x20   --reset-checkpoints          Clear ToBeRestarted checkpoint ids on resume\n\
         \x20   --blocking                   Force blocking messaging\n\
         \x20   --stats                      Record wall-clock and MPI size attributes\n\
         \x20   --help                       Print this help and exit\n\
         \x20   --usage                      Print a usage line and exit"
    );
}

fn print_usage() {
    println!(
        "usage: mechanic [--name NAME] [--module MODULE] [--config PATH] [--mode MODE] \
         [--xres N] [--yres N] [--zres N] [--checkpoint N] [--checkpoint-files N] \
         [--no-backup] [--restart-mode] [--restart-file PATH] [--reset-checkpoints] \
         [--blocking] [--stats] [--help] [--usage]"
    );
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();

    if args.help {
        print_help();
        return std::process::ExitCode::from(CORE_HELP as u8);
    }
    if args.usage {
        print_usage();
        return std::process::ExitCode::from(CORE_USAGE as u8);
    }

    let _log_guard = mechanic::configure_logging();
    mechanic::install_panic_hook();

    let registry = mech_module::ModuleRegistry::noop();
    match mechanic::run(registry, args) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(target: "bootstrap", error = %err, "run_failed");
            exit_code_to_process_code(err.exit_code())
        }
    }
}

fn clamp_exit_code(code: i32) -> u8 {
    (code & 0xff) as u8
}

fn exit_code_to_process_code(code: i32) -> std::process::ExitCode {
    std::process::ExitCode::from(clamp_exit_code(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn help_and_usage_exit_codes_match_spec_table() {
        assert_eq!(clamp_exit_code(CORE_HELP), 212);
        assert_eq!(clamp_exit_code(CORE_USAGE), 213);
    }

    #[test]
    fn module_exit_code_mask_preserves_in_range_codes() {
        let err = MechError::Module(213);
        assert_eq!(clamp_exit_code(err.exit_code()), 213);
    }
}
