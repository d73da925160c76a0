//! CLI surface (spec §6.1), one field per option-table row, mirroring
//! `ox-bin`'s `Args` struct. `--help`/`--usage` are modeled as plain flags
//! (clap's built-ins are disabled) since the spec assigns them nonstandard
//! exit codes (212/213) that `main` — not clap — must produce.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "mechanic", disable_help_flag = true, disable_version_flag = true)]
pub struct Args {
    /// Archive basename.
    #[arg(long, default_value = "mechanic")]
    pub name: String,

    /// User module identity; controls which callbacks are bound.
    #[arg(long, default_value = "core")]
    pub module: String,

    /// Path to the configuration file. Missing file is fatal only when
    /// this flag was passed explicitly (spec §6.1).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Runtime mode identity (master/worker strategy library).
    #[arg(long, default_value = "taskfarm")]
    pub mode: String,

    #[arg(long)]
    pub xres: Option<usize>,
    #[arg(long)]
    pub yres: Option<usize>,
    #[arg(long)]
    pub zres: Option<usize>,

    /// Checkpoint batch size.
    #[arg(long, default_value_t = 2048)]
    pub checkpoint: usize,

    /// Archive rotation limit.
    #[arg(long)]
    pub checkpoint_files: Option<usize>,

    /// Skip backup of an existing master file.
    #[arg(long)]
    pub no_backup: bool,

    #[arg(long)]
    pub restart_mode: bool,
    #[arg(long)]
    pub restart_file: Option<PathBuf>,
    /// Clear each `ToBeRestarted` cell's checkpoint id (spec §3 Board,
    /// "reset-checkpoints flag"); omitted from §6.1's option table but
    /// required by the Board restart invariant it names.
    #[arg(long)]
    pub reset_checkpoints: bool,

    /// Force blocking messaging.
    #[arg(long)]
    pub blocking: bool,

    /// Record wall-clock and MPI size attributes.
    #[arg(long)]
    pub stats: bool,

    #[arg(long)]
    pub help: bool,
    #[arg(long)]
    pub usage: bool,
}

impl Args {
    pub fn board_dims(&self) -> [usize; 3] {
        [
            self.xres.unwrap_or(1),
            self.yres.unwrap_or(1),
            self.zres.unwrap_or(1),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let args = Args::parse_from(["mechanic"]);
        assert_eq!(args.name, "mechanic");
        assert_eq!(args.module, "core");
        assert_eq!(args.mode, "taskfarm");
        assert_eq!(args.checkpoint, 2048);
        assert_eq!(args.board_dims(), [1, 1, 1]);
    }

    #[test]
    fn board_dims_read_from_flags() {
        let args = Args::parse_from(["mechanic", "--xres", "8", "--yres", "8", "--zres", "1"]);
        assert_eq!(args.board_dims(), [8, 8, 1]);
    }
}
