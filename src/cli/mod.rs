use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long)]
    pub verbose: Option<LevelFilter>,

    /// Path to the configuration file.
    #[arg(
        long,
        short = 'c',
        env = "INCR_BACKUP_CONFIG",
        default_value = "/etc/incr-backup/config.toml"
    )]
    pub config: PathBuf,

    /// Read the capture streams but upload nothing and leave all capture
    /// state untouched.
    #[arg(long)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub action: Option<Action>,
}

#[derive(Subcommand, Debug, Default)]
pub enum Action {
    /// Capture and upload every configured target. (Default)
    #[default]
    Backup,
}
