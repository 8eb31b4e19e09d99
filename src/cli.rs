// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Defines the up and down subcommands and their arguments.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "anabasis")]
#[command(about = "Bring remote service environments up and down over SSH, in order")]
#[command(version)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "anabasis.yml")]
    pub config: PathBuf,

    /// Log level (DEBUG, INFO, WARN, ERROR)
    #[arg(short, long, global = true, default_value = "INFO")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start every step of an environment in declared order
    Up {
        /// Environment to operate on
        #[arg(short, long)]
        env: String,

        /// Path to SSH private key
        #[arg(short = 'k', long)]
        ssh_key: PathBuf,

        /// Log operations without executing any command
        #[arg(long)]
        dry_run: bool,

        /// Start and stop dependency steps instead of just verifying them
        #[arg(long)]
        handle_deps: bool,

        /// Overall operation timeout (e.g. "5m")
        #[arg(long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,

        /// Background health-check interval (e.g. "2s")
        #[arg(long, value_parser = humantime::parse_duration)]
        check_interval: Option<Duration>,
    },

    /// Stop every step of an environment in reverse order
    Down {
        /// Environment to operate on
        #[arg(short, long)]
        env: String,

        /// Path to SSH private key
        #[arg(short = 'k', long)]
        ssh_key: PathBuf,

        /// Log operations without executing any command
        #[arg(long)]
        dry_run: bool,

        /// Also stop dependency steps
        #[arg(long)]
        stop_deps: bool,

        /// Overall operation timeout (e.g. "5m")
        #[arg(long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,
    },
}
