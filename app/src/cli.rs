use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use engine::EngineConfig;
use storage::HISTORY_KEY;
use util::DeviceClass;

const APP_DIR: &str = "rambench";

#[derive(Parser, Debug)]
#[command(
    name = "rambench",
    about = "Measure how much memory this process can really obtain",
    version = env!("CARGO_PKG_VERSION"),
    disable_help_subcommand = true
)]
pub struct Cli {
    /// Path of the JSON run history
    #[arg(long, global = true, env = "RAMBENCH_HISTORY")]
    pub history: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Commit memory until the host refuses, then record the peak
    Run(RunArgs),

    /// Print stored runs
    History {
        /// Print the raw JSON records
        #[arg(long)]
        json: bool,
    },

    /// Delete every stored run
    ClearHistory,

    /// Print one memory telemetry sample
    Snapshot {
        /// Device class used to show the starting chunk size
        #[arg(long, env = "RAMBENCH_DEVICE_CLASS", default_value = "tablet")]
        device_class: DeviceClass,
    },
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Chunk sizing profile: phone or tablet
    #[arg(long, env = "RAMBENCH_DEVICE_CLASS", default_value = "tablet")]
    pub device_class: DeviceClass,

    /// Delay before every chunk attempt, in milliseconds
    #[arg(long, env = "RAMBENCH_PACING_MS", default_value_t = 100)]
    pub pacing_ms: u64,

    /// Refuse commits beyond this many GiB instead of waiting for the OS to
    #[arg(long, env = "RAMBENCH_CEILING_GB")]
    pub ceiling_gb: Option<f64>,
}

impl RunArgs {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            pacing: Duration::from_millis(self.pacing_ms),
            device_class: self.device_class,
        }
    }
}

impl Cli {
    /// History path from the flag, else the XDG data dir, else `$HOME`, else
    /// the working directory.
    pub fn history_path(&self) -> PathBuf {
        if let Some(path) = &self.history {
            return path.clone();
        }
        let file = format!("{HISTORY_KEY}.json");
        let data_dir = std::env::var_os("XDG_DATA_HOME")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var_os("HOME")
                    .filter(|dir| !dir.is_empty())
                    .map(|home| PathBuf::from(home).join(".local").join("share"))
            });
        match data_dir {
            Some(dir) => dir.join(APP_DIR).join(file),
            None => PathBuf::from(file),
        }
    }
}
