use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::level_filters::LevelFilter;

/// How messages are framed on stdin/stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Framing {
    /// Length-prefixed frames, as browsers launch native messaging hosts.
    #[default]
    Native,
    /// One JSON document per line. Handy for scripting and debugging.
    Lines,
}

#[derive(Parser)]
#[command(version, about = "Tracks time per website for a browser extension")]
pub struct DaemonArgs {
    /// Application directory. Defaults to the platform state directory.
    #[arg(long)]
    pub dir: Option<PathBuf>,
    /// Configuration file. Defaults to config.json in the application directory.
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t)]
    pub framing: Framing,
    /// This option is for debugging purposes only. Logs go to stderr.
    #[arg(long = "log-console")]
    pub log_console: bool,
    #[arg(long = "log-filter")]
    pub log: Option<LevelFilter>,
    /// Browsers pass the caller's origin as a trailing argument.
    #[arg(hide = true)]
    pub origin: Vec<String>,
    /// Passed by Chrome on Windows.
    #[arg(long = "parent-window", hide = true)]
    pub parent_window: Option<i64>,
}
