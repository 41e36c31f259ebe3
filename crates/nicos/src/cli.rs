//! Clap derive structures for the `nicos` CLI.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// nicos -- cache server, poller and device access for instrument control
#[derive(Debug, Parser)]
#[command(
    name = "nicos",
    version,
    about = "Run the NICOS cache and poller, and talk to devices",
    long_about = "Runs the shared key/value cache and the device poller, and\n\
        gives scripting access to cache keys and to devices declared in\n\
        setup files.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Configuration file (default: nicos.toml in the platform config dir)
    #[arg(long, env = "NICOS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Cache server address, host[:port] (overrides the config file)
    #[arg(long, short = 'c', env = "NICOS_CACHE", global = true)]
    pub cache: Option<String>,

    /// Additional setup directory (repeatable)
    #[arg(long = "setup-dir", short = 'S', global = true)]
    pub setup_dirs: Vec<PathBuf>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "NICOS_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Also write logs to daily files in this directory
    #[arg(long, env = "NICOS_LOG_DIR", global = true)]
    pub log_dir: Option<PathBuf>,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a cache server
    Cache(CacheArgs),

    /// Poll the devices of one or more setups into the cache
    Poller(PollerArgs),

    /// Print cache keys
    Get(GetArgs),

    /// Write a cache key
    Set(SetArgs),

    /// Follow updates of cache keys
    Watch(WatchArgs),

    /// Inspect setup files
    Setups(SetupsArgs),

    /// Read the value and status of devices
    Read(ReadArgs),

    /// Move a device
    #[command(alias = "mv")]
    Move(MoveArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Services ─────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CacheArgs {
    /// Listen address (default: the configured cache address)
    #[arg(long, short = 'l')]
    pub listen: Option<String>,

    /// Keep values in this directory across restarts (overrides
    /// `cache.store_path`)
    #[arg(long)]
    pub store: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct PollerArgs {
    /// Setups whose devices are polled
    #[arg(required = true)]
    pub setups: Vec<String>,

    /// Devices not to poll (adds to the configured blacklist)
    #[arg(long, short = 'b')]
    pub blacklist: Vec<String>,

    /// Bound on a single poll
    #[arg(long, value_parser = humantime::parse_duration)]
    pub poll_timeout: Option<Duration>,
}

// ── Cache keys ───────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GetArgs {
    /// Keys (`device/param` or a full key); with --all, key substrings
    #[arg(required = true)]
    pub keys: Vec<String>,

    /// Print every key containing the given text
    #[arg(long, short = 'a')]
    pub all: bool,
}

#[derive(Debug, Args)]
pub struct SetArgs {
    /// Key (`device/param` or a full key)
    pub key: String,

    /// Value literal, e.g. `1.5`, `'text'` or `(0, 10)`
    pub value: String,

    /// Time to live
    #[arg(long, value_parser = humantime::parse_duration)]
    pub ttl: Option<Duration>,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Key substring to follow (default: everything under the prefix)
    pub pattern: Option<String>,

    /// Stop after this many updates
    #[arg(long, short = 'n')]
    pub count: Option<usize>,

    /// Stop after this long
    #[arg(long = "for", value_parser = humantime::parse_duration)]
    pub duration: Option<Duration>,
}

// ── Setups ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct SetupsArgs {
    #[command(subcommand)]
    pub command: SetupsCommand,
}

#[derive(Debug, Subcommand)]
pub enum SetupsCommand {
    /// List all setups found in the setup directories
    #[command(alias = "ls")]
    List,

    /// Show the devices and includes of one setup
    Show {
        /// Setup name
        name: String,
    },
}

// ── Devices ──────────────────────────────────────────────────────────

/// Options for commands that create devices from setups.
#[derive(Debug, Args)]
pub struct SessionOpts {
    /// Setups to load (repeatable)
    #[arg(long, short = 's', required = true)]
    pub setup: Vec<String>,

    /// Do not connect to the cache server
    #[arg(long)]
    pub no_cache: bool,

    /// Bound on each hardware access
    #[arg(long, value_parser = humantime::parse_duration)]
    pub io_timeout: Option<Duration>,
}

#[derive(Debug, Args)]
pub struct ReadArgs {
    /// Devices to read (default: all devices of the setups)
    pub devices: Vec<String>,

    #[command(flatten)]
    pub session: SessionOpts,
}

#[derive(Debug, Args)]
pub struct MoveArgs {
    /// Device to move
    pub device: String,

    /// Target, as a value literal (bare words are taken as strings)
    pub target: String,

    /// Wait until the device has arrived
    #[arg(long, short = 'w')]
    pub wait: bool,

    /// Give up waiting after this long
    #[arg(long, value_parser = humantime::parse_duration, requires = "wait")]
    pub timeout: Option<Duration>,

    #[command(flatten)]
    pub session: SessionOpts,
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_tree_is_consistent() {
        Cli::command().debug_assert();
    }
}
