//! Command dispatch: CLI args -> core operations -> output formatting.

pub mod cache;
pub mod devices;
pub mod keys;
pub mod poller;
pub mod setups;
pub mod util;

use nicos_config::Config;

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;

/// Dispatch a command to its handler.
pub async fn dispatch(cmd: Command, cfg: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    match cmd {
        Command::Cache(args) => cache::handle(args, cfg, global).await,
        Command::Poller(args) => poller::handle(args, cfg, global).await,
        Command::Get(args) => keys::get(args, cfg, global).await,
        Command::Set(args) => keys::set(args, cfg, global).await,
        Command::Watch(args) => keys::watch(args, cfg, global).await,
        Command::Setups(args) => setups::handle(&args, cfg, global),
        Command::Read(args) => devices::read(args, cfg, global).await,
        Command::Move(args) => devices::move_device(args, cfg, global).await,
        // Completions are handled before dispatch
        Command::Completions(_) => Ok(()),
    }
}
