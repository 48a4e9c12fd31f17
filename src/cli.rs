use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::command::{parse_difficulty, parse_mode};
use crate::config::ServerConfig;

/// Authoritative lobby and match orchestrator for networked kart
/// racing.
#[derive(Debug, Parser)]
#[command(name = "marshal", version)]
pub struct Cli {
    /// Directory containing marshal.toml and the database file.
    #[arg(long)]
    pub config_dir: Option<PathBuf>,

    /// Overrides the configured server uid.
    #[arg(long)]
    pub server_uid: Option<String>,

    /// Public host:port to register with the backing service.
    #[arg(long)]
    pub public_address: Option<String>,

    /// Local host:port the transport binds; defaults to 0.0.0.0:2759.
    #[arg(long)]
    pub bind_address: Option<String>,

    /// Private-server password.
    #[arg(long)]
    pub password: Option<String>,

    #[arg(long)]
    pub max_players: Option<usize>,

    /// normal-race, time-trial, free-for-all, capture-the-flag, soccer.
    #[arg(long)]
    pub mode: Option<String>,

    /// novice, intermediate, expert, supreme.
    #[arg(long)]
    pub difficulty: Option<String>,
}

impl Cli {
    /// Overlays the flags onto a loaded config.
    pub fn apply(&self, config: &mut ServerConfig) -> Result<()> {
        if let Some(uid) = &self.server_uid {
            config.server_uid = uid.clone();
        }
        if let Some(address) = &self.public_address {
            config.public_address = address.clone();
        }
        if let Some(password) = &self.password {
            config.password = password.clone();
        }
        if let Some(max_players) = self.max_players {
            config.max_players = max_players;
        }
        if let Some(mode) = &self.mode {
            config.mode = parse_mode(mode)?;
        }
        if let Some(difficulty) = &self.difficulty {
            config.difficulty = parse_difficulty(difficulty)?;
        }
        Ok(())
    }
}
