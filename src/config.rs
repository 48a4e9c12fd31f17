use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use lazy_static::*;
use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use kartnet::{Difficulty, GameMode};

lazy_static! {
    /// Server version.
    pub static ref VERSION: Version = Version::parse(env!("CARGO_PKG_VERSION")).expect("failed to parse our own SemVer");
}

/// Wire protocol version; bumped whenever a packet schema changes
/// incompatibly.
pub const PROTOCOL_VERSION: u32 = 6;

/// User-Agent header for outgoing requests.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Safety margin added on top of the largest half-RTT when scheduling
/// the simultaneous race start.
pub const START_SAFETY_MARGIN_MS: u64 = 2500;

/// Physics tick rate of the authoritative simulation.
pub const TICKS_PER_SECOND: u32 = 120;

/// Decode failures tolerated per peer before the peer is disconnected.
pub const MAX_DECODE_FAILURES: u32 = 10;

/// Chat offences (spam, impersonation) tolerated before a kick.
pub const MAX_CHAT_OFFENCES: u32 = 3;

/// In-game player caps per mode, applied on top of the server limit.
pub const FFA_PLAYER_CAP: usize = 10;
pub const CTF_PLAYER_CAP: usize = 14;
pub const SOCCER_PLAYER_CAP: usize = 14;

pub fn time_to_ticks(seconds: f32) -> u32 {
    (seconds * TICKS_PER_SECOND as f32) as u32
}

pub fn ticks_to_time(ticks: u32) -> f32 {
    ticks as f32 / TICKS_PER_SECOND as f32
}

/// Server config. Every tunable of the lobby, admission control and the
/// per-race rule engines is a field here; the CLI can override the
/// operational subset (address, password, limits, mode, difficulty).
#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name shown in the server browser.
    pub server_name: String,

    /// Unique identifier of this server instance; part of the
    /// per-server database table names.
    pub server_uid: String,

    /// Public `host:port` to register with the backing service.
    pub public_address: String,

    /// Registration endpoint; empty disables online registration
    /// (LAN-only server).
    pub register_url: String,

    /// Private-server password; empty means open server.
    pub password: String,

    /// Lobby-wide player limit.
    pub max_players: usize,

    /// In-game limit below the lobby limit; 0 means no extra limit.
    pub max_players_in_game: usize,

    pub mode: GameMode,
    pub difficulty: Difficulty,

    /// Minimum connected players before the crown may start a match.
    pub min_start_game_players: usize,

    /// Seconds the voting window stays open.
    pub voting_timeout_secs: f32,

    /// Seconds to wait for all peers to acknowledge world loading
    /// before demoting the stragglers to spectators.
    pub world_load_timeout_secs: f32,

    /// Seconds to wait for `RaceFinishedAck` before counting a peer
    /// as having acknowledged anyway.
    pub result_ack_timeout_secs: f32,

    /// Auto-start countdown announced to clients; 0 disables it.
    pub auto_start_timer_secs: f32,

    /// Physics ticks between two authoritative network updates.
    pub state_frequency: u32,

    /// Idle seconds before a lobby peer is kicked.
    pub kick_idle_lobby_player_seconds: f32,

    /// Idle seconds before an in-race peer is kicked.
    pub kick_idle_player_seconds: f32,

    /// Whether peers may chat at all.
    pub chat: bool,

    /// Anti-spam window in seconds. A message arriving within this many
    /// seconds of the previous one bumps the sender's consecutive
    /// counter; once the counter exceeds `interval / 2` (a dimensionally
    /// odd but long-standing rule) the message is dropped.
    pub chat_consecutive_interval: u32,

    /// Whether player reports are accepted and stored.
    pub reports_allowed: bool,

    /// Player names holding hammer (admin) rights for chat commands.
    pub admins: Vec<String>,

    // Admission thresholds, see the asset manager.
    pub official_karts_threshold: f32,
    pub official_tracks_threshold: f32,
    pub official_karts_play_threshold: f32,
    pub official_tracks_play_threshold: f32,
    pub addon_karts_join_threshold: usize,
    pub addon_tracks_join_threshold: usize,
    pub addon_arenas_join_threshold: usize,
    pub addon_soccers_join_threshold: usize,
    pub addon_karts_play_threshold: usize,
    pub addon_tracks_play_threshold: usize,
    pub addon_arenas_play_threshold: usize,
    pub addon_soccers_play_threshold: usize,

    /// Maps every client must have to connect at all.
    pub must_have_maps: Vec<String>,

    /// Maps a client must have to play (missing ones force spectating).
    pub play_requirement_maps: Vec<String>,

    /// Karts the server offers.
    pub official_karts: Vec<String>,
    pub addon_karts: Vec<String>,

    /// Maps the server offers. Arenas and soccer fields are subsets of
    /// the addon map set.
    pub official_maps: Vec<String>,
    pub addon_maps: Vec<String>,
    pub addon_arenas: Vec<String>,
    pub addon_soccers: Vec<String>,

    /// Maps flagged as supporting capture-the-flag.
    pub ctf_maps: Vec<String>,

    /// Tracks that cannot run in reverse.
    pub no_reverse_maps: Vec<String>,

    /// Vote decision algorithm: 0 standard, 1 random, 2 advanced
    /// (currently falls back to standard).
    pub map_vote_algorithm: u8,

    /// Forced direction for every race: "forward", "reverse", or ""
    /// to let the vote decide.
    pub fixed_direction: String,

    /// Forced lap count; 0 lets the vote decide.
    pub fixed_lap_count: u8,

    /// Multiplier applied to the voted lap count; 0 disables.
    pub lap_multiplier: f32,

    /// Item policy string, see the item policy engine. Presets
    /// "normal" and "tt" are accepted.
    pub item_policy: String,

    /// Dead zone around half the track length in which across-the-line
    /// blue-flag detection is disabled, as a fraction of track length.
    pub blue_flag_line_guard: f32,

    /// Grand-prix scoring parameter string, e.g. "inc 0 2 4 5 6 8".
    pub gp_scoring: String,

    /// Number of races per grand prix; 0 runs single races.
    pub gp_track_count: u8,

    /// Tournament rules string; empty disables the tournament overlay.
    pub tournament: String,

    /// Named player categories loaded at startup, e.g. `"pro: alice bob"`.
    pub categories: Vec<String>,

    /// One-time and cyclic map/kart queue filters, in the textual
    /// filter language.
    pub onetime_map_queue: Vec<String>,
    pub cyclic_map_queue: Vec<String>,
    pub onetime_kart_queue: Vec<String>,
    pub cyclic_kart_queue: Vec<String>,

    /// SQLite database file, relative to the config dir.
    pub database_file: String,

    /// Whether finished-race results are persisted.
    pub store_results: bool,

    // Tyre and fuel model parameters shared by all karts.
    pub fuel_capacity: f32,
    pub fuel_regen: f32,
    pub fuel_stop_ratio: f32,
    pub fuel_weight: f32,
    pub fuel_rate: f32,

    /// Starting compound queue handed to every kart; -1 entries mean
    /// an unlimited supply of that compound.
    pub tyre_queue: Vec<i32>,

    /// Kart mass used by the degradation proxies.
    pub kart_mass: f32,

    /// Per-compound tyre characteristics, softest first. An empty list
    /// selects the built-in three-compound table.
    pub tyre_compounds: Vec<TyreCompoundConfig>,

    /// Piecewise-linear curves shared by all compounds, as (x, y)
    /// points. Empty lists select the built-in curves.
    pub tyre_response_curve_traction: Vec<(f32, f32)>,
    pub tyre_response_curve_turning: Vec<(f32, f32)>,
    pub tyre_response_curve_topspeed: Vec<(f32, f32)>,
    pub tyre_heat_cycle_hardness_curve: Vec<(f32, f32)>,
    pub tyre_hardness_penalty_curve: Vec<(f32, f32)>,
}

/// One tyre compound, as configured. Field meanings follow the
/// degradation model; unset fields fall back to a medium compound.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TyreCompoundConfig {
    pub hardness_multiplier: f32,
    pub ideal_temp: f32,
    pub max_life_traction: f32,
    pub max_life_turning: f32,
    pub limiting_transfer_traction: f32,
    pub regular_transfer_traction: f32,
    pub limiting_transfer_turning: f32,
    pub regular_transfer_turning: f32,
    pub subtractive_traction: bool,
    pub subtractive_turning: bool,
    pub subtractive_topspeed: bool,
    pub initial_bonus_mult_traction: f32,
    pub initial_bonus_add_traction: f32,
    pub initial_bonus_mult_turning: f32,
    pub initial_bonus_add_turning: f32,
    pub initial_bonus_mult_topspeed: f32,
    pub initial_bonus_add_topspeed: f32,
    pub traction_constant: f32,
    pub turning_constant: f32,
    pub topspeed_constant: f32,
    pub offroad_factor: f32,
    pub skid_factor: f32,
    pub brake_threshold: f32,
    pub crash_penalty: f32,
}

impl Default for TyreCompoundConfig {
    fn default() -> Self {
        TyreCompoundConfig {
            hardness_multiplier: 1.0,
            ideal_temp: 92.0,
            max_life_traction: 140.0,
            max_life_turning: 130.0,
            limiting_transfer_traction: 0.3,
            regular_transfer_traction: 0.1,
            limiting_transfer_turning: 0.3,
            regular_transfer_turning: 0.1,
            subtractive_traction: false,
            subtractive_turning: false,
            subtractive_topspeed: false,
            initial_bonus_mult_traction: 1.0,
            initial_bonus_add_traction: 0.0,
            initial_bonus_mult_turning: 1.0,
            initial_bonus_add_turning: 0.0,
            initial_bonus_mult_topspeed: 1.0,
            initial_bonus_add_topspeed: 0.0,
            traction_constant: 1.0,
            turning_constant: 1.0,
            topspeed_constant: 1.0,
            offroad_factor: 3.0,
            skid_factor: 2.5,
            brake_threshold: 0.6,
            crash_penalty: 5.0,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            server_name: "marshal server".to_string(),
            server_uid: "srv0".to_string(),
            public_address: String::new(),
            register_url: String::new(),
            password: String::new(),
            max_players: 12,
            max_players_in_game: 0,
            mode: GameMode::NormalRace,
            difficulty: Difficulty::Intermediate,
            min_start_game_players: 1,
            voting_timeout_secs: 30.0,
            world_load_timeout_secs: 25.0,
            result_ack_timeout_secs: 15.0,
            auto_start_timer_secs: 0.0,
            state_frequency: 10,
            kick_idle_lobby_player_seconds: 1200.0,
            kick_idle_player_seconds: 60.0,
            chat: true,
            chat_consecutive_interval: 8,
            reports_allowed: true,
            admins: vec![],
            official_karts_threshold: 0.0,
            official_tracks_threshold: 0.0,
            official_karts_play_threshold: 0.0,
            official_tracks_play_threshold: 0.0,
            addon_karts_join_threshold: 0,
            addon_tracks_join_threshold: 0,
            addon_arenas_join_threshold: 0,
            addon_soccers_join_threshold: 0,
            addon_karts_play_threshold: 0,
            addon_tracks_play_threshold: 0,
            addon_arenas_play_threshold: 0,
            addon_soccers_play_threshold: 0,
            must_have_maps: vec![],
            play_requirement_maps: vec![],
            official_karts: vec![],
            addon_karts: vec![],
            official_maps: vec![],
            addon_maps: vec![],
            addon_arenas: vec![],
            addon_soccers: vec![],
            ctf_maps: vec![],
            no_reverse_maps: vec![],
            map_vote_algorithm: 0,
            fixed_direction: String::new(),
            fixed_lap_count: 0,
            lap_multiplier: 0.0,
            item_policy: "normal".to_string(),
            blue_flag_line_guard: 0.05,
            gp_scoring: String::new(),
            gp_track_count: 0,
            tournament: String::new(),
            categories: vec![],
            onetime_map_queue: vec![],
            cyclic_map_queue: vec![],
            onetime_kart_queue: vec![],
            cyclic_kart_queue: vec![],
            database_file: "marshal.db".to_string(),
            store_results: true,
            fuel_capacity: 1000.0,
            fuel_regen: 1.0,
            fuel_stop_ratio: 0.0,
            fuel_weight: 0.0,
            fuel_rate: 1.0,
            tyre_queue: vec![],
            kart_mass: 350.0,
            tyre_compounds: vec![],
            tyre_response_curve_traction: vec![],
            tyre_response_curve_turning: vec![],
            tyre_response_curve_topspeed: vec![],
            tyre_heat_cycle_hardness_curve: vec![],
            tyre_hardness_penalty_curve: vec![],
        }
    }
}

impl ServerConfig {
    /// Read `marshal.toml` from the given config directory, or from the
    /// `MARSHAL_CONFIG` environment variable when no directory is given.
    pub fn load(config_dir: Option<&Path>) -> Result<ServerConfig> {
        let path = match config_dir {
            Some(dir) => dir.join(CONFIG_FILE_NAME),
            None => match std::env::var(CONFIG_ENV_VAR) {
                Ok(f) => PathBuf::from(f),
                Err(_) => bail!(
                    "cannot locate config: pass --config-dir or set the '{}' env var",
                    CONFIG_ENV_VAR
                ),
            },
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let cfg: ServerConfig = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    /// Distinguishes asset problems (exit code 2) from other invalid
    /// configuration (exit code 3).
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.max_players == 0 {
            return Err(ConfigError::Invalid(
                "max_players must be at least 1".to_string(),
            ));
        }
        if self.official_karts.is_empty() && self.addon_karts.is_empty() {
            return Err(ConfigError::Assets("server offers no karts".to_string()));
        }
        if self.official_maps.is_empty() && self.addon_maps.is_empty() {
            return Err(ConfigError::Assets("server offers no maps".to_string()));
        }
        if !(0.0..=0.45).contains(&self.blue_flag_line_guard) {
            return Err(ConfigError::Invalid(
                "blue_flag_line_guard must lie in [0, 0.45]".to_string(),
            ));
        }
        for (i, compound) in self.tyre_compounds.iter().enumerate() {
            if compound.max_life_traction <= 0.0 || compound.max_life_turning <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "tyre compound {} must have positive life on both axes",
                    i + 1
                )));
            }
        }
        if !self.tyre_compounds.is_empty()
            && self.tyre_queue.len() > self.tyre_compounds.len()
        {
            return Err(ConfigError::Invalid(
                "tyre_queue has more slots than configured compounds".to_string(),
            ));
        }
        Ok(())
    }

    pub fn fixed_direction(&self) -> Option<bool> {
        match self.fixed_direction.as_str() {
            "forward" => Some(false),
            "reverse" => Some(true),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("asset configuration error: {0}")]
    Assets(String),
    #[error("configuration error: {0}")]
    Invalid(String),
}

const CONFIG_ENV_VAR: &str = "MARSHAL_CONFIG";
const CONFIG_FILE_NAME: &str = "marshal.toml";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_without_assets_is_invalid() {
        assert!(ServerConfig::default().validate().is_err());
        assert!(crate::test_support::test_config().validate().is_ok());
    }

    #[test]
    fn direction_override_parses() {
        let mut cfg = crate::test_support::test_config();
        assert_eq!(cfg.fixed_direction(), None);
        cfg.fixed_direction = "reverse".to_string();
        assert_eq!(cfg.fixed_direction(), Some(true));
    }

    #[test]
    fn toml_round_trip() {
        let cfg = crate::test_support::test_config();
        let text = toml::to_string(&cfg).unwrap();
        let back: ServerConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.max_players, cfg.max_players);
        assert_eq!(back.official_maps, cfg.official_maps);
    }
}
