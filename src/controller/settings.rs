use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard};

use async_trait::async_trait;

use kartnet::lobby::PeerVote;
use kartnet::{Difficulty, GameMode};

use crate::config::ServerConfig;
use crate::controller::assets::AssetManager;

/// Bounds on soccer goal targets.
const SOCCER_GOALS_MIN: u8 = 1;
const SOCCER_GOALS_MAX: u8 = 10;

/// Floors and ceilings for lap counts in linear races.
const LAPS_MIN: u8 = 1;
const LAPS_MAX: u8 = 60;

/// The runtime-adjustable lobby settings: the live mode and difficulty
/// (admins may change them between matches) and the restriction layer
/// that coerces winning votes into what the server actually allows.
pub struct SettingsState {
    pub mode: GameMode,
    pub difficulty: Difficulty,
    fixed_direction: Option<bool>,
    fixed_lap_count: u8,
    lap_multiplier: f32,
    /// Admin toggle; start-selection is refused while false.
    pub allowed_to_start: bool,
}

impl SettingsState {
    pub fn init(config: &ServerConfig) -> Self {
        SettingsState {
            mode: config.mode,
            difficulty: config.difficulty,
            fixed_direction: config.fixed_direction(),
            fixed_lap_count: config.fixed_lap_count,
            lap_multiplier: config.lap_multiplier,
            allowed_to_start: true,
        }
    }

    /// Applies every override and clamp to a vote, in place.
    pub fn coerce_vote(&self, vote: &mut PeerVote, assets: &AssetManager) {
        if let Some(reverse) = self.fixed_direction {
            vote.reverse = reverse;
        }
        if !assets.supports_reverse(&vote.track_name) {
            vote.reverse = false;
        }

        if self.fixed_lap_count > 0 {
            vote.num_laps = self.fixed_lap_count;
        } else if self.lap_multiplier > 0.0 {
            vote.num_laps = ((vote.num_laps as f32 * self.lap_multiplier).round() as u8).max(1);
        }

        match self.mode {
            GameMode::Soccer => {
                vote.num_laps = vote.num_laps.clamp(SOCCER_GOALS_MIN, SOCCER_GOALS_MAX);
            }
            GameMode::NormalRace | GameMode::TimeTrial => {
                vote.num_laps = vote.num_laps.clamp(LAPS_MIN, LAPS_MAX);
            }
            // Battle modes run on time or hit limits, not laps.
            GameMode::FreeForAll | GameMode::CaptureTheFlag => vote.num_laps = 0,
        }
    }

    /// Mode-defaulted parameters when nobody voted.
    pub fn default_vote_for(&self, track: &str, assets: &AssetManager) -> PeerVote {
        let mut vote = PeerVote {
            player_name: Default::default(),
            track_name: track.to_string(),
            num_laps: match self.mode {
                GameMode::Soccer => 3,
                GameMode::NormalRace | GameMode::TimeTrial => 3,
                _ => 0,
            },
            reverse: false,
        };
        self.coerce_vote(&mut vote, assets);
        vote
    }
}

/// Use to read the live settings.
#[async_trait]
pub trait LiveSettings: Send + Sync {
    /// While holding this guard, the state is read-only, and can be
    /// referenced.
    async fn lock(&self) -> RwLockReadGuard<'_, SettingsState>;

    async fn mode(&self) -> GameMode {
        self.lock().await.mode
    }

    async fn difficulty(&self) -> Difficulty {
        self.lock().await.difficulty
    }

    async fn allowed_to_start(&self) -> bool {
        self.lock().await.allowed_to_start
    }
}

#[derive(Clone)]
pub struct SettingsController {
    state: Arc<RwLock<SettingsState>>,
}

impl SettingsController {
    pub fn init(config: &ServerConfig) -> Self {
        SettingsController {
            state: Arc::new(RwLock::new(SettingsState::init(config))),
        }
    }

    pub async fn coerce_vote(&self, vote: &mut PeerVote, assets: &AssetManager) {
        self.state.read().await.coerce_vote(vote, assets);
    }

    pub async fn default_vote_for(&self, track: &str, assets: &AssetManager) -> PeerVote {
        self.state.read().await.default_vote_for(track, assets)
    }

    /// Mode and difficulty never change while a match is live; the
    /// caller checks the lobby is idle first.
    pub async fn set_mode(&self, mode: GameMode) {
        self.state.write().await.mode = mode;
    }

    pub async fn set_difficulty(&self, difficulty: Difficulty) {
        self.state.write().await.difficulty = difficulty;
    }

    pub async fn set_allowed_to_start(&self, allowed: bool) {
        self.state.write().await.allowed_to_start = allowed;
    }
}

#[async_trait]
impl LiveSettings for SettingsController {
    async fn lock(&self) -> RwLockReadGuard<'_, SettingsState> {
        self.state.read().await
    }
}
