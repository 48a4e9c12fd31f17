use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard};

use async_trait::async_trait;

use kartnet::GameMode;

use crate::config::{ServerConfig, CTF_PLAYER_CAP, FFA_PLAYER_CAP, SOCCER_PLAYER_CAP};
use crate::controller::assets::{AssetManager, HourglassReason};
use crate::controller::session::{PeerSession, SessionsState, SpectateMode};

/// Use to look up who may race and who holds the crown.
#[async_trait]
pub trait LiveCrown: Send + Sync {
    /// While holding this guard, the state is read-only, and can be
    /// referenced.
    async fn lock(&self) -> RwLockReadGuard<'_, CrownState>;

    async fn is_spectator_by_limit(&self, host_id: u32) -> bool {
        self.lock().await.spectators_by_limit.contains(&host_id)
    }

    async fn reason_for(&self, host_id: u32) -> HourglassReason {
        self.lock()
            .await
            .why_peer_cannot_play
            .get(&host_id)
            .copied()
            .unwrap_or(HourglassReason::None)
    }
}

#[derive(Default)]
pub struct CrownState {
    /// Peers excluded from the next match by the player limit, keyed
    /// by host id.
    pub spectators_by_limit: HashSet<u32>,
    /// Cached per-peer hourglass reasons, recomputed with the limit.
    pub why_peer_cannot_play: HashMap<u32, HourglassReason>,
}

#[derive(Clone)]
pub struct CrownController {
    state: Arc<RwLock<CrownState>>,
    assets: Arc<AssetManager>,
    max_players: usize,
    max_players_in_game: usize,
}

/// Ordering used both for filling player slots and for the crown:
/// slot-booked peers first, then by ascending rejoin order.
fn default_order(a: &PeerSession, b: &PeerSession) -> std::cmp::Ordering {
    b.slot_booked
        .cmp(&a.slot_booked)
        .then(a.rejoin_seq.cmp(&b.rejoin_seq))
}

/// Crown ordering additionally pushes command spectators behind
/// everyone else.
fn crown_order(a: &PeerSession, b: &PeerSession) -> std::cmp::Ordering {
    let a_cmd = a.spectate_mode == SpectateMode::Command;
    let b_cmd = b.spectate_mode == SpectateMode::Command;
    a_cmd.cmp(&b_cmd).then_with(|| default_order(a, b))
}

impl CrownController {
    pub fn init(config: &ServerConfig, assets: &Arc<AssetManager>) -> Self {
        CrownController {
            state: Arc::new(RwLock::new(CrownState::default())),
            assets: assets.clone(),
            max_players: config.max_players,
            max_players_in_game: config.max_players_in_game,
        }
    }

    /// The player limit for the given mode.
    pub fn player_limit(&self, mode: GameMode) -> usize {
        let mut limit = self.max_players;
        if self.max_players_in_game > 0 {
            limit = limit.min(self.max_players_in_game);
        }
        match mode {
            GameMode::FreeForAll => limit.min(FFA_PLAYER_CAP),
            GameMode::CaptureTheFlag => limit.min(CTF_PLAYER_CAP),
            GameMode::Soccer => limit.min(SOCCER_PLAYER_CAP),
            _ => limit,
        }
    }

    /// Recomputes the spectators-by-limit set and every peer's
    /// hourglass reason. `tournament_can_play` is the overlay's verdict
    /// per main-profile name (always true without a tournament).
    pub async fn update(
        &self,
        sessions: &SessionsState,
        mode: GameMode,
        tournament_can_play: impl Fn(&str) -> bool,
    ) {
        let mut state = self.state.write().await;
        state.spectators_by_limit.clear();
        state.why_peer_cannot_play.clear();

        let limit = self.player_limit(mode);

        let mut peers: Vec<&PeerSession> = sessions
            .iter()
            .filter(|p| p.validated && !p.is_ai)
            .collect();
        peers.sort_by(|a, b| default_order(a, b));

        let mut player_count = 0usize;
        for peer in peers {
            if peer.spectate_mode == SpectateMode::Command || peer.waiting_for_game {
                continue;
            }

            let reason = if peer.profiles.is_empty() {
                HourglassReason::AbsentPeer
            } else if !tournament_can_play(&peer.main_name()) {
                HourglassReason::NotATournamentPlayer
            } else {
                self.assets.check_can_play(peer)
            };

            if reason != HourglassReason::None {
                state.why_peer_cannot_play.insert(peer.host_id, reason);
                continue;
            }

            player_count += peer.profiles.len();
            if player_count > limit {
                state.spectators_by_limit.insert(peer.host_id);
                state
                    .why_peer_cannot_play
                    .insert(peer.host_id, HourglassReason::SpectatorByLimit);
            }
        }
    }

    /// The crown holder: first peer in crown order, or `None` on an
    /// empty lobby. The crown passes freely when its holder leaves.
    pub fn crown_holder(&self, sessions: &SessionsState) -> Option<u32> {
        sessions
            .iter()
            .filter(|p| p.validated && !p.is_ai)
            .min_by(|a, b| crown_order(a, b))
            .map(|p| p.host_id)
    }

    /// Peers that will race the next match, in slot order.
    pub async fn playing_peers(&self, sessions: &SessionsState) -> Vec<u32> {
        let state = self.state.read().await;
        let mut peers: Vec<&PeerSession> = sessions
            .iter()
            .filter(|p| {
                p.can_be_assigned()
                    && !p.is_ai
                    && !state.spectators_by_limit.contains(&p.host_id)
                    && !state.why_peer_cannot_play.contains_key(&p.host_id)
            })
            .collect();
        peers.sort_by(|a, b| default_order(a, b));
        peers.into_iter().map(|p| p.host_id).collect()
    }
}

#[async_trait]
impl LiveCrown for CrownController {
    async fn lock(&self) -> RwLockReadGuard<'_, CrownState> {
        self.state.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::session::{LiveSessions, SessionController};
    use crate::test_support::{named_peer, test_config};

    async fn setup(
        peer_count: u32,
        config: ServerConfig,
    ) -> (SessionController, CrownController, Arc<AssetManager>) {
        let assets = Arc::new(AssetManager::init(&config));
        let sessions = SessionController::init(1);
        for i in 0..peer_count {
            let peer = named_peer(i as u64, i + 1, &format!("p{}", i + 1), &assets);
            sessions.write().await.insert_session(peer);
        }
        let crown = CrownController::init(&config, &assets);
        (sessions, crown, assets)
    }

    #[tokio::test]
    async fn crown_goes_to_earliest_joiner() {
        let (sessions, crown, _) = setup(3, test_config()).await;
        let state = sessions.lock().await;
        assert_eq!(crown.crown_holder(&state), Some(1));
    }

    #[tokio::test]
    async fn command_spectator_does_not_hold_the_crown() {
        let (sessions, crown, _) = setup(3, test_config()).await;
        {
            let mut state = sessions.write().await;
            let handle = state.handle_of(1).unwrap();
            state.session_mut(handle).unwrap().spectate_mode = SpectateMode::Command;
        }
        let state = sessions.lock().await;
        assert_eq!(crown.crown_holder(&state), Some(2));
    }

    #[tokio::test]
    async fn slot_booked_peers_come_first() {
        let (sessions, crown, _) = setup(3, test_config()).await;
        {
            let mut state = sessions.write().await;
            let handle = state.handle_of(3).unwrap();
            state.session_mut(handle).unwrap().slot_booked = true;
        }
        let state = sessions.lock().await;
        assert_eq!(crown.crown_holder(&state), Some(3));
    }

    #[tokio::test]
    async fn player_limit_fills_in_deterministic_order() {
        let mut config = test_config();
        config.max_players = 2;
        let (sessions, crown, _) = setup(4, config).await;
        let state = sessions.lock().await;
        crown.update(&state, GameMode::NormalRace, |_| true).await;

        assert!(crown.is_spectator_by_limit(3).await);
        assert!(crown.is_spectator_by_limit(4).await);
        assert_eq!(
            crown.reason_for(3).await,
            HourglassReason::SpectatorByLimit
        );
        assert_eq!(crown.playing_peers(&state).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn mode_caps_apply_on_top_of_server_limit() {
        let config = test_config();
        let (_, crown, _) = setup(0, config).await;
        assert_eq!(crown.player_limit(GameMode::NormalRace), 12);
        assert_eq!(crown.player_limit(GameMode::FreeForAll), 10);
        assert_eq!(crown.player_limit(GameMode::Soccer), 12.min(SOCCER_PLAYER_CAP));
    }

    #[tokio::test]
    async fn tournament_verdict_blocks_playing() {
        let (sessions, crown, _) = setup(2, test_config()).await;
        let state = sessions.lock().await;
        crown
            .update(&state, GameMode::NormalRace, |name| name != "p2")
            .await;
        assert_eq!(
            crown.reason_for(2).await,
            HourglassReason::NotATournamentPlayer
        );
        assert_eq!(crown.playing_peers(&state).await, vec![1]);
    }
}
