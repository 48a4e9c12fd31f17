use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard};

use async_trait::async_trait;

use kartnet::{GameMode, KartTeam};

use crate::controller::session::SessionsState;

/// Use to look up categories and team balance.
#[async_trait]
pub trait LiveTeams: Send + Sync {
    /// While holding this guard, the state is read-only, and can be
    /// referenced.
    async fn lock(&self) -> RwLockReadGuard<'_, TeamsState>;

    async fn members_of(&self, category: &str) -> HashSet<String> {
        self.lock()
            .await
            .categories
            .get(category)
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Default)]
pub struct TeamsState {
    /// Named player categories; scripted ones load at startup and can
    /// be edited at runtime.
    pub categories: HashMap<String, HashSet<String>>,
}

#[derive(Clone)]
pub struct TeamController {
    state: Arc<RwLock<TeamsState>>,
}

impl TeamController {
    /// `definitions` are config lines of the form `"name: alice bob"`.
    pub fn init(definitions: &[String]) -> Self {
        let mut categories: HashMap<String, HashSet<String>> = HashMap::new();
        for line in definitions {
            let (name, members) = match line.split_once(':') {
                Some(pair) => pair,
                None => {
                    log::warn!("ignoring malformed category definition {:?}", line);
                    continue;
                }
            };
            categories.insert(
                name.trim().to_string(),
                members.split_whitespace().map(|s| s.to_string()).collect(),
            );
        }
        TeamController {
            state: Arc::new(RwLock::new(TeamsState { categories })),
        }
    }

    pub async fn add_to_category(&self, category: &str, player: &str) {
        self.state
            .write()
            .await
            .categories
            .entry(category.to_string())
            .or_default()
            .insert(player.to_string());
    }

    pub async fn remove_from_category(&self, category: &str, player: &str) -> bool {
        let mut state = self.state.write().await;
        match state.categories.get_mut(category) {
            Some(members) => members.remove(player),
            None => false,
        }
    }

    pub async fn categories_of(&self, player: &str) -> Vec<String> {
        let state = self.state.read().await;
        let mut names: Vec<String> = state
            .categories
            .iter()
            .filter(|(_, members)| members.contains(player))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Sets the red/blue/none team of one profile.
    pub fn set_kart_team(
        sessions: &mut SessionsState,
        host_id: u32,
        local_player_id: u8,
        team: KartTeam,
    ) -> bool {
        let handle = match sessions.handle_of(host_id) {
            Some(h) => h,
            None => return false,
        };
        let session = match sessions.session_mut(handle) {
            Some(s) => s,
            None => return false,
        };
        match session
            .profiles
            .iter_mut()
            .find(|p| p.local_player_id == local_player_id)
        {
            Some(profile) => {
                profile.kart_team = team;
                true
            }
            None => false,
        }
    }

    /// Cycles a profile to the next team, the client-side meaning of a
    /// `ChangeTeam` request.
    pub fn cycle_kart_team(
        sessions: &mut SessionsState,
        host_id: u32,
        local_player_id: u8,
    ) -> Option<KartTeam> {
        let handle = sessions.handle_of(host_id)?;
        let session = sessions.session_mut(handle)?;
        let profile = session
            .profiles
            .iter_mut()
            .find(|p| p.local_player_id == local_player_id)?;
        profile.kart_team = match profile.kart_team {
            KartTeam::None => KartTeam::Red,
            KartTeam::Red => KartTeam::Blue,
            KartTeam::Blue => KartTeam::Red,
        };
        Some(profile.kart_team)
    }

    /// Sets the arbitrary indexed team of one profile.
    pub fn set_temp_team(
        sessions: &mut SessionsState,
        host_id: u32,
        local_player_id: u8,
        team: Option<u8>,
    ) -> bool {
        let handle = match sessions.handle_of(host_id) {
            Some(h) => h,
            None => return false,
        };
        match sessions.session_mut(handle).and_then(|s| {
            s.profiles
                .iter_mut()
                .find(|p| p.local_player_id == local_player_id)
        }) {
            Some(profile) => {
                profile.temp_team = team;
                true
            }
            None => false,
        }
    }

    /// All teams the peer's profiles are on.
    pub fn teams_of_peer(sessions: &SessionsState, host_id: u32) -> HashSet<KartTeam> {
        sessions
            .by_host_id(host_id)
            .map(|s| s.profiles.iter().map(|p| p.kart_team).collect())
            .unwrap_or_default()
    }

    /// Red and blue player counts among peers that would race.
    pub fn team_counts(sessions: &SessionsState) -> (usize, usize) {
        let mut red = 0;
        let mut blue = 0;
        for session in sessions.validated() {
            if !session.can_be_assigned() {
                continue;
            }
            for profile in &session.profiles {
                match profile.kart_team {
                    KartTeam::Red => red += 1,
                    KartTeam::Blue => blue += 1,
                    KartTeam::None => {}
                }
            }
        }
        (red, blue)
    }

    /// A team game must not start with an empty side.
    pub fn teams_balanced_for(sessions: &SessionsState, mode: GameMode) -> bool {
        if !mode.has_teams() {
            return true;
        }
        let (red, blue) = Self::team_counts(sessions);
        red > 0 && blue > 0
    }
}

#[async_trait]
impl LiveTeams for TeamController {
    async fn lock(&self) -> RwLockReadGuard<'_, TeamsState> {
        self.state.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::assets::AssetManager;
    use crate::controller::session::SessionsState;
    use crate::test_support::{named_peer, test_config};

    fn sessions_with(n: u32) -> SessionsState {
        let assets = AssetManager::init(&test_config());
        let mut state = SessionsState::new(1);
        for i in 0..n {
            state.insert_session(named_peer(i as u64, i + 1, &format!("p{}", i + 1), &assets));
        }
        state
    }

    #[tokio::test]
    async fn scripted_categories_load_and_edit() {
        let teams = TeamController::init(&[
            "pro: alice bob".to_string(),
            "casual: carol".to_string(),
            "broken-line".to_string(),
        ]);
        assert_eq!(teams.members_of("pro").await.len(), 2);
        assert!(teams.members_of("nope").await.is_empty());

        teams.add_to_category("pro", "dave").await;
        assert!(teams.members_of("pro").await.contains("dave"));
        assert!(teams.remove_from_category("pro", "alice").await);
        assert!(!teams.remove_from_category("pro", "alice").await);
        assert_eq!(teams.categories_of("carol").await, vec!["casual".to_string()]);
    }

    #[test]
    fn team_cycling_skips_none_after_first_change() {
        let mut sessions = sessions_with(1);
        assert_eq!(
            TeamController::cycle_kart_team(&mut sessions, 1, 0),
            Some(KartTeam::Red)
        );
        assert_eq!(
            TeamController::cycle_kart_team(&mut sessions, 1, 0),
            Some(KartTeam::Blue)
        );
        assert_eq!(
            TeamController::cycle_kart_team(&mut sessions, 1, 0),
            Some(KartTeam::Red)
        );
    }

    #[test]
    fn balance_check_for_team_modes() {
        let mut sessions = sessions_with(2);
        assert!(TeamController::teams_balanced_for(&sessions, GameMode::NormalRace));
        assert!(!TeamController::teams_balanced_for(&sessions, GameMode::Soccer));

        TeamController::set_kart_team(&mut sessions, 1, 0, KartTeam::Red);
        assert!(!TeamController::teams_balanced_for(&sessions, GameMode::Soccer));
        TeamController::set_kart_team(&mut sessions, 2, 0, KartTeam::Blue);
        assert!(TeamController::teams_balanced_for(&sessions, GameMode::Soccer));
        assert_eq!(TeamController::team_counts(&sessions), (1, 1));
    }
}
