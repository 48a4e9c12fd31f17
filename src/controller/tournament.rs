use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::{RwLock, RwLockReadGuard};

use async_trait::async_trait;

use kartnet::KartTeam;

/// Per-match rule triple.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GameRules {
    /// `G`: goal limit; `T`: time limit.
    pub goal_limit: bool,
    /// `B`: red and blue swap colours for this match.
    pub colors_swapped: bool,
    /// `+`: everyone votes; `F`: only the first team; `S`: only the
    /// second team.
    pub votability: Votability,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Votability {
    Everyone,
    FirstTeam,
    SecondTeam,
}

#[derive(Default)]
pub struct TournamentState {
    pub red_players: HashSet<String>,
    pub blue_players: HashSet<String>,
    pub referees: HashSet<String>,
    /// Startup rosters, restored on tournament reset.
    init_red: HashSet<String>,
    init_blue: HashSet<String>,
    init_referees: HashSet<String>,
    /// Players silenced across every chat channel by a referee.
    pub mutealls: HashSet<String>,
    pub games: Vec<GameRules>,
    pub current_game: usize,
    /// Arena per finished match, filled as matches complete.
    pub arena_history: Vec<Option<String>>,
}

/// Use to consult tournament rules.
#[async_trait]
pub trait LiveTournament: Send + Sync {
    /// While holding this guard, the state is read-only, and can be
    /// referenced.
    async fn lock(&self) -> RwLockReadGuard<'_, TournamentState>;

    async fn can_play(&self, username: &str) -> bool {
        let state = self.lock().await;
        state.red_players.contains(username) || state.blue_players.contains(username)
    }

    async fn is_referee(&self, username: &str) -> bool {
        self.lock().await.referees.contains(username)
    }

    async fn referees(&self) -> HashSet<String> {
        self.lock().await.referees.clone()
    }

    async fn is_mutedall(&self, username: &str) -> bool {
        self.lock().await.mutealls.contains(username)
    }
}

/// Soccer-tournament overlay: fixed rosters, per-match rule triples,
/// referee powers, and vote/team restrictions.
#[derive(Clone)]
pub struct TournamentController {
    state: Arc<RwLock<TournamentState>>,
}

impl TournamentController {
    /// Parses a rules string like
    /// `"red=alice,bob blue=carol,dave refs=eve games=GR+,TB+,GRF"`.
    pub fn parse(input: &str) -> Result<TournamentController> {
        let mut red = HashSet::new();
        let mut blue = HashSet::new();
        let mut referees = HashSet::new();
        let mut games = Vec::new();

        for token in input.split_whitespace() {
            let (key, value) = match token.split_once('=') {
                Some(pair) => pair,
                None => bail!("malformed tournament token {:?}", token),
            };
            let names = || {
                value
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect::<HashSet<_>>()
            };
            match key {
                "red" => red = names(),
                "blue" => blue = names(),
                "refs" => referees = names(),
                "games" => {
                    for triple in value.split(',') {
                        let chars: Vec<char> = triple.chars().collect();
                        if chars.len() != 3 {
                            bail!("game rules triple {:?} must have 3 characters", triple);
                        }
                        games.push(GameRules {
                            goal_limit: match chars[0] {
                                'G' => true,
                                'T' => false,
                                c => bail!("unknown limit type {:?}", c),
                            },
                            colors_swapped: match chars[1] {
                                'B' => true,
                                'R' => false,
                                c => bail!("unknown colour swap flag {:?}", c),
                            },
                            votability: match chars[2] {
                                '+' => Votability::Everyone,
                                'F' => Votability::FirstTeam,
                                'S' => Votability::SecondTeam,
                                c => bail!("unknown votability flag {:?}", c),
                            },
                        });
                    }
                }
                other => bail!("unknown tournament key {:?}", other),
            }
        }

        if games.is_empty() {
            bail!("tournament needs at least one game");
        }

        let arena_history = vec![None; games.len()];
        Ok(TournamentController {
            state: Arc::new(RwLock::new(TournamentState {
                init_red: red.clone(),
                init_blue: blue.clone(),
                init_referees: referees.clone(),
                red_players: red,
                blue_players: blue,
                referees,
                mutealls: HashSet::new(),
                games,
                current_game: 0,
                arena_history,
            })),
        })
    }

    /// The team a roster player maps to in the current match, honouring
    /// the colour swap.
    pub async fn team_of(&self, username: &str) -> KartTeam {
        let state = self.state.read().await;
        let swapped = state
            .games
            .get(state.current_game)
            .map(|g| g.colors_swapped)
            .unwrap_or(false);
        let (red_team, blue_team) = if swapped {
            (KartTeam::Blue, KartTeam::Red)
        } else {
            (KartTeam::Red, KartTeam::Blue)
        };
        if state.red_players.contains(username) {
            red_team
        } else if state.blue_players.contains(username) {
            blue_team
        } else {
            KartTeam::None
        }
    }

    /// Whether the player may vote in the current match.
    pub async fn can_vote(&self, username: &str) -> bool {
        let state = self.state.read().await;
        let votability = state
            .games
            .get(state.current_game)
            .map(|g| g.votability)
            .unwrap_or(Votability::Everyone);
        match votability {
            Votability::Everyone => {
                state.red_players.contains(username) || state.blue_players.contains(username)
            }
            Votability::FirstTeam => state.red_players.contains(username),
            Votability::SecondTeam => state.blue_players.contains(username),
        }
    }

    /// Tournaments pin teams; peers cannot change them.
    pub fn can_change_team(&self) -> bool {
        false
    }

    /// Starting a match is driven by the referees, not the crown.
    pub fn forbids_starting(&self) -> bool {
        true
    }

    pub async fn current_game_rules(&self) -> Option<GameRules> {
        let state = self.state.read().await;
        state.games.get(state.current_game).copied()
    }

    /// A referee override of a roster assignment.
    pub async fn set_team(&self, username: &str, team: KartTeam) {
        let mut state = self.state.write().await;
        state.red_players.remove(username);
        state.blue_players.remove(username);
        match team {
            KartTeam::Red => {
                state.red_players.insert(username.to_string());
            }
            KartTeam::Blue => {
                state.blue_players.insert(username.to_string());
            }
            KartTeam::None => {}
        }
    }

    /// Toggles the cross-channel mute on a player; returns whether the
    /// player is muted afterwards.
    pub async fn toggle_muteall(&self, username: &str) -> bool {
        let mut state = self.state.write().await;
        if state.mutealls.remove(username) {
            false
        } else {
            state.mutealls.insert(username.to_string());
            true
        }
    }

    /// Records the played arena and advances to the next match.
    pub async fn on_race_finished(&self, arena: &str) {
        let mut state = self.state.write().await;
        let game = state.current_game;
        if let Some(slot) = state.arena_history.get_mut(game) {
            *slot = Some(arena.to_string());
        }
        state.current_game += 1;
    }

    pub async fn is_over(&self) -> bool {
        let state = self.state.read().await;
        state.current_game >= state.games.len()
    }

    /// Restores the startup rosters and restarts the match sequence.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        state.red_players = state.init_red.clone();
        state.blue_players = state.init_blue.clone();
        state.referees = state.init_referees.clone();
        state.mutealls.clear();
        state.current_game = 0;
        let games = state.games.len();
        state.arena_history = vec![None; games];
    }
}

#[async_trait]
impl LiveTournament for TournamentController {
    async fn lock(&self) -> RwLockReadGuard<'_, TournamentState> {
        self.state.read().await
    }
}
