use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use kartnet::KartTeam;

use crate::config::ServerConfig;
use crate::controller::session::SessionsState;
use crate::controller::team::TeamController;
use crate::server::PeerHandle;

/// What to do with an incoming chat message.
#[derive(Debug, PartialEq, Eq)]
pub enum ChatOutcome {
    /// Forward to exactly these peers.
    Deliver { recipients: Vec<PeerHandle> },
    /// Drop, telling only the sender why.
    Reject { notice: &'static str },
    /// Drop silently (chat disabled, unvalidated sender).
    Ignore,
}

#[derive(Default)]
struct ChatState {
    /// Names each peer refuses to hear, keyed by host id.
    muted_players: HashMap<u32, HashSet<String>>,
    /// Private-chat whitelists; an empty or absent set means public.
    message_receivers: HashMap<u32, HashSet<String>>,
    /// Peers currently speaking to their team only.
    team_speakers: HashSet<u32>,
}

/// Routes chat with mute lists, team-only speaking, private recipient
/// sets, an anti-spam window and an anti-impersonation check.
#[derive(Clone)]
pub struct ChatController {
    state: Arc<RwLock<ChatState>>,
    chat_enabled: bool,
    consecutive_interval: u32,
}

impl ChatController {
    pub fn init(config: &ServerConfig) -> Self {
        ChatController {
            state: Arc::new(RwLock::new(ChatState::default())),
            chat_enabled: config.chat,
            consecutive_interval: config.chat_consecutive_interval,
        }
    }

    pub async fn add_muted_player_for(&self, host_id: u32, name: &str) {
        self.state
            .write()
            .await
            .muted_players
            .entry(host_id)
            .or_default()
            .insert(name.to_string());
    }

    pub async fn remove_muted_player_for(&self, host_id: u32, name: &str) -> bool {
        match self.state.write().await.muted_players.get_mut(&host_id) {
            Some(muted) => muted.remove(name),
            None => false,
        }
    }

    pub async fn is_muting(&self, host_id: u32, name: &str) -> bool {
        self.state
            .read()
            .await
            .muted_players
            .get(&host_id)
            .map(|m| m.contains(name))
            .unwrap_or(false)
    }

    /// Everyone the given peer refuses to hear.
    pub async fn muted_players_of(&self, host_id: u32) -> HashSet<String> {
        self.state
            .read()
            .await
            .muted_players
            .get(&host_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Replaces the private-chat whitelist of a peer.
    pub async fn set_message_receivers_for(&self, host_id: u32, receivers: &[String]) {
        let mut state = self.state.write().await;
        let set = state.message_receivers.entry(host_id).or_default();
        set.clear();
        set.extend(receivers.iter().cloned());
    }

    pub async fn add_team_speaker(&self, host_id: u32) {
        self.state.write().await.team_speakers.insert(host_id);
    }

    /// Clears both the whitelist and the team-only flag.
    pub async fn make_chat_public_for(&self, host_id: u32) {
        let mut state = self.state.write().await;
        state.message_receivers.remove(&host_id);
        state.team_speakers.remove(&host_id);
    }

    pub async fn on_peer_disconnect(&self, host_id: u32) {
        let mut state = self.state.write().await;
        state.muted_players.remove(&host_id);
        state.message_receivers.remove(&host_id);
        state.team_speakers.remove(&host_id);
    }

    /// Validates and routes one message. Mutates the sender's activity
    /// and spam counters. `team_seers` are names (referees) that read
    /// team chat regardless of their own team.
    pub async fn handle_message(
        &self,
        sessions: &mut SessionsState,
        sender: PeerHandle,
        message: &str,
        target_team: Option<KartTeam>,
        game_started: bool,
        team_seers: &HashSet<String>,
    ) -> ChatOutcome {
        if !self.chat_enabled {
            return ChatOutcome::Ignore;
        }

        let (sender_host_id, sender_name, sender_waiting) = {
            let session = match sessions.session_mut(sender) {
                Some(s) if s.validated => s,
                _ => return ChatOutcome::Ignore,
            };
            session.update_last_activity();

            // Anti-spam: consecutive messages inside the window add up;
            // past half the interval (in seconds) the message is dropped.
            let interval = self.consecutive_interval;
            if interval > 0 {
                let now = Instant::now();
                let too_fast = session
                    .last_chat
                    .map(|last| now.duration_since(last).as_secs_f32() < interval as f32)
                    .unwrap_or(false);
                if too_fast {
                    session.consecutive_messages += 1;
                } else {
                    session.consecutive_messages = 0;
                }
                session.last_chat = Some(now);
                if session.consecutive_messages > interval / 2 {
                    session.chat_offences += 1;
                    return ChatOutcome::Reject {
                        notice: "Spam detected",
                    };
                }
            }

            (
                session.host_id,
                session.main_name(),
                session.waiting_for_game,
            )
        };

        // Anti-impersonation: the text must open with the sender's own
        // main profile name.
        let prefix = format!("{}: ", sender_name);
        if !message.starts_with(&prefix) {
            if let Some(session) = sessions.session_mut(sender) {
                session.chat_offences += 1;
            }
            return ChatOutcome::Reject {
                notice: "Don't send messages in the name of others",
            };
        }

        let state = self.state.read().await;
        let team_only = target_team.is_some() || state.team_speakers.contains(&sender_host_id);
        let sender_teams = TeamController::teams_of_peer(sessions, sender_host_id);
        let receivers = state
            .message_receivers
            .get(&sender_host_id)
            .filter(|set| !set.is_empty());

        let recipients = sessions
            .validated()
            .filter(|target| {
                // No chat bridges between the lobby and a running match.
                if game_started && target.waiting_for_game != sender_waiting {
                    return false;
                }
                let target_mutes = state
                    .muted_players
                    .get(&target.host_id)
                    .map(|m| m.contains(&sender_name))
                    .unwrap_or(false);
                if target_mutes {
                    return false;
                }
                let is_seer = target
                    .profiles
                    .iter()
                    .any(|p| team_seers.contains(p.name.as_str()));
                if team_only && target.host_id != sender_host_id {
                    let shares_team = match target_team {
                        Some(team) => target.profiles.iter().any(|p| p.kart_team == team),
                        None => target
                            .profiles
                            .iter()
                            .any(|p| p.kart_team != KartTeam::None && sender_teams.contains(&p.kart_team)),
                    };
                    if !shares_team && !is_seer {
                        return false;
                    }
                }
                if let Some(receivers) = receivers {
                    if target.host_id != sender_host_id {
                        let listed = target
                            .profiles
                            .iter()
                            .any(|p| receivers.contains(p.name.as_str()));
                        if !listed {
                            return false;
                        }
                    }
                }
                true
            })
            .map(|target| target.handle)
            .collect();

        ChatOutcome::Deliver { recipients }
    }
}
