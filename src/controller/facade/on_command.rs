use kartnet::lobby::Chat;
use kartnet::{BackLobbyReason, ChatStr};

use crate::command::{LobbyCommand, PermissionLevel, COMMAND_REFERENCE};
use crate::config::VERSION;
use crate::controller::facade::{Controller, PlayState};
use crate::controller::session::{LiveSessions, SpectateMode};
use crate::controller::settings::LiveSettings;
use crate::controller::tournament::LiveTournament;
use crate::database::BanTarget;
use crate::server::PeerHandle;
use crate::task::AsyncTask;

impl Controller {
    /// Executes a `/command` typed in chat, after checking the sender's
    /// permission level against the command's requirement.
    pub(super) async fn on_command(&self, handle: PeerHandle, text: &str) {
        let (host_id, sender_name) = {
            let sessions = self.sessions.lock().await;
            match sessions.session(handle) {
                Some(s) if s.validated => (s.host_id, s.main_name()),
                _ => return,
            }
        };

        let command = match LobbyCommand::parse(text) {
            Some(command) => command,
            None => {
                self.tell(handle, COMMAND_REFERENCE).await;
                return;
            }
        };

        let level = self.permission_level_of(host_id, &sender_name).await;
        if command.required_permission() > level {
            log::info!(
                "host {} lacks permission for {:?} ({:?} < {:?})",
                host_id,
                command,
                level,
                command.required_permission()
            );
            self.tell(handle, "You are not allowed to run this command").await;
            return;
        }

        use LobbyCommand::*;
        match command {
            Help => self.tell(handle, COMMAND_REFERENCE).await,

            Info => {
                let settings = self.settings.lock().await;
                let info = format!(
                    "{} v{} | mode {:?} | difficulty {:?} | {} player(s) of {}",
                    self.config.server_name,
                    *VERSION,
                    settings.mode,
                    settings.difficulty,
                    self.sessions.lock().await.player_count(),
                    self.config.max_players,
                );
                drop(settings);
                self.tell(handle, &info).await;
            }

            Mute { name } => {
                if name == sender_name {
                    self.tell(handle, "You cannot mute yourself").await;
                    return;
                }
                self.chat.add_muted_player_for(host_id, &name).await;
                self.tell(handle, &format!("You no longer hear {}", name)).await;
            }

            Unmute { name } => {
                if self.chat.remove_muted_player_for(host_id, &name).await {
                    self.tell(handle, &format!("You hear {} again", name)).await;
                } else {
                    self.tell(handle, &format!("{} was not muted", name)).await;
                }
            }

            MuteList => {
                let muted = self.chat.muted_players_of(host_id).await;
                let text = if muted.is_empty() {
                    "No player has been muted by you".to_string()
                } else {
                    let mut names: Vec<String> = muted.into_iter().collect();
                    names.sort();
                    format!("Muted: {}", names.join(", "))
                };
                self.tell(handle, &text).await;
            }

            To { names } => {
                self.chat.set_message_receivers_for(host_id, &names).await;
                self.tell(handle, &format!("Talking to: {}", names.join(", "))).await;
            }

            Public => {
                self.chat.make_chat_public_for(host_id).await;
                self.tell(handle, "Talking to everyone again").await;
            }

            TeamChat => {
                self.chat.add_team_speaker(host_id).await;
                self.tell(handle, "Talking to your team only").await;
            }

            Spectate { on } => {
                {
                    let mut sessions = self.sessions.write().await;
                    if let Some(session) = sessions.session_mut(handle) {
                        session.spectate_mode = if on {
                            SpectateMode::Command
                        } else {
                            SpectateMode::None
                        };
                    }
                }
                self.refresh_lobby_roster().await;
            }

            Start => {
                // Re-checked against the crown and the lobby state.
                self.on_request_begin(handle).await;
            }

            Kick { name } => {
                match self.handle_by_name(&name).await {
                    Some(target) => {
                        log::info!("host {} kicked {} by command", host_id, name);
                        self.kick_with_reason(target, BackLobbyReason::Kicked).await;
                    }
                    None => self.tell(handle, &format!("No player named {}", name)).await,
                }
            }

            Ban { name, reason } => {
                self.ban_by_name(handle, host_id, &name, &reason).await;
            }

            SetMode { mode } => {
                if self.play_state().await != PlayState::WaitingForStartGame {
                    self.tell(handle, "The mode can only change between matches").await;
                    return;
                }
                self.settings.set_mode(mode).await;
                log::info!("host {} changed the mode to {:?}", host_id, mode);
                self.broadcast(&self.config_server_packet().await).await;
                self.broadcast(&self.server_info_packet(false).await).await;
                self.refresh_lobby_roster().await;
            }

            SetDifficulty { difficulty } => {
                if self.play_state().await != PlayState::WaitingForStartGame {
                    self.tell(handle, "The difficulty can only change between matches")
                        .await;
                    return;
                }
                self.settings.set_difficulty(difficulty).await;
                log::info!("host {} changed the difficulty to {:?}", host_id, difficulty);
                self.broadcast(&self.config_server_packet().await).await;
                self.broadcast(&self.server_info_packet(false).await).await;
            }

            AllowStart { on } => {
                self.settings.set_allowed_to_start(on).await;
                self.tell(
                    handle,
                    if on {
                        "Starting matches is allowed"
                    } else {
                        "Starting matches is forbidden"
                    },
                )
                .await;
            }
        }
    }

    /// Hammer comes from the config whitelist or a referee role; the
    /// crown holder sits in between; everyone else is a usual player.
    async fn permission_level_of(&self, host_id: u32, name: &str) -> PermissionLevel {
        if self.config.admins.iter().any(|admin| admin == name) {
            return PermissionLevel::Hammer;
        }
        if let Some(t) = &self.tournament {
            if t.is_referee(name).await {
                return PermissionLevel::Hammer;
            }
        }
        let crown_holder = {
            let sessions = self.sessions.lock().await;
            self.crown.crown_holder(&sessions)
        };
        if crown_holder == Some(host_id) {
            PermissionLevel::Crowned
        } else {
            PermissionLevel::Usual
        }
    }

    /// Server notice to a single peer, delivered on the chat channel.
    /// Long text (the command reference) is split at the chat length
    /// cap instead of being truncated.
    async fn tell(&self, handle: PeerHandle, text: &str) {
        let chars: Vec<char> = text.chars().collect();
        for chunk in chars.chunks(kartnet::MAX_CHAT_LEN) {
            crate::server::send_packet(
                self.server.as_ref(),
                handle,
                &Chat {
                    message: ChatStr(chunk.iter().collect()),
                    kart_team: None,
                },
            )
            .await;
        }
    }

    async fn handle_by_name(&self, name: &str) -> Option<PeerHandle> {
        let sessions = self.sessions.lock().await;
        let result = sessions
            .validated()
            .find(|s| s.profiles.iter().any(|p| p.name.as_str() == name))
            .map(|s| s.handle);
        result
    }

    /// Bans a connected player by address (and online id, if
    /// authenticated), then kicks them.
    async fn ban_by_name(&self, sender: PeerHandle, sender_host: u32, name: &str, reason: &str) {
        let target = {
            let sessions = self.sessions.lock().await;
            let result = sessions
                .validated()
                .find(|s| s.profiles.iter().any(|p| p.name.as_str() == name))
                .map(|s| {
                    (
                        s.handle,
                        s.address,
                        s.main_profile().map(|p| p.online_id).unwrap_or(0),
                    )
                });
            result
        };
        let (target_handle, address, online_id) = match target {
            Some(t) => t,
            None => {
                self.tell(sender, &format!("No player named {}", name)).await;
                return;
            }
        };

        let ban_target = match address.ip() {
            std::net::IpAddr::V4(ip) => BanTarget::Ipv4(ip),
            std::net::IpAddr::V6(ip) => BanTarget::Ipv6Cidr(format!("{}/128", ip)),
        };
        self.enqueue(AsyncTask::RecordBan {
            target: ban_target,
            reason: reason.to_string(),
        });
        if online_id != 0 {
            self.enqueue(AsyncTask::RecordBan {
                target: BanTarget::OnlineId(online_id),
                reason: reason.to_string(),
            });
        }

        log::info!("host {} banned {} ({})", sender_host, name, reason);
        self.kick_with_reason(target_handle, BackLobbyReason::Kicked).await;
        self.tell(sender, &format!("{} is banned", name)).await;
    }
}
