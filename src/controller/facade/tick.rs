use std::time::Instant;

use kartnet::BackLobbyReason;

use crate::controller::facade::{Controller, PlayState};
use crate::controller::session::LiveSessions;
use crate::server::PeerHandle;
use crate::task::TaskOutcome;

impl Controller {
    /// Timed work: every long-lived wait has an explicit deadline that
    /// is compared against the monotonic clock here, once per tick.
    pub async fn on_tick(&self, now: Instant) {
        match self.play_state().await {
            PlayState::Selecting => {
                let expired = {
                    let state = self.lobby_state().await;
                    state.voting_ends_at.map(|at| now >= at).unwrap_or(false)
                };
                if expired {
                    self.finish_vote().await;
                }
            }

            PlayState::WaitForWorldLoaded => {
                let expired = {
                    let state = self.lobby_state().await;
                    state
                        .world_load_deadline
                        .map(|at| now >= at)
                        .unwrap_or(false)
                };
                if expired {
                    self.drop_unloaded_peers().await;
                    self.schedule_race_start().await;
                }
            }

            PlayState::WaitForRaceStarted => {
                let started = {
                    let mut state = self.lobby_state_mut().await;
                    match state.start_at {
                        Some(at) if now >= at => {
                            state.play_state = PlayState::Racing;
                            state.start_at = None;
                            state.last_tick = Some(now);
                            true
                        }
                        _ => false,
                    }
                };
                if started {
                    log::info!("race started");
                }
            }

            PlayState::Racing => {
                let finished = {
                    let mut state = self.lobby_state_mut().await;
                    let dt = state
                        .last_tick
                        .map(|last| now.saturating_duration_since(last).as_secs_f32())
                        .unwrap_or(0.0);
                    state.last_tick = Some(now);
                    match state.world.as_mut() {
                        Some(world) => {
                            if dt > 0.0 {
                                world.tick(dt);
                            }
                            world.is_finished()
                        }
                        None => false,
                    }
                };
                if finished {
                    self.enter_result_display().await;
                }
            }

            PlayState::ResultDisplay => {
                let expired = {
                    let state = self.lobby_state().await;
                    state
                        .result_ack_deadline
                        .map(|at| now >= at)
                        .unwrap_or(false)
                };
                if expired {
                    // Missing acks count as given so the lobby can
                    // reset.
                    log::debug!("result ack timeout; counting stragglers as acked");
                    self.reset_lobby().await;
                }
            }

            PlayState::WaitingForStartGame | PlayState::LoadWorld | PlayState::WaitForRaceStopped => {}
        }

        self.kick_idle_peers(now).await;
    }

    /// Worker completions re-entering the main loop.
    pub async fn on_task_outcome(&self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Db { what, error } => {
                if let Some(error) = error {
                    log::warn!("database task {} failed: {}", what, error);
                }
            }
            TaskOutcome::ResetPhaseTwoDone => {
                self.finish_reset().await;
            }
        }
    }

    /// Peers that never acked world loading spectate this match.
    async fn drop_unloaded_peers(&self) {
        let stragglers: Vec<u32> = {
            let state = self.lobby_state().await;
            state.load_world_pending.iter().copied().collect()
        };
        if stragglers.is_empty() {
            return;
        }
        log::info!(
            "{} peer(s) failed to load the world in time; moving them to spectators",
            stragglers.len()
        );
        {
            let mut sessions = self.sessions.write().await;
            for host_id in &stragglers {
                if let Some(handle) = sessions.handle_of(*host_id) {
                    if let Some(session) = sessions.session_mut(handle) {
                        session.waiting_for_game = true;
                    }
                }
            }
        }
        {
            let mut state = self.lobby_state_mut().await;
            for host_id in &stragglers {
                state.load_world_pending.remove(host_id);
                if let Some(world) = state.world.as_mut() {
                    world.release_karts_of(*host_id);
                }
            }
        }
        for host_id in stragglers {
            self.send_to_host(
                host_id,
                &kartnet::lobby::BackLobby {
                    reason: BackLobbyReason::SpectatingNextGame,
                },
            )
            .await;
        }
    }

    /// Enforces the idle timeouts: a laxer one in the lobby, a stricter
    /// one in a live match.
    async fn kick_idle_peers(&self, now: Instant) {
        let racing = matches!(
            self.play_state().await,
            PlayState::Racing | PlayState::WaitForRaceStarted | PlayState::WaitForWorldLoaded
        );
        let limit_secs = if racing {
            self.config.kick_idle_player_seconds
        } else {
            self.config.kick_idle_lobby_player_seconds
        };
        if limit_secs <= 0.0 {
            return;
        }

        let idle: Vec<PeerHandle> = {
            let sessions = self.sessions.lock().await;
            sessions
                .validated()
                .filter(|s| {
                    let idle_for = now.saturating_duration_since(s.last_activity);
                    // The in-race timeout only applies to peers in the
                    // match; parked peers keep the lobby timeout.
                    let applies = !racing || !s.waiting_for_game;
                    applies && idle_for.as_secs_f32() > limit_secs
                })
                .map(|s| s.handle)
                .collect()
        };
        for handle in idle {
            log::info!("kicking idle peer {:?}", handle);
            self.kick_with_reason(handle, BackLobbyReason::Idle).await;
        }
    }
}
