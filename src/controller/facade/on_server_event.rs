use kartnet::lobby::PlayerDisconnected;
use kartnet::Channel;

use crate::config::MAX_DECODE_FAILURES;
use crate::controller::facade::{Controller, PlayState};
use crate::controller::session::LiveSessions;
use crate::database::DisconnectUpdate;
use crate::server::{PeerHandle, ServerEvent};
use crate::task::AsyncTask;

impl Controller {
    pub async fn on_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::PeerConnected { handle, address } => {
                let host_id = self.sessions.add_incoming(handle, address).await;
                log::info!("peer {} connected from {} as host {}", handle.0, address, host_id);
                // Validation happens once the identity handshake
                // arrives; until then the peer may only send
                // `ConnectionRequested`.
            }

            ServerEvent::PeerDisconnected { handle } => {
                self.on_peer_disconnected(handle).await;
            }

            ServerEvent::PingUpdate {
                handle,
                ping_ms,
                packet_loss,
            } => {
                let mut sessions = self.sessions.write().await;
                if let Some(session) = sessions.session_mut(handle) {
                    session.ping_ms = ping_ms;
                    session.packet_loss = packet_loss;
                }
            }

            ServerEvent::Packet {
                handle,
                channel,
                payload,
            } => match channel {
                Channel::Connection | Channel::LobbyRoom => {
                    self.on_lobby_packet(handle, &payload).await;
                }
                Channel::GameEvents | Channel::GameState => {
                    self.on_game_packet(handle, &payload).await;
                }
            },
        }
    }

    async fn on_peer_disconnected(&self, handle: PeerHandle) {
        let session = match self.sessions.remove(handle).await {
            Some(session) => session,
            None => return,
        };
        log::info!(
            "host {} ({}) disconnected",
            session.host_id,
            session.main_name()
        );

        self.chat.on_peer_disconnect(session.host_id).await;
        self.votes.retract(session.host_id).await;
        self.enqueue(AsyncTask::RecordDisconnection(DisconnectUpdate {
            host_id: session.host_id,
            disconnected_time: chrono::Utc::now().naive_utc(),
            ping: session.ping_ms,
            packet_loss: session.packet_loss,
        }));

        if !session.validated {
            return;
        }

        // Free the karts for live joiners and unblock any handshake
        // waits the peer was part of.
        let mut finish_load_check = false;
        let mut finish_ack_check = false;
        {
            let mut state = self.lobby_state_mut().await;
            if let Some(world) = state.world.as_mut() {
                world.release_karts_of(session.host_id);
            }
            if state.load_world_pending.remove(&session.host_id)
                && state.load_world_pending.is_empty()
            {
                finish_load_check = true;
            }
            if state.result_ack_pending.remove(&session.host_id)
                && state.result_ack_pending.is_empty()
            {
                finish_ack_check = true;
            }
        }

        self.broadcast(&PlayerDisconnected {
            host_id: session.host_id,
            names: session.profiles.iter().map(|p| p.name.clone()).collect(),
        })
        .await;

        // The crown passes freely with the recomputed roster.
        self.refresh_lobby_roster().await;

        if finish_load_check {
            self.schedule_race_start().await;
        }
        if finish_ack_check {
            self.reset_lobby().await;
        }
    }

    /// Counts a malformed packet against the peer; repeated failures
    /// escalate to a disconnect.
    pub(super) async fn on_decode_failure(&self, handle: PeerHandle, error: kartnet::DecodeError) {
        let (host_id, failures) = {
            let mut sessions = self.sessions.write().await;
            match sessions.session_mut(handle) {
                Some(session) => {
                    if session.decode_failures == 0 {
                        log::warn!(
                            "dropping malformed packet from host {}: {}",
                            session.host_id,
                            error
                        );
                    }
                    session.decode_failures += 1;
                    (session.host_id, session.decode_failures)
                }
                None => return,
            }
        };
        if failures >= MAX_DECODE_FAILURES {
            log::warn!("host {} keeps sending malformed packets, disconnecting", host_id);
            self.server.kick(handle).await;
        }
    }

    /// Game-channel traffic is only meaningful while a world is live;
    /// it feeds per-kart physics samples and discrete events into the
    /// authoritative state. Anything else is dropped.
    async fn on_game_packet(&self, handle: PeerHandle, _payload: &[u8]) {
        let racing = matches!(self.play_state().await, PlayState::Racing);
        if !racing {
            return;
        }
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.session_mut(handle) {
            session.update_last_activity();
        }
    }
}
