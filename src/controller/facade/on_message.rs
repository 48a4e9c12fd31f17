use std::convert::TryFrom;

use kartnet::game::LiveJoinRequest;
use kartnet::lobby::{
    AssetsUpdate, BackLobby, Chat, ChangeHandicap, ChangeTeam, ConnectionAccepted,
    ConnectionRefused, ConnectionRequested, KartSelectionRequest, KickHost, RaceFinishedAck,
    ReportRequest, ReportSuccess, RequestBegin, VoteRequest,
};
use kartnet::{
    BackLobbyReason, ChatStr, KartTeam, MessageType, Packet, RejectReason, WideStr,
};

use crate::config::{MAX_CHAT_OFFENCES, PROTOCOL_VERSION};
use crate::controller::chat::ChatOutcome;
use crate::controller::crown::LiveCrown;
use crate::controller::facade::{Controller, PlayState};
use crate::controller::session::{LiveSessions, PlayerProfile};
use crate::controller::settings::LiveSettings;
use crate::controller::team::TeamController;
use crate::controller::tournament::LiveTournament;
use crate::controller::vote;
use crate::controller::vote::LiveVotes;
use crate::database::{Database, ReportRow, StatsRow};
use crate::server::PeerHandle;
use crate::task::AsyncTask;

/// Decodes a packet or records the failure against the peer.
macro_rules! decode {
    ($self:ident, $handle:ident, $ty:ty, $payload:expr) => {
        match <$ty>::from_bytes($payload) {
            Ok(packet) => packet,
            Err(error) => {
                $self.on_decode_failure($handle, error).await;
                return;
            }
        }
    };
}

impl Controller {
    pub(super) async fn on_lobby_packet(&self, handle: PeerHandle, payload: &[u8]) {
        {
            let mut sessions = self.sessions.write().await;
            match sessions.session_mut(handle) {
                Some(session) => session.update_last_activity(),
                // Transport raced a disconnect; nothing to do.
                None => return,
            }
        }

        let tag = match payload.first() {
            Some(tag) => *tag,
            None => return,
        };
        let message_type = match MessageType::try_from(tag) {
            Ok(t) => t,
            Err(error) => {
                self.on_decode_failure(handle, error).await;
                return;
            }
        };

        match message_type {
            MessageType::ConnectionRequested => {
                let packet = decode!(self, handle, ConnectionRequested, payload);
                self.on_connection_requested(handle, packet).await;
            }
            MessageType::Vote => {
                let packet = decode!(self, handle, VoteRequest, payload);
                self.on_vote_request(handle, packet).await;
            }
            MessageType::Chat => {
                let packet = decode!(self, handle, Chat, payload);
                self.on_chat(handle, packet).await;
            }
            MessageType::ChangeTeam => {
                let packet = decode!(self, handle, ChangeTeam, payload);
                self.on_change_team(handle, packet).await;
            }
            MessageType::ChangeHandicap => {
                let packet = decode!(self, handle, ChangeHandicap, payload);
                self.on_change_handicap(handle, packet).await;
            }
            MessageType::KickHost => {
                let packet = decode!(self, handle, KickHost, payload);
                self.on_kick_host(handle, packet).await;
            }
            MessageType::RequestBegin => {
                let _ = decode!(self, handle, RequestBegin, payload);
                self.on_request_begin(handle).await;
            }
            MessageType::ClientLoadedWorld => {
                self.on_client_loaded_world(handle).await;
            }
            MessageType::RaceFinishedAck => {
                let _ = decode!(self, handle, RaceFinishedAck, payload);
                self.on_race_finished_ack(handle).await;
            }
            MessageType::LiveJoin => {
                let packet = decode!(self, handle, LiveJoinRequest, payload);
                self.on_live_join_request(handle, packet).await;
            }
            MessageType::KartSelection => {
                let packet = decode!(self, handle, KartSelectionRequest, payload);
                self.on_kart_selection(handle, packet).await;
            }
            MessageType::ReportPlayer => {
                let packet = decode!(self, handle, ReportRequest, payload);
                self.on_report(handle, packet).await;
            }
            MessageType::AssetsUpdate => {
                let packet = decode!(self, handle, AssetsUpdate, payload);
                self.on_assets_update(handle, packet).await;
            }
            // Server-to-client message types are not accepted inbound.
            _ => {
                log::debug!("ignoring inbound {:?} from {:?}", message_type, handle);
            }
        }
    }

    // ---- handshake ---------------------------------------------------------

    async fn on_connection_requested(&self, handle: PeerHandle, packet: ConnectionRequested) {
        let (host_id, address, already_validated) = {
            let sessions = self.sessions.lock().await;
            match sessions.session(handle) {
                Some(s) => (s.host_id, s.address, s.validated),
                None => return,
            }
        };
        if already_validated {
            return;
        }

        let refuse = |reason, message: Option<String>| async move {
            use crate::server::send_packet;
            send_packet(
                self.server.as_ref(),
                handle,
                &ConnectionRefused { reason, message },
            )
            .await;
            self.server.kick(handle).await;
        };

        // 1. Version compatibility, with upgrade advice.
        if packet.protocol_version != PROTOCOL_VERSION {
            log::info!(
                "host {} refused: protocol {} vs ours {}",
                host_id,
                packet.protocol_version,
                PROTOCOL_VERSION
            );
            refuse(
                RejectReason::IncompatibleData,
                Some(format!(
                    "server speaks protocol version {}; please update your game",
                    PROTOCOL_VERSION
                )),
            )
            .await;
            return;
        }

        // 2. Ban lists: IPv4 exact, IPv6 CIDR, then online id.
        let ban_reason = match address.ip() {
            std::net::IpAddr::V4(ip) => self.db.check_ip_ban(ip).await.unwrap_or(None),
            std::net::IpAddr::V6(ip) => self.db.check_ipv6_ban(ip).await.unwrap_or(None),
        };
        let ban_reason = match ban_reason {
            Some(reason) => Some(reason),
            None if packet.online_id != 0 => self
                .db
                .check_online_id_ban(packet.online_id)
                .await
                .unwrap_or(None),
            None => None,
        };
        if let Some(reason) = ban_reason {
            log::info!("host {} refused: banned ({})", host_id, reason);
            refuse(RejectReason::Banned, Some(reason)).await;
            return;
        }

        // 3. Server full.
        {
            let sessions = self.sessions.lock().await;
            if sessions.player_count() + packet.players.len() > self.config.max_players {
                refuse(RejectReason::TooManyPlayers, None).await;
                return;
            }
        }

        // 4. Password.
        if !self.config.password.is_empty()
            && packet.password_hash.as_deref() != Some(self.config.password.as_str())
        {
            refuse(RejectReason::IncorrectPassword, None).await;
            return;
        }

        // 5. Unique online identity.
        if self.sessions.lock().await.online_id_in_use(packet.online_id) {
            refuse(RejectReason::InvalidPlayer, None).await;
            return;
        }

        // 6. Asset thresholds.
        let client_karts: std::collections::HashSet<String> =
            packet.assets.karts.iter().cloned().collect();
        let client_maps: std::collections::HashSet<String> =
            packet.assets.maps.iter().cloned().collect();
        let audit = self.assets.audit(&client_karts, &client_maps);
        if let Err(refusal) = self.assets.check_can_join(&client_karts, &client_maps, &audit) {
            log::info!("host {} refused: {:?}", host_id, refusal);
            refuse(RejectReason::IncompatibleData, Some(refusal.advice())).await;
            return;
        }

        let game_started = !matches!(
            self.play_state().await,
            PlayState::WaitingForStartGame | PlayState::Selecting
        );

        // Admission passed: promote to VALIDATED.
        {
            let mut sessions = self.sessions.write().await;
            let session = match sessions.session_mut(handle) {
                Some(s) => s,
                None => return,
            };
            session.validated = true;
            session.waiting_for_game = game_started;
            session.user_version = packet.user_version.clone();
            session.capabilities = packet.capabilities.iter().cloned().collect();
            session.client_karts = client_karts;
            session.client_maps = client_maps;
            session.addon_counts = audit.addon_counts;
            session.profiles = packet
                .players
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    let mut profile =
                        PlayerProfile::new(p.name.as_str(), packet.online_id, i as u8);
                    profile.handicap = p.handicap;
                    profile.kart_color = p.kart_color;
                    profile.country_code = p.country_code.clone();
                    profile
                })
                .collect();
        }

        log::info!(
            "host {} validated with {} player(s)",
            host_id,
            packet.players.len()
        );

        self.send_to_host(
            host_id,
            &ConnectionAccepted {
                host_id,
                server_version: PROTOCOL_VERSION,
                capabilities: server_capabilities(),
                auto_start_timer: self.config.auto_start_timer_secs,
                state_frequency: self.config.state_frequency,
                chat_allowed: self.config.chat,
                reports_allowed: self.config.reports_allowed,
            },
        )
        .await;
        self.send_to_host(host_id, &self.server_info_packet(game_started).await)
            .await;
        self.send_to_host(host_id, &self.config_server_packet().await)
            .await;

        let session = self.sessions.session(handle).await;
        if let Some(session) = session {
            self.enqueue(AsyncTask::RecordConnection(StatsRow {
                host_id,
                address: session.address.ip().to_string(),
                port: session.address.port(),
                online_id: packet.online_id,
                username: session.main_name(),
                country_code: session
                    .main_profile()
                    .map(|p| p.country_code.clone())
                    .filter(|c| !c.is_empty()),
                connected_time: session.connected_at,
                ping: session.ping_ms,
                packet_loss: session.packet_loss,
                addon_karts_count: session.addon_counts.karts as i64,
                addon_tracks_count: session.addon_counts.tracks as i64,
                addon_arenas_count: session.addon_counts.arenas as i64,
                addon_soccers_count: session.addon_counts.soccers as i64,
            }));
            self.enqueue(AsyncTask::StoreHostIdCeiling(
                self.sessions.host_id_ceiling().await,
            ));
        }

        self.refresh_lobby_roster().await;
    }

    // ---- voting ------------------------------------------------------------

    async fn on_vote_request(&self, handle: PeerHandle, packet: VoteRequest) {
        if self.play_state().await != PlayState::Selecting {
            return;
        }
        let (host_id, name, validated) = {
            let sessions = self.sessions.lock().await;
            match sessions.session(handle) {
                Some(s) => (s.host_id, s.main_name(), s.validated),
                None => return,
            }
        };
        let spectator_by_limit = self.crown.is_spectator_by_limit(host_id).await;
        let tournament_votable = match &self.tournament {
            Some(t) => Some(t.can_vote(&name).await),
            None => None,
        };
        if !vote::can_vote(validated, spectator_by_limit, tournament_votable) {
            return;
        }

        let mut vote = packet.vote;
        vote.player_name = WideStr::from(name.as_str());
        self.votes.submit(host_id, vote.clone()).await;

        // Everyone sees the running tally.
        self.broadcast(&kartnet::lobby::Vote { host_id, vote }).await;

        if self.all_eligible_voted().await {
            self.finish_vote().await;
        }
    }

    pub(super) async fn all_eligible_voted(&self) -> bool {
        let eligible = self.eligible_voters().await;
        let state = self.votes.lock().await;
        !eligible.is_empty() && eligible.iter().all(|id| state.votes.contains_key(id))
    }

    pub(super) async fn eligible_voters(&self) -> Vec<u32> {
        let sessions = self.sessions.lock().await;
        let mut out = vec![];
        for peer in sessions.validated() {
            if peer.waiting_for_game {
                continue;
            }
            let spectator_by_limit = self.crown.is_spectator_by_limit(peer.host_id).await;
            let tournament_votable = match &self.tournament {
                Some(t) => Some(t.can_vote(&peer.main_name()).await),
                None => None,
            };
            if vote::can_vote(peer.validated, spectator_by_limit, tournament_votable) {
                out.push(peer.host_id);
            }
        }
        out
    }

    // ---- chat --------------------------------------------------------------

    async fn on_chat(&self, handle: PeerHandle, packet: Chat) {
        let sender_name = {
            let sessions = self.sessions.lock().await;
            match sessions.session(handle) {
                Some(s) if s.validated => s.main_name(),
                _ => return,
            }
        };

        // A leading '/' behind the sender's own name prefix is a
        // command, not chat.
        let prefix = format!("{}: ", sender_name);
        if let Some(rest) = packet.message.0.strip_prefix(&prefix) {
            if rest.starts_with('/') {
                self.on_command(handle, rest).await;
                return;
            }
        }

        // A tournament referee may have silenced the sender everywhere.
        if let Some(t) = &self.tournament {
            if t.is_mutedall(&sender_name).await {
                return;
            }
        }

        let team_seers = match &self.tournament {
            Some(t) => t.referees().await,
            None => Default::default(),
        };
        let game_started = !matches!(
            self.play_state().await,
            PlayState::WaitingForStartGame | PlayState::Selecting
        );

        let outcome = {
            let mut sessions = self.sessions.write().await;
            self.chat
                .handle_message(
                    &mut sessions,
                    handle,
                    &packet.message.0,
                    packet.kart_team.filter(|t| *t != KartTeam::None),
                    game_started,
                    &team_seers,
                )
                .await
        };

        match outcome {
            ChatOutcome::Deliver { recipients } => {
                for recipient in recipients {
                    crate::server::send_packet(self.server.as_ref(), recipient, &packet).await;
                }
            }
            ChatOutcome::Reject { notice } => {
                crate::server::send_packet(
                    self.server.as_ref(),
                    handle,
                    &Chat {
                        message: ChatStr::from(notice),
                        kart_team: None,
                    },
                )
                .await;
                let offences = {
                    let sessions = self.sessions.lock().await;
                    sessions.session(handle).map(|s| s.chat_offences).unwrap_or(0)
                };
                if offences >= MAX_CHAT_OFFENCES {
                    self.kick_with_reason(handle, BackLobbyReason::Kicked).await;
                }
            }
            ChatOutcome::Ignore => {}
        }
    }

    // ---- lobby edits -------------------------------------------------------

    async fn on_change_team(&self, handle: PeerHandle, packet: ChangeTeam) {
        if let Some(t) = &self.tournament {
            if !t.can_change_team() {
                return;
            }
        }
        if self.play_state().await != PlayState::WaitingForStartGame {
            return;
        }
        let host_id = {
            let sessions = self.sessions.lock().await;
            match sessions.session(handle) {
                Some(s) if s.validated => s.host_id,
                _ => return,
            }
        };
        {
            let mut sessions = self.sessions.write().await;
            TeamController::cycle_kart_team(&mut sessions, host_id, packet.local_id);
        }
        self.broadcast_player_list().await;
    }

    async fn on_change_handicap(&self, handle: PeerHandle, packet: ChangeHandicap) {
        let mut changed = false;
        {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.session_mut(handle) {
                if let Some(profile) = session
                    .profiles
                    .iter_mut()
                    .find(|p| p.local_player_id == packet.local_id)
                {
                    profile.handicap = packet.handicap;
                    changed = true;
                }
            }
        }
        if changed {
            self.broadcast_player_list().await;
        }
    }

    async fn on_kick_host(&self, handle: PeerHandle, packet: KickHost) {
        let (sender_host, target_handle, crown_holder) = {
            let sessions = self.sessions.lock().await;
            let sender = match sessions.session(handle) {
                Some(s) if s.validated => s.host_id,
                _ => return,
            };
            (
                sender,
                sessions.handle_of(packet.host_id),
                self.crown.crown_holder(&sessions),
            )
        };
        // Only the crown may kick.
        if Some(sender_host) != crown_holder {
            return;
        }
        if let Some(target) = target_handle {
            log::info!("host {} kicked host {}", sender_host, packet.host_id);
            self.kick_with_reason(target, BackLobbyReason::Kicked).await;
        }
    }

    async fn on_report(&self, handle: PeerHandle, packet: ReportRequest) {
        if !self.config.reports_allowed {
            return;
        }
        let (reporter_host, reporter_name) = {
            let sessions = self.sessions.lock().await;
            match sessions.session(handle) {
                Some(s) if s.validated => (s.host_id, s.main_name()),
                _ => return,
            }
        };
        let reported_name = {
            let sessions = self.sessions.lock().await;
            sessions.by_host_id(packet.host_id).map(|s| s.main_name())
        };
        let reported_name = match reported_name {
            Some(name) => name,
            None => return,
        };
        self.enqueue(AsyncTask::InsertReport(ReportRow {
            reporter_host_id: reporter_host,
            reporter_name,
            reported_host_id: packet.host_id,
            reported_name: reported_name.clone(),
            info: packet.info.0,
            time: chrono::Utc::now().naive_utc(),
        }));
        self.send_to_host(
            reporter_host,
            &ReportSuccess {
                success: true,
                reported_name: WideStr::from(reported_name.as_str()),
            },
        )
        .await;
    }

    // ---- match lifecycle requests ------------------------------------------

    pub(in crate::controller::facade) async fn on_request_begin(&self, handle: PeerHandle) {
        if self.play_state().await != PlayState::WaitingForStartGame {
            return;
        }
        if !self.settings.allowed_to_start().await {
            return;
        }

        let mode = self.settings.mode().await;
        let (sender_host, sender_name, crown_holder, player_count, teams_ok) = {
            let sessions = self.sessions.lock().await;
            let sender = match sessions.session(handle) {
                Some(s) if s.validated => (s.host_id, s.main_name()),
                _ => return,
            };
            (
                sender.0,
                sender.1,
                self.crown.crown_holder(&sessions),
                sessions.player_count(),
                TeamController::teams_balanced_for(&sessions, mode),
            )
        };

        // In a tournament the referees drive starting, not the crown.
        match &self.tournament {
            Some(t) => {
                if t.forbids_starting() && !t.is_referee(&sender_name).await {
                    return;
                }
            }
            None => {
                if Some(sender_host) != crown_holder {
                    return;
                }
            }
        }

        if player_count < self.config.min_start_game_players {
            return;
        }
        if !teams_ok {
            self.send_to_host(sender_host, &kartnet::lobby::BadTeam {}).await;
            return;
        }

        self.start_selection().await;
    }

    async fn on_client_loaded_world(&self, handle: PeerHandle) {
        if self.play_state().await != PlayState::WaitForWorldLoaded {
            return;
        }
        let host_id = {
            let sessions = self.sessions.lock().await;
            match sessions.session(handle) {
                Some(s) => s.host_id,
                None => return,
            }
        };
        let all_loaded = {
            let mut state = self.lobby_state_mut().await;
            state.load_world_pending.remove(&host_id);
            state.load_world_pending.is_empty()
        };
        if all_loaded {
            self.schedule_race_start().await;
        }
    }

    async fn on_race_finished_ack(&self, handle: PeerHandle) {
        if self.play_state().await != PlayState::ResultDisplay {
            return;
        }
        let host_id = {
            let sessions = self.sessions.lock().await;
            match sessions.session(handle) {
                Some(s) => s.host_id,
                None => return,
            }
        };
        let all_acked = {
            let mut state = self.lobby_state_mut().await;
            state.result_ack_pending.remove(&host_id);
            state.result_ack_pending.is_empty()
        };
        if all_acked {
            self.reset_lobby().await;
        }
    }

    async fn on_live_join_request(&self, handle: PeerHandle, packet: LiveJoinRequest) {
        let host_id = {
            let sessions = self.sessions.lock().await;
            match sessions.session(handle) {
                Some(s) if s.validated => s.host_id,
                _ => return,
            }
        };

        if self.play_state().await != PlayState::Racing {
            self.send_to_host(
                host_id,
                &BackLobby {
                    reason: BackLobbyReason::NoGameForLiveJoin,
                },
            )
            .await;
            return;
        }

        let response = self.try_live_join(host_id, &packet).await;
        match response {
            Some(ack) => {
                {
                    let mut sessions = self.sessions.write().await;
                    if let Some(session) = sessions.session_mut(handle) {
                        session.waiting_for_game = false;
                    }
                }
                self.send_to_host(host_id, &ack).await;
            }
            None => {
                self.send_to_host(
                    host_id,
                    &BackLobby {
                        reason: BackLobbyReason::NoPlaceForLiveJoin,
                    },
                )
                .await;
            }
        }
    }

    /// A peer installed or removed addons mid-session and re-declares
    /// its asset sets.
    async fn on_assets_update(&self, handle: PeerHandle, packet: AssetsUpdate) {
        let client_karts: std::collections::HashSet<String> =
            packet.assets.karts.into_iter().collect();
        let client_maps: std::collections::HashSet<String> =
            packet.assets.maps.into_iter().collect();
        let audit = self.assets.audit(&client_karts, &client_maps);
        {
            let mut sessions = self.sessions.write().await;
            match sessions.session_mut(handle) {
                Some(session) if session.validated => {
                    session.client_karts = client_karts;
                    session.client_maps = client_maps;
                    session.addon_counts = audit.addon_counts;
                }
                _ => return,
            }
        }
        self.refresh_lobby_roster().await;
    }

    async fn on_kart_selection(&self, handle: PeerHandle, packet: KartSelectionRequest) {
        if self.play_state().await != PlayState::Selecting {
            return;
        }
        if self.queues.kart_filters_ignore_input().await {
            return;
        }
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.session_mut(handle) {
            let owned = session.client_karts.clone();
            for (i, kart) in packet.karts.karts.iter().enumerate() {
                if !owned.contains(kart) {
                    continue;
                }
                if let Some(profile) = session.profiles.get_mut(i) {
                    profile.kart_name = kart.clone();
                }
            }
        }
    }
}

/// Capabilities this server announces during the handshake.
fn server_capabilities() -> Vec<String> {
    ["live_join", "item_policy", "tyre_model"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
