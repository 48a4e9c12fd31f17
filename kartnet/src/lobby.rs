//! Lobby-room packet schemas: connection setup, player list, votes,
//! match lifecycle and chat. Game-state schemas live in [`crate::game`].

use crate::{ChatStr, GameMode, KartTeam, MessageType, RejectReason, Vec3, WideStr};
use crate::{game::ItemCompleteState, BackLobbyReason, Difficulty};

packet! {
    /// One profile entry of the broadcast player list.
    pub struct PlayerListProfile [LobbyRoom, sync = true, reliable = true] {
        host_id: u32;
        online_id: u32;
        local_player_id: u8;
        profile_name: WideStr;
        /// Bit 0: peer validated, bit 1: spectator, bit 2: crown holder,
        /// bit 3: AI.
        mask: u8;
        handicap: u8;
        kart_team: KartTeam;
        country_code: String;
    }
}

packet! {
    pub struct PlayerList [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::UpdatePlayerList as u8;
        game_started: bool;
        vec all_profiles: PlayerListProfile, len u8;
    }
}

packet! {
    /// Compact per-player record used in `LoadWorld` and live-join payloads.
    pub struct EncodedPlayer [LobbyRoom, sync = true, reliable = true] {
        name: WideStr;
        host_id: u32;
        kart_color: f32;
        online_id: u32;
        handicap: u8;
        local_player_id: u8;
        kart_team: KartTeam;
        country_code: String;
        kart_name: String;
    }
}

packet! {
    /// A peer's preference for the next match.
    pub struct PeerVote [LobbyRoom, sync = true, reliable = true] {
        player_name: WideStr;
        track_name: String;
        num_laps: u8;
        reverse: bool;
    }
}

packet! {
    pub struct DefaultVote [LobbyRoom, sync = true, reliable = true] {
        winner_peer_id: u32;
        vote: PeerVote;
    }
}

packet! {
    /// Limits for battle modes, absent for linear races.
    pub struct BattleInfo [LobbyRoom, sync = true, reliable = true] {
        hit_capture_limit: u32;
        time_limit: f32;
        flag_return_time: u16;
        flag_deactivated_time: u16;
    }
}

packet! {
    pub struct KartParameters [LobbyRoom, sync = true, reliable = true] {
        width: f32;
        height: f32;
        length: f32;
        gravity_shift: Vec3;
    }
}

packet! {
    /// Physics-relevant kart description; parameters only follow for
    /// non-standard kart types.
    pub struct KartData [LobbyRoom, sync = true, reliable = true] {
        kart_type: String;
        optional parameters: KartParameters, if !kart_type.is_empty();
    }
}

packet! {
    pub struct LoadWorld [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::LoadWorld as u8;
        default_vote: DefaultVote;
        live_join: bool;
        vec all_players: EncodedPlayer, len u8;
        item_seed: u32;
        is_battle: bool;
        optional battle_info: BattleInfo, if is_battle;
        vec players_kart_data: KartData, shares all_players;
    }
}

packet! {
    /// Lists of asset idents a peer (or the server) has installed.
    pub struct Assets [Connection, sync = true, reliable = true] {
        vec karts: String, len u16;
        vec maps: String, len u16;
    }
}

packet! {
    /// One local (split-screen) player announced at connection time.
    pub struct RequestedPlayer [Connection, sync = true, reliable = true] {
        name: WideStr;
        handicap: u8;
        kart_color: f32;
        country_code: String;
    }
}

packet! {
    pub struct ConnectionRequested [Connection, sync = true, reliable = true] {
        fixed tag = MessageType::ConnectionRequested as u8;
        protocol_version: u32;
        user_version: String;
        vec capabilities: String, len u16;
        assets: Assets;
        vec players: RequestedPlayer, len u8;
        online_id: u32;
        /// Size of the trailing encrypted blob when the server has a
        /// private-server password set; 0 otherwise.
        encrypted_size: u32;
        optional password_hash: String, if encrypted_size > 0;
    }
}

packet! {
    pub struct ConnectionRefused [Connection, sync = true, reliable = true] {
        fixed tag = MessageType::ConnectionRefused as u8;
        reason: RejectReason;
        /// Advice shown to the user, e.g. which version to upgrade to.
        optional message: String, if true;
    }
}

packet! {
    pub struct ConnectionAccepted [Connection, sync = true, reliable = true] {
        fixed tag = MessageType::ConnectionAccepted as u8;
        host_id: u32;
        server_version: u32;
        vec capabilities: String, len u16;
        auto_start_timer: f32;
        /// Physics ticks between two authoritative network updates.
        state_frequency: u32;
        chat_allowed: bool;
        reports_allowed: bool;
    }
}

packet! {
    pub struct ServerInfo [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::ServerInfo as u8;
        name: WideStr;
        mode: GameMode;
        difficulty: Difficulty;
        max_players: u8;
        password_protected: bool;
        game_started: bool;
    }
}

packet! {
    pub struct ConfigServer [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::ConfigServer as u8;
        difficulty: Difficulty;
        game_mode: GameMode;
        soccer_goal_target: bool;
    }
}

packet! {
    /// The crown asking the server to start selection.
    pub struct RequestBegin [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::RequestBegin as u8;
    }
}

packet! {
    pub struct StartSelection [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::StartSelection as u8;
        voting_timeout: f32;
        no_kart_selection: bool;
        fixed_length: bool;
        track_voting: bool;
        assets: Assets;
    }
}

packet! {
    /// A peer's own vote, sent to the server.
    pub struct VoteRequest [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::Vote as u8;
        vote: PeerVote;
    }
}

packet! {
    /// A vote re-broadcast to everyone so clients can show the tally.
    pub struct Vote [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::Vote as u8;
        host_id: u32;
        vote: PeerVote;
    }
}

packet! {
    pub struct PlayerKarts [LobbyRoom, sync = true, reliable = true] {
        vec karts: String, len u8;
        vec kart_data: KartData, shares karts;
    }
}

packet! {
    pub struct KartSelectionRequest [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::KartSelection as u8;
        karts: PlayerKarts;
    }
}

packet! {
    pub struct StartGame [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::StartRace as u8;
        /// Absolute wall-clock instant, in milliseconds, at which every
        /// participant schedules its first simulation tick.
        start_time: u64;
        check_count: u8;
        item_complete_state: ItemCompleteState;
    }
}

packet! {
    pub struct ClientLoadedWorld [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::ClientLoadedWorld as u8;
    }
}

packet! {
    pub struct GpIndividualScore [LobbyRoom, sync = true, reliable = true] {
        last_score: u32;
        cur_score: u32;
        overall_time: f32;
    }
}

packet! {
    pub struct GpScores [LobbyRoom, sync = true, reliable = true] {
        total_gp_tracks: u8;
        vec all_tracks: String, len u8;
        vec scores: GpIndividualScore, len u8;
    }
}

packet! {
    pub struct PointChanges [LobbyRoom, sync = true, reliable = true] {
        vec changes: f32, len u8;
    }
}

packet! {
    pub struct RaceFinished [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::RaceFinished as u8;
        is_linear: bool;
        optional fastest_lap: u32, if is_linear;
        optional fastest_kart_name: WideStr, if is_linear;
        is_gp: bool;
        optional gp_scores: GpScores, if is_gp;
        point_changes_indication: bool;
        point_changes: PointChanges;
    }
}

packet! {
    pub struct RaceFinishedAck [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::RaceFinishedAck as u8;
    }
}

packet! {
    pub struct BackLobby [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::BackLobby as u8;
        reason: BackLobbyReason;
    }
}

packet! {
    pub struct Chat [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::Chat as u8;
        message: ChatStr;
        /// Present when the message targets a single team.
        optional kart_team: KartTeam, if true;
    }
}

packet! {
    pub struct ChangeTeam [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::ChangeTeam as u8;
        local_id: u8;
    }
}

packet! {
    pub struct ChangeHandicap [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::ChangeHandicap as u8;
        local_id: u8;
        handicap: u8;
    }
}

packet! {
    pub struct KickHost [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::KickHost as u8;
        host_id: u32;
    }
}

packet! {
    pub struct ServerOwnership [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::ServerOwnership as u8;
    }
}

packet! {
    pub struct PlayerDisconnected [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::PlayerDisconnected as u8;
        host_id: u32;
        vec names: WideStr, len u8;
    }
}

packet! {
    pub struct BadTeam [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::BadTeam as u8;
    }
}

packet! {
    pub struct AssetsUpdate [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::AssetsUpdate as u8;
        assets: Assets;
    }
}

packet! {
    pub struct ReportRequest [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::ReportPlayer as u8;
        host_id: u32;
        info: ChatStr;
    }
}

packet! {
    pub struct ReportSuccess [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::ReportPlayer as u8;
        success: bool;
        reported_name: WideStr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Packet;

    fn sample_vote() -> PeerVote {
        PeerVote {
            player_name: WideStr::from("Ayla"),
            track_name: "hacienda".to_string(),
            num_laps: 3,
            reverse: false,
        }
    }

    #[test]
    fn load_world_round_trip() {
        let before = LoadWorld {
            default_vote: DefaultVote {
                winner_peer_id: 1,
                vote: sample_vote(),
            },
            live_join: false,
            all_players: vec![
                EncodedPlayer {
                    name: WideStr::from("Ayla"),
                    host_id: 1,
                    kart_color: 0.5,
                    online_id: 0,
                    handicap: 0,
                    local_player_id: 0,
                    kart_team: KartTeam::None,
                    country_code: "DE".to_string(),
                    kart_name: "tux".to_string(),
                },
                EncodedPlayer {
                    name: WideStr::from("Berta"),
                    host_id: 2,
                    ..Default::default()
                },
            ],
            item_seed: 0xfeed_beef,
            is_battle: false,
            battle_info: None,
            players_kart_data: vec![KartData::default(), KartData::default()],
        };
        let after = LoadWorld::from_bytes(&before.to_bytes()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn battle_info_is_gated_on_mode_flag() {
        let mut packet = LoadWorld {
            default_vote: DefaultVote {
                winner_peer_id: 0,
                vote: sample_vote(),
            },
            ..Default::default()
        };
        packet.is_battle = true;
        packet.battle_info = Some(BattleInfo {
            hit_capture_limit: 5,
            time_limit: 300.0,
            flag_return_time: 20,
            flag_deactivated_time: 3,
        });
        let after = LoadWorld::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(after.battle_info, packet.battle_info);
    }

    #[test]
    fn kart_data_parameters_follow_only_nonstandard_types() {
        let standard = KartData::default();
        let decoded = KartData::from_bytes(&standard.to_bytes()).unwrap();
        assert_eq!(decoded.parameters, None);

        let addon = KartData {
            kart_type: "heavy".to_string(),
            parameters: Some(KartParameters {
                width: 1.2,
                height: 1.0,
                length: 2.1,
                gravity_shift: Vec3::new(0.0, -0.1, 0.0),
            }),
        };
        let decoded = KartData::from_bytes(&addon.to_bytes()).unwrap();
        assert_eq!(decoded.parameters, addon.parameters);
    }

    #[test]
    fn vote_request_without_optional_tail_decodes_on_newer_schema() {
        // Scenario: an old client's VoteRequest ends after the mandatory
        // fields; decoding must not fail even though the reader would
        // accept more.
        let request = VoteRequest { vote: sample_vote() };
        let decoded = VoteRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(decoded.vote, sample_vote());
    }

    #[test]
    fn connection_refused_carries_advice() {
        let refusal = ConnectionRefused {
            reason: RejectReason::IncompatibleData,
            message: Some("please update to 1.4".to_string()),
        };
        let decoded = ConnectionRefused::from_bytes(&refusal.to_bytes()).unwrap();
        assert_eq!(decoded.reason, RejectReason::IncompatibleData);
        assert_eq!(decoded.message.as_deref(), Some("please update to 1.4"));

        // Without the advice string the tail is simply absent.
        let bare = ConnectionRefused {
            reason: RejectReason::TooManyPlayers,
            message: None,
        };
        let decoded = ConnectionRefused::from_bytes(&bare.to_bytes()).unwrap();
        assert_eq!(decoded.message, None);
    }

    #[test]
    fn race_finished_gp_payload() {
        let finished = RaceFinished {
            is_linear: true,
            fastest_lap: Some(31_250),
            fastest_kart_name: Some(WideStr::from("Ayla")),
            is_gp: true,
            gp_scores: Some(GpScores {
                total_gp_tracks: 3,
                all_tracks: vec!["hacienda".into(), "oasis".into()],
                scores: vec![GpIndividualScore {
                    last_score: 10,
                    cur_score: 25,
                    overall_time: 180.4,
                }],
            }),
            point_changes_indication: true,
            point_changes: PointChanges {
                changes: vec![15.0, 10.0, 8.0],
            },
        };
        let after = RaceFinished::from_bytes(&finished.to_bytes()).unwrap();
        assert_eq!(finished, after);
    }
}
