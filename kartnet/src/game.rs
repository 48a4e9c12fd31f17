//! Game-state packet schemas: item states, per-mode world snapshots and
//! the live-join handshake. These carry the authoritative state a peer
//! needs to attach to (or resynchronise with) a running match.

use crate::lobby::{EncodedPlayer, KartData, PlayerKarts};
use crate::{MessageType, Quat, Vec3, WideStr};

packet! {
    /// Position and orientation of a kart or track object.
    pub struct Placement [GameState, sync = false, reliable = false] {
        xyz: Vec3;
        rotation: Quat;
    }
}

packet! {
    /// Full state of one track item.
    pub struct ItemState [GameState, sync = false, reliable = true] {
        item_type: u8;
        /// Type before an item-switch power-up changed it.
        original_type: u8;
        /// Non-zero while the item is collected and invisible.
        ticks_till_return: u32;
        item_id: u32;
        deactive_ticks: u32;
        used_up_counter: u32;
        original_placement: Placement;
        /// Kart that dropped this item, or `u8::MAX` for track items.
        previous_owner: u8;
    }
}

packet! {
    pub struct ItemCompleteState [GameState, sync = false, reliable = true] {
        has_item: bool;
        optional item_state: ItemState, if has_item;
    }
}

packet! {
    /// Network item manager snapshot: every item on the track.
    pub struct NimCompleteState [GameState, sync = false, reliable = true] {
        ticks_since_start: u32;
        switch_ticks: u32;
        vec all_items: ItemCompleteState, len u32;
    }
}

packet! {
    /// Lap and progress bookkeeping for one kart.
    pub struct KartRaceInfo [GameState, sync = false, reliable = true] {
        finished_laps: u32;
        ticks_at_last_lap: u32;
        lap_start_ticks: u32;
        estimated_finish: f32;
        overall_distance: f32;
        wrong_way_timer: f32;
    }
}

packet! {
    pub struct LinearWorldCompleteState [GameState, sync = false, reliable = true] {
        fastest_lap_ticks: u32;
        distance_increase: f32;
        vec kart_placements: Placement, len u32;
        vec kart_infos: KartRaceInfo, shares kart_placements;
    }
}

packet! {
    /// One goal scorer entry.
    pub struct ScorerData [GameState, sync = false, reliable = true] {
        id: u8;
        correct_goal: bool;
        time: f32;
        kart: String;
        player: WideStr;
    }
}

packet! {
    pub struct SoccerWorldCompleteState [GameState, sync = false, reliable = true] {
        vec red_scorers: ScorerData, len u32;
        vec blue_scorers: ScorerData, len u32;
        reset_ball_ticks: u32;
        ticks_back_to_own_goal: u32;
    }
}

packet! {
    pub struct FfaWorldCompleteState [GameState, sync = false, reliable = true] {
        vec scores: u32, len u32;
    }
}

packet! {
    pub struct CtfWorldCompleteState [GameState, sync = false, reliable = true] {
        ffa: FfaWorldCompleteState;
        red_score: u32;
        blue_score: u32;
    }
}

packet! {
    /// Per-mode world snapshot; exactly one branch is populated,
    /// selected by the mode tag.
    pub struct WorldCompleteState [GameState, sync = false, reliable = true] {
        /// 0 = linear, 1 = soccer, 2 = FFA, 3 = CTF.
        world_kind: u8;
        optional linear: LinearWorldCompleteState, if world_kind == 0;
        optional soccer: SoccerWorldCompleteState, if world_kind == 1;
        optional ffa: FfaWorldCompleteState, if world_kind == 2;
        optional ctf: CtfWorldCompleteState, if world_kind == 3;
    }
}

packet! {
    /// Player and kart data for peers joining mid-match.
    pub struct InsideGameInfo [GameState, sync = false, reliable = true] {
        vec all_players: EncodedPlayer, len u8;
        vec players_kart_data: KartData, shares all_players;
    }
}

packet! {
    pub struct LiveJoinRequest [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::LiveJoin as u8;
        is_spectator: bool;
        optional player_karts: PlayerKarts, if !is_spectator;
    }
}

packet! {
    /// Authoritative snapshot answering a granted live-join request.
    pub struct LiveJoinAck [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::LiveJoinAck as u8;
        client_starting_time: u64;
        check_count: u8;
        live_join_start_time: u64;
        last_live_join_util_ticks: u32;
        nim_complete_state: NimCompleteState;
        world_complete_state: WorldCompleteState;
        supports_live_joining: bool;
        optional inside_info: InsideGameInfo, if supports_live_joining;
    }
}

packet! {
    /// Answer to a kart-info request; also pushed to all peers when a
    /// live joiner takes a reserved kart.
    pub struct KartInfo [LobbyRoom, sync = true, reliable = true] {
        fixed tag = MessageType::KartInfo as u8;
        live_join_util_ticks: u32;
        kart_id: u8;
        player_name: WideStr;
        host_id: u32;
        default_kart_color: f32;
        online_id: u32;
        handicap: u8;
        local_player_id: u8;
        kart_name: String;
        country_code: String;
        kart_data: KartData;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Packet;

    #[test]
    fn nim_state_round_trip() {
        let before = NimCompleteState {
            ticks_since_start: 1200,
            switch_ticks: 0,
            all_items: vec![
                ItemCompleteState {
                    has_item: true,
                    item_state: Some(ItemState {
                        item_type: 2,
                        original_type: 2,
                        ticks_till_return: 90,
                        item_id: 0,
                        deactive_ticks: 0,
                        used_up_counter: 0,
                        original_placement: Placement {
                            xyz: Vec3::new(10.0, 0.5, -3.0),
                            rotation: Quat::default(),
                        },
                        previous_owner: u8::MAX,
                    }),
                },
                ItemCompleteState {
                    has_item: false,
                    item_state: None,
                },
            ],
        };
        let after = NimCompleteState::from_bytes(&before.to_bytes()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn world_state_decodes_only_the_tagged_branch() {
        let soccer = WorldCompleteState {
            world_kind: 1,
            linear: None,
            soccer: Some(SoccerWorldCompleteState {
                red_scorers: vec![ScorerData {
                    id: 3,
                    correct_goal: true,
                    time: 41.5,
                    kart: "tux".to_string(),
                    player: WideStr::from("Ayla"),
                }],
                blue_scorers: vec![],
                reset_ball_ticks: 0,
                ticks_back_to_own_goal: 240,
            }),
            ffa: None,
            ctf: None,
        };
        let after = WorldCompleteState::from_bytes(&soccer.to_bytes()).unwrap();
        assert_eq!(after.world_kind, 1);
        assert!(after.linear.is_none());
        assert_eq!(after.soccer, soccer.soccer);
    }

    #[test]
    fn live_join_request_spectator_has_no_karts() {
        let request = LiveJoinRequest {
            is_spectator: true,
            player_karts: None,
        };
        let after = LiveJoinRequest::from_bytes(&request.to_bytes()).unwrap();
        assert!(after.is_spectator);
        assert_eq!(after.player_karts, None);
    }

    #[test]
    fn linear_world_shares_kart_count() {
        let before = LinearWorldCompleteState {
            fastest_lap_ticks: 3000,
            distance_increase: 0.0,
            kart_placements: vec![Placement::default(), Placement::default()],
            kart_infos: vec![KartRaceInfo::default(), KartRaceInfo::default()],
        };
        let after = LinearWorldCompleteState::from_bytes(&before.to_bytes()).unwrap();
        assert_eq!(after.kart_infos.len(), 2);
    }
}
