//! Builders shared by the unit tests and the integration suite.

use std::collections::HashSet;
use std::time::Instant;

use crate::config::ServerConfig;
use crate::controller::assets::AssetManager;
use crate::controller::session::{PeerSession, PlayerProfile, SpectateMode};
use crate::server::PeerHandle;

/// A config that passes validation.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        official_karts: vec!["tux".into(), "konqi".into(), "adiumy".into()],
        official_maps: vec!["hacienda".into(), "oasis".into(), "volcano".into()],
        ..Default::default()
    }
}

/// A validated single-profile session with the given client assets and
/// audit-derived addon counts.
pub fn peer_with_assets(karts: &[&str], maps: &[&str], assets: &AssetManager) -> PeerSession {
    let client_karts: HashSet<String> = karts.iter().map(|s| s.to_string()).collect();
    let client_maps: HashSet<String> = maps.iter().map(|s| s.to_string()).collect();
    let audit = assets.audit(&client_karts, &client_maps);
    PeerSession {
        handle: PeerHandle(0),
        host_id: 0,
        address: "127.0.0.1:2759".parse().unwrap(),
        validated: true,
        spectate_mode: SpectateMode::None,
        waiting_for_game: false,
        capabilities: HashSet::new(),
        client_karts,
        client_maps,
        addon_counts: audit.addon_counts,
        profiles: vec![PlayerProfile::new("tester", 0, 0)],
        user_version: String::new(),
        is_ai: false,
        ping_ms: 0,
        packet_loss: 0.0,
        connected_at: chrono::Utc::now().naive_utc(),
        last_activity: Instant::now(),
        last_chat: None,
        consecutive_messages: 0,
        chat_offences: 0,
        decode_failures: 0,
        slot_booked: false,
        rejoin_seq: 0,
    }
}

/// Same, with identity fields a test can pick.
pub fn named_peer(
    handle: u64,
    host_id: u32,
    name: &str,
    assets: &AssetManager,
) -> PeerSession {
    let mut peer = peer_with_assets(
        &["tux", "konqi", "adiumy"],
        &["hacienda", "oasis", "volcano"],
        assets,
    );
    peer.handle = PeerHandle(handle);
    peer.host_id = host_id;
    peer.rejoin_seq = host_id as u64;
    peer.profiles = vec![PlayerProfile::new(name, 0, 0)];
    peer
}
