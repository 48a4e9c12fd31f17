use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use kartnet::{KartTeam, WideStr};

use crate::server::PeerHandle;

/// One split-screen player of a peer. The first profile is the "main"
/// profile used for identity checks.
#[derive(Clone, Debug)]
pub struct PlayerProfile {
    pub name: WideStr,
    /// 0 means an offline (non-authenticated) player.
    pub online_id: u32,
    pub local_player_id: u8,
    pub kart_color: f32,
    pub kart_team: KartTeam,
    /// Arbitrary indexed team used by team games beyond red/blue.
    pub temp_team: Option<u8>,
    pub handicap: u8,
    pub country_code: String,
    pub kart_name: String,
    pub score: i32,
    pub overall_time: f32,
}

impl PlayerProfile {
    pub fn new(name: &str, online_id: u32, local_player_id: u8) -> Self {
        PlayerProfile {
            name: WideStr::from(name),
            online_id,
            local_player_id,
            kart_color: 0.0,
            kart_team: KartTeam::None,
            temp_team: None,
            handicap: 0,
            country_code: String::new(),
            kart_name: String::new(),
            score: 0,
            overall_time: 0.0,
        }
    }
}

/// Why (and whether) a peer is forced to spectate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpectateMode {
    None,
    /// Self-imposed via command; excluded from crown ordering.
    Command,
    /// Excluded from this match by the player limit.
    ByLimit,
}

/// Addon intersection counts cached at handshake time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AddonCounts {
    pub karts: usize,
    pub tracks: usize,
    pub arenas: usize,
    pub soccers: usize,
}

/// Per-connection record. Created on transport accept, destroyed on
/// disconnect; `validated` flips once the identity handshake completes.
#[derive(Clone, Debug)]
pub struct PeerSession {
    pub handle: PeerHandle,
    pub host_id: u32,
    pub address: SocketAddr,
    pub validated: bool,
    pub spectate_mode: SpectateMode,
    /// Connected while a match runs; bucketed apart from racers.
    pub waiting_for_game: bool,
    pub capabilities: HashSet<String>,
    pub client_karts: HashSet<String>,
    pub client_maps: HashSet<String>,
    pub addon_counts: AddonCounts,
    pub profiles: Vec<PlayerProfile>,
    pub user_version: String,
    pub is_ai: bool,

    pub ping_ms: u32,
    pub packet_loss: f32,
    pub connected_at: NaiveDateTime,
    pub last_activity: Instant,
    pub last_chat: Option<Instant>,
    pub consecutive_messages: u32,
    pub chat_offences: u32,
    pub decode_failures: u32,

    /// Was racing in the previous match and has not left since.
    pub slot_booked: bool,
    /// Join order; later (re)joins sort after earlier ones.
    pub rejoin_seq: u64,
}

impl PeerSession {
    pub fn main_profile(&self) -> Option<&PlayerProfile> {
        self.profiles.first()
    }

    pub fn main_name(&self) -> String {
        self.main_profile()
            .map(|p| p.name.as_str().to_string())
            .unwrap_or_default()
    }

    pub fn update_last_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_spectator(&self) -> bool {
        self.spectate_mode != SpectateMode::None
    }

    /// Validated, not spectating and not parked for the next game.
    pub fn can_be_assigned(&self) -> bool {
        self.validated && !self.is_spectator() && !self.waiting_for_game
    }
}

pub struct SessionsState {
    by_handle: HashMap<PeerHandle, PeerSession>,
    host_id_to_handle: HashMap<u32, PeerHandle>,
    /// Next host id to hand out; never reused within a run and seeded
    /// from the persisted ceiling across runs.
    next_host_id: u32,
    next_rejoin_seq: u64,
}

impl SessionsState {
    pub fn new(first_host_id: u32) -> Self {
        SessionsState {
            by_handle: HashMap::new(),
            host_id_to_handle: HashMap::new(),
            next_host_id: first_host_id,
            next_rejoin_seq: 0,
        }
    }

    pub fn session(&self, handle: PeerHandle) -> Option<&PeerSession> {
        self.by_handle.get(&handle)
    }

    pub fn session_mut(&mut self, handle: PeerHandle) -> Option<&mut PeerSession> {
        self.by_handle.get_mut(&handle)
    }

    pub fn by_host_id(&self, host_id: u32) -> Option<&PeerSession> {
        self.host_id_to_handle
            .get(&host_id)
            .and_then(|h| self.by_handle.get(h))
    }

    pub fn handle_of(&self, host_id: u32) -> Option<PeerHandle> {
        self.host_id_to_handle.get(&host_id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerSession> {
        self.by_handle.values()
    }

    pub fn validated(&self) -> impl Iterator<Item = &PeerSession> {
        self.by_handle.values().filter(|s| s.validated)
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }

    /// Total player profiles across validated peers.
    pub fn player_count(&self) -> usize {
        self.validated().map(|s| s.profiles.len()).sum()
    }

    /// Inserts a fully-built session, keeping the id maps and the
    /// monotonic counters consistent.
    pub fn insert_session(&mut self, session: PeerSession) {
        self.next_host_id = self.next_host_id.max(session.host_id + 1);
        self.next_rejoin_seq = self.next_rejoin_seq.max(session.rejoin_seq + 1);
        self.host_id_to_handle
            .insert(session.host_id, session.handle);
        self.by_handle.insert(session.handle, session);
    }

    /// Whether the given online id is already in use by a connected
    /// peer. Offline players (id 0) are never considered duplicates.
    pub fn online_id_in_use(&self, online_id: u32) -> bool {
        online_id != 0
            && self
                .by_handle
                .values()
                .flat_map(|s| s.profiles.iter())
                .any(|p| p.online_id == online_id)
    }
}

/// Use to look up connected peers.
#[async_trait]
pub trait LiveSessions: Send + Sync {
    /// While holding this guard, the state is read-only, and can be
    /// referenced.
    async fn lock(&self) -> RwLockReadGuard<'_, SessionsState>;

    async fn session(&self, handle: PeerHandle) -> Option<PeerSession> {
        self.lock().await.session(handle).cloned()
    }

    async fn by_host_id(&self, host_id: u32) -> Option<PeerSession> {
        self.lock().await.by_host_id(host_id).cloned()
    }

    async fn handles(&self) -> Vec<PeerHandle> {
        self.lock().await.iter().map(|s| s.handle).collect()
    }

    async fn validated_handles(&self) -> Vec<PeerHandle> {
        self.lock().await.validated().map(|s| s.handle).collect()
    }
}

#[derive(Clone)]
pub struct SessionController {
    state: Arc<RwLock<SessionsState>>,
}

impl SessionController {
    /// `first_host_id` continues the persisted high-water mark, so ids
    /// stay unique across server restarts.
    pub fn init(first_host_id: u32) -> Self {
        SessionController {
            state: Arc::new(RwLock::new(SessionsState::new(first_host_id.max(1)))),
        }
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, SessionsState> {
        self.state.write().await
    }

    /// Registers a freshly accepted connection and assigns its host id.
    pub async fn add_incoming(&self, handle: PeerHandle, address: SocketAddr) -> u32 {
        let mut state = self.state.write().await;
        let host_id = state.next_host_id;
        state.next_host_id += 1;
        let rejoin_seq = state.next_rejoin_seq;
        state.next_rejoin_seq += 1;

        let session = PeerSession {
            handle,
            host_id,
            address,
            validated: false,
            spectate_mode: SpectateMode::None,
            waiting_for_game: false,
            capabilities: HashSet::new(),
            client_karts: HashSet::new(),
            client_maps: HashSet::new(),
            addon_counts: AddonCounts::default(),
            profiles: vec![],
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
            rejoin_seq,
        };
        state.by_handle.insert(handle, session);
        state.host_id_to_handle.insert(host_id, handle);
        host_id
    }

    pub async fn remove(&self, handle: PeerHandle) -> Option<PeerSession> {
        let mut state = self.state.write().await;
        let session = state.by_handle.remove(&handle)?;
        state.host_id_to_handle.remove(&session.host_id);
        Some(session)
    }

    /// Highest id issued so far, for persisting across runs.
    pub async fn host_id_ceiling(&self) -> u32 {
        self.state.read().await.next_host_id.saturating_sub(1)
    }
}

#[async_trait]
impl LiveSessions for SessionController {
    async fn lock(&self) -> RwLockReadGuard<'_, SessionsState> {
        self.state.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:2759".parse().unwrap()
    }

    #[tokio::test]
    async fn host_ids_are_monotonic_and_never_reused() {
        let sessions = SessionController::init(5);
        let a = sessions.add_incoming(PeerHandle(1), addr()).await;
        let b = sessions.add_incoming(PeerHandle(2), addr()).await;
        assert_eq!((a, b), (5, 6));

        sessions.remove(PeerHandle(1)).await.unwrap();
        let c = sessions.add_incoming(PeerHandle(3), addr()).await;
        assert_eq!(c, 7);
        assert_eq!(sessions.host_id_ceiling().await, 7);
    }

    #[tokio::test]
    async fn lookup_by_host_id_follows_removal() {
        let sessions = SessionController::init(1);
        let id = sessions.add_incoming(PeerHandle(9), addr()).await;
        assert!(sessions.by_host_id(id).await.is_some());
        sessions.remove(PeerHandle(9)).await.unwrap();
        assert!(sessions.by_host_id(id).await.is_none());
    }

    #[tokio::test]
    async fn duplicate_online_ids_are_detected() {
        let sessions = SessionController::init(1);
        sessions.add_incoming(PeerHandle(1), addr()).await;
        {
            let mut state = sessions.write().await;
            let s = state.session_mut(PeerHandle(1)).unwrap();
            s.validated = true;
            s.profiles.push(PlayerProfile::new("ayla", 42, 0));
        }
        let state = sessions.lock().await;
        assert!(state.online_id_in_use(42));
        assert!(!state.online_id_in_use(43));
        assert!(!state.online_id_in_use(0));
    }
}
