use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio::sync::RwLock;

use kartnet::lobby::{DefaultVote, PlayerList, PlayerListProfile, ServerInfo};
use kartnet::{Packet, WideStr};

use crate::config::ServerConfig;
use crate::controller::assets::AssetManager;
use crate::controller::chat::ChatController;
use crate::controller::crown::CrownController;
use crate::controller::gp::{GpController, GpScoring};
use crate::controller::queue::QueueController;
use crate::controller::session::{LiveSessions, SessionController};
use crate::controller::settings::{LiveSettings, SettingsController};
use crate::controller::team::TeamController;
use crate::controller::tournament::{LiveTournament, TournamentController};
use crate::controller::vote::{VoteAlgorithm, VoteController};
use crate::database::{Database, DatabaseClient};
use crate::event::Event;
use crate::race::{CompoundTable, FuelParams, ItemPolicy, RaceWorld};
use crate::server::{send_packet, PeerHandle, Transport};
use crate::task::{spawn_worker, AsyncTask};

mod match_flow;
mod on_command;
mod on_message;
mod on_server_event;
mod tick;

/// Top-level lobby states. At most one non-idle match exists; its
/// state lives in [`LobbyState::world`] from `LOAD_WORLD` until reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayState {
    WaitingForStartGame,
    Selecting,
    LoadWorld,
    WaitForWorldLoaded,
    WaitForRaceStarted,
    Racing,
    WaitForRaceStopped,
    ResultDisplay,
}

/// Serialises the two-phase reset: the synchronous phase tears the
/// world down on the main loop, the asynchronous phase rebuilds lobby
/// state off the hot path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetState {
    None,
    Waiting,
    AsyncReset,
}

pub struct LobbyState {
    pub play_state: PlayState,
    pub reset_state: ResetState,
    pub world: Option<RaceWorld>,
    pub default_vote: Option<DefaultVote>,

    /// Deadline of the open voting window.
    pub voting_ends_at: Option<Instant>,
    /// Deadline for all peers to acknowledge world loading.
    pub world_load_deadline: Option<Instant>,
    /// Deadline after which missing `RaceFinishedAck`s count as given.
    pub result_ack_deadline: Option<Instant>,
    /// The agreed simultaneous start instant.
    pub start_at: Option<Instant>,
    /// Same instant on the wall clock, as sent to the clients.
    pub start_at_epoch_ms: u64,
    pub last_tick: Option<Instant>,

    /// Host ids yet to acknowledge world loading.
    pub load_world_pending: HashSet<u32>,
    /// Host ids yet to acknowledge the result screen.
    pub result_ack_pending: HashSet<u32>,

    /// Crown holder last announced via `ServerOwnership`.
    pub last_crown: Option<u32>,

    /// Server-instance generator; per-match item seeds are drawn from
    /// it, and replays reuse those seeds.
    pub rng: StdRng,
}

/// This facade hides all specific controllers behind one interface
/// that can react to transport events, worker completions and ticks.
#[derive(Clone)]
pub struct Controller {
    pub server: Arc<dyn Transport>,
    pub db: DatabaseClient,
    pub config: Arc<ServerConfig>,
    pub assets: Arc<AssetManager>,
    pub sessions: SessionController,
    pub crown: CrownController,
    pub teams: TeamController,
    pub chat: ChatController,
    pub votes: VoteController,
    pub gp: GpController,
    pub queues: QueueController,
    pub settings: SettingsController,
    pub tournament: Option<TournamentController>,
    tasks: mpsc::UnboundedSender<AsyncTask>,
    compound_table: Arc<CompoundTable>,
    fuel_params: FuelParams,
    item_policy: ItemPolicy,
    state: Arc<RwLock<LobbyState>>,
}

impl Controller {
    /// Wires every controller together and spawns the async worker,
    /// which posts its completions to `events`.
    pub async fn init(
        config: ServerConfig,
        server: Arc<dyn Transport>,
        db: DatabaseClient,
        events: mpsc::UnboundedSender<Event>,
    ) -> anyhow::Result<Controller> {
        db.migrate().await?;

        let assets = Arc::new(AssetManager::init(&config));
        let first_host_id = db.host_id_ceiling().await? + 1;
        let sessions = SessionController::init(first_host_id);
        let crown = CrownController::init(&config, &assets);
        let teams = TeamController::init(&config.categories);
        let chat = ChatController::init(&config);
        let votes = VoteController::init(VoteAlgorithm::from_config(config.map_vote_algorithm));
        let gp = GpController::init(GpScoring::parse(&config.gp_scoring)?, config.gp_track_count);
        let queues = QueueController::init(&config);
        let settings = SettingsController::init(&config);
        let tournament = if config.tournament.is_empty() {
            None
        } else {
            Some(TournamentController::parse(&config.tournament)?)
        };
        let item_policy = ItemPolicy::parse(&config.item_policy)?;
        let fuel_params = FuelParams::from_config(&config);
        let compound_table = Arc::new(CompoundTable::from_config(&config));

        let tasks = spawn_worker(db.clone(), events);

        let state = LobbyState {
            play_state: PlayState::WaitingForStartGame,
            reset_state: ResetState::None,
            world: None,
            default_vote: None,
            voting_ends_at: None,
            world_load_deadline: None,
            result_ack_deadline: None,
            start_at: None,
            start_at_epoch_ms: 0,
            last_tick: None,
            load_world_pending: HashSet::new(),
            result_ack_pending: HashSet::new(),
            last_crown: None,
            rng: StdRng::from_entropy(),
        };

        let controller = Controller {
            server,
            db,
            config: Arc::new(config),
            assets,
            sessions,
            crown,
            teams,
            chat,
            votes,
            gp,
            queues,
            settings,
            tournament,
            tasks,
            compound_table,
            fuel_params,
            item_policy,
            state: Arc::new(RwLock::new(state)),
        };
        Ok(controller)
    }

    /// One entry point for everything the main loop dequeues.
    pub async fn on_event(&self, event: Event) {
        match event {
            Event::Server(server_event) => self.on_server_event(server_event).await,
            Event::Task(outcome) => self.on_task_outcome(outcome).await,
            Event::Tick => self.on_tick(Instant::now()).await,
        }
    }

    pub async fn play_state(&self) -> PlayState {
        self.state.read().await.play_state
    }

    pub async fn reset_state(&self) -> ResetState {
        self.state.read().await.reset_state
    }

    /// The seam for the external physics integrator: mutable access to
    /// the authoritative world while a match is live.
    pub async fn with_world<T>(&self, f: impl FnOnce(&mut RaceWorld) -> T) -> Option<T> {
        let mut state = self.state.write().await;
        state.world.as_mut().map(f)
    }

    pub(crate) async fn lobby_state(&self) -> tokio::sync::RwLockReadGuard<'_, LobbyState> {
        self.state.read().await
    }

    pub(crate) async fn lobby_state_mut(&self) -> tokio::sync::RwLockWriteGuard<'_, LobbyState> {
        self.state.write().await
    }

    pub(crate) fn enqueue(&self, task: AsyncTask) {
        if self.tasks.send(task).is_err() {
            log::error!("async worker is gone; dropping task");
        }
    }

    pub(crate) async fn send_to_host<P: Packet>(&self, host_id: u32, packet: &P) {
        // The session may have disconnected since the handler started.
        if let Some(handle) = self.sessions.lock().await.handle_of(host_id) {
            send_packet(self.server.as_ref(), handle, packet).await;
        }
    }

    pub(crate) async fn broadcast<P: Packet>(&self, packet: &P) {
        for handle in self.sessions.validated_handles().await {
            send_packet(self.server.as_ref(), handle, packet).await;
        }
    }

    /// Rebuilds and broadcasts the player list everyone sees in the
    /// lobby.
    pub(crate) async fn broadcast_player_list(&self) {
        let game_started = !matches!(
            self.play_state().await,
            PlayState::WaitingForStartGame | PlayState::Selecting
        );
        let crown_holder = {
            let sessions = self.sessions.lock().await;
            self.crown.crown_holder(&sessions)
        };

        let mut all_profiles = vec![];
        {
            let sessions = self.sessions.lock().await;
            let mut peers: Vec<_> = sessions.validated().collect();
            peers.sort_by_key(|p| p.host_id);
            for peer in peers {
                for profile in &peer.profiles {
                    let mut mask = 1u8;
                    if peer.is_spectator() {
                        mask |= 1 << 1;
                    }
                    if Some(peer.host_id) == crown_holder {
                        mask |= 1 << 2;
                    }
                    if peer.is_ai {
                        mask |= 1 << 3;
                    }
                    all_profiles.push(PlayerListProfile {
                        host_id: peer.host_id,
                        online_id: profile.online_id,
                        local_player_id: profile.local_player_id,
                        profile_name: profile.name.clone(),
                        mask,
                        handicap: profile.handicap,
                        kart_team: profile.kart_team,
                        country_code: profile.country_code.clone(),
                    });
                }
            }
        }

        self.broadcast(&PlayerList {
            game_started,
            all_profiles,
        })
        .await;
    }

    pub(crate) async fn server_info_packet(&self, game_started: bool) -> ServerInfo {
        let settings = self.settings.lock().await;
        ServerInfo {
            name: WideStr::from(self.config.server_name.as_str()),
            mode: settings.mode,
            difficulty: settings.difficulty,
            max_players: self.config.max_players as u8,
            password_protected: !self.config.password.is_empty(),
            game_started,
        }
    }

    /// Refreshes who may play and who holds the crown, then shares the
    /// new list.
    pub(crate) async fn refresh_lobby_roster(&self) {
        let mode = self.settings.mode().await;
        {
            let sessions = self.sessions.lock().await;
            match &self.tournament {
                Some(t) => {
                    // Resolve the roster before taking the verdicts, so
                    // the closure below stays synchronous.
                    let mut playable = HashSet::new();
                    for peer in sessions.validated() {
                        let name = peer.main_name();
                        if t.can_play(&name).await {
                            playable.insert(name);
                        }
                    }
                    self.crown
                        .update(&sessions, mode, |name| playable.contains(name))
                        .await;
                }
                None => {
                    self.crown.update(&sessions, mode, |_| true).await;
                }
            }
        }
        self.broadcast_player_list().await;
        self.announce_crown_if_changed().await;
    }

    /// Tells a peer it just gained host rights.
    async fn announce_crown_if_changed(&self) {
        let holder = {
            let sessions = self.sessions.lock().await;
            self.crown.crown_holder(&sessions)
        };
        let changed = {
            let mut state = self.state.write().await;
            let changed = state.last_crown != holder;
            state.last_crown = holder;
            changed
        };
        if changed {
            if let Some(holder) = holder {
                log::debug!("crown passed to host {}", holder);
                self.send_to_host(holder, &kartnet::lobby::ServerOwnership {})
                    .await;
            }
        }
    }

    pub(crate) async fn config_server_packet(&self) -> kartnet::lobby::ConfigServer {
        let settings = self.settings.lock().await;
        kartnet::lobby::ConfigServer {
            difficulty: settings.difficulty,
            game_mode: settings.mode,
            soccer_goal_target: settings.mode == kartnet::GameMode::Soccer,
        }
    }

    pub(crate) fn new_world(&self, setup: crate::race::RaceSetup) -> RaceWorld {
        RaceWorld::new(
            setup,
            self.item_policy.clone(),
            self.compound_table.clone(),
            self.fuel_params,
            self.config.tyre_queue.clone(),
        )
    }

    pub(crate) async fn kick_with_reason(
        &self,
        handle: PeerHandle,
        reason: kartnet::BackLobbyReason,
    ) {
        send_packet(
            self.server.as_ref(),
            handle,
            &kartnet::lobby::BackLobby { reason },
        )
        .await;
        self.server.kick(handle).await;
    }
}
