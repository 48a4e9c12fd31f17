use std::collections::HashSet;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::seq::IteratorRandom;
use rand::Rng;

use kartnet::game::{
    FfaWorldCompleteState, InsideGameInfo, KartInfo, KartRaceInfo, LinearWorldCompleteState,
    LiveJoinAck, LiveJoinRequest, NimCompleteState, Placement, SoccerWorldCompleteState,
    WorldCompleteState,
};
use kartnet::lobby::{
    Assets, DefaultVote, EncodedPlayer, GpIndividualScore, GpScores, KartData, LoadWorld,
    PeerVote, PointChanges, RaceFinished, StartGame, StartSelection,
};
use kartnet::GameMode;

use crate::config::{time_to_ticks, START_SAFETY_MARGIN_MS};
use crate::controller::facade::{Controller, PlayState, ResetState};
use crate::controller::filter::FilterContext;
use crate::controller::gp::GpFinisher;
use crate::controller::queue::LiveQueues;
use crate::controller::session::LiveSessions;
use crate::controller::settings::LiveSettings;
use crate::database::ResultRow;
use crate::race::{KartAssignment, RaceSetup};
use crate::task::AsyncTask;

/// Track geometry is loaded by an external collaborator; until its
/// real length arrives with the world, blue-flag math uses this
/// nominal value.
const NOMINAL_TRACK_LENGTH: f32 = 1000.0;

/// Wall-clock seconds a live joiner gets to load the world.
const LIVE_JOIN_LEAD_SECS: f32 = 2.0;

/// Default wall-clock limit for battle modes without a value target.
const BATTLE_TIME_LIMIT_SECS: f32 = 600.0;

fn epoch_ms_in(delay: Duration) -> u64 {
    (SystemTime::now() + delay)
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Controller {
    /// The candidate map set for the next match: the mode's maps,
    /// narrowed by the queued filters.
    pub(super) async fn available_maps(&self) -> HashSet<String> {
        let mut ctx = FilterContext {
            elements: self.assets.maps_for_mode(self.settings.mode().await),
            official: self.assets.official_maps().clone(),
            available: self.assets.server_maps().into_iter().collect(),
            num_players: self.sessions.lock().await.player_count(),
            ..Default::default()
        };
        let mut state = self.lobby_state_mut().await;
        let rng = &mut state.rng;
        self.queues.apply_front_map_filters(&mut ctx, rng).await;
        ctx.elements
    }

    /// Tournament rosters pin every profile's team (with the current
    /// match's colour swap) before selection begins.
    async fn apply_tournament_teams(&self) {
        let tournament = match &self.tournament {
            Some(t) => t,
            None => return,
        };
        let assignments: Vec<(u32, u8, kartnet::KartTeam)> = {
            let sessions = self.sessions.lock().await;
            let mut out = vec![];
            for peer in sessions.validated() {
                for profile in &peer.profiles {
                    let team = tournament.team_of(profile.name.as_str()).await;
                    out.push((peer.host_id, profile.local_player_id, team));
                }
            }
            out
        };
        let mut sessions = self.sessions.write().await;
        for (host_id, local_id, team) in assignments {
            crate::controller::team::TeamController::set_kart_team(
                &mut sessions,
                host_id,
                local_id,
                team,
            );
        }
    }

    /// One player's candidate karts, after the queued kart filters.
    async fn filtered_karts_for(&self, client_karts: &HashSet<String>) -> HashSet<String> {
        let server_karts: HashSet<String> = self.assets.server_karts().into_iter().collect();
        let mut ctx = FilterContext {
            elements: client_karts.intersection(&server_karts).cloned().collect(),
            official: self.assets.official_karts().clone(),
            available: server_karts,
            ..Default::default()
        };
        self.queues.apply_front_kart_filters(&mut ctx).await;
        ctx.elements
    }

    // ---- SELECTING ---------------------------------------------------------

    pub(super) async fn start_selection(&self) {
        self.apply_tournament_teams().await;
        self.refresh_lobby_roster().await;

        let maps = self.available_maps().await;
        if maps.is_empty() {
            log::error!("no maps survive the current filters; refusing to start selection");
            return;
        }
        let mut maps: Vec<String> = maps.into_iter().collect();
        maps.sort();

        self.votes.clear().await;
        {
            let mut state = self.lobby_state_mut().await;
            state.play_state = PlayState::Selecting;
            state.voting_ends_at = Some(
                Instant::now() + Duration::from_secs_f32(self.config.voting_timeout_secs),
            );
        }

        log::info!("entering selection with {} candidate map(s)", maps.len());
        self.broadcast(&StartSelection {
            voting_timeout: self.config.voting_timeout_secs,
            no_kart_selection: self.queues.kart_filters_ignore_input().await,
            fixed_length: self.config.fixed_lap_count > 0,
            track_voting: true,
            assets: Assets {
                karts: self.assets.server_karts(),
                maps,
            },
        })
        .await;
    }

    /// Ends the voting window: decide, coerce, and load the world.
    pub(super) async fn finish_vote(&self) {
        if self.play_state().await != PlayState::Selecting {
            return;
        }

        let decided = {
            let mut state = self.lobby_state_mut().await;
            // Split borrow: decide needs the rng, not the whole state.
            let mut rng = state.rng.clone();
            let decided = self.votes.decide(&mut rng).await;
            state.rng = rng;
            decided
        };

        let (winner_peer_id, mut vote) = match decided {
            Some(win) => win,
            None => {
                // Nobody voted: a random available map with defaults.
                let maps = self.available_maps().await;
                let mut names: Vec<String> = maps.into_iter().collect();
                names.sort();
                let track = {
                    let mut state = self.lobby_state_mut().await;
                    match names.into_iter().choose(&mut state.rng) {
                        Some(track) => track,
                        None => {
                            log::error!("no map available for the default vote");
                            self.reset_lobby().await;
                            return;
                        }
                    }
                };
                (0, self.settings.default_vote_for(&track, &self.assets).await)
            }
        };
        self.settings.coerce_vote(&mut vote, &self.assets).await;
        log::info!(
            "vote decided: {} ({} laps, reverse {}) from host {}",
            vote.track_name,
            vote.num_laps,
            vote.reverse,
            winner_peer_id
        );

        self.load_world(winner_peer_id, vote).await;
    }

    // ---- LOAD_WORLD --------------------------------------------------------

    async fn load_world(&self, winner_peer_id: u32, vote: PeerVote) {
        {
            let mut state = self.lobby_state_mut().await;
            state.play_state = PlayState::LoadWorld;
            state.voting_ends_at = None;
        }

        let playing = {
            let sessions = self.sessions.lock().await;
            self.crown.playing_peers(&sessions).await
        };
        if playing.is_empty() {
            log::warn!("no peer can race; returning to the lobby");
            self.reset_lobby().await;
            return;
        }

        // Kart assignments: the player's pick when the filters allow
        // it, otherwise a draw from their filtered set.
        let mut assignments = vec![];
        {
            let sessions = self.sessions.lock().await;
            for host_id in &playing {
                let peer = match sessions.by_host_id(*host_id) {
                    Some(p) => p,
                    None => continue,
                };
                let allowed = self.filtered_karts_for(&peer.client_karts).await;
                for profile in &peer.profiles {
                    let kart_name = if allowed.contains(&profile.kart_name) {
                        profile.kart_name.clone()
                    } else {
                        let ctx = FilterContext {
                            elements: allowed.clone(),
                            ..Default::default()
                        };
                        let mut state = self.lobby_state_mut().await;
                        let queues = self.queues.lock().await;
                        let front = queues.onetime_kart_queue.front();
                        match front {
                            Some(filter) => filter
                                .pick_for_empty_choice(&ctx, &mut state.rng)
                                .unwrap_or_else(|| "tux".to_string()),
                            None => {
                                let mut names: Vec<&String> = ctx.elements.iter().collect();
                                names.sort();
                                names
                                    .into_iter()
                                    .choose(&mut state.rng)
                                    .cloned()
                                    .unwrap_or_else(|| "tux".to_string())
                            }
                        }
                    };
                    assignments.push(KartAssignment {
                        host_id: Some(*host_id),
                        local_player_id: profile.local_player_id,
                        name: profile.name.clone(),
                        kart_name,
                        kart_team: profile.kart_team,
                        handicap: profile.handicap,
                        online_id: profile.online_id,
                        country_code: profile.country_code.clone(),
                        kart_color: profile.kart_color,
                    });
                }
            }
        }

        let item_seed: u32 = self.lobby_state_mut().await.rng.gen();
        let (mode, difficulty) = {
            let settings = self.settings.lock().await;
            (settings.mode, settings.difficulty)
        };
        let setup = RaceSetup {
            mode,
            difficulty,
            track: vote.track_name.clone(),
            laps: vote.num_laps,
            reverse: vote.reverse,
            time_limit: if mode.is_battle() {
                BATTLE_TIME_LIMIT_SECS
            } else {
                0.0
            },
            value_limit: if mode.is_battle() { vote.num_laps as u32 } else { 0 },
            item_seed,
            track_length: NOMINAL_TRACK_LENGTH,
            assignments: assignments.clone(),
            ai_count: 0,
        };

        // Bucket peers: racers in, everyone else parked for this match.
        {
            let mut sessions = self.sessions.write().await;
            let racing: HashSet<u32> = playing.iter().copied().collect();
            let handles: Vec<_> = sessions.iter().map(|s| s.handle).collect();
            for handle in handles {
                if let Some(session) = sessions.session_mut(handle) {
                    if session.validated {
                        session.waiting_for_game = !racing.contains(&session.host_id);
                    }
                }
            }
        }

        let default_vote = DefaultVote {
            winner_peer_id,
            vote,
        };
        let all_players: Vec<EncodedPlayer> =
            assignments.iter().map(encoded_player).collect();
        let players_kart_data = vec![KartData::default(); all_players.len()];

        {
            let mut state = self.lobby_state_mut().await;
            state.world = Some(self.new_world(setup));
            state.default_vote = Some(default_vote.clone());
            state.load_world_pending = playing.iter().copied().collect();
            state.play_state = PlayState::WaitForWorldLoaded;
            state.world_load_deadline = Some(
                Instant::now() + Duration::from_secs_f32(self.config.world_load_timeout_secs),
            );
        }

        self.broadcast(&LoadWorld {
            default_vote,
            live_join: false,
            all_players,
            item_seed,
            is_battle: mode.is_battle(),
            battle_info: None,
            players_kart_data,
        })
        .await;
    }

    // ---- WAIT_FOR_RACE_STARTED ---------------------------------------------

    /// All peers acked (or were dropped): agree on the absolute start
    /// instant `now + max(half RTT) + safety margin`.
    pub(super) async fn schedule_race_start(&self) {
        if self.play_state().await != PlayState::WaitForWorldLoaded {
            return;
        }

        let max_half_rtt_ms = {
            let sessions = self.sessions.lock().await;
            sessions
                .validated()
                .filter(|s| !s.waiting_for_game)
                .map(|s| s.ping_ms as u64 / 2)
                .max()
                .unwrap_or(0)
        };
        let delay = Duration::from_millis(max_half_rtt_ms + START_SAFETY_MARGIN_MS);
        let start_at_epoch_ms = epoch_ms_in(delay);

        {
            let mut state = self.lobby_state_mut().await;
            state.play_state = PlayState::WaitForRaceStarted;
            state.world_load_deadline = None;
            state.start_at = Some(Instant::now() + delay);
            state.start_at_epoch_ms = start_at_epoch_ms;
        }

        log::info!("race scheduled to start in {:?}", delay);
        self.broadcast(&StartGame {
            start_time: start_at_epoch_ms,
            check_count: 0,
            item_complete_state: Default::default(),
        })
        .await;
    }

    // ---- RESULT_DISPLAY ----------------------------------------------------

    /// The finish criterion was met: flush race protocols and show the
    /// results.
    pub(super) async fn enter_result_display(&self) {
        {
            let mut state = self.lobby_state_mut().await;
            if state.play_state != PlayState::Racing {
                return;
            }
            // All in-race protocols stop before the result screen.
            state.play_state = PlayState::WaitForRaceStopped;
        }

        let (ranking, fastest_lap_ms, fastest_name, track, laps, reverse, is_linear) = {
            let state = self.lobby_state().await;
            let world = match state.world.as_ref() {
                Some(w) => w,
                None => return,
            };
            let order = world.final_ranking();
            let ranking: Vec<(usize, crate::race::KartInstance)> = order
                .iter()
                .map(|&kart_id| (kart_id, world.karts[kart_id].clone()))
                .collect();
            let fastest_name = world
                .fastest_lap_kart
                .and_then(|id| world.setup.assignments.get(id))
                .map(|a| a.name.clone());
            (
                ranking,
                world.fastest_lap_ms,
                fastest_name,
                world.setup.track.clone(),
                world.setup.laps,
                world.setup.reverse,
                world.setup.mode.is_linear(),
            )
        };

        // Grand prix accumulation and per-player point deltas.
        let gp_finishers = self.gp_finishers_from(&ranking).await;
        let point_changes = if self.gp.is_active() {
            self.gp.after_race(&track, &gp_finishers).await
        } else {
            vec![0; gp_finishers.len()]
        };

        let gp_scores = if self.gp.is_active() {
            use crate::controller::gp::LiveGpScores;
            let standings = self.gp.standings().await;
            let state = self.gp.lock().await;
            Some(GpScores {
                total_gp_tracks: self.gp.track_count,
                all_tracks: state.tracks_done.clone(),
                scores: standings
                    .iter()
                    .map(|(_, score)| GpIndividualScore {
                        last_score: 0,
                        cur_score: score.points.max(0) as u32,
                        overall_time: score.accumulated_time,
                    })
                    .collect(),
            })
        } else {
            None
        };

        // Persist per-player results.
        if self.config.store_results {
            let rows = self.result_rows_from(&ranking, &track, laps, reverse).await;
            self.enqueue(AsyncTask::WriteResults(rows));
        }

        let ack_pending: HashSet<u32> = {
            let sessions = self.sessions.lock().await;
            sessions
                .validated()
                .filter(|s| !s.waiting_for_game)
                .map(|s| s.host_id)
                .collect()
        };

        {
            let mut state = self.lobby_state_mut().await;
            state.play_state = PlayState::ResultDisplay;
            state.result_ack_pending = ack_pending;
            state.result_ack_deadline = Some(
                Instant::now() + Duration::from_secs_f32(self.config.result_ack_timeout_secs),
            );
        }

        self.broadcast(&RaceFinished {
            is_linear,
            fastest_lap: if is_linear { fastest_lap_ms } else { None },
            fastest_kart_name: if is_linear { fastest_name } else { None },
            is_gp: gp_scores.is_some(),
            gp_scores,
            point_changes_indication: self.gp.is_active(),
            point_changes: PointChanges {
                changes: point_changes.iter().map(|p| *p as f32).collect(),
            },
        })
        .await;
    }

    async fn gp_finishers_from(
        &self,
        ranking: &[(usize, crate::race::KartInstance)],
    ) -> Vec<GpFinisher> {
        let state = self.lobby_state().await;
        let world = match state.world.as_ref() {
            Some(w) => w,
            None => return vec![],
        };
        ranking
            .iter()
            .enumerate()
            .map(|(pos, (kart_id, kart))| {
                let assignment = &world.setup.assignments[*kart_id];
                GpFinisher {
                    player_name: assignment.name.as_str().to_string(),
                    team: assignment.kart_team,
                    position: pos + 1,
                    time: kart.finish_time.unwrap_or(world.elapsed_time),
                    set_fastest_lap: world.fastest_lap_kart == Some(*kart_id),
                    on_pole: *kart_id == 0,
                }
            })
            .collect()
    }

    async fn result_rows_from(
        &self,
        ranking: &[(usize, crate::race::KartInstance)],
        track: &str,
        laps: u8,
        reverse: bool,
    ) -> Vec<ResultRow> {
        let state = self.lobby_state().await;
        let world = match state.world.as_ref() {
            Some(w) => w,
            None => return vec![],
        };
        ranking
            .iter()
            .map(|(kart_id, kart)| {
                let assignment = &world.setup.assignments[*kart_id];
                ResultRow {
                    username: assignment.name.as_str().to_string(),
                    venue: track.to_string(),
                    reverse,
                    laps,
                    result: if world.setup.mode.is_linear() {
                        kart.finish_time.unwrap_or(0.0) as f64
                    } else {
                        kart.score as f64
                    },
                    kart: assignment.kart_name.clone(),
                    kart_team: assignment.kart_team,
                    handicap: assignment.handicap,
                    start_position: *kart_id as u8,
                    fastest_lap_ms: kart.best_lap_ms,
                    join_time: chrono::Utc::now().naive_utc(),
                    leave_time: None,
                }
            })
            .collect()
    }

    // ---- RESET -------------------------------------------------------------

    /// Two-phase reset. Phase one tears the world down synchronously;
    /// phase two rebuilds lobby state on the async worker. Idempotent
    /// on an already-idle lobby.
    pub(super) async fn reset_lobby(&self) {
        let played_map = {
            let mut state = self.lobby_state_mut().await;
            let already_idle = state.world.is_none()
                && state.play_state == PlayState::WaitingForStartGame
                && state.reset_state == ResetState::None;
            if already_idle {
                return;
            }
            state.reset_state = ResetState::Waiting;

            let played_map = state.world.as_ref().map(|w| w.setup.track.clone());
            state.world = None;
            state.default_vote = None;
            state.play_state = PlayState::WaitingForStartGame;
            state.voting_ends_at = None;
            state.world_load_deadline = None;
            state.result_ack_deadline = None;
            state.start_at = None;
            state.start_at_epoch_ms = 0;
            state.last_tick = None;
            state.load_world_pending.clear();
            state.result_ack_pending.clear();
            played_map
        };

        self.votes.clear().await;

        // Racers keep their slot booked for the next match; everyone
        // rejoins the lobby bucket.
        {
            let mut sessions = self.sessions.write().await;
            let handles: Vec<_> = sessions.iter().map(|s| s.handle).collect();
            for handle in handles {
                if let Some(session) = sessions.session_mut(handle) {
                    session.slot_booked = session.validated && !session.waiting_for_game;
                    session.waiting_for_game = false;
                }
            }
        }

        if let Some(map) = &played_map {
            self.queues.pop_on_race_finished(map).await;
            if let Some(t) = &self.tournament {
                t.on_race_finished(map).await;
            }
        }

        {
            let mut state = self.lobby_state_mut().await;
            state.reset_state = ResetState::AsyncReset;
        }
        self.enqueue(AsyncTask::ResetPhaseTwo);
        log::info!("lobby reset: phase one done, phase two queued");
    }

    /// Completion of the asynchronous reset phase.
    pub(super) async fn finish_reset(&self) {
        {
            let mut state = self.lobby_state_mut().await;
            if state.reset_state != ResetState::AsyncReset {
                return;
            }
            state.reset_state = ResetState::None;
        }
        self.enqueue(AsyncTask::StoreHostIdCeiling(
            self.sessions.host_id_ceiling().await,
        ));
        self.refresh_lobby_roster().await;
        self.broadcast(&self.server_info_packet(false).await).await;
        self.broadcast(&self.config_server_packet().await).await;
        log::info!("lobby reset complete");
    }

    // ---- LIVE JOIN ---------------------------------------------------------

    /// Grants a live join when the world is active and has room,
    /// returning the authoritative snapshot; `None` means no place.
    pub(super) async fn try_live_join(
        &self,
        host_id: u32,
        packet: &LiveJoinRequest,
    ) -> Option<LiveJoinAck> {
        let mut kart_info = None;
        let ack = {
            let mut state = self.lobby_state_mut().await;
            let start_at_epoch_ms = state.start_at_epoch_ms;
            let world = state.world.as_mut()?;

            if !packet.is_spectator {
                if !world.setup.supports_live_joining() {
                    return None;
                }
                let kart_id = world.first_reserved_kart()?;
                world.occupy_kart(kart_id, host_id, 0);
                kart_info = Some(kart_id);
            }

            let supports_live_joining = world.setup.supports_live_joining();
            let elapsed_ticks = time_to_ticks(world.elapsed_time);
            let util_ticks = time_to_ticks(world.elapsed_time + LIVE_JOIN_LEAD_SECS);

            LiveJoinAck {
                client_starting_time: start_at_epoch_ms,
                check_count: 0,
                live_join_start_time: epoch_ms_in(Duration::from_secs_f32(LIVE_JOIN_LEAD_SECS)),
                last_live_join_util_ticks: util_ticks,
                nim_complete_state: NimCompleteState {
                    ticks_since_start: elapsed_ticks,
                    switch_ticks: 0,
                    all_items: vec![],
                },
                world_complete_state: world_complete_state(world),
                supports_live_joining,
                inside_info: if supports_live_joining {
                    Some(InsideGameInfo {
                        all_players: world
                            .setup
                            .assignments
                            .iter()
                            .map(encoded_player)
                            .collect(),
                        players_kart_data: vec![
                            KartData::default();
                            world.setup.assignments.len()
                        ],
                    })
                } else {
                    None
                },
            }
        };

        // Tell everyone which kart the joiner took.
        if let Some(kart_id) = kart_info {
            let packet = {
                let sessions = self.sessions.lock().await;
                let state = self.lobby_state().await;
                let world = state.world.as_ref()?;
                let peer = sessions.by_host_id(host_id)?;
                let profile = peer.main_profile()?;
                KartInfo {
                    live_join_util_ticks: ack.last_live_join_util_ticks,
                    kart_id: kart_id as u8,
                    player_name: profile.name.clone(),
                    host_id,
                    default_kart_color: profile.kart_color,
                    online_id: profile.online_id,
                    handicap: profile.handicap,
                    local_player_id: profile.local_player_id,
                    kart_name: world.karts[kart_id].kart_name.clone(),
                    country_code: profile.country_code.clone(),
                    kart_data: KartData::default(),
                }
            };
            self.broadcast(&packet).await;
        }

        Some(ack)
    }
}

fn encoded_player(assignment: &KartAssignment) -> EncodedPlayer {
    EncodedPlayer {
        name: assignment.name.clone(),
        host_id: assignment.host_id.unwrap_or(0),
        kart_color: assignment.kart_color,
        online_id: assignment.online_id,
        handicap: assignment.handicap,
        local_player_id: assignment.local_player_id,
        kart_team: assignment.kart_team,
        country_code: assignment.country_code.clone(),
        kart_name: assignment.kart_name.clone(),
    }
}

/// Authoritative per-mode world snapshot for a live joiner.
fn world_complete_state(world: &crate::race::RaceWorld) -> WorldCompleteState {
    match world.setup.mode {
        GameMode::NormalRace | GameMode::TimeTrial => WorldCompleteState {
            world_kind: 0,
            linear: Some(LinearWorldCompleteState {
                fastest_lap_ticks: world
                    .fastest_lap_ms
                    .map(|ms| time_to_ticks(ms as f32 / 1000.0))
                    .unwrap_or(u32::MAX),
                distance_increase: 0.0,
                kart_placements: world.karts.iter().map(|_| Placement::default()).collect(),
                kart_infos: world
                    .karts
                    .iter()
                    .map(|k| KartRaceInfo {
                        finished_laps: k.finished_laps.max(0) as u32,
                        ticks_at_last_lap: 0,
                        lap_start_ticks: 0,
                        estimated_finish: 0.0,
                        overall_distance: k.overall_distance,
                        wrong_way_timer: 0.0,
                    })
                    .collect(),
            }),
            soccer: None,
            ffa: None,
            ctf: None,
        },
        GameMode::Soccer => WorldCompleteState {
            world_kind: 1,
            linear: None,
            soccer: Some(SoccerWorldCompleteState {
                red_scorers: vec![],
                blue_scorers: vec![],
                reset_ball_ticks: 0,
                ticks_back_to_own_goal: 0,
            }),
            ffa: None,
            ctf: None,
        },
        GameMode::FreeForAll => WorldCompleteState {
            world_kind: 2,
            linear: None,
            soccer: None,
            ffa: Some(FfaWorldCompleteState {
                scores: world.karts.iter().map(|k| k.score).collect(),
            }),
            ctf: None,
        },
        GameMode::CaptureTheFlag => WorldCompleteState {
            world_kind: 3,
            linear: None,
            soccer: None,
            ffa: None,
            ctf: Some(kartnet::game::CtfWorldCompleteState {
                ffa: FfaWorldCompleteState {
                    scores: world.karts.iter().map(|k| k.score).collect(),
                },
                red_score: 0,
                blue_score: 0,
            }),
        },
    }
}
