//! End-to-end lobby scenarios against the mock transport and the mock
//! database: connect, vote, race, finish, reset.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc;

use kartnet::lobby::{
    Assets, Chat, ConfigServer, ConnectionAccepted, ConnectionRefused, ConnectionRequested,
    LoadWorld, PeerVote, PlayerList, RaceFinished, RaceFinishedAck, RequestBegin,
    RequestedPlayer, StartGame, StartSelection, VoteRequest,
};
use kartnet::game::LiveJoinRequest;
use kartnet::lobby::BackLobby;
use kartnet::{BackLobbyReason, Channel, ChatStr, GameMode, Packet, RejectReason, WideStr};

use marshal::config::{ServerConfig, PROTOCOL_VERSION};
use marshal::controller::{Controller, PlayState, ResetState};
use marshal::database::{Database, DatabaseClient, MockDatabase};
use marshal::event::Event;
use marshal::server::{MockTransport, PeerHandle, ServerEvent, Transport};

struct Harness {
    controller: Controller,
    transport: MockTransport,
    db: MockDatabase,
    events: mpsc::UnboundedReceiver<Event>,
}

impl Harness {
    async fn new(config: ServerConfig) -> Result<Harness> {
        let _ = env_logger::builder().is_test(true).try_init();
        let transport = MockTransport::new();
        let db = MockDatabase::new();
        let (events_tx, events) = mpsc::unbounded_channel();
        let controller = Controller::init(
            config,
            Arc::new(transport.clone()) as Arc<dyn Transport>,
            DatabaseClient::Mock(db.clone()),
            events_tx,
        )
        .await?;
        Ok(Harness {
            controller,
            transport,
            db,
            events,
        })
    }

    /// Processes worker completions until the queue stays quiet.
    async fn pump(&mut self) {
        loop {
            let next = tokio::time::timeout(Duration::from_millis(50), self.events.recv()).await;
            match next {
                Ok(Some(event)) => self.controller.on_event(event).await,
                _ => break,
            }
        }
    }

    async fn deliver(&self, handle: PeerHandle, channel: Channel, payload: Vec<u8>) {
        self.controller
            .on_event(Event::Server(ServerEvent::Packet {
                handle,
                channel,
                payload,
            }))
            .await;
    }

    async fn connect(&self, id: u64, name: &str) -> PeerHandle {
        self.connect_with(id, name, None).await
    }

    async fn connect_with(&self, id: u64, name: &str, password: Option<&str>) -> PeerHandle {
        let handle = PeerHandle(id);
        self.controller
            .on_event(Event::Server(ServerEvent::PeerConnected {
                handle,
                address: format!("10.0.0.{}:2759", id).parse().unwrap(),
            }))
            .await;

        let request = ConnectionRequested {
            protocol_version: PROTOCOL_VERSION,
            user_version: "1.4".to_string(),
            capabilities: vec!["live_join".to_string()],
            assets: Assets {
                karts: vec!["tux".into(), "konqi".into(), "adiumy".into()],
                maps: vec!["hacienda".into(), "oasis".into(), "volcano".into()],
            },
            players: vec![RequestedPlayer {
                name: WideStr::from(name),
                handicap: 0,
                kart_color: 0.0,
                country_code: "DE".to_string(),
            }],
            online_id: 0,
            encrypted_size: password.map(|_| 1).unwrap_or(0),
            password_hash: password.map(|p| p.to_string()),
        };
        self.deliver(handle, Channel::Connection, request.to_bytes())
            .await;
        handle
    }

    async fn disconnect(&self, handle: PeerHandle) {
        self.controller
            .on_event(Event::Server(ServerEvent::PeerDisconnected { handle }))
            .await;
    }

    async fn vote(&self, handle: PeerHandle, track: &str, laps: u8, reverse: bool) {
        let request = VoteRequest {
            vote: PeerVote {
                player_name: Default::default(),
                track_name: track.to_string(),
                num_laps: laps,
                reverse,
            },
        };
        self.deliver(handle, Channel::LobbyRoom, request.to_bytes())
            .await;
    }

    /// Runs a whole lapped race to completion by feeding lap crossings
    /// through the physics seam.
    async fn run_race_to_finish(&self, crossings: &[(usize, f32)]) {
        for (kart_id, dt) in crossings {
            self.controller
                .with_world(|world| {
                    world.tick(*dt);
                    world.on_lap_crossed(*kart_id);
                })
                .await
                .expect("world should be live");
        }
        // The next tick notices the finish criterion.
        self.controller.on_tick(Instant::now()).await;
    }
}

fn test_config() -> ServerConfig {
    ServerConfig {
        official_karts: vec!["tux".into(), "konqi".into(), "adiumy".into()],
        official_maps: vec!["hacienda".into(), "oasis".into(), "volcano".into()],
        voting_timeout_secs: 5.0,
        ..Default::default()
    }
}

/// Walks three connected peers through selection, voting and loading,
/// up to the simultaneous start.
async fn start_three_player_race(h: &mut Harness) -> (PeerHandle, PeerHandle, PeerHandle) {
    let a = h.connect(1, "ayla").await;
    let b = h.connect(2, "berta").await;
    let c = h.connect(3, "carl").await;

    assert!(h
        .transport
        .last_packet_to::<ConnectionAccepted>(a)
        .await
        .is_some());

    // The earliest joiner holds the crown and starts selection.
    h.deliver(a, Channel::LobbyRoom, RequestBegin {}.to_bytes())
        .await;
    assert_eq!(h.controller.play_state().await, PlayState::Selecting);
    assert!(h.transport.last_packet_to::<StartSelection>(c).await.is_some());

    h.vote(a, "hacienda", 3, false).await;
    h.vote(b, "hacienda", 3, false).await;
    h.vote(c, "hacienda", 3, false).await;

    // All eligible peers voted, so the window closes early.
    assert_eq!(
        h.controller.play_state().await,
        PlayState::WaitForWorldLoaded
    );
    let load = h
        .transport
        .last_packet_to::<LoadWorld>(b)
        .await
        .expect("LoadWorld must be broadcast");
    assert_eq!(load.default_vote.vote.track_name, "hacienda");
    assert_eq!(load.default_vote.vote.num_laps, 3);
    assert_eq!(load.default_vote.winner_peer_id, 1);
    assert_eq!(load.all_players.len(), 3);

    for handle in [a, b, c] {
        h.deliver(
            handle,
            Channel::LobbyRoom,
            kartnet::lobby::ClientLoadedWorld {}.to_bytes(),
        )
        .await;
    }
    assert_eq!(
        h.controller.play_state().await,
        PlayState::WaitForRaceStarted
    );
    let start = h
        .transport
        .last_packet_to::<StartGame>(a)
        .await
        .expect("StartGame must be broadcast");
    assert!(start.start_time > 0);

    // Jump past the agreed start instant.
    h.controller
        .on_tick(Instant::now() + Duration::from_secs(30))
        .await;
    assert_eq!(h.controller.play_state().await, PlayState::Racing);

    (a, b, c)
}

#[tokio::test]
async fn scenario_clean_match() -> Result<()> {
    let mut h = Harness::new(test_config()).await?;
    let (a, b, c) = start_three_player_race(&mut h).await;

    // Three laps each; A finishes first.
    let mut crossings = vec![];
    for lap in 0..4 {
        // Stagger crossings: kart 0 slightly faster each lap.
        crossings.push((0usize, if lap == 0 { 0.0 } else { 31.4f32 }));
        crossings.push((1usize, if lap == 0 { 0.05 } else { 31.7f32 }));
        crossings.push((2usize, if lap == 0 { 0.05 } else { 32.3f32 }));
    }
    h.run_race_to_finish(&crossings).await;

    assert_eq!(h.controller.play_state().await, PlayState::ResultDisplay);
    let finished = h
        .transport
        .last_packet_to::<RaceFinished>(c)
        .await
        .expect("RaceFinished must be broadcast");
    assert!(finished.is_linear);
    assert!(finished.fastest_lap.is_some());
    assert!(finished.fastest_kart_name.is_some());

    for handle in [a, b, c] {
        h.deliver(handle, Channel::LobbyRoom, RaceFinishedAck {}.to_bytes())
            .await;
    }
    // Phase two of the reset runs on the worker.
    h.pump().await;
    assert_eq!(
        h.controller.play_state().await,
        PlayState::WaitingForStartGame
    );
    assert_eq!(h.controller.reset_state().await, ResetState::None);

    // Results were persisted for all three players.
    assert_eq!(h.db.with_state(|s| s.results.len()), 3);
    assert_eq!(h.db.with_state(|s| s.stats.len()), 3);
    Ok(())
}

#[tokio::test]
async fn scenario_live_join_denied_mid_race() -> Result<()> {
    let mut h = Harness::new(test_config()).await?;
    let _ = start_three_player_race(&mut h).await;

    // A fourth peer connects mid-race and asks to play.
    let d = h.connect(4, "dora").await;
    h.deliver(
        d,
        Channel::LobbyRoom,
        LiveJoinRequest {
            is_spectator: false,
            player_karts: None,
        }
        .to_bytes(),
    )
    .await;

    let back = h
        .transport
        .last_packet_to::<BackLobby>(d)
        .await
        .expect("the live join must be answered");
    assert_eq!(back.reason, BackLobbyReason::NoPlaceForLiveJoin);
    assert_eq!(h.controller.play_state().await, PlayState::Racing);
    Ok(())
}

#[tokio::test]
async fn scenario_disconnect_during_result_display() -> Result<()> {
    let mut h = Harness::new(test_config()).await?;
    let (a, b, c) = start_three_player_race(&mut h).await;

    let mut crossings = vec![];
    for _ in 0..4 {
        crossings.push((0usize, 10.0f32));
        crossings.push((1usize, 0.1f32));
        crossings.push((2usize, 0.1f32));
    }
    h.run_race_to_finish(&crossings).await;
    assert_eq!(h.controller.play_state().await, PlayState::ResultDisplay);

    // B drops before acking; the other two ack normally.
    h.disconnect(b).await;
    h.deliver(a, Channel::LobbyRoom, RaceFinishedAck {}.to_bytes())
        .await;
    h.deliver(c, Channel::LobbyRoom, RaceFinishedAck {}.to_bytes())
        .await;

    h.pump().await;
    assert_eq!(
        h.controller.play_state().await,
        PlayState::WaitingForStartGame
    );
    Ok(())
}

#[tokio::test]
async fn result_ack_timeout_counts_stragglers_as_acked() -> Result<()> {
    let mut h = Harness::new(test_config()).await?;
    let (a, _b, _c) = start_three_player_race(&mut h).await;

    let mut crossings = vec![];
    for _ in 0..4 {
        crossings.push((0usize, 10.0f32));
        crossings.push((1usize, 0.1f32));
        crossings.push((2usize, 0.1f32));
    }
    h.run_race_to_finish(&crossings).await;

    // Only one peer acks; the deadline covers the rest.
    h.deliver(a, Channel::LobbyRoom, RaceFinishedAck {}.to_bytes())
        .await;
    assert_eq!(h.controller.play_state().await, PlayState::ResultDisplay);

    h.controller
        .on_tick(Instant::now() + Duration::from_secs(3600))
        .await;
    h.pump().await;
    assert_eq!(
        h.controller.play_state().await,
        PlayState::WaitingForStartGame
    );
    Ok(())
}

#[tokio::test]
async fn one_connection_too_many_is_refused() -> Result<()> {
    let mut config = test_config();
    config.max_players = 2;
    let h = Harness::new(config).await?;

    h.connect(1, "ayla").await;
    h.connect(2, "berta").await;
    let c = h.connect(3, "carl").await;

    let refusal = h
        .transport
        .last_packet_to::<ConnectionRefused>(c)
        .await
        .expect("the third connection must be refused");
    assert_eq!(refusal.reason, RejectReason::TooManyPlayers);
    assert!(h.transport.was_kicked(c).await);
    Ok(())
}

#[tokio::test]
async fn wrong_password_is_refused() -> Result<()> {
    let mut config = test_config();
    config.password = "sesame".to_string();
    let h = Harness::new(config).await?;

    let a = h.connect_with(1, "ayla", Some("wrong")).await;
    let refusal = h
        .transport
        .last_packet_to::<ConnectionRefused>(a)
        .await
        .unwrap();
    assert_eq!(refusal.reason, RejectReason::IncorrectPassword);

    let b = h.connect_with(2, "berta", Some("sesame")).await;
    assert!(h
        .transport
        .last_packet_to::<ConnectionAccepted>(b)
        .await
        .is_some());
    Ok(())
}

#[tokio::test]
async fn banned_peers_never_validate() -> Result<()> {
    let h = Harness::new(test_config()).await?;
    h.db.ban_ip("10.0.0.1".parse().unwrap(), "rammed everyone");

    let a = h.connect(1, "ayla").await;
    let refusal = h
        .transport
        .last_packet_to::<ConnectionRefused>(a)
        .await
        .unwrap();
    assert_eq!(refusal.reason, RejectReason::Banned);
    Ok(())
}

#[tokio::test]
async fn zero_votes_select_a_random_map_with_defaults() -> Result<()> {
    let h = Harness::new(test_config()).await?;
    let a = h.connect(1, "ayla").await;
    h.deliver(a, Channel::LobbyRoom, RequestBegin {}.to_bytes())
        .await;
    assert_eq!(h.controller.play_state().await, PlayState::Selecting);

    // Nobody votes; the window runs out.
    h.controller
        .on_tick(Instant::now() + Duration::from_secs(3600))
        .await;

    let load = h
        .transport
        .last_packet_to::<LoadWorld>(a)
        .await
        .expect("a default vote must still load a world");
    assert!(["hacienda", "oasis", "volcano"]
        .contains(&load.default_vote.vote.track_name.as_str()));
    assert_eq!(load.default_vote.vote.num_laps, 3);
    Ok(())
}

#[tokio::test]
async fn non_crown_peers_cannot_start_selection() -> Result<()> {
    let h = Harness::new(test_config()).await?;
    let _a = h.connect(1, "ayla").await;
    let b = h.connect(2, "berta").await;

    h.deliver(b, Channel::LobbyRoom, RequestBegin {}.to_bytes())
        .await;
    assert_eq!(
        h.controller.play_state().await,
        PlayState::WaitingForStartGame
    );
    Ok(())
}

#[tokio::test]
async fn crown_passes_when_the_holder_leaves() -> Result<()> {
    let h = Harness::new(test_config()).await?;
    let a = h.connect(1, "ayla").await;
    let b = h.connect(2, "berta").await;

    h.disconnect(a).await;
    h.transport.drain().await;

    // Berta now holds the crown and may start.
    h.deliver(b, Channel::LobbyRoom, RequestBegin {}.to_bytes())
        .await;
    assert_eq!(h.controller.play_state().await, PlayState::Selecting);
    Ok(())
}

#[tokio::test]
async fn chat_is_routed_and_spam_rejected() -> Result<()> {
    let mut config = test_config();
    config.chat_consecutive_interval = 2;
    let h = Harness::new(config).await?;
    let a = h.connect(1, "ayla").await;
    let b = h.connect(2, "berta").await;
    h.transport.drain().await;

    let message = Chat {
        message: ChatStr::from("ayla: good race everyone"),
        kart_team: None,
    };
    h.deliver(a, Channel::LobbyRoom, message.to_bytes()).await;

    let received = h.transport.packets_to::<Chat>(b).await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].message.0, "ayla: good race everyone");

    // Hammering the channel trips the spam rule.
    for _ in 0..3 {
        h.deliver(
            a,
            Channel::LobbyRoom,
            Chat {
                message: ChatStr::from("ayla: spam"),
                kart_team: None,
            }
            .to_bytes(),
        )
        .await;
    }
    let to_sender = h.transport.packets_to::<Chat>(a).await;
    assert!(to_sender
        .iter()
        .any(|c| c.message.0 == "Spam detected"));
    Ok(())
}

#[tokio::test]
async fn admin_commands_are_permission_gated() -> Result<()> {
    let mut config = test_config();
    config.admins = vec!["ayla".to_string()];
    let mut h = Harness::new(config).await?;
    let a = h.connect(1, "ayla").await;
    let b = h.connect(2, "berta").await;
    h.transport.drain().await;

    // Berta is neither admin nor crown; the mode stays put.
    h.deliver(
        b,
        Channel::LobbyRoom,
        Chat {
            message: ChatStr::from("berta: /mode soccer"),
            kart_team: None,
        }
        .to_bytes(),
    )
    .await;
    let notices = h.transport.packets_to::<Chat>(b).await;
    assert!(notices
        .iter()
        .any(|c| c.message.0.contains("not allowed")));
    assert!(h
        .transport
        .last_packet_to::<ConfigServer>(a)
        .await
        .is_none());

    // The admin changes the mode; everyone gets the new config.
    h.deliver(
        a,
        Channel::LobbyRoom,
        Chat {
            message: ChatStr::from("ayla: /mode soccer"),
            kart_team: None,
        }
        .to_bytes(),
    )
    .await;
    let config_packet = h
        .transport
        .last_packet_to::<ConfigServer>(b)
        .await
        .expect("mode change must be announced");
    assert_eq!(config_packet.game_mode, GameMode::Soccer);

    // The admin bans berta: kicked now, ban row persisted.
    h.deliver(
        a,
        Channel::LobbyRoom,
        Chat {
            message: ChatStr::from("ayla: /ban berta ramming"),
            kart_team: None,
        }
        .to_bytes(),
    )
    .await;
    h.pump().await;
    assert!(h.transport.was_kicked(b).await);
    assert_eq!(
        h.db.with_state(|s| s.ip_bans.get("10.0.0.2").cloned()),
        Some("ramming".to_string())
    );
    Ok(())
}

#[tokio::test]
async fn crown_kicks_by_command_but_players_cannot() -> Result<()> {
    let h = Harness::new(test_config()).await?;
    let a = h.connect(1, "ayla").await;
    let b = h.connect(2, "berta").await;

    // Berta holds no crown; nothing happens to ayla.
    h.deliver(
        b,
        Channel::LobbyRoom,
        Chat {
            message: ChatStr::from("berta: /kick ayla"),
            kart_team: None,
        }
        .to_bytes(),
    )
    .await;
    assert!(!h.transport.was_kicked(a).await);

    h.deliver(
        a,
        Channel::LobbyRoom,
        Chat {
            message: ChatStr::from("ayla: /kick berta"),
            kart_team: None,
        }
        .to_bytes(),
    )
    .await;
    assert!(h.transport.was_kicked(b).await);
    Ok(())
}

#[tokio::test]
async fn mute_command_silences_a_player_for_the_sender() -> Result<()> {
    let h = Harness::new(test_config()).await?;
    let a = h.connect(1, "ayla").await;
    let b = h.connect(2, "berta").await;
    h.transport.drain().await;

    h.deliver(
        a,
        Channel::LobbyRoom,
        Chat {
            message: ChatStr::from("ayla: /mute berta"),
            kart_team: None,
        }
        .to_bytes(),
    )
    .await;
    h.transport.drain().await;

    h.deliver(
        b,
        Channel::LobbyRoom,
        Chat {
            message: ChatStr::from("berta: hello?"),
            kart_team: None,
        }
        .to_bytes(),
    )
    .await;
    assert!(h.transport.packets_to::<Chat>(a).await.is_empty());
    assert_eq!(h.transport.packets_to::<Chat>(b).await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn unknown_command_prints_the_reference() -> Result<()> {
    let h = Harness::new(test_config()).await?;
    let a = h.connect(1, "ayla").await;
    h.transport.drain().await;

    h.deliver(
        a,
        Channel::LobbyRoom,
        Chat {
            message: ChatStr::from("ayla: /frobnicate"),
            kart_team: None,
        }
        .to_bytes(),
    )
    .await;
    let notices = h.transport.packets_to::<Chat>(a).await;
    assert!(notices.iter().any(|c| c.message.0.contains("/help")));
    Ok(())
}

#[tokio::test]
async fn player_list_follows_membership() -> Result<()> {
    let h = Harness::new(test_config()).await?;
    let a = h.connect(1, "ayla").await;
    let _b = h.connect(2, "berta").await;

    let list = h
        .transport
        .last_packet_to::<PlayerList>(a)
        .await
        .expect("player list must be broadcast");
    assert_eq!(list.all_profiles.len(), 2);
    assert!(!list.game_started);

    h.disconnect(PeerHandle(2)).await;
    let list = h.transport.last_packet_to::<PlayerList>(a).await.unwrap();
    assert_eq!(list.all_profiles.len(), 1);
    assert_eq!(list.all_profiles[0].profile_name.as_str(), "ayla");
    Ok(())
}

#[tokio::test]
async fn host_ids_continue_from_the_persisted_ceiling() -> Result<()> {
    let db = MockDatabase::new();
    db.set_host_id_ceiling(41).await?;

    let transport = MockTransport::new();
    let (events_tx, _events) = mpsc::unbounded_channel();
    let controller = Controller::init(
        test_config(),
        Arc::new(transport.clone()) as Arc<dyn Transport>,
        DatabaseClient::Mock(db),
        events_tx,
    )
    .await?;

    controller
        .on_event(Event::Server(ServerEvent::PeerConnected {
            handle: PeerHandle(1),
            address: "10.0.0.1:2759".parse().unwrap(),
        }))
        .await;
    let accepted = {
        use marshal::controller::session::LiveSessions;
        controller.sessions.session(PeerHandle(1)).await.unwrap()
    };
    assert_eq!(accepted.host_id, 42);
    Ok(())
}
