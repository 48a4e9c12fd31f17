use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

use kartnet::{Channel, Delivery};

use crate::event::Event;
use crate::server::{PeerHandle, ServerEvent, Transport};

/// Channel byte on the wire.
const CH_CONNECTION: u8 = 0;
const CH_LOBBY_ROOM: u8 = 1;
const CH_GAME_EVENTS: u8 = 2;
const CH_GAME_STATE: u8 = 3;
/// A one-byte frame carrying this value is a goodbye.
const CH_DISCONNECT: u8 = 0xff;

fn channel_byte(channel: Channel) -> u8 {
    match channel {
        Channel::Connection => CH_CONNECTION,
        Channel::LobbyRoom => CH_LOBBY_ROOM,
        Channel::GameEvents => CH_GAME_EVENTS,
        Channel::GameState => CH_GAME_STATE,
    }
}

fn byte_channel(byte: u8) -> Option<Channel> {
    match byte {
        CH_CONNECTION => Some(Channel::Connection),
        CH_LOBBY_ROOM => Some(Channel::LobbyRoom),
        CH_GAME_EVENTS => Some(Channel::GameEvents),
        CH_GAME_STATE => Some(Channel::GameState),
        _ => None,
    }
}

/// Plain-UDP rendering of the datagram contract, for LAN play and
/// development. Frames are `[channel byte, payload…]`; a datagram from
/// an unknown address implicitly connects the peer. Production
/// deployments embed the reliable-datagram substrate instead; this
/// adapter does not retransmit.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peers: Arc<Mutex<PeerTable>>,
    events: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct PeerTable {
    by_addr: HashMap<SocketAddr, PeerHandle>,
    by_handle: HashMap<PeerHandle, SocketAddr>,
}

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

impl UdpTransport {
    /// Binds the socket and spawns the reader task feeding `events`.
    pub async fn bind(
        bind_address: &str,
        events: mpsc::UnboundedSender<Event>,
    ) -> Result<Arc<UdpTransport>> {
        let socket = UdpSocket::bind(bind_address)
            .await
            .with_context(|| format!("failed to bind {}", bind_address))?;
        log::info!("listening on {}", socket.local_addr()?);

        let transport = Arc::new(UdpTransport {
            socket: Arc::new(socket),
            peers: Arc::new(Mutex::new(PeerTable::default())),
            events: events.clone(),
        });

        let reader = transport.clone();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; 64 * 1024];
            loop {
                let (len, address) = match reader.socket.recv_from(&mut buffer).await {
                    Ok(pair) => pair,
                    Err(error) => {
                        log::error!("socket receive failed: {}", error);
                        break;
                    }
                };
                if len == 0 {
                    continue;
                }
                let frame = &buffer[..len];

                let handle = {
                    let mut peers = reader.peers.lock().await;
                    match peers.by_addr.get(&address) {
                        Some(handle) => *handle,
                        None => {
                            let handle = PeerHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed));
                            peers.by_addr.insert(address, handle);
                            peers.by_handle.insert(handle, address);
                            let _ = events.send(Event::Server(ServerEvent::PeerConnected {
                                handle,
                                address,
                            }));
                            handle
                        }
                    }
                };

                if frame[0] == CH_DISCONNECT {
                    let mut peers = reader.peers.lock().await;
                    peers.by_addr.remove(&address);
                    peers.by_handle.remove(&handle);
                    let _ = events.send(Event::Server(ServerEvent::PeerDisconnected { handle }));
                    continue;
                }

                match byte_channel(frame[0]) {
                    Some(channel) => {
                        let _ = events.send(Event::Server(ServerEvent::Packet {
                            handle,
                            channel,
                            payload: frame[1..].to_vec(),
                        }));
                    }
                    None => {
                        log::debug!("dropping frame with unknown channel {}", frame[0]);
                    }
                }
            }
        });

        Ok(transport)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, to: PeerHandle, delivery: Delivery, payload: Vec<u8>) {
        let address = {
            let peers = self.peers.lock().await;
            match peers.by_handle.get(&to) {
                Some(address) => *address,
                None => return,
            }
        };
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(channel_byte(delivery.channel));
        frame.extend_from_slice(&payload);
        if let Err(error) = self.socket.send_to(&frame, address).await {
            log::warn!("send to {:?} failed: {}", to, error);
        }
    }

    async fn kick(&self, peer: PeerHandle) {
        let address = {
            let mut peers = self.peers.lock().await;
            let address = peers.by_handle.remove(&peer);
            if let Some(address) = address {
                peers.by_addr.remove(&address);
            }
            address
        };
        if let Some(address) = address {
            let _ = self.socket.send_to(&[CH_DISCONNECT], address).await;
            let _ = self
                .events
                .send(Event::Server(ServerEvent::PeerDisconnected { handle: peer }));
        }
    }
}
