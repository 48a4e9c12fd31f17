pub use mock::*;
pub use udp::*;

mod mock;
mod udp;

use std::net::SocketAddr;

use async_trait::async_trait;

use kartnet::{Channel, Delivery, Packet};

/// Transport-level identifier of a connection. Distinct from the lobby
/// `host_id`: the handle exists from the moment the transport accepts
/// the connection, before any identity handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHandle(pub u64);

/// Events pushed by the reliable-datagram substrate into the main
/// event queue.
#[derive(Clone, Debug)]
pub enum ServerEvent {
    PeerConnected {
        handle: PeerHandle,
        address: SocketAddr,
    },

    PeerDisconnected {
        handle: PeerHandle,
    },

    /// A datagram arrived on the given channel.
    Packet {
        handle: PeerHandle,
        channel: Channel,
        payload: Vec<u8>,
    },

    /// Periodic transport statistics for one peer.
    PingUpdate {
        handle: PeerHandle,
        ping_ms: u32,
        packet_loss: f32,
    },
}

/// The contract the lobby has with the datagram substrate: ordered
/// reliable delivery per channel for synchronous packets, fire-and-forget
/// for the rest. The substrate itself (socket management, retransmits)
/// is an external collaborator.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, to: PeerHandle, delivery: Delivery, payload: Vec<u8>);

    /// Close the connection; a `PeerDisconnected` event follows.
    async fn kick(&self, peer: PeerHandle);
}

/// Encode and send one typed packet.
pub async fn send_packet<P: Packet>(transport: &dyn Transport, to: PeerHandle, packet: &P) {
    transport.send(to, P::DELIVERY, packet.to_bytes()).await;
}
