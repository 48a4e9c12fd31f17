use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use kartnet::{Delivery, Packet};

use crate::server::{PeerHandle, Transport};

/// In-memory transport for tests: records everything the lobby sends
/// and lets the test inspect it per peer.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    outbox: Vec<(PeerHandle, Delivery, Vec<u8>)>,
    kicked: Vec<PeerHandle>,
}

impl MockTransport {
    pub fn new() -> Self {
        Default::default()
    }

    /// All raw payloads sent to the given peer since the last drain.
    pub async fn sent_to(&self, peer: PeerHandle) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .await
            .outbox
            .iter()
            .filter(|(to, _, _)| *to == peer)
            .map(|(_, _, payload)| payload.clone())
            .collect()
    }

    /// Decode every packet of type `P` sent to the given peer.
    pub async fn packets_to<P: Packet>(&self, peer: PeerHandle) -> Vec<P> {
        self.sent_to(peer)
            .await
            .iter()
            .filter_map(|payload| P::from_bytes(payload).ok())
            .collect()
    }

    /// The most recent packet of type `P` sent to the given peer.
    pub async fn last_packet_to<P: Packet>(&self, peer: PeerHandle) -> Option<P> {
        self.packets_to(peer).await.into_iter().last()
    }

    pub async fn was_kicked(&self, peer: PeerHandle) -> bool {
        self.state.lock().await.kicked.contains(&peer)
    }

    pub async fn drain(&self) {
        self.state.lock().await.outbox.clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, to: PeerHandle, delivery: Delivery, payload: Vec<u8>) {
        self.state.lock().await.outbox.push((to, delivery, payload));
    }

    async fn kick(&self, peer: PeerHandle) {
        self.state.lock().await.kicked.push(peer);
    }
}
