pub use buffer::*;
pub use enums::*;
pub use error::*;
pub use packet::*;

mod buffer;
mod enums;
mod error;
#[macro_use]
mod packet;
pub mod game;
pub mod lobby;

/// Channel a packet travels on. Lobby traffic is totally ordered per peer;
/// game state uses the unreliable channel and carries explicit tick numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Connection setup, before a peer is validated.
    Connection,
    /// Player list, votes, chat, match lifecycle.
    LobbyRoom,
    /// Discrete in-game events (item collection, laps, goals).
    GameEvents,
    /// High-frequency authoritative state; tolerates loss.
    GameState,
}

/// How a packet should be handed to the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub channel: Channel,

    /// Delivered in order relative to other synchronous packets
    /// on the same channel.
    pub synchronous: bool,

    /// Reliable vs. unreliable datagram.
    pub reliable: bool,
}
