use std::convert::TryFrom;

use serde::{Deserialize, Serialize};

use crate::{DecodeError, NetReader, NetWriter, WireValue};

/// One-byte message-type discriminator at the start of every lobby record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    ConnectionRequested = 1,
    ConnectionRefused = 2,
    ConnectionAccepted = 3,
    ServerInfo = 4,
    UpdatePlayerList = 5,
    KartSelection = 6,
    StartSelection = 7,
    Vote = 8,
    LoadWorld = 9,
    ClientLoadedWorld = 10,
    StartRace = 11,
    RaceFinished = 12,
    RaceFinishedAck = 13,
    BackLobby = 14,
    Chat = 15,
    ChangeTeam = 16,
    ChangeHandicap = 17,
    KickHost = 18,
    ServerOwnership = 19,
    LiveJoin = 20,
    LiveJoinAck = 21,
    KartInfo = 22,
    PlayerDisconnected = 23,
    BadTeam = 24,
    ConfigServer = 25,
    AssetsUpdate = 26,
    ReportPlayer = 27,
    RequestBegin = 28,
}

macro_rules! wire_enum {
    ($name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        impl TryFrom<u8> for $name {
            type Error = DecodeError;

            fn try_from(value: u8) -> Result<Self, DecodeError> {
                match value {
                    $($value => Ok($name::$variant),)+
                    other => Err(DecodeError::UnknownEnumValue(other)),
                }
            }
        }

        impl WireValue for $name {
            fn write(&self, w: &mut NetWriter) {
                w.add_u8(*self as u8);
            }
            fn read(r: &mut NetReader<'_>) -> Result<Self, DecodeError> {
                Self::try_from(r.get_u8()?)
            }
        }
    };
}

wire_enum!(MessageType {
    ConnectionRequested = 1,
    ConnectionRefused = 2,
    ConnectionAccepted = 3,
    ServerInfo = 4,
    UpdatePlayerList = 5,
    KartSelection = 6,
    StartSelection = 7,
    Vote = 8,
    LoadWorld = 9,
    ClientLoadedWorld = 10,
    StartRace = 11,
    RaceFinished = 12,
    RaceFinishedAck = 13,
    BackLobby = 14,
    Chat = 15,
    ChangeTeam = 16,
    ChangeHandicap = 17,
    KickHost = 18,
    ServerOwnership = 19,
    LiveJoin = 20,
    LiveJoinAck = 21,
    KartInfo = 22,
    PlayerDisconnected = 23,
    BadTeam = 24,
    ConfigServer = 25,
    AssetsUpdate = 26,
    ReportPlayer = 27,
    RequestBegin = 28,
});

/// Why a connection attempt was turned down. Transient reasons
/// (busy, full, wrong password) may be retried by the client; the
/// rest are final for this client build or identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    Busy = 0,
    Banned = 1,
    IncorrectPassword = 2,
    IncompatibleData = 3,
    TooManyPlayers = 4,
    InvalidPlayer = 5,
}

wire_enum!(RejectReason {
    Busy = 0,
    Banned = 1,
    IncorrectPassword = 2,
    IncompatibleData = 3,
    TooManyPlayers = 4,
    InvalidPlayer = 5,
});

impl Default for RejectReason {
    fn default() -> Self {
        RejectReason::Busy
    }
}

/// Why a peer was sent back to the lobby.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BackLobbyReason {
    None = 0,
    NoGameForLiveJoin = 1,
    NoPlaceForLiveJoin = 2,
    OnePlayerInRankedMatch = 3,
    ServerOwnerQuitTheGame = 4,
    SpectatingNextGame = 5,
    Idle = 6,
    Kicked = 7,
}

wire_enum!(BackLobbyReason {
    None = 0,
    NoGameForLiveJoin = 1,
    NoPlaceForLiveJoin = 2,
    OnePlayerInRankedMatch = 3,
    ServerOwnerQuitTheGame = 4,
    SpectatingNextGame = 5,
    Idle = 6,
    Kicked = 7,
});

impl Default for BackLobbyReason {
    fn default() -> Self {
        BackLobbyReason::None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KartTeam {
    None = 0,
    Red = 1,
    Blue = 2,
}

wire_enum!(KartTeam {
    None = 0,
    Red = 1,
    Blue = 2,
});

impl Default for KartTeam {
    fn default() -> Self {
        KartTeam::None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum GameMode {
    NormalRace = 0,
    TimeTrial = 1,
    FreeForAll = 2,
    CaptureTheFlag = 3,
    Soccer = 4,
}

wire_enum!(GameMode {
    NormalRace = 0,
    TimeTrial = 1,
    FreeForAll = 2,
    CaptureTheFlag = 3,
    Soccer = 4,
});

impl GameMode {
    /// Lapped modes run on tracks; the rest play in bounded arenas.
    pub fn is_linear(self) -> bool {
        matches!(self, GameMode::NormalRace | GameMode::TimeTrial)
    }

    pub fn is_battle(self) -> bool {
        !self.is_linear()
    }

    pub fn has_teams(self) -> bool {
        matches!(self, GameMode::CaptureTheFlag | GameMode::Soccer)
    }
}

impl Default for GameMode {
    fn default() -> Self {
        GameMode::NormalRace
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum Difficulty {
    Novice = 0,
    Intermediate = 1,
    Expert = 2,
    Supreme = 3,
}

wire_enum!(Difficulty {
    Novice = 0,
    Intermediate = 1,
    Expert = 2,
    Supreme = 3,
});

impl Default for Difficulty {
    fn default() -> Self {
        Difficulty::Intermediate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_enum_value_is_rejected() {
        assert_eq!(
            KartTeam::try_from(9),
            Err(DecodeError::UnknownEnumValue(9))
        );
    }

    #[test]
    fn enum_round_trip() {
        let mut w = NetWriter::new();
        GameMode::Soccer.write(&mut w);
        let bytes = w.into_bytes();
        let mut r = NetReader::new(&bytes);
        assert_eq!(GameMode::read(&mut r).unwrap(), GameMode::Soccer);
    }

    #[test]
    fn mode_classification() {
        assert!(GameMode::TimeTrial.is_linear());
        assert!(GameMode::FreeForAll.is_battle());
        assert!(GameMode::Soccer.has_teams());
        assert!(!GameMode::NormalRace.has_teams());
    }
}
