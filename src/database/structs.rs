use std::net::Ipv4Addr;

use chrono::NaiveDateTime;

use kartnet::KartTeam;

/// What a ban row keys on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BanTarget {
    Ipv4(Ipv4Addr),
    /// CIDR range; a single host is banned as a /128.
    Ipv6Cidr(String),
    OnlineId(u32),
}

/// One row per host id per connection session.
#[derive(Clone, Debug, PartialEq)]
pub struct StatsRow {
    pub host_id: u32,
    pub address: String,
    pub port: u16,
    pub online_id: u32,
    pub username: String,
    pub country_code: Option<String>,
    pub connected_time: NaiveDateTime,
    pub ping: u32,
    pub packet_loss: f32,
    pub addon_karts_count: i64,
    pub addon_tracks_count: i64,
    pub addon_arenas_count: i64,
    pub addon_soccers_count: i64,
}

/// Fields patched onto the stats row when the peer leaves.
#[derive(Clone, Debug, PartialEq)]
pub struct DisconnectUpdate {
    pub host_id: u32,
    pub disconnected_time: NaiveDateTime,
    pub ping: u32,
    pub packet_loss: f32,
}

/// One row per player per finished race; written only when
/// `store_results` is on.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultRow {
    pub username: String,
    pub venue: String,
    pub reverse: bool,
    pub laps: u8,
    /// Finish time in seconds for linear modes, score for battle modes.
    pub result: f64,
    pub kart: String,
    pub kart_team: KartTeam,
    pub handicap: u8,
    pub start_position: u8,
    pub fastest_lap_ms: Option<u32>,
    pub join_time: NaiveDateTime,
    pub leave_time: Option<NaiveDateTime>,
}

/// Inter-player report, or a server-to-player message.
#[derive(Clone, Debug, PartialEq)]
pub struct ReportRow {
    pub reporter_host_id: u32,
    pub reporter_name: String,
    pub reported_host_id: u32,
    pub reported_name: String,
    pub info: String,
    pub time: NaiveDateTime,
}
