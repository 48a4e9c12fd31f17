pub use mock::*;
pub use queries::*;
pub use structs::*;

mod mock;
mod queries;
mod structs;

use std::net::{Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use thiserror::Error;

/// Schema version; part of the per-server table names.
pub const DB_VERSION: u32 = 1;

pub type Result<T> = std::result::Result<T, DatabaseError>;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database worker gone")]
    WorkerGone,
}

/// The append-only metrics sink of the lobby. One implementation talks
/// to a local SQLite file from the blocking pool; the mock keeps rows
/// in memory for tests.
#[derive(Clone)]
pub enum DatabaseClient {
    Sqlite(SqliteDatabase),
    Mock(MockDatabase),
}

/// Everything the lobby persists. All writes happen off the main loop;
/// the main loop only ever enqueues them.
#[async_trait]
pub trait Database: Send + Sync {
    async fn migrate(&self) -> Result<()>;

    /// Highest host id ever issued by this server, across runs.
    async fn host_id_ceiling(&self) -> Result<u32>;

    async fn set_host_id_ceiling(&self, ceiling: u32) -> Result<()>;

    /// One row per connection session.
    async fn record_connection(&self, row: &StatsRow) -> Result<()>;

    async fn record_disconnection(&self, update: &DisconnectUpdate) -> Result<()>;

    /// One row per player per finished race.
    async fn write_results(&self, rows: &[ResultRow]) -> Result<()>;

    /// Returns the ban reason when the address is banned, bumping the
    /// trigger count.
    async fn check_ip_ban(&self, address: Ipv4Addr) -> Result<Option<String>>;

    /// IPv6 bans are CIDR ranges; containment is evaluated in SQL via
    /// the registered `insideIPv6CIDR` helper.
    async fn check_ipv6_ban(&self, address: Ipv6Addr) -> Result<Option<String>>;

    async fn check_online_id_ban(&self, online_id: u32) -> Result<Option<String>>;

    /// Adds (or overwrites) a ban row with no expiry.
    async fn add_ban(&self, target: &BanTarget, reason: &str) -> Result<()>;

    async fn insert_report(&self, row: &ReportRow) -> Result<()>;
}

#[async_trait]
impl Database for DatabaseClient {
    async fn migrate(&self) -> Result<()> {
        match self {
            DatabaseClient::Sqlite(db) => db.migrate().await,
            DatabaseClient::Mock(db) => db.migrate().await,
        }
    }

    async fn host_id_ceiling(&self) -> Result<u32> {
        match self {
            DatabaseClient::Sqlite(db) => db.host_id_ceiling().await,
            DatabaseClient::Mock(db) => db.host_id_ceiling().await,
        }
    }

    async fn set_host_id_ceiling(&self, ceiling: u32) -> Result<()> {
        match self {
            DatabaseClient::Sqlite(db) => db.set_host_id_ceiling(ceiling).await,
            DatabaseClient::Mock(db) => db.set_host_id_ceiling(ceiling).await,
        }
    }

    async fn record_connection(&self, row: &StatsRow) -> Result<()> {
        match self {
            DatabaseClient::Sqlite(db) => db.record_connection(row).await,
            DatabaseClient::Mock(db) => db.record_connection(row).await,
        }
    }

    async fn record_disconnection(&self, update: &DisconnectUpdate) -> Result<()> {
        match self {
            DatabaseClient::Sqlite(db) => db.record_disconnection(update).await,
            DatabaseClient::Mock(db) => db.record_disconnection(update).await,
        }
    }

    async fn write_results(&self, rows: &[ResultRow]) -> Result<()> {
        match self {
            DatabaseClient::Sqlite(db) => db.write_results(rows).await,
            DatabaseClient::Mock(db) => db.write_results(rows).await,
        }
    }

    async fn check_ip_ban(&self, address: Ipv4Addr) -> Result<Option<String>> {
        match self {
            DatabaseClient::Sqlite(db) => db.check_ip_ban(address).await,
            DatabaseClient::Mock(db) => db.check_ip_ban(address).await,
        }
    }

    async fn check_ipv6_ban(&self, address: Ipv6Addr) -> Result<Option<String>> {
        match self {
            DatabaseClient::Sqlite(db) => db.check_ipv6_ban(address).await,
            DatabaseClient::Mock(db) => db.check_ipv6_ban(address).await,
        }
    }

    async fn check_online_id_ban(&self, online_id: u32) -> Result<Option<String>> {
        match self {
            DatabaseClient::Sqlite(db) => db.check_online_id_ban(online_id).await,
            DatabaseClient::Mock(db) => db.check_online_id_ban(online_id).await,
        }
    }

    async fn add_ban(&self, target: &BanTarget, reason: &str) -> Result<()> {
        match self {
            DatabaseClient::Sqlite(db) => db.add_ban(target, reason).await,
            DatabaseClient::Mock(db) => db.add_ban(target, reason).await,
        }
    }

    async fn insert_report(&self, row: &ReportRow) -> Result<()> {
        match self {
            DatabaseClient::Sqlite(db) => db.insert_report(row).await,
            DatabaseClient::Mock(db) => db.insert_report(row).await,
        }
    }
}
