use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, OptionalExtension};

use crate::database::{
    BanTarget, Database, DatabaseError, DisconnectUpdate, ReportRow, Result, StatsRow, DB_VERSION,
};

/// SQLite-backed sink. A single connection, guarded by a mutex, used
/// exclusively from the blocking pool; the main loop never touches it.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
    stats_table: String,
    results_table: String,
}

impl SqliteDatabase {
    pub fn open(path: &Path, server_uid: &str) -> Result<SqliteDatabase> {
        let conn = Connection::open(path)?;
        register_ipv6_helpers(&conn)?;

        // Table names embed the uid; restrict it to identifier characters.
        let uid: String = server_uid
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();

        Ok(SqliteDatabase {
            conn: Arc::new(Mutex::new(conn)),
            stats_table: format!("v{}_{}_stats", DB_VERSION, uid),
            results_table: format!("v{}_{}_results", DB_VERSION, uid),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("database mutex poisoned");
            f(&guard)
        })
        .await
        .map_err(|_| DatabaseError::WorkerGone)?
        .map_err(DatabaseError::from)
    }

    async fn check_ban(
        &self,
        table: &'static str,
        match_clause: &'static str,
        value: String,
    ) -> Result<Option<String>> {
        self.with_conn(move |conn| {
            let reason: Option<String> = conn
                .query_row(
                    &format!(
                        "SELECT reason FROM {} WHERE {} \
                         AND (expires_at IS NULL OR expires_at > datetime('now'))",
                        table, match_clause
                    ),
                    params![value],
                    |row| row.get(0),
                )
                .optional()?;
            if reason.is_some() {
                conn.execute(
                    &format!(
                        "UPDATE {} SET trigger_count = trigger_count + 1 WHERE {}",
                        table, match_clause
                    ),
                    params![value],
                )?;
            }
            Ok(reason)
        })
        .await
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn migrate(&self) -> Result<()> {
        let stats = self.stats_table.clone();
        let results = self.results_table.clone();
        self.with_conn(move |conn| {
            conn.execute_batch(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {stats} (
                    host_id             INTEGER NOT NULL,
                    address             TEXT    NOT NULL,
                    port                INTEGER NOT NULL,
                    online_id           INTEGER NOT NULL,
                    username            TEXT    NOT NULL,
                    country_code        TEXT,
                    connected_time      TEXT    NOT NULL,
                    disconnected_time   TEXT,
                    ping                INTEGER NOT NULL,
                    packet_loss         REAL    NOT NULL,
                    addon_karts_count   INTEGER NOT NULL,
                    addon_tracks_count  INTEGER NOT NULL,
                    addon_arenas_count  INTEGER NOT NULL,
                    addon_soccers_count INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS {results} (
                    username       TEXT    NOT NULL,
                    venue          TEXT    NOT NULL,
                    reverse        INTEGER NOT NULL,
                    laps           INTEGER NOT NULL,
                    result         REAL    NOT NULL,
                    kart           TEXT    NOT NULL,
                    kart_team      INTEGER NOT NULL,
                    handicap       INTEGER NOT NULL,
                    start_position INTEGER NOT NULL,
                    fastest_lap_ms INTEGER,
                    join_time      TEXT    NOT NULL,
                    leave_time     TEXT
                );
                CREATE TABLE IF NOT EXISTS ip_ban (
                    address       TEXT NOT NULL PRIMARY KEY,
                    reason        TEXT NOT NULL DEFAULT '',
                    trigger_count INTEGER NOT NULL DEFAULT 0,
                    starts_at     TEXT,
                    expires_at    TEXT
                );
                CREATE TABLE IF NOT EXISTS ipv6_ban (
                    cidr          TEXT NOT NULL PRIMARY KEY,
                    reason        TEXT NOT NULL DEFAULT '',
                    trigger_count INTEGER NOT NULL DEFAULT 0,
                    starts_at     TEXT,
                    expires_at    TEXT
                );
                CREATE TABLE IF NOT EXISTS online_id_ban (
                    online_id     INTEGER NOT NULL PRIMARY KEY,
                    reason        TEXT NOT NULL DEFAULT '',
                    trigger_count INTEGER NOT NULL DEFAULT 0,
                    starts_at     TEXT,
                    expires_at    TEXT
                );
                CREATE TABLE IF NOT EXISTS player_reports (
                    reporter_host_id INTEGER NOT NULL,
                    reporter_name    TEXT    NOT NULL,
                    reported_host_id INTEGER NOT NULL,
                    reported_name    TEXT    NOT NULL,
                    info             TEXT    NOT NULL,
                    time             TEXT    NOT NULL
                );
                CREATE TABLE IF NOT EXISTS server_meta (
                    key   TEXT NOT NULL PRIMARY KEY,
                    value INTEGER NOT NULL
                );
                "#,
                stats = stats,
                results = results,
            ))
        })
        .await
    }

    async fn host_id_ceiling(&self) -> Result<u32> {
        self.with_conn(|conn| {
            let ceiling: Option<u32> = conn
                .query_row(
                    "SELECT value FROM server_meta WHERE key = 'host_id_ceiling'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(ceiling.unwrap_or(0))
        })
        .await
    }

    async fn set_host_id_ceiling(&self, ceiling: u32) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO server_meta (key, value) VALUES ('host_id_ceiling', ?1)
                 ON CONFLICT (key) DO UPDATE SET value = MAX(value, excluded.value)",
                params![ceiling],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_connection(&self, row: &StatsRow) -> Result<()> {
        let table = self.stats_table.clone();
        let row = row.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {} (host_id, address, port, online_id, username, \
                     country_code, connected_time, ping, packet_loss, \
                     addon_karts_count, addon_tracks_count, addon_arenas_count, \
                     addon_soccers_count) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    table
                ),
                params![
                    row.host_id,
                    row.address,
                    row.port,
                    row.online_id,
                    row.username,
                    row.country_code,
                    row.connected_time.to_string(),
                    row.ping,
                    row.packet_loss,
                    row.addon_karts_count,
                    row.addon_tracks_count,
                    row.addon_arenas_count,
                    row.addon_soccers_count,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_disconnection(&self, update: &DisconnectUpdate) -> Result<()> {
        let table = self.stats_table.clone();
        let update = update.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "UPDATE {} SET disconnected_time = ?1, ping = ?2, packet_loss = ?3 \
                     WHERE host_id = ?4 AND disconnected_time IS NULL",
                    table
                ),
                params![
                    update.disconnected_time.to_string(),
                    update.ping,
                    update.packet_loss,
                    update.host_id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn write_results(&self, rows: &[super::ResultRow]) -> Result<()> {
        let table = self.results_table.clone();
        let rows = rows.to_vec();
        self.with_conn(move |conn| {
            for row in &rows {
                conn.execute(
                    &format!(
                        "INSERT INTO {} (username, venue, reverse, laps, result, kart, \
                         kart_team, handicap, start_position, fastest_lap_ms, \
                         join_time, leave_time) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                        table
                    ),
                    params![
                        row.username,
                        row.venue,
                        row.reverse,
                        row.laps,
                        row.result,
                        row.kart,
                        row.kart_team as u8,
                        row.handicap,
                        row.start_position,
                        row.fastest_lap_ms,
                        row.join_time.to_string(),
                        row.leave_time.map(|t| t.to_string()),
                    ],
                )?;
            }
            Ok(())
        })
        .await
    }

    async fn check_ip_ban(&self, address: Ipv4Addr) -> Result<Option<String>> {
        self.check_ban("ip_ban", "address = ?1", address.to_string())
            .await
    }

    async fn check_ipv6_ban(&self, address: Ipv6Addr) -> Result<Option<String>> {
        self.check_ban(
            "ipv6_ban",
            "insideIPv6CIDR(cidr, ?1) = 1",
            address.to_string(),
        )
        .await
    }

    async fn check_online_id_ban(&self, online_id: u32) -> Result<Option<String>> {
        self.check_ban("online_id_ban", "online_id = ?1", online_id.to_string())
            .await
    }

    async fn add_ban(&self, target: &BanTarget, reason: &str) -> Result<()> {
        let target = target.clone();
        let reason = reason.to_string();
        self.with_conn(move |conn| {
            let (statement, key) = match &target {
                BanTarget::Ipv4(address) => (
                    "INSERT INTO ip_ban (address, reason, starts_at) \
                     VALUES (?1, ?2, datetime('now')) \
                     ON CONFLICT (address) DO UPDATE SET reason = excluded.reason",
                    address.to_string(),
                ),
                BanTarget::Ipv6Cidr(cidr) => (
                    "INSERT INTO ipv6_ban (cidr, reason, starts_at) \
                     VALUES (?1, ?2, datetime('now')) \
                     ON CONFLICT (cidr) DO UPDATE SET reason = excluded.reason",
                    cidr.clone(),
                ),
                BanTarget::OnlineId(online_id) => (
                    "INSERT INTO online_id_ban (online_id, reason, starts_at) \
                     VALUES (?1, ?2, datetime('now')) \
                     ON CONFLICT (online_id) DO UPDATE SET reason = excluded.reason",
                    online_id.to_string(),
                ),
            };
            conn.execute(statement, params![key, reason])?;
            Ok(())
        })
        .await
    }

    async fn insert_report(&self, row: &ReportRow) -> Result<()> {
        let row = row.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO player_reports (reporter_host_id, reporter_name, \
                 reported_host_id, reported_name, info, time) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.reporter_host_id,
                    row.reporter_name,
                    row.reported_host_id,
                    row.reported_name,
                    row.info,
                    row.time.to_string(),
                ],
            )?;
            Ok(())
        })
        .await
    }
}

/// Canonical uppercase full form of an IPv6 address, so that textual
/// comparisons in SQL behave.
pub fn upper_ipv6(text: &str) -> Option<String> {
    let addr: Ipv6Addr = text.parse().ok()?;
    let segments = addr.segments();
    Some(
        segments
            .iter()
            .map(|s| format!("{:04X}", s))
            .collect::<Vec<_>>()
            .join(":"),
    )
}

/// Whether `addr` lies inside the CIDR range `cidr` (e.g. "2001:db8::/48").
pub fn inside_ipv6_cidr(cidr: &str, addr: &str) -> bool {
    let (net, prefix) = match cidr.split_once('/') {
        Some(pair) => pair,
        None => return false,
    };
    let net: Ipv6Addr = match net.parse() {
        Ok(a) => a,
        Err(_) => return false,
    };
    let addr: Ipv6Addr = match addr.parse() {
        Ok(a) => a,
        Err(_) => return false,
    };
    let prefix: u32 = match prefix.parse() {
        Ok(p) if p <= 128 => p,
        _ => return false,
    };

    let net = u128::from_be_bytes(net.octets());
    let addr = u128::from_be_bytes(addr.octets());
    if prefix == 0 {
        return true;
    }
    let mask = u128::MAX << (128 - prefix);
    (net & mask) == (addr & mask)
}

fn register_ipv6_helpers(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "upperIPv6",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let text: String = ctx.get(0)?;
            Ok(upper_ipv6(&text))
        },
    )?;
    conn.create_scalar_function(
        "insideIPv6CIDR",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let cidr: String = ctx.get(0)?;
            let addr: String = ctx.get(1)?;
            Ok(inside_ipv6_cidr(&cidr, &addr) as i64)
        },
    )?;
    Ok(())
}
