use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::database::queries::inside_ipv6_cidr;
use crate::database::{
    BanTarget, Database, DisconnectUpdate, ReportRow, Result, ResultRow, StatsRow,
};

/// In-memory database for tests: same contract, rows kept in vectors.
#[derive(Clone, Default)]
pub struct MockDatabase {
    state: Arc<Mutex<MockDbState>>,
}

#[derive(Default)]
pub struct MockDbState {
    pub host_id_ceiling: u32,
    pub stats: Vec<StatsRow>,
    pub disconnects: Vec<DisconnectUpdate>,
    pub results: Vec<ResultRow>,
    pub reports: Vec<ReportRow>,
    pub ip_bans: HashMap<String, String>,
    pub ipv6_bans: HashMap<String, String>,
    pub online_id_bans: HashMap<u32, String>,
}

impl MockDatabase {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn ban_ip(&self, address: Ipv4Addr, reason: &str) {
        self.state
            .lock()
            .unwrap()
            .ip_bans
            .insert(address.to_string(), reason.to_string());
    }

    pub fn ban_ipv6_cidr(&self, cidr: &str, reason: &str) {
        self.state
            .lock()
            .unwrap()
            .ipv6_bans
            .insert(cidr.to_string(), reason.to_string());
    }

    pub fn ban_online_id(&self, online_id: u32, reason: &str) {
        self.state
            .lock()
            .unwrap()
            .online_id_bans
            .insert(online_id, reason.to_string());
    }

    pub fn with_state<T>(&self, f: impl FnOnce(&MockDbState) -> T) -> T {
        f(&self.state.lock().unwrap())
    }
}

#[async_trait]
impl Database for MockDatabase {
    async fn migrate(&self) -> Result<()> {
        Ok(())
    }

    async fn host_id_ceiling(&self) -> Result<u32> {
        Ok(self.state.lock().unwrap().host_id_ceiling)
    }

    async fn set_host_id_ceiling(&self, ceiling: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.host_id_ceiling = state.host_id_ceiling.max(ceiling);
        Ok(())
    }

    async fn record_connection(&self, row: &StatsRow) -> Result<()> {
        self.state.lock().unwrap().stats.push(row.clone());
        Ok(())
    }

    async fn record_disconnection(&self, update: &DisconnectUpdate) -> Result<()> {
        self.state.lock().unwrap().disconnects.push(update.clone());
        Ok(())
    }

    async fn write_results(&self, rows: &[ResultRow]) -> Result<()> {
        self.state.lock().unwrap().results.extend(rows.iter().cloned());
        Ok(())
    }

    async fn check_ip_ban(&self, address: Ipv4Addr) -> Result<Option<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .ip_bans
            .get(&address.to_string())
            .cloned())
    }

    async fn check_ipv6_ban(&self, address: Ipv6Addr) -> Result<Option<String>> {
        let text = address.to_string();
        Ok(self
            .state
            .lock()
            .unwrap()
            .ipv6_bans
            .iter()
            .find(|(cidr, _)| inside_ipv6_cidr(cidr, &text))
            .map(|(_, reason)| reason.clone()))
    }

    async fn check_online_id_ban(&self, online_id: u32) -> Result<Option<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .online_id_bans
            .get(&online_id)
            .cloned())
    }

    async fn add_ban(&self, target: &BanTarget, reason: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match target {
            BanTarget::Ipv4(address) => {
                state.ip_bans.insert(address.to_string(), reason.to_string());
            }
            BanTarget::Ipv6Cidr(cidr) => {
                state.ipv6_bans.insert(cidr.clone(), reason.to_string());
            }
            BanTarget::OnlineId(online_id) => {
                state.online_id_bans.insert(*online_id, reason.to_string());
            }
        }
        Ok(())
    }

    async fn insert_report(&self, row: &ReportRow) -> Result<()> {
        self.state.lock().unwrap().reports.push(row.clone());
        Ok(())
    }
}
