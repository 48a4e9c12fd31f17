use std::collections::VecDeque;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{RwLock, RwLockReadGuard};

use async_trait::async_trait;

use crate::config::ServerConfig;
use crate::controller::filter::{FilterContext, KartFilter, TrackFilter};

/// Use to look up the queued filters for the next match.
#[async_trait]
pub trait LiveQueues: Send + Sync {
    /// While holding this guard, the state is read-only, and can be
    /// referenced.
    async fn lock(&self) -> RwLockReadGuard<'_, QueuesState>;
}

/// Two independent filter queues (maps and karts), each split into a
/// one-time and a cyclic sub-queue. The front filters of all four are
/// consulted whenever a match is chosen; after every race the one-time
/// fronts are dropped and the cyclic fronts move to the tail.
#[derive(Default)]
pub struct QueuesState {
    pub onetime_map_queue: VecDeque<TrackFilter>,
    pub cyclic_map_queue: VecDeque<TrackFilter>,
    pub onetime_kart_queue: VecDeque<KartFilter>,
    pub cyclic_kart_queue: VecDeque<KartFilter>,
    /// Most recent maps, newest first, feeding `%i` wildcards.
    pub map_history: Vec<String>,
}

#[derive(Clone)]
pub struct QueueController {
    state: Arc<RwLock<QueuesState>>,
}

impl QueueController {
    pub fn init(config: &ServerConfig) -> Self {
        let state = QueuesState {
            onetime_map_queue: config
                .onetime_map_queue
                .iter()
                .map(|s| TrackFilter::parse(s))
                .collect(),
            cyclic_map_queue: config
                .cyclic_map_queue
                .iter()
                .map(|s| TrackFilter::parse(s))
                .collect(),
            onetime_kart_queue: config
                .onetime_kart_queue
                .iter()
                .map(|s| KartFilter::parse(s))
                .collect(),
            cyclic_kart_queue: config
                .cyclic_kart_queue
                .iter()
                .map(|s| KartFilter::parse(s))
                .collect(),
            map_history: vec![],
        };
        QueueController {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Narrows a candidate map set through the front filters of both
    /// map sub-queues.
    pub async fn apply_front_map_filters<R: Rng>(&self, ctx: &mut FilterContext, rng: &mut R) {
        let state = self.state.read().await;
        ctx.wildcards = state.map_history.clone();
        if let Some(filter) = state.onetime_map_queue.front() {
            filter.apply(ctx, rng);
        }
        if let Some(filter) = state.cyclic_map_queue.front() {
            filter.apply(ctx, rng);
        }
    }

    /// Narrows one player's candidate kart set through the front
    /// filters of both kart sub-queues.
    pub async fn apply_front_kart_filters(&self, ctx: &mut FilterContext) {
        let state = self.state.read().await;
        if let Some(filter) = state.onetime_kart_queue.front() {
            filter.apply(ctx);
        }
        if let Some(filter) = state.cyclic_kart_queue.front() {
            filter.apply(ctx);
        }
    }

    pub async fn kart_filters_ignore_input(&self) -> bool {
        let state = self.state.read().await;
        state
            .onetime_kart_queue
            .front()
            .map(|f| f.ignores_players_input())
            .unwrap_or(false)
            || state
                .cyclic_kart_queue
                .front()
                .map(|f| f.ignores_players_input())
                .unwrap_or(false)
    }

    /// Records the played map and advances all four sub-queues.
    pub async fn pop_on_race_finished(&self, played_map: &str) {
        let mut state = self.state.write().await;
        state.map_history.insert(0, played_map.to_string());
        state.map_history.truncate(16);

        state.onetime_map_queue.pop_front();
        state.onetime_kart_queue.pop_front();
        if let Some(front) = state.cyclic_map_queue.pop_front() {
            state.cyclic_map_queue.push_back(front);
        }
        if let Some(front) = state.cyclic_kart_queue.pop_front() {
            state.cyclic_kart_queue.push_back(front);
        }
    }
}

#[async_trait]
impl LiveQueues for QueueController {
    async fn lock(&self) -> RwLockReadGuard<'_, QueuesState> {
        self.state.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config() -> ServerConfig {
        ServerConfig {
            onetime_map_queue: vec!["hacienda".to_string()],
            cyclic_map_queue: vec!["not volcano".to_string(), "not oasis".to_string()],
            ..crate::test_support::test_config()
        }
    }

    fn ctx(elements: &[&str]) -> FilterContext {
        FilterContext {
            elements: elements.iter().map(|s| s.to_string()).collect(),
            available: elements.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn front_filters_stack() {
        let queues = QueueController::init(&config());
        let mut c = ctx(&["hacienda", "oasis", "volcano"]);
        queues
            .apply_front_map_filters(&mut c, &mut StdRng::seed_from_u64(1))
            .await;
        // One-time front allows only hacienda; cyclic front forbids
        // volcano.
        assert_eq!(c.elements.len(), 1);
        assert!(c.elements.contains("hacienda"));
    }

    #[tokio::test]
    async fn queues_advance_after_each_race() {
        let queues = QueueController::init(&config());
        queues.pop_on_race_finished("hacienda").await;

        let state = queues.lock().await;
        // The one-time filter is gone; the cyclic queue rotated.
        assert!(state.onetime_map_queue.is_empty());
        assert_eq!(state.cyclic_map_queue.len(), 2);
        assert_eq!(state.cyclic_map_queue[0].initial_string(), "not oasis");
        assert_eq!(state.map_history, vec!["hacienda".to_string()]);
    }

    #[tokio::test]
    async fn history_feeds_wildcards() {
        let queues = QueueController::init(&ServerConfig {
            cyclic_map_queue: vec!["not %0".to_string()],
            ..crate::test_support::test_config()
        });
        queues.pop_on_race_finished("oasis").await;

        let mut c = ctx(&["hacienda", "oasis"]);
        queues
            .apply_front_map_filters(&mut c, &mut StdRng::seed_from_u64(1))
            .await;
        assert!(!c.elements.contains("oasis"));
        assert!(c.elements.contains("hacienda"));
    }
}
