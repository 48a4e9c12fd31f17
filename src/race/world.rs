use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use kartnet::GameMode;

use crate::race::{
    CompoundTable, FuelParams, ItemPolicy, KartItems, PaceDirective, PitOutcome, PowerupType,
    RaceSetup, TyreTick, Tyres, REFUEL_ONLY,
};

/// One kart of the live match. World kart ids are the indices into
/// [`RaceWorld::karts`], contiguous `0..N`.
#[derive(Clone, Debug)]
pub struct KartInstance {
    /// Owning peer, or `None` for an AI kart.
    pub host_id: Option<u32>,
    pub local_player_id: u8,
    pub kart_name: String,

    pub tyres: Tyres,
    pub items: KartItems,

    /// 1-based race position.
    pub position: u32,
    pub finished_laps: i32,
    pub overall_distance: f32,
    pub finish_time: Option<f32>,
    pub eliminated: bool,
    /// Battle-mode score (hits, goals, flags).
    pub score: u32,
    /// Best single-lap time in milliseconds.
    pub best_lap_ms: Option<u32>,
    lap_started_at: f32,

    /// Set while the owner is gone; a live joiner may take the slot.
    pub reserved_for_live_join: bool,

    /// Remaining ticks of an externally-imposed slowdown
    /// (pit stop or pace car); -1 is open-ended.
    pub slowdown_ticks_left: i32,
    pub slowdown_fraction: f32,
}

impl KartInstance {
    pub fn is_ai(&self) -> bool {
        self.host_id.is_none()
    }

    fn set_slowdown(&mut self, fraction: f32, ticks: i32) {
        self.slowdown_fraction = fraction;
        self.slowdown_ticks_left = ticks;
    }
}

/// The authoritative match state the lobby owns between `LOAD_WORLD`
/// and reset. The physics integrator, collision world and track
/// geometry are external; they feed per-tick samples in and read the
/// degradation outputs back.
#[derive(Clone, Debug)]
pub struct RaceWorld {
    pub setup: RaceSetup,
    pub karts: Vec<KartInstance>,
    pub item_policy: ItemPolicy,
    pub elapsed_time: f32,
    pub fastest_lap_ms: Option<u32>,
    pub fastest_lap_kart: Option<usize>,
    rng: StdRng,
}

impl RaceWorld {
    pub fn new(
        setup: RaceSetup,
        item_policy: ItemPolicy,
        table: Arc<CompoundTable>,
        fuel: FuelParams,
        compound_queue: Vec<i32>,
    ) -> Self {
        let rng = StdRng::seed_from_u64(setup.item_seed as u64);
        let karts = setup
            .assignments
            .iter()
            .enumerate()
            .map(|(i, a)| KartInstance {
                host_id: a.host_id,
                local_player_id: a.local_player_id,
                kart_name: a.kart_name.clone(),
                tyres: Tyres::new(table.clone(), fuel, 1, compound_queue.clone()),
                items: KartItems {
                    item_type: PowerupType::Nothing,
                    amount: 0,
                    amount_last_lap: 0,
                },
                position: i as u32 + 1,
                finished_laps: -1,
                overall_distance: 0.0,
                finish_time: None,
                eliminated: false,
                score: 0,
                best_lap_ms: None,
                lap_started_at: 0.0,
                reserved_for_live_join: false,
                slowdown_ticks_left: 0,
                slowdown_fraction: 1.0,
            })
            .collect();
        RaceWorld {
            setup,
            karts,
            item_policy,
            elapsed_time: 0.0,
            fastest_lap_ms: None,
            fastest_lap_kart: None,
            rng,
        }
    }

    pub fn num_karts(&self) -> u32 {
        self.karts.len() as u32
    }

    /// Kart owned by the given profile, if any.
    pub fn kart_of(&self, host_id: u32, local_player_id: u8) -> Option<usize> {
        self.karts.iter().position(|k| {
            k.host_id == Some(host_id) && k.local_player_id == local_player_id
        })
    }

    /// Marks every kart of a departed peer as joinable by a late comer.
    pub fn release_karts_of(&mut self, host_id: u32) {
        for kart in &mut self.karts {
            if kart.host_id == Some(host_id) {
                kart.host_id = None;
                kart.reserved_for_live_join = true;
            }
        }
    }

    /// First kart slot a live joiner may take.
    pub fn first_reserved_kart(&self) -> Option<usize> {
        self.karts.iter().position(|k| k.reserved_for_live_join)
    }

    pub fn occupy_kart(&mut self, kart_id: usize, host_id: u32, local_player_id: u8) {
        let kart = &mut self.karts[kart_id];
        kart.host_id = Some(host_id);
        kart.local_player_id = local_player_id;
        kart.reserved_for_live_join = false;
    }

    /// Advances the shared clock and serves per-kart slowdowns and the
    /// pace car. Physics samples arrive separately via
    /// [`RaceWorld::tick_kart`].
    pub fn tick(&mut self, dt: f32) {
        self.elapsed_time += dt;
        let num_karts = self.num_karts();
        let time = self.elapsed_time;
        for kart in &mut self.karts {
            if kart.slowdown_ticks_left > 0 {
                kart.slowdown_ticks_left -= 1;
                if kart.slowdown_ticks_left == 0 {
                    kart.slowdown_fraction = 1.0;
                }
            }
            if kart.eliminated || kart.finish_time.is_some() {
                continue;
            }
            match self
                .item_policy
                .enforce_pace_car(kart.position, num_karts, time)
            {
                PaceDirective::SlowIndefinitely => {
                    kart.set_slowdown(0.1, -1);
                }
                PaceDirective::Release => {
                    if kart.slowdown_ticks_left == -1 {
                        kart.set_slowdown(1.0, 0);
                    }
                }
                PaceDirective::None => {}
            }
        }
    }

    /// Per-tick physics sample for one kart; runs the rewind-safe tyre
    /// degradation.
    pub fn tick_kart(&mut self, kart_id: usize, sample: &TyreTick) {
        let kart = &mut self.karts[kart_id];
        if kart.eliminated || kart.finish_time.is_some() {
            return;
        }
        kart.tyres.compute_degradation(sample);
    }

    /// A kart crossed the start line: update laps, lap times, the item
    /// policy and the pace car.
    pub fn on_lap_crossed(&mut self, kart_id: usize) {
        let num_karts = self.num_karts();
        let total_laps = self.setup.laps as i32;
        let time = self.elapsed_time;

        let (position, finished_laps) = {
            let kart = &mut self.karts[kart_id];
            kart.finished_laps += 1;
            kart.tyres.command_lap();

            if kart.finished_laps > 0 {
                let lap_ms = ((time - kart.lap_started_at) * 1000.0) as u32;
                if kart.best_lap_ms.map(|b| lap_ms < b).unwrap_or(true) {
                    kart.best_lap_ms = Some(lap_ms);
                }
                if self.fastest_lap_ms.map(|b| lap_ms < b).unwrap_or(true) {
                    self.fastest_lap_ms = Some(lap_ms);
                    self.fastest_lap_kart = Some(kart_id);
                }
            }
            kart.lap_started_at = time;
            (kart.position, kart.finished_laps)
        };

        if let Some(section) = self.item_policy.section_at(finished_laps) {
            let kart = &mut self.karts[kart_id];
            self.item_policy
                .apply_rules(&mut kart.items, finished_laps, total_laps, &mut self.rng);
            // The replenish rule tops karts back up to this level.
            kart.items.amount_last_lap = kart.items.amount;

            let slowed = self.item_policy.check_and_apply_pace_car(
                position,
                section,
                finished_laps,
                num_karts,
                time,
            );
            if slowed {
                self.karts[kart_id].set_slowdown(0.1, -1);
            }
        }

        if finished_laps >= total_laps && self.setup.mode.is_linear() {
            let kart = &mut self.karts[kart_id];
            kart.finish_time = Some(time);
            kart.tyres.command_end();
        }
    }

    /// Executes a pit command for a kart and applies the slowdown.
    pub fn pit_stop(&mut self, kart_id: usize, compound: i32, time_secs: u32) -> PitOutcome {
        let kart = &mut self.karts[kart_id];
        let outcome = kart.tyres.command_change(compound, time_secs);
        if compound == REFUEL_ONLY {
            kart.tyres.target_refuel = kart.tyres.current_fuel;
        }
        if outcome.slowdown_secs > 0 {
            kart.set_slowdown(
                outcome.slowdown_fraction,
                (outcome.slowdown_secs * crate::config::TICKS_PER_SECOND) as i32,
            );
        }
        outcome
    }

    /// Blue-flag check for a cake/bowl impact between two karts, fed by
    /// the game-events protocol. `line_guard` comes from server config.
    pub fn is_hit_valid(&self, sender: usize, receiver: usize, line_guard: f32) -> bool {
        let s = &self.karts[sender];
        let r = &self.karts[receiver];
        let length = self.setup.track_length;
        self.item_policy.is_hit_valid(
            s.overall_distance.rem_euclid(length),
            s.finished_laps,
            s.position,
            r.overall_distance.rem_euclid(length),
            r.position,
            r.finished_laps,
            length,
            line_guard,
            self.elapsed_time,
        )
    }

    /// Whether the finish criterion of the current mode is met.
    pub fn is_finished(&self) -> bool {
        match self.setup.mode {
            GameMode::NormalRace | GameMode::TimeTrial => self
                .karts
                .iter()
                .all(|k| k.eliminated || k.is_ai() || k.finish_time.is_some()),
            GameMode::FreeForAll | GameMode::CaptureTheFlag | GameMode::Soccer => {
                let time_up =
                    self.setup.time_limit > 0.0 && self.elapsed_time >= self.setup.time_limit;
                let value_hit = self.setup.value_limit > 0
                    && self.karts.iter().any(|k| k.score >= self.setup.value_limit);
                time_up || value_hit
            }
        }
    }

    /// Final standings: finishers by time, then the rest by distance;
    /// battle modes by score.
    pub fn final_ranking(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.karts.len()).collect();
        if self.setup.mode.is_linear() {
            order.sort_by(|&a, &b| {
                let ka = &self.karts[a];
                let kb = &self.karts[b];
                match (ka.finish_time, kb.finish_time) {
                    (Some(ta), Some(tb)) => ta.partial_cmp(&tb).unwrap_or(std::cmp::Ordering::Equal),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => kb
                        .overall_distance
                        .partial_cmp(&ka.overall_distance)
                        .unwrap_or(std::cmp::Ordering::Equal),
                }
            });
        } else {
            order.sort_by(|&a, &b| self.karts[b].score.cmp(&self.karts[a].score));
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kartnet::{Difficulty, KartTeam, WideStr};

    use crate::race::KartAssignment;

    fn assignment(host_id: u32) -> KartAssignment {
        KartAssignment {
            host_id: Some(host_id),
            local_player_id: 0,
            name: WideStr::from("p"),
            kart_name: "tux".to_string(),
            kart_team: KartTeam::None,
            handicap: 0,
            online_id: 0,
            country_code: String::new(),
            kart_color: 0.0,
        }
    }

    fn world(mode: GameMode, laps: u8, players: u32) -> RaceWorld {
        let setup = RaceSetup {
            mode,
            difficulty: Difficulty::Intermediate,
            track: "hacienda".to_string(),
            laps,
            reverse: false,
            time_limit: 0.0,
            value_limit: 0,
            item_seed: 99,
            track_length: 1000.0,
            assignments: (0..players).map(assignment).collect(),
            ai_count: 0,
        };
        RaceWorld::new(
            setup,
            ItemPolicy::default(),
            Arc::new(CompoundTable::default()),
            FuelParams {
                capacity: 1000.0,
                regen: 1.0,
                stop_ratio: 0.0,
                weight: 0.0,
                rate: 1.0,
            },
            vec![],
        )
    }

    #[test]
    fn kart_ids_are_contiguous() {
        let w = world(GameMode::NormalRace, 3, 4);
        assert_eq!(w.num_karts(), 4);
        for (i, k) in w.karts.iter().enumerate() {
            assert_eq!(k.position, i as u32 + 1);
        }
        assert_eq!(w.kart_of(2, 0), Some(2));
        assert_eq!(w.kart_of(9, 0), None);
    }

    #[test]
    fn race_finishes_when_every_kart_is_done() {
        let mut w = world(GameMode::NormalRace, 2, 2);
        assert!(!w.is_finished());
        // Each kart crosses the line three times: lap 0 (start), 1, 2.
        for kart in 0..2 {
            for _ in 0..3 {
                w.tick(1.0);
                w.on_lap_crossed(kart);
            }
        }
        assert!(w.is_finished());
        assert!(w.karts[0].finish_time.is_some());
    }

    #[test]
    fn fastest_lap_is_tracked() {
        let mut w = world(GameMode::NormalRace, 3, 2);
        w.on_lap_crossed(0); // start-line crossing, lap -1 -> 0
        w.on_lap_crossed(1);
        w.tick(30.0);
        w.on_lap_crossed(0); // 30s lap
        w.tick(25.0);
        w.on_lap_crossed(1); // 55s? no - kart 1 lap took 55s
        assert_eq!(w.fastest_lap_ms, Some(30_000));
        assert_eq!(w.fastest_lap_kart, Some(0));
    }

    #[test]
    fn soccer_finishes_on_value_limit() {
        let mut w = world(GameMode::Soccer, 0, 2);
        w.setup.value_limit = 3;
        assert!(!w.is_finished());
        w.karts[1].score = 3;
        assert!(w.is_finished());
    }

    #[test]
    fn ffa_finishes_on_time_limit() {
        let mut w = world(GameMode::FreeForAll, 0, 2);
        w.setup.time_limit = 120.0;
        w.tick(119.0);
        assert!(!w.is_finished());
        w.tick(2.0);
        assert!(w.is_finished());
    }

    #[test]
    fn released_karts_become_live_join_slots() {
        let mut w = world(GameMode::FreeForAll, 0, 3);
        assert_eq!(w.first_reserved_kart(), None);
        w.release_karts_of(1);
        assert_eq!(w.first_reserved_kart(), Some(1));
        w.occupy_kart(1, 7, 0);
        assert_eq!(w.kart_of(7, 0), Some(1));
        assert_eq!(w.first_reserved_kart(), None);
    }

    #[test]
    fn pit_stop_slows_the_kart_down() {
        let mut w = world(GameMode::NormalRace, 10, 1);
        let outcome = w.pit_stop(0, REFUEL_ONLY, 5);
        assert!(!outcome.disqualified);
        assert_eq!(w.karts[0].slowdown_fraction, 0.1);
        assert_eq!(
            w.karts[0].slowdown_ticks_left,
            (5 * crate::config::TICKS_PER_SECOND) as i32
        );
        // The slowdown expires tick by tick.
        for _ in 0..(5 * crate::config::TICKS_PER_SECOND) {
            w.tick(1.0 / 120.0);
        }
        assert_eq!(w.karts[0].slowdown_fraction, 1.0);
    }

    #[test]
    fn lapping_hit_is_rejected_under_blue_flags() {
        let mut w = world(GameMode::NormalRace, 10, 2);
        w.item_policy = ItemPolicy::parse("1 0 0001000000 0 0 0 0 0").unwrap();
        w.item_policy.leader_section = 0;
        w.karts[0].overall_distance = 300.0;
        w.karts[0].finished_laps = 5;
        w.karts[1].overall_distance = 350.0;
        w.karts[1].finished_laps = 4;
        // A lapped kart shooting the leader nearby, no line crossing.
        assert!(!w.is_hit_valid(1, 0, 0.05));
        w.karts[1].finished_laps = 5;
        assert!(w.is_hit_valid(1, 0, 0.05));
    }

    #[test]
    fn final_ranking_orders_by_time_then_distance() {
        let mut w = world(GameMode::NormalRace, 1, 3);
        w.karts[0].finish_time = Some(95.1);
        w.karts[1].finish_time = Some(94.2);
        w.karts[2].overall_distance = 500.0;
        assert_eq!(w.final_ranking(), vec![1, 0, 2]);
    }
}
