use std::collections::VecDeque;
use std::sync::Arc;

use kartnet::{DecodeError, NetReader, NetWriter};

use crate::config::ServerConfig;

/// Compound code meaning "refuel only, keep the current tyres".
pub const REFUEL_ONLY: i32 = 123;

/// Acceleration magnitudes above this are crash artefacts and are
/// discarded from the speed-sample queue.
pub const ACCEL_CRASH_FILTER: f32 = 2300.0;

/// A tyre set whose lives are both at or above this fraction counts as
/// unused when pit-stop accounting decides whether to return it.
pub const FRESH_TYRE_THRESHOLD: f32 = 0.95;

/// Max-speed fraction while serving a pit stop.
pub const PIT_SLOWDOWN_FRACTION: f32 = 0.1;

const SPEED_FETCHING_PERIOD: f32 = 0.3;
const SPEED_ACCUMULATION_LIMIT: usize = 6;

/// Piecewise-linear response curve: sorted (x, y) points, clamped at
/// both ends.
#[derive(Clone, Debug)]
pub struct InterpolationArray {
    points: Vec<(f32, f32)>,
}

impl InterpolationArray {
    pub fn new(mut points: Vec<(f32, f32)>) -> Self {
        points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        InterpolationArray { points }
    }

    pub fn get(&self, x: f32) -> f32 {
        match self.points.len() {
            0 => 0.0,
            1 => self.points[0].1,
            _ => {
                if x <= self.points[0].0 {
                    return self.points[0].1;
                }
                for pair in self.points.windows(2) {
                    let (x0, y0) = pair[0];
                    let (x1, y1) = pair[1];
                    if x <= x1 {
                        return y0 + (y1 - y0) * (x - x0) / (x1 - x0);
                    }
                }
                self.points[self.points.len() - 1].1
            }
        }
    }
}

/// Per-compound characteristic table, indexed by `compound - 1`.
/// Loaded once per server and shared by every kart.
#[derive(Clone, Debug)]
pub struct CompoundTable {
    pub compound_count: u32,
    pub mass: f32,

    pub hardness_multiplier: Vec<f32>,
    pub ideal_temp: Vec<f32>,
    pub max_life_traction: Vec<f32>,
    pub max_life_turning: Vec<f32>,
    pub limiting_transfer_traction: Vec<f32>,
    pub regular_transfer_traction: Vec<f32>,
    pub limiting_transfer_turning: Vec<f32>,
    pub regular_transfer_turning: Vec<f32>,
    pub subtractive_traction: Vec<bool>,
    pub subtractive_turning: Vec<bool>,
    pub subtractive_topspeed: Vec<bool>,
    pub initial_bonus_mult_traction: Vec<f32>,
    pub initial_bonus_add_traction: Vec<f32>,
    pub initial_bonus_mult_turning: Vec<f32>,
    pub initial_bonus_add_turning: Vec<f32>,
    pub initial_bonus_mult_topspeed: Vec<f32>,
    pub initial_bonus_add_topspeed: Vec<f32>,
    pub traction_constant: Vec<f32>,
    pub turning_constant: Vec<f32>,
    pub topspeed_constant: Vec<f32>,
    pub offroad_factor: Vec<f32>,
    pub skid_factor: Vec<f32>,
    pub brake_threshold: Vec<f32>,
    pub crash_penalty: Vec<f32>,

    pub heat_cycle_hardness_curve: InterpolationArray,
    pub hardness_penalty_curve: InterpolationArray,
    pub response_curve_traction: InterpolationArray,
    pub response_curve_turning: InterpolationArray,
    pub response_curve_topspeed: InterpolationArray,
}

impl Default for CompoundTable {
    /// Three compounds, soft to hard: soft grips more and wears faster.
    fn default() -> Self {
        // The response curves cover one 101-unit band per compound
        // (see Tyres::correct): life percentage 0..100 maps into
        // [101 * (compound - 1), 101 * (compound - 1) + 100].
        let response = |base: f32| {
            InterpolationArray::new(vec![
                (0.0, base * 0.55),
                (50.0, base * 0.85),
                (100.0, base),
                (101.0, base * 0.6),
                (151.0, base * 0.88),
                (201.0, base),
                (202.0, base * 0.65),
                (252.0, base * 0.9),
                (302.0, base),
            ])
        };
        CompoundTable {
            compound_count: 3,
            mass: 350.0,
            hardness_multiplier: vec![0.8, 1.0, 1.25],
            ideal_temp: vec![85.0, 92.0, 100.0],
            max_life_traction: vec![90.0, 140.0, 210.0],
            max_life_turning: vec![80.0, 130.0, 200.0],
            limiting_transfer_traction: vec![0.35, 0.3, 0.25],
            regular_transfer_traction: vec![0.12, 0.1, 0.08],
            limiting_transfer_turning: vec![0.35, 0.3, 0.25],
            regular_transfer_turning: vec![0.12, 0.1, 0.08],
            subtractive_traction: vec![false, false, false],
            subtractive_turning: vec![false, false, false],
            subtractive_topspeed: vec![false, false, false],
            initial_bonus_mult_traction: vec![1.12, 1.05, 1.0],
            initial_bonus_add_traction: vec![0.0, 0.0, 0.0],
            initial_bonus_mult_turning: vec![1.1, 1.04, 1.0],
            initial_bonus_add_turning: vec![0.0, 0.0, 0.0],
            initial_bonus_mult_topspeed: vec![1.06, 1.02, 1.0],
            initial_bonus_add_topspeed: vec![0.0, 0.0, 0.0],
            traction_constant: vec![1.0, 1.0, 1.0],
            turning_constant: vec![1.0, 1.0, 1.0],
            topspeed_constant: vec![1.0, 1.0, 1.0],
            offroad_factor: vec![4.0, 3.0, 2.5],
            skid_factor: vec![3.0, 2.5, 2.0],
            brake_threshold: vec![0.6, 0.6, 0.6],
            crash_penalty: vec![6.0, 5.0, 4.0],
            heat_cycle_hardness_curve: InterpolationArray::new(vec![
                (0.0, 1.0),
                (5.0, 1.1),
                (15.0, 1.35),
            ]),
            hardness_penalty_curve: InterpolationArray::new(vec![
                (0.0, 1.0),
                (35.0, 0.92),
                (100.0, 0.8),
            ]),
            response_curve_traction: response(1.0),
            response_curve_turning: response(1.0),
            response_curve_topspeed: response(1.0),
        }
    }
}

impl CompoundTable {
    /// Builds the table from the configured compound list; an empty
    /// list keeps the built-in three-compound table. Curves fall back
    /// to the built-ins when their point lists are empty.
    pub fn from_config(config: &ServerConfig) -> CompoundTable {
        let builtin = CompoundTable::default();
        if config.tyre_compounds.is_empty() {
            return builtin;
        }

        let curve = |points: &[(f32, f32)], fallback: InterpolationArray| {
            if points.is_empty() {
                fallback
            } else {
                InterpolationArray::new(points.to_vec())
            }
        };
        let compounds = &config.tyre_compounds;

        CompoundTable {
            compound_count: compounds.len() as u32,
            mass: config.kart_mass,
            hardness_multiplier: compounds.iter().map(|c| c.hardness_multiplier).collect(),
            ideal_temp: compounds.iter().map(|c| c.ideal_temp).collect(),
            max_life_traction: compounds.iter().map(|c| c.max_life_traction).collect(),
            max_life_turning: compounds.iter().map(|c| c.max_life_turning).collect(),
            limiting_transfer_traction: compounds
                .iter()
                .map(|c| c.limiting_transfer_traction)
                .collect(),
            regular_transfer_traction: compounds
                .iter()
                .map(|c| c.regular_transfer_traction)
                .collect(),
            limiting_transfer_turning: compounds
                .iter()
                .map(|c| c.limiting_transfer_turning)
                .collect(),
            regular_transfer_turning: compounds
                .iter()
                .map(|c| c.regular_transfer_turning)
                .collect(),
            subtractive_traction: compounds.iter().map(|c| c.subtractive_traction).collect(),
            subtractive_turning: compounds.iter().map(|c| c.subtractive_turning).collect(),
            subtractive_topspeed: compounds.iter().map(|c| c.subtractive_topspeed).collect(),
            initial_bonus_mult_traction: compounds
                .iter()
                .map(|c| c.initial_bonus_mult_traction)
                .collect(),
            initial_bonus_add_traction: compounds
                .iter()
                .map(|c| c.initial_bonus_add_traction)
                .collect(),
            initial_bonus_mult_turning: compounds
                .iter()
                .map(|c| c.initial_bonus_mult_turning)
                .collect(),
            initial_bonus_add_turning: compounds
                .iter()
                .map(|c| c.initial_bonus_add_turning)
                .collect(),
            initial_bonus_mult_topspeed: compounds
                .iter()
                .map(|c| c.initial_bonus_mult_topspeed)
                .collect(),
            initial_bonus_add_topspeed: compounds
                .iter()
                .map(|c| c.initial_bonus_add_topspeed)
                .collect(),
            traction_constant: compounds.iter().map(|c| c.traction_constant).collect(),
            turning_constant: compounds.iter().map(|c| c.turning_constant).collect(),
            topspeed_constant: compounds.iter().map(|c| c.topspeed_constant).collect(),
            offroad_factor: compounds.iter().map(|c| c.offroad_factor).collect(),
            skid_factor: compounds.iter().map(|c| c.skid_factor).collect(),
            brake_threshold: compounds.iter().map(|c| c.brake_threshold).collect(),
            crash_penalty: compounds.iter().map(|c| c.crash_penalty).collect(),
            heat_cycle_hardness_curve: curve(
                &config.tyre_heat_cycle_hardness_curve,
                builtin.heat_cycle_hardness_curve,
            ),
            hardness_penalty_curve: curve(
                &config.tyre_hardness_penalty_curve,
                builtin.hardness_penalty_curve,
            ),
            response_curve_traction: curve(
                &config.tyre_response_curve_traction,
                builtin.response_curve_traction,
            ),
            response_curve_turning: curve(
                &config.tyre_response_curve_turning,
                builtin.response_curve_turning,
            ),
            response_curve_topspeed: curve(
                &config.tyre_response_curve_topspeed,
                builtin.response_curve_topspeed,
            ),
        }
    }
}

/// Fuel parameters shared by every kart, clamped from config.
#[derive(Clone, Copy, Debug)]
pub struct FuelParams {
    pub capacity: f32,
    pub regen: f32,
    pub stop_ratio: f32,
    pub weight: f32,
    pub rate: f32,
}

impl FuelParams {
    pub fn from_config(config: &ServerConfig) -> Self {
        FuelParams {
            capacity: config.fuel_capacity.max(1.0).min(1000.0),
            regen: config.fuel_regen.max(0.0).min(100.0),
            stop_ratio: config.fuel_stop_ratio.max(0.0).min(1000.0),
            weight: (config.fuel_weight / 100.0).max(0.0).min(1.0),
            rate: config.fuel_rate.max(0.0).min(1000.0),
        }
    }
}

/// Per-tick physics inputs sampled from the simulation.
#[derive(Clone, Copy, Debug)]
pub struct TyreTick {
    pub dt: f32,
    pub speed: f32,
    pub on_ground: bool,
    pub skidding: bool,
    pub using_zipper: bool,
    /// Terrain max-speed fraction; below 0.98 counts as offroad.
    pub slowdown: f32,
    pub brake: f32,
    pub steer: f32,
    pub throttle: f32,
}

/// Effect of a pit command, applied by the world to the kart.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PitOutcome {
    pub slowdown_fraction: f32,
    pub slowdown_secs: u32,
    pub disqualified: bool,
}

/// One completed stint: (compound, laps driven).
pub type Stint = (u32, u32);

/// Rewind-safe tyre and fuel state of one kart.
#[derive(Clone, Debug)]
pub struct Tyres {
    table: Arc<CompoundTable>,
    fuel_params: FuelParams,

    pub current_life_traction: f32,
    pub current_life_turning: f32,
    pub current_temp: f32,
    pub heat_cycle_count: f32,
    pub current_fuel: f32,
    pub target_refuel: f32,
    pub current_compound: u32,
    pub lap_count: u8,
    pub compound_queue: Vec<i32>,
    pub high_fuel_demand: bool,
    pub is_refueling: bool,
    pub is_disqualified: bool,
    pub stints: Vec<Stint>,

    time_elapsed: f32,
    acceleration: f32,
    previous_speeds: VecDeque<f32>,
    center_of_gravity_x: f32,
    center_of_gravity_y: f32,
}

impl Tyres {
    pub fn new(
        table: Arc<CompoundTable>,
        fuel_params: FuelParams,
        starting_compound: u32,
        compound_queue: Vec<i32>,
    ) -> Self {
        let compound = ((starting_compound.max(1) - 1) % table.compound_count) + 1;
        let idx = (compound - 1) as usize;
        Tyres {
            current_life_traction: table.max_life_traction[idx],
            current_life_turning: table.max_life_turning[idx],
            current_temp: table.ideal_temp[idx],
            heat_cycle_count: 0.0,
            current_fuel: fuel_params.capacity,
            target_refuel: 0.0,
            current_compound: compound,
            lap_count: 0,
            compound_queue,
            high_fuel_demand: false,
            is_refueling: false,
            is_disqualified: false,
            stints: vec![],
            time_elapsed: 0.0,
            acceleration: 0.0,
            previous_speeds: VecDeque::new(),
            center_of_gravity_x: 0.0,
            center_of_gravity_y: 0.0,
            table,
            fuel_params,
        }
    }

    fn idx(&self) -> usize {
        (self.current_compound - 1) as usize
    }

    fn current_hardness(&self) -> f32 {
        self.table.hardness_multiplier[self.idx()]
            * self.table.heat_cycle_hardness_curve.get(self.heat_cycle_count)
    }

    fn hardness_penalty(&self) -> f32 {
        let base = self.table.hardness_multiplier[self.idx()];
        let current = self.current_hardness();
        let deviation = (current - base) / base;
        current * self.table.hardness_penalty_curve.get(deviation * 100.0)
    }

    /// Shifts a life percentage into the response-curve band of the
    /// current compound.
    fn correct(&self, f: f32) -> f32 {
        100.0 * (self.current_compound - 1) as f32 + (self.current_compound - 1) as f32 + f
    }

    pub fn max_life_traction(&self) -> f32 {
        self.table.max_life_traction[self.idx()]
    }

    pub fn max_life_turning(&self) -> f32 {
        self.table.max_life_turning[self.idx()]
    }

    /// Degrades traction, turning and fuel for one physics tick.
    pub fn compute_degradation(&mut self, tick: &TyreTick) {
        self.time_elapsed += tick.dt;
        let speed = tick.speed;

        if self.time_elapsed % SPEED_FETCHING_PERIOD < tick.dt {
            self.previous_speeds.push_back(speed);
            if self.previous_speeds.len() > SPEED_ACCUMULATION_LIMIT {
                self.previous_speeds.pop_front();
            }
            if self.previous_speeds.len() >= 2 {
                let n = self.previous_speeds.len();
                self.acceleration = (speed - self.previous_speeds[n - 2]) / tick.dt;
                for i in 0..n.saturating_sub(2) {
                    let candidate = (speed - self.previous_speeds[i]) / tick.dt;
                    if candidate.abs() < self.acceleration.abs()
                        && candidate.abs() < ACCEL_CRASH_FILTER
                    {
                        self.acceleration = candidate;
                    }
                }
            }
            if tick.slowdown < 0.5 && !tick.using_zipper {
                // No fair traction reading on surfaces this slow.
                self.acceleration = 0.0;
            }
        }

        // Not really the turn radius, but proportional to it.
        let turn_radius = if tick.steer.abs() > f32::EPSILON {
            1.0 / tick.steer
        } else {
            f32::INFINITY
        };
        let hardness = self.current_hardness();
        let idx = self.idx();

        self.center_of_gravity_x = self.acceleration * self.table.mass;
        self.center_of_gravity_y = ((speed * speed) / turn_radius) * self.table.mass;

        // Midair, reversing and crawling karts do not degrade.
        if !tick.on_ground || speed < 1.0 {
            self.high_fuel_demand = false;
            return;
        }

        if tick.throttle >= 0.45 {
            self.high_fuel_demand = true;
            self.current_fuel -= speed.abs() * tick.dt * self.fuel_params.rate / 1000.0;
        } else {
            self.high_fuel_demand = false;
            self.current_fuel -= 0.5 * speed.abs() * tick.dt * self.fuel_params.rate / 1000.0;
        }

        let mut regen_amount = 0.0;
        if self.center_of_gravity_x < 0.0 && tick.throttle < 0.3 {
            regen_amount +=
                self.center_of_gravity_x.abs() * 1e-8 * tick.dt * self.fuel_params.regen;
        }

        let mut deg_tra = tick.dt * self.center_of_gravity_x.abs() * hardness / 100_000.0;
        deg_tra += tick.dt * speed.abs() / 50.0;

        if tick.brake > self.table.brake_threshold[idx] {
            deg_tra *= tick.brake / self.table.brake_threshold[idx];
            regen_amount *= 2.0;
        }
        if tick.slowdown < 0.98 && !tick.using_zipper {
            deg_tra *= self.table.offroad_factor[idx];
        }

        let mut deg_tur = tick.dt * self.center_of_gravity_y.abs() * hardness / 10_000.0;
        if tick.skidding {
            deg_tur *= self.table.skid_factor[idx];
            regen_amount *= 2.0;
        }

        self.current_fuel = (self.current_fuel + regen_amount).clamp(0.0, 1000.0);

        let deg_tra_percent = deg_tra / self.table.max_life_traction[idx];
        let deg_tur_percent = deg_tur / self.table.max_life_turning[idx];

        // Whichever axis has less life left is the limiting one; wear on
        // one axis bleeds into the other through the transfer factors.
        if self.current_life_traction < self.current_life_turning {
            self.current_life_turning -= deg_tra_percent
                * self.table.limiting_transfer_traction[idx]
                * self.table.max_life_turning[idx];
            self.current_life_traction -= deg_tur_percent
                * self.table.regular_transfer_turning[idx]
                * self.table.max_life_traction[idx];
        } else {
            self.current_life_turning -= deg_tra_percent
                * self.table.regular_transfer_traction[idx]
                * self.table.max_life_turning[idx];
            self.current_life_traction -= deg_tur_percent
                * self.table.limiting_transfer_turning[idx]
                * self.table.max_life_traction[idx];
        }

        self.current_life_traction = (self.current_life_traction - deg_tra).max(0.0);
        self.current_life_turning = (self.current_life_turning - deg_tur).max(0.0);
    }

    pub fn apply_crash_penalty(&mut self) {
        let idx = self.idx();
        self.current_life_traction -=
            self.table.crash_penalty[idx] / 100.0 * self.table.max_life_traction[idx];
        self.current_life_turning -=
            self.table.crash_penalty[idx] / 100.0 * self.table.max_life_turning[idx];
        self.current_life_traction = self.current_life_traction.max(0.0);
        self.current_life_turning = self.current_life_turning.max(0.0);
    }

    pub fn deg_engine_force(&self, initial_force: f32) -> f32 {
        let idx = self.idx();
        let percent = self.current_life_traction / self.table.max_life_traction[idx];
        let factor = self.table.response_curve_traction.get(self.correct(percent * 100.0))
            * self.table.traction_constant[idx];
        let bonus = (initial_force + self.table.initial_bonus_add_traction[idx])
            * self.table.initial_bonus_mult_traction[idx];
        if self.table.subtractive_traction[idx] {
            bonus - self.hardness_penalty() * factor
        } else {
            bonus * self.hardness_penalty() * factor
        }
    }

    pub fn deg_turn_radius(&self, initial_radius: f32) -> f32 {
        let idx = self.idx();
        let percent = self.current_life_turning / self.table.max_life_turning[idx];
        let factor = self.table.response_curve_turning.get(self.correct(percent * 100.0))
            * self.table.turning_constant[idx];
        let bonus = (initial_radius + self.table.initial_bonus_add_turning[idx])
            * self.table.initial_bonus_mult_turning[idx];
        if self.table.subtractive_turning[idx] {
            bonus - self.hardness_penalty() * factor
        } else {
            bonus * self.hardness_penalty() * factor
        }
    }

    /// An out-of-fuel kart is capped to walking pace.
    pub fn deg_top_speed(&self, initial_topspeed: f32) -> f32 {
        let idx = self.idx();
        if self.current_fuel <= 0.1 {
            return 5.0;
        }
        let percent = self.current_life_traction / self.table.max_life_traction[idx];
        let factor = self.table.response_curve_topspeed.get(self.correct(percent * 100.0))
            * self.table.topspeed_constant[idx];
        let bonus = (initial_topspeed + self.table.initial_bonus_add_topspeed[idx])
            * self.table.initial_bonus_mult_topspeed[idx];
        if self.table.subtractive_topspeed[idx] {
            bonus - self.hardness_penalty() * factor
        } else {
            bonus * self.hardness_penalty() * factor
        }
    }

    /// Serialises the rewindable state in declared order.
    pub fn save_state(&self, buffer: &mut NetWriter) {
        buffer.add_f32(self.current_life_traction);
        buffer.add_f32(self.current_life_turning);
        buffer.add_f32(self.current_temp);
        buffer.add_f32(self.heat_cycle_count);
        buffer.add_f32(self.current_fuel);
        buffer.add_f32(self.target_refuel);
        buffer.add_u8(self.current_compound as u8);
        buffer.add_u8(self.lap_count);
        buffer.add_u8(self.compound_queue.len() as u8);
        for entry in &self.compound_queue {
            // Shift by one so the -1 "infinite" marker fits a u8.
            buffer.add_u8((entry + 1) as u8);
        }
    }

    /// Restores exactly what [`Tyres::save_state`] wrote.
    pub fn rewind_to(&mut self, buffer: &mut NetReader<'_>) -> Result<(), DecodeError> {
        self.current_life_traction = buffer.get_f32()?;
        self.current_life_turning = buffer.get_f32()?;
        self.current_temp = buffer.get_f32()?;
        self.heat_cycle_count = buffer.get_f32()?;
        self.current_fuel = buffer.get_f32()?;
        self.target_refuel = buffer.get_f32()?;
        self.current_compound = buffer.get_u8()? as u32;
        self.lap_count = buffer.get_u8()?;
        let queue_size = buffer.get_u8()? as usize;
        let mut queue = Vec::with_capacity(queue_size);
        for _ in 0..queue_size {
            queue.push(buffer.get_u8()? as i32 - 1);
        }
        self.compound_queue = queue;
        Ok(())
    }

    /// A lap boundary was crossed on these tyres.
    pub fn command_lap(&mut self) {
        self.lap_count += 1;
    }

    /// The race ended; close the running stint.
    pub fn command_end(&mut self) {
        self.stints.push((self.current_compound, self.lap_count as u32 + 1));
        self.lap_count = 0;
    }

    /// Executes a pit command: change to `compound` (or just refuel for
    /// [`REFUEL_ONLY`]) while stopped for `time_secs` seconds.
    pub fn command_change(&mut self, compound: i32, time_secs: u32) -> PitOutcome {
        if compound == REFUEL_ONLY {
            self.is_refueling = true;
            return PitOutcome {
                slowdown_fraction: PIT_SLOWDOWN_FRACTION,
                slowdown_secs: time_secs,
                disqualified: false,
            };
        }

        self.stints.push((self.current_compound, self.lap_count as u32));
        self.lap_count = 0;

        let prev_compound = self.current_compound;
        let prev_trac = self.current_life_traction / self.max_life_traction();
        let prev_tur = self.current_life_turning / self.max_life_turning();

        self.current_compound = if compound >= 1 {
            ((compound as u32 - 1) % self.table.compound_count) + 1
        } else {
            (compound.unsigned_abs() % self.table.compound_count) + 1
        };

        // Fresh tyres for the new compound.
        let idx = self.idx();
        self.current_life_traction = self.table.max_life_traction[idx];
        self.current_life_turning = self.table.max_life_turning[idx];
        self.current_temp = self.table.ideal_temp[idx];
        self.heat_cycle_count = 0.0;
        self.previous_speeds.clear();
        self.acceleration = 0.0;

        let mut disqualified = false;
        // An empty queue means the compound limit is not active.
        if !self.compound_queue.is_empty()
            && self.compound_queue.len() >= self.current_compound as usize
        {
            let new_idx = (self.current_compound - 1) as usize;
            let pitting_for_same = prev_compound == self.current_compound;
            // A couple of ulps of slack so a set stored as exactly the
            // threshold fraction of max life still counts as fresh.
            let fresh = FRESH_TYRE_THRESHOLD - 4.0 * f32::EPSILON;
            let old_tyres_were_fresh = prev_trac >= fresh && prev_tur >= fresh;
            let new_tyre_is_available = self.compound_queue[new_idx] != 0;
            let new_tyre_is_infinite = self.compound_queue[new_idx] == -1;
            let prev_idx = (prev_compound - 1) as usize;
            let prev_tyre_is_infinite = self
                .compound_queue
                .get(prev_idx)
                .map(|n| *n == -1)
                .unwrap_or(false);

            // An accidental second stop for the same unused compound is
            // not punished.
            let same_pitstop_twice = pitting_for_same && old_tyres_were_fresh;
            let should_disqualify = !new_tyre_is_available && !same_pitstop_twice;
            let reduce_current = new_tyre_is_available && !same_pitstop_twice;
            let return_old = !pitting_for_same && old_tyres_were_fresh;

            if return_old && !prev_tyre_is_infinite {
                if let Some(slot) = self.compound_queue.get_mut(prev_idx) {
                    *slot += 1;
                }
            }
            if reduce_current && !new_tyre_is_infinite {
                self.compound_queue[new_idx] -= 1;
            }
            if should_disqualify {
                // Pitting with no compound left halves both lives.
                self.is_disqualified = true;
                self.current_life_traction *= 0.5;
                self.current_life_turning *= 0.5;
                disqualified = true;
            }
        }

        PitOutcome {
            slowdown_fraction: PIT_SLOWDOWN_FRACTION,
            slowdown_secs: time_secs,
            disqualified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fuel() -> FuelParams {
        FuelParams {
            capacity: 1000.0,
            regen: 1.0,
            stop_ratio: 0.0,
            weight: 0.0,
            rate: 1.0,
        }
    }

    fn tyres(queue: Vec<i32>) -> Tyres {
        Tyres::new(Arc::new(CompoundTable::default()), fuel(), 1, queue)
    }

    fn driving_tick() -> TyreTick {
        TyreTick {
            dt: 1.0 / 120.0,
            speed: 25.0,
            on_ground: true,
            skidding: false,
            using_zipper: false,
            slowdown: 1.0,
            brake: 0.0,
            steer: 0.2,
            throttle: 1.0,
        }
    }

    #[test]
    fn lives_stay_in_bounds_under_load() {
        let mut t = tyres(vec![]);
        for _ in 0..120 * 60 {
            t.compute_degradation(&driving_tick());
        }
        assert!(t.current_life_traction >= 0.0);
        assert!(t.current_life_traction <= t.max_life_traction());
        assert!(t.current_life_turning >= 0.0);
        assert!(t.current_life_turning <= t.max_life_turning());
        assert!(t.current_life_traction < t.max_life_traction());
    }

    #[test]
    fn no_degradation_midair_or_crawling() {
        let mut t = tyres(vec![]);
        let mut tick = driving_tick();
        tick.on_ground = false;
        t.compute_degradation(&tick);
        assert_eq!(t.current_life_traction, t.max_life_traction());

        tick.on_ground = true;
        tick.speed = 0.5;
        t.compute_degradation(&tick);
        assert_eq!(t.current_life_traction, t.max_life_traction());
        assert_eq!(t.current_fuel, 1000.0);
    }

    #[test]
    fn fuel_burns_at_half_rate_off_throttle() {
        let mut full = tyres(vec![]);
        let mut coasting = tyres(vec![]);
        let mut tick = driving_tick();
        // Skip past the first sampling window so both see equal inputs.
        full.compute_degradation(&tick);
        let full_burn = 1000.0 - full.current_fuel;
        tick.throttle = 0.2;
        coasting.compute_degradation(&tick);
        let coast_burn = 1000.0 - coasting.current_fuel;
        assert!((coast_burn - full_burn / 2.0).abs() < 1e-6);
    }

    #[test]
    fn empty_tank_caps_top_speed() {
        let mut t = tyres(vec![]);
        t.current_fuel = 0.05;
        assert_eq!(t.deg_top_speed(30.0), 5.0);
        t.current_fuel = 500.0;
        assert!(t.deg_top_speed(30.0) > 5.0);
    }

    #[test]
    fn save_then_rewind_is_identity() {
        let mut t = tyres(vec![2, 1, -1]);
        for _ in 0..500 {
            t.compute_degradation(&driving_tick());
        }
        t.lap_count = 4;
        t.target_refuel = 120.0;

        let mut w = NetWriter::new();
        t.save_state(&mut w);
        let bytes = w.into_bytes();

        let mut other = tyres(vec![0, 0, 0]);
        let mut r = NetReader::new(&bytes);
        other.rewind_to(&mut r).unwrap();

        assert_eq!(other.current_life_traction, t.current_life_traction);
        assert_eq!(other.current_life_turning, t.current_life_turning);
        assert_eq!(other.current_fuel, t.current_fuel);
        assert_eq!(other.target_refuel, t.target_refuel);
        assert_eq!(other.current_compound, t.current_compound);
        assert_eq!(other.lap_count, t.lap_count);
        assert_eq!(other.compound_queue, vec![2, 1, -1]);
    }

    #[test]
    fn pit_stop_returns_unused_compound_and_takes_new() {
        // Queue [2, 1, -1]: two of compound 1, one of compound 2,
        // unlimited compound 3. Both axes at 0.95 count as unused.
        let mut t = tyres(vec![2, 1, -1]);
        t.current_life_traction = 0.95 * t.max_life_traction();
        t.current_life_turning = 0.95 * t.max_life_turning();

        let outcome = t.command_change(2, 5);
        assert_eq!(t.current_compound, 2);
        assert_eq!(t.compound_queue, vec![3, 0, -1]);
        assert!(!outcome.disqualified);
        assert_eq!(outcome.slowdown_secs, 5);
        assert_eq!(outcome.slowdown_fraction, PIT_SLOWDOWN_FRACTION);
        // Fresh tyres of the new compound.
        assert_eq!(t.current_life_traction, t.max_life_traction());
    }

    #[test]
    fn pit_stop_with_empty_slot_disqualifies_and_halves_lives() {
        let mut t = tyres(vec![1, 0, -1]);
        // Worn tyres, so the old set is not returned.
        t.current_life_traction = 0.4 * t.max_life_traction();
        t.current_life_turning = 0.4 * t.max_life_turning();

        let outcome = t.command_change(2, 5);
        assert!(outcome.disqualified);
        assert!(t.is_disqualified);
        assert_eq!(t.current_life_traction, 0.5 * t.max_life_traction());
        // The empty slot is not driven negative.
        assert_eq!(t.compound_queue[1], 0);
    }

    #[test]
    fn same_pitstop_twice_is_not_punished() {
        let mut t = tyres(vec![0, 1, -1]);
        t.current_compound = 2;
        // Fresh set of compound 2, stopping for compound 2 again.
        t.current_life_traction = t.max_life_traction();
        t.current_life_turning = t.max_life_turning();

        let outcome = t.command_change(2, 3);
        assert!(!outcome.disqualified);
        assert_eq!(t.compound_queue, vec![0, 1, -1]);
    }

    #[test]
    fn refuel_sentinel_keeps_tyres() {
        let mut t = tyres(vec![2, 1, -1]);
        t.current_life_traction = 42.0;
        let outcome = t.command_change(REFUEL_ONLY, 7);
        assert!(t.is_refueling);
        assert_eq!(t.current_life_traction, 42.0);
        assert_eq!(t.compound_queue, vec![2, 1, -1]);
        assert_eq!(outcome.slowdown_secs, 7);
    }

    #[test]
    fn crash_penalty_reduces_both_axes() {
        let mut t = tyres(vec![]);
        t.apply_crash_penalty();
        assert!(t.current_life_traction < t.max_life_traction());
        assert!(t.current_life_turning < t.max_life_turning());
    }

    #[test]
    fn compound_table_comes_from_config() {
        use crate::config::TyreCompoundConfig;

        let mut config = crate::test_support::test_config();
        config.kart_mass = 400.0;
        config.tyre_compounds = vec![
            TyreCompoundConfig {
                hardness_multiplier: 0.7,
                max_life_traction: 80.0,
                max_life_turning: 70.0,
                ..Default::default()
            },
            TyreCompoundConfig {
                hardness_multiplier: 1.3,
                max_life_traction: 220.0,
                max_life_turning: 210.0,
                subtractive_topspeed: true,
                ..Default::default()
            },
        ];
        config.tyre_response_curve_topspeed = vec![(0.0, 0.5), (100.0, 1.0), (101.0, 0.5), (201.0, 1.0)];

        let table = CompoundTable::from_config(&config);
        assert_eq!(table.compound_count, 2);
        assert_eq!(table.mass, 400.0);
        assert_eq!(table.max_life_traction, vec![80.0, 220.0]);
        assert_eq!(table.subtractive_topspeed, vec![false, true]);
        assert_eq!(table.response_curve_topspeed.get(50.0), 0.75);
        // Unconfigured curves keep the built-ins.
        assert_eq!(
            table.heat_cycle_hardness_curve.get(0.0),
            CompoundTable::default().heat_cycle_hardness_curve.get(0.0)
        );

        // A kart on the configured table starts on compound 1's values.
        let t = Tyres::new(Arc::new(table), fuel(), 1, vec![]);
        assert_eq!(t.max_life_traction(), 80.0);
    }

    #[test]
    fn empty_compound_list_keeps_the_builtin_table() {
        let config = crate::test_support::test_config();
        let table = CompoundTable::from_config(&config);
        assert_eq!(table.compound_count, 3);
        assert_eq!(
            table.max_life_traction,
            CompoundTable::default().max_life_traction
        );
    }

    #[test]
    fn interpolation_clamps_and_interpolates() {
        let curve = InterpolationArray::new(vec![(0.0, 1.0), (10.0, 2.0)]);
        assert_eq!(curve.get(-5.0), 1.0);
        assert_eq!(curve.get(5.0), 1.5);
        assert_eq!(curve.get(20.0), 2.0);
    }
}
