use anyhow::{bail, Result};
use bitflags::bitflags;
use rand::Rng;

use crate::config::time_to_ticks;

bitflags! {
    /// Per-section rule bits of the item policy.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PolicyRules: u16 {
        /// Grant `linear_mult × remaining_laps` items at section start.
        const LINEAR = 1 << 0;
        /// Clear current items at section start.
        const CLEAR = 1 << 1;
        /// Grant `items_per_lap` on every lap of the section.
        const GRADUAL = 1 << 2;
        /// With GRADUAL, refill to lap-start level instead of adding.
        const REPLENISH = 1 << 3;
        /// Cap items at `progressive_cap × remaining_laps`.
        const PROGRESSIVE_CAP = 1 << 4;
        /// Redraw the item type on every granting event.
        const OVERWRITE_ITEMS = 1 << 5;
        /// Disable cake/bowl damage between lappers and lapped karts.
        const BLUE_FLAGS = 1 << 6;
        const FORBID_BONUSBOX = 1 << 7;
        const FORBID_BANANA = 1 << 8;
        const FORBID_NITRO = 1 << 9;
        /// Enter a pace-car restart on section entry.
        const VIRTUAL_PACE = 1 << 10;
        /// The pace car lets lapped karts catch up before the restart.
        const UNLAPPING = 1 << 11;
        /// Bonus boxes draw from this section's item table.
        const BONUS_BOX_OVERRIDE = 1 << 12;
        /// Ignore configured weights and balance automatically.
        const AUTOMATIC_WEIGHTS = 1 << 13;
    }
}

/// Held power-up kinds a policy section can hand out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerupType {
    Nothing,
    Bubblegum,
    Cake,
    Bowling,
    Zipper,
    Plunger,
    Switch,
    Swatter,
    Rubberball,
    Parachute,
    Anvil,
}

impl PowerupType {
    pub fn from_name(name: &str) -> Option<PowerupType> {
        use PowerupType::*;
        Some(match name {
            "nothing" => Nothing,
            "bubblegum" | "gum" => Bubblegum,
            "cake" => Cake,
            "bowling" | "bowl" => Bowling,
            "zipper" => Zipper,
            "plunger" => Plunger,
            "switch" => Switch,
            "swatter" => Swatter,
            "rubberball" | "ball" => Rubberball,
            "parachute" => Parachute,
            "anvil" => Anvil,
            _ => return None,
        })
    }

    pub fn as_name(self) -> &'static str {
        use PowerupType::*;
        match self {
            Nothing => "nothing",
            Bubblegum => "bubblegum",
            Cake => "cake",
            Bowling => "bowling",
            Zipper => "zipper",
            Plunger => "plunger",
            Switch => "switch",
            Swatter => "swatter",
            Rubberball => "rubberball",
            Parachute => "parachute",
            Anvil => "anvil",
        }
    }
}

/// Track item kinds, for respawn decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackItemType {
    BonusBox,
    Banana,
    NitroBig,
    NitroSmall,
    Bubblegum,
    BubblegumNolok,
    EasterEgg,
}

/// A contiguous range of laps with a uniform rule set. Only the start
/// lap is stored; the section runs until the next one begins.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemPolicySection {
    pub section_start: i32,
    pub rules: PolicyRules,
    pub linear_mult: f32,
    pub items_per_lap: f32,
    pub progressive_cap: f32,
    pub virtual_pace_gaps: f32,
    pub possible_types: Vec<PowerupType>,
    pub weight_distribution: Vec<i32>,
}

/// The item-relevant slice of one kart the policy reads and writes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KartItems {
    pub item_type: PowerupType,
    pub amount: i32,
    pub amount_last_lap: i32,
}

/// What the virtual pace car wants done with a kart this tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaceDirective {
    /// Apply (or reaffirm) the bubble-gum-class slowdown, open-ended.
    SlowIndefinitely,
    /// The kart's staggered restart time has come; lift the slowdown.
    Release,
    None,
}

/// Per-race item rule engine. `virtual_pace_code` encodes the pace-car
/// procedure:
/// - `code <= -3`: restart scheduled; a kart resumes at
///   `-(code + 3) + position × gap`;
/// - `code == -2`: slow down immediately and indefinitely;
/// - `code == -1`: normal racing;
/// - `code >= 0`: slow down when the kart finishes lap `code`.
#[derive(Clone, Debug)]
pub struct ItemPolicy {
    pub sections: Vec<ItemPolicySection>,
    /// Section the race leader is in; -1 before the first lap counts.
    pub leader_section: i32,
    pub virtual_pace_code: i32,
    /// Karts already slowed for the pending restart.
    pub restart_count: i32,
}

impl Default for ItemPolicy {
    fn default() -> Self {
        ItemPolicy::parse("normal").expect("builtin preset must parse")
    }
}

const NORMAL_PRESET: &str = "1 0 0000000000 0 0 0 0 0";
const TIME_TRIAL_PRESET: &str = "1 0 0010000001 1 0 0 0 1 zipper 1";

impl ItemPolicy {
    /// Parses the textual policy format: section count, then per section
    /// the start lap, a rule bitstring, the four multipliers, and a
    /// length-prefixed `type weight` list. The presets `normal` and
    /// `tt` are accepted as shorthands.
    pub fn parse(input: &str) -> Result<ItemPolicy> {
        let input = input.trim();
        match input {
            "" | "normal" => return ItemPolicy::parse(NORMAL_PRESET),
            "tt" | "timetrial" | "time-trial" => return ItemPolicy::parse(TIME_TRIAL_PRESET),
            _ => {}
        }

        let mut tokens = input.split_whitespace();
        let mut next = || -> Result<&str> {
            tokens
                .next()
                .ok_or_else(|| anyhow::anyhow!("truncated item policy string"))
        };

        let section_count: usize = next()?.parse()?;
        let mut sections = Vec::with_capacity(section_count);
        for _ in 0..section_count {
            let section_start: i32 = next()?.parse()?;

            let bitstring = next()?;
            let mut rules = PolicyRules::empty();
            for (i, c) in bitstring.chars().rev().enumerate() {
                if c != '0' {
                    rules |= PolicyRules::from_bits_truncate(1 << i);
                }
            }

            let linear_mult: f32 = next()?.parse()?;
            let items_per_lap: f32 = next()?.parse()?;
            let progressive_cap: f32 = next()?.parse()?;
            let virtual_pace_gaps: f32 = next()?.parse()?;

            let item_count: usize = next()?.parse()?;
            let mut possible_types = Vec::with_capacity(item_count);
            let mut weight_distribution = Vec::with_capacity(item_count);
            for _ in 0..item_count {
                let name = next()?;
                let item = PowerupType::from_name(name)
                    .ok_or_else(|| anyhow::anyhow!("unknown item type {:?}", name))?;
                possible_types.push(item);
                weight_distribution.push(next()?.parse()?);
            }

            sections.push(ItemPolicySection {
                section_start,
                rules,
                linear_mult,
                items_per_lap,
                progressive_cap,
                virtual_pace_gaps,
                possible_types,
                weight_distribution,
            });
        }

        if sections.is_empty() {
            bail!("item policy has no sections");
        }
        if !sections.windows(2).all(|w| w[0].section_start <= w[1].section_start) {
            bail!("item policy sections must be ordered by start lap");
        }

        Ok(ItemPolicy {
            sections,
            leader_section: -1,
            virtual_pace_code: -1,
            restart_count: -1,
        })
    }

    pub fn to_policy_string(&self) -> String {
        let mut out = format!("{}", self.sections.len());
        for s in &self.sections {
            out.push_str(&format!(
                " {} {:014b} {} {} {} {} {}",
                s.section_start,
                s.rules.bits(),
                s.linear_mult,
                s.items_per_lap,
                s.progressive_cap,
                s.virtual_pace_gaps,
                s.possible_types.len(),
            ));
            for (item, weight) in s.possible_types.iter().zip(&s.weight_distribution) {
                out.push_str(&format!(" {} {}", item.as_name(), weight));
            }
        }
        out
    }

    /// Index of the section applying at `current_lap`: the
    /// highest-indexed section whose start lap has been reached.
    pub fn section_at(&self, current_lap: i32) -> Option<usize> {
        self.sections
            .iter()
            .rposition(|s| s.section_start <= current_lap)
    }

    fn next_section_start(&self, section_idx: usize, total_laps: i32) -> i32 {
        self.sections
            .get(section_idx + 1)
            .map(|s| s.section_start)
            .unwrap_or(total_laps)
    }

    /// Draws an index from the weighted list. `AUTOMATIC_WEIGHTS`
    /// callers pass uniform weights.
    fn select_item_from<R: Rng>(
        types: &[PowerupType],
        weights: &[i32],
        rng: &mut R,
    ) -> Option<usize> {
        if types.len() != weights.len() || types.is_empty() {
            log::error!("mismatched item policy type and weight list sizes");
            return None;
        }
        let total: i32 = weights.iter().sum();
        if total <= 0 {
            return None;
        }
        let mut roll = rng.gen_range(0..total);
        for (i, w) in weights.iter().enumerate() {
            if roll < *w {
                return Some(i);
            }
            roll -= w;
        }
        unreachable!("weighted draw must land inside the list");
    }

    /// Applies the rules for `current_lap` to one kart, and returns the
    /// index of the section that was applied.
    pub fn apply_rules<R: Rng>(
        &mut self,
        kart: &mut KartItems,
        current_lap: i32,
        total_laps: i32,
        rng: &mut R,
    ) -> Option<usize> {
        let section_idx = self.section_at(current_lap)?;
        let next_start = self.next_section_start(section_idx, total_laps);
        self.apply_section_rules(section_idx, kart, next_start, current_lap, rng);
        Some(section_idx)
    }

    fn apply_section_rules<R: Rng>(
        &self,
        section_idx: usize,
        kart: &mut KartItems,
        next_section_start: i32,
        current_lap: i32,
        rng: &mut R,
    ) {
        let section = &self.sections[section_idx];
        let rules = section.rules;

        let overwrite = rules.contains(PolicyRules::OVERWRITE_ITEMS);
        let linear_add = rules.contains(PolicyRules::LINEAR);
        let linear_clear = rules.contains(PolicyRules::CLEAR);
        let gradual_add = rules.contains(PolicyRules::GRADUAL);
        let gradual_replenish = rules.contains(PolicyRules::REPLENISH);
        let progressive_cap = rules.contains(PolicyRules::PROGRESSIVE_CAP);
        let section_start = current_lap == section.section_start;
        let active_role = gradual_add || gradual_replenish;

        let items_per_lap = section.items_per_lap as i32;
        let mut amount_to_add = if section_start {
            items_per_lap
        } else {
            kart.amount_last_lap - kart.amount
        };
        amount_to_add = amount_to_add.min(items_per_lap);
        if gradual_add && !gradual_replenish {
            amount_to_add = items_per_lap;
        }
        if !gradual_add {
            amount_to_add = 0;
        }

        let remaining_laps = next_section_start - current_lap;
        let amount_to_add_linear = if section_start && linear_add {
            (section.linear_mult * remaining_laps as f32) as i32
        } else {
            0
        };

        // An empty weight list means every item type is acceptable.
        let empty_weights = section.weight_distribution.is_empty();
        let item_is_valid =
            empty_weights || section.possible_types.contains(&kart.item_type);

        let mut new_amount = if item_is_valid { kart.amount } else { 0 };
        if section_start && linear_clear {
            new_amount = 0;
        }
        new_amount += amount_to_add;
        new_amount += amount_to_add_linear;

        let cap = (section.progressive_cap * remaining_laps as f32) as i32;
        if progressive_cap && new_amount > cap {
            new_amount = cap;
        }

        let mut new_type = kart.item_type;
        if !empty_weights {
            let mut selecting_item = overwrite || new_amount == 0;
            selecting_item |= section_start && (linear_clear || new_amount != 0);
            selecting_item |= !section_start && !item_is_valid && active_role;

            if selecting_item {
                let uniform;
                let weights = if rules.contains(PolicyRules::AUTOMATIC_WEIGHTS) {
                    uniform = vec![1; section.possible_types.len()];
                    &uniform
                } else {
                    &section.weight_distribution
                };
                match Self::select_item_from(&section.possible_types, weights, rng) {
                    Some(index) => new_type = section.possible_types[index],
                    None => return,
                }
            }
        }

        // No item type without an amount, and vice versa.
        if new_amount <= 0 {
            new_type = PowerupType::Nothing;
        }
        if new_type == PowerupType::Nothing {
            new_amount = 0;
        }

        kart.item_type = new_type;
        kart.amount = new_amount;
    }

    fn section_forbids(rules: PolicyRules, curr: TrackItemType, orig: TrackItemType) -> bool {
        use TrackItemType::*;
        let is_nitro = matches!(curr, NitroBig | NitroSmall);
        let was_nitro = matches!(orig, NitroBig | NitroSmall);
        (rules.contains(PolicyRules::FORBID_BONUSBOX) && curr == BonusBox)
            || (rules.contains(PolicyRules::FORBID_BANANA) && curr == Banana)
            || (rules.contains(PolicyRules::FORBID_NITRO) && (is_nitro || was_nitro))
    }

    /// Decides when a (possibly switched) track item may respawn, in
    /// ticks. Forbidden categories are pushed out practically forever;
    /// a category becoming allowed again has an abnormally high counter
    /// snapped back to the normal respawn time.
    pub fn compute_item_ticks_till_return(
        &self,
        orig_type: TrackItemType,
        curr_type: TrackItemType,
        curr_type_respawn_ticks: u32,
        curr_ticks_till_return: u32,
    ) -> u32 {
        let current_section = self.leader_section.max(0) as usize;
        let rules_curr = self.sections[current_section].rules;
        let rules_prev = if current_section > 0 {
            self.sections[current_section - 1].rules
        } else {
            rules_curr
        };

        let forbid_prev = Self::section_forbids(rules_prev, curr_type, orig_type);
        let forbid_curr = Self::section_forbids(rules_curr, curr_type, orig_type);

        let mut new_ticks = curr_ticks_till_return;
        if forbid_curr {
            new_ticks = time_to_ticks(99_999.0);
        } else if curr_ticks_till_return > 10 * curr_type_respawn_ticks
            && (forbid_prev || curr_type != TrackItemType::EasterEgg)
        {
            new_ticks = curr_type_respawn_ticks;
        }

        // A gum switched into nitro is available immediately.
        let was_gum = orig_type == TrackItemType::Bubblegum
            || curr_type == TrackItemType::BubblegumNolok;
        let is_nitro = matches!(curr_type, TrackItemType::NitroBig | TrackItemType::NitroSmall);
        if was_gum && is_nitro {
            new_ticks = 0;
        }

        new_ticks
    }

    fn kart_under_pace_slowdown(&self, position: u32, current_time: f32) -> bool {
        let start_of_race_vpc = self.leader_section <= -1
            && self.sections[0].rules.contains(PolicyRules::VIRTUAL_PACE);
        if start_of_race_vpc {
            // The procedure has not formally begun, but overtaking
            // before the green flag must not pay off.
            return true;
        }
        if self.virtual_pace_code > -3 {
            return false;
        }
        let restart_time = -(self.virtual_pace_code + 3);
        let gap = self.sections[self.leader_section.max(0) as usize].virtual_pace_gaps;
        let my_restart = restart_time as f32 + gap * position as f32;
        current_time <= my_restart
    }

    /// Blue-flag check: whether a cake/bowl hit from `sender` on `recv`
    /// counts as damaging. `line_guard` is the dead zone (as a fraction
    /// of track length) around half the lap in which across-the-line
    /// detection is meaningless.
    #[allow(clippy::too_many_arguments)]
    pub fn is_hit_valid(
        &self,
        sender_distance: f32,
        sender_lap: i32,
        sender_position: u32,
        recv_distance: f32,
        recv_position: u32,
        recv_lap: i32,
        track_length: f32,
        line_guard: f32,
        current_time: f32,
    ) -> bool {
        let leader_section = self.leader_section;
        if leader_section <= -1 {
            return true;
        }
        if !self.sections[leader_section as usize]
            .rules
            .contains(PolicyRules::BLUE_FLAGS)
        {
            return true;
        }

        // No hits land during a pace-car restart.
        if self.kart_under_pace_slowdown(sender_position, current_time)
            || self.kart_under_pace_slowdown(recv_position, current_time)
        {
            return false;
        }

        let distance_normal = (sender_distance - recv_distance).abs();
        let distance_complementary = track_length - distance_normal;

        let mut across_finish_line = distance_complementary < distance_normal;
        let forwards_throw = sender_distance > recv_distance;

        // Within the guard band around half the track it is nonsense to
        // guess whether the hit crosses the line.
        let half_band = distance_normal / track_length;
        if half_band > 0.5 - line_guard && half_band < 0.5 + line_guard {
            across_finish_line = false;
        }

        if across_finish_line && forwards_throw {
            recv_lap - sender_lap == 1
        } else if across_finish_line {
            sender_lap - recv_lap == 1
        } else {
            sender_lap == recv_lap
        }
    }

    /// Called when a kart crosses a lap boundary: the leader drags the
    /// policy into its section and may arm the pace car; karts reaching
    /// the trigger lap engage their slowdown. Returns whether this kart
    /// slowed down.
    pub fn check_and_apply_pace_car(
        &mut self,
        position: u32,
        kart_section: usize,
        finished_laps: i32,
        num_karts: u32,
        current_time: f32,
    ) -> bool {
        if position == 1 {
            self.leader_section = kart_section as i32;
            let section = &self.sections[kart_section];
            let start_lap = section.section_start;
            let do_virtual_pace = section.rules.contains(PolicyRules::VIRTUAL_PACE);
            let do_unlapping = section.rules.contains(PolicyRules::UNLAPPING);
            if do_virtual_pace && start_lap == finished_laps {
                self.restart_count = 0;
                self.virtual_pace_code = if do_unlapping {
                    // Lapped karts slow once they reach the lead lap.
                    start_lap
                } else {
                    // Everyone slows at the next line pass.
                    -2
                };
            }
        }

        let mut slowed_down = false;
        if self.virtual_pace_code == finished_laps || self.virtual_pace_code == -2 {
            self.restart_count += 1;
            slowed_down = true;
        }

        let is_last = self.restart_count == num_karts as i32;
        if slowed_down && is_last {
            // The last kart is in line; schedule the staggered restart.
            self.virtual_pace_code = -(current_time as i32) - 3;
        }

        slowed_down
    }

    /// Per-tick pace-car enforcement for one kart.
    pub fn enforce_pace_car(
        &mut self,
        position: u32,
        num_karts: u32,
        current_time: f32,
    ) -> PaceDirective {
        let start_of_race_vpc = self.leader_section <= -1
            && self.sections[0].rules.contains(PolicyRules::VIRTUAL_PACE);
        if start_of_race_vpc {
            return PaceDirective::SlowIndefinitely;
        }

        let is_restart = self.virtual_pace_code <= -3;
        let mut did_restart = false;
        if is_restart {
            let restart_time = -(self.virtual_pace_code + 3);
            let gap = self.sections[self.leader_section.max(0) as usize].virtual_pace_gaps;
            let my_restart = restart_time as f32 + gap * position as f32;
            if current_time > my_restart {
                did_restart = true;
            }
        }

        if is_restart && position == num_karts && did_restart {
            // The last kart has resumed; racing is normal again.
            self.virtual_pace_code = -1;
            self.restart_count = -1;
        }

        if is_restart && !did_restart {
            // Reaffirmed every tick so a gum hit cannot shorten it.
            PaceDirective::SlowIndefinitely
        } else if is_restart && did_restart {
            PaceDirective::Release
        } else {
            PaceDirective::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn section(start: i32, rules: PolicyRules) -> ItemPolicySection {
        ItemPolicySection {
            section_start: start,
            rules,
            linear_mult: 0.0,
            items_per_lap: 0.0,
            progressive_cap: 0.0,
            virtual_pace_gaps: 0.0,
            possible_types: vec![],
            weight_distribution: vec![],
        }
    }

    fn policy(sections: Vec<ItemPolicySection>) -> ItemPolicy {
        ItemPolicy {
            sections,
            leader_section: -1,
            virtual_pace_code: -1,
            restart_count: -1,
        }
    }

    #[test]
    fn highest_applicable_section_wins() {
        let p = policy(vec![
            section(0, PolicyRules::empty()),
            section(3, PolicyRules::empty()),
            section(6, PolicyRules::empty()),
        ]);
        assert_eq!(p.section_at(0), Some(0));
        assert_eq!(p.section_at(4), Some(1));
        assert_eq!(p.section_at(6), Some(2));
        assert_eq!(p.section_at(99), Some(2));
        assert_eq!(p.section_at(-1), None);
    }

    #[test]
    fn linear_grant_scales_with_remaining_laps() {
        let mut s = section(2, PolicyRules::LINEAR | PolicyRules::CLEAR);
        s.linear_mult = 2.0;
        let mut p = policy(vec![section(0, PolicyRules::empty()), s]);
        let mut kart = KartItems {
            item_type: PowerupType::Cake,
            amount: 1,
            amount_last_lap: 1,
        };
        // Section 1 starts at lap 2; with 10 total laps, 8 remain.
        let applied = p.apply_rules(&mut kart, 2, 10, &mut rng());
        assert_eq!(applied, Some(1));
        assert_eq!(kart.amount, 16);
        // Items were cleared first, then granted; type preserved since
        // the weight list is empty.
        assert_eq!(kart.item_type, PowerupType::Cake);
    }

    #[test]
    fn gradual_replenish_refills_to_lap_start_level() {
        let mut s = section(0, PolicyRules::GRADUAL | PolicyRules::REPLENISH);
        s.items_per_lap = 3.0;
        let mut p = policy(vec![s]);
        let mut kart = KartItems {
            item_type: PowerupType::Bowling,
            amount: 1,
            amount_last_lap: 3,
        };
        // Spent 2 since last lap; refilled by exactly those 2.
        p.apply_rules(&mut kart, 4, 10, &mut rng());
        assert_eq!(kart.amount, 3);
    }

    #[test]
    fn gradual_without_replenish_always_adds() {
        let mut s = section(0, PolicyRules::GRADUAL);
        s.items_per_lap = 2.0;
        let mut p = policy(vec![s]);
        let mut kart = KartItems {
            item_type: PowerupType::Bowling,
            amount: 3,
            amount_last_lap: 3,
        };
        p.apply_rules(&mut kart, 4, 10, &mut rng());
        assert_eq!(kart.amount, 5);
    }

    #[test]
    fn progressive_cap_bounds_the_pile() {
        let mut s = section(0, PolicyRules::GRADUAL | PolicyRules::PROGRESSIVE_CAP);
        s.items_per_lap = 5.0;
        s.progressive_cap = 1.0;
        let mut p = policy(vec![s]);
        let mut kart = KartItems {
            item_type: PowerupType::Bowling,
            amount: 9,
            amount_last_lap: 9,
        };
        p.apply_rules(&mut kart, 7, 10, &mut rng());
        // cap = progressive_cap × remaining = 1 × 3.
        assert!(kart.amount <= 3);
    }

    #[test]
    fn invalid_item_type_is_redrawn_from_table() {
        let mut s = section(0, PolicyRules::GRADUAL);
        s.items_per_lap = 1.0;
        s.possible_types = vec![PowerupType::Zipper];
        s.weight_distribution = vec![1];
        let mut p = policy(vec![s]);
        let mut kart = KartItems {
            item_type: PowerupType::Cake,
            amount: 2,
            amount_last_lap: 2,
        };
        p.apply_rules(&mut kart, 3, 10, &mut rng());
        assert_eq!(kart.item_type, PowerupType::Zipper);
    }

    #[test]
    fn zero_amount_means_no_item() {
        let s = section(0, PolicyRules::CLEAR);
        let mut p = policy(vec![s]);
        let mut kart = KartItems {
            item_type: PowerupType::Cake,
            amount: 4,
            amount_last_lap: 4,
        };
        p.apply_rules(&mut kart, 0, 10, &mut rng());
        assert_eq!(kart.amount, 0);
        assert_eq!(kart.item_type, PowerupType::Nothing);
    }

    #[test]
    fn preset_round_trip() {
        let p = ItemPolicy::parse("tt").unwrap();
        assert_eq!(p.sections.len(), 1);
        assert!(p.sections[0].rules.contains(PolicyRules::LINEAR));
        assert!(p.sections[0].rules.contains(PolicyRules::FORBID_BONUSBOX));
        assert_eq!(p.sections[0].possible_types, vec![PowerupType::Zipper]);

        let text = p.to_policy_string();
        let back = ItemPolicy::parse(&text).unwrap();
        assert_eq!(back.sections, p.sections);
    }

    #[test]
    fn unordered_sections_are_rejected() {
        assert!(ItemPolicy::parse("2 5 0000000000 0 0 0 0 0 1 0000000000 0 0 0 0 0").is_err());
    }

    #[test]
    fn forbidden_category_never_respawns() {
        let mut p = policy(vec![section(0, PolicyRules::FORBID_BANANA)]);
        p.leader_section = 0;
        let ticks = p.compute_item_ticks_till_return(
            TrackItemType::Banana,
            TrackItemType::Banana,
            240,
            100,
        );
        assert_eq!(ticks, time_to_ticks(99_999.0));
    }

    #[test]
    fn unforbidden_item_snaps_back_to_normal_respawn() {
        let mut p = policy(vec![
            section(0, PolicyRules::FORBID_BANANA),
            section(3, PolicyRules::empty()),
        ]);
        p.leader_section = 1;
        let ticks = p.compute_item_ticks_till_return(
            TrackItemType::Banana,
            TrackItemType::Banana,
            240,
            time_to_ticks(99_999.0),
        );
        assert_eq!(ticks, 240);
    }

    #[test]
    fn switched_gum_to_nitro_is_instant()
    {
        let mut p = policy(vec![section(0, PolicyRules::empty())]);
        p.leader_section = 0;
        let ticks = p.compute_item_ticks_till_return(
            TrackItemType::Bubblegum,
            TrackItemType::NitroSmall,
            240,
            90,
        );
        assert_eq!(ticks, 0);
    }

    #[test]
    fn hit_valid_same_lap_no_line_crossing() {
        let mut p = policy(vec![section(0, PolicyRules::BLUE_FLAGS)]);
        p.leader_section = 0;
        assert!(p.is_hit_valid(100.0, 2, 2, 150.0, 1, 2, 1000.0, 0.05, 10.0));
        // A lap mismatch without a line crossing is a lapping situation.
        assert!(!p.is_hit_valid(100.0, 2, 2, 150.0, 1, 3, 1000.0, 0.05, 10.0));
    }

    #[test]
    fn hit_across_finish_line_needs_matching_lap_delta() {
        let mut p = policy(vec![section(0, PolicyRules::BLUE_FLAGS)]);
        p.leader_section = 0;
        // Sender at 950, receiver at 30 on a 1000 track: the receiver
        // is one lap ahead across the line; a forwards throw is fine.
        assert!(p.is_hit_valid(950.0, 2, 2, 30.0, 1, 3, 1000.0, 0.05, 10.0));
        assert!(!p.is_hit_valid(950.0, 2, 2, 30.0, 1, 2, 1000.0, 0.05, 10.0));
    }

    #[test]
    fn half_track_guard_disables_line_detection() {
        let mut p = policy(vec![section(0, PolicyRules::BLUE_FLAGS)]);
        p.leader_section = 0;
        // 480/1000 lies within 5% of half the lap: treat as same-lap.
        assert!(p.is_hit_valid(0.0, 2, 2, 480.0, 1, 2, 1000.0, 0.05, 10.0));
        // With a zero guard the complementary distance rule kicks in
        // only past the true half, so this stays a same-lap hit too.
        assert!(p.is_hit_valid(0.0, 2, 2, 480.0, 1, 2, 1000.0, 0.0, 10.0));
    }

    #[test]
    fn blue_flags_off_allows_everything() {
        let mut p = policy(vec![section(0, PolicyRules::empty())]);
        p.leader_section = 0;
        assert!(p.is_hit_valid(950.0, 2, 2, 30.0, 1, 2, 1000.0, 0.05, 10.0));
    }

    #[test]
    fn pace_car_engages_and_schedules_staggered_restart() {
        let mut s = section(5, PolicyRules::VIRTUAL_PACE | PolicyRules::UNLAPPING);
        s.virtual_pace_gaps = 1.5;
        let mut p = policy(vec![section(0, PolicyRules::empty()), s]);

        // Leader crosses into lap 5: code becomes the trigger lap.
        assert!(p.check_and_apply_pace_car(1, 1, 5, 3, 100.0));
        assert_eq!(p.virtual_pace_code, 5);
        assert_eq!(p.restart_count, 1);

        // Second kart reaches lap 5 and engages.
        assert!(p.check_and_apply_pace_car(2, 1, 5, 3, 110.0));
        assert_eq!(p.restart_count, 2);

        // Last kart engages; the restart gets scheduled off the clock.
        assert!(p.check_and_apply_pace_car(3, 1, 5, 3, 120.0));
        assert_eq!(p.virtual_pace_code, -123);

        // Before its slot, position 3 stays slowed; afterwards released.
        assert_eq!(
            p.enforce_pace_car(3, 3, 124.0),
            PaceDirective::SlowIndefinitely
        );
        assert_eq!(p.enforce_pace_car(1, 3, 122.0), PaceDirective::Release);
        // Position 3 restarts at 120 + 3 × 1.5 = 124.5.
        assert_eq!(p.enforce_pace_car(3, 3, 125.0), PaceDirective::Release);
        // The last kart releasing resets the procedure.
        assert_eq!(p.virtual_pace_code, -1);
        assert_eq!(p.restart_count, -1);
    }

    #[test]
    fn without_unlapping_everyone_slows_immediately() {
        let s = section(2, PolicyRules::VIRTUAL_PACE);
        let mut p = policy(vec![section(0, PolicyRules::empty()), s]);
        p.check_and_apply_pace_car(1, 1, 2, 4, 50.0);
        assert_eq!(p.virtual_pace_code, -2);
        // A lapped kart crossing the line on lap 1 still engages.
        assert!(p.check_and_apply_pace_car(4, 0, 1, 4, 51.0));
    }

    #[test]
    fn start_of_race_pace_car_slows_before_first_lap() {
        let mut p = policy(vec![section(0, PolicyRules::VIRTUAL_PACE)]);
        p.leader_section = -1;
        assert_eq!(
            p.enforce_pace_car(1, 4, 0.5),
            PaceDirective::SlowIndefinitely
        );
    }
}
