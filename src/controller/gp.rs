use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::{RwLock, RwLockReadGuard};

use async_trait::async_trait;

use kartnet::KartTeam;

/// Built-in decreasing point table for `standard` scoring.
const STANDARD_POINTS: [i32; 10] = [25, 18, 15, 12, 10, 8, 6, 4, 2, 1];

/// Points formula for a grand prix, parsed from an integer-parameter
/// string like `"inc 0 2 4 5 6 8"`. The first two parameters are
/// always pole and fastest-lap points.
#[derive(Clone, Debug, PartialEq)]
pub struct GpScoring {
    scoring_type: String,
    params: Vec<i32>,
}

impl GpScoring {
    pub fn parse(input: &str) -> Result<GpScoring> {
        let mut parts = input.split_whitespace();
        let scoring_type = parts.next().unwrap_or("").to_string();
        match scoring_type.as_str() {
            "" | "standard" | "default" | "inc" | "fixed" | "linear-gap" | "exp-gap" => {}
            other => bail!("unknown scoring type {}", other),
        }
        let mut params = Vec::new();
        for part in parts {
            params.push(part.parse::<i32>()?);
        }
        let scoring = GpScoring {
            scoring_type,
            params,
        };
        if !scoring.is_standard() && scoring.params.len() < 2 {
            bail!("custom scoring needs at least pole and fastest-lap points");
        }
        Ok(scoring)
    }

    pub fn is_standard(&self) -> bool {
        matches!(self.scoring_type.as_str(), "" | "standard" | "default")
    }

    pub fn pole_points(&self) -> i32 {
        self.params.first().copied().unwrap_or(0)
    }

    pub fn fastest_lap_points(&self) -> i32 {
        self.params.get(1).copied().unwrap_or(0)
    }

    /// Per-position tables for `inc` and `fixed`; gap-based types score
    /// from times instead.
    fn score_table(&self, num_karts: usize) -> Vec<i32> {
        match self.scoring_type.as_str() {
            "inc" => {
                let mut table: Vec<i32> = self.params.iter().skip(2).copied().collect();
                table.resize(num_karts, 0);
                table.sort_unstable();
                for i in 1..table.len() {
                    table[i] += table[i - 1];
                }
                table.reverse();
                table
            }
            "fixed" => {
                let mut table: Vec<i32> = self.params.iter().skip(2).copied().collect();
                table.resize(num_karts, 0);
                table
            }
            _ => {
                let mut table: Vec<i32> = STANDARD_POINTS.to_vec();
                table.resize(num_karts.max(STANDARD_POINTS.len()), 0);
                table
            }
        }
    }

    /// Points for finishing position `p` (1-based) with the given race
    /// time. `race_times` accumulates times per position, because the
    /// gap-based types need the winner's.
    pub fn score_for_position(
        &self,
        p: usize,
        time: f32,
        race_times: &mut HashMap<usize, f32>,
        table: &[i32],
    ) -> i32 {
        race_times.insert(p, time);
        match self.scoring_type.as_str() {
            "inc" | "fixed" => table.get(p - 1).copied().unwrap_or(0),
            "linear-gap" | "exp-gap" => {
                let winner_time = match race_times.get(&1) {
                    Some(t) => *t,
                    None => return 0,
                };
                let mut delta = (time - winner_time) as f64;
                if self.scoring_type == "exp-gap" {
                    if winner_time < 1e-6 {
                        return 0;
                    }
                    delta = (time as f64 / winner_time as f64).log2();
                }
                let mut points = self.params.get(2).copied().unwrap_or(0) as f64 * 0.001;
                let time_step = self.params.get(3).copied().unwrap_or(1) as f64 * 0.001;
                let decrease = self.params.get(4).copied().unwrap_or(0) as f64 * 0.001;
                let continuous = self.params.get(5).copied().unwrap_or(0) != 0;
                let mut steps = delta / time_step;
                if !continuous {
                    steps = steps.floor();
                }
                points -= steps * decrease;
                points.max(0.0).round() as i32
            }
            _ => table.get(p - 1).copied().unwrap_or(0),
        }
    }
}

/// One player's (or team's) running total.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GpScore {
    pub points: i32,
    /// Accumulated race time in seconds; the tie-break.
    pub accumulated_time: f32,
}

/// One finisher of a race, as the GP manager sees it.
#[derive(Clone, Debug)]
pub struct GpFinisher {
    pub player_name: String,
    pub team: KartTeam,
    /// 1-based finishing position.
    pub position: usize,
    pub time: f32,
    pub set_fastest_lap: bool,
    pub on_pole: bool,
}

#[derive(Default)]
pub struct GpScoresState {
    pub players: HashMap<String, GpScore>,
    pub teams: HashMap<KartTeam, GpScore>,
    pub tracks_done: Vec<String>,
}

/// Use to look up grand-prix standings.
#[async_trait]
pub trait LiveGpScores: Send + Sync {
    /// While holding this guard, the state is read-only, and can be
    /// referenced.
    async fn lock(&self) -> RwLockReadGuard<'_, GpScoresState>;

    /// Players ordered by points descending, accumulated time
    /// ascending.
    async fn standings(&self) -> Vec<(String, GpScore)> {
        let state = self.lock().await;
        let mut all: Vec<(String, GpScore)> = state
            .players
            .iter()
            .map(|(name, score)| (name.clone(), *score))
            .collect();
        all.sort_by(|a, b| {
            b.1.points.cmp(&a.1.points).then(
                a.1.accumulated_time
                    .partial_cmp(&b.1.accumulated_time)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
        });
        all
    }
}

#[derive(Clone)]
pub struct GpController {
    state: Arc<RwLock<GpScoresState>>,
    scoring: GpScoring,
    /// Races per grand prix; 0 disables GP accumulation.
    pub track_count: u8,
}

impl GpController {
    pub fn init(scoring: GpScoring, track_count: u8) -> Self {
        GpController {
            state: Arc::new(RwLock::new(GpScoresState::default())),
            scoring,
            track_count,
        }
    }

    pub fn is_active(&self) -> bool {
        self.track_count > 0
    }

    pub async fn is_over(&self) -> bool {
        self.track_count > 0 && self.state.read().await.tracks_done.len() >= self.track_count as usize
    }

    /// Accumulates one finished race and returns the per-player point
    /// deltas in the order of `finishers`.
    pub async fn after_race(&self, track: &str, finishers: &[GpFinisher]) -> Vec<i32> {
        let table = self.scoring.score_table(finishers.len());
        let mut race_times: HashMap<usize, f32> = HashMap::new();
        let mut state = self.state.write().await;
        state.tracks_done.push(track.to_string());

        let mut in_order: Vec<&GpFinisher> = finishers.iter().collect();
        in_order.sort_by_key(|f| f.position);

        let mut deltas_by_name: HashMap<&str, i32> = HashMap::new();
        for finisher in in_order {
            let mut delta = self.scoring.score_for_position(
                finisher.position,
                finisher.time,
                &mut race_times,
                &table,
            );
            if finisher.set_fastest_lap {
                delta += self.scoring.fastest_lap_points();
            }
            if finisher.on_pole {
                delta += self.scoring.pole_points();
            }

            let entry = state.players.entry(finisher.player_name.clone()).or_default();
            entry.points += delta;
            entry.accumulated_time += finisher.time;

            if finisher.team != KartTeam::None {
                let team = state.teams.entry(finisher.team).or_default();
                team.points += delta;
                team.accumulated_time += finisher.time;
            }
            deltas_by_name.insert(finisher.player_name.as_str(), delta);
        }

        finishers
            .iter()
            .map(|f| deltas_by_name.get(f.player_name.as_str()).copied().unwrap_or(0))
            .collect()
    }

    /// Re-keys player scores through a permutation map, used when teams
    /// are rebalanced mid-GP.
    pub async fn shuffle(&self, permutation: &HashMap<String, String>) {
        let mut state = self.state.write().await;
        let old = std::mem::take(&mut state.players);
        for (name, score) in old {
            let new_name = permutation.get(&name).cloned().unwrap_or(name);
            state.players.insert(new_name, score);
        }
    }

    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        *state = GpScoresState::default();
    }
}

#[async_trait]
impl LiveGpScores for GpController {
    async fn lock(&self) -> RwLockReadGuard<'_, GpScoresState> {
        self.state.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finisher(name: &str, position: usize, time: f32) -> GpFinisher {
        GpFinisher {
            player_name: name.to_string(),
            team: KartTeam::None,
            position,
            time,
            set_fastest_lap: false,
            on_pole: false,
        }
    }

    #[tokio::test]
    async fn standard_scoring_uses_the_builtin_table() {
        let gp = GpController::init(GpScoring::parse("standard").unwrap(), 3);
        let deltas = gp
            .after_race(
                "hacienda",
                &[
                    finisher("a", 1, 94.2),
                    finisher("b", 2, 95.1),
                    finisher("c", 3, 97.0),
                ],
            )
            .await;
        assert_eq!(deltas, vec![25, 18, 15]);
    }

    #[tokio::test]
    async fn inc_scoring_accumulates_increments() {
        // Increments 1 2 4 sorted ascending then prefix-summed and
        // reversed: 1st gets 7, 2nd 3, 3rd 1.
        let gp = GpController::init(GpScoring::parse("inc 0 0 1 2 4").unwrap(), 1);
        let deltas = gp
            .after_race(
                "oasis",
                &[
                    finisher("a", 1, 90.0),
                    finisher("b", 2, 91.0),
                    finisher("c", 3, 92.0),
                ],
            )
            .await;
        assert_eq!(deltas, vec![7, 3, 1]);
    }

    #[tokio::test]
    async fn fixed_scoring_reads_the_table_directly() {
        let gp = GpController::init(GpScoring::parse("fixed 0 0 9 5 2").unwrap(), 1);
        let deltas = gp
            .after_race("oasis", &[finisher("a", 1, 90.0), finisher("b", 2, 91.0)])
            .await;
        assert_eq!(deltas, vec![9, 5]);
    }

    #[tokio::test]
    async fn linear_gap_scores_from_time_deltas() {
        // 10 points at the front, minus 1 point per full second behind.
        let gp = GpController::init(
            GpScoring::parse("linear-gap 0 0 10000 1000 1000 0").unwrap(),
            1,
        );
        let deltas = gp
            .after_race(
                "oasis",
                &[
                    finisher("a", 1, 90.0),
                    finisher("b", 2, 91.5),
                    finisher("c", 3, 120.0),
                ],
            )
            .await;
        assert_eq!(deltas, vec![10, 9, 0]);
    }

    #[tokio::test]
    async fn fastest_lap_and_pole_awards_are_added() {
        let gp = GpController::init(GpScoring::parse("fixed 3 2 10 5").unwrap(), 1);
        let mut first = finisher("a", 1, 90.0);
        first.on_pole = true;
        let mut second = finisher("b", 2, 91.0);
        second.set_fastest_lap = true;
        let deltas = gp.after_race("oasis", &[first, second]).await;
        assert_eq!(deltas, vec![13, 7]);
    }

    #[tokio::test]
    async fn standings_order_by_points_then_time() {
        let gp = GpController::init(GpScoring::parse("fixed 0 0 10 10 5").unwrap(), 2);
        gp.after_race(
            "oasis",
            &[
                finisher("slow", 1, 100.0),
                finisher("quick", 2, 90.0),
                finisher("third", 3, 95.0),
            ],
        )
        .await;
        let standings = gp.standings().await;
        // Equal points resolve by lower accumulated time.
        assert_eq!(standings[0].0, "quick");
        assert_eq!(standings[1].0, "slow");
        assert_eq!(standings[2].0, "third");
    }

    #[tokio::test]
    async fn scores_only_grow_across_races() {
        let gp = GpController::init(GpScoring::parse("standard").unwrap(), 2);
        gp.after_race("a", &[finisher("p", 1, 90.0)]).await;
        let before = gp.lock().await.players["p"];
        gp.after_race("b", &[finisher("p", 1, 92.0)]).await;
        let after = gp.lock().await.players["p"];
        assert!(after.points >= before.points);
        assert!(after.accumulated_time >= before.accumulated_time);
        assert!(gp.is_over().await);
    }

    #[tokio::test]
    async fn team_totals_accumulate() {
        let gp = GpController::init(GpScoring::parse("standard").unwrap(), 1);
        let mut red = finisher("a", 1, 90.0);
        red.team = KartTeam::Red;
        let mut blue = finisher("b", 2, 91.0);
        blue.team = KartTeam::Blue;
        gp.after_race("oasis", &[red, blue]).await;
        let state = gp.lock().await;
        assert_eq!(state.teams[&KartTeam::Red].points, 25);
        assert_eq!(state.teams[&KartTeam::Blue].points, 18);
    }

    #[tokio::test]
    async fn shuffle_rekeys_scores() {
        let gp = GpController::init(GpScoring::parse("standard").unwrap(), 2);
        gp.after_race("oasis", &[finisher("a", 1, 90.0)]).await;
        let permutation: HashMap<String, String> =
            [("a".to_string(), "b".to_string())].into_iter().collect();
        gp.shuffle(&permutation).await;
        let state = gp.lock().await;
        assert!(state.players.contains_key("b"));
        assert!(!state.players.contains_key("a"));
    }

    #[test]
    fn bad_scoring_strings_are_rejected()
    {
        assert!(GpScoring::parse("unknown 1 2").is_err());
        assert!(GpScoring::parse("inc 1").is_err());
        assert!(GpScoring::parse("").is_ok());
    }
}
