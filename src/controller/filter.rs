use std::collections::{HashMap, HashSet};

use rand::seq::IteratorRandom;
use rand::Rng;

/// Candidate set a filter narrows, plus everything the filter language
/// can refer to.
#[derive(Clone, Debug, Default)]
pub struct FilterContext {
    pub username: String,
    /// The candidate asset names; `apply` removes from this set.
    pub elements: HashSet<String>,
    pub num_players: usize,
    /// Map history for `%i` wildcards: index 0 is the most recent map.
    pub wildcards: Vec<String>,
    /// Official (as opposed to addon) assets, for the `official` /
    /// `addon` keywords.
    pub official: HashSet<String>,
    /// Assets the server can actually load, for `available`.
    pub available: HashSet<String>,
    pub applied_at_selection_start: bool,
}

/// Textual map filter: `[not] token [token…]` where tokens are names
/// (optionally `name:max_players`), `%i` history wildcards, or the
/// keywords `available`, `unavailable`, `official`, `addon`,
/// `random [N]`, `other:yes`, `other:no`.
#[derive(Clone, Debug, Default)]
pub struct TrackFilter {
    initial_string: String,
    include_available: bool,
    include_unavailable: bool,
    include_official: bool,
    include_addons: bool,
    pick_random: bool,
    random_count: usize,
    allowed: HashSet<String>,
    forbidden: HashSet<String>,
    wildcard_allowed: Vec<i32>,
    wildcard_forbidden: Vec<i32>,
    max_players: HashMap<String, usize>,
    /// Whether names the filter does not mention stay in the set.
    others: bool,
}

impl TrackFilter {
    pub fn parse(input: &str) -> TrackFilter {
        let mut f = TrackFilter {
            initial_string: input.to_string(),
            include_available: true,
            include_unavailable: true,
            include_official: true,
            include_addons: true,
            ..Default::default()
        };

        let tokens: Vec<&str> = input.split_whitespace().collect();
        let mut good = true;
        let mut explicit_others = None;
        let mut i = 0;
        while i < tokens.len() {
            let token = tokens[i];
            match token {
                "random" => {
                    f.pick_random = true;
                    f.random_count = 1;
                    if let Some(n) = tokens.get(i + 1).and_then(|t| t.parse::<usize>().ok()) {
                        if n > 0 {
                            f.random_count = n;
                            i += 1;
                        }
                    }
                }
                "available" => f.include_unavailable = false,
                "unavailable" => f.include_available = false,
                "official" => f.include_addons = false,
                "addon" => f.include_official = false,
                "not" | "no" => {
                    good = false;
                    if i == 0 {
                        f.others = true;
                    }
                }
                "yes" | "ok" => good = true,
                "other:yes" => explicit_others = Some(true),
                "other:no" => explicit_others = Some(false),
                _ if token.starts_with('%') => match token[1..].parse::<i32>() {
                    Ok(index) => {
                        if good {
                            f.wildcard_allowed.push(index);
                        } else {
                            f.wildcard_forbidden.push(index);
                        }
                    }
                    Err(_) => {
                        log::warn!("unable to parse wildcard index from {:?}, omitting it", token);
                    }
                },
                _ => {
                    let (name, cap) = match token.split_once(':') {
                        Some((name, cap_str)) => match cap_str.parse::<usize>() {
                            Ok(cap) => (name, Some(cap)),
                            Err(_) => {
                                log::warn!(
                                    "incorrect max-players value in {:?}, ignoring the cap",
                                    token
                                );
                                (name, None)
                            }
                        },
                        None => (token, None),
                    };
                    if let Some(cap) = cap {
                        f.max_players.insert(name.to_string(), cap);
                    }
                    if good {
                        f.allowed.insert(name.to_string());
                    } else {
                        f.forbidden.insert(name.to_string());
                    }
                }
            }
            i += 1;
        }

        if let Some(others) = explicit_others {
            f.others = others;
        }
        f
    }

    /// A placeholder filter that keeps everything.
    pub fn placeholder() -> TrackFilter {
        TrackFilter::parse("")
    }

    pub fn is_picking_random(&self) -> bool {
        self.pick_random
    }

    pub fn initial_string(&self) -> &str {
        &self.initial_string
    }

    fn wildcard<'a>(&self, ctx: &'a FilterContext, index: i32) -> Option<&'a str> {
        if index < 0 {
            return None;
        }
        ctx.wildcards.get(index as usize).map(|s| s.as_str())
    }

    pub fn apply<R: Rng>(&self, ctx: &mut FilterContext, rng: &mut R) {
        let allowed: HashSet<String> = self
            .allowed
            .iter()
            .cloned()
            .chain(
                self.wildcard_allowed
                    .iter()
                    .filter_map(|i| self.wildcard(ctx, *i).map(|s| s.to_string())),
            )
            .collect();
        let forbidden: HashSet<String> = self
            .forbidden
            .iter()
            .cloned()
            .chain(
                self.wildcard_forbidden
                    .iter()
                    .filter_map(|i| self.wildcard(ctx, *i).map(|s| s.to_string())),
            )
            .collect();

        let others = self.others;
        let official = ctx.official.clone();
        let available = ctx.available.clone();
        let num_players = ctx.num_players;

        ctx.elements.retain(|name| {
            if forbidden.contains(name) {
                return false;
            }
            let mentioned = allowed.contains(name);
            if !mentioned && !others && !allowed.is_empty() {
                return false;
            }
            if !self.include_official && official.contains(name) {
                return false;
            }
            if !self.include_addons && !official.contains(name) {
                return false;
            }
            if !self.include_available && available.contains(name) {
                return false;
            }
            if !self.include_unavailable && !available.contains(name) {
                return false;
            }
            if let Some(cap) = self.max_players.get(name) {
                if num_players > *cap {
                    return false;
                }
            }
            true
        });

        if self.pick_random && ctx.elements.len() > self.random_count {
            let mut names: Vec<String> = ctx.elements.iter().cloned().collect();
            names.sort(); // stable input order for the sampler
            let chosen = names.into_iter().choose_multiple(rng, self.random_count);
            ctx.elements = chosen.into_iter().collect();
        }
    }
}

/// Kart filter: same grammar minus wildcards, plus `random a b c`
/// groups where one kart of the group is drawn for players who picked
/// nothing.
#[derive(Clone, Debug, Default)]
pub struct KartFilter {
    initial_string: String,
    allowed: HashSet<String>,
    forbidden: HashSet<String>,
    random_groups: Vec<Vec<String>>,
    others: bool,
    ignore_players_input: bool,
}

impl KartFilter {
    pub fn parse(input: &str) -> KartFilter {
        let mut f = KartFilter {
            initial_string: input.to_string(),
            ..Default::default()
        };
        let mut good = true;
        let mut in_random_group = false;
        for (i, token) in input.split_whitespace().enumerate() {
            match token {
                "not" | "no" => {
                    good = false;
                    in_random_group = false;
                    if i == 0 {
                        f.others = true;
                    }
                }
                "yes" | "ok" => {
                    good = true;
                    in_random_group = false;
                }
                "random" => {
                    in_random_group = true;
                    f.random_groups.push(vec![]);
                }
                "force-random" => {
                    f.ignore_players_input = true;
                    in_random_group = true;
                    f.random_groups.push(vec![]);
                }
                "other:yes" => f.others = true,
                "other:no" => f.others = false,
                _ => {
                    if in_random_group {
                        if let Some(group) = f.random_groups.last_mut() {
                            group.push(token.to_string());
                        }
                    } else if good {
                        f.allowed.insert(token.to_string());
                    } else {
                        f.forbidden.insert(token.to_string());
                    }
                }
            }
        }
        f
    }

    pub fn ignores_players_input(&self) -> bool {
        self.ignore_players_input
    }

    pub fn initial_string(&self) -> &str {
        &self.initial_string
    }

    pub fn apply(&self, ctx: &mut FilterContext) {
        let allowed = &self.allowed;
        let forbidden = &self.forbidden;
        let others = self.others;
        ctx.elements.retain(|name| {
            if forbidden.contains(name) {
                return false;
            }
            if allowed.is_empty() {
                return true;
            }
            allowed.contains(name) || others
        });
    }

    /// Draws a kart for a player whose own choice was empty or ignored.
    pub fn pick_for_empty_choice<R: Rng>(
        &self,
        ctx: &FilterContext,
        rng: &mut R,
    ) -> Option<String> {
        for group in &self.random_groups {
            let candidates: Vec<&String> =
                group.iter().filter(|k| ctx.elements.contains(*k)).collect();
            if let Some(kart) = candidates.into_iter().choose(rng) {
                return Some(kart.clone());
            }
        }
        let mut names: Vec<&String> = ctx.elements.iter().collect();
        names.sort();
        names.into_iter().choose(rng).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(3)
    }

    fn ctx(elements: &[&str]) -> FilterContext {
        FilterContext {
            elements: elements.iter().map(|s| s.to_string()).collect(),
            available: elements.iter().map(|s| s.to_string()).collect(),
            num_players: 4,
            ..Default::default()
        }
    }

    #[test]
    fn positive_list_keeps_only_named_tracks() {
        let filter = TrackFilter::parse("hacienda oasis");
        let mut c = ctx(&["hacienda", "oasis", "volcano"]);
        filter.apply(&mut c, &mut rng());
        assert_eq!(c.elements.len(), 2);
        assert!(c.elements.contains("hacienda"));
        assert!(!c.elements.contains("volcano"));
    }

    #[test]
    fn not_list_keeps_everything_else() {
        let filter = TrackFilter::parse("not volcano");
        let mut c = ctx(&["hacienda", "oasis", "volcano"]);
        filter.apply(&mut c, &mut rng());
        assert_eq!(c.elements.len(), 2);
        assert!(!c.elements.contains("volcano"));
    }

    #[test]
    fn official_keyword_drops_addons() {
        let filter = TrackFilter::parse("official");
        let mut c = ctx(&["hacienda", "addon_city"]);
        c.official = ["hacienda".to_string()].into_iter().collect();
        filter.apply(&mut c, &mut rng());
        assert_eq!(c.elements.len(), 1);
        assert!(c.elements.contains("hacienda"));
    }

    #[test]
    fn history_wildcards_forbid_recent_maps() {
        let filter = TrackFilter::parse("not %0 %1");
        let mut c = ctx(&["hacienda", "oasis", "volcano"]);
        c.wildcards = vec!["hacienda".to_string(), "oasis".to_string()];
        filter.apply(&mut c, &mut rng());
        assert_eq!(c.elements.len(), 1);
        assert!(c.elements.contains("volcano"));
    }

    #[test]
    fn random_keyword_samples_the_requested_count() {
        let filter = TrackFilter::parse("random 2");
        let mut c = ctx(&["a", "b", "c", "d", "e"]);
        filter.apply(&mut c, &mut rng());
        assert_eq!(c.elements.len(), 2);
    }

    #[test]
    fn max_players_cap_excludes_crowded_lobbies() {
        let filter = TrackFilter::parse("hacienda:2 other:yes");
        let mut c = ctx(&["hacienda", "oasis"]);
        c.num_players = 4;
        filter.apply(&mut c, &mut rng());
        assert!(!c.elements.contains("hacienda"));
        assert!(c.elements.contains("oasis"));
    }

    #[test]
    fn empty_filter_keeps_everything() {
        let filter = TrackFilter::placeholder();
        let mut c = ctx(&["a", "b"]);
        filter.apply(&mut c, &mut rng());
        assert_eq!(c.elements.len(), 2);
    }

    #[test]
    fn kart_filter_narrows_and_draws_random() {
        let filter = KartFilter::parse("not tux");
        let mut c = ctx(&["tux", "konqi", "adiumy"]);
        filter.apply(&mut c);
        assert!(!c.elements.contains("tux"));

        let grouped = KartFilter::parse("random konqi adiumy");
        let pick = grouped.pick_for_empty_choice(&c, &mut rng()).unwrap();
        assert!(pick == "konqi" || pick == "adiumy");
    }

    #[test]
    fn force_random_ignores_player_input() {
        let filter = KartFilter::parse("force-random tux konqi");
        assert!(filter.ignores_players_input());
    }
}
