use std::sync::Arc;

use indexmap::IndexMap;
use rand::seq::IteratorRandom;
use rand::Rng;
use tokio::sync::{RwLock, RwLockReadGuard};

use async_trait::async_trait;

use kartnet::lobby::PeerVote;

/// How the winning vote is decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteAlgorithm {
    /// Majority track, then majority laps and direction among its
    /// votes; ties go to the earliest submitter.
    Standard,
    /// One submitted vote, uniformly at random.
    Random,
    /// Reserved for weighted voting; currently identical to Standard.
    Advanced,
}

impl VoteAlgorithm {
    pub fn from_config(value: u8) -> VoteAlgorithm {
        match value {
            1 => VoteAlgorithm::Random,
            2 => VoteAlgorithm::Advanced,
            _ => VoteAlgorithm::Standard,
        }
    }
}

/// Use to look up the votes cast so far.
#[async_trait]
pub trait LiveVotes: Send + Sync {
    /// While holding this guard, the state is read-only, and can be
    /// referenced.
    async fn lock(&self) -> RwLockReadGuard<'_, VotesState>;

    async fn vote_count(&self) -> usize {
        self.lock().await.votes.len()
    }
}

#[derive(Default)]
pub struct VotesState {
    /// One live vote per peer; insertion order is submission order, and
    /// re-votes keep the peer's original position.
    pub votes: IndexMap<u32, PeerVote>,
}

#[derive(Clone)]
pub struct VoteController {
    state: Arc<RwLock<VotesState>>,
    algorithm: VoteAlgorithm,
}

impl VoteController {
    pub fn init(algorithm: VoteAlgorithm) -> Self {
        VoteController {
            state: Arc::new(RwLock::new(VotesState::default())),
            algorithm,
        }
    }

    /// Records a peer's vote, replacing any earlier one.
    pub async fn submit(&self, host_id: u32, vote: PeerVote) {
        self.state.write().await.votes.insert(host_id, vote);
    }

    pub async fn retract(&self, host_id: u32) {
        // Order of the remaining votes must not change.
        self.state.write().await.votes.shift_remove(&host_id);
    }

    pub async fn clear(&self) {
        self.state.write().await.votes.clear();
    }

    /// Decides the winner once the window is over (or all eligible
    /// peers voted). Returns `None` when no votes were cast; the caller
    /// then falls back to a random map with mode defaults.
    pub async fn decide<R: Rng>(&self, rng: &mut R) -> Option<(u32, PeerVote)> {
        let state = self.state.read().await;
        if state.votes.is_empty() {
            return None;
        }
        match self.algorithm {
            VoteAlgorithm::Standard | VoteAlgorithm::Advanced => Some(standard(&state.votes)),
            VoteAlgorithm::Random => {
                let (host_id, vote) = state.votes.iter().choose(rng)?;
                Some((*host_id, vote.clone()))
            }
        }
    }
}

/// Majority decision. Track first; among the winning track's votes,
/// the majority lap count and direction; every tie broken by earliest
/// submission.
fn standard(votes: &IndexMap<u32, PeerVote>) -> (u32, PeerVote) {
    let winning_track = majority_value(votes.values().map(|v| v.track_name.as_str())).to_string();

    let track_votes = || votes.values().filter(|v| v.track_name == winning_track);
    let winning_laps = majority_value(track_votes().map(|v| v.num_laps));
    let winning_reverse = majority_value(track_votes().map(|v| v.reverse));

    // Earliest peer whose vote matches the full winning tuple; if the
    // majorities combine into a tuple nobody voted, earliest with the
    // winning track.
    let winner_peer = votes
        .iter()
        .find(|(_, v)| {
            v.track_name == winning_track
                && v.num_laps == winning_laps
                && v.reverse == winning_reverse
        })
        .or_else(|| votes.iter().find(|(_, v)| v.track_name == winning_track))
        .map(|(host_id, _)| *host_id)
        .unwrap_or_default();

    let vote = PeerVote {
        player_name: votes
            .get(&winner_peer)
            .map(|v| v.player_name.clone())
            .unwrap_or_default(),
        track_name: winning_track,
        num_laps: winning_laps,
        reverse: winning_reverse,
    };
    (winner_peer, vote)
}

/// The value with the most occurrences; first-seen wins ties.
fn majority_value<T: Clone + std::hash::Hash + Eq, I: Iterator<Item = T>>(values: I) -> T {
    let mut counts: IndexMap<T, usize> = IndexMap::new();
    for value in values {
        *counts.entry(value).or_insert(0) += 1;
    }
    let mut best: Option<(&T, usize)> = None;
    for (value, count) in &counts {
        if best.map(|(_, c)| *count > c).unwrap_or(true) {
            best = Some((value, *count));
        }
    }
    best.map(|(value, _)| value.clone())
        .expect("majority_value needs at least one value")
}

#[async_trait]
impl LiveVotes for VoteController {
    async fn lock(&self) -> RwLockReadGuard<'_, VotesState> {
        self.state.read().await
    }
}

/// Eligibility to vote: validated, not spectating by limit, and (in a
/// tournament) votable per the current game's rules.
pub fn can_vote(
    validated: bool,
    spectator_by_limit: bool,
    tournament_votable: Option<bool>,
) -> bool {
    validated && !spectator_by_limit && tournament_votable.unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn vote(track: &str, laps: u8, reverse: bool) -> PeerVote {
        PeerVote {
            player_name: Default::default(),
            track_name: track.to_string(),
            num_laps: laps,
            reverse,
        }
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(11)
    }

    #[tokio::test]
    async fn identical_votes_pick_the_earliest_submitter() {
        let votes = VoteController::init(VoteAlgorithm::Standard);
        votes.submit(3, vote("hacienda", 3, false)).await;
        votes.submit(1, vote("hacienda", 3, false)).await;
        votes.submit(2, vote("hacienda", 3, false)).await;

        let (winner, winning) = votes.decide(&mut rng()).await.unwrap();
        assert_eq!(winner, 3);
        assert_eq!(winning.track_name, "hacienda");
        assert_eq!(winning.num_laps, 3);
    }

    #[tokio::test]
    async fn majority_track_beats_minority() {
        let votes = VoteController::init(VoteAlgorithm::Standard);
        votes.submit(1, vote("oasis", 5, true)).await;
        votes.submit(2, vote("hacienda", 3, false)).await;
        votes.submit(3, vote("hacienda", 4, false)).await;

        let (winner, winning) = votes.decide(&mut rng()).await.unwrap();
        assert_eq!(winning.track_name, "hacienda");
        // Laps 3 and 4 tie; first-seen (host 2) wins, and so does its
        // submitter.
        assert_eq!(winning.num_laps, 3);
        assert_eq!(winner, 2);
    }

    #[tokio::test]
    async fn revote_replaces_but_keeps_submission_order() {
        let votes = VoteController::init(VoteAlgorithm::Standard);
        votes.submit(1, vote("oasis", 2, false)).await;
        votes.submit(2, vote("hacienda", 3, false)).await;
        // Peer 1 changes its mind; it is still the earliest submitter.
        votes.submit(1, vote("hacienda", 3, false)).await;

        let (winner, winning) = votes.decide(&mut rng()).await.unwrap();
        assert_eq!(winner, 1);
        assert_eq!(winning.track_name, "hacienda");
        assert_eq!(votes.vote_count().await, 2);
    }

    #[tokio::test]
    async fn zero_votes_yield_none() {
        let votes = VoteController::init(VoteAlgorithm::Standard);
        assert!(votes.decide(&mut rng()).await.is_none());
    }

    #[tokio::test]
    async fn random_algorithm_picks_a_submitted_vote() {
        let votes = VoteController::init(VoteAlgorithm::Random);
        votes.submit(1, vote("oasis", 2, false)).await;
        votes.submit(2, vote("hacienda", 3, false)).await;
        let (winner, winning) = votes.decide(&mut rng()).await.unwrap();
        assert!(winner == 1 || winner == 2);
        assert!(winning.track_name == "oasis" || winning.track_name == "hacienda");
    }

    #[tokio::test]
    async fn advanced_falls_back_to_standard() {
        let votes = VoteController::init(VoteAlgorithm::from_config(2));
        votes.submit(1, vote("oasis", 2, false)).await;
        let (winner, _) = votes.decide(&mut rng()).await.unwrap();
        assert_eq!(winner, 1);
    }

    #[test]
    fn eligibility_rules() {
        assert!(can_vote(true, false, None));
        assert!(!can_vote(false, false, None));
        assert!(!can_vote(true, true, None));
        assert!(!can_vote(true, false, Some(false)));
        assert!(can_vote(true, false, Some(true)));
    }
}
