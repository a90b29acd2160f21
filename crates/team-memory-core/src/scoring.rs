//! Vote tallies, success scores, and search-hit ranking.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::model::{MemoryVote, TeamMemory};
use crate::VoteKind;

/// Score of a memory that nobody has voted on yet.
pub const NEUTRAL_SUCCESS_SCORE: f64 = 0.5;
/// Maximum hits returned by one search.
pub const SEARCH_RESULT_LIMIT: usize = 15;
/// Maximum hits gathered per search term before merging.
pub const SEARCH_TERM_HIT_LIMIT: usize = 20;

/// Running up/down vote counters for one memory.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct VoteTally {
    pub upvotes: u32,
    pub downvotes: u32,
}

impl VoteTally {
    #[must_use]
    pub fn from_votes(votes: &[MemoryVote]) -> Self {
        let mut tally = Self::default();
        for vote in votes {
            tally.apply(None, vote.vote);
        }
        tally
    }

    #[must_use]
    pub fn total(self) -> u32 {
        self.upvotes.saturating_add(self.downvotes)
    }

    /// `upvotes / total`, or [`NEUTRAL_SUCCESS_SCORE`] when there are no votes.
    #[must_use]
    pub fn success_score(self) -> f64 {
        let total = self.total();
        if total == 0 {
            return NEUTRAL_SUCCESS_SCORE;
        }
        f64::from(self.upvotes) / f64::from(total)
    }

    /// Fold one vote into the tally, replacing the voter's earlier vote if any.
    pub fn apply(&mut self, previous: Option<VoteKind>, next: VoteKind) {
        match previous {
            Some(VoteKind::Upvote) => self.upvotes = self.upvotes.saturating_sub(1),
            Some(VoteKind::Downvote) => self.downvotes = self.downvotes.saturating_sub(1),
            None => {}
        }
        match next {
            VoteKind::Upvote => self.upvotes = self.upvotes.saturating_add(1),
            VoteKind::Downvote => self.downvotes = self.downvotes.saturating_add(1),
        }
    }
}

/// Lowercased, de-duplicated search terms split on anything that is not alphanumeric.
#[must_use]
pub fn tokenize_search_terms(query: &str) -> BTreeSet<String> {
    query
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Merge per-term hit lists into one ranked, capped result.
///
/// Duplicates keep their first occurrence. Ranking is usage count descending,
/// then success score descending, then newest first, then id for stability.
#[must_use]
pub fn merge_search_hits(hits: impl IntoIterator<Item = TeamMemory>) -> Vec<TeamMemory> {
    let mut seen = HashSet::new();
    let mut merged: Vec<TeamMemory> =
        hits.into_iter().filter(|memory| seen.insert(memory.id)).collect();

    merged.sort_by(|left, right| {
        right
            .usage_count
            .cmp(&left.usage_count)
            .then_with(|| {
                right.success_score.partial_cmp(&left.success_score).unwrap_or(Ordering::Equal)
            })
            .then_with(|| right.created_at.cmp(&left.created_at))
            .then_with(|| left.id.cmp(&right.id))
    });
    merged.truncate(SEARCH_RESULT_LIMIT);
    merged
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::model::{Metadata, NewMemory};
    use crate::{MemberId, MemoryType, Visibility};
    use proptest::prelude::*;
    use time::{Duration, OffsetDateTime};

    fn memory(title: &str, usage_count: u64, success_score: f64, offset_secs: i64) -> TeamMemory {
        let mut memory = NewMemory {
            memory_type: MemoryType::BestPractice,
            title: title.to_string(),
            content: "content".to_string(),
            context: String::new(),
            created_by: MemberId::new(),
            tags: Vec::new(),
            visibility: Visibility::Public,
            project_id: None,
            metadata: Metadata::new(),
        }
        .into_memory(OffsetDateTime::UNIX_EPOCH + Duration::seconds(offset_secs));
        memory.usage_count = usage_count;
        memory.success_score = success_score;
        memory
    }

    #[test]
    fn empty_tally_is_neutral() {
        let neutral = VoteTally::default().success_score();
        assert!((neutral - NEUTRAL_SUCCESS_SCORE).abs() < f64::EPSILON);
    }

    #[test]
    fn changing_a_vote_moves_it_between_counters() {
        let mut tally = VoteTally::default();
        tally.apply(None, VoteKind::Upvote);
        tally.apply(None, VoteKind::Upvote);
        tally.apply(Some(VoteKind::Upvote), VoteKind::Downvote);

        assert_eq!(tally, VoteTally { upvotes: 1, downvotes: 1 });
        assert!((tally.success_score() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn two_up_one_down_scores_two_thirds() {
        let tally = VoteTally { upvotes: 2, downvotes: 1 };
        assert!((tally.success_score() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn tokenizer_splits_on_punctuation_and_lowercases() {
        let terms = tokenize_search_terms("Retry, a DB-pool x retry");
        let terms: Vec<&str> = terms.iter().map(String::as_str).collect();
        assert_eq!(terms, vec!["a", "db", "pool", "retry", "x"]);
        assert!(tokenize_search_terms("  ,. ").is_empty());
    }

    #[test]
    fn single_letter_languages_are_searchable() {
        let terms = tokenize_search_terms("C or R?");
        let terms: Vec<&str> = terms.iter().map(String::as_str).collect();
        assert_eq!(terms, vec!["c", "or", "r"]);
        assert_eq!(tokenize_search_terms("ÉCOLE").into_iter().collect::<Vec<_>>(), vec!["école"]);
    }

    #[test]
    fn merge_dedups_and_ranks_by_usage_then_score() {
        let popular = memory("popular", 9, 0.2, 10);
        let trusted = memory("trusted", 3, 0.9, 20);
        let newer_tie = memory("newer", 3, 0.5, 40);
        let older_tie = memory("older", 3, 0.5, 30);

        let merged = merge_search_hits(vec![
            older_tie.clone(),
            trusted.clone(),
            popular.clone(),
            newer_tie.clone(),
            popular.clone(),
        ]);
        let titles: Vec<&str> = merged.iter().map(|m| m.title.as_str()).collect();
        assert_eq!(titles, vec!["popular", "trusted", "newer", "older"]);
    }

    #[test]
    fn merge_caps_results() {
        let hits: Vec<TeamMemory> = (0..40).map(|i| memory(&format!("m{i}"), 0, 0.5, i)).collect();
        assert_eq!(merge_search_hits(hits).len(), SEARCH_RESULT_LIMIT);
    }

    proptest! {
        #[test]
        fn score_stays_in_unit_interval(votes in proptest::collection::vec(any::<bool>(), 0..64)) {
            let mut tally = VoteTally::default();
            for up in &votes {
                tally.apply(None, if *up { VoteKind::Upvote } else { VoteKind::Downvote });
            }
            let score = tally.success_score();
            prop_assert!((0.0..=1.0).contains(&score));
            prop_assert_eq!(tally.total() as usize, votes.len());
            if votes.is_empty() {
                prop_assert!((score - NEUTRAL_SUCCESS_SCORE).abs() < f64::EPSILON);
            }
        }

        #[test]
        fn revotes_match_a_recount_of_latest_votes(
            ballots in proptest::collection::vec((0_usize..6, any::<bool>()), 0..96)
        ) {
            let mut tally = VoteTally::default();
            let mut latest: HashMap<usize, VoteKind> = HashMap::new();
            for (member, up) in ballots {
                let next = if up { VoteKind::Upvote } else { VoteKind::Downvote };
                tally.apply(latest.insert(member, next), next);
            }

            let upvotes = latest.values().filter(|vote| **vote == VoteKind::Upvote).count();
            let downvotes = latest.len() - upvotes;
            prop_assert_eq!(tally.upvotes as usize, upvotes);
            prop_assert_eq!(tally.downvotes as usize, downvotes);
            prop_assert_eq!(tally.total() as usize, latest.len());

            let expected = if latest.is_empty() {
                NEUTRAL_SUCCESS_SCORE
            } else {
                upvotes as f64 / latest.len() as f64
            };
            prop_assert!((tally.success_score() - expected).abs() < 1e-12);
        }
    }
}
