//! Team-wide analytics derived from members, memories, and usage events.
//!
//! Everything is recomputed on demand. One pass over the usage events and one
//! pass over the memories per contributor makes a call O(members x memories)
//! plus O(usage events); no result is cached between calls.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::model::{TeamMember, TeamMemory, UsageEvent};
use crate::MemberId;

/// Window used for "active" memories and for each half of the growth comparison.
pub const ACTIVITY_WINDOW_DAYS: i64 = 30;
/// Memory count at which the volume component of productivity saturates.
pub const VOLUME_SATURATION: f64 = 100.0;
/// Memories per member at which utilization saturates.
pub const MEMORIES_PER_MEMBER_TARGET: f64 = 10.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContributorStats {
    pub member_id: MemberId,
    pub name: String,
    pub memories_created: usize,
    pub memories_used: usize,
    pub success_score: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_contribution: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamAnalytics {
    pub total_memories: usize,
    pub active_memories: usize,
    pub top_contributors: Vec<ContributorStats>,
    pub memory_growth_rate: f64,
    pub team_productivity_score: f64,
    pub knowledge_health_score: f64,
    pub collaboration_index: f64,
    pub memory_utilization_rate: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}

#[must_use]
pub fn build_team_analytics(
    members: &[TeamMember],
    memories: &[TeamMemory],
    usage: &[UsageEvent],
    now: OffsetDateTime,
) -> TeamAnalytics {
    let window = Duration::days(ACTIVITY_WINDOW_DAYS);
    let total_memories = memories.len();
    let active_memories =
        memories.iter().filter(|memory| memory.updated_at >= now - window).count();
    let top_contributors = contributor_stats(members, memories, usage);

    TeamAnalytics {
        total_memories,
        active_memories,
        memory_growth_rate: growth_rate(memories, now),
        team_productivity_score: productivity_score(active_memories, total_memories),
        knowledge_health_score: knowledge_health_score(&top_contributors),
        collaboration_index: collaboration_index(&top_contributors, usage.len(), total_memories),
        memory_utilization_rate: utilization_rate(total_memories, members.len()),
        top_contributors,
        generated_at: now,
    }
}

/// One entry per member, most prolific creator first. Ties keep member order.
#[must_use]
pub fn contributor_stats(
    members: &[TeamMember],
    memories: &[TeamMemory],
    usage: &[UsageEvent],
) -> Vec<ContributorStats> {
    let mut used_by: HashMap<MemberId, usize> = HashMap::new();
    for event in usage {
        *used_by.entry(event.used_by).or_default() += 1;
    }

    let mut stats: Vec<ContributorStats> = members
        .iter()
        .map(|member| {
            let created: Vec<&TeamMemory> =
                memories.iter().filter(|memory| memory.created_by == member.id).collect();
            let success_score = if created.is_empty() {
                0.0
            } else {
                let total: f64 = created.iter().map(|memory| memory.success_score).sum();
                total / as_f64(created.len())
            };
            ContributorStats {
                member_id: member.id,
                name: member.name.clone(),
                memories_created: created.len(),
                memories_used: used_by.get(&member.id).copied().unwrap_or(0),
                success_score,
                last_contribution: created.iter().map(|memory| memory.created_at).max(),
            }
        })
        .collect();

    stats.sort_by(|left, right| right.memories_created.cmp(&left.memories_created));
    stats
}

#[must_use]
pub fn productivity_score(active_memories: usize, total_memories: usize) -> f64 {
    let active_ratio = ratio(active_memories, total_memories);
    let volume_score = (as_f64(total_memories) / VOLUME_SATURATION).min(1.0);
    (active_ratio * 0.6 + volume_score * 0.4) * 100.0
}

#[must_use]
pub fn knowledge_health_score(contributors: &[ContributorStats]) -> f64 {
    if contributors.is_empty() {
        return 0.0;
    }

    let avg_success = contributors.iter().map(|stats| stats.success_score).sum::<f64>()
        / as_f64(contributors.len());

    let distribution = if contributors.len() > 1 {
        let total: usize = contributors.iter().map(|stats| stats.memories_created).sum();
        let max = contributors.iter().map(|stats| stats.memories_created).max().unwrap_or(0);
        if total == 0 {
            0.0
        } else {
            1.0 - ratio(max, total)
        }
    } else {
        0.0
    };

    (avg_success * 0.7 + distribution * 0.3) * 100.0
}

/// Not capped: cross utilization exceeds 1 once memories average more than one use.
#[must_use]
pub fn collaboration_index(
    contributors: &[ContributorStats],
    usage_events: usize,
    total_memories: usize,
) -> f64 {
    let cross_utilization = ratio(usage_events, total_memories);
    let active_contributors =
        contributors.iter().filter(|stats| stats.memories_created > 0).count();
    let member_distribution = ratio(active_contributors, contributors.len());
    (cross_utilization * 0.6 + member_distribution * 0.4) * 100.0
}

/// Percent change of creations in the trailing window against the window before it.
#[must_use]
pub fn growth_rate(memories: &[TeamMemory], now: OffsetDateTime) -> f64 {
    let window = Duration::days(ACTIVITY_WINDOW_DAYS);
    let recent_start = now - window;
    let previous_start = recent_start - window;

    let recent = memories.iter().filter(|memory| memory.created_at > recent_start).count();
    let previous = memories
        .iter()
        .filter(|memory| memory.created_at >= previous_start && memory.created_at <= recent_start)
        .count();

    if previous == 0 {
        return 0.0;
    }
    (as_f64(recent) - as_f64(previous)) / as_f64(previous) * 100.0
}

#[must_use]
pub fn utilization_rate(total_memories: usize, team_size: usize) -> f64 {
    let per_member = ratio(total_memories, team_size);
    (per_member / MEMORIES_PER_MEMBER_TARGET).min(1.0) * 100.0
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    as_f64(numerator) / as_f64(denominator)
}

fn as_f64(value: usize) -> f64 {
    f64::from(u32::try_from(value).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Metadata, NewMember, NewMemory};
    use crate::{MemoryType, Role, UsageId, Visibility};

    fn now() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::days(20_000)
    }

    fn member(name: &str) -> TeamMember {
        NewMember {
            email: format!("{name}@example.com"),
            name: name.to_string(),
            role: Role::Developer,
            permissions: None,
        }
        .into_member("team-a", now() - Duration::days(365))
    }

    fn memory_by(owner: &TeamMember, created_days_ago: i64, success_score: f64) -> TeamMemory {
        let mut memory = NewMemory {
            memory_type: MemoryType::LessonLearned,
            title: "lesson".to_string(),
            content: "content".to_string(),
            context: String::new(),
            created_by: owner.id,
            tags: Vec::new(),
            visibility: Visibility::TeamOnly,
            project_id: None,
            metadata: Metadata::new(),
        }
        .into_memory(now() - Duration::days(created_days_ago));
        memory.success_score = success_score;
        memory
    }

    fn usage(memory: &TeamMemory, by: &TeamMember) -> UsageEvent {
        UsageEvent {
            id: UsageId::new(),
            memory_id: memory.id,
            used_by: by.id,
            used_at: now(),
            context: String::new(),
            success: false,
        }
    }

    #[test]
    fn empty_team_scores_zero_everywhere() {
        let analytics = build_team_analytics(&[], &[], &[], now());

        assert_eq!(analytics.total_memories, 0);
        assert!(analytics.top_contributors.is_empty());
        assert!(analytics.team_productivity_score.abs() < f64::EPSILON);
        assert!(analytics.knowledge_health_score.abs() < f64::EPSILON);
        assert!(analytics.collaboration_index.abs() < f64::EPSILON);
        assert!(analytics.memory_utilization_rate.abs() < f64::EPSILON);
        assert!(analytics.memory_growth_rate.abs() < f64::EPSILON);
    }

    #[test]
    fn scores_follow_weighted_formulas() {
        let ada = member("ada");
        let bob = member("bob");
        let memories = vec![
            memory_by(&ada, 1, 1.0),
            memory_by(&ada, 5, 0.5),
            memory_by(&ada, 45, 0.0),
            memory_by(&bob, 40, 0.5),
        ];
        let events =
            vec![usage(&memories[0], &bob), usage(&memories[0], &bob), usage(&memories[3], &ada)];

        let analytics =
            build_team_analytics(&[ada.clone(), bob.clone()], &memories, &events, now());

        assert_eq!(analytics.total_memories, 4);
        assert_eq!(analytics.active_memories, 2);

        let first = &analytics.top_contributors[0];
        assert_eq!(first.member_id, ada.id);
        assert_eq!(first.memories_created, 3);
        assert_eq!(first.memories_used, 1);
        assert!((first.success_score - 0.5).abs() < 1e-12);
        assert_eq!(first.last_contribution, Some(now() - Duration::days(1)));
        assert_eq!(analytics.top_contributors[1].memories_used, 2);

        // active 2/4, volume 4/100
        let expected = (0.5 * 0.6 + 0.04 * 0.4) * 100.0;
        assert!((analytics.team_productivity_score - expected).abs() < 1e-9);
        // avg success (0.5 + 0.5) / 2, distribution 1 - 3/4
        assert!((analytics.knowledge_health_score - (0.5 * 0.7 + 0.25 * 0.3) * 100.0).abs() < 1e-9);
        // usage 3/4, both members contributed
        assert!((analytics.collaboration_index - (0.75 * 0.6 + 1.0 * 0.4) * 100.0).abs() < 1e-9);
        // two memories per member
        assert!((analytics.memory_utilization_rate - 20.0).abs() < 1e-9);
        // two recent creations against two in the previous window
        assert!(analytics.memory_growth_rate.abs() < 1e-9);
    }

    #[test]
    fn growth_is_zero_without_a_previous_window() {
        let ada = member("ada");
        let memories = vec![memory_by(&ada, 1, 0.5), memory_by(&ada, 2, 0.5)];
        assert!(growth_rate(&memories, now()).abs() < f64::EPSILON);
    }

    #[test]
    fn growth_reports_percent_change() {
        let ada = member("ada");
        let memories = vec![
            memory_by(&ada, 1, 0.5),
            memory_by(&ada, 2, 0.5),
            memory_by(&ada, 3, 0.5),
            memory_by(&ada, 50, 0.5),
        ];
        assert!((growth_rate(&memories, now()) - 200.0).abs() < 1e-9);
    }

    #[test]
    fn single_contributor_has_no_distribution_credit() {
        let ada = member("ada");
        let memories = vec![memory_by(&ada, 1, 1.0)];
        let stats = contributor_stats(&[ada], &memories, &[]);
        assert!((knowledge_health_score(&stats) - 70.0).abs() < 1e-9);
    }

    #[test]
    fn collaboration_is_not_capped() {
        let ada = member("ada");
        let memories = vec![memory_by(&ada, 1, 0.5)];
        let events: Vec<UsageEvent> = (0..5).map(|_| usage(&memories[0], &ada)).collect();
        let stats = contributor_stats(std::slice::from_ref(&ada), &memories, &events);
        assert!(collaboration_index(&stats, events.len(), memories.len()) > 100.0);
    }
}
