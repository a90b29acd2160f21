//! Bounded audit trail and compliance aggregation.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::model::Metadata;
use crate::AuditLogId;

/// Entries retained by the in-process trail before the oldest are evicted.
pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;
const TOP_ACTION_LIMIT: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditLog {
    pub id: AuditLogId,
    pub actor_id: String,
    pub actor_name: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub resource_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub success: bool,
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl AuditLog {
    /// A successful entry by an unnamed actor; `resource_name` starts as the id.
    #[must_use]
    pub fn new(
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        timestamp: OffsetDateTime,
    ) -> Self {
        let resource_id = resource_id.into();
        Self {
            id: AuditLogId::new(),
            actor_id: String::new(),
            actor_name: "Unknown".to_string(),
            action: action.into(),
            resource_type: resource_type.into(),
            resource_name: resource_id.clone(),
            resource_id,
            timestamp,
            success: true,
            error_message: None,
            metadata: Metadata::new(),
        }
    }

    #[must_use]
    pub fn by(mut self, actor_id: impl Into<String>, actor_name: Option<&str>) -> Self {
        self.actor_id = actor_id.into();
        if let Some(name) = actor_name {
            self.actor_name = name.to_string();
        }
        self
    }

    #[must_use]
    pub fn named(mut self, resource_name: impl Into<String>) -> Self {
        self.resource_name = resource_name.into();
        self
    }

    #[must_use]
    pub fn failed(mut self, error_message: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(error_message.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Failed actions and anything deleting or administering.
    #[must_use]
    pub fn is_risk_event(&self) -> bool {
        !self.success || self.action.contains("delete") || self.action.contains("admin")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditFilter {
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end: Option<OffsetDateTime>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl AuditFilter {
    #[must_use]
    pub fn matches(&self, entry: &AuditLog) -> bool {
        self.actor_id.as_ref().map_or(true, |id| &entry.actor_id == id)
            && self.action.as_ref().map_or(true, |action| &entry.action == action)
            && self.resource_type.as_ref().map_or(true, |kind| &entry.resource_type == kind)
            && self.start.map_or(true, |start| entry.timestamp >= start)
            && self.end.map_or(true, |end| entry.timestamp <= end)
    }
}

/// Fixed-capacity, append-only ring of recent audit entries.
///
/// This is a lookup cache, not the record of truth: entries pushed past the
/// capacity are evicted oldest-first, so durable history must be written to the
/// store before it is pushed here.
#[derive(Debug, Clone)]
pub struct AuditTrail {
    capacity: usize,
    entries: VecDeque<AuditLog>,
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

impl AuditTrail {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, entries: VecDeque::with_capacity(capacity.min(1024)) }
    }

    /// Rebuild a trail from persisted entries given oldest first.
    #[must_use]
    pub fn from_entries(capacity: usize, entries: impl IntoIterator<Item = AuditLog>) -> Self {
        let mut trail = Self::new(capacity);
        for entry in entries {
            trail.push(entry);
        }
        trail
    }

    /// Append an entry, returning the evicted oldest entry when the trail was full.
    pub fn push(&mut self, entry: AuditLog) -> Option<AuditLog> {
        let evicted =
            if self.entries.len() >= self.capacity { self.entries.pop_front() } else { None };
        self.entries.push_back(entry);
        evicted
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &AuditLog> {
        self.entries.iter()
    }

    /// Matching entries newest first, truncated to `filter.limit`.
    #[must_use]
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditLog> {
        let mut matched: Vec<AuditLog> =
            self.entries.iter().rev().filter(|entry| filter.matches(entry)).cloned().collect();
        matched.sort_by(|left, right| right.timestamp.cmp(&left.timestamp));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        matched
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ActionCount {
    pub action: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComplianceReport {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    pub total_actions: usize,
    pub unique_actors: usize,
    pub permission_actions: usize,
    pub access_request_actions: usize,
    pub failed_actions: usize,
    pub top_actions: Vec<ActionCount>,
    pub risk_events: Vec<AuditLog>,
}

/// Aggregate the entries whose timestamp lies in `[start, end]`.
#[must_use]
pub fn build_compliance_report<'a>(
    logs: impl IntoIterator<Item = &'a AuditLog>,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> ComplianceReport {
    let mut in_range: Vec<&AuditLog> = logs
        .into_iter()
        .filter(|entry| entry.timestamp >= start && entry.timestamp <= end)
        .collect();
    in_range.sort_by(|left, right| right.timestamp.cmp(&left.timestamp));

    let unique_actors: BTreeSet<&str> =
        in_range.iter().map(|entry| entry.actor_id.as_str()).collect();

    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for entry in &in_range {
        *counts.entry(entry.action.as_str()).or_default() += 1;
    }
    let mut top_actions: Vec<ActionCount> = counts
        .into_iter()
        .map(|(action, count)| ActionCount { action: action.to_string(), count })
        .collect();
    // BTreeMap order makes equal counts alphabetical after the stable sort.
    top_actions.sort_by(|left, right| right.count.cmp(&left.count));
    top_actions.truncate(TOP_ACTION_LIMIT);

    ComplianceReport {
        start,
        end,
        total_actions: in_range.len(),
        unique_actors: unique_actors.len(),
        permission_actions: in_range
            .iter()
            .filter(|entry| entry.action.contains("permission"))
            .count(),
        access_request_actions: in_range
            .iter()
            .filter(|entry| entry.action.contains("access_request"))
            .count(),
        failed_actions: in_range.iter().filter(|entry| !entry.success).count(),
        top_actions,
        risk_events: in_range
            .iter()
            .filter(|entry| entry.is_risk_event())
            .map(|&entry| entry.clone())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn at(minutes: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::days(19_500) + Duration::minutes(minutes)
    }

    fn entry(actor: &str, action: &str, minutes: i64) -> AuditLog {
        AuditLog::new(action, "memory", "m-1", at(minutes)).by(actor, Some(actor))
    }

    #[test]
    fn trail_evicts_oldest_first() {
        let mut trail = AuditTrail::new(2);
        assert!(trail.push(entry("a", "first", 0)).is_none());
        assert!(trail.push(entry("a", "second", 1)).is_none());

        let evicted = trail.push(entry("a", "third", 2));
        assert_eq!(evicted.map(|log| log.action), Some("first".to_string()));
        assert_eq!(trail.len(), 2);
    }

    #[test]
    fn query_is_newest_first_and_limited() {
        let trail = AuditTrail::from_entries(
            10,
            vec![
                entry("a", "permission_check", 0),
                entry("b", "share_memory", 5),
                entry("a", "permission_check", 9),
            ],
        );

        let filter = AuditFilter {
            actor_id: Some("a".to_string()),
            limit: Some(1),
            ..AuditFilter::default()
        };
        let logs = trail.query(&filter);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].timestamp, at(9));

        let ranged = AuditFilter { start: Some(at(1)), end: Some(at(5)), ..AuditFilter::default() };
        let logs = trail.query(&ranged);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action, "share_memory");
    }

    #[test]
    fn compliance_report_counts_inclusive_range() {
        // Test IDs: AUD-001
        let logs = vec![
            entry("a", "create_permission_rule", 0),
            entry("a", "permission_check", 1),
            entry("b", "permission_check", 2).failed("actor not found"),
            entry("c", "approve_access_request", 3),
            entry("c", "delete_permission_rule", 4),
            entry("d", "share_memory", 10),
        ];

        let report = build_compliance_report(&logs, at(0), at(4));

        assert_eq!(report.total_actions, 5);
        assert_eq!(report.unique_actors, 3);
        assert_eq!(report.permission_actions, 4);
        assert_eq!(report.access_request_actions, 1);
        assert_eq!(report.failed_actions, 1);
        assert_eq!(
            report.top_actions[0],
            ActionCount { action: "permission_check".to_string(), count: 2 }
        );
        assert_eq!(report.top_actions.len(), 4);
        let risky: Vec<&str> = report.risk_events.iter().map(|log| log.action.as_str()).collect();
        assert_eq!(risky, vec!["delete_permission_rule", "permission_check"]);
    }

    #[test]
    fn top_actions_are_capped_at_ten() {
        let logs: Vec<AuditLog> =
            (0..15).map(|i| entry("a", &format!("action_{i:02}"), i)).collect();
        let report = build_compliance_report(&logs, at(0), at(100));
        assert_eq!(report.top_actions.len(), 10);
        assert_eq!(report.top_actions[0].action, "action_00");
    }
}
