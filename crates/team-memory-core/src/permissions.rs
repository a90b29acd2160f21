//! Permission rules, access requests, and the layered decision pipeline.
//!
//! A decision walks three layers in order: explicit user rules (first applicable
//! rule in sequence order wins), the role capability matrix, and for memories the
//! visibility gate. [`evaluate_permission`] is pure; the caller supplies the clock,
//! the rule set, the access requests, and the memory being checked.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::model::{Metadata, TeamMember, TeamMemory};
use crate::{
    AccessRequestId, AccessRequestStatus, Action, ConditionOperator, MemberId, MemoryId,
    MemoryType, ResourceType, RestrictionKind, Role, RuleId, SubjectType, TeamError, Visibility,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionRestriction {
    #[serde(rename = "type")]
    pub kind: RestrictionKind,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Permission {
    pub action: Action,
    pub granted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restrictions: Vec<PermissionRestriction>,
}

impl Permission {
    #[must_use]
    pub fn grant(action: Action) -> Self {
        Self { action, granted: true, restrictions: Vec::new() }
    }

    #[must_use]
    pub fn deny(action: Action) -> Self {
        Self { action, granted: false, restrictions: Vec::new() }
    }
}

/// Condition kinds understood by the evaluator. Anything else is kept verbatim
/// and handled according to [`UnknownConditionPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(from = "String", into = "String")]
pub enum ConditionKind {
    TimeWindow,
    MemoryType,
    ApprovalRequired,
    Other(String),
}

impl ConditionKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::TimeWindow => "time_window",
            Self::MemoryType => "memory_type",
            Self::ApprovalRequired => "approval_required",
            Self::Other(kind) => kind,
        }
    }
}

impl From<String> for ConditionKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "time_window" => Self::TimeWindow,
            "memory_type" => Self::MemoryType,
            "approval_required" => Self::ApprovalRequired,
            _ => Self::Other(value),
        }
    }
}

impl From<ConditionKind> for String {
    fn from(value: ConditionKind) -> Self {
        match value {
            ConditionKind::Other(kind) => kind,
            known => known.as_str().to_string(),
        }
    }
}

impl Display for ConditionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionCondition {
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub operator: ConditionOperator,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UnknownConditionPolicy {
    /// Unknown kinds fail, so the rule carrying them never applies.
    #[default]
    FailClosed,
    /// Unknown kinds are treated as satisfied.
    FailOpen,
}

impl UnknownConditionPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FailClosed => "fail_closed",
            Self::FailOpen => "fail_open",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fail_closed" => Some(Self::FailClosed),
            "fail_open" => Some(Self::FailOpen),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionRule {
    pub id: RuleId,
    /// Persisted creation order; explicit-rule lookup iterates ascending.
    pub sequence: i64,
    pub resource_type: ResourceType,
    pub resource_id: Option<String>,
    pub subject_type: SubjectType,
    pub subject_id: String,
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub conditions: Vec<PermissionCondition>,
    pub created_by: MemberId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub is_active: bool,
}

impl PermissionRule {
    /// Active and not past its expiry.
    #[must_use]
    pub fn is_effective(&self, now: OffsetDateTime) -> bool {
        self.is_active && self.expires_at.map_or(true, |expires_at| expires_at > now)
    }

    #[must_use]
    pub fn permission_for(&self, action: Action) -> Option<&Permission> {
        self.permissions.iter().find(|permission| permission.action == action)
    }

    fn targets(&self, actor_id: MemberId, query: &PermissionQuery) -> bool {
        self.resource_type == query.resource_type
            && self.subject_type == SubjectType::User
            && self.subject_id == actor_id.to_string()
            && match (&query.resource_id, &self.resource_id) {
                (Some(wanted), Some(scoped)) => wanted == scoped,
                _ => true,
            }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewPermissionRule {
    pub resource_type: ResourceType,
    #[serde(default)]
    pub resource_id: Option<String>,
    pub subject_type: SubjectType,
    pub subject_id: String,
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub conditions: Vec<PermissionCondition>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

impl NewPermissionRule {
    /// Rule targeting a single user, the shape produced by sharing and approvals.
    #[must_use]
    pub fn for_user(
        subject: MemberId,
        resource_type: ResourceType,
        resource_id: Option<String>,
        permissions: Vec<Permission>,
    ) -> Self {
        Self {
            resource_type,
            resource_id,
            subject_type: SubjectType::User,
            subject_id: subject.to_string(),
            permissions,
            conditions: Vec::new(),
            expires_at: None,
        }
    }

    /// # Errors
    /// Returns [`TeamError::Validation`] when the subject is blank or no permission is listed.
    pub fn validate(&self) -> Result<(), TeamError> {
        if self.subject_id.trim().is_empty() {
            return Err(TeamError::Validation("rule subject_id MUST be provided".to_string()));
        }
        if self.permissions.is_empty() {
            return Err(TeamError::Validation(
                "rule MUST list at least one permission".to_string(),
            ));
        }
        if self.resource_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(TeamError::Validation("rule resource_id MUST NOT be blank".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn into_rule(
        self,
        created_by: MemberId,
        sequence: i64,
        now: OffsetDateTime,
    ) -> PermissionRule {
        PermissionRule {
            id: RuleId::new(),
            sequence,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            subject_type: self.subject_type,
            subject_id: self.subject_id,
            permissions: self.permissions,
            conditions: self.conditions,
            created_by,
            created_at: now,
            expires_at: self.expires_at,
            is_active: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PermissionRuleUpdate {
    #[serde(default)]
    pub permissions: Option<Vec<Permission>>,
    #[serde(default)]
    pub conditions: Option<Vec<PermissionCondition>>,
    /// Absent leaves the expiry unchanged; `null` clears it.
    #[serde(default, with = "expiry_patch", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Option<OffsetDateTime>>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

mod expiry_patch {
    use serde::{Deserializer, Serializer};
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(
        value: &Option<Option<OffsetDateTime>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(expiry) => time::serde::rfc3339::option::serialize(expiry, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Option<OffsetDateTime>>, D::Error> {
        time::serde::rfc3339::option::deserialize(deserializer).map(Some)
    }
}

impl PermissionRuleUpdate {
    /// # Errors
    /// Returns [`TeamError::Validation`] when the update would leave the rule without permissions.
    pub fn apply(&self, rule: &mut PermissionRule) -> Result<(), TeamError> {
        if self.permissions.as_ref().is_some_and(Vec::is_empty) {
            return Err(TeamError::Validation(
                "rule MUST list at least one permission".to_string(),
            ));
        }
        if let Some(permissions) = &self.permissions {
            rule.permissions.clone_from(permissions);
        }
        if let Some(conditions) = &self.conditions {
            rule.conditions.clone_from(conditions);
        }
        if let Some(expires_at) = self.expires_at {
            rule.expires_at = expires_at;
        }
        if let Some(is_active) = self.is_active {
            rule.is_active = is_active;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RuleFilter {
    #[serde(default)]
    pub resource_type: Option<ResourceType>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

impl RuleFilter {
    #[must_use]
    pub fn matches(&self, rule: &PermissionRule) -> bool {
        self.resource_type.map_or(true, |kind| rule.resource_type == kind)
            && self
                .resource_id
                .as_ref()
                .map_or(true, |id| rule.resource_id.as_ref() == Some(id))
            && self.subject_id.as_ref().map_or(true, |id| &rule.subject_id == id)
            && self.is_active.map_or(true, |active| rule.is_active == active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessRequest {
    pub id: AccessRequestId,
    pub requester_id: MemberId,
    pub requester_name: String,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub resource_name: String,
    pub requested_permissions: Vec<Permission>,
    pub justification: String,
    pub status: AccessRequestStatus,
    #[serde(default)]
    pub approvers: Vec<MemberId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub approved_at: Option<OffsetDateTime>,
    pub approved_by: Option<MemberId>,
    pub denied_by: Option<MemberId>,
    pub deny_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

impl AccessRequest {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == AccessRequestStatus::Pending
    }

    /// Admins, team managers, and listed approvers may decide a request.
    #[must_use]
    pub fn can_be_decided_by(&self, member: &TeamMember) -> bool {
        member.manages_team() || self.approvers.contains(&member.id)
    }

    /// # Errors
    /// Returns [`TeamError::InvalidState`] unless the request is pending.
    pub fn approve(&mut self, approver: MemberId, now: OffsetDateTime) -> Result<(), TeamError> {
        self.ensure_pending("approve")?;
        self.status = AccessRequestStatus::Approved;
        self.approved_at = Some(now);
        self.approved_by = Some(approver);
        self.updated_at = now;
        Ok(())
    }

    /// # Errors
    /// Returns [`TeamError::InvalidState`] unless the request is pending.
    pub fn deny(
        &mut self,
        denier: MemberId,
        reason: impl Into<String>,
        now: OffsetDateTime,
    ) -> Result<(), TeamError> {
        self.ensure_pending("deny")?;
        self.status = AccessRequestStatus::Denied;
        self.denied_by = Some(denier);
        self.deny_reason = Some(reason.into());
        self.updated_at = now;
        Ok(())
    }

    /// Move a pending request past its expiry to `expired`. Returns whether it changed.
    pub fn expire_if_due(&mut self, as_of: OffsetDateTime) -> bool {
        let due = self.expires_at.is_some_and(|expires_at| expires_at <= as_of);
        if !self.is_pending() || !due {
            return false;
        }
        self.status = AccessRequestStatus::Expired;
        self.updated_at = as_of;
        true
    }

    /// The user rule materialized by an approval: exactly the requested
    /// permissions on the requested resource, inheriting the request expiry.
    #[must_use]
    pub fn grant_rule(
        &self,
        approver: MemberId,
        sequence: i64,
        now: OffsetDateTime,
    ) -> PermissionRule {
        let mut rule = NewPermissionRule::for_user(
            self.requester_id,
            self.resource_type,
            Some(self.resource_id.clone()),
            self.requested_permissions.clone(),
        );
        rule.expires_at = self.expires_at;
        rule.into_rule(approver, sequence, now)
    }

    fn ensure_pending(&self, transition: &str) -> Result<(), TeamError> {
        if self.is_pending() {
            return Ok(());
        }
        Err(TeamError::InvalidState(format!(
            "cannot {transition} access request {} in status {}",
            self.id, self.status
        )))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewAccessRequest {
    pub requester_id: MemberId,
    pub resource_type: ResourceType,
    pub resource_id: String,
    #[serde(default)]
    pub resource_name: String,
    pub requested_permissions: Vec<Permission>,
    pub justification: String,
    #[serde(default)]
    pub approvers: Vec<MemberId>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

impl NewAccessRequest {
    /// # Errors
    /// Returns [`TeamError::Validation`] when the target or requested permissions are missing.
    pub fn validate(&self) -> Result<(), TeamError> {
        if self.resource_id.trim().is_empty() {
            return Err(TeamError::Validation(
                "access request resource_id MUST be provided".to_string(),
            ));
        }
        if self.requested_permissions.is_empty() {
            return Err(TeamError::Validation(
                "access request MUST ask for at least one permission".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn into_request(self, requester_name: String, now: OffsetDateTime) -> AccessRequest {
        let resource_name = if self.resource_name.trim().is_empty() {
            self.resource_id.clone()
        } else {
            self.resource_name
        };
        AccessRequest {
            id: AccessRequestId::new(),
            requester_id: self.requester_id,
            requester_name,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            resource_name,
            requested_permissions: self.requested_permissions,
            justification: self.justification,
            status: AccessRequestStatus::Pending,
            approvers: self.approvers,
            created_at: now,
            updated_at: now,
            approved_at: None,
            approved_by: None,
            denied_by: None,
            deny_reason: None,
            expires_at: self.expires_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AccessRequestFilter {
    #[serde(default)]
    pub requester_id: Option<MemberId>,
    #[serde(default)]
    pub status: Option<AccessRequestStatus>,
    #[serde(default)]
    pub resource_type: Option<ResourceType>,
}

impl AccessRequestFilter {
    #[must_use]
    pub fn matches(&self, request: &AccessRequest) -> bool {
        self.requester_id.map_or(true, |id| request.requester_id == id)
            && self.status.map_or(true, |status| request.status == status)
            && self.resource_type.map_or(true, |kind| request.resource_type == kind)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionQuery {
    pub actor_id: MemberId,
    pub action: Action,
    pub resource_type: ResourceType,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub context: Metadata,
}

impl PermissionQuery {
    #[must_use]
    pub fn new(
        actor_id: MemberId,
        action: Action,
        resource_type: ResourceType,
        resource_id: Option<String>,
    ) -> Self {
        Self { actor_id, action, resource_type, resource_id, context: Metadata::new() }
    }

    #[must_use]
    pub fn on_memory(actor_id: MemberId, action: Action, memory_id: MemoryId) -> Self {
        Self::new(actor_id, action, ResourceType::Memory, Some(memory_id.to_string()))
    }
}

/// The fields of a memory the decision pipeline looks at.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct MemoryAccessView {
    pub id: MemoryId,
    pub created_by: MemberId,
    pub visibility: Visibility,
    pub memory_type: MemoryType,
}

impl From<&TeamMemory> for MemoryAccessView {
    fn from(memory: &TeamMemory) -> Self {
        Self {
            id: memory.id,
            created_by: memory.created_by,
            visibility: memory.visibility,
            memory_type: memory.memory_type,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DecisionInputs<'a> {
    /// Candidate rules, already in ascending `sequence` order.
    pub rules: &'a [PermissionRule],
    pub access_requests: &'a [AccessRequest],
    /// The memory named by the query, when it exists.
    pub memory: Option<&'a MemoryAccessView>,
    pub now: OffsetDateTime,
    pub unknown_conditions: UnknownConditionPolicy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    ActorNotFound,
    ExplicitRule,
    RoleDefault,
    ResourceVisibility,
}

impl DecisionSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ActorNotFound => "actor_not_found",
            Self::ExplicitRule => "explicit_rule",
            Self::RoleDefault => "role_default",
            Self::ResourceVisibility => "resource_visibility",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PermissionDecision {
    pub granted: bool,
    pub source: DecisionSource,
    pub rule_id: Option<RuleId>,
    pub reasons: Vec<String>,
}

/// Fixed role x action capability matrix.
#[must_use]
pub fn role_allows(role: Role, action: Action) -> bool {
    match role {
        Role::Admin => true,
        Role::Developer => matches!(
            action,
            Action::Read | Action::Write | Action::Share | Action::Vote | Action::Comment
        ),
        Role::Observer => matches!(action, Action::Read | Action::Vote | Action::Comment),
    }
}

/// Owner always passes; otherwise public and team-only pass and private fails.
/// A missing memory fails.
#[must_use]
pub fn visibility_allows(memory: Option<&MemoryAccessView>, actor_id: MemberId) -> bool {
    let Some(memory) = memory else {
        return false;
    };
    if memory.created_by == actor_id {
        return true;
    }
    match memory.visibility {
        Visibility::Public | Visibility::TeamOnly => true,
        Visibility::Private => false,
    }
}

#[must_use]
pub fn evaluate_permission(
    actor: Option<&TeamMember>,
    query: &PermissionQuery,
    inputs: &DecisionInputs<'_>,
) -> PermissionDecision {
    let Some(actor) = actor else {
        return PermissionDecision {
            granted: false,
            source: DecisionSource::ActorNotFound,
            rule_id: None,
            reasons: vec!["actor not found".to_string()],
        };
    };

    let mut reasons = Vec::new();
    for rule in inputs.rules {
        if !rule.is_effective(inputs.now) || !rule.targets(actor.id, query) {
            continue;
        }
        let Some(permission) = rule.permission_for(query.action) else {
            continue;
        };
        if let Some(failed) = first_failed_condition(rule, actor.id, query, inputs) {
            reasons.push(format!("rule {} skipped: condition {failed} not satisfied", rule.id));
            continue;
        }

        reasons.push(format!(
            "rule {} {} {}",
            rule.id,
            if permission.granted { "grants" } else { "denies" },
            query.action
        ));
        return PermissionDecision {
            granted: permission.granted,
            source: DecisionSource::ExplicitRule,
            rule_id: Some(rule.id),
            reasons,
        };
    }

    let role_granted = role_allows(actor.role, query.action);
    reasons.push(format!(
        "role {} {} {}",
        actor.role,
        if role_granted { "allows" } else { "does not allow" },
        query.action
    ));

    if query.resource_type != ResourceType::Memory || query.resource_id.is_none() {
        return PermissionDecision {
            granted: role_granted,
            source: DecisionSource::RoleDefault,
            rule_id: None,
            reasons,
        };
    }

    let memory = inputs
        .memory
        .filter(|memory| query.resource_id.as_deref() == Some(memory.id.to_string().as_str()));
    let visible = visibility_allows(memory, actor.id);
    reasons.push(match memory {
        None => "memory not found".to_string(),
        Some(memory) if memory.created_by == actor.id => "actor owns the memory".to_string(),
        Some(memory) => format!("memory visibility is {}", memory.visibility),
    });

    PermissionDecision {
        granted: role_granted && visible,
        source: DecisionSource::ResourceVisibility,
        rule_id: None,
        reasons,
    }
}

fn first_failed_condition<'r>(
    rule: &'r PermissionRule,
    actor_id: MemberId,
    query: &PermissionQuery,
    inputs: &DecisionInputs<'_>,
) -> Option<&'r ConditionKind> {
    rule.conditions
        .iter()
        .find(|condition| !condition_holds(condition, actor_id, query, inputs))
        .map(|condition| &condition.kind)
}

fn condition_holds(
    condition: &PermissionCondition,
    actor_id: MemberId,
    query: &PermissionQuery,
    inputs: &DecisionInputs<'_>,
) -> bool {
    match &condition.kind {
        ConditionKind::TimeWindow => time_window_contains(&condition.value, inputs.now),
        ConditionKind::MemoryType => {
            let Some(expected) = condition.value.as_str() else {
                return false;
            };
            if query.resource_type != ResourceType::Memory || query.resource_id.is_none() {
                return true;
            }
            inputs.memory.map_or(true, |memory| memory.memory_type.as_str() == expected)
        }
        ConditionKind::ApprovalRequired => inputs.access_requests.iter().any(|request| {
            request.status == AccessRequestStatus::Approved
                && request.requester_id == actor_id
                && request.resource_type == query.resource_type
                && query.resource_id.as_deref() == Some(request.resource_id.as_str())
        }),
        ConditionKind::Other(_) => inputs.unknown_conditions == UnknownConditionPolicy::FailOpen,
    }
}

/// `{"start": rfc3339, "end": rfc3339}`, inclusive on both ends. Malformed windows never hold.
fn time_window_contains(value: &Value, now: OffsetDateTime) -> bool {
    let bound = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .and_then(|raw| OffsetDateTime::parse(raw, &Rfc3339).ok())
    };
    match (bound("start"), bound("end")) {
        (Some(start), Some(end)) => start <= now && now <= end,
        _ => false,
    }
}
