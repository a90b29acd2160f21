//! Async facade over the team memory engine.
//!
//! [`TeamMemoryApi`] owns one SQLite store and the process-local caches in front
//! of it (permission rules, access requests, and the bounded audit trail). All
//! calls take a single async mutex, so writes are applied one at a time in
//! completion order.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use team_memory_core::{
    AccessRequest, AccessRequestFilter, AccessRequestId, AuditFilter, AuditLog, CommentId,
    ComplianceReport, MemberId, MemoryFilter, MemoryId, MemoryUpdate, NewAccessRequest,
    NewMember, NewMemory, NewPermissionRule, Permission, PermissionDecision, PermissionQuery,
    PermissionRule, PermissionRuleUpdate, ResourceType, Role, RuleFilter, RuleId, TeamAnalytics,
    TeamMember, TeamMemory, TeamPermissions, UnknownConditionPolicy, UsageEvent, VoteKind,
    VoteTally, DEFAULT_AUDIT_CAPACITY,
};
use team_memory_store_sqlite::{IntegrityReport, SchemaStatus};
use time::OffsetDateTime;
use tokio::sync::Mutex;

mod engine;

use engine::EngineState;

pub const API_CONTRACT_VERSION: &str = "api.v1";

fn default_audit_capacity() -> usize {
    DEFAULT_AUDIT_CAPACITY
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub team_id: String,
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,
    #[serde(default)]
    pub unknown_condition_policy: UnknownConditionPolicy,
}

impl EngineConfig {
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>, team_id: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            team_id: team_id.into(),
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
            unknown_condition_policy: UnknownConditionPolicy::default(),
        }
    }
}

/// One user rule in a bulk grant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BulkPermissionUpdate {
    pub user_id: MemberId,
    pub resource_type: ResourceType,
    #[serde(default)]
    pub resource_id: Option<String>,
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShareMemoryRequest {
    pub memory_id: MemoryId,
    pub shared_by: MemberId,
    pub shared_with: Vec<MemberId>,
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone)]
pub struct TeamMemoryApi {
    config: Arc<EngineConfig>,
    state: Arc<Mutex<EngineState>>,
}

impl fmt::Debug for TeamMemoryApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeamMemoryApi").field("config", &self.config).finish_non_exhaustive()
    }
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

impl TeamMemoryApi {
    /// Open the store, apply migrations, and rehydrate rules, requests, and the
    /// newest `audit_capacity` audit entries.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened, migrated, or read.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let state = EngineState::open(&config)?;
        Ok(Self { config: Arc::new(config), state: Arc::new(Mutex::new(state)) })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Admit a member to the team. Capabilities default from the role when omitted.
    ///
    /// # Errors
    /// Returns a validation error for a malformed or duplicate email, or a store error.
    pub async fn add_member(&self, input: NewMember) -> Result<TeamMember> {
        self.state.lock().await.add_member(input, now())
    }

    /// Members ordered by join time.
    ///
    /// # Errors
    /// Returns an error when the store read fails.
    pub async fn list_members(&self) -> Result<Vec<TeamMember>> {
        self.state.lock().await.list_members()
    }

    /// # Errors
    /// Returns an error when the store read fails.
    pub async fn get_member(&self, member_id: MemberId) -> Result<Option<TeamMember>> {
        self.state.lock().await.get_member(member_id)
    }

    /// Change a member's role and capability bundle. Only an admin or a member
    /// holding `can_manage_team` may do this; anyone else gets `false`.
    ///
    /// # Errors
    /// Returns an error when the store write fails.
    pub async fn update_member_role(
        &self,
        member_id: MemberId,
        role: Role,
        permissions: Option<TeamPermissions>,
        updated_by: MemberId,
    ) -> Result<bool> {
        self.state.lock().await.update_member_role(member_id, role, permissions, updated_by, now())
    }

    /// Refresh `last_active`.
    ///
    /// # Errors
    /// Returns an error when the store write fails.
    pub async fn touch_member(&self, member_id: MemberId) -> Result<bool> {
        self.state.lock().await.touch_member(member_id, now())
    }

    /// Create a memory. Returns `None` when `created_by` is not a team member.
    ///
    /// Callers are responsible for any permission check before calling.
    ///
    /// # Errors
    /// Returns a validation error for blank title or content, or a store error.
    pub async fn create_memory(&self, input: NewMemory) -> Result<Option<MemoryId>> {
        self.state.lock().await.create_memory(input, now())
    }

    /// Memories newest first, with votes and comments materialized.
    ///
    /// # Errors
    /// Returns an error when the store read fails.
    pub async fn list_memories(&self, filter: MemoryFilter) -> Result<Vec<TeamMemory>> {
        self.state.lock().await.list_memories(&filter)
    }

    /// # Errors
    /// Returns an error when the store read fails.
    pub async fn get_memory(&self, memory_id: MemoryId) -> Result<Option<TeamMemory>> {
        self.state.lock().await.get_memory(memory_id)
    }

    /// Keyword search over title, content, and context.
    ///
    /// Private memories are only visible to their owner. Results are ranked by
    /// usage then success score and capped at
    /// [`SEARCH_RESULT_LIMIT`](team_memory_core::SEARCH_RESULT_LIMIT).
    ///
    /// # Errors
    /// Returns an error when a store read fails.
    pub async fn search_memories(
        &self,
        query: &str,
        viewer: Option<MemberId>,
    ) -> Result<Vec<TeamMemory>> {
        self.state.lock().await.search_memories(query, viewer)
    }

    /// Edit a memory as its owner or an admin. Others get `false`.
    ///
    /// # Errors
    /// Returns a validation error when the edit blanks the title or content, or a store error.
    pub async fn update_memory(
        &self,
        memory_id: MemoryId,
        editor_id: MemberId,
        update: MemoryUpdate,
    ) -> Result<bool> {
        self.state.lock().await.update_memory(memory_id, editor_id, &update, now())
    }

    /// Upsert a member's vote and return the new tally.
    ///
    /// Returns `None` when the memory or member does not exist.
    ///
    /// # Errors
    /// Returns an error when the vote transaction fails.
    pub async fn vote_on_memory(
        &self,
        memory_id: MemoryId,
        member_id: MemberId,
        vote: VoteKind,
    ) -> Result<Option<VoteTally>> {
        self.state.lock().await.vote_on_memory(memory_id, member_id, vote, now())
    }

    /// Append an immutable comment, optionally replying to another comment on
    /// the same memory. Returns `None` when the memory, member, or parent is missing.
    ///
    /// # Errors
    /// Returns a validation error for empty content, or a store error.
    pub async fn add_comment(
        &self,
        memory_id: MemoryId,
        member_id: MemberId,
        content: &str,
        parent_comment_id: Option<CommentId>,
    ) -> Result<Option<CommentId>> {
        self.state.lock().await.add_comment(memory_id, member_id, content, parent_comment_id, now())
    }

    /// Record one attempted use. `usage_count` grows whether or not it succeeded.
    ///
    /// # Errors
    /// Returns an error when the usage transaction fails.
    pub async fn track_usage(
        &self,
        memory_id: MemoryId,
        used_by: MemberId,
        context: &str,
        success: bool,
    ) -> Result<bool> {
        self.state.lock().await.track_usage(memory_id, used_by, context, success, now())
    }

    /// # Errors
    /// Returns an error when the store read fails.
    pub async fn list_usage_events(&self, memory_id: Option<MemoryId>) -> Result<Vec<UsageEvent>> {
        self.state.lock().await.list_usage_events(memory_id)
    }

    /// Decide a permission query and write exactly one audit entry.
    ///
    /// # Errors
    /// Returns an error only when a store read fails; denials are `Ok(false)`.
    pub async fn check_permission(&self, query: PermissionQuery) -> Result<bool> {
        Ok(self.explain_permission(query).await?.granted)
    }

    /// Like [`Self::check_permission`] but returns the deciding layer and reasons.
    ///
    /// # Errors
    /// Returns an error only when a store read fails.
    pub async fn explain_permission(&self, query: PermissionQuery) -> Result<PermissionDecision> {
        self.state.lock().await.explain_permission(&query, now())
    }

    /// # Errors
    /// Returns a validation error for a rule without permissions or subject, or a store error.
    pub async fn create_permission_rule(
        &self,
        input: NewPermissionRule,
        created_by: MemberId,
    ) -> Result<PermissionRule> {
        self.state.lock().await.create_permission_rule(input, created_by, now())
    }

    /// # Errors
    /// Returns a validation error for an empty permission list, or a store error.
    pub async fn update_permission_rule(
        &self,
        rule_id: RuleId,
        update: PermissionRuleUpdate,
        updated_by: MemberId,
    ) -> Result<bool> {
        self.state.lock().await.update_permission_rule(rule_id, &update, updated_by, now())
    }

    /// Deactivate a rule. It is kept for audit history.
    ///
    /// # Errors
    /// Returns an error when the store write fails.
    pub async fn delete_permission_rule(
        &self,
        rule_id: RuleId,
        deleted_by: MemberId,
    ) -> Result<bool> {
        self.state.lock().await.delete_permission_rule(rule_id, deleted_by, now())
    }

    /// Rules in evaluation (sequence) order.
    pub async fn get_permission_rules(&self, filter: RuleFilter) -> Vec<PermissionRule> {
        self.state.lock().await.get_permission_rules(&filter)
    }

    /// Create one user rule per update. Every update is validated before any is written.
    ///
    /// # Errors
    /// Returns a validation error for any invalid update, or a store error.
    pub async fn bulk_update_permissions(
        &self,
        updates: Vec<BulkPermissionUpdate>,
        updated_by: MemberId,
    ) -> Result<Vec<PermissionRule>> {
        self.state.lock().await.bulk_update_permissions(updates, updated_by, now())
    }

    /// Grant recipients a memory rule, if the sharer may share it.
    ///
    /// # Errors
    /// Returns a validation error for an empty permission list, or a store error.
    pub async fn share_memory(&self, request: ShareMemoryRequest) -> Result<bool> {
        self.state.lock().await.share_memory(request, now())
    }

    /// Deactivate every active rule giving `revoked_from` access to the memory.
    /// Requires the `admin` action on that memory.
    ///
    /// # Errors
    /// Returns an error when a store call fails.
    pub async fn revoke_memory_access(
        &self,
        memory_id: MemoryId,
        revoked_by: MemberId,
        revoked_from: MemberId,
    ) -> Result<bool> {
        self.state.lock().await.revoke_memory_access(memory_id, revoked_by, revoked_from, now())
    }

    /// File a pending request. Returns `None` when the requester is not a member.
    ///
    /// # Errors
    /// Returns a validation error for a missing target or empty permission list, or a store error.
    pub async fn create_access_request(
        &self,
        input: NewAccessRequest,
    ) -> Result<Option<AccessRequestId>> {
        self.state.lock().await.create_access_request(input, now())
    }

    /// Approve a pending request and materialize its grant rule.
    ///
    /// Returns `false` for unknown or non-pending requests and for approvers who
    /// are neither admins, team managers, nor listed approvers.
    ///
    /// # Errors
    /// Returns an error when the approval transaction fails.
    pub async fn approve_access_request(
        &self,
        request_id: AccessRequestId,
        approver_id: MemberId,
    ) -> Result<bool> {
        self.state.lock().await.approve_access_request(request_id, approver_id, now())
    }

    /// # Errors
    /// Returns an error when the store write fails.
    pub async fn deny_access_request(
        &self,
        request_id: AccessRequestId,
        denier_id: MemberId,
        reason: &str,
    ) -> Result<bool> {
        self.state.lock().await.deny_access_request(request_id, denier_id, reason, now())
    }

    /// Matching requests, newest first.
    pub async fn get_access_requests(&self, filter: AccessRequestFilter) -> Vec<AccessRequest> {
        self.state.lock().await.get_access_requests(&filter)
    }

    pub async fn get_access_request(&self, request_id: AccessRequestId) -> Option<AccessRequest> {
        self.state.lock().await.get_access_request(request_id)
    }

    /// Expire every pending request whose expiry is at or before `as_of`.
    ///
    /// Nothing calls this automatically; it is the hook for an external sweeper.
    ///
    /// # Errors
    /// Returns an error when a store write fails.
    pub async fn expire_access_requests(&self, as_of: OffsetDateTime) -> Result<usize> {
        self.state.lock().await.expire_access_requests(as_of, now())
    }

    /// Audit entries matching `filter`, newest first.
    ///
    /// Recent windows are answered from the in-memory trail; anything older than
    /// the trail reaches back into the persisted history.
    ///
    /// # Errors
    /// Returns an error when the persisted history cannot be read.
    pub async fn get_audit_logs(&self, filter: AuditFilter) -> Result<Vec<AuditLog>> {
        self.state.lock().await.get_audit_logs(&filter)
    }

    /// Aggregate every audit entry in `[start, end]`, including entries already
    /// evicted from the in-memory trail.
    ///
    /// # Errors
    /// Returns an error when the persisted history cannot be read.
    pub async fn generate_compliance_report(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<ComplianceReport> {
        self.state.lock().await.generate_compliance_report(start, end)
    }

    /// Recompute team analytics. Cost is O(members x memories).
    ///
    /// # Errors
    /// Returns an error when a store read fails.
    pub async fn get_team_analytics(&self) -> Result<TeamAnalytics> {
        self.state.lock().await.get_team_analytics(now())
    }

    /// # Errors
    /// Returns an error when an integrity check fails to run.
    pub async fn integrity_check(&self) -> Result<IntegrityReport> {
        self.state.lock().await.integrity_check()
    }

    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub async fn schema_status(&self) -> Result<SchemaStatus> {
        self.state.lock().await.schema_status()
    }
}
