use anyhow::{Context, Result};
use serde_json::Value;
use team_memory_core::{
    build_compliance_report, build_team_analytics, evaluate_permission, merge_search_hits,
    tokenize_search_terms, AccessRequest, AccessRequestFilter, AccessRequestId, Action,
    AuditFilter, AuditLog, AuditTrail, CommentId, ComplianceReport, DecisionInputs,
    DecisionSource, MemberId, MemoryAccessView, MemoryComment, MemoryFilter, MemoryId,
    MemoryUpdate, MemoryVote, NewAccessRequest, NewMember, NewMemory, NewPermissionRule,
    PermissionDecision, PermissionQuery, PermissionRule, PermissionRuleUpdate, ResourceType,
    Role, RuleFilter, RuleId, TeamAnalytics, TeamError, TeamMember, TeamMemory, TeamPermissions,
    UnknownConditionPolicy, UsageEvent, UsageId, VoteKind, VoteTally, SEARCH_TERM_HIT_LIMIT,
};
use team_memory_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use time::OffsetDateTime;

use crate::{BulkPermissionUpdate, EngineConfig, ShareMemoryRequest};

const SYSTEM_ACTOR: &str = "system";

/// Store plus the process-local caches in front of it.
///
/// Rules are kept in ascending `sequence` order so first-match evaluation is
/// stable across restarts. Every mutation reaches the store before the caches.
pub(crate) struct EngineState {
    store: SqliteStore,
    rules: Vec<PermissionRule>,
    requests: Vec<AccessRequest>,
    audit: AuditTrail,
    unknown_conditions: UnknownConditionPolicy,
}

impl EngineState {
    pub(crate) fn open(config: &EngineConfig) -> Result<Self> {
        let mut store = SqliteStore::open(&config.db_path, &config.team_id)?;
        store.migrate()?;

        let rules = store.list_rules().context("failed to rehydrate permission rules")?;
        let requests =
            store.list_access_requests().context("failed to rehydrate access requests")?;
        let recent = store
            .list_recent_audit(config.audit_capacity)
            .context("failed to rehydrate audit trail")?;
        let audit = AuditTrail::from_entries(config.audit_capacity, recent);

        tracing::info!(
            team_id = %config.team_id,
            rules = rules.len(),
            access_requests = requests.len(),
            audit_entries = audit.len(),
            unknown_conditions = config.unknown_condition_policy.as_str(),
            "opened team memory engine"
        );

        Ok(Self {
            store,
            rules,
            requests,
            audit,
            unknown_conditions: config.unknown_condition_policy,
        })
    }

    // --- members -------------------------------------------------------------

    pub(crate) fn add_member(
        &mut self,
        input: NewMember,
        now: OffsetDateTime,
    ) -> Result<TeamMember> {
        input.validate()?;
        let email = input.email.trim().to_ascii_lowercase();
        if self.store.find_member_by_email(&email)?.is_some() {
            return Err(TeamError::Validation(format!("member with email `{email}` already exists"))
                .into());
        }

        let member = input.into_member(self.store.team_id(), now);
        self.store.insert_member(&member)?;

        let entry = AuditLog::new("add_team_member", "team_member", member.id.to_string(), now)
            .by(member.id.to_string(), Some(member.name.as_str()))
            .named(member.name.clone())
            .with_metadata("role", member.role.as_str());
        self.record(entry);
        tracing::info!(member_id = %member.id, role = %member.role, "added team member");
        Ok(member)
    }

    pub(crate) fn list_members(&self) -> Result<Vec<TeamMember>> {
        self.store.list_members()
    }

    pub(crate) fn get_member(&self, member_id: MemberId) -> Result<Option<TeamMember>> {
        self.store.get_member(member_id)
    }

    pub(crate) fn update_member_role(
        &mut self,
        member_id: MemberId,
        role: Role,
        permissions: Option<TeamPermissions>,
        updated_by: MemberId,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let entry = self
            .entry(updated_by, "update_member_role", "team_member", member_id.to_string(), now)
            .with_metadata("role", role.as_str());
        let Some(updater) = self.store.get_member(updated_by)? else {
            return Ok(self.reject(entry, "actor not found"));
        };
        if !updater.manages_team() {
            return Ok(self.reject(entry, "actor may not manage team members"));
        }

        let permissions = permissions.unwrap_or_else(|| TeamPermissions::for_role(role));
        if !self.store.update_member_role(member_id, role, &permissions)? {
            return Ok(self.reject(entry, "member not found"));
        }

        self.record(entry);
        tracing::info!(
            member_id = %member_id,
            role = %role,
            updated_by = %updated_by,
            "updated member role"
        );
        Ok(true)
    }

    pub(crate) fn touch_member(
        &mut self,
        member_id: MemberId,
        now: OffsetDateTime,
    ) -> Result<bool> {
        if !self.store.touch_member(member_id, now)? {
            return Ok(false);
        }
        let entry =
            self.entry(member_id, "touch_member", "team_member", member_id.to_string(), now);
        self.record(entry);
        Ok(true)
    }

    // --- catalog -------------------------------------------------------------

    pub(crate) fn create_memory(
        &mut self,
        input: NewMemory,
        now: OffsetDateTime,
    ) -> Result<Option<MemoryId>> {
        input.validate()?;
        let Some(creator) = self.store.get_member(input.created_by)? else {
            return Ok(None);
        };

        let memory = input.into_memory(now);
        self.store.insert_memory(&memory)?;

        let entry = AuditLog::new("create_memory", "memory", memory.id.to_string(), now)
            .by(creator.id.to_string(), Some(creator.name.as_str()))
            .named(memory.title.clone())
            .with_metadata("memory_type", memory.memory_type.as_str())
            .with_metadata("visibility", memory.visibility.as_str());
        self.record(entry);
        tracing::info!(memory_id = %memory.id, created_by = %creator.id, "created memory");
        Ok(Some(memory.id))
    }

    pub(crate) fn list_memories(&self, filter: &MemoryFilter) -> Result<Vec<TeamMemory>> {
        self.store.list_memories(filter)
    }

    pub(crate) fn get_memory(&self, memory_id: MemoryId) -> Result<Option<TeamMemory>> {
        self.store.get_memory(memory_id)
    }

    pub(crate) fn search_memories(
        &self,
        query: &str,
        viewer: Option<MemberId>,
    ) -> Result<Vec<TeamMemory>> {
        let mut hits = Vec::new();
        for term in tokenize_search_terms(query) {
            hits.extend(self.store.search_memories_for_term(&term, viewer, SEARCH_TERM_HIT_LIMIT)?);
        }
        Ok(merge_search_hits(hits))
    }

    pub(crate) fn update_memory(
        &mut self,
        memory_id: MemoryId,
        editor_id: MemberId,
        update: &MemoryUpdate,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let entry = self.entry(editor_id, "update_memory", "memory", memory_id.to_string(), now);
        let Some(editor) = self.store.get_member(editor_id)? else {
            return Ok(self.reject(entry, "actor not found"));
        };
        let Some(mut memory) = self.store.get_memory(memory_id)? else {
            return Ok(false);
        };
        if memory.created_by != editor.id && editor.role != Role::Admin {
            return Ok(
                self.reject(entry.named(memory.title), "only the owner or an admin may edit")
            );
        }

        update.apply(&mut memory, now)?;
        if !self.store.update_memory(&memory)? {
            return Ok(false);
        }

        self.record(entry.named(memory.title.clone()));
        tracing::info!(memory_id = %memory_id, editor_id = %editor_id, "updated memory");
        Ok(true)
    }

    pub(crate) fn vote_on_memory(
        &mut self,
        memory_id: MemoryId,
        member_id: MemberId,
        vote: VoteKind,
        now: OffsetDateTime,
    ) -> Result<Option<VoteTally>> {
        if self.store.get_member(member_id)?.is_none() {
            return Ok(None);
        }
        let Some(tally) =
            self.store.upsert_vote(&MemoryVote { memory_id, member_id, vote, timestamp: now })?
        else {
            return Ok(None);
        };

        let entry = self
            .entry(member_id, "vote_memory", "memory", memory_id.to_string(), now)
            .with_metadata("vote", vote.as_str())
            .with_metadata("success_score", tally.success_score());
        self.record(entry);
        tracing::debug!(
            memory_id = %memory_id,
            upvotes = tally.upvotes,
            downvotes = tally.downvotes,
            "recorded vote"
        );
        Ok(Some(tally))
    }

    pub(crate) fn add_comment(
        &mut self,
        memory_id: MemoryId,
        member_id: MemberId,
        content: &str,
        parent_comment_id: Option<CommentId>,
        now: OffsetDateTime,
    ) -> Result<Option<CommentId>> {
        if content.trim().is_empty() {
            return Err(
                TeamError::Validation("comment content MUST be non-empty".to_string()).into()
            );
        }
        if self.store.get_member(member_id)?.is_none() {
            return Ok(None);
        }
        let Some(memory) = self.store.get_memory(memory_id)? else {
            return Ok(None);
        };
        if let Some(parent) = parent_comment_id {
            if !memory.comments.iter().any(|comment| comment.id == parent) {
                return Ok(None);
            }
        }

        let comment = MemoryComment {
            id: CommentId::new(),
            memory_id,
            member_id,
            content: content.to_string(),
            timestamp: now,
            parent_comment_id,
        };
        self.store.insert_comment(&comment)?;

        let mut entry = self
            .entry(member_id, "add_comment", "memory", memory_id.to_string(), now)
            .named(memory.title)
            .with_metadata("comment_id", comment.id.to_string());
        if let Some(parent) = parent_comment_id {
            entry = entry.with_metadata("parent_comment_id", parent.to_string());
        }
        self.record(entry);
        Ok(Some(comment.id))
    }

    pub(crate) fn track_usage(
        &mut self,
        memory_id: MemoryId,
        used_by: MemberId,
        context: &str,
        success: bool,
        now: OffsetDateTime,
    ) -> Result<bool> {
        if self.store.get_member(used_by)?.is_none() {
            return Ok(false);
        }
        let event = UsageEvent {
            id: UsageId::new(),
            memory_id,
            used_by,
            used_at: now,
            context: context.to_string(),
            success,
        };
        if !self.store.record_usage(&event)? {
            return Ok(false);
        }

        let entry = self
            .entry(used_by, "track_usage", "memory", memory_id.to_string(), now)
            .with_metadata("success", success);
        self.record(entry);
        Ok(true)
    }

    pub(crate) fn list_usage_events(&self, memory_id: Option<MemoryId>) -> Result<Vec<UsageEvent>> {
        self.store.list_usage_events(memory_id)
    }

    // --- permission decisions ------------------------------------------------

    /// Evaluate and audit one permission query. A failing store read is audited
    /// as a failed check and then propagated.
    pub(crate) fn explain_permission(
        &mut self,
        query: &PermissionQuery,
        now: OffsetDateTime,
    ) -> Result<PermissionDecision> {
        let mut entry = AuditLog::new(
            "permission_check",
            query.resource_type.as_str(),
            query.resource_id.clone().unwrap_or_default(),
            now,
        )
        .with_metadata("action", query.action.as_str());
        if !query.context.is_empty() {
            let context = query.context.clone().into_iter().collect();
            entry = entry.with_metadata("context", Value::Object(context));
        }

        let (actor_name, decision) = match self.decide(query, now) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.record(entry.by(query.actor_id.to_string(), None).failed(format!("{err:#}")));
                return Err(err);
            }
        };

        entry = entry
            .by(query.actor_id.to_string(), actor_name.as_deref())
            .with_metadata("granted", decision.granted)
            .with_metadata("source", decision.source.as_str());
        if let Some(rule_id) = decision.rule_id {
            entry = entry.with_metadata("rule_id", rule_id.to_string());
        }
        if decision.source == DecisionSource::ActorNotFound {
            entry = entry.failed("actor not found");
        }
        self.record(entry);

        tracing::debug!(
            actor_id = %query.actor_id,
            action = %query.action,
            resource_type = %query.resource_type,
            resource_id = query.resource_id.as_deref().unwrap_or(""),
            granted = decision.granted,
            source = decision.source.as_str(),
            "permission decision"
        );
        Ok(decision)
    }

    fn decide(
        &self,
        query: &PermissionQuery,
        now: OffsetDateTime,
    ) -> Result<(Option<String>, PermissionDecision)> {
        let actor = self.store.get_member(query.actor_id)?;
        let memory = match (query.resource_type, query.resource_id.as_deref()) {
            (ResourceType::Memory, Some(raw)) => match MemoryId::parse(raw) {
                Ok(memory_id) => {
                    self.store.get_memory(memory_id)?.as_ref().map(MemoryAccessView::from)
                }
                Err(_) => None,
            },
            _ => None,
        };

        let inputs = DecisionInputs {
            rules: &self.rules,
            access_requests: &self.requests,
            memory: memory.as_ref(),
            now,
            unknown_conditions: self.unknown_conditions,
        };
        let decision = evaluate_permission(actor.as_ref(), query, &inputs);
        Ok((actor.map(|actor| actor.name), decision))
    }

    // --- rules ---------------------------------------------------------------

    pub(crate) fn create_permission_rule(
        &mut self,
        input: NewPermissionRule,
        created_by: MemberId,
        now: OffsetDateTime,
    ) -> Result<PermissionRule> {
        input.validate()?;
        self.insert_rule(input, created_by, now)
    }

    fn insert_rule(
        &mut self,
        input: NewPermissionRule,
        created_by: MemberId,
        now: OffsetDateTime,
    ) -> Result<PermissionRule> {
        let sequence = self.store.next_rule_sequence()?;
        let rule = input.into_rule(created_by, sequence, now);
        self.store.insert_rule(&rule)?;
        self.rules.push(rule.clone());
        self.note_rule_created(&rule, now);
        Ok(rule)
    }

    /// Write validated rules in one store transaction, then cache and audit them.
    fn insert_rules(
        &mut self,
        inputs: Vec<NewPermissionRule>,
        created_by: MemberId,
        now: OffsetDateTime,
    ) -> Result<Vec<PermissionRule>> {
        let first_sequence = self.store.next_rule_sequence()?;
        let rules: Vec<PermissionRule> = inputs
            .into_iter()
            .zip(first_sequence..)
            .map(|(input, sequence)| input.into_rule(created_by, sequence, now))
            .collect();
        self.store.insert_rules(&rules)?;

        self.rules.extend(rules.iter().cloned());
        for rule in &rules {
            self.note_rule_created(rule, now);
        }
        Ok(rules)
    }

    fn note_rule_created(&mut self, rule: &PermissionRule, now: OffsetDateTime) {
        let entry = self
            .entry(
                rule.created_by,
                "create_permission_rule",
                "permission_rule",
                rule.id.to_string(),
                now,
            )
            .with_metadata("subject_id", rule.subject_id.clone())
            .with_metadata("resource_type", rule.resource_type.as_str());
        self.record(entry);
        tracing::info!(rule_id = %rule.id, sequence = rule.sequence, "created permission rule");
    }

    pub(crate) fn update_permission_rule(
        &mut self,
        rule_id: RuleId,
        update: &PermissionRuleUpdate,
        updated_by: MemberId,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let Some(index) = self.rules.iter().position(|rule| rule.id == rule_id) else {
            return Ok(false);
        };
        let mut updated = self.rules[index].clone();
        update.apply(&mut updated)?;
        if !self.store.update_rule(&updated)? {
            return Ok(false);
        }
        self.rules[index] = updated;

        let entry = self.entry(
            updated_by,
            "update_permission_rule",
            "permission_rule",
            rule_id.to_string(),
            now,
        );
        self.record(entry);
        tracing::info!(rule_id = %rule_id, "updated permission rule");
        Ok(true)
    }

    /// Tombstone a rule; it stays stored and listed with `is_active = false`.
    pub(crate) fn delete_permission_rule(
        &mut self,
        rule_id: RuleId,
        deleted_by: MemberId,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let Some(index) = self.rules.iter().position(|rule| rule.id == rule_id) else {
            return Ok(false);
        };
        let mut tombstone = self.rules[index].clone();
        tombstone.is_active = false;
        if !self.store.update_rule(&tombstone)? {
            return Ok(false);
        }
        self.rules[index] = tombstone;

        let entry = self.entry(
            deleted_by,
            "delete_permission_rule",
            "permission_rule",
            rule_id.to_string(),
            now,
        );
        self.record(entry);
        tracing::info!(rule_id = %rule_id, "deactivated permission rule");
        Ok(true)
    }

    pub(crate) fn get_permission_rules(&self, filter: &RuleFilter) -> Vec<PermissionRule> {
        self.rules.iter().filter(|rule| filter.matches(rule)).cloned().collect()
    }

    pub(crate) fn bulk_update_permissions(
        &mut self,
        updates: Vec<BulkPermissionUpdate>,
        updated_by: MemberId,
        now: OffsetDateTime,
    ) -> Result<Vec<PermissionRule>> {
        let inputs: Vec<NewPermissionRule> = updates
            .into_iter()
            .map(|update| {
                NewPermissionRule::for_user(
                    update.user_id,
                    update.resource_type,
                    update.resource_id,
                    update.permissions,
                )
            })
            .collect();
        for input in &inputs {
            input.validate()?;
        }

        let count = inputs.len();
        let created = self.insert_rules(inputs, updated_by, now)?;

        let entry = self
            .entry(updated_by, "bulk_update_permissions", "permission_rule", "bulk", now)
            .with_metadata("count", count);
        self.record(entry);
        Ok(created)
    }

    pub(crate) fn share_memory(
        &mut self,
        request: ShareMemoryRequest,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let check = PermissionQuery::on_memory(request.shared_by, Action::Share, request.memory_id);
        if !self.explain_permission(&check, now)?.granted {
            return Ok(false);
        }

        let inputs: Vec<NewPermissionRule> = request
            .shared_with
            .iter()
            .map(|member_id| {
                NewPermissionRule::for_user(
                    *member_id,
                    ResourceType::Memory,
                    Some(request.memory_id.to_string()),
                    request.permissions.clone(),
                )
            })
            .collect();
        for input in &inputs {
            input.validate()?;
        }
        self.insert_rules(inputs, request.shared_by, now)?;

        let shared_with: Vec<Value> =
            request.shared_with.iter().map(|id| Value::String(id.to_string())).collect();
        let mut entry = self
            .entry(request.shared_by, "share_memory", "memory", request.memory_id.to_string(), now)
            .with_metadata("shared_with", shared_with);
        if let Some(message) = request.message {
            entry = entry.with_metadata("message", message);
        }
        self.record(entry);
        tracing::info!(
            memory_id = %request.memory_id,
            recipients = request.shared_with.len(),
            "shared memory"
        );
        Ok(true)
    }

    pub(crate) fn revoke_memory_access(
        &mut self,
        memory_id: MemoryId,
        revoked_by: MemberId,
        revoked_from: MemberId,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let check = PermissionQuery::on_memory(revoked_by, Action::Admin, memory_id);
        if !self.explain_permission(&check, now)?.granted {
            return Ok(false);
        }

        let filter = RuleFilter {
            resource_type: Some(ResourceType::Memory),
            resource_id: Some(memory_id.to_string()),
            subject_id: Some(revoked_from.to_string()),
            is_active: Some(true),
        };
        let targets: Vec<_> =
            self.get_permission_rules(&filter).into_iter().map(|rule| rule.id).collect();
        for rule_id in &targets {
            self.delete_permission_rule(*rule_id, revoked_by, now)?;
        }

        let entry = self
            .entry(revoked_by, "revoke_memory_access", "memory", memory_id.to_string(), now)
            .with_metadata("revoked_from", revoked_from.to_string())
            .with_metadata("revoked_rules", targets.len());
        self.record(entry);
        tracing::info!(
            memory_id = %memory_id,
            revoked_from = %revoked_from,
            rules = targets.len(),
            "revoked memory access"
        );
        Ok(true)
    }

    // --- access requests -----------------------------------------------------

    pub(crate) fn create_access_request(
        &mut self,
        input: NewAccessRequest,
        now: OffsetDateTime,
    ) -> Result<Option<AccessRequestId>> {
        input.validate()?;
        let Some(requester) = self.store.get_member(input.requester_id)? else {
            return Ok(None);
        };

        let request = input.into_request(requester.name.clone(), now);
        self.store.insert_access_request(&request)?;

        let entry = AuditLog::new(
            "create_access_request",
            request.resource_type.as_str(),
            request.resource_id.clone(),
            now,
        )
        .by(requester.id.to_string(), Some(requester.name.as_str()))
        .named(request.resource_name.clone())
        .with_metadata("request_id", request.id.to_string());
        self.record(entry);
        tracing::info!(
            request_id = %request.id,
            requester_id = %requester.id,
            "created access request"
        );

        let id = request.id;
        self.requests.push(request);
        Ok(Some(id))
    }

    pub(crate) fn approve_access_request(
        &mut self,
        request_id: AccessRequestId,
        approver_id: MemberId,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let Some(index) = self.requests.iter().position(|request| request.id == request_id) else {
            return Ok(false);
        };
        let entry = self.request_entry(index, approver_id, "approve_access_request", now);
        let Some(approver) = self.store.get_member(approver_id)? else {
            return Ok(self.reject(entry, "actor not found"));
        };
        if !self.requests[index].can_be_decided_by(&approver) {
            return Ok(self.reject(entry, "actor may not decide this request"));
        }
        if !self.requests[index].is_pending() {
            return Ok(self.reject(entry, "access request is not pending"));
        }

        let mut approved = self.requests[index].clone();
        approved.approve(approver_id, now)?;
        let rule = approved.grant_rule(approver_id, self.store.next_rule_sequence()?, now);
        if !self.store.commit_approval(&approved, &rule)? {
            return Ok(false);
        }

        let rule_id = rule.id;
        self.requests[index] = approved;
        self.rules.push(rule);

        self.record(entry.with_metadata("rule_id", rule_id.to_string()));
        let rule_entry = self.entry(
            approver_id,
            "create_permission_rule",
            "permission_rule",
            rule_id.to_string(),
            now,
        );
        self.record(rule_entry);
        tracing::info!(
            request_id = %request_id,
            approver_id = %approver_id,
            rule_id = %rule_id,
            "approved access request"
        );
        Ok(true)
    }

    pub(crate) fn deny_access_request(
        &mut self,
        request_id: AccessRequestId,
        denier_id: MemberId,
        reason: &str,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let Some(index) = self.requests.iter().position(|request| request.id == request_id) else {
            return Ok(false);
        };
        let entry = self
            .request_entry(index, denier_id, "deny_access_request", now)
            .with_metadata("reason", reason);
        let Some(denier) = self.store.get_member(denier_id)? else {
            return Ok(self.reject(entry, "actor not found"));
        };
        if !self.requests[index].can_be_decided_by(&denier) {
            return Ok(self.reject(entry, "actor may not decide this request"));
        }
        if !self.requests[index].is_pending() {
            return Ok(self.reject(entry, "access request is not pending"));
        }

        let mut denied = self.requests[index].clone();
        denied.deny(denier_id, reason, now)?;
        if !self.store.update_access_request(&denied)? {
            return Ok(false);
        }
        self.requests[index] = denied;

        self.record(entry);
        tracing::info!(request_id = %request_id, denier_id = %denier_id, "denied access request");
        Ok(true)
    }

    /// Matching requests, newest first.
    pub(crate) fn get_access_requests(&self, filter: &AccessRequestFilter) -> Vec<AccessRequest> {
        let mut matched: Vec<AccessRequest> =
            self.requests.iter().filter(|request| filter.matches(request)).cloned().collect();
        matched.sort_by(|left, right| {
            right.created_at.cmp(&left.created_at).then(right.id.cmp(&left.id))
        });
        matched
    }

    pub(crate) fn get_access_request(&self, request_id: AccessRequestId) -> Option<AccessRequest> {
        self.requests.iter().find(|request| request.id == request_id).cloned()
    }

    pub(crate) fn expire_access_requests(
        &mut self,
        as_of: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Result<usize> {
        let mut expired = 0_usize;
        for request in &mut self.requests {
            let mut candidate = request.clone();
            if !candidate.expire_if_due(as_of) {
                continue;
            }
            self.store.update_access_request(&candidate)?;
            *request = candidate;
            expired += 1;
        }

        let entry = AuditLog::new("expire_access_requests", "access_request", "sweep", now)
            .by(SYSTEM_ACTOR, Some(SYSTEM_ACTOR))
            .with_metadata("expired", expired);
        self.record(entry);
        if expired > 0 {
            tracing::info!(expired, "expired access requests");
        }
        Ok(expired)
    }

    // --- audit, reports, analytics --------------------------------------------

    /// Served from the in-memory trail when it provably holds every match,
    /// otherwise from the persisted history.
    pub(crate) fn get_audit_logs(&self, filter: &AuditFilter) -> Result<Vec<AuditLog>> {
        let cached = self.audit.query(filter);
        if self.trail_covers(filter, cached.len()) {
            return Ok(cached);
        }
        self.store.query_audit(filter).context("failed to query persisted audit history")
    }

    pub(crate) fn generate_compliance_report(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<ComplianceReport> {
        let window = AuditFilter { start: Some(start), end: Some(end), ..AuditFilter::default() };
        let logs = self.get_audit_logs(&window)?;
        Ok(build_compliance_report(&logs, start, end))
    }

    /// The trail holds the newest suffix of the history. It answers a query alone
    /// when nothing has been evicted yet, when the window starts after the oldest
    /// cached entry, or when the newest `limit` matches were all found in it.
    fn trail_covers(&self, filter: &AuditFilter, cached_matches: usize) -> bool {
        if self.audit.len() < self.audit.capacity() {
            return true;
        }
        let starts_inside = match (filter.start, self.audit.iter().next()) {
            (Some(start), Some(oldest)) => start > oldest.timestamp,
            _ => false,
        };
        starts_inside || filter.limit.is_some_and(|limit| cached_matches >= limit)
    }

    pub(crate) fn get_team_analytics(&self, now: OffsetDateTime) -> Result<TeamAnalytics> {
        let members = self.store.list_members()?;
        let memories = self.store.list_memories(&MemoryFilter::default())?;
        let usage = self.store.list_usage_events(None)?;
        Ok(build_team_analytics(&members, &memories, &usage, now))
    }

    pub(crate) fn integrity_check(&self) -> Result<IntegrityReport> {
        self.store.integrity_check()
    }

    pub(crate) fn schema_status(&self) -> Result<SchemaStatus> {
        self.store.schema_status()
    }

    // --- helpers -------------------------------------------------------------

    fn entry(
        &self,
        actor_id: MemberId,
        action: &str,
        resource_type: &str,
        resource_id: impl Into<String>,
        now: OffsetDateTime,
    ) -> AuditLog {
        let actor_name = self.member_name(actor_id);
        AuditLog::new(action, resource_type, resource_id, now)
            .by(actor_id.to_string(), actor_name.as_deref())
    }

    fn request_entry(
        &self,
        index: usize,
        actor_id: MemberId,
        action: &str,
        now: OffsetDateTime,
    ) -> AuditLog {
        let request = &self.requests[index];
        self.entry(
            actor_id,
            action,
            request.resource_type.as_str(),
            request.resource_id.clone(),
            now,
        )
        .named(request.resource_name.clone())
            .with_metadata("request_id", request.id.to_string())
    }

    fn member_name(&self, member_id: MemberId) -> Option<String> {
        match self.store.get_member(member_id) {
            Ok(member) => member.map(|member| member.name),
            Err(err) => {
                tracing::warn!(
                    member_id = %member_id,
                    error = %err,
                    "failed to resolve audit actor name"
                );
                None
            }
        }
    }

    /// Record a failed entry and report the operation as not performed.
    fn reject(&mut self, entry: AuditLog, reason: &str) -> bool {
        tracing::debug!(
            action = %entry.action,
            actor_id = %entry.actor_id,
            reason,
            "rejected operation"
        );
        self.record(entry.failed(reason));
        false
    }

    /// Persist then cache an audit entry. Persistence is best-effort: a store
    /// failure is logged and the entry still lands in the in-memory trail.
    fn record(&mut self, entry: AuditLog) {
        if let Err(err) = self.store.append_audit(&entry) {
            tracing::warn!(
                action = %entry.action,
                audit_id = %entry.id,
                error = %err,
                "failed to persist audit entry"
            );
        }
        if let Some(evicted) = self.audit.push(entry) {
            tracing::debug!(
                audit_id = %evicted.id,
                capacity = self.audit.capacity(),
                "evicted oldest audit entry from in-memory trail"
            );
        }
    }
}
