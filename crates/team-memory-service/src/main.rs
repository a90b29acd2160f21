use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use team_memory_api::{
    BulkPermissionUpdate, ShareMemoryRequest, TeamMemoryApi, API_CONTRACT_VERSION,
};
use team_memory_core::{
    AccessRequest, AccessRequestFilter, AccessRequestId, AuditFilter, AuditLog, CommentId,
    ComplianceReport, MemberId, MemoryFilter, MemoryId, MemoryUpdate, NewAccessRequest,
    NewMember, NewMemory, NewPermissionRule, Permission, PermissionDecision, PermissionQuery,
    PermissionRule, PermissionRuleUpdate, Role, RuleFilter, RuleId, TeamAnalytics, TeamError,
    TeamMember, TeamMemory, TeamPermissions, UsageEvent, VoteKind, VoteTally,
};
use team_memory_store_sqlite::{IntegrityReport, SchemaStatus};
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

mod config;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: TeamMemoryApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    integrity: IntegrityReport,
}

#[derive(Debug, Clone, Serialize)]
struct Applied {
    applied: bool,
}

#[derive(Debug, Clone, Serialize)]
struct Created<T> {
    id: T,
}

#[derive(Debug, Clone, Serialize)]
struct PermissionCheck {
    granted: bool,
}

#[derive(Debug, Clone, Serialize)]
struct Expired {
    expired: usize,
}

#[derive(Debug, Clone, Deserialize)]
struct UpdateRoleRequest {
    role: Role,
    #[serde(default)]
    permissions: Option<TeamPermissions>,
    updated_by: MemberId,
}

#[derive(Debug, Clone, Deserialize)]
struct UpdateMemoryRequest {
    editor_id: MemberId,
    #[serde(flatten)]
    update: MemoryUpdate,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    member_id: Option<MemberId>,
}

#[derive(Debug, Clone, Deserialize)]
struct VoteRequest {
    member_id: MemberId,
    vote: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CommentRequest {
    member_id: MemberId,
    content: String,
    #[serde(default)]
    parent_comment_id: Option<CommentId>,
}

#[derive(Debug, Clone, Deserialize)]
struct UsageRequest {
    used_by: MemberId,
    #[serde(default)]
    context: String,
    success: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ShareRequest {
    shared_by: MemberId,
    shared_with: Vec<MemberId>,
    permissions: Vec<Permission>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RevokeRequest {
    revoked_by: MemberId,
    revoked_from: MemberId,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateRuleRequest {
    created_by: MemberId,
    #[serde(flatten)]
    rule: NewPermissionRule,
}

#[derive(Debug, Clone, Deserialize)]
struct UpdateRuleRequest {
    updated_by: MemberId,
    #[serde(flatten)]
    update: PermissionRuleUpdate,
}

#[derive(Debug, Clone, Deserialize)]
struct DeleteRuleRequest {
    deleted_by: MemberId,
}

#[derive(Debug, Clone, Deserialize)]
struct BulkRequest {
    updated_by: MemberId,
    updates: Vec<BulkPermissionUpdate>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApproveRequest {
    approver_id: MemberId,
}

#[derive(Debug, Clone, Deserialize)]
struct DenyRequest {
    denier_id: MemberId,
    reason: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ExpireRequest {
    #[serde(with = "time::serde::rfc3339")]
    as_of: OffsetDateTime,
}

#[derive(Debug, Clone, Deserialize)]
struct ReportRequest {
    #[serde(with = "time::serde::rfc3339")]
    start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    end: OffsetDateTime,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError {
            status: StatusCode::BAD_REQUEST,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }

    fn not_found(what: &str) -> ServiceError {
        ServiceError { status: StatusCode::NOT_FOUND, ..Self::error(format!("{what} not found")) }
    }

    /// Validation maps to 400, illegal transitions to 409, anything else to 500.
    fn failure(err: &anyhow::Error) -> ServiceError {
        let status = match err.downcast_ref::<TeamError>() {
            Some(TeamError::Validation(_)) => StatusCode::BAD_REQUEST,
            Some(TeamError::InvalidState(_)) => StatusCode::CONFLICT,
            None => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %format!("{err:#}"), "request failed");
        }
        ServiceError { status, ..Self::error(format!("{err:#}")) }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

type Reply<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

fn reply<T: Serialize>(result: Result<T>) -> Reply<T> {
    result.map(|data| Json(envelope(data))).map_err(|err| ServiceState::failure(&err))
}

fn found<T: Serialize>(result: Result<Option<T>>, what: &str) -> Reply<T> {
    match result {
        Ok(Some(data)) => Ok(Json(envelope(data))),
        Ok(None) => Err(ServiceState::not_found(what)),
        Err(err) => Err(ServiceState::failure(&err)),
    }
}

fn applied(result: Result<bool>) -> Reply<Applied> {
    reply(result.map(|applied| Applied { applied }))
}

fn path_id<T>(raw: &str, parse: fn(&str) -> Result<T, TeamError>) -> Result<T, ServiceError> {
    parse(raw).map_err(|err| ServiceState::error(err.to_string()))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", get(db_schema_version))
        .route("/v1/members", get(members_list).post(members_add))
        .route("/v1/members/:member_id", get(members_get))
        .route("/v1/members/:member_id/role", post(members_update_role))
        .route("/v1/members/:member_id/touch", post(members_touch))
        .route("/v1/memories", get(memories_list).post(memories_create))
        .route("/v1/memories/search", post(memories_search))
        .route("/v1/memories/:memory_id", get(memories_get))
        .route("/v1/memories/:memory_id/update", post(memories_update))
        .route("/v1/memories/:memory_id/votes", post(memories_vote))
        .route("/v1/memories/:memory_id/comments", post(memories_comment))
        .route("/v1/memories/:memory_id/usage", get(memories_usage_list).post(memories_track_usage))
        .route("/v1/memories/:memory_id/share", post(memories_share))
        .route("/v1/memories/:memory_id/revoke", post(memories_revoke))
        .route("/v1/usage", get(usage_list))
        .route("/v1/permissions/check", post(permissions_check))
        .route("/v1/permissions/explain", post(permissions_explain))
        .route("/v1/permissions/rules", get(rules_list).post(rules_create))
        .route("/v1/permissions/rules/:rule_id/update", post(rules_update))
        .route("/v1/permissions/rules/:rule_id/delete", post(rules_delete))
        .route("/v1/permissions/bulk", post(permissions_bulk))
        .route("/v1/access-requests", get(access_requests_list).post(access_requests_create))
        .route("/v1/access-requests/expire", post(access_requests_expire))
        .route("/v1/access-requests/:request_id", get(access_requests_get))
        .route("/v1/access-requests/:request_id/approve", post(access_requests_approve))
        .route("/v1/access-requests/:request_id/deny", post(access_requests_deny))
        .route("/v1/audit/logs", post(audit_logs))
        .route("/v1/audit/compliance-report", post(audit_compliance_report))
        .route("/v1/analytics", get(analytics))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = config::resolve(config::Args::parse())?;
    let api = TeamMemoryApi::open(config.engine)?;
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!(bind = %config.bind, "team memory service listening");
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Reply<HealthResponse> {
    let integrity = state.api.integrity_check().await.map_err(|err| ServiceState::failure(&err))?;
    let healthy = integrity.quick_check_ok && integrity.foreign_key_violations.is_empty();
    let status = if healthy { "ok" } else { "degraded" };
    Ok(Json(envelope(HealthResponse { status, integrity })))
}

async fn db_schema_version(State(state): State<ServiceState>) -> Reply<SchemaStatus> {
    reply(state.api.schema_status().await)
}

async fn members_add(
    State(state): State<ServiceState>,
    Json(request): Json<NewMember>,
) -> Reply<TeamMember> {
    reply(state.api.add_member(request).await)
}

async fn members_list(State(state): State<ServiceState>) -> Reply<Vec<TeamMember>> {
    reply(state.api.list_members().await)
}

async fn members_get(
    State(state): State<ServiceState>,
    Path(member_id): Path<String>,
) -> Reply<TeamMember> {
    let member_id = path_id(&member_id, MemberId::parse)?;
    found(state.api.get_member(member_id).await, "member")
}

async fn members_update_role(
    State(state): State<ServiceState>,
    Path(member_id): Path<String>,
    Json(request): Json<UpdateRoleRequest>,
) -> Reply<Applied> {
    let member_id = path_id(&member_id, MemberId::parse)?;
    applied(
        state
            .api
            .update_member_role(member_id, request.role, request.permissions, request.updated_by)
            .await,
    )
}

async fn members_touch(
    State(state): State<ServiceState>,
    Path(member_id): Path<String>,
) -> Reply<Applied> {
    let member_id = path_id(&member_id, MemberId::parse)?;
    applied(state.api.touch_member(member_id).await)
}

async fn memories_create(
    State(state): State<ServiceState>,
    Json(request): Json<NewMemory>,
) -> Reply<Created<MemoryId>> {
    found(state.api.create_memory(request).await.map(|id| id.map(|id| Created { id })), "creator")
}

async fn memories_list(
    State(state): State<ServiceState>,
    Query(filter): Query<MemoryFilter>,
) -> Reply<Vec<TeamMemory>> {
    reply(state.api.list_memories(filter).await)
}

async fn memories_get(
    State(state): State<ServiceState>,
    Path(memory_id): Path<String>,
) -> Reply<TeamMemory> {
    let memory_id = path_id(&memory_id, MemoryId::parse)?;
    found(state.api.get_memory(memory_id).await, "memory")
}

async fn memories_search(
    State(state): State<ServiceState>,
    Json(request): Json<SearchRequest>,
) -> Reply<Vec<TeamMemory>> {
    reply(state.api.search_memories(&request.query, request.member_id).await)
}

async fn memories_update(
    State(state): State<ServiceState>,
    Path(memory_id): Path<String>,
    Json(request): Json<UpdateMemoryRequest>,
) -> Reply<Applied> {
    let memory_id = path_id(&memory_id, MemoryId::parse)?;
    applied(state.api.update_memory(memory_id, request.editor_id, request.update).await)
}

async fn memories_vote(
    State(state): State<ServiceState>,
    Path(memory_id): Path<String>,
    Json(request): Json<VoteRequest>,
) -> Reply<VoteTally> {
    let memory_id = path_id(&memory_id, MemoryId::parse)?;
    let vote = request
        .vote
        .parse::<VoteKind>()
        .map_err(|err| ServiceState::failure(&anyhow::Error::from(err)))?;
    found(state.api.vote_on_memory(memory_id, request.member_id, vote).await, "memory or member")
}

async fn memories_comment(
    State(state): State<ServiceState>,
    Path(memory_id): Path<String>,
    Json(request): Json<CommentRequest>,
) -> Reply<Created<CommentId>> {
    let memory_id = path_id(&memory_id, MemoryId::parse)?;
    let created = state
        .api
        .add_comment(memory_id, request.member_id, &request.content, request.parent_comment_id)
        .await;
    found(created.map(|id| id.map(|id| Created { id })), "memory, member, or parent comment")
}

async fn memories_track_usage(
    State(state): State<ServiceState>,
    Path(memory_id): Path<String>,
    Json(request): Json<UsageRequest>,
) -> Reply<Applied> {
    let memory_id = path_id(&memory_id, MemoryId::parse)?;
    applied(
        state.api.track_usage(memory_id, request.used_by, &request.context, request.success).await,
    )
}

async fn memories_usage_list(
    State(state): State<ServiceState>,
    Path(memory_id): Path<String>,
) -> Reply<Vec<UsageEvent>> {
    let memory_id = path_id(&memory_id, MemoryId::parse)?;
    reply(state.api.list_usage_events(Some(memory_id)).await)
}

async fn usage_list(State(state): State<ServiceState>) -> Reply<Vec<UsageEvent>> {
    reply(state.api.list_usage_events(None).await)
}

async fn memories_share(
    State(state): State<ServiceState>,
    Path(memory_id): Path<String>,
    Json(request): Json<ShareRequest>,
) -> Reply<Applied> {
    let memory_id = path_id(&memory_id, MemoryId::parse)?;
    let share = ShareMemoryRequest {
        memory_id,
        shared_by: request.shared_by,
        shared_with: request.shared_with,
        permissions: request.permissions,
        message: request.message,
    };
    applied(state.api.share_memory(share).await)
}

async fn memories_revoke(
    State(state): State<ServiceState>,
    Path(memory_id): Path<String>,
    Json(request): Json<RevokeRequest>,
) -> Reply<Applied> {
    let memory_id = path_id(&memory_id, MemoryId::parse)?;
    applied(
        state.api.revoke_memory_access(memory_id, request.revoked_by, request.revoked_from).await,
    )
}

async fn permissions_check(
    State(state): State<ServiceState>,
    Json(query): Json<PermissionQuery>,
) -> Reply<PermissionCheck> {
    reply(state.api.check_permission(query).await.map(|granted| PermissionCheck { granted }))
}

async fn permissions_explain(
    State(state): State<ServiceState>,
    Json(query): Json<PermissionQuery>,
) -> Reply<PermissionDecision> {
    reply(state.api.explain_permission(query).await)
}

async fn rules_create(
    State(state): State<ServiceState>,
    Json(request): Json<CreateRuleRequest>,
) -> Reply<PermissionRule> {
    reply(state.api.create_permission_rule(request.rule, request.created_by).await)
}

async fn rules_list(
    State(state): State<ServiceState>,
    Query(filter): Query<RuleFilter>,
) -> Json<ServiceEnvelope<Vec<PermissionRule>>> {
    Json(envelope(state.api.get_permission_rules(filter).await))
}

async fn rules_update(
    State(state): State<ServiceState>,
    Path(rule_id): Path<String>,
    Json(request): Json<UpdateRuleRequest>,
) -> Reply<Applied> {
    let rule_id = path_id(&rule_id, RuleId::parse)?;
    applied(state.api.update_permission_rule(rule_id, request.update, request.updated_by).await)
}

async fn rules_delete(
    State(state): State<ServiceState>,
    Path(rule_id): Path<String>,
    Json(request): Json<DeleteRuleRequest>,
) -> Reply<Applied> {
    let rule_id = path_id(&rule_id, RuleId::parse)?;
    applied(state.api.delete_permission_rule(rule_id, request.deleted_by).await)
}

async fn permissions_bulk(
    State(state): State<ServiceState>,
    Json(request): Json<BulkRequest>,
) -> Reply<Vec<PermissionRule>> {
    reply(state.api.bulk_update_permissions(request.updates, request.updated_by).await)
}

async fn access_requests_create(
    State(state): State<ServiceState>,
    Json(request): Json<NewAccessRequest>,
) -> Reply<Created<AccessRequestId>> {
    let created = state.api.create_access_request(request).await;
    found(created.map(|id| id.map(|id| Created { id })), "requester")
}

async fn access_requests_list(
    State(state): State<ServiceState>,
    Query(filter): Query<AccessRequestFilter>,
) -> Json<ServiceEnvelope<Vec<AccessRequest>>> {
    Json(envelope(state.api.get_access_requests(filter).await))
}

async fn access_requests_get(
    State(state): State<ServiceState>,
    Path(request_id): Path<String>,
) -> Reply<AccessRequest> {
    let request_id = path_id(&request_id, AccessRequestId::parse)?;
    found(Ok(state.api.get_access_request(request_id).await), "access request")
}

async fn access_requests_approve(
    State(state): State<ServiceState>,
    Path(request_id): Path<String>,
    Json(request): Json<ApproveRequest>,
) -> Reply<Applied> {
    let request_id = path_id(&request_id, AccessRequestId::parse)?;
    applied(state.api.approve_access_request(request_id, request.approver_id).await)
}

async fn access_requests_deny(
    State(state): State<ServiceState>,
    Path(request_id): Path<String>,
    Json(request): Json<DenyRequest>,
) -> Reply<Applied> {
    let request_id = path_id(&request_id, AccessRequestId::parse)?;
    applied(state.api.deny_access_request(request_id, request.denier_id, &request.reason).await)
}

async fn access_requests_expire(
    State(state): State<ServiceState>,
    Json(request): Json<ExpireRequest>,
) -> Reply<Expired> {
    reply(state.api.expire_access_requests(request.as_of).await.map(|expired| Expired { expired }))
}

async fn audit_logs(
    State(state): State<ServiceState>,
    Json(filter): Json<AuditFilter>,
) -> Reply<Vec<AuditLog>> {
    reply(state.api.get_audit_logs(filter).await)
}

async fn audit_compliance_report(
    State(state): State<ServiceState>,
    Json(request): Json<ReportRequest>,
) -> Reply<ComplianceReport> {
    if request.end < request.start {
        return Err(ServiceState::error("report end MUST NOT precede start"));
    }
    reply(state.api.generate_compliance_report(request.start, request.end).await)
}

async fn analytics(State(state): State<ServiceState>) -> Reply<TeamAnalytics> {
    reply(state.api.get_team_analytics().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use team_memory_api::EngineConfig;
    use tower::ServiceExt;

    fn router() -> Router {
        let api = match TeamMemoryApi::open(EngineConfig::new(":memory:", "service-test")) {
            Ok(api) => api,
            Err(err) => panic!("failed to open engine: {err:#}"),
        };
        app(ServiceState { api })
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn call(
        router: &Router,
        method: &str,
        uri: &str,
        payload: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().uri(uri).method(method);
        let request = match payload {
            Some(payload) => builder
                .header("content-type", "application/json")
                .body(axum::body::Body::from(payload.to_string())),
            None => builder.body(axum::body::Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build {method} {uri}: {err}"));

        let response = match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("{method} {uri} failed: {err}"),
        };
        let status = response.status();
        (status, response_json(response).await)
    }

    fn data_str<'a>(value: &'a serde_json::Value, field: &str) -> &'a str {
        value
            .get("data")
            .and_then(|data| data.get(field))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing data.{field} in response: {value}"))
    }

    async fn add_member(router: &Router, name: &str, role: &str) -> String {
        let (status, value) = call(
            router,
            "POST",
            "/v1/members",
            Some(serde_json::json!({
                "email": format!("{name}@example.com"),
                "name": name,
                "role": role
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "add member failed: {value}");
        data_str(&value, "id").to_string()
    }

    async fn add_memory(router: &Router, owner: &str, visibility: &str) -> String {
        let (status, value) = call(
            router,
            "POST",
            "/v1/memories",
            Some(serde_json::json!({
                "memory_type": "architectural_decision",
                "title": "Use event sourcing for billing",
                "content": "Ledger entries are append-only.",
                "context": "billing",
                "created_by": owner,
                "tags": ["billing"],
                "visibility": visibility
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "add memory failed: {value}");
        data_str(&value, "id").to_string()
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok_with_integrity() {
        let (status, value) = call(&router(), "GET", "/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(data_str(&value, "status"), "ok");
        assert_eq!(
            value
                .get("data")
                .and_then(|data| data.get("integrity"))
                .and_then(|integrity| integrity.get("quick_check_ok"))
                .and_then(serde_json::Value::as_bool),
            Some(true)
        );
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn observer_permission_flow_over_http() {
        let router = router();
        let author = add_member(&router, "ada", "developer").await;
        let observer = add_member(&router, "bo", "observer").await;
        let memory_id = add_memory(&router, &author, "team_only").await;

        let check = |action: &str| {
            serde_json::json!({
                "actor_id": observer,
                "action": action,
                "resource_type": "memory",
                "resource_id": memory_id
            })
        };
        let (status, value) =
            call(&router, "POST", "/v1/permissions/check", Some(check("write"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value.pointer("/data/granted"), Some(&serde_json::Value::Bool(false)));

        let (status, value) =
            call(&router, "POST", "/v1/permissions/explain", Some(check("read"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value.pointer("/data/granted"), Some(&serde_json::Value::Bool(true)));
        assert_eq!(data_str(&value, "source"), "resource_visibility");

        let (status, value) = call(
            &router,
            "POST",
            "/v1/audit/logs",
            Some(serde_json::json!({ "action": "permission_check" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            value.pointer("/data").and_then(serde_json::Value::as_array).map(Vec::len),
            Some(2)
        );
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn unrecognized_vote_is_a_conflict_and_leaves_score_untouched() {
        let router = router();
        let author = add_member(&router, "ada", "developer").await;
        let voter = add_member(&router, "bo", "observer").await;
        let memory_id = add_memory(&router, &author, "public").await;
        let votes_uri = format!("/v1/memories/{memory_id}/votes");

        let (status, value) = call(
            &router,
            "POST",
            &votes_uri,
            Some(serde_json::json!({ "member_id": voter, "vote": "sideways" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT, "unexpected response: {value}");

        let (status, value) = call(
            &router,
            "POST",
            &votes_uri,
            Some(serde_json::json!({ "member_id": voter, "vote": "downvote" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value.pointer("/data/downvotes").and_then(serde_json::Value::as_u64), Some(1));

        let (status, value) =
            call(&router, "GET", &format!("/v1/memories/{memory_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            value.pointer("/data/success_score").and_then(serde_json::Value::as_f64),
            Some(0.0)
        );
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn access_request_denial_round_trip() {
        let router = router();
        let author = add_member(&router, "ada", "developer").await;
        let admin = add_member(&router, "root", "admin").await;
        let requester = add_member(&router, "cy", "observer").await;
        let memory_id = add_memory(&router, &author, "team_only").await;

        let (status, value) = call(
            &router,
            "POST",
            "/v1/access-requests",
            Some(serde_json::json!({
                "requester_id": requester,
                "resource_type": "memory",
                "resource_id": memory_id,
                "requested_permissions": [{ "action": "write", "granted": true }],
                "justification": "need to fix a typo"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "create request failed: {value}");
        let request_id = data_str(&value, "id").to_string();

        let (status, value) = call(
            &router,
            "POST",
            &format!("/v1/access-requests/{request_id}/deny"),
            Some(serde_json::json!({ "denier_id": admin, "reason": "insufficient trust" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value.pointer("/data/applied"), Some(&serde_json::Value::Bool(true)));

        let listing = format!("/v1/access-requests?requester_id={requester}");
        let (status, value) = call(&router, "GET", &listing, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            value.pointer("/data/0/status").and_then(serde_json::Value::as_str),
            Some("denied")
        );
        assert_eq!(
            value.pointer("/data/0/deny_reason").and_then(serde_json::Value::as_str),
            Some("insufficient trust")
        );
    }

    #[tokio::test]
    async fn missing_and_malformed_ids_map_to_client_errors() {
        let router = router();
        let (status, _) =
            call(&router, "GET", &format!("/v1/members/{}", MemberId::new()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, value) = call(&router, "GET", "/v1/memories/not-a-ulid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(value.get("error").and_then(serde_json::Value::as_str).is_some());

        let (status, _) = call(
            &router,
            "POST",
            "/v1/members",
            Some(serde_json::json!({ "email": "no-at-sign", "name": "x", "role": "developer" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
