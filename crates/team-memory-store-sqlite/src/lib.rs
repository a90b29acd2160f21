use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use team_memory_core::{
    AccessRequest, AccessRequestId, AccessRequestStatus, AuditFilter, AuditLog, AuditLogId,
    CommentId,
    MemberId, MemoryComment, MemoryFilter, MemoryId, MemoryType, MemoryVote, PermissionRule,
    ResourceType, Role, RuleId, SubjectType, TeamMember, TeamMemory, TeamPermissions, UsageEvent,
    UsageId, Visibility, VoteKind, VoteTally,
};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS team_members (
  member_id TEXT PRIMARY KEY,
  team_id TEXT NOT NULL,
  email TEXT NOT NULL,
  name TEXT NOT NULL,
  role TEXT NOT NULL CHECK (role IN ('admin','developer','observer')),
  joined_at TEXT NOT NULL,
  last_active TEXT NOT NULL,
  permissions_json TEXT NOT NULL,
  UNIQUE(team_id, email)
);

CREATE TABLE IF NOT EXISTS team_memories (
  memory_id TEXT PRIMARY KEY,
  team_id TEXT NOT NULL,
  memory_type TEXT NOT NULL CHECK (memory_type IN (
    'architectural_decision','code_pattern','conversation','best_practice','lesson_learned'
  )),
  title TEXT NOT NULL,
  content TEXT NOT NULL,
  context TEXT NOT NULL,
  created_by TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  tags_json TEXT NOT NULL,
  visibility TEXT NOT NULL CHECK (visibility IN ('public','private','team_only')),
  project_id TEXT,
  metadata_json TEXT NOT NULL,
  usage_count INTEGER NOT NULL DEFAULT 0 CHECK (usage_count >= 0),
  upvotes INTEGER NOT NULL DEFAULT 0 CHECK (upvotes >= 0),
  downvotes INTEGER NOT NULL DEFAULT 0 CHECK (downvotes >= 0),
  success_score REAL NOT NULL DEFAULT 0.5 CHECK (success_score >= 0.0 AND success_score <= 1.0),
  FOREIGN KEY (created_by) REFERENCES team_members(member_id)
);

CREATE TABLE IF NOT EXISTS memory_votes (
  memory_id TEXT NOT NULL,
  member_id TEXT NOT NULL,
  vote TEXT NOT NULL CHECK (vote IN ('upvote','downvote')),
  voted_at TEXT NOT NULL,
  PRIMARY KEY (memory_id, member_id),
  FOREIGN KEY (memory_id) REFERENCES team_memories(memory_id),
  FOREIGN KEY (member_id) REFERENCES team_members(member_id)
);

CREATE TABLE IF NOT EXISTS memory_comments (
  comment_id TEXT PRIMARY KEY,
  memory_id TEXT NOT NULL,
  member_id TEXT NOT NULL,
  content TEXT NOT NULL,
  created_at TEXT NOT NULL,
  parent_comment_id TEXT,
  FOREIGN KEY (memory_id) REFERENCES team_memories(memory_id),
  FOREIGN KEY (member_id) REFERENCES team_members(member_id),
  FOREIGN KEY (parent_comment_id) REFERENCES memory_comments(comment_id)
);

CREATE TABLE IF NOT EXISTS memory_usage (
  usage_id TEXT PRIMARY KEY,
  memory_id TEXT NOT NULL,
  used_by TEXT NOT NULL,
  used_at TEXT NOT NULL,
  context TEXT NOT NULL,
  success INTEGER NOT NULL CHECK (success IN (0, 1)),
  FOREIGN KEY (memory_id) REFERENCES team_memories(memory_id),
  FOREIGN KEY (used_by) REFERENCES team_members(member_id)
);

CREATE TABLE IF NOT EXISTS permission_rules (
  rule_id TEXT PRIMARY KEY,
  team_id TEXT NOT NULL,
  sequence INTEGER NOT NULL,
  resource_type TEXT NOT NULL CHECK (resource_type IN ('memory','project','team','dashboard')),
  resource_id TEXT,
  subject_type TEXT NOT NULL CHECK (subject_type IN ('user','role','team')),
  subject_id TEXT NOT NULL,
  permissions_json TEXT NOT NULL,
  conditions_json TEXT NOT NULL,
  created_by TEXT NOT NULL,
  created_at TEXT NOT NULL,
  expires_at TEXT,
  is_active INTEGER NOT NULL CHECK (is_active IN (0, 1)),
  UNIQUE(team_id, sequence)
);

CREATE TABLE IF NOT EXISTS access_requests (
  request_id TEXT PRIMARY KEY,
  team_id TEXT NOT NULL,
  requester_id TEXT NOT NULL,
  requester_name TEXT NOT NULL,
  resource_type TEXT NOT NULL CHECK (resource_type IN ('memory','project','team','dashboard')),
  resource_id TEXT NOT NULL,
  resource_name TEXT NOT NULL,
  permissions_json TEXT NOT NULL,
  justification TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending','approved','denied','expired')),
  approvers_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  approved_at TEXT,
  approved_by TEXT,
  denied_by TEXT,
  deny_reason TEXT,
  expires_at TEXT
);

CREATE TABLE IF NOT EXISTS audit_logs (
  audit_id TEXT PRIMARY KEY,
  team_id TEXT NOT NULL,
  actor_id TEXT NOT NULL,
  actor_name TEXT NOT NULL,
  action TEXT NOT NULL,
  resource_type TEXT NOT NULL,
  resource_id TEXT NOT NULL,
  resource_name TEXT NOT NULL,
  logged_at TEXT NOT NULL,
  success INTEGER NOT NULL CHECK (success IN (0, 1)),
  error_message TEXT,
  metadata_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_team_members_team ON team_members(team_id);
CREATE INDEX IF NOT EXISTS idx_team_memories_team ON team_memories(team_id, created_at);
CREATE INDEX IF NOT EXISTS idx_memory_comments_memory ON memory_comments(memory_id);
CREATE INDEX IF NOT EXISTS idx_memory_usage_memory ON memory_usage(memory_id);
CREATE INDEX IF NOT EXISTS idx_access_requests_team ON access_requests(team_id, created_at);
CREATE INDEX IF NOT EXISTS idx_audit_logs_team ON audit_logs(team_id);
";

const MEMBER_COLUMNS: &str =
    "member_id, team_id, email, name, role, joined_at, last_active, permissions_json";

const MEMORY_COLUMNS: &str = "memory_id, memory_type, title, content, context, created_by,
    created_at, updated_at, tags_json, visibility, project_id, metadata_json,
    usage_count, upvotes, downvotes, success_score";

const RULE_COLUMNS: &str = "rule_id, sequence, resource_type, resource_id, subject_type,
    subject_id, permissions_json, conditions_json, created_by, created_at, expires_at, is_active";

const REQUEST_COLUMNS: &str = "request_id, requester_id, requester_name, resource_type,
    resource_id, resource_name, permissions_json, justification, status, approvers_json,
    created_at, updated_at, approved_at, approved_by, denied_by, deny_reason, expires_at";

const AUDIT_COLUMNS: &str = "audit_id, actor_id, actor_name, action, resource_type, resource_id,
    resource_name, logged_at, success, error_message, metadata_json";

/// Durable, team-scoped storage for members, memories, and the permission engine state.
pub struct SqliteStore {
    conn: Connection,
    team_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed team store and configure required runtime pragmas.
    ///
    /// Every read and write is scoped to `team_id`.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path, team_id: &str) -> Result<Self> {
        if team_id.trim().is_empty() {
            return Err(anyhow!("team id MUST be provided"));
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        // SQLite's lower() and LIKE only fold ASCII.
        conn.create_scalar_function(
            "unicode_lower",
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| Ok(ctx.get::<Option<String>>(0)?.map(|value| value.to_lowercase())),
        )
        .context("failed to register unicode_lower")?;

        Ok(Self { conn, team_id: team_id.to_string() })
    }

    #[must_use]
    pub fn team_id(&self) -> &str {
        &self.team_id
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version == 0 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            tracing::info!(version = 1, "applied team memory schema migration");
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    /// # Errors
    /// Returns an error when the insert fails, including a duplicate email within the team.
    pub fn insert_member(&self, member: &TeamMember) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO team_members(
                    member_id, team_id, email, name, role, joined_at, last_active, permissions_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    member.id.to_string(),
                    self.team_id,
                    member.email,
                    member.name,
                    member.role.as_str(),
                    rfc3339(member.joined_at)?,
                    rfc3339(member.last_active)?,
                    to_json(&member.permissions, "member permissions")?,
                ],
            )
            .context("failed to insert team member")?;
        Ok(())
    }

    /// Members of this team, earliest joiner first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_members(&self) -> Result<Vec<TeamMember>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MEMBER_COLUMNS} FROM team_members WHERE team_id = ?1
             ORDER BY joined_at ASC, member_id ASC"
        ))?;
        let mut rows = stmt.query(params![self.team_id])?;
        let mut members = Vec::new();
        while let Some(row) = rows.next()? {
            members.push(decode_member(row)?);
        }
        members.sort_by(|left, right| {
            left.joined_at.cmp(&right.joined_at).then(left.id.cmp(&right.id))
        });
        Ok(members)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_member(&self, member_id: MemberId) -> Result<Option<TeamMember>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MEMBER_COLUMNS} FROM team_members WHERE team_id = ?1 AND member_id = ?2"
        ))?;
        let mut rows = stmt.query(params![self.team_id, member_id.to_string()])?;
        let member = rows.next()?.map(decode_member).transpose()?;
        Ok(member)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn find_member_by_email(&self, email: &str) -> Result<Option<TeamMember>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MEMBER_COLUMNS} FROM team_members WHERE team_id = ?1 AND email = ?2"
        ))?;
        let mut rows = stmt.query(params![self.team_id, email])?;
        let member = rows.next()?.map(decode_member).transpose()?;
        Ok(member)
    }

    /// Returns `false` when no member with this id exists in the team.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn update_member_role(
        &self,
        member_id: MemberId,
        role: Role,
        permissions: &TeamPermissions,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE team_members SET role = ?1, permissions_json = ?2
                 WHERE team_id = ?3 AND member_id = ?4",
                params![
                    role.as_str(),
                    to_json(permissions, "member permissions")?,
                    self.team_id,
                    member_id.to_string(),
                ],
            )
            .context("failed to update member role")?;
        Ok(changed > 0)
    }

    /// # Errors
    /// Returns an error when the update fails.
    pub fn touch_member(&self, member_id: MemberId, at: OffsetDateTime) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE team_members SET last_active = ?1 WHERE team_id = ?2 AND member_id = ?3",
                params![rfc3339(at)?, self.team_id, member_id.to_string()],
            )
            .context("failed to refresh member last_active")?;
        Ok(changed > 0)
    }

    /// Persist a freshly created memory. Votes and comments are written separately.
    ///
    /// # Errors
    /// Returns an error when validation or the insert fails.
    pub fn insert_memory(&self, memory: &TeamMemory) -> Result<()> {
        memory.validate().map_err(|err| anyhow!("memory validation failed: {err}"))?;

        self.conn
            .execute(
                &format!(
                    "INSERT INTO team_memories(team_id, {MEMORY_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                             ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
                ),
                params![
                    self.team_id,
                    memory.id.to_string(),
                    memory.memory_type.as_str(),
                    memory.title,
                    memory.content,
                    memory.context,
                    memory.created_by.to_string(),
                    rfc3339(memory.created_at)?,
                    rfc3339(memory.updated_at)?,
                    to_json(&memory.tags, "tags")?,
                    memory.visibility.as_str(),
                    memory.project_id,
                    to_json(&memory.metadata, "memory metadata")?,
                    i64::try_from(memory.usage_count).context("usage_count out of range")?,
                    i64::from(memory.upvotes),
                    i64::from(memory.downvotes),
                    memory.success_score,
                ],
            )
            .context("failed to insert team memory")?;
        Ok(())
    }

    /// Write the editable fields of an existing memory. Counters are left alone.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn update_memory(&self, memory: &TeamMemory) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE team_memories SET
                    title = ?1, content = ?2, context = ?3, tags_json = ?4,
                    visibility = ?5, metadata_json = ?6, updated_at = ?7
                 WHERE team_id = ?8 AND memory_id = ?9",
                params![
                    memory.title,
                    memory.content,
                    memory.context,
                    to_json(&memory.tags, "tags")?,
                    memory.visibility.as_str(),
                    to_json(&memory.metadata, "memory metadata")?,
                    rfc3339(memory.updated_at)?,
                    self.team_id,
                    memory.id.to_string(),
                ],
            )
            .context("failed to update team memory")?;
        Ok(changed > 0)
    }

    /// Load one memory with its votes and comments.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn get_memory(&self, memory_id: MemoryId) -> Result<Option<TeamMemory>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM team_memories WHERE team_id = ?1 AND memory_id = ?2"
        ))?;
        let mut rows = stmt.query(params![self.team_id, memory_id.to_string()])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let memory = decode_memory(row)?;
        Ok(Some(self.hydrate(memory)?))
    }

    /// Memories matching `filter`, newest first, with votes and comments loaded.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_memories(&self, filter: &MemoryFilter) -> Result<Vec<TeamMemory>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM team_memories
             WHERE team_id = ?1
               AND (?2 IS NULL OR memory_type = ?2)
               AND (?3 IS NULL OR created_by = ?3)
               AND (?4 IS NULL OR project_id = ?4)
               AND (?5 IS NULL OR visibility = ?5)
             ORDER BY created_at DESC, memory_id DESC"
        ))?;
        let mut rows = stmt.query(params![
            self.team_id,
            filter.memory_type.map(MemoryType::as_str),
            filter.created_by.map(|id| id.to_string()),
            filter.project_id,
            filter.visibility.map(Visibility::as_str),
        ])?;

        let mut memories = Vec::new();
        while let Some(row) = rows.next()? {
            memories.push(self.hydrate(decode_memory(row)?)?);
        }
        memories.sort_by(|left, right| {
            right.created_at.cmp(&left.created_at).then(right.id.cmp(&left.id))
        });
        Ok(memories)
    }

    /// Substring match of one term over title, content, and context.
    ///
    /// Only public and team-only memories, plus private memories owned by
    /// `viewer`, are candidates. At most `limit` rows are returned.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn search_memories_for_term(
        &self,
        term: &str,
        viewer: Option<MemberId>,
        limit: usize,
    ) -> Result<Vec<TeamMemory>> {
        let pattern = format!("%{}%", escape_like(&term.to_lowercase()));
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM team_memories
             WHERE team_id = ?1
               AND (unicode_lower(title) LIKE ?2 ESCAPE '\\'
                    OR unicode_lower(content) LIKE ?2 ESCAPE '\\'
                    OR unicode_lower(context) LIKE ?2 ESCAPE '\\')
               AND (visibility IN ('public', 'team_only')
                    OR (visibility = 'private' AND created_by = ?3))
             ORDER BY usage_count DESC, success_score DESC, created_at DESC
             LIMIT ?4"
        ))?;
        let mut rows = stmt.query(params![
            self.team_id,
            pattern,
            viewer.map(|id| id.to_string()),
            i64::try_from(limit).context("search limit out of range")?,
        ])?;

        let mut memories = Vec::new();
        while let Some(row) = rows.next()? {
            memories.push(self.hydrate(decode_memory(row)?)?);
        }
        Ok(memories)
    }

    /// Insert or replace one member's vote and update the memory's counters in a
    /// single transaction.
    ///
    /// Returns `None` when the memory does not exist in this team.
    ///
    /// # Errors
    /// Returns an error when the transaction fails or a stored vote is unrecognized.
    pub fn upsert_vote(&mut self, vote: &MemoryVote) -> Result<Option<VoteTally>> {
        let tx = self.conn.transaction().context("failed to start vote transaction")?;

        let counters = tx
            .query_row(
                "SELECT upvotes, downvotes FROM team_memories
                 WHERE team_id = ?1 AND memory_id = ?2",
                params![self.team_id, vote.memory_id.to_string()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
            .context("failed to read vote counters")?;
        let Some((upvotes, downvotes)) = counters else {
            return Ok(None);
        };

        let previous = tx
            .query_row(
                "SELECT vote FROM memory_votes WHERE memory_id = ?1 AND member_id = ?2",
                params![vote.memory_id.to_string(), vote.member_id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to read previous vote")?
            .map(|raw| raw.parse::<VoteKind>())
            .transpose()?;

        let mut tally = VoteTally {
            upvotes: u32::try_from(upvotes).context("upvotes out of range")?,
            downvotes: u32::try_from(downvotes).context("downvotes out of range")?,
        };
        tally.apply(previous, vote.vote);

        tx.execute(
            "INSERT INTO memory_votes(memory_id, member_id, vote, voted_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(memory_id, member_id)
             DO UPDATE SET vote = excluded.vote, voted_at = excluded.voted_at",
            params![
                vote.memory_id.to_string(),
                vote.member_id.to_string(),
                vote.vote.as_str(),
                rfc3339(vote.timestamp)?,
            ],
        )
        .context("failed to upsert memory vote")?;

        tx.execute(
            "UPDATE team_memories SET upvotes = ?1, downvotes = ?2, success_score = ?3
             WHERE team_id = ?4 AND memory_id = ?5",
            params![
                i64::from(tally.upvotes),
                i64::from(tally.downvotes),
                tally.success_score(),
                self.team_id,
                vote.memory_id.to_string(),
            ],
        )
        .context("failed to update vote counters")?;

        tx.commit().context("failed to commit vote transaction")?;
        Ok(Some(tally))
    }

    /// # Errors
    /// Returns an error when the insert fails, including an unknown parent comment.
    pub fn insert_comment(&self, comment: &MemoryComment) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO memory_comments(
                    comment_id, memory_id, member_id, content, created_at, parent_comment_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    comment.id.to_string(),
                    comment.memory_id.to_string(),
                    comment.member_id.to_string(),
                    comment.content,
                    rfc3339(comment.timestamp)?,
                    comment.parent_comment_id.map(|id| id.to_string()),
                ],
            )
            .context("failed to insert memory comment")?;
        Ok(())
    }

    /// Append a usage event and bump the memory's usage counter atomically.
    ///
    /// Returns `false` when the memory does not exist in this team.
    ///
    /// # Errors
    /// Returns an error when the transaction fails.
    pub fn record_usage(&mut self, event: &UsageEvent) -> Result<bool> {
        let tx = self.conn.transaction().context("failed to start usage transaction")?;

        let changed = tx
            .execute(
                "UPDATE team_memories SET usage_count = usage_count + 1
                 WHERE team_id = ?1 AND memory_id = ?2",
                params![self.team_id, event.memory_id.to_string()],
            )
            .context("failed to increment usage_count")?;
        if changed == 0 {
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO memory_usage(usage_id, memory_id, used_by, used_at, context, success)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id.to_string(),
                event.memory_id.to_string(),
                event.used_by.to_string(),
                rfc3339(event.used_at)?,
                event.context,
                event.success,
            ],
        )
        .context("failed to insert usage event")?;

        tx.commit().context("failed to commit usage transaction")?;
        Ok(true)
    }

    /// Usage events for the team, or for one memory, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_usage_events(&self, memory_id: Option<MemoryId>) -> Result<Vec<UsageEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT u.usage_id, u.memory_id, u.used_by, u.used_at, u.context, u.success
             FROM memory_usage u
             JOIN team_memories m ON m.memory_id = u.memory_id
             WHERE m.team_id = ?1 AND (?2 IS NULL OR u.memory_id = ?2)
             ORDER BY u.used_at ASC, u.usage_id ASC",
        )?;
        let mut rows = stmt.query(params![self.team_id, memory_id.map(|id| id.to_string())])?;

        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            events.push(UsageEvent {
                id: UsageId(parse_ulid(&row.get::<_, String>(0)?)?),
                memory_id: MemoryId(parse_ulid(&row.get::<_, String>(1)?)?),
                used_by: MemberId(parse_ulid(&row.get::<_, String>(2)?)?),
                used_at: parse_rfc3339(&row.get::<_, String>(3)?)?,
                context: row.get(4)?,
                success: row.get(5)?,
            });
        }
        events.sort_by(|left, right| left.used_at.cmp(&right.used_at).then(left.id.cmp(&right.id)));
        Ok(events)
    }

    /// Next free rule sequence number for this team.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn next_rule_sequence(&self) -> Result<i64> {
        let sequence = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM permission_rules WHERE team_id = ?1",
                params![self.team_id],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to read next rule sequence")?;
        Ok(sequence)
    }

    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn insert_rule(&self, rule: &PermissionRule) -> Result<()> {
        insert_rule_row(&self.conn, &self.team_id, rule)
    }

    /// Insert a batch of rules in one transaction. Either every rule is written or none is.
    ///
    /// # Errors
    /// Returns an error when serialization or any insert fails; the batch is rolled back.
    pub fn insert_rules(&mut self, rules: &[PermissionRule]) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start rule batch transaction")?;
        for rule in rules {
            insert_rule_row(&tx, &self.team_id, rule)?;
        }
        tx.commit().context("failed to commit rule batch")?;
        Ok(())
    }

    /// Write the mutable fields of a rule: permissions, conditions, expiry, and the active flag.
    ///
    /// # Errors
    /// Returns an error when serialization or the update fails.
    pub fn update_rule(&self, rule: &PermissionRule) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE permission_rules SET
                    permissions_json = ?1, conditions_json = ?2, expires_at = ?3, is_active = ?4
                 WHERE team_id = ?5 AND rule_id = ?6",
                params![
                    to_json(&rule.permissions, "rule permissions")?,
                    to_json(&rule.conditions, "rule conditions")?,
                    rule.expires_at.map(rfc3339).transpose()?,
                    rule.is_active,
                    self.team_id,
                    rule.id.to_string(),
                ],
            )
            .context("failed to update permission rule")?;
        Ok(changed > 0)
    }

    /// All rules of the team, tombstoned ones included, in sequence order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_rules(&self) -> Result<Vec<PermissionRule>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM permission_rules WHERE team_id = ?1 ORDER BY sequence ASC"
        ))?;
        let mut rows = stmt.query(params![self.team_id])?;
        let mut rules = Vec::new();
        while let Some(row) = rows.next()? {
            rules.push(decode_rule(row)?);
        }
        Ok(rules)
    }

    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn insert_access_request(&self, request: &AccessRequest) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO access_requests(team_id, {REQUEST_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                             ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
                ),
                params![
                    self.team_id,
                    request.id.to_string(),
                    request.requester_id.to_string(),
                    request.requester_name,
                    request.resource_type.as_str(),
                    request.resource_id,
                    request.resource_name,
                    to_json(&request.requested_permissions, "requested permissions")?,
                    request.justification,
                    request.status.as_str(),
                    to_json(&request.approvers, "approvers")?,
                    rfc3339(request.created_at)?,
                    rfc3339(request.updated_at)?,
                    request.approved_at.map(rfc3339).transpose()?,
                    request.approved_by.map(|id| id.to_string()),
                    request.denied_by.map(|id| id.to_string()),
                    request.deny_reason,
                    request.expires_at.map(rfc3339).transpose()?,
                ],
            )
            .context("failed to insert access request")?;
        Ok(())
    }

    /// Write the lifecycle fields of a request after a transition.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn update_access_request(&self, request: &AccessRequest) -> Result<bool> {
        update_access_request_row(&self.conn, &self.team_id, request)
    }

    /// Persist an approved request together with the rule it grants.
    ///
    /// Both rows land or neither does; a request that no longer exists rolls
    /// the transaction back and reports `false`.
    ///
    /// # Errors
    /// Returns an error when the transaction fails.
    pub fn commit_approval(
        &mut self,
        request: &AccessRequest,
        rule: &PermissionRule,
    ) -> Result<bool> {
        let tx = self.conn.transaction().context("failed to start approval transaction")?;
        if !update_access_request_row(&tx, &self.team_id, request)? {
            return Ok(false);
        }
        insert_rule_row(&tx, &self.team_id, rule)?;
        tx.commit().context("failed to commit approval transaction")?;
        Ok(true)
    }

    /// All access requests of the team, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_access_requests(&self) -> Result<Vec<AccessRequest>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {REQUEST_COLUMNS} FROM access_requests WHERE team_id = ?1
             ORDER BY created_at ASC, request_id ASC"
        ))?;
        let mut rows = stmt.query(params![self.team_id])?;
        let mut requests = Vec::new();
        while let Some(row) = rows.next()? {
            requests.push(decode_access_request(row)?);
        }
        requests.sort_by(|left, right| {
            left.created_at.cmp(&right.created_at).then(left.id.cmp(&right.id))
        });
        Ok(requests)
    }

    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn append_audit(&self, entry: &AuditLog) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO audit_logs(team_id, {AUDIT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    self.team_id,
                    entry.id.to_string(),
                    entry.actor_id,
                    entry.actor_name,
                    entry.action,
                    entry.resource_type,
                    entry.resource_id,
                    entry.resource_name,
                    rfc3339(entry.timestamp)?,
                    entry.success,
                    entry.error_message,
                    to_json(&entry.metadata, "audit metadata")?,
                ],
            )
            .context("failed to append audit entry")?;
        Ok(())
    }

    /// The newest `limit` audit entries, returned oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_recent_audit(&self, limit: usize) -> Result<Vec<AuditLog>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_logs WHERE team_id = ?1
             ORDER BY rowid DESC LIMIT ?2"
        ))?;
        let mut rows = stmt.query(params![
            self.team_id,
            i64::try_from(limit).context("audit limit out of range")?,
        ])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(decode_audit(row)?);
        }
        entries.reverse();
        Ok(entries)
    }

    /// Persisted audit entries matching `filter`, newest first, truncated to `filter.limit`.
    ///
    /// Actor, action, and resource type are matched in SQL. The time window is
    /// applied after decoding because stored timestamps carry variable-width
    /// fractional seconds and do not sort as text.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditLog>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_logs
             WHERE team_id = ?1
               AND (?2 IS NULL OR actor_id = ?2)
               AND (?3 IS NULL OR action = ?3)
               AND (?4 IS NULL OR resource_type = ?4)
             ORDER BY rowid DESC"
        ))?;
        let mut rows = stmt.query(params![
            self.team_id,
            filter.actor_id,
            filter.action,
            filter.resource_type
        ])?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let entry = decode_audit(row)?;
            if filter.matches(&entry) {
                entries.push(entry);
            }
        }
        entries.sort_by(|left, right| right.timestamp.cmp(&left.timestamp));
        if let Some(limit) = filter.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    fn hydrate(&self, mut memory: TeamMemory) -> Result<TeamMemory> {
        memory.votes = self.load_votes(memory.id)?;
        memory.comments = self.load_comments(memory.id)?;
        Ok(memory)
    }

    fn load_votes(&self, memory_id: MemoryId) -> Result<Vec<MemoryVote>> {
        let mut stmt = self.conn.prepare(
            "SELECT member_id, vote, voted_at FROM memory_votes
             WHERE memory_id = ?1 ORDER BY voted_at ASC, member_id ASC",
        )?;
        let mut rows = stmt.query(params![memory_id.to_string()])?;
        let mut votes = Vec::new();
        while let Some(row) = rows.next()? {
            votes.push(MemoryVote {
                memory_id,
                member_id: MemberId(parse_ulid(&row.get::<_, String>(0)?)?),
                vote: row.get::<_, String>(1)?.parse::<VoteKind>()?,
                timestamp: parse_rfc3339(&row.get::<_, String>(2)?)?,
            });
        }
        Ok(votes)
    }

    fn load_comments(&self, memory_id: MemoryId) -> Result<Vec<MemoryComment>> {
        let mut stmt = self.conn.prepare(
            "SELECT comment_id, member_id, content, created_at, parent_comment_id
             FROM memory_comments WHERE memory_id = ?1 ORDER BY created_at ASC, comment_id ASC",
        )?;
        let mut rows = stmt.query(params![memory_id.to_string()])?;
        let mut comments = Vec::new();
        while let Some(row) = rows.next()? {
            comments.push(MemoryComment {
                id: CommentId(parse_ulid(&row.get::<_, String>(0)?)?),
                memory_id,
                member_id: MemberId(parse_ulid(&row.get::<_, String>(1)?)?),
                content: row.get(2)?,
                timestamp: parse_rfc3339(&row.get::<_, String>(3)?)?,
                parent_comment_id: row
                    .get::<_, Option<String>>(4)?
                    .map(|raw| parse_ulid(&raw).map(CommentId))
                    .transpose()?,
            });
        }
        Ok(comments)
    }
}

fn insert_rule_row(conn: &Connection, team_id: &str, rule: &PermissionRule) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO permission_rules(team_id, {RULE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ),
        params![
            team_id,
            rule.id.to_string(),
            rule.sequence,
            rule.resource_type.as_str(),
            rule.resource_id,
            rule.subject_type.as_str(),
            rule.subject_id,
            to_json(&rule.permissions, "rule permissions")?,
            to_json(&rule.conditions, "rule conditions")?,
            rule.created_by.to_string(),
            rfc3339(rule.created_at)?,
            rule.expires_at.map(rfc3339).transpose()?,
            rule.is_active,
        ],
    )
    .context("failed to insert permission rule")?;
    Ok(())
}

fn update_access_request_row(
    conn: &Connection,
    team_id: &str,
    request: &AccessRequest,
) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE access_requests SET
                status = ?1, updated_at = ?2, approved_at = ?3, approved_by = ?4,
                denied_by = ?5, deny_reason = ?6
             WHERE team_id = ?7 AND request_id = ?8",
            params![
                request.status.as_str(),
                rfc3339(request.updated_at)?,
                request.approved_at.map(rfc3339).transpose()?,
                request.approved_by.map(|id| id.to_string()),
                request.denied_by.map(|id| id.to_string()),
                request.deny_reason,
                team_id,
                request.id.to_string(),
            ],
        )
        .context("failed to update access request")?;
    Ok(changed > 0)
}

fn decode_member(row: &Row<'_>) -> Result<TeamMember> {
    let role_raw: String = row.get(4)?;
    Ok(TeamMember {
        id: MemberId(parse_ulid(&row.get::<_, String>(0)?)?),
        team_id: row.get(1)?,
        email: row.get(2)?,
        name: row.get(3)?,
        role: Role::parse(&role_raw).ok_or_else(|| anyhow!("unknown role: {role_raw}"))?,
        joined_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
        last_active: parse_rfc3339(&row.get::<_, String>(6)?)?,
        permissions: from_json(&row.get::<_, String>(7)?, "member permissions")?,
    })
}

fn decode_memory(row: &Row<'_>) -> Result<TeamMemory> {
    let memory_type_raw: String = row.get(1)?;
    let visibility_raw: String = row.get(9)?;
    Ok(TeamMemory {
        id: MemoryId(parse_ulid(&row.get::<_, String>(0)?)?),
        memory_type: MemoryType::parse(&memory_type_raw)
            .ok_or_else(|| anyhow!("unknown memory_type: {memory_type_raw}"))?,
        title: row.get(2)?,
        content: row.get(3)?,
        context: row.get(4)?,
        created_by: MemberId(parse_ulid(&row.get::<_, String>(5)?)?),
        created_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(7)?)?,
        tags: from_json(&row.get::<_, String>(8)?, "tags")?,
        visibility: Visibility::parse(&visibility_raw)
            .ok_or_else(|| anyhow!("unknown visibility: {visibility_raw}"))?,
        project_id: row.get(10)?,
        metadata: from_json(&row.get::<_, String>(11)?, "memory metadata")?,
        votes: Vec::new(),
        comments: Vec::new(),
        usage_count: u64::try_from(row.get::<_, i64>(12)?).context("usage_count out of range")?,
        upvotes: u32::try_from(row.get::<_, i64>(13)?).context("upvotes out of range")?,
        downvotes: u32::try_from(row.get::<_, i64>(14)?).context("downvotes out of range")?,
        success_score: row.get(15)?,
    })
}

fn decode_rule(row: &Row<'_>) -> Result<PermissionRule> {
    let resource_type_raw: String = row.get(2)?;
    let subject_type_raw: String = row.get(4)?;
    Ok(PermissionRule {
        id: RuleId(parse_ulid(&row.get::<_, String>(0)?)?),
        sequence: row.get(1)?,
        resource_type: parse_resource_type(&resource_type_raw)?,
        resource_id: row.get(3)?,
        subject_type: SubjectType::parse(&subject_type_raw)
            .ok_or_else(|| anyhow!("unknown subject_type: {subject_type_raw}"))?,
        subject_id: row.get(5)?,
        permissions: from_json(&row.get::<_, String>(6)?, "rule permissions")?,
        conditions: from_json(&row.get::<_, String>(7)?, "rule conditions")?,
        created_by: MemberId(parse_ulid(&row.get::<_, String>(8)?)?),
        created_at: parse_rfc3339(&row.get::<_, String>(9)?)?,
        expires_at: parse_optional_rfc3339(row.get(10)?)?,
        is_active: row.get(11)?,
    })
}

fn decode_access_request(row: &Row<'_>) -> Result<AccessRequest> {
    let status_raw: String = row.get(8)?;
    Ok(AccessRequest {
        id: AccessRequestId(parse_ulid(&row.get::<_, String>(0)?)?),
        requester_id: MemberId(parse_ulid(&row.get::<_, String>(1)?)?),
        requester_name: row.get(2)?,
        resource_type: parse_resource_type(&row.get::<_, String>(3)?)?,
        resource_id: row.get(4)?,
        resource_name: row.get(5)?,
        requested_permissions: from_json(&row.get::<_, String>(6)?, "requested permissions")?,
        justification: row.get(7)?,
        status: AccessRequestStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown access request status: {status_raw}"))?,
        approvers: from_json(&row.get::<_, String>(9)?, "approvers")?,
        created_at: parse_rfc3339(&row.get::<_, String>(10)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(11)?)?,
        approved_at: parse_optional_rfc3339(row.get(12)?)?,
        approved_by: parse_optional_member(row.get(13)?)?,
        denied_by: parse_optional_member(row.get(14)?)?,
        deny_reason: row.get(15)?,
        expires_at: parse_optional_rfc3339(row.get(16)?)?,
    })
}

fn decode_audit(row: &Row<'_>) -> Result<AuditLog> {
    Ok(AuditLog {
        id: AuditLogId(parse_ulid(&row.get::<_, String>(0)?)?),
        actor_id: row.get(1)?,
        actor_name: row.get(2)?,
        action: row.get(3)?,
        resource_type: row.get(4)?,
        resource_id: row.get(5)?,
        resource_name: row.get(6)?,
        timestamp: parse_rfc3339(&row.get::<_, String>(7)?)?,
        success: row.get(8)?,
        error_message: row.get(9)?,
        metadata: from_json(&row.get::<_, String>(10)?, "audit metadata")?,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(tx: &Transaction<'_>, version: i64) -> Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, rfc3339(OffsetDateTime::now_utc())?],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for ch in term.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn to_json<T: Serialize + ?Sized>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string(value).with_context(|| format!("failed to serialize {what}"))
}

fn from_json<T: DeserializeOwned>(raw: &str, what: &str) -> Result<T> {
    serde_json::from_str(raw).with_context(|| format!("failed to deserialize {what}"))
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_optional_rfc3339(value: Option<String>) -> Result<Option<OffsetDateTime>> {
    value.as_deref().map(parse_rfc3339).transpose()
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

fn parse_optional_member(raw: Option<String>) -> Result<Option<MemberId>> {
    raw.as_deref().map(|raw| parse_ulid(raw).map(MemberId)).transpose()
}

fn parse_resource_type(raw: &str) -> Result<ResourceType> {
    ResourceType::parse(raw).ok_or_else(|| anyhow!("unknown resource_type: {raw}"))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use serde_json::json;
    use team_memory_core::{
        Action, ConditionKind, ConditionOperator, Metadata, NewAccessRequest, NewMember,
        NewMemory, NewPermissionRule, Permission, PermissionCondition, PermissionRestriction,
        RestrictionKind, NEUTRAL_SUCCESS_SCORE,
    };
    use time::Duration;

    const TEAM: &str = "team-a";

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_750_000_000)
    }

    fn open_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"), TEAM)?;
        store.migrate()?;
        Ok(store)
    }

    fn add_member(store: &SqliteStore, name: &str, role: Role) -> Result<TeamMember> {
        let member = NewMember {
            email: format!("{name}@example.com"),
            name: name.to_string(),
            role,
            permissions: None,
        }
        .into_member(TEAM, fixture_time());
        store.insert_member(&member)?;
        Ok(member)
    }

    fn add_memory(
        store: &SqliteStore,
        owner: &TeamMember,
        title: &str,
        visibility: Visibility,
    ) -> Result<TeamMemory> {
        let memory = NewMemory {
            memory_type: MemoryType::ArchitecturalDecision,
            title: title.to_string(),
            content: format!("{title} content"),
            context: "service mesh".to_string(),
            created_by: owner.id,
            tags: vec!["infra".to_string()],
            visibility,
            project_id: Some("atlas".to_string()),
            metadata: Metadata::from([("source".to_string(), json!("adr-7"))]),
        }
        .into_memory(fixture_time());
        store.insert_memory(&memory)?;
        Ok(memory)
    }

    fn vote(memory: &TeamMemory, member: &TeamMember, kind: VoteKind) -> MemoryVote {
        MemoryVote {
            memory_id: memory.id,
            member_id: member.id,
            vote: kind,
            timestamp: fixture_time(),
        }
    }

    #[test]
    fn sqlite_constraints_enforce_checks_and_foreign_keys() -> Result<()> {
        let store = open_store()?;

        let check_result = store.conn.execute(
            "INSERT INTO team_members(
                member_id, team_id, email, name, role, joined_at, last_active, permissions_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                MemberId::new().to_string(),
                TEAM,
                "x@example.com",
                "x",
                "superuser",
                "2026-01-01T00:00:00Z",
                "2026-01-01T00:00:00Z",
                "{}",
            ],
        );
        assert!(check_result.is_err());

        let fk_result = store.conn.execute(
            "INSERT INTO memory_votes(memory_id, member_id, vote, voted_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                MemoryId::new().to_string(),
                MemberId::new().to_string(),
                "upvote",
                "2026-01-01T00:00:00Z",
            ],
        );
        assert!(fk_result.is_err());

        Ok(())
    }

    #[test]
    fn duplicate_email_within_team_is_rejected() -> Result<()> {
        let store = open_store()?;
        add_member(&store, "ada", Role::Admin)?;
        assert!(add_member(&store, "ada", Role::Developer).is_err());

        let found = store.find_member_by_email("ada@example.com")?;
        assert_eq!(found.map(|member| member.role), Some(Role::Admin));
        Ok(())
    }

    #[test]
    fn memory_round_trips_json_columns() -> Result<()> {
        let store = open_store()?;
        let owner = add_member(&store, "ada", Role::Developer)?;
        let memory = add_memory(&store, &owner, "Use mTLS", Visibility::TeamOnly)?;

        let Some(loaded) = store.get_memory(memory.id)? else {
            return Err(anyhow!("memory missing after insert"));
        };
        assert_eq!(loaded, memory);
        assert_eq!(loaded.metadata.get("source"), Some(&json!("adr-7")));
        assert!((loaded.success_score - NEUTRAL_SUCCESS_SCORE).abs() < f64::EPSILON);
        Ok(())
    }

    #[test]
    fn memories_are_scoped_to_their_team() -> Result<()> {
        let path = std::env::temp_dir().join(format!("team-memory-scope-{}.sqlite3", Ulid::new()));
        {
            let mut team_a = SqliteStore::open(&path, "team-a")?;
            team_a.migrate()?;
            let owner = add_member(&team_a, "ada", Role::Developer)?;
            add_memory(&team_a, &owner, "Scoped", Visibility::Public)?;
        }

        let mut team_b = SqliteStore::open(&path, "team-b")?;
        team_b.migrate()?;
        assert!(team_b.list_memories(&MemoryFilter::default())?.is_empty());
        assert!(team_b.list_members()?.is_empty());

        let team_a = SqliteStore::open(&path, "team-a")?;
        assert_eq!(team_a.list_memories(&MemoryFilter::default())?.len(), 1);

        cleanup(&path)
    }

    #[test]
    fn revote_replaces_row_and_updates_score() -> Result<()> {
        // Test IDs: VOTE-001
        let mut store = open_store()?;
        let owner = add_member(&store, "ada", Role::Developer)?;
        let x = add_member(&store, "xavier", Role::Developer)?;
        let y = add_member(&store, "yara", Role::Observer)?;
        let z = add_member(&store, "zane", Role::Observer)?;
        let memory = add_memory(&store, &owner, "Retry policy", Visibility::Public)?;

        store.upsert_vote(&vote(&memory, &x, VoteKind::Upvote))?;
        let tally = store.upsert_vote(&vote(&memory, &y, VoteKind::Downvote))?;
        assert_eq!(tally.map(VoteTally::success_score), Some(0.5));

        let tally = store.upsert_vote(&vote(&memory, &z, VoteKind::Upvote))?;
        let Some(tally) = tally else {
            return Err(anyhow!("vote on existing memory returned None"));
        };
        assert!((tally.success_score() - 2.0 / 3.0).abs() < 1e-12);

        store.upsert_vote(&vote(&memory, &z, VoteKind::Downvote))?;
        store.upsert_vote(&vote(&memory, &z, VoteKind::Downvote))?;

        let Some(loaded) = store.get_memory(memory.id)? else {
            return Err(anyhow!("memory missing"));
        };
        assert_eq!(loaded.votes.len(), 3);
        assert_eq!((loaded.upvotes, loaded.downvotes), (1, 2));
        assert!((loaded.success_score - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(loaded.validate(), Ok(()));
        Ok(())
    }

    #[test]
    fn repeated_revotes_keep_counters_in_step_with_rows() -> Result<()> {
        let mut store = open_store()?;
        let owner = add_member(&store, "ada", Role::Developer)?;
        let x = add_member(&store, "xavier", Role::Developer)?;
        let y = add_member(&store, "yara", Role::Observer)?;
        let memory = add_memory(&store, &owner, "Retry policy", Visibility::Public)?;

        let flips = [
            (&x, VoteKind::Upvote),
            (&x, VoteKind::Downvote),
            (&y, VoteKind::Downvote),
            (&x, VoteKind::Upvote),
            (&y, VoteKind::Upvote),
            (&y, VoteKind::Upvote),
            (&x, VoteKind::Downvote),
        ];
        for (member, kind) in flips {
            store.upsert_vote(&vote(&memory, member, kind))?;
        }

        let Some(loaded) = store.get_memory(memory.id)? else {
            return Err(anyhow!("memory missing"));
        };
        let recount = VoteTally::from_votes(&loaded.votes);
        assert_eq!(loaded.votes.len(), 2);
        assert_eq!((loaded.upvotes, loaded.downvotes), (recount.upvotes, recount.downvotes));
        assert_eq!((loaded.upvotes, loaded.downvotes), (1, 1));
        assert_eq!(loaded.validate(), Ok(()));
        Ok(())
    }

    #[test]
    fn vote_on_missing_memory_returns_none() -> Result<()> {
        let mut store = open_store()?;
        let member = add_member(&store, "ada", Role::Developer)?;
        let vote = MemoryVote {
            memory_id: MemoryId::new(),
            member_id: member.id,
            vote: VoteKind::Upvote,
            timestamp: fixture_time(),
        };
        assert_eq!(store.upsert_vote(&vote)?, None);
        Ok(())
    }

    #[test]
    fn search_respects_private_visibility() -> Result<()> {
        let store = open_store()?;
        let owner = add_member(&store, "ada", Role::Developer)?;
        let other = add_member(&store, "bob", Role::Developer)?;
        add_memory(&store, &owner, "Cache invalidation shared", Visibility::TeamOnly)?;
        add_memory(&store, &owner, "Cache invalidation secret", Visibility::Private)?;

        assert_eq!(store.search_memories_for_term("CACHE", Some(owner.id), 20)?.len(), 2);
        assert_eq!(store.search_memories_for_term("cache", Some(other.id), 20)?.len(), 1);
        assert_eq!(store.search_memories_for_term("cache", None, 20)?.len(), 1);
        assert!(store.search_memories_for_term("100%", None, 20)?.is_empty());
        Ok(())
    }

    #[test]
    fn search_folds_case_beyond_ascii() -> Result<()> {
        let store = open_store()?;
        let owner = add_member(&store, "ada", Role::Developer)?;
        add_memory(&store, &owner, "ÉCOLE migration", Visibility::Public)?;
        add_memory(&store, &owner, "Straße naming", Visibility::Public)?;

        assert_eq!(store.search_memories_for_term("école", None, 20)?.len(), 1);
        assert_eq!(store.search_memories_for_term("ÉCOLE", None, 20)?.len(), 1);
        assert_eq!(store.search_memories_for_term("MIGRATION", None, 20)?.len(), 1);
        assert_eq!(store.search_memories_for_term("STRAẞE", None, 20)?.len(), 1);
        Ok(())
    }

    #[test]
    fn usage_counts_attempts_regardless_of_success() -> Result<()> {
        let mut store = open_store()?;
        let owner = add_member(&store, "ada", Role::Developer)?;
        let memory = add_memory(&store, &owner, "Feature flags", Visibility::Public)?;

        for success in [true, false] {
            let recorded = store.record_usage(&UsageEvent {
                id: UsageId::new(),
                memory_id: memory.id,
                used_by: owner.id,
                used_at: fixture_time(),
                context: "rollout".to_string(),
                success,
            })?;
            assert!(recorded);
        }

        let missing = store.record_usage(&UsageEvent {
            id: UsageId::new(),
            memory_id: MemoryId::new(),
            used_by: owner.id,
            used_at: fixture_time(),
            context: String::new(),
            success: true,
        })?;
        assert!(!missing);

        let Some(loaded) = store.get_memory(memory.id)? else {
            return Err(anyhow!("memory missing"));
        };
        assert_eq!(loaded.usage_count, 2);
        assert_eq!(store.list_usage_events(Some(memory.id))?.len(), 2);
        assert_eq!(store.list_usage_events(None)?.len(), 2);
        Ok(())
    }

    #[test]
    fn threaded_comment_requires_existing_parent() -> Result<()> {
        let store = open_store()?;
        let owner = add_member(&store, "ada", Role::Developer)?;
        let memory = add_memory(&store, &owner, "Logging levels", Visibility::Public)?;

        let root = MemoryComment {
            id: CommentId::new(),
            memory_id: memory.id,
            member_id: owner.id,
            content: "warn for retries".to_string(),
            timestamp: fixture_time(),
            parent_comment_id: None,
        };
        store.insert_comment(&root)?;
        let reply = MemoryComment {
            id: CommentId::new(),
            parent_comment_id: Some(root.id),
            content: "agreed".to_string(),
            timestamp: fixture_time() + Duration::seconds(1),
            ..root.clone()
        };
        store.insert_comment(&reply)?;

        let orphan = MemoryComment {
            id: CommentId::new(),
            parent_comment_id: Some(CommentId::new()),
            ..root.clone()
        };
        assert!(store.insert_comment(&orphan).is_err());

        let Some(loaded) = store.get_memory(memory.id)? else {
            return Err(anyhow!("memory missing"));
        };
        assert_eq!(loaded.comments, vec![root, reply]);
        Ok(())
    }

    #[test]
    fn rules_round_trip_in_sequence_order() -> Result<()> {
        let store = open_store()?;
        let admin = add_member(&store, "ada", Role::Admin)?;

        let mut first = NewPermissionRule::for_user(
            admin.id,
            ResourceType::Memory,
            None,
            vec![Permission {
                action: Action::Write,
                granted: true,
                restrictions: vec![PermissionRestriction {
                    kind: RestrictionKind::RateLimit,
                    value: json!({"per_hour": 10}),
                }],
            }],
        );
        first.conditions = vec![PermissionCondition {
            kind: ConditionKind::Other("location".to_string()),
            value: json!("office"),
            operator: ConditionOperator::Equals,
        }];
        let second = NewPermissionRule::for_user(
            admin.id,
            ResourceType::Team,
            None,
            vec![Permission::deny(Action::Admin)],
        );

        let sequence = store.next_rule_sequence()?;
        let first = first.into_rule(admin.id, sequence, fixture_time());
        store.insert_rule(&first)?;
        let mut second = second.into_rule(admin.id, store.next_rule_sequence()?, fixture_time());
        store.insert_rule(&second)?;

        second.is_active = false;
        second.expires_at = Some(fixture_time() + Duration::days(1));
        assert!(store.update_rule(&second)?);

        let rules = store.list_rules()?;
        assert_eq!(rules, vec![first, second]);
        assert_eq!(rules[1].sequence, rules[0].sequence + 1);
        Ok(())
    }

    #[test]
    fn rule_batch_is_written_all_or_nothing() -> Result<()> {
        let mut store = open_store()?;
        let admin = add_member(&store, "ada", Role::Admin)?;
        let reader = add_member(&store, "bo", Role::Observer)?;

        let first_sequence = store.next_rule_sequence()?;
        let grant = |subject: &TeamMember, sequence: i64| {
            NewPermissionRule::for_user(
                subject.id,
                ResourceType::Memory,
                None,
                vec![Permission::grant(Action::Read)],
            )
            .into_rule(admin.id, sequence, fixture_time())
        };
        let first = grant(&reader, first_sequence);
        // Same sequence as the first rule violates UNIQUE(team_id, sequence).
        let clash = grant(&admin, first_sequence);
        assert!(store.insert_rules(&[first.clone(), clash]).is_err());
        assert!(store.list_rules()?.is_empty());

        let second = grant(&admin, first_sequence + 1);
        store.insert_rules(&[first.clone(), second.clone()])?;
        assert_eq!(store.list_rules()?, vec![first, second]);
        Ok(())
    }

    #[test]
    fn access_request_lifecycle_persists() -> Result<()> {
        let store = open_store()?;
        let requester = add_member(&store, "cy", Role::Observer)?;
        let admin = add_member(&store, "ada", Role::Admin)?;

        let mut request = NewAccessRequest {
            requester_id: requester.id,
            resource_type: ResourceType::Memory,
            resource_id: MemoryId::new().to_string(),
            resource_name: "Runbook".to_string(),
            requested_permissions: vec![Permission::grant(Action::Write)],
            justification: "on call".to_string(),
            approvers: vec![admin.id],
            expires_at: None,
        }
        .into_request(requester.name.clone(), fixture_time());
        store.insert_access_request(&request)?;

        request
            .deny(admin.id, "insufficient trust", fixture_time() + Duration::minutes(5))
            .map_err(|err| anyhow!("deny failed: {err}"))?;
        assert!(store.update_access_request(&request)?);

        assert_eq!(store.list_access_requests()?, vec![request]);
        Ok(())
    }

    #[test]
    fn approval_commits_request_and_rule_together() -> Result<()> {
        let mut store = open_store()?;
        let requester = add_member(&store, "cy", Role::Observer)?;
        let admin = add_member(&store, "ada", Role::Admin)?;

        let mut request = NewAccessRequest {
            requester_id: requester.id,
            resource_type: ResourceType::Project,
            resource_id: "apollo".to_string(),
            resource_name: "Apollo".to_string(),
            requested_permissions: vec![Permission::grant(Action::Read)],
            justification: "joining the project".to_string(),
            approvers: Vec::new(),
            expires_at: None,
        }
        .into_request(requester.name.clone(), fixture_time());
        store.insert_access_request(&request)?;

        request.approve(admin.id, fixture_time()).map_err(|err| anyhow!("approve failed: {err}"))?;
        let rule = request.grant_rule(admin.id, store.next_rule_sequence()?, fixture_time());
        assert!(store.commit_approval(&request, &rule)?);
        assert_eq!(store.list_rules()?, vec![rule]);
        assert_eq!(store.list_access_requests()?[0].status, AccessRequestStatus::Approved);

        // A request the store has never seen rolls back without writing the rule.
        let orphan = NewAccessRequest {
            requester_id: requester.id,
            resource_type: ResourceType::Team,
            resource_id: TEAM.to_string(),
            resource_name: "Team".to_string(),
            requested_permissions: vec![Permission::grant(Action::Read)],
            justification: "never stored".to_string(),
            approvers: Vec::new(),
            expires_at: None,
        }
        .into_request(requester.name.clone(), fixture_time());
        let orphan_rule = orphan.grant_rule(admin.id, store.next_rule_sequence()?, fixture_time());
        assert!(!store.commit_approval(&orphan, &orphan_rule)?);
        assert_eq!(store.list_rules()?.len(), 1);
        Ok(())
    }

    #[test]
    fn recent_audit_returns_newest_window_oldest_first() -> Result<()> {
        let store = open_store()?;
        for minute in 0..5 {
            let entry = AuditLog::new(
                "permission_check",
                "memory",
                format!("m-{minute}"),
                fixture_time() + Duration::minutes(minute),
            )
            .with_metadata("granted", true);
            store.append_audit(&entry)?;
        }

        let recent = store.list_recent_audit(3)?;
        let ids: Vec<&str> = recent.iter().map(|entry| entry.resource_id.as_str()).collect();
        assert_eq!(ids, vec!["m-2", "m-3", "m-4"]);
        assert_eq!(recent[0].metadata.get("granted"), Some(&json!(true)));
        Ok(())
    }

    #[test]
    fn audit_query_reads_full_history_newest_first() -> Result<()> {
        let store = open_store()?;
        for minute in 0..5 {
            let action = if minute % 2 == 0 { "permission_check" } else { "share_memory" };
            let entry = AuditLog::new(
                action,
                "memory",
                format!("m-{minute}"),
                fixture_time() + Duration::minutes(minute),
            )
            .by("actor-1", None);
            store.append_audit(&entry)?;
        }

        let all = store.query_audit(&AuditFilter::default())?;
        let ids: Vec<&str> = all.iter().map(|entry| entry.resource_id.as_str()).collect();
        assert_eq!(ids, vec!["m-4", "m-3", "m-2", "m-1", "m-0"]);

        let ranged = store.query_audit(&AuditFilter {
            action: Some("permission_check".to_string()),
            start: Some(fixture_time() + Duration::minutes(1)),
            end: Some(fixture_time() + Duration::minutes(4)),
            ..AuditFilter::default()
        })?;
        let ids: Vec<&str> = ranged.iter().map(|entry| entry.resource_id.as_str()).collect();
        assert_eq!(ids, vec!["m-4", "m-2"]);

        let limited = store.query_audit(&AuditFilter { limit: Some(2), ..AuditFilter::default() })?;
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].resource_id, "m-4");
        Ok(())
    }

    // Test IDs: TDB-008
    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let store = open_store()?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);
        assert!(report.schema_status.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn schema_status_reports_pending_before_migrate() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"), TEAM)?;
        let status = store.schema_status()?;
        assert_eq!(status.current_version, 0);
        assert_eq!(status.pending_versions, vec![1]);
        Ok(())
    }

    fn cleanup(path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let path = if suffix.is_empty() {
                path.to_path_buf()
            } else {
                std::path::PathBuf::from(format!("{}{}", path.display(), suffix))
            };
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }
}
