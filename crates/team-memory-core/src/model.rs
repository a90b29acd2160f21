use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::scoring::{VoteTally, NEUTRAL_SUCCESS_SCORE};
use crate::{
    CommentId, MemberId, MemoryId, MemoryType, Role, TeamError, UsageId, Visibility, VoteKind,
};

/// Opaque key/value bag attached to memories and audit entries.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Capability bundle carried by every member.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[allow(clippy::struct_excessive_bools)]
pub struct TeamPermissions {
    pub can_create_memories: bool,
    pub can_edit_memories: bool,
    pub can_delete_memories: bool,
    pub can_view_private_memories: bool,
    pub can_manage_team: bool,
    pub can_access_analytics: bool,
}

impl TeamPermissions {
    /// Capability bundle a member receives when none is supplied on join.
    #[must_use]
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Admin => Self {
                can_create_memories: true,
                can_edit_memories: true,
                can_delete_memories: true,
                can_view_private_memories: true,
                can_manage_team: true,
                can_access_analytics: true,
            },
            Role::Developer => Self {
                can_create_memories: true,
                can_edit_memories: true,
                can_delete_memories: false,
                can_view_private_memories: false,
                can_manage_team: false,
                can_access_analytics: true,
            },
            Role::Observer => Self {
                can_create_memories: false,
                can_edit_memories: false,
                can_delete_memories: false,
                can_view_private_memories: false,
                can_manage_team: false,
                can_access_analytics: false,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamMember {
    pub id: MemberId,
    pub team_id: String,
    pub email: String,
    pub name: String,
    pub role: Role,
    #[serde(with = "time::serde::rfc3339")]
    pub joined_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active: OffsetDateTime,
    pub permissions: TeamPermissions,
}

impl TeamMember {
    /// Whether this member may perform member-management actions.
    #[must_use]
    pub fn manages_team(&self) -> bool {
        self.role == Role::Admin || self.permissions.can_manage_team
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewMember {
    pub email: String,
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub permissions: Option<TeamPermissions>,
}

impl NewMember {
    /// Validate identity fields before a member is admitted to the team.
    ///
    /// # Errors
    /// Returns [`TeamError::Validation`] when the name is blank or the email is malformed.
    pub fn validate(&self) -> Result<(), TeamError> {
        if self.name.trim().is_empty() {
            return Err(TeamError::Validation("member name MUST be provided".to_string()));
        }

        let email = self.email.trim();
        let Some((local, domain)) = email.split_once('@') else {
            return Err(TeamError::Validation(format!("invalid member email `{email}`")));
        };
        if local.is_empty() || domain.is_empty() {
            return Err(TeamError::Validation(format!("invalid member email `{email}`")));
        }

        Ok(())
    }

    #[must_use]
    pub fn into_member(self, team_id: &str, now: OffsetDateTime) -> TeamMember {
        let permissions = self.permissions.unwrap_or_else(|| TeamPermissions::for_role(self.role));
        TeamMember {
            id: MemberId::new(),
            team_id: team_id.to_string(),
            email: self.email.trim().to_ascii_lowercase(),
            name: self.name.trim().to_string(),
            role: self.role,
            joined_at: now,
            last_active: now,
            permissions,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MemoryVote {
    pub memory_id: MemoryId,
    pub member_id: MemberId,
    pub vote: VoteKind,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MemoryComment {
    pub id: CommentId,
    pub memory_id: MemoryId,
    pub member_id: MemberId,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub parent_comment_id: Option<CommentId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UsageEvent {
    pub id: UsageId,
    pub memory_id: MemoryId,
    pub used_by: MemberId,
    #[serde(with = "time::serde::rfc3339")]
    pub used_at: OffsetDateTime,
    pub context: String,
    pub success: bool,
}

/// Public shape of a team memory with votes and comments materialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamMemory {
    pub id: MemoryId,
    pub memory_type: MemoryType,
    pub title: String,
    pub content: String,
    pub context: String,
    pub created_by: MemberId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub tags: Vec<String>,
    pub visibility: Visibility,
    pub project_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub votes: Vec<MemoryVote>,
    #[serde(default)]
    pub comments: Vec<MemoryComment>,
    pub usage_count: u64,
    pub upvotes: u32,
    pub downvotes: u32,
    pub success_score: f64,
}

impl TeamMemory {
    #[must_use]
    pub fn tally(&self) -> VoteTally {
        VoteTally { upvotes: self.upvotes, downvotes: self.downvotes }
    }

    /// Check stored invariants of a memory row.
    ///
    /// # Errors
    /// Returns [`TeamError::Validation`] when the title is blank or the score
    /// disagrees with the vote counters.
    pub fn validate(&self) -> Result<(), TeamError> {
        if self.title.trim().is_empty() {
            return Err(TeamError::Validation("memory title MUST be provided".to_string()));
        }

        if !(0.0..=1.0).contains(&self.success_score) {
            return Err(TeamError::Validation("success_score MUST be in [0.0, 1.0]".to_string()));
        }

        let expected = self.tally().success_score();
        if (expected - self.success_score).abs() > 1e-9 {
            return Err(TeamError::Validation(format!(
                "success_score {} does not match vote tally {}/{}",
                self.success_score, self.upvotes, self.downvotes
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewMemory {
    pub memory_type: MemoryType,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub context: String,
    pub created_by: MemberId,
    #[serde(default)]
    pub tags: Vec<String>,
    pub visibility: Visibility,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewMemory {
    /// # Errors
    /// Returns [`TeamError::Validation`] when title or content is blank.
    pub fn validate(&self) -> Result<(), TeamError> {
        if self.title.trim().is_empty() {
            return Err(TeamError::Validation("memory title MUST be provided".to_string()));
        }
        if self.content.trim().is_empty() {
            return Err(TeamError::Validation("memory content MUST be provided".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn into_memory(self, now: OffsetDateTime) -> TeamMemory {
        TeamMemory {
            id: MemoryId::new(),
            memory_type: self.memory_type,
            title: self.title.trim().to_string(),
            content: self.content,
            context: self.context,
            created_by: self.created_by,
            created_at: now,
            updated_at: now,
            tags: normalize_tags(&self.tags),
            visibility: self.visibility,
            project_id: self.project_id,
            metadata: self.metadata,
            votes: Vec::new(),
            comments: Vec::new(),
            usage_count: 0,
            upvotes: 0,
            downvotes: 0,
            success_score: NEUTRAL_SUCCESS_SCORE,
        }
    }
}

/// Partial edit applied by the owner or an admin.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemoryUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl MemoryUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.content.is_none()
            && self.context.is_none()
            && self.tags.is_none()
            && self.visibility.is_none()
            && self.metadata.is_none()
    }

    /// Apply the edit in place and bump `updated_at`.
    ///
    /// # Errors
    /// Returns [`TeamError::Validation`] when the edit would blank the title or content;
    /// `memory` is left untouched in that case.
    pub fn apply(&self, memory: &mut TeamMemory, now: OffsetDateTime) -> Result<(), TeamError> {
        if self.title.as_deref().is_some_and(|title| title.trim().is_empty()) {
            return Err(TeamError::Validation("memory title MUST be provided".to_string()));
        }
        if self.content.as_deref().is_some_and(|content| content.trim().is_empty()) {
            return Err(TeamError::Validation("memory content MUST be provided".to_string()));
        }

        if let Some(title) = &self.title {
            memory.title = title.trim().to_string();
        }
        if let Some(content) = &self.content {
            memory.content.clone_from(content);
        }
        if let Some(context) = &self.context {
            memory.context.clone_from(context);
        }
        if let Some(tags) = &self.tags {
            memory.tags = normalize_tags(tags);
        }
        if let Some(visibility) = self.visibility {
            memory.visibility = visibility;
        }
        if let Some(metadata) = &self.metadata {
            memory.metadata.clone_from(metadata);
        }
        memory.updated_at = now;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MemoryFilter {
    #[serde(default)]
    pub memory_type: Option<MemoryType>,
    #[serde(default)]
    pub created_by: Option<MemberId>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
}

/// Trim, drop blanks, and de-duplicate tags while keeping first-seen order.
#[must_use]
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut normalized = Vec::new();
    for tag in tags {
        let trimmed = tag.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_ascii_lowercase()) {
            normalized.push(trimmed.to_string());
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn new_memory() -> NewMemory {
        NewMemory {
            memory_type: MemoryType::CodePattern,
            title: "  Retry with jitter ".to_string(),
            content: "Use exponential backoff with full jitter".to_string(),
            context: "http clients".to_string(),
            created_by: MemberId::new(),
            tags: vec![
                "retry".to_string(),
                " Retry".to_string(),
                String::new(),
                "http".to_string(),
            ],
            visibility: Visibility::TeamOnly,
            project_id: None,
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn new_memory_starts_neutral_with_no_votes() {
        let memory = new_memory().into_memory(fixture_time());

        assert_eq!(memory.title, "Retry with jitter");
        assert_eq!(memory.tags, vec!["retry".to_string(), "http".to_string()]);
        assert_eq!(memory.usage_count, 0);
        assert!(memory.votes.is_empty());
        assert!((memory.success_score - NEUTRAL_SUCCESS_SCORE).abs() < f64::EPSILON);
        assert_eq!(memory.validate(), Ok(()));
    }

    #[test]
    fn new_memory_rejects_blank_title() {
        let mut input = new_memory();
        input.title = "   ".to_string();
        assert!(matches!(input.validate(), Err(TeamError::Validation(_))));
    }

    #[test]
    fn memory_update_rejects_blank_content_without_partial_mutation() {
        let mut memory = new_memory().into_memory(fixture_time());
        let before = memory.clone();
        let update = MemoryUpdate {
            title: Some("New title".to_string()),
            content: Some(" ".to_string()),
            ..MemoryUpdate::default()
        };

        assert!(update.apply(&mut memory, fixture_time() + Duration::hours(1)).is_err());
        assert_eq!(memory, before);
    }

    #[test]
    fn memory_update_bumps_updated_at() {
        let mut memory = new_memory().into_memory(fixture_time());
        let later = fixture_time() + Duration::days(2);
        let update = MemoryUpdate {
            visibility: Some(Visibility::Private),
            tags: Some(vec!["resilience".to_string()]),
            ..MemoryUpdate::default()
        };

        assert!(!update.is_empty());
        assert_eq!(update.apply(&mut memory, later), Ok(()));
        assert_eq!(memory.visibility, Visibility::Private);
        assert_eq!(memory.tags, vec!["resilience".to_string()]);
        assert_eq!(memory.updated_at, later);
        assert_eq!(memory.created_at, fixture_time());
    }

    #[test]
    fn new_member_defaults_capabilities_from_role() {
        let member = NewMember {
            email: " Ada@Example.com ".to_string(),
            name: "Ada".to_string(),
            role: Role::Observer,
            permissions: None,
        };
        assert_eq!(member.validate(), Ok(()));

        let member = member.into_member("team-a", fixture_time());
        assert_eq!(member.email, "ada@example.com");
        assert_eq!(member.permissions, TeamPermissions::for_role(Role::Observer));
        assert!(!member.manages_team());
    }

    #[test]
    fn new_member_rejects_malformed_email() {
        let member = NewMember {
            email: "no-at-sign".to_string(),
            name: "Bob".to_string(),
            role: Role::Developer,
            permissions: None,
        };
        assert!(matches!(member.validate(), Err(TeamError::Validation(_))));
    }
}
