//! Domain model and pure decision logic for shared team memories.
//!
//! Nothing in this crate performs I/O. The store crate persists these shapes and
//! the API crate orchestrates them; every function here is a deterministic
//! function of its inputs, including the clock, which callers pass in.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub mod analytics;
pub mod audit;
pub mod model;
pub mod permissions;
pub mod scoring;

pub use analytics::{build_team_analytics, ContributorStats, TeamAnalytics};
pub use audit::{
    build_compliance_report, ActionCount, AuditFilter, AuditLog, AuditTrail, ComplianceReport,
    DEFAULT_AUDIT_CAPACITY,
};
pub use model::{
    normalize_tags, MemoryComment, MemoryFilter, MemoryUpdate, MemoryVote, Metadata, NewMember,
    NewMemory, TeamMember, TeamMemory, TeamPermissions, UsageEvent,
};
pub use permissions::{
    evaluate_permission, role_allows, visibility_allows, AccessRequest, AccessRequestFilter,
    ConditionKind, DecisionInputs, DecisionSource, MemoryAccessView, NewAccessRequest,
    NewPermissionRule, Permission, PermissionCondition, PermissionDecision, PermissionQuery,
    PermissionRestriction, PermissionRule, PermissionRuleUpdate, RuleFilter,
    UnknownConditionPolicy,
};
pub use scoring::{
    merge_search_hits, tokenize_search_terms, VoteTally, NEUTRAL_SUCCESS_SCORE,
    SEARCH_RESULT_LIMIT, SEARCH_TERM_HIT_LIMIT,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TeamError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parse an identifier from its canonical string form.
            ///
            /// # Errors
            /// Returns [`TeamError::Validation`] when `raw` is not a valid ULID.
            pub fn parse(raw: &str) -> Result<Self, TeamError> {
                Ulid::from_string(raw.trim()).map(Self).map_err(|err| {
                    TeamError::Validation(format!(
                        "invalid {} `{raw}`: {err}",
                        stringify!($name)
                    ))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = TeamError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Self::parse(raw)
            }
        }
    };
}

ulid_id!(MemberId);
ulid_id!(MemoryId);
ulid_id!(CommentId);
ulid_id!(UsageId);
ulid_id!(RuleId);
ulid_id!(AccessRequestId);
ulid_id!(AuditLogId);

/// Closed string enums shared by the wire format and the store columns.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])* $name:ident {
            $($(#[$variant_meta:meta])* $variant:ident => $wire:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub enum $name {
            $($(#[$variant_meta])* #[serde(rename = $wire)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $wire),+
                }
            }

            #[must_use]
            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($wire => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_enum!(Role {
    Admin => "admin",
    Developer => "developer",
    Observer => "observer",
});

wire_enum!(MemoryType {
    ArchitecturalDecision => "architectural_decision",
    CodePattern => "code_pattern",
    Conversation => "conversation",
    BestPractice => "best_practice",
    LessonLearned => "lesson_learned",
});

wire_enum!(Visibility {
    Public => "public",
    Private => "private",
    TeamOnly => "team_only",
});

wire_enum!(VoteKind {
    Upvote => "upvote",
    Downvote => "downvote",
});

impl FromStr for VoteKind {
    type Err = TeamError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
            .ok_or_else(|| TeamError::InvalidState(format!("unrecognized vote value `{raw}`")))
    }
}

wire_enum!(ResourceType {
    Memory => "memory",
    Project => "project",
    Team => "team",
    Dashboard => "dashboard",
});

wire_enum!(SubjectType {
    User => "user",
    Role => "role",
    Team => "team",
});

wire_enum!(Action {
    Read => "read",
    Write => "write",
    Delete => "delete",
    Share => "share",
    Vote => "vote",
    Comment => "comment",
    Moderate => "moderate",
    Admin => "admin",
});

wire_enum!(AccessRequestStatus {
    Pending => "pending",
    Approved => "approved",
    Denied => "denied",
    Expired => "expired",
});

wire_enum!(RestrictionKind {
    RateLimit => "rate_limit",
    ContentFilter => "content_filter",
    ApprovalWorkflow => "approval_workflow",
    AuditRequired => "audit_required",
});

wire_enum!(
    #[derive(Default)]
    ConditionOperator {
        #[default]
        Equals => "equals",
        Contains => "contains",
        GreaterThan => "greater_than",
        LessThan => "less_than",
        InRange => "in_range",
    }
);
