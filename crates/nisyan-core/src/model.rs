use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{NisyanError, Result};

pub const MAX_NAME_LENGTH: usize = 300;
pub const MAX_BODY_LENGTH: usize = 50_000;

/// Neutral scores assigned at ingest, before the classifier has seen the node.
pub const DEFAULT_IMPORTANCE: u8 = 3;
pub const DEFAULT_STABILITY: u8 = 3;

/// Validate inputs for ingesting a new memory.
pub fn validate_add_input(name: &str, body: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(NisyanError::InvalidInput("name cannot be empty".into()));
    }
    if trimmed.len() > MAX_NAME_LENGTH {
        return Err(NisyanError::InvalidInput(format!(
            "name exceeds maximum length of {MAX_NAME_LENGTH} characters"
        )));
    }
    if body.len() > MAX_BODY_LENGTH {
        return Err(NisyanError::InvalidInput(format!(
            "body exceeds maximum length of {MAX_BODY_LENGTH} characters"
        )));
    }
    Ok(())
}

/// Validate an importance or stability score.
pub fn validate_score(label: &str, value: u8) -> Result<()> {
    if !(1..=5).contains(&value) {
        return Err(NisyanError::InvalidInput(format!(
            "{label} must be between 1 and 5, got {value}"
        )));
    }
    Ok(())
}

/// Lifecycle of a memory node.
///
/// Forward path: ACTIVE → DORMANT → ARCHIVED → EXPIRED → SOFT_DELETED → (purged).
/// Reverse edges: DORMANT/ARCHIVED revive to ACTIVE on access, SOFT_DELETED
/// recovers to ARCHIVED. PERMANENT is an absorbing state for high
/// importance/stability nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Active,
    Dormant,
    Archived,
    Expired,
    SoftDeleted,
    Permanent,
}

impl LifecycleState {
    /// Canonical attribute value stored in the graph.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Dormant => "DORMANT",
            Self::Archived => "ARCHIVED",
            Self::Expired => "EXPIRED",
            Self::SoftDeleted => "SOFT_DELETED",
            Self::Permanent => "PERMANENT",
        }
    }

    /// Lowercase form used for metric labels.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Dormant => "dormant",
            Self::Archived => "archived",
            Self::Expired => "expired",
            Self::SoftDeleted => "soft_deleted",
            Self::Permanent => "permanent",
        }
    }

    pub const ALL: [LifecycleState; 6] = [
        Self::Active,
        Self::Dormant,
        Self::Archived,
        Self::Expired,
        Self::SoftDeleted,
        Self::Permanent,
    ];
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ACTIVE" => Ok(Self::Active),
            "DORMANT" => Ok(Self::Dormant),
            "ARCHIVED" => Ok(Self::Archived),
            "EXPIRED" => Ok(Self::Expired),
            "SOFT_DELETED" => Ok(Self::SoftDeleted),
            "PERMANENT" => Ok(Self::Permanent),
            _ => Err(format!("unknown lifecycle state: {s}")),
        }
    }
}

/// A memory node's scoring and lifecycle attributes.
///
/// The graph engine owns node existence and embeddings; this subsystem
/// exclusively owns the attributes below and mutates them through the
/// storage driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryNode {
    pub uuid: Uuid,
    pub name: String,
    pub summary: String,
    #[serde(default)]
    pub group_id: Option<String>,
    pub importance: u8,
    pub stability: u8,
    pub decay_score: f64,
    pub state: LifecycleState,
    #[serde(default)]
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub access_count: u64,
    #[serde(default)]
    pub soft_deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub classified_at: Option<DateTime<Utc>>,
}

impl MemoryNode {
    /// Create a freshly-ingested node: ACTIVE with neutral scores, awaiting
    /// classification.
    pub fn new(name: String, summary: String, group_id: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            uuid: Uuid::now_v7(),
            name,
            summary,
            group_id,
            importance: DEFAULT_IMPORTANCE,
            stability: DEFAULT_STABILITY,
            decay_score: 0.0,
            state: LifecycleState::Active,
            last_accessed_at: None,
            created_at: now,
            access_count: 0,
            soft_deleted_at: None,
            classified_at: None,
        }
    }

    /// PERMANENT promotion applies iff both scores are at least 4.
    pub fn is_permanent_candidate(&self) -> bool {
        self.importance >= 4 && self.stability >= 4
    }

    /// Text handed to the classifier: name plus brief description.
    pub fn classification_text(&self) -> String {
        if self.summary.is_empty() {
            self.name.clone()
        } else {
            format!("{}: {}", self.name, self.summary)
        }
    }
}

/// The slice of a node the state machine evaluates. Read in one batched
/// query so the decision is made against a consistent snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub uuid: Uuid,
    pub state: LifecycleState,
    pub decay_score: f64,
    pub days_since_access: f64,
    pub importance: u8,
    pub stability: u8,
}

/// An ingested piece of content, owned by the host graph engine. Recorded
/// at ingest and surfaced read-only through `get_episodes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub uuid: Uuid,
    pub name: String,
    pub body: String,
    pub source: String,
    #[serde(default)]
    pub group_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A relationship between two memory nodes, surfaced by `search_facts`.
/// Fact edges are not re-ranked and carry no lifecycle attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactEdge {
    pub uuid: Uuid,
    pub source_uuid: Uuid,
    pub target_uuid: Uuid,
    pub predicate: String,
    pub fact: String,
    #[serde(default)]
    pub group_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Group scoping is a per-call property: an absent filter means all groups.
pub fn in_groups(group_id: &Option<String>, filter: Option<&[String]>) -> bool {
    match filter {
        None => true,
        Some(groups) => match group_id {
            Some(id) => groups.iter().any(|g| g == id),
            None => false,
        },
    }
}
