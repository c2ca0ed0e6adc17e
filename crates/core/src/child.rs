//! Child-scoped domain types: profiles, growth records and detail facts.
//!
//! The child id is the tenant boundary for retrieval. Nothing owned by one
//! child may surface in a query scoped to another.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a child; the retrieval scope.
    ChildId
);
uuid_id!(
    /// Identifier of a caregiver account.
    UserId
);
uuid_id!(
    /// Identifier of a single child-detail fact.
    DetailId
);

/// A child's static profile. Read-only to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildProfile {
    pub id: ChildId,
    pub name: String,
    pub birthdate: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    /// The guardian who owns this profile.
    pub guardian_id: UserId,
}

impl ChildProfile {
    /// Age in whole days at `today`. Zero for birthdates in the future.
    pub fn age_days(&self, today: NaiveDate) -> i64 {
        (today - self.birthdate).num_days().max(0)
    }

    /// Age in whole months, counted as 30-day blocks.
    pub fn age_months(&self, today: NaiveDate) -> u32 {
        (self.age_days(today) / 30) as u32
    }

    /// Age in whole years, counted as 365-day blocks.
    pub fn age_years(&self, today: NaiveDate) -> u32 {
        (self.age_days(today) / 365) as u32
    }
}

/// A structured growth observation (feeding, sleep, height...). Owned by an
/// external collaborator; read-only input to context assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrowthRecord {
    pub id: Uuid,
    pub child_id: ChildId,
    /// e.g. "feeding", "sleep", "height"
    pub category: String,
    /// Category-specific structured value.
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Kind of free-text fact recorded about a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailType {
    Interest,
    Milestone,
    Routine,
    Preference,
}

impl DetailType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interest => "interest",
            Self::Milestone => "milestone",
            Self::Routine => "routine",
            Self::Preference => "preference",
        }
    }
}

impl std::fmt::Display for DetailType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DetailType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interest" => Ok(Self::Interest),
            "milestone" => Ok(Self::Milestone),
            "routine" => Ok(Self::Routine),
            "preference" => Ok(Self::Preference),
            other => Err(format!(
                "unknown detail type '{other}' (expected interest, milestone, routine or preference)"
            )),
        }
    }
}

pub const MIN_IMPORTANCE: u8 = 1;
pub const MAX_IMPORTANCE: u8 = 10;
pub const DEFAULT_IMPORTANCE: u8 = 5;

/// A free-text fact about a child, exclusively owned by that child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildDetail {
    pub id: DetailId,
    pub child_id: ChildId,
    pub detail_type: DetailType,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// 1..=10
    pub importance: u8,
    pub recorded_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every update; the indexer records which revision it embedded.
    pub revision: u64,
    /// Vector-index entry currently holding this detail. `None` until indexed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_ref: Option<String>,
}

/// Input for creating a detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewChildDetail {
    pub child_id: ChildId,
    pub detail_type: DetailType,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_importance")]
    pub importance: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
}

fn default_importance() -> u8 {
    DEFAULT_IMPORTANCE
}

impl NewChildDetail {
    /// Materialise into a stored detail at revision 1.
    pub fn into_detail(self, now: DateTime<Utc>) -> ChildDetail {
        ChildDetail {
            id: DetailId::new(),
            child_id: self.child_id,
            detail_type: self.detail_type,
            content: self.content,
            tags: self.tags,
            importance: self.importance,
            recorded_at: self.recorded_at.unwrap_or(now),
            created_at: now,
            updated_at: now,
            revision: 1,
            embedding_ref: None,
        }
    }
}

/// Partial update of a detail; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChildDetailPatch {
    #[serde(default)]
    pub detail_type: Option<DetailType>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub importance: Option<u8>,
}

impl ChildDetailPatch {
    pub fn is_empty(&self) -> bool {
        self.detail_type.is_none()
            && self.content.is_none()
            && self.tags.is_none()
            && self.importance.is_none()
    }

    /// Apply to `detail`, bumping `revision` and `updated_at`.
    pub fn apply(self, detail: &mut ChildDetail, now: DateTime<Utc>) {
        if let Some(detail_type) = self.detail_type {
            detail.detail_type = detail_type;
        }
        if let Some(content) = self.content {
            detail.content = content;
        }
        if let Some(tags) = self.tags {
            detail.tags = tags;
        }
        if let Some(importance) = self.importance {
            detail.importance = importance;
        }
        detail.updated_at = now;
        detail.revision += 1;
    }
}
