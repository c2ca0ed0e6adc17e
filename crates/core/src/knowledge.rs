//! Shared knowledge corpus segments.
//!
//! Segments are produced by document ingestion already embedded. They are not
//! owned by any child and are visible to every query.

use serde::{Deserialize, Serialize};

/// Inclusive age range in months that a segment applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeRange {
    pub min_months: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_months: Option<u32>,
}

impl AgeRange {
    pub const ALL: AgeRange = AgeRange {
        min_months: 0,
        max_months: None,
    };

    pub fn contains(&self, months: u32) -> bool {
        months >= self.min_months && self.max_months.is_none_or(|max| months <= max)
    }
}

impl Default for AgeRange {
    fn default() -> Self {
        Self::ALL
    }
}

/// A chunk of expert or reference content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeSegment {
    pub id: String,
    pub content: String,
    pub category: String,
    #[serde(default)]
    pub age_range: AgeRange,
    pub topic: String,
    /// Where the segment came from (document title, URL...).
    pub source: String,
    #[serde(default)]
    pub expert_reviewed: bool,
    /// Precomputed embedding from the shared embedding model.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
}
