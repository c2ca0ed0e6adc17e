//! Per-question context assembly.
//!
//! Gathers five layers, in priority order:
//!
//! | Layer | Source | Trim Strategy |
//! |-------|--------|---------------|
//! | 1. Profile | Child directory | Never trimmed |
//! | 2. Details | Retriever (child scope) | Lowest importance dropped first |
//! | 3. Knowledge | Retriever (shared) | Lowest similarity dropped first |
//! | 4. Records | Child directory | Oldest dropped first |
//! | 5. Prior Q&A | Chat history | Least relevant dropped first |
//!
//! Assembly only reads. Optional sources that fail are logged and left out;
//! only the guardian check can reject a request.
//!
//! # Determinism
//!
//! Rendering depends only on item content and ids, never on scores or the
//! clock, so identical inputs yield a byte-identical digest.

use crate::access::authorize_child;
use crate::context::token;
use crate::retriever::Retriever;
use chrono::{DateTime, Duration, Utc};
use nestling_config::{ContextConfig, RetrievalConfig};
use nestling_core::cancel::CancelToken;
use nestling_core::chat::ChatHistoryStore;
use nestling_core::child::{ChildId, ChildProfile, GrowthRecord, UserId};
use nestling_core::error::Error;
use nestling_core::store::ChildDirectory;
use nestling_core::vector::{EntryMetadata, ScoredEntry};
use nestling_providers::hash_embedder::tokenize;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

// ── Types ─────────────────────────────────────────────────────────────────

/// Context sections, declared from highest to lowest priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Profile,
    Details,
    Knowledge,
    Records,
    PriorQa,
}

impl SectionKind {
    pub const BY_PRIORITY: [SectionKind; 5] = [
        Self::Profile,
        Self::Details,
        Self::Knowledge,
        Self::Records,
        Self::PriorQa,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Details => "details",
            Self::Knowledge => "knowledge",
            Self::Records => "records",
            Self::PriorQa => "prior_qa",
        }
    }

    fn header(&self) -> &'static str {
        match self {
            Self::Profile => "[Child Profile]\n",
            Self::Details => "[What We Know About This Child]\n",
            Self::Knowledge => "[Parenting Knowledge]\n",
            Self::Records => "[Recent Growth Records]\n",
            Self::PriorQa => "[Related Earlier Questions]\n",
        }
    }
}

/// Static facts about the child, computed at assembly time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSnippet {
    pub name: String,
    pub age_days: i64,
    pub age_months: u32,
    pub age_years: u32,
    pub gender: Option<String>,
}

impl ProfileSnippet {
    pub fn from_profile(profile: &ChildProfile, today: chrono::NaiveDate) -> Self {
        Self {
            name: profile.name.clone(),
            age_days: profile.age_days(today),
            age_months: profile.age_months(today),
            age_years: profile.age_years(today),
            gender: profile.gender.clone(),
        }
    }

    fn render(&self) -> String {
        let mut out = format!(
            "Name: {}\nAge: {} years ({} months, {} days)\n",
            self.name, self.age_years, self.age_months, self.age_days
        );
        if let Some(gender) = &self.gender {
            out.push_str(&format!("Gender: {gender}\n"));
        }
        out
    }
}

/// A retrieved document (detail or knowledge segment) placed in context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub document_id: String,
    pub text: String,
    pub score: f32,
    pub importance: u8,
}

impl ContextItem {
    fn from_hit(hit: ScoredEntry) -> Self {
        Self {
            document_id: hit.metadata.document_id(),
            importance: hit.metadata.importance(),
            score: hit.score,
            text: hit.document,
        }
    }

    fn render(&self) -> String {
        let flat: Vec<&str> = self.text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        format!("- [{}] {}\n", self.document_id, flat.join(" | "))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordLine {
    pub category: String,
    pub value: serde_json::Value,
    pub notes: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl RecordLine {
    fn from_record(record: GrowthRecord) -> Self {
        Self {
            category: record.category,
            value: record.value,
            notes: record.notes,
            recorded_at: record.recorded_at,
        }
    }

    fn render(&self) -> String {
        let value = match &self.value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let mut line = format!(
            "- {} {}: {}",
            self.recorded_at.format("%Y-%m-%d"),
            self.category,
            value
        );
        if let Some(notes) = self.notes.as_deref().filter(|n| !n.trim().is_empty()) {
            line.push_str(&format!(" ({})", notes.trim()));
        }
        line.push('\n');
        line
    }
}

/// An earlier exchange judged relevant to the current question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorExchange {
    pub question: String,
    pub answer: String,
    pub relevance: f32,
}

impl PriorExchange {
    fn render(&self) -> String {
        format!("Q: {}\nA: {}\n", self.question.trim(), self.answer.trim())
    }
}

/// Statistics for a single context layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerStats {
    pub layer: SectionKind,
    pub tokens: usize,
    pub items_included: usize,
    pub items_total: usize,
}

/// Items dropped from a layer during budget enforcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropInfo {
    pub layer: SectionKind,
    pub items_dropped: usize,
    pub tokens_dropped: usize,
}

/// One rendered section of a bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub kind: SectionKind,
    pub text: String,
}

/// The assembled, budget-trimmed context for one question.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub child_id: Option<ChildId>,
    pub profile: Option<ProfileSnippet>,
    pub details: Vec<ContextItem>,
    pub knowledge: Vec<ContextItem>,
    pub records: Vec<RecordLine>,
    pub prior_qa: Vec<PriorExchange>,
    /// An optional source failed or timed out.
    pub degraded: bool,
    pub stats: Vec<LayerStats>,
    pub drops: Vec<DropInfo>,
}

impl ContextBundle {
    /// Non-empty sections in priority order.
    pub fn sections(&self) -> Vec<Section> {
        SectionKind::BY_PRIORITY
            .iter()
            .filter_map(|&kind| {
                let lines: Vec<String> = match kind {
                    SectionKind::Profile => self.profile.iter().map(ProfileSnippet::render).collect(),
                    SectionKind::Details => self.details.iter().map(ContextItem::render).collect(),
                    SectionKind::Knowledge => self.knowledge.iter().map(ContextItem::render).collect(),
                    SectionKind::Records => self.records.iter().map(RecordLine::render).collect(),
                    SectionKind::PriorQa => self.prior_qa.iter().map(PriorExchange::render).collect(),
                };
                (!lines.is_empty()).then(|| Section {
                    kind,
                    text: format!("{}{}", kind.header(), lines.concat()),
                })
            })
            .collect()
    }

    pub fn render(&self) -> String {
        self.sections()
            .into_iter()
            .map(|s| s.text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Stable digest of the rendered context, used in cache fingerprints.
    ///
    /// Prior Q&A is conversational, like the history window, and is left
    /// out so that asking the same thing twice can hit the cache.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for section in self.sections().iter().filter(|s| s.kind != SectionKind::PriorQa) {
            hasher.update(section.text.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    /// Document ids of every detail and knowledge item in the bundle.
    pub fn citations(&self) -> Vec<String> {
        self.details
            .iter()
            .chain(&self.knowledge)
            .map(|i| i.document_id.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sections().is_empty()
    }
}

/// Assembly knobs, normally taken from the `retrieval` and `context` config
/// sections.
#[derive(Debug, Clone)]
pub struct AssemblySettings {
    pub k_details: usize,
    pub k_knowledge: usize,
    pub records_window: usize,
    pub records_lookback: Duration,
    pub prior_qa_window: usize,
    pub prior_qa_scan: usize,
    pub max_context_tokens: usize,
}

impl AssemblySettings {
    pub fn from_config(retrieval: &RetrievalConfig, context: &ContextConfig) -> Self {
        Self {
            k_details: retrieval.k_details,
            k_knowledge: retrieval.k_knowledge,
            records_window: context.records_window,
            records_lookback: Duration::days(context.records_lookback_days),
            prior_qa_window: context.prior_qa_window,
            prior_qa_scan: context.prior_qa_scan,
            max_context_tokens: context.max_context_tokens,
        }
    }
}

impl Default for AssemblySettings {
    fn default() -> Self {
        Self::from_config(&RetrievalConfig::default(), &ContextConfig::default())
    }
}

// ── Assembler ─────────────────────────────────────────────────────────────

pub struct ContextAssembler {
    directory: Arc<dyn ChildDirectory>,
    history: Arc<dyn ChatHistoryStore>,
    retriever: Arc<Retriever>,
    settings: AssemblySettings,
}

impl ContextAssembler {
    pub fn new(
        directory: Arc<dyn ChildDirectory>,
        history: Arc<dyn ChatHistoryStore>,
        retriever: Arc<Retriever>,
        settings: AssemblySettings,
    ) -> Self {
        Self {
            directory,
            history,
            retriever,
            settings,
        }
    }

    pub fn directory(&self) -> &Arc<dyn ChildDirectory> {
        &self.directory
    }

    /// Build the context for `question`.
    ///
    /// With a child, the caller must be its guardian (`Unauthorized`
    /// otherwise, `NotFound` for an unknown child); both are checked before
    /// any retrieval starts. Without a child only shared knowledge is used.
    pub async fn assemble(
        &self,
        child_id: Option<ChildId>,
        user_id: UserId,
        question: &str,
        token: &CancelToken,
    ) -> Result<ContextBundle, Error> {
        token.check()?;
        let profile = match child_id {
            Some(id) => Some(authorize_child(self.directory.as_ref(), id, user_id).await?),
            None => None,
        };
        let today = Utc::now().date_naive();
        let age_months = profile.as_ref().map(|p| p.age_months(today));

        let (retrieved, (records, records_ok), (prior_qa, prior_ok)) = tokio::join!(
            self.retriever.retrieve(
                child_id,
                question,
                self.settings.k_details,
                self.settings.k_knowledge,
                token,
            ),
            self.recent_records(child_id),
            self.prior_exchanges(child_id, user_id, question),
        );

        let mut details: Vec<ContextItem> = retrieved.details.into_iter().map(ContextItem::from_hit).collect();
        // Stable sort keeps similarity order among equal importance.
        details.sort_by(|a, b| b.importance.cmp(&a.importance));

        let knowledge: Vec<ContextItem> = retrieved
            .knowledge
            .into_iter()
            .filter(|hit| match (&hit.metadata, age_months) {
                (EntryMetadata::SharedKnowledge { age_range, .. }, Some(months)) => age_range.contains(months),
                _ => true,
            })
            .map(ContextItem::from_hit)
            .collect();

        let mut bundle = self.fit(
            child_id,
            profile.map(|p| ProfileSnippet::from_profile(&p, today)),
            details,
            knowledge,
            records,
            prior_qa,
        );
        bundle.degraded = retrieved.degraded || !records_ok || !prior_ok;

        debug!(
            child_id = ?child_id,
            details = bundle.details.len(),
            knowledge = bundle.knowledge.len(),
            records = bundle.records.len(),
            prior_qa = bundle.prior_qa.len(),
            drops = bundle.drops.len(),
            degraded = bundle.degraded,
            "Context assembled"
        );
        Ok(bundle)
    }

    async fn recent_records(&self, child_id: Option<ChildId>) -> (Vec<RecordLine>, bool) {
        let Some(child_id) = child_id else {
            return (Vec::new(), true);
        };
        if self.settings.records_window == 0 {
            return (Vec::new(), true);
        }
        let since = Utc::now() - self.settings.records_lookback;
        match self
            .directory
            .recent_records(child_id, since, self.settings.records_window)
            .await
        {
            Ok(records) => (records.into_iter().map(RecordLine::from_record).collect(), true),
            Err(e) => {
                warn!(child_id = %child_id, "Growth records unavailable: {e}");
                (Vec::new(), false)
            }
        }
    }

    /// Earlier exchanges about the same child, ranked by token overlap with
    /// the current question.
    async fn prior_exchanges(
        &self,
        child_id: Option<ChildId>,
        user_id: UserId,
        question: &str,
    ) -> (Vec<PriorExchange>, bool) {
        let Some(child_id) = child_id else {
            return (Vec::new(), true);
        };
        if self.settings.prior_qa_window == 0 {
            return (Vec::new(), true);
        }
        let turns = match self
            .history
            .for_child(user_id, child_id, self.settings.prior_qa_scan)
            .await
        {
            Ok(turns) => turns,
            Err(e) => {
                warn!(child_id = %child_id, "Prior Q&A unavailable: {e}");
                return (Vec::new(), false);
            }
        };

        let asked: HashSet<String> = tokenize(question).collect();
        // `for_child` is newest first; the stable sort keeps that as tie-break.
        let mut scored: Vec<PriorExchange> = turns
            .into_iter()
            .filter(|t| !t.answer.trim().is_empty())
            .filter_map(|t| {
                let relevance = jaccard(&asked, &tokenize(&t.question).collect());
                (relevance > 0.0).then_some(PriorExchange {
                    question: t.question,
                    answer: t.answer,
                    relevance,
                })
            })
            .collect();
        scored.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
        scored.truncate(self.settings.prior_qa_window);
        (scored, true)
    }

    /// Fill the token budget in priority order, dropping from the tail of
    /// each lower-priority layer first.
    fn fit(
        &self,
        child_id: Option<ChildId>,
        profile: Option<ProfileSnippet>,
        details: Vec<ContextItem>,
        knowledge: Vec<ContextItem>,
        records: Vec<RecordLine>,
        prior_qa: Vec<PriorExchange>,
    ) -> ContextBundle {
        let mut remaining = self.settings.max_context_tokens;
        let mut stats = Vec::new();
        let mut drops = Vec::new();

        // Profile is always kept.
        if let Some(p) = &profile {
            let tokens = token::estimate_tokens(SectionKind::Profile.header())
                + token::estimate_tokens(&p.render());
            remaining = remaining.saturating_sub(tokens);
            stats.push(LayerStats {
                layer: SectionKind::Profile,
                tokens,
                items_included: 1,
                items_total: 1,
            });
        }

        let details = fill_layer(SectionKind::Details, details, ContextItem::render, &mut remaining, &mut stats, &mut drops);
        let knowledge = fill_layer(SectionKind::Knowledge, knowledge, ContextItem::render, &mut remaining, &mut stats, &mut drops);
        let records = fill_layer(SectionKind::Records, records, RecordLine::render, &mut remaining, &mut stats, &mut drops);
        let prior_qa = fill_layer(SectionKind::PriorQa, prior_qa, PriorExchange::render, &mut remaining, &mut stats, &mut drops);

        ContextBundle {
            child_id,
            profile,
            details,
            knowledge,
            records,
            prior_qa,
            degraded: false,
            stats,
            drops,
        }
    }
}

fn fill_layer<T>(
    layer: SectionKind,
    items: Vec<T>,
    render: impl Fn(&T) -> String,
    remaining: &mut usize,
    stats: &mut Vec<LayerStats>,
    drops: &mut Vec<DropInfo>,
) -> Vec<T> {
    if items.is_empty() {
        return items;
    }
    let total = items.len();
    let header_tokens = token::estimate_tokens(layer.header());
    let mut used = header_tokens;
    let mut kept = Vec::new();
    let mut dropped_tokens = 0;

    for item in items {
        let tokens = token::estimate_tokens(&render(&item));
        // Once an item misses, everything after it (lower priority) goes too.
        if dropped_tokens == 0 && used + tokens <= *remaining {
            used += tokens;
            kept.push(item);
        } else {
            dropped_tokens += tokens;
        }
    }

    let used = if kept.is_empty() { 0 } else { used };
    *remaining = remaining.saturating_sub(used);
    stats.push(LayerStats {
        layer,
        tokens: used,
        items_included: kept.len(),
        items_total: total,
    });
    if kept.len() < total {
        drops.push(DropInfo {
            layer,
            items_dropped: total - kept.len(),
            tokens_dropped: dropped_tokens,
        });
    }
    kept
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    shared as f32 / (a.len() + b.len() - shared) as f32
}
