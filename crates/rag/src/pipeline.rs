//! The question-answering path.
//!
//! ```text
//! history.recent ─┐
//!                 ├─► cache ─(miss)─► compose ─► generate ─► finalize ─► store
//! assemble ───────┘                                                        │
//!                                                   history.append ◄───────┘
//! ```
//!
//! One [`CancelToken`] carrying the request deadline flows through every
//! stage. Generation failures and deadline expiry produce an apologetic
//! fallback answer instead of an error; only invalid input and scope
//! violations are returned as errors.

use crate::cache::{CacheStatus, CachedAnswer, ResponseCache};
use crate::context::{ContextAssembler, ContextBundle};
use crate::postprocess::PostProcessor;
use crate::prompt::PromptComposer;
use chrono::Utc;
use nestling_config::AppConfig;
use nestling_core::cancel::CancelToken;
use nestling_core::chat::{AppendOutcome, ChatHistoryStore, ChatTurn, SessionId};
use nestling_core::child::{ChildId, UserId};
use nestling_core::error::Error;
use nestling_core::provider::ProviderRequest;
use nestling_providers::GenerationClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const MAX_QUESTION_CHARS: usize = 4_000;

const FALLBACK_ANSWER: &str = "I'm sorry, I couldn't put together an answer right now. \
Please try again in a moment.";

/// A caregiver's question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub user_id: UserId,
    pub question: String,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub child_id: Option<ChildId>,
    /// Overrides the configured chat model.
    #[serde(default)]
    pub model: Option<String>,
    /// Client-chosen sequence of this turn within the session, starting at 1.
    /// Retrying a request with the same value records the turn once. When
    /// absent the history store allocates the next free sequence.
    #[serde(default)]
    pub turn_sequence: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatAnswer {
    pub answer: String,
    pub session_id: SessionId,
    pub citations: Vec<String>,
    pub model: String,
    pub cached: bool,
    /// Retrieval or another optional context source was unavailable.
    pub context_limited: bool,
    /// Generation failed and this is the apologetic stand-in.
    pub fallback: bool,
    /// Sequence the turn was recorded under; `None` when nothing was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_sequence: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub default_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub history_window: usize,
    pub request_deadline: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            default_model: config.provider.chat_model.clone(),
            temperature: config.generation.temperature,
            max_tokens: config.generation.max_tokens,
            history_window: config.context.history_window,
            request_deadline: config.generation.request_deadline(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

pub struct ChatPipeline {
    history: Arc<dyn ChatHistoryStore>,
    assembler: Arc<ContextAssembler>,
    composer: Arc<PromptComposer>,
    generator: Arc<GenerationClient>,
    post: Arc<PostProcessor>,
    cache: ResponseCache,
    settings: PipelineSettings,
}

impl ChatPipeline {
    pub fn new(
        history: Arc<dyn ChatHistoryStore>,
        assembler: Arc<ContextAssembler>,
        composer: PromptComposer,
        generator: Arc<GenerationClient>,
        post: PostProcessor,
        cache: ResponseCache,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            history,
            assembler,
            composer: Arc::new(composer),
            generator,
            post: Arc::new(post),
            cache,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Answer under the configured request deadline.
    pub async fn ask(&self, request: ChatRequest) -> Result<ChatAnswer, Error> {
        let token = CancelToken::with_timeout(self.settings.request_deadline);
        self.ask_with(request, &token).await
    }

    /// Answer under a caller-supplied token (deadline and cancellation).
    pub async fn ask_with(&self, request: ChatRequest, token: &CancelToken) -> Result<ChatAnswer, Error> {
        let question = validate_question(&request.question)?;
        if request.turn_sequence == Some(0) {
            return Err(Error::Validation("turn_sequence starts at 1".into()));
        }
        let session_id = request.session_id.clone().unwrap_or_else(SessionId::generate);
        let model = request
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.settings.default_model)
            .to_string();
        let started = Instant::now();

        let (history, context) = tokio::join!(
            self.recent_history(request.user_id, &session_id),
            self.assembler.assemble(request.child_id, request.user_id, &question, token),
        );
        let context = match context {
            Ok(context) => context,
            Err(e) if e.is_fatal_to_request() => return Err(e),
            Err(e) => {
                warn!(session_id = %session_id, "Context assembly interrupted: {e}");
                return Ok(self.fallback(session_id, model));
            }
        };
        let context_limited = context.degraded;

        let scope = ResponseCache::scope_for(request.child_id, request.user_id);
        let fingerprint = ResponseCache::fingerprint(&question, &scope, &context.digest(), &model);
        let compute = {
            let composer = self.composer.clone();
            let generator = self.generator.clone();
            let post = self.post.clone();
            // Shared with coalesced callers; each bounds its own wait below.
            let token = generation_token(token, self.settings.request_deadline);
            let question = question.clone();
            let model = model.clone();
            let temperature = self.settings.temperature;
            let max_tokens = self.settings.max_tokens;
            move || {
                generate_answer(
                    composer,
                    generator,
                    post,
                    context,
                    history,
                    question,
                    model,
                    temperature,
                    max_tokens,
                    token,
                )
            }
        };

        // A degraded context would cache an answer built without retrieval
        // under a digest that healthy requests can also produce.
        let outcome = if context_limited {
            token
                .run(async { compute().await.map(|a| (a, CacheStatus::Computed)).map_err(Arc::new) })
                .await
        } else {
            token.run(self.cache.get_or_compute(&fingerprint, &scope, compute)).await
        };

        let (answer, status) = match outcome {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                warn!(
                    session_id = %session_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Generation failed, returning fallback: {e}"
                );
                return Ok(self.fallback(session_id, model));
            }
            Err(interrupted) => {
                warn!(
                    session_id = %session_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Request {interrupted}, returning fallback"
                );
                return Ok(self.fallback(session_id, model));
            }
        };

        let turn_sequence = self.record_turn(&request, &session_id, &question, &answer).await;

        info!(
            session_id = %session_id,
            child_id = ?request.child_id,
            cache = ?status,
            citations = answer.citations.len(),
            context_limited,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Question answered"
        );

        Ok(ChatAnswer {
            answer: answer.answer,
            session_id,
            citations: answer.citations,
            model: answer.model,
            cached: status == CacheStatus::Hit,
            context_limited: context_limited || answer.context_limited,
            fallback: false,
            turn_sequence,
        })
    }

    async fn recent_history(&self, user_id: UserId, session_id: &SessionId) -> Vec<ChatTurn> {
        if self.settings.history_window == 0 {
            return Vec::new();
        }
        match self
            .history
            .recent(user_id, session_id, self.settings.history_window)
            .await
        {
            Ok(turns) => turns,
            Err(e) => {
                warn!(session_id = %session_id, "Chat history unavailable: {e}");
                Vec::new()
            }
        }
    }

    /// Append the turn under the caller's sequence, or the store's next one.
    /// Failures are logged; the answer is still returned.
    async fn record_turn(
        &self,
        request: &ChatRequest,
        session_id: &SessionId,
        question: &str,
        answer: &CachedAnswer,
    ) -> Option<u64> {
        let turn = ChatTurn {
            session_id: session_id.clone(),
            sequence: request.turn_sequence.unwrap_or(0),
            user_id: request.user_id,
            child_id: request.child_id,
            question: question.to_string(),
            answer: answer.answer.clone(),
            model: answer.model.clone(),
            sources: answer.citations.clone(),
            created_at: Utc::now(),
        };
        let recorded = match request.turn_sequence {
            Some(sequence) => self.history.append(turn).await.map(|outcome| {
                if outcome == AppendOutcome::Duplicate {
                    debug!(session_id = %session_id, sequence, "Chat turn already recorded");
                }
                sequence
            }),
            None => self.history.append_next(turn).await,
        };
        match recorded {
            Ok(sequence) => Some(sequence),
            Err(e) => {
                warn!(session_id = %session_id, "Chat turn not recorded: {e}");
                None
            }
        }
    }

    fn fallback(&self, session_id: SessionId, model: String) -> ChatAnswer {
        ChatAnswer {
            answer: self.post.finalize(FALLBACK_ANSWER).text,
            session_id,
            citations: Vec::new(),
            model,
            cached: false,
            context_limited: true,
            fallback: true,
            turn_sequence: None,
        }
    }
}

/// A token for work shared between callers: its own cancellation flag and a
/// deadline no shorter than the configured request deadline or the time the
/// starting caller has left.
fn generation_token(caller: &CancelToken, request_deadline: Duration) -> CancelToken {
    let budget = caller
        .remaining()
        .map_or(request_deadline, |left| left.max(request_deadline));
    CancelToken::with_timeout(budget)
}

#[allow(clippy::too_many_arguments)]
async fn generate_answer(
    composer: Arc<PromptComposer>,
    generator: Arc<GenerationClient>,
    post: Arc<PostProcessor>,
    context: ContextBundle,
    history: Vec<ChatTurn>,
    question: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    token: CancelToken,
) -> Result<CachedAnswer, Error> {
    let prompt = composer.compose(&context, &history, &question);
    let generation = generator
        .generate(
            ProviderRequest {
                model,
                messages: prompt.messages,
                temperature,
                max_tokens: Some(max_tokens),
            },
            &token,
        )
        .await?;

    let finalized = post.finalize(&generation.content);
    let mut citations = prompt.citations;
    for cited in generation.citations {
        if !citations.contains(&cited) {
            citations.push(cited);
        }
    }
    Ok(CachedAnswer {
        answer: finalized.text,
        citations,
        model: generation.model,
        context_limited: context.degraded,
    })
}

fn validate_question(question: &str) -> Result<String, Error> {
    let question = question.trim();
    if question.is_empty() {
        return Err(Error::Validation("question must not be empty".into()));
    }
    if question.chars().count() > MAX_QUESTION_CHARS {
        return Err(Error::Validation(format!(
            "question exceeds {MAX_QUESTION_CHARS} characters"
        )));
    }
    Ok(question.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AssemblySettings;
    use crate::indexer::DetailIndexer;
    use crate::retriever::Retriever;
    use crate::test_helpers::{FailingEmbedder, MockProvider, detail, profile};
    use chrono::NaiveDate;
    use nestling_config::SafetyConfig;
    use async_trait::async_trait;
    use nestling_core::chat::HistoryQuery;
    use nestling_core::child::DetailType;
    use nestling_core::error::StoreError;
    use nestling_core::embedding::Embedder;
    use nestling_core::error::ProviderError;
    use nestling_core::store::ChildDetailStore;
    use nestling_memory::{InMemoryCacheStore, InMemoryChatHistory, InMemoryChildStore, InMemoryVectorIndex};
    use nestling_providers::{HashEmbedder, RetryPolicy};

    struct Fixture {
        pipeline: ChatPipeline,
        provider: Arc<MockProvider>,
        store: InMemoryChildStore,
        history: InMemoryChatHistory,
        indexer: DetailIndexer,
        guardian: UserId,
        child: ChildId,
    }

    /// History whose writes take a while, like any I/O-backed store.
    struct SlowHistory {
        inner: InMemoryChatHistory,
        delay: Duration,
    }

    #[async_trait]
    impl ChatHistoryStore for SlowHistory {
        async fn recent(&self, user_id: UserId, session_id: &SessionId, limit: usize) -> Result<Vec<ChatTurn>, StoreError> {
            self.inner.recent(user_id, session_id, limit).await
        }

        async fn append(&self, turn: ChatTurn) -> Result<AppendOutcome, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.append(turn).await
        }

        async fn append_next(&self, turn: ChatTurn) -> Result<u64, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.append_next(turn).await
        }

        async fn for_child(&self, user_id: UserId, child_id: ChildId, limit: usize) -> Result<Vec<ChatTurn>, StoreError> {
            self.inner.for_child(user_id, child_id, limit).await
        }

        async fn list(&self, user_id: UserId, query: &HistoryQuery) -> Result<(Vec<ChatTurn>, usize), StoreError> {
            self.inner.list(user_id, query).await
        }

        async fn sessions(&self, user_id: UserId) -> Result<Vec<SessionId>, StoreError> {
            self.inner.sessions(user_id).await
        }
    }

    async fn fixture_with(provider: MockProvider, embedder: Arc<dyn Embedder>, deadline: Duration) -> Fixture {
        fixture_over(provider, embedder, deadline, Duration::ZERO).await
    }

    async fn fixture_over(
        provider: MockProvider,
        embedder: Arc<dyn Embedder>,
        deadline: Duration,
        write_delay: Duration,
    ) -> Fixture {
        let provider = Arc::new(provider);
        let index = Arc::new(InMemoryVectorIndex::new());
        let store = InMemoryChildStore::new();
        let history = InMemoryChatHistory::new();
        let guardian = UserId::new();
        let leo = profile(guardian, "Leo", NaiveDate::from_ymd_opt(2023, 6, 1).unwrap());
        let child = leo.id;
        store.put_profile(leo).await;

        let retriever = Arc::new(Retriever::new(embedder.clone(), index.clone(), Duration::from_secs(2)));
        let assembler = Arc::new(ContextAssembler::new(
            Arc::new(store.clone()),
            Arc::new(history.clone()),
            retriever,
            AssemblySettings::default(),
        ));
        let policy = RetryPolicy {
            max_retries: 2,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            attempt_timeout: Duration::from_secs(30),
        };
        let pipeline = ChatPipeline::new(
            Arc::new(SlowHistory {
                inner: history.clone(),
                delay: write_delay,
            }),
            assembler,
            PromptComposer::new(3_500),
            Arc::new(GenerationClient::new(provider.clone(), policy)),
            PostProcessor::from_config(&SafetyConfig::default()).unwrap(),
            ResponseCache::new(Arc::new(InMemoryCacheStore::new()), Duration::from_secs(3600)),
            PipelineSettings {
                request_deadline: deadline,
                ..Default::default()
            },
        );
        Fixture {
            pipeline,
            provider,
            indexer: DetailIndexer::new(embedder, index, Arc::new(store.clone())),
            store,
            history,
            guardian,
            child,
        }
    }

    async fn fixture(provider: MockProvider) -> Fixture {
        fixture_with(provider, Arc::new(HashEmbedder::default()), Duration::from_secs(30)).await
    }

    fn ask(f: &Fixture, question: &str) -> ChatRequest {
        ChatRequest {
            user_id: f.guardian,
            question: question.into(),
            session_id: Some(SessionId::from("session-1")),
            child_id: Some(f.child),
            model: None,
            turn_sequence: None,
        }
    }

    #[tokio::test]
    async fn answers_with_detail_context_and_records_turn() {
        let f = fixture(MockProvider::replying("Try wooden block sets.")).await;
        let d = detail(f.child, DetailType::Interest, "enjoys stacking blocks", 8);
        f.store.insert(d.clone()).await.unwrap();
        f.indexer.index(&d).await.unwrap();

        let answer = f.pipeline.ask(ask(&f, "What toys might my child enjoy?")).await.unwrap();
        assert!(answer.answer.starts_with("Try wooden block sets."));
        assert!(!answer.fallback);
        assert!(!answer.cached);
        assert_eq!(answer.citations, vec![d.id.to_string()]);
        assert!(f.provider.last_system_prompt().contains("enjoys stacking blocks"));

        let turns = f.history.recent(f.guardian, &SessionId::from("session-1"), 10).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].sequence, 1);
        assert_eq!(turns[0].question, "What toys might my child enjoy?");
    }

    #[tokio::test]
    async fn repeated_question_is_served_from_cache() {
        let f = fixture(MockProvider::replying("Read together.")).await;
        let first = f.pipeline.ask(ask(&f, "Bedtime ideas?")).await.unwrap();
        let second = f.pipeline.ask(ask(&f, "  bedtime   IDEAS? ")).await.unwrap();
        assert_eq!(f.provider.call_count(), 1);
        assert!(second.cached);
        assert_eq!(first.answer, second.answer);
    }

    #[tokio::test]
    async fn other_guardians_are_rejected_before_generation() {
        let f = fixture(MockProvider::replying("x")).await;
        let mut request = ask(&f, "How is Leo doing?");
        request.user_id = UserId::new();
        let err = f.pipeline.ask(request).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
        assert_eq!(f.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn empty_question_is_rejected() {
        let f = fixture(MockProvider::replying("x")).await;
        let err = f.pipeline.ask(ask(&f, "   ")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_yield_fallback() {
        let f = fixture(MockProvider::failing(ProviderError::ApiError {
            status_code: 503,
            message: "unavailable".into(),
        })).await;
        let answer = f.pipeline.ask(ask(&f, "Snack ideas?")).await.unwrap();
        assert!(answer.fallback);
        assert!(answer.answer.starts_with(FALLBACK_ANSWER));
        assert_eq!(f.provider.call_count(), 3);
        assert!(f.history.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cancels_generation() {
        let f = fixture_with(
            MockProvider::replying("too late").with_delay(Duration::from_secs(60)),
            Arc::new(HashEmbedder::default()),
            Duration::from_secs(5),
        )
        .await;
        let started = Instant::now();
        let answer = f.pipeline.ask(ask(&f, "Potty training tips?")).await.unwrap();
        assert!(answer.fallback);
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn retrieval_outage_still_answers() {
        let f = fixture_with(
            MockProvider::replying("General advice."),
            Arc::new(FailingEmbedder),
            Duration::from_secs(30),
        )
        .await;
        let answer = f.pipeline.ask(ask(&f, "Any tips?")).await.unwrap();
        assert!(!answer.fallback);
        assert!(answer.context_limited);
        assert_eq!(f.provider.call_count(), 1);
        assert!(f.provider.last_system_prompt().contains("[Child Profile]"));
    }

    #[tokio::test]
    async fn new_session_id_generated_and_sequence_advances() {
        let f = fixture(MockProvider::replying("ok")).await;
        let mut request = ask(&f, "First?");
        request.session_id = None;
        let first = f.pipeline.ask(request).await.unwrap();
        assert!(!first.session_id.as_str().is_empty());

        let mut follow_up = ask(&f, "Second?");
        follow_up.session_id = Some(first.session_id.clone());
        f.pipeline.ask(follow_up).await.unwrap();

        let turns = f.history.recent(f.guardian, &first.session_id, 10).await.unwrap();
        let sequences: Vec<u64> = turns.iter().map(|t| t.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        let last = f.provider.last_request().unwrap();
        assert_eq!(last.messages.len(), 4);
    }

    #[tokio::test]
    async fn concurrent_questions_in_one_session_are_both_recorded() {
        let f = fixture_over(
            MockProvider::replying("ok"),
            Arc::new(HashEmbedder::default()),
            Duration::from_secs(30),
            Duration::from_millis(5),
        )
        .await;
        let (a, b) = tokio::join!(
            f.pipeline.ask(ask(&f, "How do I handle tantrums?")),
            f.pipeline.ask(ask(&f, "When should naps stop?")),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(!a.fallback && !b.fallback);

        let turns = f.history.recent(f.guardian, &SessionId::from("session-1"), 10).await.unwrap();
        let sequences: Vec<u64> = turns.iter().map(|t| t.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        let mut reported = vec![a.turn_sequence.unwrap(), b.turn_sequence.unwrap()];
        reported.sort_unstable();
        assert_eq!(reported, vec![1, 2]);
    }

    #[tokio::test]
    async fn retried_turn_sequence_is_recorded_once() {
        let f = fixture(MockProvider::replying("Offer a choice of two.")).await;
        let mut request = ask(&f, "How do I handle tantrums?");
        request.turn_sequence = Some(1);

        let first = f.pipeline.ask(request.clone()).await.unwrap();
        let retry = f.pipeline.ask(request).await.unwrap();
        assert_eq!(first.turn_sequence, Some(1));
        assert_eq!(retry.turn_sequence, Some(1));
        assert_eq!(f.history.len().await, 1);

        let mut zero = ask(&f, "Anything?");
        zero.turn_sequence = Some(0);
        assert!(matches!(f.pipeline.ask(zero).await.unwrap_err(), Error::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn coalesced_caller_keeps_its_own_deadline() {
        let f = fixture(MockProvider::replying("Keep routines steady.").with_delay(Duration::from_secs(3))).await;
        let short = CancelToken::with_timeout(Duration::from_secs(1));
        let long = CancelToken::with_timeout(Duration::from_secs(30));

        let (hurried, patient) = tokio::join!(
            f.pipeline.ask_with(ask(&f, "Sleep regression tips?"), &short),
            f.pipeline.ask_with(ask(&f, "Sleep regression tips?"), &long),
        );
        assert!(hurried.unwrap().fallback);
        let patient = patient.unwrap();
        assert!(!patient.fallback);
        assert!(patient.answer.starts_with("Keep routines steady."));
        assert_eq!(f.provider.call_count(), 1);
    }

    #[test]
    fn question_validation() {
        assert_eq!(validate_question("  hi ").unwrap(), "hi");
        assert!(validate_question(&"a".repeat(MAX_QUESTION_CHARS + 1)).is_err());
    }
}
