//! Shared fakes for the pipeline tests.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use nestling_core::child::{ChildDetail, ChildId, ChildProfile, DetailType, NewChildDetail, UserId};
use nestling_core::embedding::Embedder;
use nestling_core::error::{IndexError, ProviderError};
use nestling_core::message::Role;
use nestling_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use std::sync::Mutex;
use std::time::Duration;

pub fn detail(child_id: ChildId, detail_type: DetailType, content: &str, importance: u8) -> ChildDetail {
    NewChildDetail {
        child_id,
        detail_type,
        content: content.into(),
        tags: vec![],
        importance,
        recorded_at: None,
    }
    .into_detail(Utc::now())
}

pub fn profile(guardian_id: UserId, name: &str, birthdate: NaiveDate) -> ChildProfile {
    ChildProfile {
        id: ChildId::new(),
        name: name.into(),
        birthdate,
        gender: None,
        guardian_id,
    }
}

pub fn text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        content: text.into(),
        citations: vec![],
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock-model".into(),
    }
}

/// Answers every call with `reply`, optionally after a delay, and counts calls.
pub struct MockProvider {
    reply: String,
    delay: Duration,
    failure: Option<ProviderError>,
    call_count: Mutex<usize>,
    last_request: Mutex<Option<ProviderRequest>>,
}

impl MockProvider {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: reply.into(),
            delay: Duration::ZERO,
            failure: None,
            call_count: Mutex::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn failing(error: ProviderError) -> Self {
        Self {
            failure: Some(error),
            ..Self::replying("")
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }

    pub fn last_request(&self) -> Option<ProviderRequest> {
        self.last_request.lock().unwrap().clone()
    }

    /// The system message of the most recent request.
    pub fn last_system_prompt(&self) -> String {
        self.last_request()
            .and_then(|r| r.messages.into_iter().find(|m| m.role == Role::System))
            .map(|m| m.content)
            .unwrap_or_default()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        *self.call_count.lock().unwrap() += 1;
        *self.last_request.lock().unwrap() = Some(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.failure {
            Some(e) => Err(e.clone()),
            None => Ok(text_response(&self.reply)),
        }
    }
}

/// An embedding service that is always down.
pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    fn model(&self) -> &str {
        "failing"
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
        Err(IndexError::Unavailable("embedding service down".into()))
    }
}

/// An embedding service that never answers.
pub struct HangingEmbedder;

#[async_trait]
impl Embedder for HangingEmbedder {
    fn model(&self) -> &str {
        "hanging"
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
        std::future::pending().await
    }
}
