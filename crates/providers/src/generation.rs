//! Generation client: one language-model call with bounded retry.
//!
//! Each attempt runs under `min(attempt_timeout, time left on the request
//! token)` and inside [`CancelToken::run`], so an expired or cancelled request
//! drops the in-flight HTTP future instead of waiting for it. Transient
//! failures (timeouts, network, 5xx, rate limits) are retried with exponential
//! backoff; everything else propagates on the first failure.

use nestling_config::GenerationConfig;
use nestling_core::cancel::CancelToken;
use nestling_core::error::{Error, ProviderError};
use nestling_core::provider::{Provider, ProviderRequest, Usage};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Retry and timeout settings for generation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(4),
            attempt_timeout: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.backoff_base_ms),
            max_backoff: Duration::from_millis(config.backoff_max_ms),
            attempt_timeout: config.attempt_timeout(),
        }
    }

    /// Delay before retry number `attempt + 1`.
    ///
    /// `base * 2^attempt`, raised to the provider's retry-after hint on rate
    /// limiting, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32, error: &ProviderError) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt));
        let hinted = match error {
            ProviderError::RateLimited { retry_after_secs } => {
                exp.max(Duration::from_secs(*retry_after_secs))
            }
            _ => exp,
        };
        hinted.min(self.max_backoff)
    }
}

/// A successful generation.
#[derive(Debug, Clone)]
pub struct Generation {
    pub content: String,
    /// Citations reported by the model itself.
    pub citations: Vec<String>,
    pub model: String,
    pub usage: Option<Usage>,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

pub struct GenerationClient {
    provider: Arc<dyn Provider>,
    policy: RetryPolicy,
}

impl GenerationClient {
    pub fn new(provider: Arc<dyn Provider>, policy: RetryPolicy) -> Self {
        Self { provider, policy }
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Generate under a fresh deadline of `timeout`.
    pub async fn generate_within(
        &self,
        request: ProviderRequest,
        timeout: Duration,
    ) -> Result<Generation, Error> {
        self.generate(request, &CancelToken::with_timeout(timeout)).await
    }

    /// Generate an answer, honouring the token's cancellation and deadline.
    pub async fn generate(
        &self,
        request: ProviderRequest,
        token: &CancelToken,
    ) -> Result<Generation, Error> {
        let provider = self.provider.name().to_string();
        let mut attempt: u32 = 0;

        loop {
            token.check()?;

            let budget = match token.remaining() {
                Some(left) => left.min(self.policy.attempt_timeout),
                None => self.policy.attempt_timeout,
            };
            let started = Instant::now();

            debug!(
                provider = %provider,
                model = %request.model,
                attempt = attempt + 1,
                budget_ms = budget.as_millis() as u64,
                "Generation attempt"
            );

            let outcome = token
                .run(tokio::time::timeout(budget, self.provider.complete(request.clone())))
                .await?;

            let error = match outcome {
                Ok(Ok(response)) => {
                    info!(
                        provider = %provider,
                        model = %response.model,
                        attempt = attempt + 1,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Generation succeeded"
                    );
                    return Ok(Generation {
                        content: response.content,
                        citations: response.citations,
                        model: response.model,
                        usage: response.usage,
                        attempts: attempt + 1,
                    });
                }
                Ok(Err(e)) => e,
                Err(_) => ProviderError::Timeout(format!(
                    "provider '{provider}' did not answer within {}ms",
                    budget.as_millis()
                )),
            };

            if !error.is_retryable() {
                warn!(provider = %provider, error = %error, "Generation failed, not retryable");
                return Err(error.into());
            }
            if attempt >= self.policy.max_retries {
                warn!(
                    provider = %provider,
                    attempts = attempt + 1,
                    error = %error,
                    "Generation failed, retries exhausted"
                );
                return Err(error.into());
            }

            let delay = self.policy.backoff(attempt, &error);
            warn!(
                provider = %provider,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Generation failed, retrying"
            );
            token.sleep(delay).await?;
            attempt += 1;
        }
    }
}
