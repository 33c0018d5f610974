//! Rate-limited, retried judge calls.
//!
//! Every backend request in a run goes through a [`RateLimitedCaller`]. All
//! callers share one [`ConcurrencyLimit`], so the number of requests in
//! flight never exceeds `concurrency_limit` however many records and judges
//! run concurrently.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use labelwise_core::{JudgeResponse, Label, PromptView, RetryPolicy};

use crate::cache::{ResponseCache, ResponseKey};
use crate::providers::{BackendError, JudgeBackend};
use crate::resilience::{CircuitBreaker, CircuitCheck, UsageTracker};
use crate::retry::{with_retry, RetryOutcome};

/// Shared pool of request permits.
///
/// A permit is held for exactly one backend attempt and released when it is
/// dropped, including when the attempt future is cancelled.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimit {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyLimit {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BackendError> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BackendError::NotConfigured("concurrency limit closed".to_string()))
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Calls one backend under the shared permit pool, with timeout, retry,
/// and optional breaker, cache and usage accounting.
///
/// Breaker state and cache entries are keyed by [`RateLimitedCaller::instance`],
/// so two judges never share health or answers even when their backends
/// report the same name.
pub struct RateLimitedCaller {
    scope: String,
    instance: String,
    backend: Arc<dyn JudgeBackend>,
    limit: ConcurrencyLimit,
    policy: Arc<RetryPolicy>,
    call_timeout: Duration,
    breaker: Option<Arc<CircuitBreaker>>,
    cache: Option<Arc<ResponseCache>>,
    usage: Option<Arc<UsageTracker>>,
}

impl RateLimitedCaller {
    /// `scope` names the caller in logs and usage reports, usually the judge id.
    pub fn new(
        scope: impl Into<String>,
        backend: Arc<dyn JudgeBackend>,
        limit: ConcurrencyLimit,
        policy: Arc<RetryPolicy>,
        call_timeout: Duration,
    ) -> Self {
        let scope = scope.into();
        let instance = format!("{}:{}", scope, backend.name());
        Self {
            scope,
            instance,
            backend,
            limit,
            policy,
            call_timeout,
            breaker: None,
            cache: None,
            usage: None,
        }
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_usage(mut self, usage: Arc<UsageTracker>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Key of this caller's backend instance: `<scope>:<backend name>`.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    fn check_breaker(&self) -> Result<(), BackendError> {
        match &self.breaker {
            Some(breaker) => match breaker.check(&self.instance) {
                CircuitCheck::Reject { reason } => Err(BackendError::Halted {
                    backend: self.backend.name().to_string(),
                    reason,
                }),
                CircuitCheck::Allow => Ok(()),
            },
            None => Ok(()),
        }
    }

    /// Send `view` to the backend until it answers, fails fatally, or the
    /// retry policy gives up.
    pub async fn call(&self, view: &PromptView) -> RetryOutcome<JudgeResponse> {
        let instance = self.instance.as_str();

        if let Err(halted) = self.check_breaker() {
            tracing::debug!(judge = %self.scope, instance, error = %halted, "Call rejected by circuit breaker");
            if let Some(usage) = &self.usage {
                usage.record_failure(&self.scope, 0);
            }
            return RetryOutcome::Exhausted {
                last_error: halted,
                attempts: 0,
            };
        }

        let key = self.cache.as_ref().map(|_| ResponseKey::new(instance, view));
        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(response) = cache.get(key).await {
                tracing::trace!(judge = %self.scope, record_id = %view.record_id, "Cache hit");
                if let Some(usage) = &self.usage {
                    usage.record_cache_hit(&self.scope);
                }
                return RetryOutcome::Success {
                    value: response,
                    attempts: 0,
                };
            }
        }

        let outcome = with_retry(&self.policy, |attempt| self.attempt(view, attempt)).await;

        match &outcome {
            RetryOutcome::Success { value, attempts } => {
                if let Some(breaker) = &self.breaker {
                    breaker.record_success(instance);
                }
                if let (Some(cache), Some(key)) = (&self.cache, key) {
                    cache.insert(key, value.clone()).await;
                }
                if let Some(usage) = &self.usage {
                    usage.record_success(&self.scope, *attempts, &value.usage);
                }
            }
            RetryOutcome::Exhausted { attempts, .. } => {
                if let Some(breaker) = &self.breaker {
                    breaker.record_failure(instance);
                }
                if let Some(usage) = &self.usage {
                    usage.record_failure(&self.scope, *attempts);
                }
            }
            RetryOutcome::Fatal { error, attempts } => {
                if let Some(breaker) = &self.breaker {
                    breaker.trip(instance, error.to_string());
                }
                if let Some(usage) = &self.usage {
                    usage.record_failure(&self.scope, *attempts);
                }
            }
        }

        outcome
    }

    /// Ask the backend to explain `label` for `view`.
    ///
    /// Uses the permit pool, timeout and retry policy of [`call`](Self::call)
    /// but never the cache, and never moves the breaker: a failed explanation
    /// leaves the classification path untouched.
    pub async fn explain(&self, view: &PromptView, label: Label) -> Result<Option<String>, BackendError> {
        self.check_breaker()?;

        let outcome = with_retry(&self.policy, |attempt| async move {
            let _permit = self.limit.acquire().await?;
            tracing::trace!(judge = %self.scope, record_id = %view.record_id, attempt, "Requesting rationale");
            match tokio::time::timeout(self.call_timeout, self.backend.explain(view, label)).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout(self.call_timeout)),
            }
        })
        .await;

        match outcome {
            RetryOutcome::Success { value, attempts } => {
                if let Some(usage) = &self.usage {
                    usage.record_rationale(&self.scope, attempts, value.is_some());
                }
                Ok(value)
            }
            RetryOutcome::Exhausted {
                last_error: error,
                attempts,
            }
            | RetryOutcome::Fatal { error, attempts } => {
                if let Some(usage) = &self.usage {
                    usage.record_rationale(&self.scope, attempts, false);
                }
                Err(error)
            }
        }
    }

    async fn attempt(&self, view: &PromptView, attempt: u32) -> Result<JudgeResponse, BackendError> {
        let _permit = self.limit.acquire().await?;
        tracing::trace!(judge = %self.scope, record_id = %view.record_id, attempt, "Invoking backend");

        match tokio::time::timeout(self.call_timeout, self.backend.invoke(view)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(self.call_timeout)),
        }
    }
}

impl std::fmt::Debug for RateLimitedCaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedCaller")
            .field("scope", &self.scope)
            .field("instance", &self.instance)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}
