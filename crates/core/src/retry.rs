//! Retry and fallback-model policy around the [`Dispatcher`].
//!
//! Two failure classes are kept apart: transient failures are retried on the
//! primary model with linear backoff, while a model that is no longer served
//! is swapped for the fallback model right away. Whatever happens, the
//! fallback model gets exactly one attempt, so a call makes at most
//! `max_retries + 1` requests, one at a time.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    chat::{ChatMessage, Sampling},
    config::DecisionConfig,
    dispatch::{Dispatcher, HttpBackend},
    error::{AvionError, ErrorClass, Result},
};

/// Source of backoff delays. Swapped for a recording fake in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts on the primary model (at least one).
    pub max_retries: u32,
    /// Base of the linear backoff.
    pub retry_delay: Duration,
    /// Upper bound for a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DecisionConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &DecisionConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            retry_delay: cfg.retry_delay(),
            attempt_timeout: cfg.request_timeout(),
        }
    }

    pub fn primary_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Delay before primary attempt `attempt` (1-indexed): `retry_delay * (attempt - 1)`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.retry_delay * attempt.saturating_sub(1)
    }
}

/// Where the state machine stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// n-th attempt on the primary model.
    Attempt(u32),
    /// The single attempt on the fallback model.
    FallbackModel,
}

#[derive(Clone)]
pub struct RetryingDispatcher {
    dispatcher: Dispatcher,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryingDispatcher {
    pub fn new(dispatcher: Dispatcher, policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            dispatcher,
            policy,
            sleeper,
        }
    }

    /// HTTP backend for the configured mode, real sleeps.
    pub fn from_config(cfg: &DecisionConfig) -> Result<Self> {
        let backend = HttpBackend::from_config(cfg)?;
        Ok(Self::new(
            Dispatcher::new(Arc::new(backend), &cfg.model, &cfg.fallback_model),
            RetryPolicy::from_config(cfg),
            Arc::new(TokioSleeper),
        ))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn execute(&self, messages: &[ChatMessage], sampling: Sampling) -> Result<String> {
        let mut phase = Phase::Attempt(1);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let use_fallback = phase == Phase::FallbackModel;
            let model = self.dispatcher.model_for(use_fallback);

            let err = match self.attempt(messages, sampling, use_fallback).await {
                Ok(text) => {
                    debug!(attempts, model = %model, "upstream answered");
                    return Ok(text);
                }
                Err(err) => err,
            };
            warn!(attempt = attempts, model = %model, error = %err, "upstream attempt failed");

            phase = match (phase, err.class()) {
                (_, ErrorClass::Config) => return Err(err),
                (Phase::FallbackModel, _) => {
                    return Err(AvionError::Exhausted {
                        attempts,
                        last: err.to_string(),
                    })
                }
                (Phase::Attempt(_), ErrorClass::ModelUnavailable) => {
                    warn!(
                        model = %model,
                        fallback = %self.dispatcher.model_for(true),
                        "model decommissioned, switching to fallback model"
                    );
                    Phase::FallbackModel
                }
                (Phase::Attempt(n), _) if n < self.policy.primary_attempts() => {
                    self.sleeper.sleep(self.policy.delay_before(n + 1)).await;
                    Phase::Attempt(n + 1)
                }
                (Phase::Attempt(_), _) => {
                    warn!(fallback = %self.dispatcher.model_for(true), "retries exhausted, trying fallback model as last resort");
                    Phase::FallbackModel
                }
            };
        }
    }

    async fn attempt(
        &self,
        messages: &[ChatMessage],
        sampling: Sampling,
        use_fallback: bool,
    ) -> Result<String> {
        let timeout = self.policy.attempt_timeout;
        match tokio::time::timeout(
            timeout,
            self.dispatcher.dispatch(messages, sampling, use_fallback),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AvionError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{RecordingSleeper, Reply, ScriptedBackend};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_delay: Duration::from_millis(1000),
            attempt_timeout: Duration::from_secs(30),
        }
    }

    fn harness(
        backend: ScriptedBackend,
        policy: RetryPolicy,
    ) -> (RetryingDispatcher, Arc<ScriptedBackend>, Arc<RecordingSleeper>) {
        let backend = Arc::new(backend);
        let sleeper = Arc::new(RecordingSleeper::new());
        let dispatcher = Dispatcher::new(backend.clone(), "primary", "backup");
        (
            RetryingDispatcher::new(dispatcher, policy, sleeper.clone()),
            backend,
            sleeper,
        )
    }

    fn messages() -> Vec<ChatMessage> {
        vec![ChatMessage::system("json only"), ChatMessage::user("go")]
    }

    #[test]
    fn linear_backoff_delays() {
        let p = policy(3);
        assert_eq!(p.delay_before(1), Duration::ZERO);
        assert_eq!(p.delay_before(2), Duration::from_millis(1000));
        assert_eq!(p.delay_before(3), Duration::from_millis(2000));
        assert_eq!(policy(0).primary_attempts(), 1);
    }

    #[tokio::test]
    async fn transient_failures_then_success_on_primary() {
        let (retrying, backend, sleeper) = harness(
            ScriptedBackend::new([
                Reply::status(503, "over capacity"),
                Reply::status(503, "over capacity"),
                Reply::text(r#"{"ok":true}"#),
            ]),
            policy(3),
        );

        let text = retrying.execute(&messages(), Sampling::default()).await.unwrap();
        assert_eq!(text, r#"{"ok":true}"#);
        assert_eq!(backend.models(), vec!["primary", "primary", "primary"]);
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
    }

    #[tokio::test]
    async fn decommissioned_switches_immediately() {
        let (retrying, backend, sleeper) = harness(
            ScriptedBackend::always_ok("from backup").with_model_reply(
                "primary",
                Reply::status(400, "The model `primary` has been decommissioned"),
            ),
            policy(3),
        );

        let text = retrying.execute(&messages(), Sampling::default()).await.unwrap();
        assert_eq!(text, "from backup");
        assert_eq!(backend.models(), vec!["primary", "backup"]);
        assert!(sleeper.delays().is_empty(), "no backoff before substitution");
    }

    #[tokio::test]
    async fn decommissioned_after_transient_failure_skips_remaining_retries() {
        let (retrying, backend, _sleeper) = harness(
            ScriptedBackend::new([
                Reply::status(500, "boom"),
                Reply::status(404, "model decommissioned"),
                Reply::text("ok"),
            ]),
            policy(5),
        );

        retrying.execute(&messages(), Sampling::default()).await.unwrap();
        assert_eq!(backend.models(), vec!["primary", "primary", "backup"]);
    }

    #[tokio::test]
    async fn exhausted_retries_try_fallback_once_then_fail() {
        let (retrying, backend, sleeper) =
            harness(ScriptedBackend::always_status(503, "unavailable"), policy(3));

        let err = retrying
            .execute(&messages(), Sampling::default())
            .await
            .unwrap_err();
        assert_eq!(backend.models(), vec!["primary", "primary", "primary", "backup"]);
        assert_eq!(sleeper.delays().len(), 2);
        match err {
            AvionError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 4);
                assert!(last.contains("503"), "last error should be kept: {last}");
            }
            other => panic!("expected exhausted error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn attempts_never_exceed_budget() {
        for max_retries in 1..=5 {
            let (retrying, backend, _) =
                harness(ScriptedBackend::always_status(502, "bad gateway"), policy(max_retries));
            let _ = retrying.execute(&messages(), Sampling::default()).await;
            let models = backend.models();
            assert_eq!(models.len() as u32, max_retries + 1);
            assert_eq!(models.iter().filter(|m| *m == "backup").count(), 1);
            assert_eq!(models.last().map(String::as_str), Some("backup"));
        }
    }

    #[tokio::test]
    async fn config_errors_are_not_retried() {
        struct NoKey;

        #[async_trait]
        impl crate::dispatch::ChatBackend for NoKey {
            async fn complete(
                &self,
                _request: &crate::chat::ChatCompletionRequest,
            ) -> Result<String> {
                Err(AvionError::Config("missing key".into()))
            }
        }

        let sleeper = Arc::new(RecordingSleeper::new());
        let retrying = RetryingDispatcher::new(
            Dispatcher::new(Arc::new(NoKey), "primary", "backup"),
            policy(3),
            sleeper.clone(),
        );
        let err = retrying
            .execute(&messages(), Sampling::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AvionError::Config(_)));
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_attempt_times_out_as_transient() {
        let mut p = policy(2);
        p.attempt_timeout = Duration::from_millis(50);
        let (retrying, backend, sleeper) =
            harness(ScriptedBackend::new([Reply::Hang, Reply::text("late but fine")]), p);

        let text = retrying.execute(&messages(), Sampling::default()).await.unwrap();
        assert_eq!(text, "late but fine");
        assert_eq!(backend.models(), vec!["primary", "primary"]);
        assert_eq!(sleeper.delays(), vec![Duration::from_millis(1000)]);
    }
}
