//! Exponential backoff retry for agent calls.
//!
//! Only transient agent errors (timeouts, empty responses, connection failures)
//! are retried. Anything else is returned on first sight.

use super::{Agent, AgentRequest, AgentResponse};
use crate::errors::AgentError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Configuration for exponential backoff retry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries (not including the initial attempt).
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Cap for exponential growth.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    pub const DEFAULT: Self = Self {
        max_retries: 3,
        initial_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(8),
        backoff_multiplier: 2.0,
    };

    /// No waiting between retries. Used by tests and in-process fakes.
    pub const IMMEDIATE: Self = Self {
        max_retries: 3,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        backoff_multiplier: 1.0,
    };

    /// Computes the delay for the given retry attempt (0-indexed).
    ///
    /// Always within `0..=max_delay`, whatever the multiplier.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        // f64::max drops NaN, so the result is finite and non-negative here.
        let capped_secs = delay_secs.max(0.0).min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped_secs).unwrap_or(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Outcome of a retried call: the response plus how many tries it took.
#[derive(Debug)]
pub struct RetryOutcome {
    pub response: AgentResponse,
    pub tries: u32,
}

/// Call the agent, retrying transient failures with backoff.
///
/// Returns the last error together with the number of tries when retries are
/// exhausted or the error is not transient.
pub async fn call_with_retry(
    agent: &dyn Agent,
    request: &AgentRequest,
    config: &RetryConfig,
) -> Result<RetryOutcome, (AgentError, u32)> {
    let mut tries = 0;
    loop {
        tries += 1;
        let result = agent.run(request.clone()).await.and_then(|response| {
            if response.is_empty() {
                Err(AgentError::EmptyResponse)
            } else {
                Ok(response)
            }
        });

        match result {
            Ok(response) => return Ok(RetryOutcome { response, tries }),
            Err(err) if err.is_transient() && tries <= config.max_retries => {
                let delay = config.delay_for_attempt(tries - 1);
                warn!(
                    model = %request.model,
                    attempt = tries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient agent error, retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(err) => return Err((err, tries)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FlakyAgent {
        failures: Mutex<Vec<AgentError>>,
    }

    #[async_trait]
    impl Agent for FlakyAgent {
        async fn run(&self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
            let next = self.failures.lock().unwrap().pop();
            match next {
                Some(err) => Err(err),
                None => Ok(AgentResponse::text(&request.model, "done")),
            }
        }
    }

    #[test]
    fn test_delay_growth_is_capped() {
        let config = RetryConfig {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(5));
    }

    #[test]
    fn test_delay_never_negative_or_unbounded() {
        let config = RetryConfig {
            max_retries: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: -2.0,
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(10));
        assert_eq!(config.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(40));

        let nan = RetryConfig {
            backoff_multiplier: f64::NAN,
            ..config
        };
        assert_eq!(nan.delay_for_attempt(1), Duration::ZERO);

        let huge = RetryConfig {
            backoff_multiplier: f64::MAX,
            ..config
        };
        assert_eq!(huge.delay_for_attempt(3), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_negative_multiplier_still_retries() {
        let agent = FlakyAgent {
            failures: Mutex::new(vec![AgentError::EmptyResponse, AgentError::EmptyResponse]),
        };
        let request = AgentRequest::new("m", None);
        let config = RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: -2.0,
        };
        let outcome = call_with_retry(&agent, &request, &config).await.unwrap();
        assert_eq!(outcome.tries, 3);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let agent = FlakyAgent {
            failures: Mutex::new(vec![
                AgentError::EmptyResponse,
                AgentError::Timeout { secs: 1 },
            ]),
        };
        let request = AgentRequest::new("m", Some("hi".into()));
        let outcome = call_with_retry(&agent, &request, &RetryConfig::IMMEDIATE)
            .await
            .unwrap();
        assert_eq!(outcome.tries, 3);
        assert_eq!(outcome.response.content, "done");
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let agent = FlakyAgent {
            failures: Mutex::new(vec![AgentError::Fatal("bad".into())]),
        };
        let request = AgentRequest::new("m", None);
        let (err, tries) = call_with_retry(&agent, &request, &RetryConfig::IMMEDIATE)
            .await
            .unwrap_err();
        assert_eq!(tries, 1);
        assert_eq!(err, AgentError::Fatal("bad".into()));
    }

    #[tokio::test]
    async fn test_retries_exhaust() {
        let agent = FlakyAgent {
            failures: Mutex::new(vec![AgentError::Connection("reset".into()); 10]),
        };
        let request = AgentRequest::new("m", None);
        let config = RetryConfig {
            max_retries: 2,
            ..RetryConfig::IMMEDIATE
        };
        let (err, tries) = call_with_retry(&agent, &request, &config).await.unwrap_err();
        assert_eq!(tries, 3);
        assert!(err.is_transient());
    }
}
