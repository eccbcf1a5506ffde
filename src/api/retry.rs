//! Bounded exponential-backoff retry over any [`Transport`].

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{ApiError, ApiRequest, ApiResponse, Transport};

const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_WAIT_MIN: Duration = Duration::from_secs(1);
const DEFAULT_WAIT_MAX: Duration = Duration::from_secs(30);
const BACKOFF_MULTIPLIER: f64 = 2.0;
const BACKOFF_JITTER: f64 = 0.5;

/// Retry budget and wait bounds, fixed once a client is built.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    wait_min: Duration,
    wait_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_WAIT_MIN, DEFAULT_WAIT_MAX)
    }
}

impl RetryPolicy {
    /// Creates a policy. A `wait_max` below `wait_min` is raised to
    /// `wait_min`.
    #[must_use]
    pub fn new(max_retries: u32, wait_min: Duration, wait_max: Duration) -> Self {
        Self {
            max_retries,
            wait_min,
            wait_max: wait_max.max(wait_min),
        }
    }

    /// Lower bound of every wait.
    #[must_use]
    pub const fn wait_min(&self) -> Duration {
        self.wait_min
    }

    /// Upper bound of every wait.
    #[must_use]
    pub const fn wait_max(&self) -> Duration {
        self.wait_max
    }

    /// Starts a fresh wait sequence for one logical request.
    #[must_use]
    pub fn backoff(&self) -> RetryBackoff {
        RetryBackoff::new(self.wait_min, self.wait_max)
    }
}

/// Jittered exponential wait sequence clamped into `[wait_min, wait_max]`.
#[derive(Debug)]
pub struct RetryBackoff {
    inner: ExponentialBackoff,
    wait_min: Duration,
    wait_max: Duration,
}

impl RetryBackoff {
    fn new(wait_min: Duration, wait_max: Duration) -> Self {
        let inner = ExponentialBackoffBuilder::new()
            .with_initial_interval(wait_min)
            .with_max_interval(wait_max)
            .with_multiplier(BACKOFF_MULTIPLIER)
            .with_randomization_factor(BACKOFF_JITTER)
            .with_max_elapsed_time(None)
            .build();
        Self {
            inner,
            wait_min,
            wait_max,
        }
    }

    /// Returns the next wait.
    pub fn next_wait(&mut self) -> Duration {
        self.inner
            .next_backoff()
            .unwrap_or(self.wait_max)
            .clamp(self.wait_min, self.wait_max)
    }
}

/// Wraps a [`Transport`] with the retry rules of a [`RetryPolicy`].
///
/// Only HTTP 429 and 5xx responses are retried. Any other non-success status
/// fails on the spot, and once the budget runs out the last error is returned
/// unchanged. The client holds no per-request state, so a shared reference
/// can serve concurrent pollers.
#[derive(Clone, Debug)]
pub struct RetryingClient<T> {
    transport: T,
    policy: RetryPolicy,
}

impl<T: Transport> RetryingClient<T> {
    /// Creates a client over `transport`.
    #[must_use]
    pub const fn new(transport: T, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    /// Sends `request`, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the non-retryable [`ApiError`] as soon as it is observed, or
    /// the last retryable error once the budget is spent.
    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut backoff = self.policy.backoff();
        let mut retries = 0_u32;
        loop {
            debug!(
                method = %request.method,
                path = %request.path,
                attempt = retries + 1,
                "sending request"
            );
            let response = self.transport.send(request).await?;
            if response.is_success() {
                return Ok(response);
            }

            let err = ApiError::from_response(&response);
            if !err.is_retryable() || retries >= self.policy.max_retries {
                return Err(err);
            }

            let wait = backoff.next_wait();
            retries += 1;
            warn!(
                method = %request.method,
                path = %request.path,
                status = response.status,
                retry = retries,
                max_retries = self.policy.max_retries,
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                "transient API failure, retrying"
            );
            sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedTransport;
    use rstest::rstest;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(3)]
    #[tokio::test]
    async fn succeeds_after_exactly_budgeted_rate_limits(#[case] budget: u32) {
        let transport = ScriptedTransport::new();
        for _ in 0..budget {
            transport.push_status(429, r#"{"id":"too_many_requests","message":"slow down"}"#);
        }
        transport.push_status(200, r#"{"ok":true}"#);

        let client = RetryingClient::new(transport.clone(), fast_policy(budget));
        let response = client
            .execute(&ApiRequest::get("v2/regions"))
            .await
            .unwrap_or_else(|err| panic!("expected success: {err}"));

        assert_eq!(response.status, 200);
        assert_eq!(transport.request_count(), usize::try_from(budget + 1).unwrap_or(usize::MAX));
    }

    #[rstest]
    #[case(0)]
    #[case(2)]
    #[tokio::test]
    async fn exhausted_budget_surfaces_last_error(#[case] budget: u32) {
        let transport = ScriptedTransport::new();
        for attempt in 0..=budget {
            transport.push_status(
                429,
                format!(r#"{{"id":"too_many_requests","message":"attempt {attempt}"}}"#),
            );
        }
        transport.push_status(200, "{}");

        let client = RetryingClient::new(transport.clone(), fast_policy(budget));
        let err = client
            .execute(&ApiRequest::get("v2/regions"))
            .await
            .expect_err("budget should be exhausted");

        assert_eq!(
            err,
            ApiError::Status {
                status: 429,
                id: Some(String::from("too_many_requests")),
                message: format!("attempt {budget}"),
            }
        );
        assert_eq!(transport.request_count(), usize::try_from(budget + 1).unwrap_or(usize::MAX));
    }

    #[tokio::test]
    async fn client_errors_fail_without_retry() {
        let transport = ScriptedTransport::new();
        transport.push_status(422, r#"{"id":"unprocessable_entity","message":"bad size"}"#);
        transport.push_status(200, "{}");

        let client = RetryingClient::new(transport.clone(), fast_policy(5));
        let err = client
            .execute(&ApiRequest::get("v2/sizes"))
            .await
            .expect_err("422 is final");

        assert_eq!(err.status(), Some(422));
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let transport = ScriptedTransport::new();
        transport.push_status(503, "unavailable");
        transport.push_status(500, "boom");
        transport.push_status(200, "{}");

        let client = RetryingClient::new(transport.clone(), fast_policy(2));
        let response = client
            .execute(&ApiRequest::get("v2/account"))
            .await
            .unwrap_or_else(|err| panic!("expected success: {err}"));

        assert_eq!(response.status, 200);
        assert_eq!(transport.request_count(), 3);
    }

    #[test]
    fn waits_stay_within_bounds() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(900));
        let mut backoff = policy.backoff();
        for _ in 0..50 {
            let wait = backoff.next_wait();
            assert!(wait >= policy.wait_min(), "wait {wait:?} below minimum");
            assert!(wait <= policy.wait_max(), "wait {wait:?} above maximum");
        }
    }

    #[test]
    fn waits_grow_towards_the_maximum() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_secs(30));
        let samples = 200_u32;
        let mut first_total = Duration::ZERO;
        let mut fifth_total = Duration::ZERO;
        for _ in 0..samples {
            let mut backoff = policy.backoff();
            first_total += backoff.next_wait();
            for _ in 0..3 {
                backoff.next_wait();
            }
            fifth_total += backoff.next_wait();
        }
        assert!(
            fifth_total > first_total,
            "expected growth: first {first_total:?}, fifth {fifth_total:?}"
        );
    }

    #[test]
    fn late_waits_settle_on_the_maximum() {
        let policy = RetryPolicy::new(10, Duration::from_millis(10), Duration::from_millis(40));
        let mut backoff = policy.backoff();
        for _ in 0..20 {
            backoff.next_wait();
        }
        for _ in 0..10 {
            let wait = backoff.next_wait();
            assert!(wait >= Duration::from_millis(20), "wait {wait:?} fell back too far");
            assert!(wait <= Duration::from_millis(40));
        }
    }

    #[test]
    fn inverted_bounds_are_normalised() {
        let policy = RetryPolicy::new(1, Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(policy.wait_max(), Duration::from_secs(5));
    }
}
