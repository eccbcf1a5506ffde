//! Deadline-bounded, cancellable polling.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};

use crate::cancel::CancelToken;

/// How a poll loop ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PollOutcome<T> {
    /// The probe reported a value.
    Ready(T),
    /// The deadline passed first.
    TimedOut,
    /// The build was cancelled.
    Cancelled,
}

/// Calls `probe` every `interval` until it yields a value, `timeout`
/// elapses, or `cancel` fires.
///
/// Cancellation wins over a probe that is still in flight.
///
/// # Errors
///
/// Returns the first error produced by `probe`.
pub async fn poll_until<T, E, F, Fut>(
    cancel: &CancelToken,
    timeout: Duration,
    interval: Duration,
    mut probe: F,
) -> Result<PollOutcome<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            return Ok(PollOutcome::Cancelled);
        }

        let probed = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(PollOutcome::Cancelled),
            result = probe() => result?,
        };
        if let Some(value) = probed {
            return Ok(PollOutcome::Ready(value));
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(PollOutcome::TimedOut);
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(PollOutcome::Cancelled),
            () = sleep(interval.min(deadline - now)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn returns_ready_value() {
        let calls = AtomicU32::new(0);
        let outcome: Result<_, ()> = poll_until(
            &CancelToken::new(),
            Duration::from_secs(1),
            Duration::from_millis(1),
            || async {
                let seen = calls.fetch_add(1, Ordering::SeqCst);
                Ok((seen == 2).then_some("done"))
            },
        )
        .await;

        assert_eq!(outcome, Ok(PollOutcome::Ready("done")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn times_out_when_never_ready() {
        let outcome: Result<PollOutcome<()>, ()> = poll_until(
            &CancelToken::new(),
            Duration::from_millis(20),
            Duration::from_millis(1),
            || async { Ok(None) },
        )
        .await;

        assert_eq!(outcome, Ok(PollOutcome::TimedOut));
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let outcome: Result<PollOutcome<()>, ()> = poll_until(
            &cancel,
            Duration::from_secs(60),
            Duration::from_secs(30),
            || async { Ok(None) },
        )
        .await;

        assert_eq!(outcome, Ok(PollOutcome::Cancelled));
    }

    #[tokio::test]
    async fn probe_errors_propagate() {
        let outcome: Result<PollOutcome<()>, &str> = poll_until(
            &CancelToken::new(),
            Duration::from_secs(1),
            Duration::from_millis(1),
            || async { Err("boom") },
        )
        .await;

        assert_eq!(outcome, Err("boom"));
    }
}
