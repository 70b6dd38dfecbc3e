use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Fixed-interval retry bounds for a status poll. No backoff growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// `None` polls until the liveness token is cancelled.
    pub max_attempts: Option<u32>,
    /// Consecutive check errors tolerated before the poll gives up.
    pub max_consecutive_failures: u32,
}

impl PollPolicy {
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            max_consecutive_failures: 1,
        }
    }

    pub const fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub const fn with_failure_limit(mut self, max_consecutive_failures: u32) -> Self {
        self.max_consecutive_failures = max_consecutive_failures;
        self
    }
}

/// Why a poll ended without a value.
#[derive(Debug, PartialEq, Eq)]
pub enum PollStop<E> {
    Exhausted { attempts: u32 },
    Failed { attempts: u32, source: E },
    Cancelled,
}

/// Runs `check` until it yields a value.
///
/// The next attempt is scheduled only after the previous one resolved, so polls for one task
/// never overlap. `on_error` sees every failed check together with the current streak length.
pub async fn poll_until<T, E, F, Fut, O>(
    policy: PollPolicy,
    liveness: &CancellationToken,
    mut check: F,
    mut on_error: O,
) -> Result<T, PollStop<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
    O: FnMut(&E, u32),
{
    let failure_limit = policy.max_consecutive_failures.max(1);
    let mut attempts = 0u32;
    let mut consecutive_failures = 0u32;

    loop {
        if liveness.is_cancelled() {
            return Err(PollStop::Cancelled);
        }

        attempts = attempts.saturating_add(1);
        let outcome = tokio::select! {
            _ = liveness.cancelled() => return Err(PollStop::Cancelled),
            outcome = check(attempts) => outcome,
        };

        match outcome {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => consecutive_failures = 0,
            Err(error) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                on_error(&error, consecutive_failures);
                if consecutive_failures >= failure_limit {
                    return Err(PollStop::Failed {
                        attempts,
                        source: error,
                    });
                }
            }
        }

        if let Some(max_attempts) = policy.max_attempts
            && attempts >= max_attempts
        {
            return Err(PollStop::Exhausted { attempts });
        }

        tokio::select! {
            _ = liveness.cancelled() => return Err(PollStop::Cancelled),
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use tokio::time::Instant;

    use super::*;

    const INTERVAL: Duration = Duration::from_secs(2);

    #[tokio::test(start_paused = true)]
    async fn resolves_after_pending_attempts_with_fixed_spacing() {
        let liveness = CancellationToken::new();
        let started = Instant::now();

        let value = poll_until(
            PollPolicy::new(INTERVAL),
            &liveness,
            |attempt| async move {
                Ok::<_, ()>(if attempt == 3 { Some("done") } else { None })
            },
            |_, _| {},
        )
        .await;

        assert_eq!(value, Ok("done"));
        assert_eq!(started.elapsed(), INTERVAL * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_ceiling_ends_with_exhausted() {
        let liveness = CancellationToken::new();
        let calls = Cell::new(0u32);

        let outcome = poll_until(
            PollPolicy::new(Duration::from_secs(1)).with_max_attempts(Some(30)),
            &liveness,
            |_| {
                calls.set(calls.get() + 1);
                async { Ok::<Option<()>, ()>(None) }
            },
            |_, _| {},
        )
        .await;

        assert_eq!(outcome, Err(PollStop::Exhausted { attempts: 30 }));
        assert_eq!(calls.get(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_streak_resets_on_a_successful_check() {
        let liveness = CancellationToken::new();
        let mut observed = Vec::new();

        // err, pending, err, err -> the streak of two reaches the limit on attempt 4.
        let outcome = poll_until(
            PollPolicy::new(INTERVAL).with_failure_limit(2),
            &liveness,
            |attempt| async move {
                match attempt {
                    2 => Ok(None::<()>),
                    _ => Err(format!("boom-{attempt}")),
                }
            },
            |error: &String, streak| observed.push((error.clone(), streak)),
        )
        .await;

        assert_eq!(
            outcome,
            Err(PollStop::Failed {
                attempts: 4,
                source: "boom-4".to_string()
            })
        );
        assert_eq!(
            observed,
            vec![
                ("boom-1".to_string(), 1),
                ("boom-3".to_string(), 1),
                ("boom-4".to_string(), 2),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_before_the_next_attempt() {
        let liveness = CancellationToken::new();
        let calls = Cell::new(0u32);

        let outcome = poll_until(
            PollPolicy::new(INTERVAL),
            &liveness,
            |_| {
                calls.set(calls.get() + 1);
                if calls.get() == 2 {
                    liveness.cancel();
                }
                async { Ok::<Option<()>, ()>(None) }
            },
            |_, _| {},
        )
        .await;

        assert_eq!(outcome, Err(PollStop::Cancelled));
        assert_eq!(calls.get(), 2);
    }
}
