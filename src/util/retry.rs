use log::debug;
use rand::{thread_rng, Rng};
use std::future::Future;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryStrategy {
    Linear,
    Exponential,
}

/// Backoff contract for callers that hit transient tablet conditions
/// (`TabletNotReady`, `NotLeader`).
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    strategy: RetryStrategy,
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Option<Duration>,
    jitter_fraction: f64,
    time_budget: Option<Duration>,
}

impl RetryPolicy {
    pub fn linear(max_attempts: usize, base_delay: Duration) -> Self {
        Self::new(RetryStrategy::Linear, max_attempts, base_delay)
    }

    pub fn exponential(max_attempts: usize, base_delay: Duration) -> Self {
        Self::new(RetryStrategy::Exponential, max_attempts, base_delay)
    }

    fn new(strategy: RetryStrategy, max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            strategy,
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: None,
            jitter_fraction: 0.0,
            time_budget: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay).filter(|delay| !delay.is_zero());
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn with_time_budget(mut self, budget: Option<Duration>) -> Self {
        self.time_budget = budget.filter(|duration| !duration.is_zero());
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn handle(&self) -> RetryHandle {
        let deadline = self
            .time_budget
            .and_then(|budget| Instant::now().checked_add(budget));
        RetryHandle {
            policy: self.clone(),
            attempts: 0,
            deadline,
        }
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let raw = match self.strategy {
            RetryStrategy::Linear => self
                .base_delay
                .saturating_mul(u32::try_from(attempt).unwrap_or(u32::MAX)),
            RetryStrategy::Exponential => {
                let shift = attempt.saturating_sub(1).min(31) as u32;
                self.base_delay.saturating_mul(1u32 << shift)
            }
        };
        let bounded = match self.max_delay {
            Some(max) => raw.min(max),
            None => raw,
        };
        if self.jitter_fraction <= 0.0 {
            return bounded;
        }
        let factor = thread_rng().gen_range((1.0 - self.jitter_fraction)..=(1.0 + self.jitter_fraction));
        bounded.mul_f64(factor)
    }
}

#[derive(Debug)]
pub struct RetryHandle {
    policy: RetryPolicy,
    attempts: usize,
    deadline: Option<Instant>,
}

impl RetryHandle {
    /// Delay before the next attempt, or `None` once attempts or the time
    /// budget are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts + 1 >= self.policy.max_attempts {
            return None;
        }
        let next = self.attempts + 1;
        let delay = self.policy.delay_for_attempt(next);
        if let Some(deadline) = self.deadline {
            match Instant::now().checked_add(delay) {
                Some(at) if at <= deadline => {}
                _ => return None,
            }
        }
        self.attempts = next;
        Some(delay)
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

/// Runs `op` until it succeeds, fails with an error `retryable` rejects, or
/// the policy gives up. The last error is returned in the latter cases.
pub async fn retry_async<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut handle = policy.handle();
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if retryable(&err) => match handle.next_delay() {
                Some(delay) => {
                    debug!(
                        "event=retry_backoff op={} attempt={} delay_ms={} error={}",
                        label,
                        handle.attempts(),
                        delay.as_millis(),
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(err),
            },
            Err(err) => return Err(err),
        }
    }
}
