//! Retry policy and failure classification.
//!
//! After a failed attempt the coordinator either schedules a redispatch after
//! `backoff_base * backoff_multiplier^(attempt-1) + jitter`, or, once the
//! policy's attempts are spent, classifies the task by its declared
//! [`Criticality`]: non-critical tasks are abandoned, critical tasks get one
//! extra attempt (when enabled) and then fail their phase.

use crate::errors::TaskError;
use crate::task::{Criticality, Task};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on any retry delay, jitter included.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Retry parameters for one task class.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts allowed before exhaustion (at least 1)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub backoff_base: Duration,
    /// Growth per further retry
    pub backoff_multiplier: f64,
    /// Upper bound of uniform random jitter added to each delay
    pub jitter: Duration,
    /// Cap applied before jitter
    pub max_backoff: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: Duration::ZERO,
            max_backoff: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            backoff_base,
            backoff_multiplier,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = Some(max_backoff);
        self
    }

    /// Attempts allowed, never less than one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay after the given failed attempt (1-based), without jitter.
    ///
    /// Never exceeds [`MAX_RETRY_DELAY`].
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.backoff_base.as_secs_f64() * self.backoff_multiplier.max(0.0).powi(exponent);
        let mut delay = Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(MAX_RETRY_DELAY);
        if let Some(cap) = self.max_backoff {
            delay = delay.min(cap);
        }
        delay.min(MAX_RETRY_DELAY)
    }

    /// Delay after the given failed attempt, with jitter drawn from `rng`.
    pub fn delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter.is_zero() {
            return base;
        }
        let jitter = rng.gen_range(0.0..=self.jitter.as_secs_f64());
        let jitter = Duration::try_from_secs_f64(jitter).unwrap_or(MAX_RETRY_DELAY);
        base.saturating_add(jitter).min(MAX_RETRY_DELAY)
    }
}

/// What to do with a task after a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Redispatch after `delay` as attempt `next_attempt`
    Retry { delay: Duration, next_attempt: u32 },
    /// Give up on the task; the phase carries on
    Abandon,
    /// The phase fails and downstream phases never start
    FailPhase,
}

/// Applies retry policies and criticality rules.
#[derive(Debug)]
pub struct RetryCoordinator {
    default_policy: RetryPolicy,
    classes: HashMap<String, RetryPolicy>,
    critical_extra_attempt: bool,
    rng: StdRng,
}

impl Default for RetryCoordinator {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl RetryCoordinator {
    pub fn new(default_policy: RetryPolicy) -> Self {
        Self {
            default_policy,
            classes: HashMap::new(),
            critical_extra_attempt: true,
            rng: StdRng::from_entropy(),
        }
    }

    /// Register a policy for a task class.
    pub fn with_class(mut self, class: &str, policy: RetryPolicy) -> Self {
        self.classes.insert(class.to_string(), policy);
        self
    }

    /// Whether critical tasks get one more attempt after exhausting their policy.
    pub fn with_critical_extra_attempt(mut self, enabled: bool) -> Self {
        self.critical_extra_attempt = enabled;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Policy for a class, falling back to the default.
    pub fn policy_for(&self, class: &str) -> &RetryPolicy {
        self.classes.get(class).unwrap_or(&self.default_policy)
    }

    /// Most attempts a task can receive, counting the critical extra one.
    pub fn attempt_ceiling(&self, task: &Task) -> u32 {
        let base = self.policy_for(&task.class).attempts();
        if task.criticality == Criticality::Critical && self.critical_extra_attempt {
            base + 1
        } else {
            base
        }
    }

    /// Decide the fate of `task` after attempt number `attempt` failed.
    pub fn on_failure(&mut self, task: &Task, attempt: u32, error: &TaskError) -> RetryDecision {
        let policy = self.policy_for(&task.class).clone();
        let ceiling = self.attempt_ceiling(task);

        if attempt < ceiling {
            let delay = policy.delay(attempt, &mut self.rng);
            if attempt >= policy.attempts() {
                warn!(
                    task = %task.id,
                    attempt,
                    error = %error,
                    "Critical task exhausted retries; granting one final attempt"
                );
            } else {
                debug!(
                    task = %task.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Scheduling retry"
                );
            }
            return RetryDecision::Retry {
                delay,
                next_attempt: attempt + 1,
            };
        }

        self.classify_exhausted(task)
    }

    /// Classify a task that can make no further progress.
    pub fn classify_exhausted(&self, task: &Task) -> RetryDecision {
        match task.criticality {
            Criticality::NonCritical => {
                warn!(task = %task.id, "Non-critical task abandoned");
                RetryDecision::Abandon
            }
            Criticality::Critical => {
                warn!(task = %task.id, "Critical task failed; phase will fail");
                RetryDecision::FailPhase
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure() -> TaskError {
        TaskError::ExecutorFailure {
            message: "boom".into(),
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), 2.0);
        assert_eq!(policy.base_delay(1), Duration::from_secs(1));
        assert_eq!(policy.base_delay(2), Duration::from_secs(2));
        assert_eq!(policy.base_delay(3), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_cap() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), 10.0)
            .with_max_backoff(Duration::from_secs(30));
        assert_eq!(policy.base_delay(4), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_within_bound() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), 1.0)
            .with_jitter(Duration::from_millis(50));
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let d = policy.delay(1, &mut rng);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_overflowing_backoff_is_bounded() {
        let policy = RetryPolicy::new(3, Duration::MAX, 2.0);
        assert_eq!(policy.base_delay(1), MAX_RETRY_DELAY);
        assert_eq!(policy.base_delay(3), MAX_RETRY_DELAY);

        let policy = RetryPolicy::new(70, Duration::from_secs(1), 2.0);
        assert_eq!(policy.base_delay(69), MAX_RETRY_DELAY);

        let policy = RetryPolicy::new(3, Duration::from_secs(1), 2.0).with_jitter(Duration::MAX);
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..=3 {
            assert!(policy.delay(attempt, &mut rng) <= MAX_RETRY_DELAY);
        }
    }

    #[test]
    fn test_zero_max_attempts_means_one() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1), 2.0);
        assert_eq!(policy.attempts(), 1);
    }

    #[test]
    fn test_retries_until_max_attempts() {
        let mut coord = RetryCoordinator::new(RetryPolicy::new(3, Duration::from_secs(1), 2.0));
        let task = Task::new("t", "rust").with_criticality(Criticality::NonCritical);

        assert_eq!(
            coord.on_failure(&task, 1, &failure()),
            RetryDecision::Retry {
                delay: Duration::from_secs(1),
                next_attempt: 2
            }
        );
        assert_eq!(
            coord.on_failure(&task, 2, &failure()),
            RetryDecision::Retry {
                delay: Duration::from_secs(2),
                next_attempt: 3
            }
        );
        assert_eq!(coord.on_failure(&task, 3, &failure()), RetryDecision::Abandon);
    }

    #[test]
    fn test_critical_gets_one_extra_attempt() {
        let mut coord = RetryCoordinator::new(RetryPolicy::new(3, Duration::from_secs(1), 2.0));
        let task = Task::new("t", "rust");

        assert_eq!(coord.attempt_ceiling(&task), 4);
        assert_eq!(
            coord.on_failure(&task, 3, &failure()),
            RetryDecision::Retry {
                delay: Duration::from_secs(4),
                next_attempt: 4
            }
        );
        assert_eq!(coord.on_failure(&task, 4, &failure()), RetryDecision::FailPhase);
    }

    #[test]
    fn test_critical_without_extra_attempt_fails_at_max() {
        let mut coord = RetryCoordinator::new(RetryPolicy::new(3, Duration::from_secs(1), 2.0))
            .with_critical_extra_attempt(false);
        let task = Task::new("t", "rust");
        assert_eq!(coord.on_failure(&task, 3, &failure()), RetryDecision::FailPhase);
    }

    #[test]
    fn test_class_policy_lookup() {
        let mut coord = RetryCoordinator::default()
            .with_class("flaky", RetryPolicy::new(5, Duration::from_millis(10), 1.0));
        let task = Task::new("t", "rust")
            .with_class("flaky")
            .with_criticality(Criticality::NonCritical);

        assert_eq!(coord.policy_for("flaky").max_attempts, 5);
        assert_eq!(coord.policy_for("unknown").max_attempts, 3);
        assert!(matches!(
            coord.on_failure(&task, 4, &failure()),
            RetryDecision::Retry { next_attempt: 5, .. }
        ));
        assert_eq!(coord.on_failure(&task, 5, &failure()), RetryDecision::Abandon);
    }

    #[test]
    fn test_classify_exhausted_by_criticality() {
        let coord = RetryCoordinator::default();
        let critical = Task::new("a", "rust");
        let optional = Task::new("b", "rust").with_criticality(Criticality::NonCritical);
        assert_eq!(coord.classify_exhausted(&critical), RetryDecision::FailPhase);
        assert_eq!(coord.classify_exhausted(&optional), RetryDecision::Abandon);
    }
}
