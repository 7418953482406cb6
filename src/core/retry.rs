//! Retry with exponential backoff and a connection circuit breaker.
//!
//! `with_retry` re-runs a fallible operation while its failures classify
//! as retryable and the circuit admits attempts. The breaker is an
//! explicit authority object shared by `Arc` across agents; it only
//! counts connection-class failures toward opening.

use super::error::{CoreError, Result};
use rand::Rng;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Consecutive connection failures before the circuit opens.
const FAILURE_THRESHOLD: u32 = 3;

/// Cooldown before an open circuit admits trial attempts.
const RESET_TIMEOUT: Duration = Duration::from_secs(30);

/// Trial attempts admitted while half-open.
const HALF_OPEN_MAX_ATTEMPTS: u32 = 2;

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_time: Option<Instant>,
    half_open_attempts: u32,
}

/// Three-state circuit breaker guarding engine connectivity.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    /// Creates a breaker with production defaults (3 failures, 30 s).
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_time: None,
                half_open_attempts: 0,
            }),
            failure_threshold: FAILURE_THRESHOLD,
            reset_timeout: RESET_TIMEOUT,
        }
    }

    /// Overrides the cooldown. Intended for tests.
    #[must_use]
    pub fn with_reset_timeout(mut self, reset_timeout: Duration) -> Self {
        self.reset_timeout = reset_timeout;
        self
    }

    /// Overrides the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Current state, transitioning OPEN to HALF_OPEN if the cooldown
    /// has elapsed.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("lock poisoned");
        self.roll_state(&mut inner);
        inner.state
    }

    /// Consecutive connection failures observed while closed.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.inner
            .lock()
            .expect("lock poisoned")
            .consecutive_failures
    }

    /// Whether a call would currently be admitted. Does not consume a
    /// half-open trial.
    #[must_use]
    pub fn can_attempt(&self) -> bool {
        let mut inner = self.inner.lock().expect("lock poisoned");
        self.roll_state(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => inner.half_open_attempts < HALF_OPEN_MAX_ATTEMPTS,
        }
    }

    /// Admits a call or returns an error naming the remaining cooldown.
    /// A half-open admission consumes one of the trial slots.
    ///
    /// # Errors
    /// Returns a network error while the circuit is open or trial slots
    /// are exhausted.
    pub fn admit(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        self.roll_state(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let remaining = inner
                    .last_failure_time
                    .map(|t| self.reset_timeout.saturating_sub(t.elapsed()))
                    .unwrap_or(self.reset_timeout);
                Err(CoreError::network(format!(
                    "circuit breaker is OPEN; retrying in {}s",
                    remaining.as_secs().max(1)
                )))
            }
            CircuitState::HalfOpen => {
                if inner.half_open_attempts < HALF_OPEN_MAX_ATTEMPTS {
                    inner.half_open_attempts += 1;
                    Ok(())
                } else {
                    Err(CoreError::network(
                        "circuit breaker is HALF_OPEN and trial attempts are exhausted",
                    ))
                }
            }
        }
    }

    /// Records a successful call: closes the circuit and resets counters.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure_time = None;
        inner.half_open_attempts = 0;
    }

    /// Records a failed call. Only connection-class errors move the
    /// breaker; everything else leaves it untouched.
    pub fn record_failure(&self, err: &CoreError) {
        if !err.is_connection_error() {
            return;
        }
        let mut inner = self.inner.lock().expect("lock poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                inner.last_failure_time = Some(Instant::now());
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.state = CircuitState::Open;
                inner.last_failure_time = Some(Instant::now());
                inner.half_open_attempts = 0;
            }
        }
    }

    /// Polls `can_attempt` until the circuit admits calls again.
    /// Returns false if `timeout` elapses first.
    #[must_use]
    pub fn wait_for_connection_restore(&self, timeout: Duration) -> bool {
        self.wait_for_connection_restore_with(timeout, Duration::from_secs(5))
    }

    /// As above with an explicit poll interval.
    #[must_use]
    pub fn wait_for_connection_restore_with(
        &self,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool {
        let start = Instant::now();
        loop {
            if self.can_attempt() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(poll_interval.min(timeout.saturating_sub(start.elapsed())));
        }
    }

    fn roll_state(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            if let Some(last) = inner.last_failure_time {
                if last.elapsed() >= self.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_attempts = 0;
                }
            }
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry policy for [`with_retry`].
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Attempts before the last error is returned.
    pub max_retries: u32,
    /// First backoff delay; doubles every attempt.
    pub base_delay: Duration,
    /// Backoff ceiling before jitter.
    pub max_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryOptions {
    /// Backoff for a 1-indexed attempt: `base × 2^(attempt−1)` clamped
    /// to `max_delay`, plus up to 25 % jitter.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let raw = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay);
        let jitter_ms = (raw.as_millis() as f64 * rand::thread_rng().gen_range(0.0..0.25)) as u64;
        raw + Duration::from_millis(jitter_ms)
    }
}

/// Runs `f`, retrying retryable failures with exponential backoff while
/// the circuit admits attempts.
///
/// `f` receives the 1-indexed attempt number. Non-retryable errors and
/// an open circuit propagate immediately.
///
/// # Errors
/// Returns the final classification failure once retries are exhausted.
pub fn with_retry<T, F>(breaker: &CircuitBreaker, opts: &RetryOptions, mut f: F) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
{
    let mut attempt = 1u32;
    loop {
        breaker.admit()?;

        match f(attempt) {
            Ok(value) => {
                breaker.record_success();
                return Ok(value);
            }
            Err(err) => {
                breaker.record_failure(&err);
                if !err.is_retryable() || attempt >= opts.max_retries || !breaker.can_attempt() {
                    return Err(err);
                }
                std::thread::sleep(opts.delay_for_attempt(attempt));
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_opts() -> RetryOptions {
        RetryOptions {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn succeeds_first_try() {
        let breaker = CircuitBreaker::new();
        let result = with_retry(&breaker, &fast_opts(), |_| Ok::<_, CoreError>(42));
        assert_eq!(result.unwrap(), 42);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn retries_retryable_errors() {
        let breaker = CircuitBreaker::new();
        let calls = AtomicU32::new(0);
        let result = with_retry(&breaker, &fast_opts(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            if attempt < 3 {
                Err(CoreError::timeout("slow"))
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn does_not_retry_validation_errors() {
        let breaker = CircuitBreaker::new();
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&breaker, &fast_opts(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::validation("bad input"))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn does_not_retry_fatal_errors() {
        let breaker = CircuitBreaker::new();
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&breaker, &fast_opts(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::auth("not authenticated"))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn opens_after_three_connection_failures() {
        let breaker = CircuitBreaker::new();
        for _ in 0..3 {
            breaker.record_failure(&CoreError::network("ECONNRESET"));
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.admit().is_err());
    }

    #[test]
    fn non_connection_failures_do_not_open() {
        let breaker = CircuitBreaker::new();
        for _ in 0..10 {
            breaker.record_failure(&CoreError::timeout("slow disk"));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn open_circuit_blocks_without_invoking() {
        let breaker = CircuitBreaker::new();
        for _ in 0..3 {
            breaker.record_failure(&CoreError::network("refused"));
        }

        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&breaker, &fast_opts(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let err = result.unwrap_err();
        assert!(err.message.contains("OPEN"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn half_open_after_cooldown_then_close_on_success() {
        let breaker = CircuitBreaker::new().with_reset_timeout(Duration::from_millis(20));
        for _ in 0..3 {
            breaker.record_failure(&CoreError::network("refused"));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.admit().unwrap();
        breaker.record_success();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new().with_reset_timeout(Duration::from_millis(20));
        for _ in 0..3 {
            breaker.record_failure(&CoreError::network("refused"));
        }
        std::thread::sleep(Duration::from_millis(30));

        breaker.admit().unwrap();
        breaker.record_failure(&CoreError::network("still down"));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_admits_limited_trials() {
        let breaker = CircuitBreaker::new().with_reset_timeout(Duration::from_millis(10));
        for _ in 0..3 {
            breaker.record_failure(&CoreError::network("refused"));
        }
        std::thread::sleep(Duration::from_millis(20));

        assert!(breaker.admit().is_ok());
        assert!(breaker.admit().is_ok());
        assert!(breaker.admit().is_err());
    }

    #[test]
    fn wait_for_restore_returns_once_admissible() {
        let breaker = CircuitBreaker::new().with_reset_timeout(Duration::from_millis(30));
        for _ in 0..3 {
            breaker.record_failure(&CoreError::network("refused"));
        }

        let restored = breaker.wait_for_connection_restore_with(
            Duration::from_millis(500),
            Duration::from_millis(10),
        );
        assert!(restored);
    }

    #[test]
    fn wait_for_restore_times_out() {
        let breaker = CircuitBreaker::new().with_reset_timeout(Duration::from_secs(60));
        for _ in 0..3 {
            breaker.record_failure(&CoreError::network("refused"));
        }

        let restored = breaker.wait_for_connection_restore_with(
            Duration::from_millis(50),
            Duration::from_millis(10),
        );
        assert!(!restored);
    }

    #[test]
    fn backoff_delays_grow_and_clamp() {
        let opts = RetryOptions {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        let d1 = opts.delay_for_attempt(1);
        let d3 = opts.delay_for_attempt(3);
        assert!(d1 >= Duration::from_millis(100));
        assert!(d1 < Duration::from_millis(126));
        // Clamped at max before jitter.
        assert!(d3 >= Duration::from_millis(300));
        assert!(d3 < Duration::from_millis(376));
    }
}
