//! Bounded retry sequencing.
//!
//! The types here implement the count/timeout/interval contract described
//! in the crate documentation. A [`Retry`] is an immutable bundle of
//! bounds; [`Attempts`] lazily yields [`Attempt`] records until a bound is
//! consumed; [`RetryError`] is the typed failure produced once a caller
//! asks to convert exhaustion into an error.

use std::error::Error;
use std::thread;
use std::time::{Duration, Instant};

/// Boxed cause attached to a [`RetryError`] by [`Retry::run`].
type Cause = Box<dyn Error + Send + Sync + 'static>;

/// Error raised when a retry sequence exhausts one of its bounds.
///
/// Both variants carry the bound that was hit and, when produced by
/// [`Retry::run`], the last underlying failure as the error source so
/// callers can still distinguish the root cause.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// The attempt count bound was exhausted.
    #[error(
        "retry count limit reached after {attempts} of {limit} attempt(s){}",
        cause.as_ref().map(|c| format!(": {c}")).unwrap_or_default()
    )]
    CountLimit {
        /// Number of attempts performed.
        attempts: usize,
        /// Configured attempt limit.
        limit: usize,
        /// Last underlying failure, when one was observed.
        #[source]
        cause: Option<Cause>,
    },

    /// The wall-clock timeout bound was exhausted.
    #[error(
        "retry time limit reached after {attempts} attempt(s) (elapsed: {:.1}s, limit: {:.1}s){}",
        elapsed.as_secs_f64(),
        limit.as_secs_f64(),
        cause.as_ref().map(|c| format!(": {c}")).unwrap_or_default()
    )]
    TimeLimit {
        /// Number of attempts performed.
        attempts: usize,
        /// Time elapsed since the first attempt.
        elapsed: Duration,
        /// Configured wall-clock limit.
        limit: Duration,
        /// Last underlying failure, when one was observed.
        #[source]
        cause: Option<Cause>,
    },
}

impl RetryError {
    /// Attaches the last underlying failure to this limit error.
    #[must_use]
    pub fn with_cause(self, new_cause: Cause) -> Self {
        match self {
            Self::CountLimit {
                attempts, limit, ..
            } => Self::CountLimit {
                attempts,
                limit,
                cause: Some(new_cause),
            },
            Self::TimeLimit {
                attempts,
                elapsed,
                limit,
                ..
            } => Self::TimeLimit {
                attempts,
                elapsed,
                limit,
                cause: Some(new_cause),
            },
        }
    }

    /// Returns `true` for the count-limit variant.
    #[must_use]
    pub const fn is_count_limit(&self) -> bool {
        matches!(self, Self::CountLimit { .. })
    }

    /// Returns `true` for the time-limit variant.
    #[must_use]
    pub const fn is_time_limit(&self) -> bool {
        matches!(self, Self::TimeLimit { .. })
    }
}

/// Immutable retry bounds: attempt count, wall-clock timeout, and the
/// interval separating attempts.
///
/// Unset fields leave the corresponding bound open; call sites layer
/// component defaults underneath caller overrides with the
/// `with_default_*` helpers. Every production call site supplies at least
/// one bound so a sequence is never literally infinite.
///
/// # Examples
///
/// ```
/// use stackprobe_retry::Retry;
/// use std::time::Duration;
///
/// let retry = Retry::new()
///     .with_count(5)
///     .with_default_interval(Duration::from_secs(1));
/// assert_eq!(retry.count(), Some(5));
/// assert_eq!(retry.interval(), Some(Duration::from_secs(1)));
/// assert_eq!(retry.timeout(), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Retry {
    count: Option<usize>,
    timeout: Option<Duration>,
    interval: Option<Duration>,
}

impl Retry {
    /// Creates retry bounds with no limits set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: None,
            timeout: None,
            interval: None,
        }
    }

    /// Sets the maximum number of attempts.
    #[must_use]
    pub const fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Sets the wall-clock timeout measured from the first attempt.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the minimum spacing between attempts.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Sets the attempt count only when the caller left it open.
    #[must_use]
    pub const fn with_default_count(mut self, count: usize) -> Self {
        if self.count.is_none() {
            self.count = Some(count);
        }
        self
    }

    /// Sets the timeout only when the caller left it open.
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        if self.timeout.is_none() {
            self.timeout = Some(timeout);
        }
        self
    }

    /// Sets the interval only when the caller left it open.
    #[must_use]
    pub const fn with_default_interval(mut self, interval: Duration) -> Self {
        if self.interval.is_none() {
            self.interval = Some(interval);
        }
        self
    }

    /// Returns the configured attempt count bound.
    #[must_use]
    pub const fn count(&self) -> Option<usize> {
        self.count
    }

    /// Returns the configured wall-clock timeout.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns the configured attempt interval.
    #[must_use]
    pub const fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Returns the lazy attempt sequence for these bounds.
    ///
    /// The sequence starts its clock on the first `next()` call, always
    /// yields at least one attempt, and stops once the count or timeout
    /// bound is consumed.
    #[must_use]
    pub const fn attempts(&self) -> Attempts {
        Attempts {
            count: self.count,
            timeout: self.timeout,
            interval: self.interval,
            started: None,
            yielded: 0,
        }
    }

    /// Sleeps for the configured interval, if any.
    ///
    /// Pacing is deliberately outside the iterator so callers that poll a
    /// readiness source with its own blocking wait do not pay twice.
    pub fn sleep_interval(&self) {
        if let Some(interval) = self.interval
            && !interval.is_zero()
        {
            thread::sleep(interval);
        }
    }

    /// Runs `body` once per attempt until it succeeds or the bounds are
    /// exhausted, sleeping the interval between failed attempts.
    ///
    /// On exhaustion the last underlying failure is attached to the
    /// returned [`RetryError`] as its source.
    ///
    /// # Examples
    ///
    /// ```
    /// use stackprobe_retry::Retry;
    /// use std::time::Duration;
    ///
    /// let retry = Retry::new().with_count(3).with_interval(Duration::ZERO);
    /// let mut calls = 0;
    /// let result: Result<(), _> = retry.run(|_attempt| {
    ///     calls += 1;
    ///     Err(std::io::Error::other("still broken"))
    /// });
    /// assert_eq!(calls, 3);
    /// assert!(result.unwrap_err().is_count_limit());
    /// ```
    pub fn run<T, E, F>(&self, mut body: F) -> Result<T, RetryError>
    where
        F: FnMut(&Attempt) -> Result<T, E>,
        E: Into<Cause>,
    {
        let mut performed = 0;
        let mut started = None;
        let mut last_cause: Option<Cause> = None;

        for attempt in self.attempts() {
            performed = attempt.number();
            started.get_or_insert(attempt.started);
            match body(&attempt) {
                Ok(value) => return Ok(value),
                Err(cause) => {
                    let cause = cause.into();
                    if let Err(limit) = attempt.check_limits() {
                        return Err(limit.with_cause(cause));
                    }
                    last_cause = Some(cause);
                }
            }
            self.sleep_interval();
        }

        // The iterator drained between attempts (timeout consumed during the
        // interval sleep) without check_limits observing the exhaustion.
        let error = self.exhausted_error(performed, started);
        Err(match last_cause {
            Some(cause) => error.with_cause(cause),
            None => error,
        })
    }

    fn exhausted_error(&self, attempts: usize, started: Option<Instant>) -> RetryError {
        if let Some(limit) = self.timeout {
            let elapsed = started.map_or(limit, |start| start.elapsed());
            if elapsed >= limit {
                return RetryError::TimeLimit {
                    attempts,
                    elapsed,
                    limit,
                    cause: None,
                };
            }
        }
        RetryError::CountLimit {
            attempts,
            limit: self.count.unwrap_or(attempts),
            cause: None,
        }
    }
}

/// Lazy sequence of [`Attempt`] records for one [`Retry`].
///
/// Created by [`Retry::attempts`]. The wall clock starts on the first
/// `next()` call.
#[derive(Debug, Clone)]
pub struct Attempts {
    count: Option<usize>,
    timeout: Option<Duration>,
    interval: Option<Duration>,
    started: Option<Instant>,
    yielded: usize,
}

impl Iterator for Attempts {
    type Item = Attempt;

    fn next(&mut self) -> Option<Attempt> {
        let started = *self.started.get_or_insert_with(Instant::now);
        if self.yielded > 0 {
            if let Some(count) = self.count
                && self.yielded >= count
            {
                return None;
            }
            if let Some(timeout) = self.timeout
                && started.elapsed() >= timeout
            {
                return None;
            }
        }
        self.yielded += 1;
        Some(Attempt {
            number: self.yielded,
            started,
            count: self.count,
            timeout: self.timeout,
            interval: self.interval,
        })
    }
}

/// One iteration of a bounded retry sequence.
///
/// Carries the attempt number, the shared sequence start time, and the
/// bounds needed to answer [`is_last`](Self::is_last) and
/// [`check_limits`](Self::check_limits).
#[derive(Debug, Clone, Copy)]
pub struct Attempt {
    number: usize,
    started: Instant,
    count: Option<usize>,
    timeout: Option<Duration>,
    interval: Option<Duration>,
}

impl Attempt {
    /// Returns the 1-based attempt number.
    #[must_use]
    pub const fn number(&self) -> usize {
        self.number
    }

    /// Returns the time elapsed since the sequence's first attempt,
    /// recomputed at call time.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Returns `true` when the next attempt would exceed the count or
    /// timeout bound.
    ///
    /// The timeout projection accounts for the configured interval: if
    /// sleeping it would consume the remaining budget, this attempt is the
    /// last one.
    #[must_use]
    pub fn is_last(&self) -> bool {
        if let Some(count) = self.count
            && self.number >= count
        {
            return true;
        }
        if let Some(timeout) = self.timeout {
            let projected = self.elapsed() + self.interval.unwrap_or(Duration::ZERO);
            if projected >= timeout {
                return true;
            }
        }
        false
    }

    /// Fails once the count or timeout bound is exhausted.
    ///
    /// Callers loop as `body(); attempt.check_limits()?; sleep(interval)`:
    /// the error fires on the final permitted attempt, never before the
    /// body has run at least once.
    pub fn check_limits(&self) -> Result<(), RetryError> {
        if let Some(limit) = self.count
            && self.number >= limit
        {
            return Err(RetryError::CountLimit {
                attempts: self.number,
                limit,
                cause: None,
            });
        }
        if let Some(limit) = self.timeout {
            let elapsed = self.elapsed();
            if elapsed >= limit {
                return Err(RetryError::TimeLimit {
                    attempts: self.number,
                    elapsed,
                    limit,
                    cause: None,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn unbounded_retry_has_no_limits() {
        let retry = Retry::new();
        assert_eq!(retry.count(), None);
        assert_eq!(retry.timeout(), None);
        assert_eq!(retry.interval(), None);
    }

    #[test]
    fn builder_sets_all_bounds() {
        let retry = Retry::new()
            .with_count(4)
            .with_timeout(Duration::from_secs(30))
            .with_interval(Duration::from_millis(250));
        assert_eq!(retry.count(), Some(4));
        assert_eq!(retry.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(retry.interval(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn defaults_only_fill_open_bounds() {
        let retry = Retry::new()
            .with_count(2)
            .with_default_count(10)
            .with_default_timeout(Duration::from_secs(60));
        assert_eq!(retry.count(), Some(2));
        assert_eq!(retry.timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn count_bound_yields_exactly_count_attempts() {
        let retry = Retry::new().with_count(3);
        let numbers: Vec<usize> = retry.attempts().map(|a| a.number()).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn final_attempt_reports_is_last() {
        let retry = Retry::new().with_count(3);
        let attempts: Vec<Attempt> = retry.attempts().collect();
        assert!(!attempts[0].is_last());
        assert!(!attempts[1].is_last());
        assert!(attempts[2].is_last());
    }

    #[test]
    fn at_least_one_attempt_with_zero_timeout() {
        let retry = Retry::new().with_timeout(Duration::ZERO);
        let attempts: Vec<Attempt> = retry.attempts().collect();
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].is_last());
    }

    #[test]
    fn at_least_one_attempt_with_zero_count() {
        let retry = Retry::new().with_count(0);
        let attempts: Vec<Attempt> = retry.attempts().collect();
        assert_eq!(attempts.len(), 1);
    }

    #[test]
    fn timeout_bound_stops_the_sequence() {
        let retry = Retry::new().with_timeout(Duration::from_millis(30));
        let mut attempts = retry.attempts();
        assert!(attempts.next().is_some());
        thread::sleep(Duration::from_millis(40));
        assert!(attempts.next().is_none());
    }

    #[test]
    fn check_limits_passes_before_the_final_attempt() {
        let retry = Retry::new().with_count(3);
        let mut attempts = retry.attempts();
        let first = attempts.next().expect("first attempt");
        assert!(first.check_limits().is_ok());
    }

    #[test]
    fn check_limits_raises_count_limit_on_final_attempt() {
        let retry = Retry::new().with_count(3);
        let last = retry.attempts().last().expect("attempts");
        assert_eq!(last.number(), 3);
        let error = last.check_limits().expect_err("count limit");
        assert!(error.is_count_limit());
        match error {
            RetryError::CountLimit {
                attempts, limit, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(limit, 3);
            }
            RetryError::TimeLimit { .. } => panic!("expected CountLimit"),
        }
    }

    #[test]
    fn check_limits_raises_time_limit_after_timeout() {
        let retry = Retry::new().with_timeout(Duration::from_millis(5));
        let attempt = retry.attempts().next().expect("first attempt");
        thread::sleep(Duration::from_millis(10));
        let error = attempt.check_limits().expect_err("time limit");
        assert!(error.is_time_limit());
        match error {
            RetryError::TimeLimit {
                elapsed, limit, ..
            } => {
                assert!(elapsed >= limit);
            }
            RetryError::CountLimit { .. } => panic!("expected TimeLimit"),
        }
    }

    #[test]
    fn elapsed_is_recomputed_at_call_time() {
        let retry = Retry::new().with_count(1);
        let attempt = retry.attempts().next().expect("attempt");
        let before = attempt.elapsed();
        thread::sleep(Duration::from_millis(5));
        assert!(attempt.elapsed() > before);
    }

    #[test]
    fn run_returns_first_success() {
        let retry = Retry::new().with_count(5).with_interval(Duration::ZERO);
        let mut calls = 0;
        let value = retry
            .run(|_| -> Result<u32, io::Error> {
                calls += 1;
                if calls < 3 {
                    Err(io::Error::other("not yet"))
                } else {
                    Ok(7)
                }
            })
            .expect("eventual success");
        assert_eq!(value, 7);
        assert_eq!(calls, 3);
    }

    #[test]
    fn run_fails_on_exactly_the_final_attempt() {
        let retry = Retry::new().with_count(3).with_interval(Duration::ZERO);
        let mut calls = 0;
        let error = retry
            .run(|_| -> Result<(), io::Error> {
                calls += 1;
                Err(io::Error::other("always broken"))
            })
            .expect_err("exhaustion");
        assert_eq!(calls, 3);
        assert!(error.is_count_limit());
    }

    #[test]
    fn run_preserves_the_last_cause() {
        let retry = Retry::new().with_count(2).with_interval(Duration::ZERO);
        let error = retry
            .run(|attempt| -> Result<(), io::Error> {
                Err(io::Error::other(format!("failure {}", attempt.number())))
            })
            .expect_err("exhaustion");
        let source = std::error::Error::source(&error).expect("cause attached");
        assert!(source.to_string().contains("failure 2"));
    }

    #[test]
    fn run_time_limit_reports_elapsed_and_limit() {
        let retry = Retry::new()
            .with_timeout(Duration::from_millis(20))
            .with_interval(Duration::from_millis(10));
        let error = retry
            .run(|_| -> Result<(), io::Error> { Err(io::Error::other("slow")) })
            .expect_err("time limit");
        assert!(error.is_time_limit());
        assert!(error.to_string().contains("time limit"));
    }

    #[test]
    fn error_display_mentions_bound_and_cause() {
        let retry = Retry::new().with_count(1).with_interval(Duration::ZERO);
        let error = retry
            .run(|_| -> Result<(), io::Error> { Err(io::Error::other("boom")) })
            .expect_err("count limit");
        let rendered = error.to_string();
        assert!(rendered.contains("count limit"));
        assert!(rendered.contains("boom"));
    }
}
