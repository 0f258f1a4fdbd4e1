#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `stackprobe-retry` provides the bounded-iteration primitive used across
//! the stackprobe workspace to tolerate transient infrastructure failures:
//! connection handshakes racing a rebooting host, SSH channels refused by a
//! briefly overloaded daemon, processes that need a grace period before
//! their exit status becomes observable.
//!
//! A [`Retry`] value combines an optional attempt `count`, an optional
//! wall-clock `timeout` measured from the first attempt, and an optional
//! `interval` spacing attempts apart. Iterating it yields [`Attempt`]
//! records; each attempt knows its 1-based number, the time elapsed since
//! the sequence started, and whether it is the last attempt the bounds
//! permit.
//!
//! # Design
//!
//! Exhaustion is not signalled by panicking inside the iterator. The
//! iterator simply stops, and callers that need a hard failure convert the
//! final attempt into a typed [`RetryError`] through
//! [`Attempt::check_limits`] or use [`Retry::run`], which wraps the last
//! underlying failure so the root cause survives. This keeps "stop
//! retrying, the mechanism is done" distinct from "something is broken".
//!
//! # Invariants
//!
//! - An attempt sequence always yields at least one attempt, even when the
//!   timeout is already consumed or the count is zero.
//! - The engine itself never sleeps; pacing happens in [`Retry::run`] or at
//!   the call site between attempts.
//! - With `count = N`, at most `N` attempts are yielded and the `N`-th
//!   reports [`Attempt::is_last`].
//!
//! # Examples
//!
//! ```
//! use stackprobe_retry::Retry;
//! use std::time::Duration;
//!
//! let retry = Retry::new().with_count(3).with_interval(Duration::ZERO);
//! let mut seen = 0;
//! for attempt in retry.attempts() {
//!     seen += 1;
//!     assert_eq!(attempt.number(), seen);
//! }
//! assert_eq!(seen, 3);
//! ```

mod retry;

pub use retry::{Attempt, Attempts, Retry, RetryError};
