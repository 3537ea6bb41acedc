//! Bounded polling.
//!
//! Ready-wait, shutdown-wait and work-state assertions all reduce to the same
//! loop: probe, sleep, probe again, give up at a deadline. [`poll_until`] is
//! that loop. A probe either reports the value it was waiting for, reports
//! what it saw instead, or fails; failures are never retried.
//!
//! The poll is a plain future. Dropping it (or letting it return) leaves no
//! task behind, and every probe is itself bounded by the time remaining.

use crate::error::HarnessError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Stand-in for an unbounded deadline, about 30 years out.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Outcome of a single probe.
#[derive(Debug, Clone, PartialEq)]
pub enum Probe<T, O> {
    /// Target condition reached
    Ready(T),
    /// Not yet; carries what was observed instead
    Pending(O),
}

/// Why a poll gave up.
#[derive(Debug)]
pub enum PollFailure<O> {
    /// Deadline elapsed without the condition being reached
    Deadline {
        waited: Duration,
        /// Last observation, if any probe completed
        last: Option<O>,
    },
    /// A probe failed; propagated without retry
    Failed(HarnessError),
}

impl<O: std::fmt::Debug> PollFailure<O> {
    /// Collapse into a [`HarnessError`], describing the awaited condition.
    pub fn into_error(self, what: &str) -> HarnessError {
        match self {
            PollFailure::Deadline { waited, last } => HarnessError::Deadline {
                what: what.to_string(),
                waited,
                last: last
                    .map(|o| format!("{o:?}"))
                    .unwrap_or_else(|| "nothing".to_string()),
            },
            PollFailure::Failed(err) => err,
        }
    }
}

/// Repeatedly run `probe` every `interval` until it reports ready, fails, or
/// `deadline` has elapsed.
///
/// The first probe runs immediately, so a condition that already holds
/// succeeds even with a zero deadline. A deadline too large to represent
/// (`Duration::MAX`) is treated as thirty years.
pub async fn poll_until<T, O, F, Fut>(
    deadline: Duration,
    interval: Duration,
    mut probe: F,
) -> Result<T, PollFailure<O>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe<T, O>, HarnessError>>,
{
    let started = Instant::now();
    let until = started
        .checked_add(deadline)
        .unwrap_or_else(|| started + FAR_FUTURE);
    let mut last = None;

    loop {
        let remaining = until.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, probe()).await {
            Ok(Ok(Probe::Ready(value))) => return Ok(value),
            Ok(Ok(Probe::Pending(observed))) => last = Some(observed),
            Ok(Err(err)) => return Err(PollFailure::Failed(err)),
            Err(_) => break,
        }

        let now = Instant::now();
        if now >= until {
            break;
        }
        tokio::time::sleep(interval.min(until - now)).await;
    }

    Err(PollFailure::Deadline {
        waited: started.elapsed(),
        last,
    })
}
