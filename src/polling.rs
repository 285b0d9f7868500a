//! Cancellable polling with a wall-clock deadline.
//!
//! A poll is a sequence of single checks separated by a fixed interval. The
//! next check is only scheduled after the previous one finished, so slow
//! round-trips never overlap. Time is measured from the first check, not by
//! counting ticks, and a check still in flight at the deadline is abandoned.

use anyhow::Result;
use log::debug;
use std::{future::Future, time::Duration};
use tokio::time::{Instant, sleep, timeout_at};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(20 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

/// Result of one check: either done with a value or keep polling
#[derive(Debug, PartialEq, Eq)]
pub enum PollStatus<T> {
    Ready(T),
    Pending,
}

#[derive(Debug)]
pub enum PollOutcome<T> {
    Completed { value: T, attempts: u32 },
    TimedOut { attempts: u32, elapsed: Duration },
    Failed { error: anyhow::Error, attempts: u32 },
    Cancelled,
}

impl<T> PollOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, PollOutcome::Completed { .. })
    }
}

/// Run `check` until it reports `Ready`, fails, the deadline passes or
/// `cancel` fires.
///
/// A check that answers in time is always evaluated. A check that has not
/// answered when the deadline passes ends the poll as timed out.
pub async fn poll_until<T, F, Fut>(
    config: PollConfig,
    cancel: &CancellationToken,
    mut check: F,
) -> PollOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollStatus<T>>>,
{
    let started = Instant::now();
    let deadline = started + config.timeout;
    let mut attempts = 0;

    loop {
        if cancel.is_cancelled() {
            return PollOutcome::Cancelled;
        }

        attempts += 1;

        let status = tokio::select! {
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            status = timeout_at(deadline, check()) => match status {
                Ok(status) => status,
                Err(_) => {
                    let elapsed = started.elapsed();
                    debug!("poll attempt {attempts} still in flight after {}s", elapsed.as_secs());
                    return PollOutcome::TimedOut { attempts, elapsed };
                }
            },
        };

        match status {
            Ok(PollStatus::Ready(value)) => return PollOutcome::Completed { value, attempts },
            Ok(PollStatus::Pending) => {}
            Err(error) => return PollOutcome::Failed { error, attempts },
        }

        let elapsed = started.elapsed();
        if elapsed >= config.timeout {
            return PollOutcome::TimedOut { attempts, elapsed };
        }

        debug!("poll attempt {attempts} pending after {}s", elapsed.as_secs());

        tokio::select! {
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            _ = sleep(config.interval) => {}
        }
    }
}
