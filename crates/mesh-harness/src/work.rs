//! Work-unit lifecycle assertions.
//!
//! Work runs asynchronously inside the daemon, so a test cannot just ask
//! once: it polls `work status` until the unit reaches the expected state or
//! the deadline passes. Only "not there yet" is retried; a protocol error or
//! a rejected query ends the assertion immediately.

use crate::control::{ControlSession, WorkId, WorkState, WorkStatus};
use crate::error::Result;
use crate::poll::{Probe, poll_until};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Default interval between status queries.
pub const DEFAULT_WORK_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Polls work units through one control session.
///
/// The session must not have been used for `work submit`; submit on a
/// separate session and hand the returned id here.
#[derive(Debug)]
pub struct WorkAsserter {
    session: Mutex<ControlSession>,
    interval: Duration,
}

impl WorkAsserter {
    pub fn new(session: ControlSession) -> Self {
        Self {
            session: Mutex::new(session),
            interval: DEFAULT_WORK_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Give the session back.
    pub fn into_session(self) -> ControlSession {
        self.session.into_inner()
    }

    /// One status query.
    pub async fn status(&self, id: &WorkId) -> Result<WorkStatus> {
        self.session.lock().await.work_status(id).await
    }

    pub async fn cancel(&self, id: &WorkId) -> Result<()> {
        info!(work_id = %id, "Cancelling work unit");
        self.session.lock().await.work_cancel(id).await
    }

    pub async fn release(&self, id: &WorkId) -> Result<()> {
        info!(work_id = %id, "Releasing work unit");
        self.session.lock().await.work_release(id).await
    }

    /// Poll until `id` reports `expected`, returning that status.
    ///
    /// Fails with [`HarnessError::Deadline`](crate::HarnessError::Deadline)
    /// carrying the last observed state if `deadline` passes first.
    pub async fn assert_state(
        &self,
        deadline: Duration,
        id: &WorkId,
        expected: WorkState,
    ) -> Result<WorkStatus> {
        let result = poll_until(deadline, self.interval, move || async move {
            let status = self.status(id).await?;
            debug!(work_id = %id, state = %status.state, detail = %status.detail, "Work status");
            if status.state == expected {
                Ok(Probe::Ready(status))
            } else {
                Ok(Probe::Pending(status.state))
            }
        })
        .await;
        result.map_err(|failure| failure.into_error(&format!("work unit {id} to reach {expected}")))
    }

    pub async fn assert_running(&self, deadline: Duration, id: &WorkId) -> Result<WorkStatus> {
        self.assert_state(deadline, id, WorkState::Running).await
    }

    pub async fn assert_succeeded(&self, deadline: Duration, id: &WorkId) -> Result<WorkStatus> {
        self.assert_state(deadline, id, WorkState::Succeeded).await
    }

    pub async fn assert_cancelled(&self, deadline: Duration, id: &WorkId) -> Result<WorkStatus> {
        self.assert_state(deadline, id, WorkState::Cancelled).await
    }

    /// The daemon no longer knows the unit.
    pub async fn assert_released(&self, deadline: Duration, id: &WorkId) -> Result<WorkStatus> {
        self.assert_state(deadline, id, WorkState::Released).await
    }
}
