//! Per-call time budgets.
//!
//! Every blocking store call takes a [`Deadline`]. An expired deadline aborts
//! the call before anything is sent; otherwise the remaining budget travels
//! with the request as its gRPC timeout and is enforced locally as well.
//!
//! Local enforcement relies on tokio timers, which tick once per millisecond.
//! A budget smaller than one tick cannot be enforced and counts as spent.

use crate::error::{Result, StoreError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Granularity of tokio's timer wheel.
const TIMER_RESOLUTION: Duration = Duration::from_millis(1);

/// Point in time after which an operation is abandoned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No time limit.
    pub fn none() -> Self {
        Self(None)
    }

    /// Expires `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self(Some(Instant::now() + timeout))
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    pub fn is_expired(&self) -> bool {
        self.remaining()
            .is_some_and(|remaining| remaining < TIMER_RESOLUTION)
    }

    /// Budget left, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.0
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Attach the remaining budget to an outgoing request.
    pub(crate) fn request<T>(&self, message: T) -> Result<tonic::Request<T>> {
        if self.is_expired() {
            return Err(StoreError::DeadlineExceeded);
        }
        let mut request = tonic::Request::new(message);
        if let Some(remaining) = self.remaining() {
            request.set_timeout(remaining);
        }
        Ok(request)
    }

    /// Run `fut` to completion unless the deadline passes first.
    pub(crate) async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.0 {
            None => fut.await,
            Some(at) => tokio::time::timeout_at(at, fut)
                .await
                .map_err(|_| StoreError::DeadlineExceeded)?,
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

impl From<Duration> for Deadline {
    fn from(timeout: Duration) -> Self {
        Self::after(timeout)
    }
}
