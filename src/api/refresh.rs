//! Single-flight coordination of access token refreshes
//!
//! At most one refresh is in flight at a time. The first request to hit a 401
//! becomes the leader and performs the refresh; every request that hits a 401
//! while it runs is parked in a FIFO queue and receives the leader's outcome
//! exactly once.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::oneshot;

use super::request::ApiError;

/// New access token, or the reason there is none.
pub type Outcome = Result<String, ApiError>;

#[derive(Default)]
struct State {
    refreshing: bool,
    waiters: VecDeque<oneshot::Sender<Outcome>>,
}

/// Refresh-in-progress flag plus the queue of parked requests.
#[derive(Default)]
pub struct RefreshCoordinator {
    state: Mutex<State>,
}

/// Role handed out by [`RefreshCoordinator::acquire`].
pub enum Ticket<'a> {
    /// No refresh was running; the holder must perform one and settle it.
    Leader(InFlight<'a>),
    /// A refresh is already running; wait for its outcome.
    Follower(Waiter),
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a refresh, or join the queue of the one already running.
    pub fn acquire(&self) -> Ticket<'_> {
        let mut state = self.lock();
        if state.refreshing {
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            tracing::debug!("Refresh in flight, queued request ({} waiting)", state.waiters.len());
            Ticket::Follower(Waiter { rx })
        } else {
            state.refreshing = true;
            Ticket::Leader(InFlight {
                coordinator: self,
                settled: false,
            })
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock().refreshing
    }

    /// Number of requests parked behind the current refresh.
    pub fn pending(&self) -> usize {
        self.lock().waiters.len()
    }

    fn settle(&self, outcome: Outcome) -> usize {
        let waiters = {
            let mut state = self.lock();
            state.refreshing = false;
            std::mem::take(&mut state.waiters)
        };

        let count = waiters.len();
        for tx in waiters {
            // A closed receiver means that caller gave up; nothing to deliver.
            let _ = tx.send(outcome.clone());
        }
        count
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Proof of leadership over the running refresh.
///
/// Dropping it without settling fails every waiter with
/// [`ApiError::RefreshCancelled`] and clears the flag.
pub struct InFlight<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl InFlight<'_> {
    /// Resume every waiter with `token`. Returns how many were resumed.
    pub fn succeed(mut self, token: &str) -> usize {
        self.settled = true;
        self.coordinator.settle(Ok(token.to_string()))
    }

    /// Abort every waiter with `error`. Returns how many were aborted.
    pub fn fail(mut self, error: ApiError) -> usize {
        self.settled = true;
        self.coordinator.settle(Err(error))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!("Token refresh abandoned before completion");
            self.coordinator.settle(Err(ApiError::RefreshCancelled));
        }
    }
}

/// A parked request. Dropping it only discards this request's outcome.
pub struct Waiter {
    rx: oneshot::Receiver<Outcome>,
}

impl Waiter {
    pub async fn wait(self) -> Outcome {
        self.rx.await.unwrap_or(Err(ApiError::RefreshCancelled))
    }
}
