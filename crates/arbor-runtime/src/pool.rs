//! Bounded worker slots with a FIFO wait queue.
//!
//! A slot is held by a [`PoolLease`]. Dropping the lease hands the slot
//! straight to the oldest waiter whose deadline has not passed, under the
//! same lock that guards the queue, so a queued request is claimed at most
//! once and `active` never exceeds `max_workers`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use arbor_protocol::{ExecutionId, SessionId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::error::PoolError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_workers: usize,
    pub max_queue: usize,
    pub queue_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_queue: 64,
            queue_timeout_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    execution_id: ExecutionId,
    deadline: Instant,
    tx: oneshot::Sender<PoolLease>,
}

#[derive(Debug, Default)]
struct PoolState {
    active: usize,
    peak: usize,
    next_ticket: u64,
    queue: VecDeque<Waiter>,
}

#[derive(Debug)]
struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl PoolInner {
    /// Give a freed slot to the next live waiter, or return it to the pool.
    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock();
        let now = Instant::now();
        while let Some(waiter) = state.queue.pop_front() {
            if waiter.deadline <= now {
                debug!(execution_id = %waiter.execution_id, "skipping expired waiter");
                continue;
            }
            let lease = PoolLease::new(self.clone());
            match waiter.tx.send(lease) {
                Ok(()) => {
                    debug!(execution_id = %waiter.execution_id, "worker slot handed to waiter");
                    return;
                }
                Err(mut lease) => lease.disarm(),
            }
        }
        state.active = state.active.saturating_sub(1);
    }

    fn forget(&self, ticket: u64) -> bool {
        let mut state = self.state.lock();
        let before = state.queue.len();
        state.queue.retain(|waiter| waiter.ticket != ticket);
        state.queue.len() != before
    }
}

#[derive(Debug, Clone)]
pub struct AgentPool {
    inner: Arc<PoolInner>,
}

/// Result of asking for a worker slot.
#[derive(Debug)]
pub enum PoolTicket {
    Ready(PoolLease),
    Queued(QueuedRequest),
}

impl AgentPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config: PoolConfig {
                    max_workers: config.max_workers.max(1),
                    ..config
                },
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Claim a slot now, or join the FIFO queue. A full queue is refused
    /// with `PoolExhausted`.
    pub fn request_worker(
        &self,
        session_id: &SessionId,
        execution_id: &ExecutionId,
    ) -> Result<PoolTicket, PoolError> {
        let config = &self.inner.config;
        let mut state = self.inner.state.lock();
        if state.active < config.max_workers && state.queue.is_empty() {
            state.active += 1;
            state.peak = state.peak.max(state.active);
            drop(state);
            debug!(%session_id, %execution_id, "worker slot granted");
            return Ok(PoolTicket::Ready(PoolLease::new(self.inner.clone())));
        }
        if state.queue.len() >= config.max_queue {
            let queued = state.queue.len();
            drop(state);
            warn!(%session_id, %execution_id, queued, "worker pool exhausted");
            return Err(PoolError::PoolExhausted { queued });
        }

        let (tx, rx) = oneshot::channel();
        state.next_ticket += 1;
        let ticket = state.next_ticket;
        let deadline = Instant::now() + config.queue_timeout();
        state.queue.push_back(Waiter {
            ticket,
            execution_id: execution_id.clone(),
            deadline,
            tx,
        });
        let position = state.queue.len();
        drop(state);
        debug!(%session_id, %execution_id, position, "worker request queued");
        Ok(PoolTicket::Queued(QueuedRequest {
            inner: self.inner.clone(),
            ticket,
            position,
            deadline,
            rx: Some(rx),
        }))
    }

    pub fn active(&self) -> usize {
        self.inner.state.lock().active
    }

    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Highest number of simultaneously held slots so far.
    pub fn peak_active(&self) -> usize {
        self.inner.state.lock().peak
    }
}

/// A held worker slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct PoolLease {
    inner: Option<Arc<PoolInner>>,
}

impl PoolLease {
    fn new(inner: Arc<PoolInner>) -> Self {
        Self { inner: Some(inner) }
    }

    /// Detach without releasing; used when a handoff bounces back.
    fn disarm(&mut self) {
        self.inner = None;
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
        }
    }
}

#[derive(Debug)]
pub struct QueuedRequest {
    inner: Arc<PoolInner>,
    ticket: u64,
    position: usize,
    deadline: Instant,
    rx: Option<oneshot::Receiver<PoolLease>>,
}

impl QueuedRequest {
    /// 1-based position in the queue when the request was made.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Wait for a slot until the deadline. A request that times out is
    /// removed from the queue and will never run.
    pub async fn wait(mut self) -> Result<PoolLease, PoolError> {
        let Some(mut rx) = self.rx.take() else {
            return Err(PoolError::Closed);
        };
        let waited_from = Instant::now();
        match timeout_at(self.deadline, &mut rx).await {
            Ok(Ok(lease)) => Ok(lease),
            // The sender is only dropped when the dispatcher skips this
            // request as expired.
            Ok(Err(_)) => Err(PoolError::QueueTimeout {
                waited: waited_from.elapsed(),
            }),
            Err(_) => {
                if self.inner.forget(self.ticket) {
                    warn!(ticket = self.ticket, "queued worker request timed out");
                    return Err(PoolError::QueueTimeout {
                        waited: waited_from.elapsed(),
                    });
                }
                // Already dequeued: either handed a slot just before the
                // deadline, or skipped as expired.
                rx.try_recv().map_err(|_| PoolError::QueueTimeout {
                    waited: waited_from.elapsed(),
                })
            }
        }
    }
}

impl Drop for QueuedRequest {
    fn drop(&mut self) {
        self.inner.forget(self.ticket);
    }
}
