//! Bulk query engine.
//!
//! Sweeps a large address list against a console that drops packets when
//! flooded. Retries follow the reliable-request shape: per-attempt timeout,
//! bounded retries, a recorded no-value sentinel when an address never
//! answers. Pacing keeps successive sends a minimum gap apart regardless of
//! how wide the in-flight window is.
//!
//! Results always come back in input order; the windowed concurrency is an
//! ordered pipeline, not a free-for-all.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::StreamExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::osc::OscValue;
use crate::session::{SessionError, X32Session};

/// Tuning for one sweep.
#[derive(Debug, Clone)]
pub struct SweepPolicy {
    /// Timeout per request attempt.
    pub per_request_timeout: Duration,
    /// Total attempts per address before the sentinel is recorded.
    pub max_attempts: u32,
    /// Maximum concurrent in-flight requests.
    pub inflight_window: usize,
    /// Minimum wall-clock gap between successive sends.
    pub inter_send_gap: Duration,
    /// Invoke the progress callback every Nth completed address.
    pub progress_every: usize,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            per_request_timeout: Duration::from_millis(500),
            max_attempts: 3,
            inflight_window: 1,
            inter_send_gap: Duration::from_millis(2),
            progress_every: 1,
        }
    }
}

impl SweepPolicy {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_request_timeout = timeout;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.inflight_window = window.max(1);
        self
    }

    pub fn with_gap(mut self, gap: Duration) -> Self {
        self.inter_send_gap = gap;
        self
    }

    pub fn with_progress_every(mut self, every: usize) -> Self {
        self.progress_every = every.max(1);
        self
    }
}

/// One swept address with its reply, or the no-value sentinel.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepItem {
    pub address: String,
    /// `None` when every attempt timed out.
    pub values: Option<Vec<OscValue>>,
}

impl SweepItem {
    pub fn is_missing(&self) -> bool {
        self.values.is_none()
    }
}

/// Sweep failure; both variants carry whatever completed in input order.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("sweep canceled after {} of {total} addresses", .partial.len())]
    Canceled {
        partial: Vec<SweepItem>,
        total: usize,
    },
    #[error("session lost mid-sweep: {reason}")]
    SessionLost {
        reason: String,
        partial: Vec<SweepItem>,
        total: usize,
    },
}

enum ItemOutcome {
    Done(SweepItem),
    Canceled,
    Lost(String),
}

/// Enforces the inter-send gap across all in-flight workers.
struct Pacer {
    last: Mutex<Instant>,
    gap: Duration,
}

impl Pacer {
    fn new(gap: Duration) -> Self {
        Self {
            // Backdate so the first send goes out immediately.
            last: Mutex::new(Instant::now() - gap),
            gap,
        }
    }

    async fn wait(&self) {
        if self.gap.is_zero() {
            return;
        }
        let mut last = self.last.lock().await;
        let due = *last + self.gap;
        let now = Instant::now();
        if due > now {
            tokio::time::sleep_until(due).await;
        }
        *last = Instant::now();
    }
}

/// Sweep `addresses` in order, invoking `progress(completed, total)` as
/// items resolve.
///
/// Cancellation stops new sends immediately; in-flight requests resolve or
/// time out on their own and the call returns `Canceled` with the partial
/// result. A transport failure winds the sweep down the same way and
/// returns `SessionLost`.
pub async fn sweep<F>(
    session: &Arc<X32Session>,
    addresses: &[String],
    policy: &SweepPolicy,
    mut progress: F,
    cancel: &CancellationToken,
) -> Result<Vec<SweepItem>, SweepError>
where
    F: FnMut(usize, usize),
{
    let total = addresses.len();
    let pacer = Arc::new(Pacer::new(policy.inter_send_gap));
    // Child token so a transport failure can wind down workers without
    // canceling the caller's token.
    let local = cancel.child_token();

    let mut stream = futures::stream::iter(addresses.iter().cloned())
        .map(|address| {
            let session = session.clone();
            let pacer = pacer.clone();
            let policy = policy.clone();
            let local = local.clone();
            async move { query_one(&session, address, &policy, &pacer, &local).await }
        })
        .buffered(policy.inflight_window.max(1));

    let mut results: Vec<SweepItem> = Vec::with_capacity(total);
    let mut completed = 0usize;
    let mut lost: Option<String> = None;

    while let Some(outcome) = stream.next().await {
        match outcome {
            ItemOutcome::Done(item) => {
                completed += 1;
                results.push(item);
                if completed % policy.progress_every == 0 || completed == total {
                    progress(completed, total);
                }
            }
            ItemOutcome::Canceled => {
                // Keep draining: outstanding workers finish on their own,
                // unstarted ones short-circuit here immediately.
            }
            ItemOutcome::Lost(reason) => {
                if lost.is_none() {
                    warn!("sweep aborting: {}", reason);
                    lost = Some(reason);
                    local.cancel();
                }
            }
        }
    }

    if let Some(reason) = lost {
        return Err(SweepError::SessionLost {
            reason,
            partial: results,
            total,
        });
    }
    if cancel.is_cancelled() && results.len() < total {
        debug!("sweep canceled with {}/{} complete", results.len(), total);
        return Err(SweepError::Canceled {
            partial: results,
            total,
        });
    }
    Ok(results)
}

async fn query_one(
    session: &X32Session,
    address: String,
    policy: &SweepPolicy,
    pacer: &Pacer,
    cancel: &CancellationToken,
) -> ItemOutcome {
    for attempt in 1..=policy.max_attempts {
        if cancel.is_cancelled() {
            return ItemOutcome::Canceled;
        }
        pacer.wait().await;
        if cancel.is_cancelled() {
            return ItemOutcome::Canceled;
        }

        let request = session.request(&address, Vec::new(), policy.per_request_timeout);
        tokio::select! {
            _ = cancel.cancelled() => return ItemOutcome::Canceled,
            result = request => match result {
                Ok(values) => {
                    return ItemOutcome::Done(SweepItem {
                        address: address.clone(),
                        values: Some(values),
                    });
                }
                Err(e) if e.is_timeout() => {
                    trace!(
                        "sweep: {} attempt {}/{} timed out",
                        address, attempt, policy.max_attempts
                    );
                }
                Err(e) => return ItemOutcome::Lost(e.to_string()),
            },
        }
    }

    debug!(
        "sweep: no reply from {} after {} attempts, recording no-value",
        address, policy.max_attempts
    );
    ItemOutcome::Done(SweepItem {
        address,
        values: None,
    })
}
