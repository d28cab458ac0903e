//! Sharded notification dispatch.
//!
//! Each resource identity hashes to exactly one lane. A lane is an mpsc
//! queue drained by a single task, so reconciliations for one identity are
//! strictly sequential while identities on different lanes run in parallel.
//! Failed reconciliations are redelivered to the same lane after a backoff.
//! A key has at most one redelivery pending at a time; failures of fresh
//! notifications for that key merge into it.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::notification::Notification;
use crate::reconcile::Reconcile;
use crate::retry::Backoff;

/// Dispatcher tuning.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Number of worker lanes
    pub lanes: usize,
    /// Queue depth per lane
    pub queue_depth: usize,
    /// Redelivery policy
    pub backoff: Backoff,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            lanes: 4,
            queue_depth: 256,
            backoff: Backoff::default(),
        }
    }
}

/// Dispatch errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Dispatcher lane {lane} is closed")]
    LaneClosed { lane: usize },
}

/// Lane queue entry.
#[derive(Debug)]
struct Queued {
    notification: Notification,
    redelivery: bool,
}

/// Dispatcher mapping resource identities onto sequential worker lanes.
pub struct ShardedDispatcher {
    lanes: Vec<mpsc::Sender<Queued>>,
    workers: Vec<JoinHandle<()>>,
}

impl ShardedDispatcher {
    /// Spawns one worker task per lane. Must be called inside a tokio runtime.
    pub fn start<R: Reconcile>(reconciler: Arc<R>, config: DispatcherConfig) -> Self {
        let lane_count = config.lanes.max(1);
        let mut lanes = Vec::with_capacity(lane_count);
        let mut workers = Vec::with_capacity(lane_count);

        for lane in 0..lane_count {
            let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
            let worker = LaneWorker {
                lane,
                reconciler: reconciler.clone(),
                backoff: config.backoff,
                requeue: tx.downgrade(),
                attempts: HashMap::new(),
                pending: HashSet::new(),
            };
            workers.push(tokio::spawn(worker.run(rx)));
            lanes.push(tx);
        }

        info!(
            reconciler = reconciler.name(),
            lanes = lane_count,
            "Dispatcher started"
        );

        Self { lanes, workers }
    }

    /// Returns the number of lanes.
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Returns the lane a key is pinned to.
    pub fn lane_for(&self, key: &str) -> usize {
        lane_index(key, self.lanes.len())
    }

    /// Queues a notification on the lane owning its key.
    pub async fn submit(&self, notification: Notification) -> Result<(), DispatchError> {
        let lane = self.lane_for(&notification.key);
        self.lanes[lane]
            .send(Queued {
                notification,
                redelivery: false,
            })
            .await
            .map_err(|_| DispatchError::LaneClosed { lane })
    }

    /// Stops accepting notifications and waits for queued work to drain.
    ///
    /// Pending redeliveries are dropped.
    pub async fn shutdown(self) {
        drop(self.lanes);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Dispatcher lane terminated abnormally");
            }
        }
        info!("Dispatcher stopped");
    }
}

fn lane_index(key: &str, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % lanes.max(1) as u64) as usize
}

struct LaneWorker<R> {
    lane: usize,
    reconciler: Arc<R>,
    backoff: Backoff,
    requeue: mpsc::WeakSender<Queued>,
    /// Consecutive failures per key, reset on success
    attempts: HashMap<String, u32>,
    /// Keys with a redelivery sleeping or queued
    pending: HashSet<String>,
}

impl<R: Reconcile> LaneWorker<R> {
    async fn run(mut self, mut rx: mpsc::Receiver<Queued>) {
        while let Some(Queued {
            notification,
            redelivery,
        }) = rx.recv().await
        {
            if redelivery {
                self.pending.remove(&notification.key);
            }

            match self.reconciler.reconcile(&notification).await {
                Ok(()) => {
                    self.attempts.remove(&notification.key);
                    debug!(lane = self.lane, key = %notification.key, op = %notification.op, "Reconciled");
                }
                Err(e) => {
                    let status = e.to_status();
                    if status.is_success() {
                        self.attempts.remove(&notification.key);
                        debug!(lane = self.lane, key = %notification.key, reason = %e, "Notification ignored");
                        continue;
                    }

                    let attempt = self.attempts.entry(notification.key.clone()).or_insert(0);
                    *attempt += 1;
                    let delay = if status.is_retryable() {
                        self.backoff.delay(*attempt)
                    } else {
                        self.backoff.fatal_delay()
                    };

                    warn!(
                        lane = self.lane,
                        key = %notification.key,
                        attempt = *attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Reconcile failed, scheduling redelivery"
                    );
                    if self.pending.contains(&notification.key) {
                        debug!(lane = self.lane, key = %notification.key, "Redelivery already pending");
                        continue;
                    }
                    self.pending.insert(notification.key.clone());
                    self.redeliver(notification, delay);
                }
            }
        }
        debug!(lane = self.lane, "Lane drained");
    }

    fn redeliver(&self, notification: Notification, delay: Duration) {
        let requeue = self.requeue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = requeue.upgrade() {
                let _ = tx
                    .send(Queued {
                        notification,
                        redelivery: true,
                    })
                    .await;
            }
        });
    }
}
