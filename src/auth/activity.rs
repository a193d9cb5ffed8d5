//! Best-effort last-seen tracking.
//!
//! `touch` only enqueues; a background worker writes `activity:<id>` records
//! to the shared store. A full queue or a failing store loses updates, never
//! requests.

use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error};

use super::clock::Clock;
use crate::store::{SharedStore, StoreResult};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_INACTIVE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[must_use]
pub fn activity_key(principal_id: &str) -> String {
    format!("activity:{principal_id}")
}

#[derive(Debug)]
struct Touch {
    principal_id: String,
    at: i64,
}

#[derive(Clone)]
pub struct ActivityTracker {
    tx: mpsc::Sender<Touch>,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    inactive_timeout: Duration,
}

impl std::fmt::Debug for ActivityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityTracker")
            .field("inactive_timeout", &self.inactive_timeout)
            .finish_non_exhaustive()
    }
}

impl ActivityTracker {
    /// Start the tracker and its writer task.
    ///
    /// The worker stops once every clone of the tracker has been dropped.
    #[must_use]
    pub fn spawn(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        capacity: usize,
        retention: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Touch>(capacity.max(1));
        let worker_store = store.clone();
        let worker = tokio::spawn(async move {
            while let Some(touch) = rx.recv().await {
                let key = activity_key(&touch.principal_id);
                let value = touch.at.to_string();
                if let Err(err) = worker_store.set(&key, &value, Some(retention)).await {
                    error!(principal = %touch.principal_id, "Failed to record activity: {err}");
                }
            }
            debug!("activity worker stopped");
        });

        let tracker = Self {
            tx,
            store,
            clock,
            inactive_timeout: DEFAULT_INACTIVE_TIMEOUT,
        };
        (tracker, worker)
    }

    #[must_use]
    pub fn with_inactive_timeout(mut self, timeout: Duration) -> Self {
        self.inactive_timeout = timeout;
        self
    }

    /// Record that `principal_id` was just seen. Never blocks.
    pub fn touch(&self, principal_id: &str) {
        let touch = Touch {
            principal_id: principal_id.to_string(),
            at: self.clock.now(),
        };
        if let Err(err) = self.tx.try_send(touch) {
            debug!("activity update dropped: {err}");
        }
    }

    /// Unix seconds of the last recorded activity.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn last_seen(&self, principal_id: &str) -> StoreResult<Option<i64>> {
        let value = self.store.get(&activity_key(principal_id)).await?;
        Ok(value.and_then(|value| value.parse().ok()))
    }

    /// Seen within the inactivity timeout.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn is_online(&self, principal_id: &str) -> StoreResult<bool> {
        let timeout = i64::try_from(self.inactive_timeout.as_secs()).unwrap_or(i64::MAX);
        Ok(self
            .last_seen(principal_id)
            .await?
            .is_some_and(|seen| self.clock.now().saturating_sub(seen) < timeout))
    }
}
