//! Keyed quiet-period debouncing for write notifications.
//!
//! A single save usually reaches the file system as a truncate, several writes
//! and a flush, each reported separately. [`Debouncer`] holds a key back until
//! no notification for it has arrived for a whole window, then emits the key
//! once. Each notification pushes the key's deadline out again.
//!
//! Keys that have not settled when the debouncer is cancelled (or its handle
//! dropped) are discarded, never emitted.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Capacity of the notification queue feeding the debounce task.
const QUEUE_CAPACITY: usize = 1000;

/// Emits each key once it has been quiet for the configured window.
///
/// Fed from the `notify` callback thread through [`try_send`](Self::try_send);
/// must be created inside a Tokio runtime.
#[derive(Debug)]
pub struct Debouncer<K> {
    notify_tx: mpsc::Sender<K>,
    task: JoinHandle<()>,
}

impl<K> Debouncer<K>
where
    K: Clone + Eq + Hash + Send + std::fmt::Debug + 'static,
{
    /// Starts a debouncer that emits settled keys into `settled_tx`.
    #[must_use]
    pub fn new(window: Duration, settled_tx: mpsc::Sender<K>) -> Self {
        let (notify_tx, notify_rx) = mpsc::channel(QUEUE_CAPACITY);
        let task = tokio::spawn(settle_keys(window, notify_rx, settled_tx));
        Self { notify_tx, task }
    }

    /// Records a notification for `key` without waiting.
    ///
    /// Returns `false` if the queue is full or the debouncer was cancelled.
    pub fn try_send(&self, key: K) -> bool {
        self.notify_tx.try_send(key).is_ok()
    }

    /// Stops the debouncer. Unsettled keys are dropped and the settled
    /// channel closes once its receiver has drained it.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl<K> Drop for Debouncer<K> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn settle_keys<K>(window: Duration, mut notify_rx: mpsc::Receiver<K>, settled_tx: mpsc::Sender<K>)
where
    K: Clone + Eq + Hash + std::fmt::Debug,
{
    let mut deadlines: HashMap<K, Instant> = HashMap::new();

    loop {
        let next = deadlines.values().min().copied();
        let wake = async move {
            match next {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            received = notify_rx.recv() => {
                let Some(key) = received else {
                    debug!(discarded = deadlines.len(), "Debouncer input closed");
                    return;
                };
                trace!(key = ?key, "Deadline pushed out");
                deadlines.insert(key, Instant::now() + window);
            }
            () = wake => {
                let now = Instant::now();
                let settled: Vec<K> = deadlines
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(key, _)| key.clone())
                    .collect();

                for key in settled {
                    deadlines.remove(&key);
                    if settled_tx.send(key).await.is_err() {
                        debug!("Settled receiver dropped, stopping debouncer");
                        return;
                    }
                }
            }
        }
    }
}
