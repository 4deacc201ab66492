use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::de::DeserializeOwned;
use tokio::{sync::Mutex, task::JoinHandle, time::sleep};
use tracing::{debug, error, warn};

use crate::{
    errors::{BatchError, BatchResult},
    source::Acknowledger,
};

struct MessageState {
    settled: AtomicBool,
    keep_alive_stop: AtomicBool,
    keep_alive_handle: Mutex<Option<JoinHandle<()>>>,
}

/// A delivered message together with the handle used to settle it.
///
/// Clones share settlement state: acknowledging one clone settles them all.
#[derive(Clone)]
pub struct Message {
    pub id: String,
    pub body: Vec<u8>,
    pub delivery_count: u32,
    acknowledger: Arc<dyn Acknowledger>,
    state: Arc<MessageState>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("body_len", &self.body.len())
            .field("delivery_count", &self.delivery_count)
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        body: impl Into<Vec<u8>>,
        delivery_count: u32,
        acknowledger: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
            delivery_count,
            acknowledger,
            state: Arc::new(MessageState {
                settled: AtomicBool::new(false),
                keep_alive_stop: AtomicBool::new(false),
                keep_alive_handle: Mutex::new(None),
            }),
        }
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> BatchResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn body_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Whether the message was already acked or nacked.
    pub fn is_settled(&self) -> bool {
        self.state.settled.load(Ordering::Acquire)
    }

    /// Start touching the message every `interval_millis` so the broker
    /// does not redeliver it while it waits in a batch.
    pub async fn start_keep_alive(&self, interval_millis: u64) {
        let mut handle_lock = self.state.keep_alive_handle.lock().await;

        if handle_lock.is_some() {
            debug!(
                "Keep-alive task is already running for message_id: {}",
                self.id
            );

            return;
        }

        // The task only holds a weak reference so an abandoned message stops it.
        let state = Arc::downgrade(&self.state);
        let id = self.id.clone();
        let body = self.body.clone();
        let delivery_count = self.delivery_count;
        let acknowledger = self.acknowledger.clone();

        let join_handle = tokio::spawn(async move {
            loop {
                sleep(Duration::from_millis(interval_millis)).await;

                let Some(state) = state.upgrade() else {
                    break;
                };

                if state.keep_alive_stop.load(Ordering::Relaxed) {
                    break;
                }

                let message = Message {
                    id: id.clone(),
                    body: body.clone(),
                    delivery_count,
                    acknowledger: acknowledger.clone(),
                    state,
                };

                if let Err(e) = acknowledger.touch(&message).await {
                    error!("Failed to touch message_id {}: {}", id, e);
                }
            }

            debug!("Keep-alive task stopped for message_id: {}", id);
        });

        handle_lock.replace(join_handle);

        debug!(
            "Keep-alive task started for message_id: {} with interval: {} ms",
            self.id, interval_millis
        );
    }

    /// Stop the keep-alive task, if one is running.
    pub async fn stop_keep_alive(&self) {
        self.state.keep_alive_stop.store(true, Ordering::Relaxed);

        let handle = self.state.keep_alive_handle.lock().await.take();

        // Aborted rather than awaited: the task may be mid-sleep.
        if let Some(handle) = handle {
            handle.abort();

            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("Keep-alive task for message_id {} panicked: {}", self.id, e);
                }
            }
        }
    }

    /// Acknowledge the message and stop keep-alive.
    pub async fn ack(&self) -> BatchResult<()> {
        if !self.settle().await {
            return Ok(());
        }

        self.acknowledger
            .ack(self)
            .await
            .map_err(|e| BatchError::AcknowledgeError(format!("ack {}: {}", self.id, e)))
    }

    /// Negatively acknowledge (requeue) the message and stop keep-alive.
    pub async fn nack(&self) -> BatchResult<()> {
        if !self.settle().await {
            return Ok(());
        }

        self.acknowledger
            .nack(self)
            .await
            .map_err(|e| BatchError::AcknowledgeError(format!("nack {}: {}", self.id, e)))
    }

    async fn settle(&self) -> bool {
        self.stop_keep_alive().await;

        if self.state.settled.swap(true, Ordering::AcqRel) {
            warn!("Message {} already settled; ignoring", self.id);

            return false;
        }

        true
    }
}
