use std::sync::Arc;

use async_trait::async_trait;
use tokio::{
    sync::{
        watch::{self, Receiver, Sender},
        Mutex,
    },
    task::JoinHandle,
    time::{interval, timeout, MissedTickBehavior},
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    batch::{Batch, RecentIds},
    errors::{BatchError, BatchResult},
    message::Message,
    options::{BatchOptions, ShutdownPolicy},
    processor::Processor,
    source::{Handled, MessageHandler},
};

struct ConsumerState {
    batch: Batch,
    recent: RecentIds,
    closed: bool,
}

struct Inner {
    consumer_id: String,
    processor: Arc<dyn Processor>,
    options: BatchOptions,
    state: Mutex<ConsumerState>,
    shutdown_tx: Sender<bool>,
    shutdown_rx: Receiver<bool>,
    flush_timer: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut();

        if !state.closed && !state.batch.is_empty() {
            warn!(
                "Consumer '{}' dropped without shutdown; {} buffered messages left unsettled",
                self.consumer_id,
                state.batch.len()
            );
        }
    }
}

/// Accumulates delivered messages into batches of `batch_size` and settles
/// each batch as a unit: all acked after every message was processed, or all
/// nacked as soon as one fails.
///
/// Every operation holds one lock for its whole duration, including the
/// `on_message` calls of a flush. A slow processor therefore delays
/// acknowledgement of the whole batch and blocks concurrent `handle` calls.
#[derive(Clone)]
pub struct BatchConsumer {
    inner: Arc<Inner>,
}

impl BatchConsumer {
    /// Create a consumer and, when `flush_timeout` is set, start its flush timer.
    /// Must be called from within a tokio runtime.
    pub async fn new(processor: Arc<dyn Processor>, options: BatchOptions) -> BatchResult<Self> {
        options.validate()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Format: "consumer-{unique_id}"
        let consumer_id = format!("consumer-{}", Uuid::now_v7());

        let consumer = Self {
            inner: Arc::new(Inner {
                consumer_id,
                processor,
                state: Mutex::new(ConsumerState {
                    batch: Batch::new(options.batch_size),
                    recent: RecentIds::new(options.dedupe_window()),
                    closed: false,
                }),
                options,
                shutdown_tx,
                shutdown_rx,
                flush_timer: Mutex::new(None),
            }),
        };

        if consumer.inner.options.flush_timeout.is_some() {
            let timer = consumer.start_flush_timer();
            *consumer.inner.flush_timer.lock().await = Some(timer);
        }

        Ok(consumer)
    }

    pub fn id(&self) -> &str {
        &self.inner.consumer_id
    }

    pub fn options(&self) -> &BatchOptions {
        &self.inner.options
    }

    /// Number of buffered (in-flight) messages.
    pub async fn pending(&self) -> usize {
        self.inner.state.lock().await.batch.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }

    fn start_flush_timer(&self) -> JoinHandle<()> {
        // The timer must not keep the consumer alive on its own.
        let inner = Arc::downgrade(&self.inner);
        let mut shutdown_rx = self.inner.shutdown_rx.clone();
        let tick = self.inner.options.tick_interval();

        tokio::spawn(async move {
            let mut interval = interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        debug!("Flush timer received shutdown signal. Exiting.");

                        break;
                    }
                    _ = interval.tick() => {
                        let Some(inner) = inner.upgrade() else {
                            break;
                        };

                        let consumer = BatchConsumer { inner };

                        if let Err(e) = consumer.flush_on_timeout().await {
                            error!(
                                "Timed flush failed for consumer '{}': {}",
                                consumer.id(),
                                e
                            );
                        }
                    }
                }
            }

            debug!("Flush timer task completed.");
        })
    }

    /// Buffer a delivered message, flushing synchronously once the batch is full.
    pub async fn handle(&self, message: Message) -> BatchResult<Handled> {
        let mut state = self.inner.state.lock().await;

        if state.closed {
            debug!(
                "Consumer '{}' is closed; requeueing message {}",
                self.inner.consumer_id, message.id
            );

            if let Err(e) = message.nack().await {
                error!("Error requeueing message {}: {}", message.id, e);
            }

            return Err(BatchError::ConsumerClosed);
        }

        if state.batch.contains(&message.id) {
            debug!(
                "Message {} is already buffered; ignoring redelivery",
                message.id
            );

            return Ok(Handled::Duplicate);
        }

        if state.recent.contains(&message.id) {
            debug!(
                "Message {} was recently acknowledged; acknowledging redelivery",
                message.id
            );

            message.ack().await?;

            return Ok(Handled::Duplicate);
        }

        if let Some(interval_millis) = self.inner.options.touch_interval {
            message.start_keep_alive(interval_millis).await;
        }

        state.batch.push(message);

        if !state.batch.is_full() {
            debug!(
                "Deferring processing; {} of {} messages buffered",
                state.batch.len(),
                self.inner.options.batch_size
            );

            return Ok(Handled::Deferred);
        }

        self.flush_locked(&mut state).await.map(Handled::Flushed)
    }

    /// Process and settle the current batch. Returns how many messages were
    /// acknowledged; an empty batch is a no-op.
    pub async fn flush(&self) -> BatchResult<usize> {
        let mut state = self.inner.state.lock().await;

        if state.closed {
            return Err(BatchError::ConsumerClosed);
        }

        self.flush_locked(&mut state).await
    }

    /// Flush the partial batch if its oldest message has been held for at
    /// least `flush_timeout`. Returns how many messages were acknowledged.
    pub async fn flush_on_timeout(&self) -> BatchResult<usize> {
        let Some(deadline) = self.inner.options.flush_timeout() else {
            return Ok(0);
        };

        let mut state = self.inner.state.lock().await;

        if state.closed {
            return Ok(0);
        }

        match state.batch.age() {
            Some(age) if age >= deadline => {
                debug!(
                    "Partial batch of {} held for {:?}; forcing flush",
                    state.batch.len(),
                    age
                );

                self.flush_locked(&mut state).await
            }
            _ => Ok(0),
        }
    }

    /// Stop the flush timer, settle the partial batch according to the
    /// shutdown policy and refuse further messages. Waits for an in-flight
    /// flush to finish first. Calling it again is a no-op.
    pub async fn shutdown(&self) -> BatchResult<()> {
        if self.inner.shutdown_tx.send(true).is_err() {
            warn!("Failed to send shutdown signal; flush timer may not stop.");
        }

        if let Some(handle) = self.inner.flush_timer.lock().await.take() {
            debug!("Waiting for flush timer to terminate...");

            if let Err(e) = handle.await {
                error!("Flush timer task failed: {}", e);
            }
        }

        let mut state = self.inner.state.lock().await;

        if state.closed {
            return Ok(());
        }

        let result = match self.inner.options.shutdown_policy {
            ShutdownPolicy::Flush => self.flush_locked(&mut state).await.map(|_| ()),
            ShutdownPolicy::Nack => {
                let messages = state.batch.drain();

                if !messages.is_empty() {
                    debug!(
                        "Requeueing {} buffered messages on shutdown",
                        messages.len()
                    );
                }

                Self::settle_all(&messages, false).await
            }
        };

        state.closed = true;

        debug!("Consumer '{}' closed.", self.inner.consumer_id);

        result
    }

    async fn flush_locked(&self, state: &mut ConsumerState) -> BatchResult<usize> {
        if state.batch.is_empty() {
            return Ok(0);
        }

        let messages = state.batch.drain();

        debug!(
            "Consumer '{}' flushing batch of {} messages",
            self.inner.consumer_id,
            messages.len()
        );

        // Stop at the first failure: the rest would be redelivered anyway.
        let mut failure = None;

        for message in &messages {
            if let Err(e) = self.process(message).await {
                error!("Error processing message {}: {}", message.id, e);

                failure = Some(e);

                break;
            }
        }

        match failure {
            None => {
                let settled = Self::settle_all(&messages, true).await;

                for message in &messages {
                    state.recent.insert(&message.id);
                }

                settled.map(|_| messages.len())
            }
            Some(e) => {
                warn!(
                    "Requeueing batch of {} messages after processing failure",
                    messages.len()
                );

                if let Err(nack_error) = Self::settle_all(&messages, false).await {
                    error!("Error requeueing failed batch: {}", nack_error);
                }

                Err(e)
            }
        }
    }

    async fn process(&self, message: &Message) -> BatchResult<()> {
        let processing = self.inner.processor.process(message);

        let result = match self.inner.options.processing_timeout() {
            Some(limit) => match timeout(limit, processing).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(BatchError::ProcessingTimeout {
                        message_id: message.id.clone(),
                        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    })
                }
            },
            None => processing.await,
        };

        result.map_err(|source| BatchError::ProcessingError {
            message_id: message.id.clone(),
            source,
        })
    }

    /// Ack (or nack) every message in order. Keeps going past failures and
    /// reports the first one.
    async fn settle_all(messages: &[Message], ack: bool) -> BatchResult<()> {
        let mut first_error = None;

        for message in messages {
            let result = if ack {
                message.ack().await
            } else {
                message.nack().await
            };

            if let Err(e) = result {
                error!("Error settling message {}: {}", message.id, e);

                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MessageHandler for BatchConsumer {
    async fn handle(&self, message: Message) -> BatchResult<Handled> {
        BatchConsumer::handle(self, message).await
    }
}
