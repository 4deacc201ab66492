use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    errors::{BatchError, BatchResult, ConsumerError},
    message::Message,
    source::{Acknowledger, MessageHandler, MessageSource, Subscription},
};

type Envelope = (String, Vec<u8>, u32); // Message ID, body, delivery count

/// In-process broker: publishes into a channel, delivers through a single
/// subscription task and requeues nacked messages at the tail.
#[derive(Clone)]
pub struct MemorySource {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    sender: mpsc::UnboundedSender<Envelope>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    in_flight: DashMap<String, u32>, // Message ID -> delivery count
    max_attempts: Option<u32>,
    log: Mutex<SettlementLog>,
}

#[derive(Default)]
struct SettlementLog {
    acked: Vec<String>,
    nacked: Vec<String>,
    touched: Vec<String>,
    dead_letters: Vec<String>,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new(None)
    }
}

impl MemorySource {
    /// `max_attempts` bounds deliveries per message; a message nacked on its
    /// last attempt is dead-lettered instead of requeued.
    pub fn new(max_attempts: Option<u32>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(MemoryInner {
                sender,
                receiver: Mutex::new(Some(receiver)),
                in_flight: DashMap::new(),
                max_attempts,
                log: Mutex::new(SettlementLog::default()),
            }),
        }
    }

    /// Enqueue a message under a fresh time-ordered id.
    pub fn publish(&self, body: impl Into<Vec<u8>>) -> BatchResult<String> {
        let id = Uuid::now_v7().to_string();
        self.publish_with_id(&id, body)?;

        Ok(id)
    }

    /// Enqueue a message under a caller-chosen id. Publishing an id twice
    /// simulates a broker redelivery.
    pub fn publish_with_id(&self, id: &str, body: impl Into<Vec<u8>>) -> BatchResult<()> {
        self.inner.enqueue((id.to_owned(), body.into(), 1))
    }

    /// Number of delivered messages not yet settled.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub async fn acked(&self) -> Vec<String> {
        self.inner.log.lock().await.acked.clone()
    }

    pub async fn nacked(&self) -> Vec<String> {
        self.inner.log.lock().await.nacked.clone()
    }

    pub async fn touched(&self) -> Vec<String> {
        self.inner.log.lock().await.touched.clone()
    }

    pub async fn dead_letters(&self) -> Vec<String> {
        self.inner.log.lock().await.dead_letters.clone()
    }
}

impl MemoryInner {
    fn enqueue(&self, envelope: Envelope) -> BatchResult<()> {
        self.sender
            .send(envelope)
            .map_err(|_| BatchError::ConnectionError("memory source is closed".to_string()))
    }
}

#[async_trait]
impl Acknowledger for MemoryInner {
    async fn ack(&self, message: &Message) -> Result<(), ConsumerError> {
        self.in_flight.remove(&message.id);
        self.log.lock().await.acked.push(message.id.clone());

        Ok(())
    }

    async fn nack(&self, message: &Message) -> Result<(), ConsumerError> {
        self.in_flight.remove(&message.id);

        let mut log = self.log.lock().await;
        log.nacked.push(message.id.clone());

        if let Some(max_attempts) = self.max_attempts {
            if message.delivery_count >= max_attempts {
                warn!(
                    "Message {} exhausted {} attempts; dead-lettering",
                    message.id, max_attempts
                );
                log.dead_letters.push(message.id.clone());

                return Ok(());
            }
        }

        self.enqueue((
            message.id.clone(),
            message.body.clone(),
            message.delivery_count + 1,
        ))
        .map_err(ConsumerError::from)
    }

    async fn touch(&self, message: &Message) -> Result<(), ConsumerError> {
        debug!("Touched message {}", message.id);
        self.log.lock().await.touched.push(message.id.clone());

        Ok(())
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> BatchResult<Subscription> {
        let mut receiver = self.inner.receiver.lock().await.take().ok_or_else(|| {
            BatchError::ConfigError("memory source already has a subscriber".to_string())
        })?;

        let inner = self.inner.clone();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        debug!("Memory source subscription received shutdown signal. Exiting.");

                        break;
                    }
                    envelope = receiver.recv() => {
                        let Some((id, body, delivery_count)) = envelope else {
                            break;
                        };

                        inner.in_flight.insert(id.clone(), delivery_count);

                        let acknowledger: Arc<dyn Acknowledger> = inner.clone();
                        let message = Message::new(id, body, delivery_count, acknowledger);

                        if let Err(e) = handler.handle(message).await {
                            error!("Handler failed: {}", e);
                        }
                    }
                }
            }

            // Hand the receiver back so a later subscriber sees undelivered messages.
            *inner.receiver.lock().await = Some(receiver);
        });

        Ok(Subscription::new(shutdown_tx, handle))
    }
}
