use std::sync::Arc;

use async_trait::async_trait;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error};

use crate::{
    errors::{BatchResult, ConsumerError},
    message::Message,
};

/// Outbound half of a broker client: settles delivered messages.
#[async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    /// Mark the message as consumed (finish/commit).
    async fn ack(&self, message: &Message) -> Result<(), ConsumerError>;

    /// Ask the broker to redeliver the message (requeue).
    async fn nack(&self, message: &Message) -> Result<(), ConsumerError>;

    /// Extend the message's in-flight deadline. No-op by default.
    async fn touch(&self, _message: &Message) -> Result<(), ConsumerError> {
        Ok(())
    }
}

/// Outcome of handing a message to a [`MessageHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Buffered; neither acked nor nacked yet.
    Deferred,
    /// Completed a batch that was flushed and acknowledged.
    Flushed(usize),
    /// Already buffered or recently acknowledged; not buffered again.
    Duplicate,
}

/// Inbound half: called by the source for every delivered message.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> BatchResult<Handled>;
}

/// A broker client able to deliver messages to a handler.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> BatchResult<Subscription>;
}

/// A running delivery loop returned by [`MessageSource::subscribe`].
pub struct Subscription {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn new(shutdown_tx: watch::Sender<bool>, handle: JoinHandle<()>) -> Self {
        Self {
            shutdown_tx,
            handle,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop delivering and wait for the current `handle` call to return.
    pub async fn stop(self) {
        if self.shutdown_tx.send(true).is_err() {
            debug!("Subscription loop already exited");
        }

        if let Err(e) = self.handle.await {
            error!("Subscription task failed: {}", e);
        }
    }
}
