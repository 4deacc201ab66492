use async_trait::async_trait;
use tracing::info;

use crate::{errors::ConsumerError, message::Message};

/// Per-message side effect applied when a batch is flushed.
///
/// Returning an error fails the whole batch: every message in it is nacked
/// and redelivered by the broker, so implementations should be idempotent.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, message: &Message) -> Result<(), ConsumerError>;
}

/// Adapts a synchronous closure into a [`Processor`].
pub struct FnProcessor<F>(F);

impl<F> FnProcessor<F>
where
    F: Fn(&Message) -> Result<(), ConsumerError> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Processor for FnProcessor<F>
where
    F: Fn(&Message) -> Result<(), ConsumerError> + Send + Sync + 'static,
{
    async fn process(&self, message: &Message) -> Result<(), ConsumerError> {
        (self.0)(message)
    }
}

/// Emits every message body as an `info` event and never fails.
pub struct LogProcessor;

#[async_trait]
impl Processor for LogProcessor {
    async fn process(&self, message: &Message) -> Result<(), ConsumerError> {
        info!(
            message_id = %message.id,
            delivery_count = message.delivery_count,
            "{}",
            message.body_lossy()
        );

        Ok(())
    }
}
