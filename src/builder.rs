use std::sync::Arc;

use crate::{
    errors::{BatchError, BatchResult, ConsumerError},
    message::Message,
    options::{BatchOptions, ShutdownPolicy},
    processor::{FnProcessor, Processor},
    BatchConsumer,
};

pub struct BatchConsumerBuilder {
    processor: Option<Arc<dyn Processor>>,
    options: BatchOptions,
}

impl Default for BatchConsumerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchConsumerBuilder {
    pub fn new() -> Self {
        Self {
            processor: None,
            options: BatchOptions::default(),
        }
    }

    /// The per-message side effect applied on flush.
    pub fn processor<P: Processor>(mut self, processor: P) -> Self {
        self.processor = Some(Arc::new(processor));

        self
    }

    /// Convenience: use a synchronous closure as the processor.
    pub fn on_message<F>(self, f: F) -> Self
    where
        F: Fn(&Message) -> Result<(), ConsumerError> + Send + Sync + 'static,
    {
        self.processor(FnProcessor::new(f))
    }

    pub fn options(mut self, options: BatchOptions) -> Self {
        self.options = options;

        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.options.batch_size = size;

        self
    }

    /// Convenience: set the flush timeout in milliseconds.
    pub fn flush_timeout(mut self, ms: u64) -> Self {
        self.options.flush_timeout = Some(ms);

        self
    }

    /// Never force-flush a partial batch.
    pub fn without_flush_timeout(mut self) -> Self {
        self.options.flush_timeout = None;

        self
    }

    pub fn tick_interval(mut self, ms: u64) -> Self {
        self.options.tick_interval = Some(ms);

        self
    }

    pub fn dedupe_window(mut self, size: usize) -> Self {
        self.options.dedupe_window = Some(size);

        self
    }

    pub fn processing_timeout(mut self, ms: u64) -> Self {
        self.options.processing_timeout = Some(ms);

        self
    }

    pub fn touch_interval(mut self, ms: u64) -> Self {
        self.options.touch_interval = Some(ms);

        self
    }

    pub fn shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.options.shutdown_policy = policy;

        self
    }

    /// Finally build the consumer.
    pub async fn build(self) -> BatchResult<BatchConsumer> {
        let processor = self
            .processor
            .ok_or_else(|| BatchError::ConfigError("`processor` not specified".to_string()))?;

        BatchConsumer::new(processor, self.options).await
    }
}
