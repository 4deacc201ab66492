mod batch;
mod builder;
mod consumer;
mod errors;
mod memory;
mod message;
mod options;
mod processor;
#[cfg(feature = "redis")]
mod redis;
mod source;

pub use builder::BatchConsumerBuilder;
pub use consumer::BatchConsumer;
pub use errors::{BatchError, BatchResult, ConsumerError};
pub use memory::MemorySource;
pub use message::Message;
pub use options::{BatchDefaults, BatchOptions, ShutdownPolicy};
pub use processor::{FnProcessor, LogProcessor, Processor};
#[cfg(feature = "redis")]
pub use redis::RedisStreamSource;
pub use source::{Acknowledger, Handled, MessageHandler, MessageSource, Subscription};
