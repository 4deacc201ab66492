use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{BatchError, BatchResult};

pub struct BatchDefaults;

impl BatchDefaults {
    pub const BATCH_SIZE: usize = 3; // Messages per batch
    pub const FLUSH_TIMEOUT: u64 = 5000; // Max age of a partial batch in milliseconds
    pub const TICK_INTERVAL: u64 = 100; // Flush timer resolution in milliseconds
}

/// What happens to a partial batch when the consumer shuts down.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Process and acknowledge the remaining messages (nack them on failure).
    #[default]
    Flush,
    /// Nack the remaining messages without processing them.
    Nack,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    pub batch_size: usize,               // Messages accumulated before an automatic flush
    pub flush_timeout: Option<u64>,      // Max age (ms) of a partial batch, None=never forced
    pub tick_interval: Option<u64>,      // How often (ms) the flush timer checks the deadline
    pub dedupe_window: Option<usize>,    // Recently acknowledged ids remembered for duplicates
    pub processing_timeout: Option<u64>, // Max time (ms) for a single on_message call
    pub touch_interval: Option<u64>,     // Keep buffered messages alive every n ms
    pub shutdown_policy: ShutdownPolicy, // Fate of the partial batch on shutdown
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: BatchDefaults::BATCH_SIZE,
            flush_timeout: Some(BatchDefaults::FLUSH_TIMEOUT),
            tick_interval: None,
            dedupe_window: None,
            processing_timeout: None,
            touch_interval: None,
            shutdown_policy: ShutdownPolicy::Flush,
        }
    }
}

impl BatchOptions {
    pub fn validate(&self) -> BatchResult<()> {
        if self.batch_size == 0 {
            return Err(BatchError::ConfigError(
                "`batch_size` must be at least 1".to_string(),
            ));
        }

        for (name, value) in [
            ("flush_timeout", self.flush_timeout),
            ("tick_interval", self.tick_interval),
            ("processing_timeout", self.processing_timeout),
            ("touch_interval", self.touch_interval),
        ] {
            if value == Some(0) {
                return Err(BatchError::ConfigError(format!(
                    "`{name}` must be greater than zero"
                )));
            }
        }

        Ok(())
    }

    pub fn flush_timeout(&self) -> Option<Duration> {
        self.flush_timeout.map(Duration::from_millis)
    }

    /// Timer resolution. Defaults to half the flush timeout, capped at
    /// [`BatchDefaults::TICK_INTERVAL`].
    pub fn tick_interval(&self) -> Duration {
        let millis = self.tick_interval.unwrap_or_else(|| match self.flush_timeout {
            Some(timeout) => (timeout / 2).clamp(1, BatchDefaults::TICK_INTERVAL),
            None => BatchDefaults::TICK_INTERVAL,
        });

        Duration::from_millis(millis)
    }

    pub(crate) fn processing_timeout(&self) -> Option<Duration> {
        self.processing_timeout.map(Duration::from_millis)
    }

    pub(crate) fn dedupe_window(&self) -> usize {
        self.dedupe_window.unwrap_or(0)
    }
}
