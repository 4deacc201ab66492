use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use fred::{
    interfaces::TransactionInterface,
    prelude::{Client, ClientLike, Config, StreamsInterface},
    types::Value,
};
use tokio::{sync::watch, time::sleep};
use tracing::{debug, error};
use uuid::Uuid;

use crate::{
    errors::{BatchResult, ConsumerError},
    message::Message,
    source::{Acknowledger, MessageHandler, MessageSource, Subscription},
};

const DATA_FIELD: &str = "data";
const DELIVERY_COUNT_FIELD: &str = "delivery_count";

/// Redis Streams consumer-group reader.
///
/// `nack` requeues by appending the body to the stream again with an
/// incremented `delivery_count` field and acknowledging the original entry.
/// `touch` re-claims the entry for this consumer, resetting its idle time.
///
/// With a `pending_timeout`, every poll first reclaims entries left pending
/// by any consumer of the group for longer than the timeout (`XAUTOCLAIM`)
/// and redelivers them with an incremented delivery count.
pub struct RedisStreamSource {
    client: Arc<Client>,
    stream: String,
    group: String,
    consumer_name: String,
    count: u64,
    poll_interval: u64,
    pending_timeout: Option<u64>,
}

impl RedisStreamSource {
    pub async fn new(client: Arc<Client>, stream: &str, group: &str) -> BatchResult<Self> {
        client
            .xgroup_create::<(), _, _, _>(stream, group, "$", true)
            .await
            .or_else(|e| {
                if e.details().contains("BUSYGROUP") {
                    debug!(
                        "Consumer group '{}' for stream '{}' already exists. Ignoring error.",
                        group, stream
                    );
                    Ok(())
                } else {
                    Err(e)
                }
            })?;

        Ok(Self {
            client,
            stream: stream.to_owned(),
            group: group.to_owned(),
            consumer_name: format!("batchack-{}-{}", group, Uuid::now_v7()),
            count: 10,
            poll_interval: 100,
            pending_timeout: None,
        })
    }

    pub async fn from_url(url: &str, stream: &str, group: &str) -> BatchResult<Self> {
        let config = Config::from_url(url)?;
        let client = Arc::new(Client::new(config, None, None, None));
        client.connect();
        client.wait_for_connect().await?;

        Self::new(client, stream, group).await
    }

    /// Maximum entries read per poll.
    pub fn count(mut self, count: u64) -> Self {
        self.count = count.max(1);

        self
    }

    /// Sleep between polls that returned nothing, in milliseconds.
    pub fn poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval = ms;

        self
    }

    /// Reclaim entries pending longer than `ms` milliseconds, e.g. left
    /// behind by a consumer that crashed or failed to acknowledge.
    pub fn pending_timeout(mut self, ms: u64) -> Self {
        self.pending_timeout = Some(ms);

        self
    }

    pub fn client(&self) -> Arc<Client> {
        self.client.clone()
    }

    /// Append a message body to the stream.
    pub async fn produce(&self, body: &[u8]) -> BatchResult<String> {
        let id = self
            .client
            .xadd::<String, _, _, _, _>(
                &self.stream,
                false,
                None,
                "*",
                vec![
                    (DATA_FIELD, Value::from(body.to_vec())),
                    (DELIVERY_COUNT_FIELD, Value::from(1_i64)),
                ],
            )
            .await?;

        Ok(id)
    }
}

struct RedisAcknowledger {
    client: Arc<Client>,
    stream: String,
    group: String,
    consumer_name: String,
}

#[async_trait]
impl Acknowledger for RedisAcknowledger {
    async fn ack(&self, message: &Message) -> Result<(), ConsumerError> {
        self.client
            .xack::<i64, _, _, _>(&self.stream, &self.group, &message.id)
            .await
            .map_err(ConsumerError::new)?;

        Ok(())
    }

    async fn nack(&self, message: &Message) -> Result<(), ConsumerError> {
        // Requeue and acknowledge atomically so a failed XACK cannot leave a copy behind.
        let trx = self.client.multi();

        trx.xadd::<(), _, _, _, _>(
            &self.stream,
            false,
            None,
            "*",
            vec![
                (DATA_FIELD, Value::from(message.body.clone())),
                (
                    DELIVERY_COUNT_FIELD,
                    Value::from(i64::from(message.delivery_count) + 1),
                ),
            ],
        )
        .await
        .map_err(ConsumerError::new)?;
        trx.xack::<(), _, _, _>(&self.stream, &self.group, &message.id)
            .await
            .map_err(ConsumerError::new)?;

        trx.exec::<Value>(true).await.map_err(ConsumerError::new)?;

        Ok(())
    }

    async fn touch(&self, message: &Message) -> Result<(), ConsumerError> {
        self.client
            .xclaim::<Vec<String>, _, _, _, _>(
                &self.stream,
                &self.group,
                &self.consumer_name,
                0, // min-idle-time: always reclaim
                &message.id,
                None,  // idle
                None,  // time
                None,  // retrycount
                false, // force
                true,  // justid: retrieve only the message ID
            )
            .await
            .map_err(ConsumerError::new)?;

        Ok(())
    }
}

fn into_message(
    id: String,
    mut fields: HashMap<String, Value>,
    redelivered: bool,
    acknowledger: Arc<dyn Acknowledger>,
) -> Message {
    let body = fields
        .remove(DATA_FIELD)
        .and_then(|value| value.as_bytes().map(<[u8]>::to_vec))
        .unwrap_or_default();
    let mut delivery_count = fields
        .get(DELIVERY_COUNT_FIELD)
        .and_then(Value::as_u64)
        .map_or(1, |count| u32::try_from(count).unwrap_or(u32::MAX));

    if redelivered {
        delivery_count = delivery_count.saturating_add(1);
    }

    Message::new(id, body, delivery_count, acknowledger)
}

#[async_trait]
impl MessageSource for RedisStreamSource {
    async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> BatchResult<Subscription> {
        let client = self.client.clone();
        let stream = self.stream.clone();
        let group = self.group.clone();
        let consumer_name = self.consumer_name.clone();
        let count = self.count;
        let poll_interval = self.poll_interval;
        let pending_timeout = self.pending_timeout;
        let acknowledger: Arc<dyn Acknowledger> = Arc::new(RedisAcknowledger {
            client: client.clone(),
            stream: stream.clone(),
            group: group.clone(),
            consumer_name: consumer_name.clone(),
        });
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            // XAUTOCLAIM cursor; "0-0" restarts the scan of the pending list
            let mut claim_cursor = "0-0".to_string();

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let mut entries = Vec::new();

                if let Some(min_idle) = pending_timeout {
                    match client
                        .xautoclaim_values::<String, String, Value, _, _, _, _>(
                            &stream,
                            &group,
                            &consumer_name,
                            min_idle,
                            claim_cursor.as_str(),
                            Some(count),
                            false,
                        )
                        .await
                    {
                        Ok((next_cursor, claimed)) => {
                            if !claimed.is_empty() {
                                debug!(
                                    "Reclaimed {} stale entries from stream '{}'",
                                    claimed.len(),
                                    stream
                                );
                            }

                            claim_cursor = next_cursor;
                            entries.extend(
                                claimed
                                    .into_iter()
                                    .map(|(id, fields)| (id, fields, true)),
                            );
                        }
                        Err(e) => {
                            error!("Error reclaiming pending entries of '{}': {}", stream, e);
                        }
                    }
                }

                let result = client
                    .xreadgroup_map::<String, String, String, Value, _, _, _, _>(
                        &group,
                        &consumer_name,
                        Some(count),
                        None,
                        false,
                        &stream,
                        ">",
                    )
                    .await;

                match result {
                    Ok(mut streams) => entries.extend(
                        streams
                            .remove(&stream)
                            .unwrap_or_default()
                            .into_iter()
                            .map(|(id, fields)| (id, fields, false)),
                    ),
                    Err(e) => {
                        error!("Error reading stream '{}': {}", stream, e);
                    }
                };

                if entries.is_empty() {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = sleep(Duration::from_millis(poll_interval)) => continue,
                    }
                }

                for (id, fields, redelivered) in entries {
                    let message = into_message(id, fields, redelivered, acknowledger.clone());

                    if let Err(e) = handler.handle(message).await {
                        error!("Handler failed: {}", e);
                    }
                }
            }

            debug!("Redis subscription for '{}' terminated.", consumer_name);
        });

        Ok(Subscription::new(shutdown_tx, handle))
    }
}
