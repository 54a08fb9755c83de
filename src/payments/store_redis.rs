//! Redis-backed [`OutcomeStore`].
//!
//! Each order is a JSON document under `v1:payment:outcome:{orderId}`.
//! Merges run as WATCH/MULTI/EXEC so two processes settling the same order
//! cannot interleave their read and write; every committed write is also
//! published on the order's channel for live observers. A new pending record,
//! its pending-index entry and its event are written by one script, so a
//! record is never left out of the index reconciliation walks.

use crate::cache::error::{CacheError, CacheResult};
use crate::cache::keys::payment::{pending_index, OutcomeChannel, OutcomeKey};
use crate::cache::RedisPool;
use crate::payments::error::PaymentResult;
use crate::payments::store::{merge_records, OutcomeStore, OutcomeStream, PersistResult};
use crate::payments::types::{PaymentOutcomeRecord, PaymentStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use tracing::{debug, warn};

const MAX_MERGE_ATTEMPTS: u32 = 8;

/// KEYS: record, pending index, channel. ARGV: record JSON, score, order id.
const CREATE_PENDING_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX') then
    redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
    redis.call('PUBLISH', KEYS[3], ARGV[1])
    return 1
end
return 0
"#;

#[derive(Clone)]
pub struct RedisOutcomeStore {
    pool: RedisPool,
    client: redis::Client,
}

impl RedisOutcomeStore {
    pub fn new(pool: RedisPool, redis_url: &str) -> CacheResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { pool, client })
    }

    async fn read(
        conn: &mut MultiplexedConnection,
        order_id: &str,
    ) -> CacheResult<Option<PaymentOutcomeRecord>> {
        let raw: Option<String> = redis::cmd("GET")
            .arg(OutcomeKey::new(order_id).to_string())
            .query_async(conn)
            .await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn get_record(&self, order_id: &str) -> CacheResult<Option<PaymentOutcomeRecord>> {
        let mut conn = self.pool.get().await?;
        Self::read(&mut conn, order_id).await
    }

    async fn create_pending_record(&self, record: &PaymentOutcomeRecord) -> CacheResult<bool> {
        let mut conn = self.pool.get().await?;
        let json = serde_json::to_string(record)?;
        let created: i64 = redis::Script::new(CREATE_PENDING_SCRIPT)
            .key(OutcomeKey::new(&record.order_id).to_string())
            .key(pending_index())
            .key(OutcomeChannel::new(&record.order_id).to_string())
            .arg(&json)
            .arg(record.created_at.timestamp_millis())
            .arg(&record.order_id)
            .invoke_async(&mut *conn)
            .await?;
        Ok(created == 1)
    }

    async fn merge_record(&self, incoming: &PaymentOutcomeRecord) -> CacheResult<PersistResult> {
        let mut conn = self.pool.get().await?;
        let key = OutcomeKey::new(&incoming.order_id).to_string();

        for attempt in 1..=MAX_MERGE_ATTEMPTS {
            match Self::merge_attempt(&mut conn, &key, incoming).await {
                Ok(Some(result)) => return Ok(result),
                Ok(None) => debug!(
                    order_id = %incoming.order_id,
                    attempt,
                    "outcome record changed during merge, retrying"
                ),
                Err(e) => {
                    // The connection goes back to the pool; it must not keep
                    // watching this key.
                    let unwatched: redis::RedisResult<()> =
                        redis::cmd("UNWATCH").query_async(&mut *conn).await;
                    if let Err(unwatch_err) = unwatched {
                        debug!(error = %unwatch_err, "UNWATCH after failed merge failed");
                    }
                    return Err(e);
                }
            }
        }

        Err(CacheError::ContentionError(format!(
            "gave up merging {} after {} attempts",
            incoming.order_id, MAX_MERGE_ATTEMPTS
        )))
    }

    /// One WATCH/MULTI/EXEC round. `None` means another writer got in first.
    async fn merge_attempt(
        conn: &mut MultiplexedConnection,
        key: &str,
        incoming: &PaymentOutcomeRecord,
    ) -> CacheResult<Option<PersistResult>> {
        let _: () = redis::cmd("WATCH").arg(key).query_async(&mut *conn).await?;
        let existing = Self::read(conn, &incoming.order_id).await?;
        let result = merge_records(existing, incoming);

        if !result.decision.writes() {
            let _: () = redis::cmd("UNWATCH").query_async(&mut *conn).await?;
            return Ok(Some(result));
        }

        let json = serde_json::to_string(&result.record)?;
        let mut pipe = redis::pipe();
        pipe.atomic().set(key, &json).ignore();
        if result.record.status.is_terminal() {
            pipe.zrem(pending_index(), &incoming.order_id).ignore();
        } else {
            pipe.zadd(
                pending_index(),
                &incoming.order_id,
                result.record.created_at.timestamp_millis(),
            )
            .ignore();
        }
        pipe.publish(OutcomeChannel::new(&incoming.order_id).to_string(), &json);

        // EXEC answers nil when the watched key changed underneath us.
        let committed: Option<(i64,)> = pipe.query_async(&mut *conn).await?;
        Ok(committed.map(|_| result))
    }

    async fn watch_record(&self, order_id: &str) -> CacheResult<OutcomeStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub
            .subscribe(OutcomeChannel::new(order_id).to_string())
            .await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "unreadable outcome event payload");
                    return None;
                }
            };
            match serde_json::from_str::<PaymentOutcomeRecord>(&payload) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "malformed outcome event");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn pending_records(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> CacheResult<Vec<PaymentOutcomeRecord>> {
        let mut conn = self.pool.get().await?;
        let order_ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(pending_index())
            .arg("-inf")
            .arg(format!("({}", created_before.timestamp_millis()))
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut *conn)
            .await?;

        let mut records = Vec::with_capacity(order_ids.len());
        for order_id in order_ids {
            match Self::read(&mut conn, &order_id).await? {
                Some(record) if record.status == PaymentStatus::Pending => records.push(record),
                _ => {
                    // Settled or missing: drop the stale index entry.
                    let _: () = redis::cmd("ZREM")
                        .arg(pending_index())
                        .arg(&order_id)
                        .query_async(&mut *conn)
                        .await?;
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl OutcomeStore for RedisOutcomeStore {
    async fn get(&self, order_id: &str) -> PaymentResult<Option<PaymentOutcomeRecord>> {
        Ok(self.get_record(order_id).await?)
    }

    async fn create_pending(&self, record: &PaymentOutcomeRecord) -> PaymentResult<bool> {
        Ok(self.create_pending_record(record).await?)
    }

    async fn merge(&self, incoming: &PaymentOutcomeRecord) -> PaymentResult<PersistResult> {
        Ok(self.merge_record(incoming).await?)
    }

    async fn watch(&self, order_id: &str) -> PaymentResult<OutcomeStream> {
        Ok(self.watch_record(order_id).await?)
    }

    async fn list_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> PaymentResult<Vec<PaymentOutcomeRecord>> {
        Ok(self.pending_records(created_before, limit).await?)
    }
}
