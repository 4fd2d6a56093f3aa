//! Usage recording and cached aggregation

use std::sync::Arc;

use cache::TtlCache;
use store::{Store, UsageAggregate, UsageRecord};
use tracing::{debug, warn};

use crate::error::Result;
use crate::pricing::{PricingTable, TokenUsage};

/// Maximum records per store insert.
pub const BATCH_SIZE: usize = 100;

pub struct UsageMeter {
    store: Arc<dyn Store>,
    pricing: PricingTable,
    aggregates: Arc<TtlCache<UsageAggregate>>,
}

impl UsageMeter {
    /// `aggregates` is the `usage` cache namespace; its default TTL bounds
    /// how stale an aggregate can be.
    pub fn new(
        store: Arc<dyn Store>,
        pricing: PricingTable,
        aggregates: Arc<TtlCache<UsageAggregate>>,
    ) -> Self {
        Self {
            store,
            pricing,
            aggregates,
        }
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    pub fn calculate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        self.pricing.calculate_cost(model, input_tokens, output_tokens)
    }

    pub fn calculate_cost_with_cache(&self, model: &str, usage: &TokenUsage) -> f64 {
        self.pricing.calculate_cost_with_cache(model, usage)
    }

    /// Persist one record. Returns `false` when its `request_id` was already
    /// recorded.
    pub async fn record(&self, record: UsageRecord) -> Result<bool> {
        let request_id = record.request_id.clone();
        let inserted = self.store.insert_usage(vec![record]).await? == 1;
        if !inserted {
            debug!(request_id = %request_id, "usage record already present");
        }
        Ok(inserted)
    }

    /// Persist records in chunks of [`BATCH_SIZE`], skipping duplicates.
    /// Returns the number inserted. Stops at the first failing chunk.
    pub async fn record_batch(&self, records: Vec<UsageRecord>) -> Result<usize> {
        let total = records.len();
        let mut inserted = 0;
        let mut records = records.into_iter().peekable();

        while records.peek().is_some() {
            let chunk: Vec<UsageRecord> = records.by_ref().take(BATCH_SIZE).collect();
            match self.store.insert_usage(chunk).await {
                Ok(n) => inserted += n,
                Err(e) => {
                    warn!(inserted, total, error = %e, "usage batch insert failed");
                    return Err(e.into());
                }
            }
        }

        if inserted < total {
            debug!(skipped = total - inserted, "skipped duplicate usage records");
        }
        Ok(inserted)
    }

    /// Totals for `owner_id` over `[from, to)`, served from cache for the
    /// cache's TTL. New records do not invalidate cached aggregates.
    pub async fn aggregate(&self, owner_id: &str, from: u64, to: u64) -> Result<UsageAggregate> {
        let key = format!("{owner_id}:{from}:{to}");
        if let Some(cached) = self.aggregates.get(&key).await {
            return Ok(cached);
        }
        let aggregate = self.store.aggregate_usage(owner_id, from, to).await?;
        self.aggregates.set(key, aggregate.clone()).await;
        Ok(aggregate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use store::JsonStore;

    fn record(request_id: &str, created_at: u64) -> UsageRecord {
        UsageRecord {
            request_id: request_id.into(),
            api_key_id: "key-1".into(),
            owner_id: "team-a".into(),
            upstream_account_id: Some("acct-1".into()),
            model: "claude-sonnet-4".into(),
            status_code: 200,
            response_time_ms: 20,
            input_tokens: 100,
            output_tokens: 50,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            cost_usd: 0.001,
            error_message: None,
            created_at,
        }
    }

    fn meter() -> (UsageMeter, Arc<JsonStore>) {
        let store = Arc::new(JsonStore::in_memory());
        let cache = Arc::new(TtlCache::new("usage", 100, Duration::from_secs(300)));
        (
            UsageMeter::new(store.clone(), PricingTable::default(), cache),
            store,
        )
    }

    #[tokio::test]
    async fn record_is_idempotent_per_request_id() {
        let (meter, store) = meter();
        assert!(meter.record(record("req_1", 1)).await.unwrap());
        assert!(!meter.record(record("req_1", 1)).await.unwrap());
        assert_eq!(store.usage_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn batch_spans_multiple_chunks_and_skips_duplicates() {
        let (meter, store) = meter();
        let mut records: Vec<UsageRecord> =
            (0..250).map(|i| record(&format!("req_{i}"), i)).collect();
        records.push(record("req_7", 7));

        assert_eq!(meter.record_batch(records).await.unwrap(), 250);
        assert_eq!(store.usage_count().await.unwrap(), 250);
        assert_eq!(meter.record_batch(Vec::new()).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn aggregate_is_cached_until_ttl() {
        let (meter, _store) = meter();
        meter.record(record("req_1", 10)).await.unwrap();

        let first = meter.aggregate("team-a", 0, 100).await.unwrap();
        assert_eq!(first.total_requests, 1);

        meter.record(record("req_2", 20)).await.unwrap();
        let cached = meter.aggregate("team-a", 0, 100).await.unwrap();
        assert_eq!(cached.total_requests, 1, "served from cache");

        // A different window is a different key
        let other = meter.aggregate("team-a", 0, 101).await.unwrap();
        assert_eq!(other.total_requests, 2);

        tokio::time::advance(Duration::from_secs(301)).await;
        let fresh = meter.aggregate("team-a", 0, 100).await.unwrap();
        assert_eq!(fresh.total_requests, 2);
        assert_eq!(fresh.input_tokens, 200);
    }

    #[test]
    fn cost_delegates_to_pricing_table() {
        let (meter, _) = meter();
        assert_eq!(
            meter.calculate_cost("claude-sonnet-4", 50, 20),
            meter.pricing().calculate_cost("claude-sonnet-4", 50, 20)
        );
    }
}
