use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::PgConnection;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info, warn};

use enrich_common::error::StoreError;
use enrich_common::outcome::{EnrichmentError, Outcome, REASON_KEY_FORMAT};
use enrich_common::retry::RetryPolicy;
use enrich_common::store::StatusStore;

use crate::error::WorkerError;
use crate::matcher::{Matcher, Valuation, VehicleKey};
use crate::plate::{PlateClient, PlateDetails};

/// One enrichment pipeline: how to turn a claimed key into a sink row, and
/// how to write a batch of those rows out.
#[async_trait]
pub trait Pipeline: Send + Sync {
    type Row: Send + Sync;

    fn name(&self) -> &'static str;

    /// Enrich a single claimed key. A `RateLimited` error is retried by the
    /// caller; `Invalid` and `Transient` classify the item directly.
    async fn enrich(&self, key: &str) -> Outcome<Self::Row>;

    /// Persist the batch of successful rows on the batch transaction. The
    /// status marks run on the same transaction, so sink rows and marks
    /// commit together or not at all.
    async fn persist(&self, conn: &mut PgConnection, rows: &[Self::Row])
        -> Result<(), WorkerError>;
}

/// Retry `enrich` while the provider rate limits us, waiting a linearly
/// growing backoff between attempts. Exhaustion degrades to a transient
/// error, the item stays retryable on a future run.
pub async fn enrich_with_retry<P: Pipeline>(
    pipeline: &P,
    key: &str,
    policy: &RetryPolicy,
) -> Outcome<P::Row> {
    let mut attempts: u32 = 0;
    loop {
        match pipeline.enrich(key).await {
            Err(EnrichmentError::RateLimited) => {
                attempts += 1;
                if attempts >= policy.max_retries() {
                    error!(key, attempts, "provider kept rate limiting, giving up on this item");
                    return Err(EnrichmentError::transient("RATE_LIMIT_RETRIES_EXHAUSTED"));
                }
                let backoff = policy.backoff(attempts);
                warn!(key, attempts, ?backoff, "rate limited, backing off");
                sleep(backoff).await;
            }
            other => return other,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    pub claimed: usize,
    pub succeeded: usize,
    pub errored: usize,
    pub invalid: usize,
}

impl BatchStats {
    fn merge(&mut self, other: BatchStats) {
        self.claimed += other.claimed;
        self.succeeded += other.succeeded;
        self.errored += other.errored;
        self.invalid += other.invalid;
    }
}

/// Drives one pipeline over its work queue: claim a batch, enrich each item
/// in order, persist the successes and reconcile every claimed item to its
/// terminal or retryable status.
pub struct Reconciler<P: Pipeline> {
    store: StatusStore,
    pipeline: P,
    retry_policy: RetryPolicy,
    batch_size: i64,
}

impl<P: Pipeline> Reconciler<P> {
    pub fn new(store: StatusStore, pipeline: P, retry_policy: RetryPolicy, batch_size: i64) -> Self {
        Self {
            store,
            pipeline,
            retry_policy,
            batch_size,
        }
    }

    /// Process batches until the queue has nothing left to claim.
    pub async fn run(&self) -> Result<BatchStats, WorkerError> {
        let mut totals = BatchStats::default();
        loop {
            let batch = self.run_batch().await?;
            if batch.claimed == 0 {
                break;
            }
            totals.merge(batch);
            // Errored items re-enter the pending pool ahead of new ones, so
            // a batch that only errors would be re-claimed forever. Leave
            // those items for the next scheduled run instead.
            if batch.succeeded == 0 && batch.invalid == 0 {
                warn!(
                    pipeline = self.pipeline.name(),
                    errored = batch.errored,
                    "batch made no progress, stopping the run"
                );
                break;
            }
        }

        info!(
            pipeline = self.pipeline.name(),
            claimed = totals.claimed,
            succeeded = totals.succeeded,
            errored = totals.errored,
            invalid = totals.invalid,
            "run finished"
        );
        Ok(totals)
    }

    /// Claim and process one batch. Items are enriched strictly one at a
    /// time; the provider budget makes concurrency pointless here.
    pub async fn run_batch(&self) -> Result<BatchStats, WorkerError> {
        let items = self.store.claim_pending(self.batch_size).await?;
        if items.is_empty() {
            return Ok(BatchStats::default());
        }

        let labels = [("pipeline", self.pipeline.name())];
        metrics::counter!("enrichment_items_claimed", &labels).increment(items.len() as u64);

        let mut rows = Vec::new();
        let mut succeeded = Vec::new();
        let mut errored = Vec::new();
        let mut invalid: HashMap<String, String> = HashMap::new();

        for item in &items {
            match enrich_with_retry(&self.pipeline, &item.item_key, &self.retry_policy).await {
                Ok(row) => {
                    rows.push(row);
                    succeeded.push(item.item_key.clone());
                }
                Err(EnrichmentError::Invalid(reason)) => {
                    warn!(key = %item.item_key, %reason, "item is permanently invalid");
                    invalid.insert(item.item_key.clone(), reason);
                }
                Err(EnrichmentError::Transient(detail)) => {
                    warn!(key = %item.item_key, %detail, "item failed, will retry on a later run");
                    errored.push(item.item_key.clone());
                }
                Err(EnrichmentError::RateLimited) => {
                    // enrich_with_retry absorbs rate limiting, this arm only
                    // keeps the match exhaustive.
                    errored.push(item.item_key.clone());
                }
            }
        }

        // One transaction for the whole persistence phase: a failure rolls
        // back sink rows and marks together, leaving the batch claimed and
        // re-claimable with no duplicate sink rows committed.
        let mut tx = self.store.begin().await?;
        self.pipeline.persist(&mut tx, &rows).await?;
        self.store.mark_success(&mut tx, &succeeded).await?;
        self.store.mark_invalid(&mut tx, &invalid).await?;
        self.store.mark_error(&mut tx, &errored).await?;
        self.store.commit(tx).await?;

        metrics::counter!("enrichment_items_succeeded", &labels).increment(succeeded.len() as u64);
        metrics::counter!("enrichment_items_errored", &labels).increment(errored.len() as u64);
        metrics::counter!("enrichment_items_invalid", &labels).increment(invalid.len() as u64);

        Ok(BatchStats {
            claimed: items.len(),
            succeeded: succeeded.len(),
            errored: errored.len(),
            invalid: invalid.len(),
        })
    }
}

/// Plate details pipeline: one provider call per plate, rows landing in
/// `plate_details`.
pub struct PlatePipeline {
    client: PlateClient,
}

impl PlatePipeline {
    pub fn new(client: PlateClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Pipeline for PlatePipeline {
    type Row = PlateDetails;

    fn name(&self) -> &'static str {
        "plates"
    }

    async fn enrich(&self, key: &str) -> Outcome<PlateDetails> {
        self.client.lookup(key).await
    }

    async fn persist(
        &self,
        conn: &mut PgConnection,
        rows: &[PlateDetails],
    ) -> Result<(), WorkerError> {
        for row in rows {
            sqlx::query(
                r#"
INSERT INTO plate_details (plate, brand, model, year_manufacture, year_model, color)
VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(&row.plate)
            .bind(&row.brand)
            .bind(&row.model)
            .bind(row.year_manufacture)
            .bind(row.year_model)
            .bind(&row.color)
            .execute(&mut *conn)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;
        }

        Ok(())
    }
}

/// FIPE valuation pipeline: match the catalog, fetch the value, land rows in
/// `fipe_valuations`. The monthly reference table is resolved once, on the
/// first item of the run.
pub struct ValuationPipeline {
    matcher: Matcher,
    reference_table: Mutex<Option<String>>,
}

impl ValuationPipeline {
    pub fn new(matcher: Matcher) -> Self {
        Self {
            matcher,
            reference_table: Mutex::new(None),
        }
    }

    async fn reference_table(&self) -> String {
        let mut cached = self.reference_table.lock().await;
        match cached.as_ref() {
            Some(table) => table.clone(),
            None => {
                let table = self.matcher.client().reference_table().await;
                info!(table, "resolved the current reference table");
                *cached = Some(table.clone());
                table
            }
        }
    }
}

#[async_trait]
impl Pipeline for ValuationPipeline {
    type Row = Valuation;

    fn name(&self) -> &'static str {
        "valuations"
    }

    async fn enrich(&self, key: &str) -> Outcome<Valuation> {
        let key: VehicleKey = key
            .parse()
            .map_err(|_| EnrichmentError::invalid(REASON_KEY_FORMAT))?;

        let table = self.reference_table().await;
        self.matcher.lookup(&key, &table).await
    }

    async fn persist(
        &self,
        conn: &mut PgConnection,
        rows: &[Valuation],
    ) -> Result<(), WorkerError> {
        for row in rows {
            sqlx::query(
                r#"
INSERT INTO fipe_valuations (
    item_key, brand, model, year_model, api_model, api_year_model,
    alternative_search, original_model_label, available_years,
    brand_code, model_code, year_fuel_code, fuel, fipe_code,
    value_text, value_numeric, reference_month
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
                "#,
            )
            .bind(row.key.to_string())
            .bind(&row.key.brand)
            .bind(&row.key.model)
            .bind(row.key.year_model)
            .bind(&row.api_model)
            .bind(row.api_year_model)
            .bind(row.alternative_search)
            .bind(&row.original_model_label)
            .bind(&row.available_years)
            .bind(&row.brand_code)
            .bind(&row.model_code)
            .bind(&row.year_fuel_code)
            .bind(&row.fuel)
            .bind(&row.fipe_code)
            .bind(&row.value_text)
            .bind(row.value_numeric)
            .bind(&row.reference_month)
            .execute(&mut *conn)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;

    struct FlakyPipeline {
        rate_limited_answers: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Pipeline for FlakyPipeline {
        type Row = String;

        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn enrich(&self, key: &str) -> Outcome<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.rate_limited_answers {
                Err(EnrichmentError::RateLimited)
            } else {
                Ok(key.to_owned())
            }
        }

        async fn persist(
            &self,
            _conn: &mut PgConnection,
            _rows: &[String],
        ) -> Result<(), WorkerError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_after_rate_limiting_stops() {
        let pipeline = FlakyPipeline {
            rate_limited_answers: 2,
            calls: AtomicU32::new(0),
        };
        let policy = RetryPolicy::default();

        let start = Instant::now();
        let row = enrich_with_retry(&pipeline, "ABC1234", &policy).await.unwrap();

        assert_eq!(row, "ABC1234");
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 3);
        // Two backoffs: 20s after the first 429 and 25s after the second.
        assert!(start.elapsed() >= Duration::from_secs(45));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_degrades_to_transient() {
        let pipeline = FlakyPipeline {
            rate_limited_answers: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let policy = RetryPolicy::default();

        let result = enrich_with_retry(&pipeline, "ABC1234", &policy).await;

        match result {
            Err(EnrichmentError::Transient(detail)) => {
                assert_eq!(detail, "RATE_LIMIT_RETRIES_EXHAUSTED")
            }
            other => panic!("expected Transient, got {other:?}"),
        }
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_invalid_answers_are_not_retried() {
        struct AlwaysInvalid;

        #[async_trait]
        impl Pipeline for AlwaysInvalid {
            type Row = String;

            fn name(&self) -> &'static str {
                "invalid"
            }

            async fn enrich(&self, _key: &str) -> Outcome<String> {
                Err(EnrichmentError::invalid("404_NOT_FOUND"))
            }

            async fn persist(
                &self,
                _conn: &mut PgConnection,
                _rows: &[String],
            ) -> Result<(), WorkerError> {
                Ok(())
            }
        }

        let result = enrich_with_retry(&AlwaysInvalid, "ABC1234", &RetryPolicy::default()).await;
        match result {
            Err(EnrichmentError::Invalid(reason)) => assert_eq!(reason, "404_NOT_FOUND"),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }
}
