//! Claim pending work items and enrich them against the vehicle providers.
use envconfig::Envconfig;
use tracing::info;

use enrich_common::store::StatusStore;
use enrich_worker::config::{Config, PipelineKind};
use enrich_worker::error::WorkerError;
use enrich_worker::matcher::{FipeClient, Matcher};
use enrich_worker::plate::PlateClient;
use enrich_worker::worker::{PlatePipeline, Reconciler, ValuationPipeline};

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let store = StatusStore::new(
        config.queue_table(),
        &config.database_url,
        config.max_pg_connections,
    )
    .await
    .expect("failed to initialize the status store");

    let stats = match config.pipeline {
        PipelineKind::Plates => {
            let client = PlateClient::new(
                &config.plate_api_url,
                config.request_timeout(),
                config.rate_limit.limiter(),
            )?;
            let pipeline = PlatePipeline::new(client);
            Reconciler::new(store, pipeline, config.retry.policy(), config.batch_size)
                .run()
                .await?
        }
        PipelineKind::Valuations => {
            let client = FipeClient::new(
                &config.fipe_api_url,
                config.request_timeout(),
                config.rate_limit.limiter(),
            )?;
            let pipeline = ValuationPipeline::new(Matcher::new(client));
            Reconciler::new(store, pipeline, config.retry.policy(), config.batch_size)
                .run()
                .await?
        }
    };

    info!(
        claimed = stats.claimed,
        succeeded = stats.succeeded,
        errored = stats.errored,
        invalid = stats.invalid,
        "worker done"
    );
    Ok(())
}
