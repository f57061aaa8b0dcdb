use enrich_common::error::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    StoreError(#[from] StoreError),
    #[error("failed to build the HTTP client: {0}")]
    ClientBuildError(#[from] reqwest::Error),
}
