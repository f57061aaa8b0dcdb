use thiserror::Error;

/// Reason codes persisted to `error_reason` when an item is marked Invalid.
pub const REASON_FORMAT: &str = "FORMAT";
pub const REASON_EMPTY_DATA: &str = "EMPTY_DATA";
pub const REASON_BRAND_NOT_MAPPED: &str = "BRAND_NOT_MAPPED";
pub const REASON_MODEL_NOT_FOUND: &str = "MODEL_NOT_FOUND";
pub const REASON_KEY_FORMAT: &str = "KEY_FORMAT";

/// The failure half of an enrichment outcome.
///
/// RateLimited is retried with backoff inside the current run; exhausting
/// retries degrades to a Transient-style Error status, never to Invalid.
/// Invalid is terminal: the item is never retried and the reason is persisted.
/// Transient marks the item Error, eligible for a future run.
#[derive(Error, Debug)]
pub enum EnrichmentError {
    #[error("provider rate limited the request")]
    RateLimited,
    #[error("permanently invalid: {0}")]
    Invalid(String),
    #[error("transient provider failure: {0}")]
    Transient(String),
}

/// Per-item result of an enrichment attempt: a payload, or one of the three
/// failure classes above.
pub type Outcome<T> = Result<T, EnrichmentError>;

impl EnrichmentError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        EnrichmentError::Invalid(reason.into())
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        EnrichmentError::Transient(detail.into())
    }
}

/// Transport-level failures (connect errors, timeouts) are retryable on a
/// future run, not permanently invalid.
impl From<reqwest::Error> for EnrichmentError {
    fn from(error: reqwest::Error) -> Self {
        EnrichmentError::Transient(error.to_string())
    }
}
