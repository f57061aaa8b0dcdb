use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::warn;

use enrich_common::limiter::{RateLimiter, RateLimiterConfig};
use enrich_common::outcome::{EnrichmentError, Outcome, REASON_EMPTY_DATA, REASON_FORMAT};

// Old format ABC1234 and Mercosul format ABC1D23.
static PLATE_OLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z]{3}\d{4}$").unwrap());
static PLATE_MERCOSUL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z]{3}\d[A-Z]\d{2}$").unwrap());

/// Normalize a raw plate and check it against the two accepted formats.
/// Rejection is decided locally, before any provider call.
pub fn validate_plate(raw: &str) -> Outcome<String> {
    let clean: String = raw
        .trim()
        .chars()
        .filter(|c| *c != '-' && *c != ' ')
        .collect::<String>()
        .to_uppercase();

    if PLATE_OLD.is_match(&clean) || PLATE_MERCOSUL.is_match(&clean) {
        Ok(clean)
    } else {
        Err(EnrichmentError::invalid(REASON_FORMAT))
    }
}

/// What the provider knows about one plate.
#[derive(Debug, Clone)]
pub struct PlateDetails {
    pub plate: String,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub year_manufacture: Option<i32>,
    pub year_model: Option<i32>,
    pub color: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlateResponse {
    #[serde(default)]
    success: bool,
    data: Option<PlateData>,
}

#[derive(Debug, Deserialize)]
struct PlateData {
    marca: Option<String>,
    modelo: Option<String>,
    ano_fabricacao: Option<i32>,
    ano_modelo: Option<i32>,
    cor: Option<String>,
}

/// HTTP client for the plate details provider.
///
/// Every outbound request passes through the rate limiter, so the provider
/// never sees more than the window budget regardless of who calls us.
pub struct PlateClient {
    client: reqwest::Client,
    base_url: String,
    limiter: Mutex<RateLimiter>,
}

impl PlateClient {
    pub fn new(
        base_url: &str,
        request_timeout: Duration,
        limiter: RateLimiterConfig,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.to_owned(),
            limiter: Mutex::new(RateLimiter::new(limiter)),
        })
    }

    /// Look up one plate. A malformed plate is rejected without consuming
    /// any rate limit budget.
    pub async fn lookup(&self, plate: &str) -> Outcome<PlateDetails> {
        let normalized = validate_plate(plate)?;

        self.limiter.lock().await.acquire().await;

        let response = self
            .client
            .post(&self.base_url)
            .json(&serde_json::json!({ "placa": normalized }))
            .send()
            .await?;

        let status = response.status();
        match status.as_u16() {
            400 => Err(EnrichmentError::invalid("400_INVALID_DATA")),
            403 => Err(EnrichmentError::invalid("403_FORBIDDEN")),
            404 => Err(EnrichmentError::invalid("404_NOT_FOUND")),
            429 => Err(EnrichmentError::RateLimited),
            code if code >= 500 => Err(EnrichmentError::invalid(format!("{code}_SERVER_ERROR"))),
            200 => {
                let body: PlateResponse = response.json().await?;
                match body.data {
                    Some(data) if body.success => {
                        if data.marca.is_none() && data.modelo.is_none() {
                            // The provider answered but knows nothing about
                            // this plate, retrying will not change that.
                            return Err(EnrichmentError::invalid(REASON_EMPTY_DATA));
                        }
                        Ok(PlateDetails {
                            plate: normalized,
                            brand: data.marca,
                            model: data.modelo,
                            year_manufacture: data.ano_fabricacao,
                            year_model: data.ano_modelo,
                            color: data.cor.map(|c| c.to_uppercase()),
                        })
                    }
                    _ => {
                        warn!(plate = %normalized, "provider answered 200 without a payload");
                        Err(EnrichmentError::transient("200_WITHOUT_PAYLOAD"))
                    }
                }
            }
            code => Err(EnrichmentError::transient(format!(
                "unexpected status {code}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_plate_accepts_both_formats() {
        assert_eq!(validate_plate("ABC1234").unwrap(), "ABC1234");
        assert_eq!(validate_plate("abc-1234").unwrap(), "ABC1234");
        assert_eq!(validate_plate(" abc 1d23 ").unwrap(), "ABC1D23");
    }

    #[test]
    fn test_validate_plate_rejects_malformed_input() {
        for raw in ["", "AB1234", "ABCD123", "1231234", "ABC12D4"] {
            match validate_plate(raw) {
                Err(EnrichmentError::Invalid(reason)) => assert_eq!(reason, REASON_FORMAT),
                other => panic!("expected Invalid(FORMAT) for {raw:?}, got {other:?}"),
            }
        }
    }
}
