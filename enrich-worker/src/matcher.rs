use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use enrich_common::limiter::{RateLimiter, RateLimiterConfig};
use enrich_common::outcome::{
    EnrichmentError, Outcome, REASON_BRAND_NOT_MAPPED, REASON_MODEL_NOT_FOUND,
};

/// Reference table used when the current one cannot be fetched.
const FALLBACK_REFERENCE_TABLE: &str = "327";
const VEHICLE_TYPE_CAR: &str = "1";
const DEFAULT_FUEL_CODE: &str = "1";

/// FIPE brand name to brand code. Keys are the uppercased names as they
/// appear in the upstream plate data, including the common aliases.
static BRAND_CODES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("ACURA", "1"),
        ("AGRALE", "2"),
        ("ALFA ROMEO", "3"),
        ("AUDI", "6"),
        ("BMW", "7"),
        ("BYD", "238"),
        ("CAOA CHERY", "245"),
        ("CHERY", "245"),
        ("CHEVROLET", "23"),
        ("GM", "23"),
        ("CITROËN", "13"),
        ("CITROEN", "13"),
        ("FIAT", "21"),
        ("FORD", "22"),
        ("HONDA", "25"),
        ("HYUNDAI", "26"),
        ("JEEP", "29"),
        ("KIA", "31"),
        ("MERCEDES-BENZ", "39"),
        ("MERCEDES", "39"),
        ("MITSUBISHI", "41"),
        ("NISSAN", "43"),
        ("PEUGEOT", "44"),
        ("PORSCHE", "47"),
        ("RAM", "185"),
        ("RENAULT", "48"),
        ("TOYOTA", "56"),
        ("VOLKSWAGEN", "59"),
        ("VW", "59"),
        ("VOLVO", "58"),
    ])
});

pub fn brand_code(brand: &str) -> Option<&'static str> {
    BRAND_CODES.get(brand.to_uppercase().as_str()).copied()
}

/// The composite business key of a valuation work item, rendered as
/// `BRAND|MODEL|YEAR_FAB|YEAR_MOD` in the queue table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleKey {
    pub brand: String,
    pub model: String,
    pub year_manufacture: i32,
    pub year_model: i32,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseVehicleKeyError(String);

impl fmt::Display for ParseVehicleKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed vehicle key '{}'", self.0)
    }
}

impl fmt::Display for VehicleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.brand, self.model, self.year_manufacture, self.year_model
        )
    }
}

impl FromStr for VehicleKey {
    type Err = ParseVehicleKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('|').collect();
        let [brand, model, year_fab, year_mod] = parts.as_slice() else {
            return Err(ParseVehicleKeyError(s.to_owned()));
        };
        if brand.is_empty() || model.is_empty() {
            return Err(ParseVehicleKeyError(s.to_owned()));
        }
        let year_manufacture = year_fab
            .parse()
            .map_err(|_| ParseVehicleKeyError(s.to_owned()))?;
        let year_model = year_mod
            .parse()
            .map_err(|_| ParseVehicleKeyError(s.to_owned()))?;

        Ok(VehicleKey {
            brand: brand.to_string(),
            model: model.to_string(),
            year_manufacture,
            year_model,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
    #[serde(rename = "Label")]
    pub label: String,
    #[serde(rename = "Value")]
    pub value: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct YearEntry {
    #[serde(rename = "Label")]
    pub label: String,
    #[serde(rename = "Value")]
    pub value: String,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(rename = "Modelos", default)]
    modelos: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ReferenceTableEntry {
    #[serde(rename = "Codigo")]
    codigo: i64,
}

#[derive(Debug, Deserialize)]
pub struct ValuationResponse {
    #[serde(rename = "Valor")]
    pub valor: Option<String>,
    #[serde(rename = "Modelo")]
    pub modelo: Option<String>,
    #[serde(rename = "AnoModelo")]
    pub ano_modelo: Option<i32>,
    #[serde(rename = "Combustivel")]
    pub combustivel: Option<String>,
    #[serde(rename = "CodigoFipe")]
    pub codigo_fipe: Option<String>,
    #[serde(rename = "MesReferencia")]
    pub mes_referencia: Option<String>,
    #[serde(rename = "codigo")]
    codigo: Option<String>,
    #[serde(rename = "erro")]
    erro: Option<String>,
}

/// HTTP client for the FIPE valuation provider. All endpoints are form-POSTs
/// against the same base URL, and every one of them consumes a rate limit
/// slot.
pub struct FipeClient {
    client: reqwest::Client,
    base_url: String,
    limiter: Mutex<RateLimiter>,
}

impl FipeClient {
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

    async fn post_form(&self, endpoint: &str, params: &[(&str, &str)]) -> Outcome<reqwest::Response> {
        self.limiter.lock().await.acquire().await;

        let response = self
            .client
            .post(format!("{}/{}", self.base_url, endpoint))
            .form(params)
            .send()
            .await?;

        match response.status().as_u16() {
            200 => Ok(response),
            429 => Err(EnrichmentError::RateLimited),
            code => Err(EnrichmentError::transient(format!(
                "{endpoint} answered status {code}"
            ))),
        }
    }

    /// The current monthly reference table. Falls back to a known table code
    /// when the provider cannot answer, matching how stale valuations are
    /// preferred over none.
    pub async fn reference_table(&self) -> String {
        match self.post_form("ConsultarTabelaDeReferencia", &[]).await {
            Ok(response) => match response.json::<Vec<ReferenceTableEntry>>().await {
                Ok(tables) if !tables.is_empty() => tables[0].codigo.to_string(),
                _ => FALLBACK_REFERENCE_TABLE.to_owned(),
            },
            Err(error) => {
                warn!(%error, "could not fetch the current reference table, using fallback");
                FALLBACK_REFERENCE_TABLE.to_owned()
            }
        }
    }

    pub async fn models(&self, table: &str, brand_code: &str) -> Outcome<Vec<ModelEntry>> {
        let response = self
            .post_form(
                "ConsultarModelos",
                &[
                    ("codigoTipoVeiculo", VEHICLE_TYPE_CAR),
                    ("codigoTabelaReferencia", table),
                    ("codigoMarca", brand_code),
                ],
            )
            .await?;

        let body: ModelsResponse = response.json().await?;
        Ok(body.modelos)
    }

    pub async fn years(
        &self,
        table: &str,
        brand_code: &str,
        model_code: i64,
    ) -> Outcome<Vec<YearEntry>> {
        let model_code = model_code.to_string();
        let response = self
            .post_form(
                "ConsultarAnoModelo",
                &[
                    ("codigoTipoVeiculo", VEHICLE_TYPE_CAR),
                    ("codigoTabelaReferencia", table),
                    ("codigoMarca", brand_code),
                    ("codigoModelo", &model_code),
                ],
            )
            .await?;

        Ok(response.json().await?)
    }

    pub async fn value(
        &self,
        table: &str,
        brand_code: &str,
        model_code: i64,
        year: &str,
        fuel_code: &str,
    ) -> Outcome<ValuationResponse> {
        let model_code = model_code.to_string();
        let response = self
            .post_form(
                "ConsultarValorComTodosParametros",
                &[
                    ("codigoTabelaReferencia", table),
                    ("codigoMarca", brand_code),
                    ("codigoModelo", &model_code),
                    ("codigoTipoVeiculo", VEHICLE_TYPE_CAR),
                    ("anoModelo", year),
                    ("codigoTipoCombustivel", fuel_code),
                    ("tipoVeiculo", "carro"),
                    ("modeloCodigoExterno", ""),
                    ("tipoConsulta", "tradicional"),
                ],
            )
            .await?;

        let body: ValuationResponse = response.json().await?;
        if body.codigo.as_deref() == Some("2") {
            let detail = body.erro.unwrap_or_else(|| "invalid parameters".to_owned());
            return Err(EnrichmentError::transient(format!(
                "valuation rejected: {detail}"
            )));
        }

        Ok(body)
    }
}

/// A resolved valuation, ready for the sink table. Audit fields record how
/// far the match strayed from the requested model and year.
#[derive(Debug, Clone)]
pub struct Valuation {
    pub key: VehicleKey,
    pub api_model: Option<String>,
    pub api_year_model: Option<i32>,
    pub alternative_search: bool,
    pub original_model_label: Option<String>,
    pub available_years: Option<String>,
    pub brand_code: String,
    pub model_code: String,
    pub year_fuel_code: String,
    pub fuel: Option<String>,
    pub fipe_code: Option<String>,
    pub value_text: Option<String>,
    pub value_numeric: Option<f64>,
    pub reference_month: Option<String>,
}

/// Match a brand/model/year triple against the FIPE catalog and fetch its
/// valuation.
pub struct Matcher {
    client: FipeClient,
}

impl Matcher {
    pub fn new(client: FipeClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &FipeClient {
        &self.client
    }

    /// Resolve one vehicle key to a valuation.
    ///
    /// Matching is in two stages. The model candidates are the catalog
    /// entries containing every keyword of the requested model, falling back
    /// to the first keyword that matches anything. The last candidate is
    /// taken as the primary match, and when its year list misses the
    /// requested year the remaining candidates are probed one by one for a
    /// version sold in that year.
    pub async fn lookup(&self, key: &VehicleKey, table: &str) -> Outcome<Valuation> {
        let Some(brand_code) = brand_code(&key.brand) else {
            return Err(EnrichmentError::invalid(REASON_BRAND_NOT_MAPPED));
        };

        let models = self.client.models(table, brand_code).await?;
        let candidates = filter_candidates(&models, &key.model);
        if candidates.is_empty() {
            return Err(EnrichmentError::invalid(REASON_MODEL_NOT_FOUND));
        }

        // The last candidate tends to be the most complete trim of the model.
        let primary = candidates[candidates.len() - 1].clone();
        debug!(key = %key, model = %primary.label, "primary candidate selected");

        let years = self.client.years(table, brand_code, primary.value).await?;
        let wanted = key.year_model.to_string();

        let mut alternative_search = false;
        let mut original_model_label = None;
        let mut available_years = None;

        let (chosen_model, chosen_year) =
            match years.iter().find(|y| leading_year(y) == wanted) {
                Some(year) => (primary, year.clone()),
                None => {
                    original_model_label = Some(primary.label.clone());
                    available_years = Some(
                        years
                            .iter()
                            .take(10)
                            .map(|y| y.label.as_str())
                            .collect::<Vec<_>>()
                            .join(", "),
                    );

                    info!(
                        key = %key,
                        year = %wanted,
                        "year not sold for the primary candidate, probing other versions"
                    );
                    let found = self
                        .probe_alternatives(table, brand_code, &candidates, &primary, &wanted)
                        .await?;
                    let Some(found) = found else {
                        return Err(EnrichmentError::transient("YEAR_NOT_AVAILABLE"));
                    };

                    alternative_search = true;
                    found
                }
            };

        let year_fuel_code = chosen_year.value.clone();
        let (clean_year, fuel_code) = match year_fuel_code.split_once('-') {
            Some((year, fuel)) => (year, fuel),
            None => (year_fuel_code.as_str(), DEFAULT_FUEL_CODE),
        };

        let valuation = self
            .client
            .value(table, brand_code, chosen_model.value, clean_year, fuel_code)
            .await?;

        Ok(Valuation {
            key: key.clone(),
            api_model: valuation.modelo,
            api_year_model: valuation.ano_modelo,
            alternative_search,
            original_model_label,
            available_years,
            brand_code: brand_code.to_owned(),
            model_code: chosen_model.value.to_string(),
            year_fuel_code,
            fuel: valuation.combustivel,
            fipe_code: valuation.codigo_fipe,
            value_numeric: valuation.valor.as_deref().and_then(parse_currency),
            value_text: valuation.valor,
            reference_month: valuation.mes_referencia,
        })
    }

    /// Probe the remaining candidates for one sold in the wanted year. The
    /// primary is skipped, its years were just fetched. A transient failure
    /// on one candidate moves on to the next; a rate limit stops the probe.
    async fn probe_alternatives(
        &self,
        table: &str,
        brand_code: &str,
        candidates: &[ModelEntry],
        primary: &ModelEntry,
        wanted: &str,
    ) -> Outcome<Option<(ModelEntry, YearEntry)>> {
        for variant in candidates.iter().filter(|m| m.value != primary.value) {
            let years = match self.client.years(table, brand_code, variant.value).await {
                Ok(years) => years,
                Err(EnrichmentError::Transient(detail)) => {
                    debug!(model = %variant.label, %detail, "skipping variant");
                    continue;
                }
                Err(error) => return Err(error),
            };

            if let Some(year) = years.iter().find(|y| leading_year(y) == wanted) {
                info!(model = %variant.label, year = %year.label, "alternative version found");
                return Ok(Some((variant.clone(), year.clone())));
            }
        }

        Ok(None)
    }
}

/// Catalog entries matching the requested model name.
///
/// First pass keeps entries containing every keyword. When that yields
/// nothing, keywords are tried one at a time in order and the first keyword
/// matching anything wins.
pub fn filter_candidates(models: &[ModelEntry], model_name: &str) -> Vec<ModelEntry> {
    let upper = model_name.to_uppercase();
    let keywords: Vec<&str> = upper.split_whitespace().collect();
    if keywords.is_empty() {
        return Vec::new();
    }

    let full: Vec<ModelEntry> = models
        .iter()
        .filter(|m| {
            let label = m.label.to_uppercase();
            keywords.iter().all(|k| label.contains(k))
        })
        .cloned()
        .collect();
    if !full.is_empty() {
        return full;
    }

    for keyword in &keywords {
        let partial: Vec<ModelEntry> = models
            .iter()
            .filter(|m| m.label.to_uppercase().contains(keyword))
            .cloned()
            .collect();
        if !partial.is_empty() {
            return partial;
        }
    }

    Vec::new()
}

/// The year component of a year/fuel entry: the part of Value before the
/// hyphen (`"2020-5"`), or the first token of the Label when Value carries
/// no fuel suffix.
pub fn leading_year(entry: &YearEntry) -> &str {
    match entry.value.split_once('-') {
        Some((year, _)) => year,
        None => entry.label.split_whitespace().next().unwrap_or(""),
    }
}

/// Parse a BRL currency string like `"R$ 12.345,00"`.
pub fn parse_currency(text: &str) -> Option<f64> {
    text.replace("R$", "")
        .trim()
        .replace('.', "")
        .replace(',', ".")
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(label: &str, value: i64) -> ModelEntry {
        ModelEntry {
            label: label.to_owned(),
            value,
        }
    }

    #[test]
    fn test_vehicle_key_renders_and_parses() {
        let key = VehicleKey {
            brand: "FIAT".to_owned(),
            model: "UNO WAY".to_owned(),
            year_manufacture: 2015,
            year_model: 2016,
        };

        let rendered = key.to_string();
        assert_eq!(rendered, "FIAT|UNO WAY|2015|2016");
        assert_eq!(rendered.parse::<VehicleKey>().unwrap(), key);
    }

    #[test]
    fn test_vehicle_key_rejects_malformed_input() {
        assert!("FIAT|UNO|2015".parse::<VehicleKey>().is_err());
        assert!("FIAT|UNO|abc|2016".parse::<VehicleKey>().is_err());
        assert!("|UNO|2015|2016".parse::<VehicleKey>().is_err());
    }

    #[test]
    fn test_brand_code_is_case_insensitive_and_knows_aliases() {
        assert_eq!(brand_code("Fiat"), Some("21"));
        assert_eq!(brand_code("vw"), Some("59"));
        assert_eq!(brand_code("VOLKSWAGEN"), Some("59"));
        assert_eq!(brand_code("DELOREAN"), None);
    }

    #[test]
    fn test_filter_candidates_requires_every_keyword() {
        let models = vec![
            model("CIVIC LX 1.7", 1),
            model("CIVIC SEDAN EX 1.8", 2),
            model("CITY DX 1.5", 3),
        ];

        let found = filter_candidates(&models, "Civic Sedan");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].label, "CIVIC SEDAN EX 1.8");
    }

    #[test]
    fn test_filter_candidates_falls_back_to_first_matching_keyword() {
        let models = vec![
            model("CIVIC LX 1.7", 1),
            model("CIVIC SEDAN EX 1.8", 2),
            model("CITY DX 1.5", 3),
        ];

        // No label contains TOURING, so the first keyword alone decides.
        let found = filter_candidates(&models, "CIVIC TOURING");
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|m| m.label.starts_with("CIVIC")));
    }

    #[test]
    fn test_filter_candidates_empty_when_nothing_matches() {
        let models = vec![model("CIVIC LX 1.7", 1)];
        assert!(filter_candidates(&models, "FUSCA").is_empty());
    }

    #[test]
    fn test_leading_year_handles_both_entry_shapes() {
        let with_fuel = YearEntry {
            label: "2020 Gasolina".to_owned(),
            value: "2020-1".to_owned(),
        };
        let without_fuel = YearEntry {
            label: "2018 Flex".to_owned(),
            value: "2018".to_owned(),
        };

        assert_eq!(leading_year(&with_fuel), "2020");
        assert_eq!(leading_year(&without_fuel), "2018");
    }

    #[test]
    fn test_parse_currency_reads_brl_amounts() {
        assert_eq!(parse_currency("R$ 12.345,00"), Some(12345.0));
        assert_eq!(parse_currency("R$ 1.234.567,89"), Some(1234567.89));
        assert_eq!(parse_currency("R$ 0,00"), Some(0.0));
        assert_eq!(parse_currency("n/a"), None);
    }
}
