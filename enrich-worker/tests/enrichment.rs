use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;

use enrich_common::limiter::RateLimiterConfig;
use enrich_common::outcome::EnrichmentError;
use enrich_worker::matcher::{FipeClient, Matcher, VehicleKey};
use enrich_worker::plate::PlateClient;

const TIMEOUT: Duration = Duration::from_secs(2);

// A budget wide enough that tests never sleep on the limiter.
fn test_limiter() -> RateLimiterConfig {
    RateLimiterConfig {
        requests_per_window: 10_000,
        window: Duration::from_secs(60),
        min_interval: Duration::ZERO,
    }
}

fn plate_client(server: &MockServer) -> PlateClient {
    PlateClient::new(&server.url("/api/consulta"), TIMEOUT, test_limiter()).unwrap()
}

fn matcher(server: &MockServer) -> Matcher {
    Matcher::new(FipeClient::new(&server.url(""), TIMEOUT, test_limiter()).unwrap())
}

fn key(brand: &str, model: &str, year: i32) -> VehicleKey {
    VehicleKey {
        brand: brand.to_owned(),
        model: model.to_owned(),
        year_manufacture: year,
        year_model: year,
    }
}

#[tokio::test]
async fn test_plate_lookup_parses_a_successful_answer() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/api/consulta")
            .json_body(json!({ "placa": "ABC1234" }));
        then.status(200).json_body(json!({
            "success": true,
            "data": {
                "marca": "FIAT",
                "modelo": "UNO WAY 1.0",
                "ano_fabricacao": 2015,
                "ano_modelo": 2016,
                "cor": "prata"
            }
        }));
    });

    let details = plate_client(&server).lookup("abc-1234").await.unwrap();

    mock.assert();
    assert_eq!(details.plate, "ABC1234");
    assert_eq!(details.brand.as_deref(), Some("FIAT"));
    assert_eq!(details.year_model, Some(2016));
    assert_eq!(details.color.as_deref(), Some("PRATA"));
}

#[tokio::test]
async fn test_plate_lookup_rejects_malformed_plates_without_calling_out() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/api/consulta");
        then.status(200).json_body(json!({ "success": true }));
    });

    let result = plate_client(&server).lookup("AB1234").await;

    match result {
        Err(EnrichmentError::Invalid(reason)) => assert_eq!(reason, "FORMAT"),
        other => panic!("expected Invalid(FORMAT), got {other:?}"),
    }
    mock.assert_hits(0);
}

#[tokio::test]
async fn test_plate_lookup_distinguishes_not_found_from_empty_answers() {
    let server = MockServer::start();

    // 404 at the HTTP layer.
    let mut not_found = server.mock(|when, then| {
        when.method(POST).path("/api/consulta");
        then.status(404);
    });
    match plate_client(&server).lookup("ABC1234").await {
        Err(EnrichmentError::Invalid(reason)) => assert_eq!(reason, "404_NOT_FOUND"),
        other => panic!("expected Invalid(404_NOT_FOUND), got {other:?}"),
    }
    not_found.delete();

    // 200 with a payload that carries neither brand nor model.
    server.mock(|when, then| {
        when.method(POST).path("/api/consulta");
        then.status(200).json_body(json!({
            "success": true,
            "data": { "cor": "preto" }
        }));
    });
    match plate_client(&server).lookup("ABC1234").await {
        Err(EnrichmentError::Invalid(reason)) => assert_eq!(reason, "EMPTY_DATA"),
        other => panic!("expected Invalid(EMPTY_DATA), got {other:?}"),
    }
}

#[tokio::test]
async fn test_plate_lookup_maps_429_to_rate_limited() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/consulta");
        then.status(429);
    });

    let result = plate_client(&server).lookup("ABC1234").await;
    assert!(matches!(result, Err(EnrichmentError::RateLimited)));
}

#[tokio::test]
async fn test_matcher_rejects_unmapped_brands_without_calling_out() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST);
        then.status(200).json_body(json!({ "Modelos": [] }));
    });

    let result = matcher(&server).lookup(&key("DELOREAN", "DMC-12", 1985), "327").await;

    match result {
        Err(EnrichmentError::Invalid(reason)) => assert_eq!(reason, "BRAND_NOT_MAPPED"),
        other => panic!("expected Invalid(BRAND_NOT_MAPPED), got {other:?}"),
    }
    mock.assert_hits(0);
}

#[tokio::test]
async fn test_matcher_reports_models_missing_from_the_catalog() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/ConsultarModelos");
        then.status(200).json_body(json!({
            "Modelos": [{ "Label": "CIVIC LX 1.7", "Value": 10 }]
        }));
    });

    let result = matcher(&server).lookup(&key("HONDA", "FUSCA", 2010), "327").await;

    match result {
        Err(EnrichmentError::Invalid(reason)) => assert_eq!(reason, "MODEL_NOT_FOUND"),
        other => panic!("expected Invalid(MODEL_NOT_FOUND), got {other:?}"),
    }
}

#[tokio::test]
async fn test_matcher_falls_back_to_the_first_keyword() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/ConsultarModelos");
        then.status(200).json_body(json!({
            "Modelos": [
                { "Label": "CIVIC LX 1.7", "Value": 10 },
                { "Label": "CIVIC SEDAN EX 1.8", "Value": 11 },
                { "Label": "CITY DX 1.5", "Value": 12 }
            ]
        }));
    });
    // No label contains TOURING, so CIVIC alone selects the candidates and
    // the last of them (the SEDAN EX) becomes the primary match.
    server.mock(|when, then| {
        when.method(POST)
            .path("/ConsultarAnoModelo")
            .body_contains("codigoModelo=11");
        then.status(200).json_body(json!([
            { "Label": "2020 Gasolina", "Value": "2020-1" }
        ]));
    });
    let value = server.mock(|when, then| {
        when.method(POST)
            .path("/ConsultarValorComTodosParametros")
            .body_contains("codigoModelo=11")
            .body_contains("anoModelo=2020");
        then.status(200).json_body(json!({
            "Valor": "R$ 65.000,00",
            "Modelo": "CIVIC SEDAN EX 1.8",
            "AnoModelo": 2020,
            "Combustivel": "Gasolina",
            "CodigoFipe": "014079-1",
            "MesReferencia": "janeiro de 2026"
        }));
    });

    let valuation = matcher(&server)
        .lookup(&key("HONDA", "CIVIC TOURING", 2020), "327")
        .await
        .unwrap();

    value.assert();
    assert!(!valuation.alternative_search);
    assert_eq!(valuation.model_code, "11");
    assert_eq!(valuation.year_fuel_code, "2020-1");
    assert_eq!(valuation.value_numeric, Some(65000.0));
}

#[tokio::test]
async fn test_matcher_probes_other_versions_when_the_year_is_missing() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/ConsultarModelos");
        then.status(200).json_body(json!({
            "Modelos": [
                { "Label": "UNO MILLE 1.0", "Value": 1 },
                { "Label": "UNO WAY 1.0", "Value": 2 },
                { "Label": "UNO WAY 1.4", "Value": 3 }
            ]
        }));
    });
    // Primary candidate (UNO WAY 1.4, the last full-keyword match) was not
    // sold in 2016.
    server.mock(|when, then| {
        when.method(POST)
            .path("/ConsultarAnoModelo")
            .body_contains("codigoModelo=3");
        then.status(200).json_body(json!([
            { "Label": "2014 Gasolina", "Value": "2014-1" },
            { "Label": "2015 Gasolina", "Value": "2015-1" }
        ]));
    });
    // The other UNO WAY version was.
    server.mock(|when, then| {
        when.method(POST)
            .path("/ConsultarAnoModelo")
            .body_contains("codigoModelo=2");
        then.status(200).json_body(json!([
            { "Label": "2016 Flex", "Value": "2016-5" }
        ]));
    });
    let value = server.mock(|when, then| {
        when.method(POST)
            .path("/ConsultarValorComTodosParametros")
            .body_contains("codigoModelo=2")
            .body_contains("anoModelo=2016")
            .body_contains("codigoTipoCombustivel=5");
        then.status(200).json_body(json!({
            "Valor": "R$ 30.000,00",
            "Modelo": "UNO WAY 1.0",
            "AnoModelo": 2016,
            "Combustivel": "Flex",
            "CodigoFipe": "001267-5",
            "MesReferencia": "janeiro de 2026"
        }));
    });

    let valuation = matcher(&server)
        .lookup(&key("FIAT", "UNO WAY", 2016), "327")
        .await
        .unwrap();

    value.assert();
    assert!(valuation.alternative_search);
    assert_eq!(valuation.original_model_label.as_deref(), Some("UNO WAY 1.4"));
    assert_eq!(
        valuation.available_years.as_deref(),
        Some("2014 Gasolina, 2015 Gasolina")
    );
    assert_eq!(valuation.model_code, "2");
    assert_eq!(valuation.year_fuel_code, "2016-5");
    assert_eq!(valuation.value_numeric, Some(30000.0));
}

#[tokio::test]
async fn test_matcher_treats_a_rejected_valuation_as_transient() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/ConsultarModelos");
        then.status(200).json_body(json!({
            "Modelos": [{ "Label": "UNO MILLE 1.0", "Value": 1 }]
        }));
    });
    server.mock(|when, then| {
        when.method(POST).path("/ConsultarAnoModelo");
        then.status(200).json_body(json!([
            { "Label": "2010 Gasolina", "Value": "2010-1" }
        ]));
    });
    server.mock(|when, then| {
        when.method(POST).path("/ConsultarValorComTodosParametros");
        then.status(200).json_body(json!({
            "codigo": "2",
            "erro": "Parâmetros inválidos"
        }));
    });

    let result = matcher(&server).lookup(&key("FIAT", "UNO", 2010), "327").await;
    assert!(matches!(result, Err(EnrichmentError::Transient(_))));
}

#[tokio::test]
async fn test_reference_table_falls_back_when_the_provider_is_down() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/ConsultarTabelaDeReferencia");
        then.status(500);
    });

    let client = FipeClient::new(&server.url(""), TIMEOUT, test_limiter()).unwrap();
    assert_eq!(client.reference_table().await, "327");
}

#[tokio::test]
async fn test_reference_table_uses_the_latest_entry() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/ConsultarTabelaDeReferencia");
        then.status(200).json_body(json!([
            { "Codigo": 330, "Mes": "janeiro/2026 " },
            { "Codigo": 329, "Mes": "dezembro/2025 " }
        ]));
    });

    let client = FipeClient::new(&server.url(""), TIMEOUT, test_limiter()).unwrap();
    assert_eq!(client.reference_table().await, "330");
}
