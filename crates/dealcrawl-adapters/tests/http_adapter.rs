//! Integration tests for `HttpExtractionAdapter` against a local mock service.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use dealcrawl_adapters::{
    AdapterError, ExtractionAdapter, HttpExtractionAdapter, HttpExtractionConfig,
};
use dealcrawl_core::Connector;

fn adapter(server: &MockServer, api_key: Option<&str>, timeout: Duration) -> HttpExtractionAdapter {
    let mut config = HttpExtractionConfig::new(format!("{}/extract", server.uri()));
    config.api_key = api_key.map(str::to_string);
    config.timeout = timeout;
    config.user_agent = Some("dealcrawl-test/0.1".to_string());
    HttpExtractionAdapter::new(config).expect("build adapter")
}

fn connector() -> Connector {
    let mut c = Connector::new(Uuid::new_v4(), "cu-promo", "https://cu.test/promo", Utc::now());
    c.extraction_config = json!({"selector": ".promo-item"});
    c
}

#[tokio::test]
async fn posts_connector_and_parses_candidates() {
    let server = MockServer::start().await;
    let c = connector();

    Mock::given(method("POST"))
        .and(path("/extract"))
        .and(header("authorization", "Bearer sekrit"))
        .and(body_partial_json(json!({
            "connectorId": c.id,
            "sourceUrl": "https://cu.test/promo",
            "extractionConfig": {"selector": ".promo-item"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "success",
            "tokensUsed": 1500,
            "candidates": [
                {"title": "1+1 Ramen", "landingUrl": "https://cu.test/promo/1", "price": "1500"},
                {"title": "Missing url"}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let extraction = adapter(&server, Some("sekrit"), Duration::from_secs(5))
        .extract(&c)
        .await
        .expect("extraction succeeds");

    assert_eq!(extraction.tokens_used, 1500);
    assert_eq!(extraction.candidates.len(), 2);
    assert_eq!(extraction.candidates[0].title(), Some("1+1 Ramen"));
    assert!(extraction.candidates[1].parsed().unwrap().landing_url.is_empty());
}

#[tokio::test]
async fn reported_failure_becomes_extraction_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "failed",
            "errorMessage": "login wall"
        })))
        .mount(&server)
        .await;

    let err = adapter(&server, None, Duration::from_secs(5))
        .extract(&connector())
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::Extraction(ref m) if m == "login wall"));
}

#[tokio::test]
async fn one_wrongly_typed_candidate_keeps_the_rest() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "success",
            "tokensUsed": 90,
            "candidates": [
                {"title": "Onigiri 1+1", "landingUrl": "https://cu.test/promo/1"},
                {"title": "Lunchbox", "landingUrl": "https://cu.test/promo/2", "endsAt": "tomorrow"},
                {"title": "Milk 2+1", "landingUrl": "https://cu.test/promo/3", "price": "1800"}
            ]
        })))
        .mount(&server)
        .await;

    let extraction = adapter(&server, None, Duration::from_secs(5))
        .extract(&connector())
        .await
        .expect("extraction succeeds");

    assert_eq!(extraction.tokens_used, 90);
    let parsed: Vec<_> = extraction.candidates.iter().map(|c| c.parsed().is_ok()).collect();
    assert_eq!(parsed, vec![true, false, true]);
    assert_eq!(extraction.candidates[1].title(), Some("Lunchbox"));
}

#[tokio::test]
async fn non_success_status_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .expect(1)
        .mount(&server)
        .await;

    let err = adapter(&server, None, Duration::from_secs(5))
        .extract(&connector())
        .await
        .unwrap_err();
    match err {
        AdapterError::HttpStatus { status, body } => {
            assert_eq!(status, 503);
            assert_eq!(body, "overloaded");
        }
        other => panic!("expected HttpStatus, got {other:?}"),
    }
}

#[tokio::test]
async fn garbage_body_is_a_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let err = adapter(&server, None, Duration::from_secs(5))
        .extract(&connector())
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::Decode(_)));
}

#[tokio::test]
async fn slow_service_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(2))
                .set_body_json(json!({"status": "success", "candidates": []})),
        )
        .mount(&server)
        .await;

    let err = adapter(&server, None, Duration::from_millis(200))
        .extract(&connector())
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::Timeout(_)), "got {err:?}");
}
