//! Wire-level tests for the reference HTTP provider adapters.

use std::sync::Arc;

use iocfusion::models::{Indicator, IocType, Verdict};
use iocfusion::providers::http::{AbuseFeedSource, HashAnalyzerSource};
use iocfusion::providers::{IntelSource, NoEvents, Provider, ProviderConfig};
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn abuse_feed_maps_reports_into_reputation() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/check"))
        .and(header("Key", "test-key"))
        .and(query_param("ipAddress", "203.0.113.9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "abuseConfidenceScore": 85,
                "countryCode": "RU",
                "usageType": "Data Center",
                "isp": "Example Hosting",
                "domain": "evil-host.example",
                "hostnames": ["mail.evil-host.example"],
                "totalReports": 42,
                "numDistinctUsers": 17,
                "lastReportedAt": "2024-05-01T00:00:00Z"
            }
        })))
        .mount(&server)
        .await;

    let source = AbuseFeedSource::new("test-key".into(), Some(server.uri())).unwrap();
    let observation = source
        .fetch(&Indicator::new("203.0.113.9", IocType::Ip))
        .await
        .unwrap();

    let reputation = observation.reputation.unwrap();
    assert_eq!(reputation.score, 85.0);
    assert_eq!(reputation.verdict, Verdict::Malicious);
    assert!(reputation.confidence > 0.5);

    let geo = observation.metadata.geolocation.unwrap();
    assert_eq!(geo.country.as_deref(), Some("RU"));
    assert_eq!(observation.related_indicators.len(), 1);
    assert_eq!(observation.related_indicators[0].ioc_type, IocType::Domain);
    assert!(observation.tags.iter().any(|t| t == "community-reported"));
}

#[tokio::test]
async fn abuse_feed_surfaces_api_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/check"))
        .respond_with(ResponseTemplate::new(429).set_body_string("quota exceeded"))
        .mount(&server)
        .await;

    let source = AbuseFeedSource::new("test-key".into(), Some(server.uri())).unwrap();
    let err = source
        .fetch(&Indicator::new("203.0.113.9", IocType::Ip))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("429"));
}

#[tokio::test]
async fn analyzer_scores_by_engine_consensus() {
    let server = MockServer::start().await;
    let hash = "d41d8cd98f00b204e9800998ecf8427e";
    Mock::given(method("GET"))
        .and(path(format!("/files/{hash}")))
        .and(header("x-apikey", "vt-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "attributes": {
                    "last_analysis_stats": {
                        "malicious": 45,
                        "suspicious": 5,
                        "harmless": 10,
                        "undetected": 10
                    },
                    "last_analysis_date": 1714521600,
                    "first_submission_date": 1609459200,
                    "tags": ["trojan", "packed"],
                    "meaningful_name": "invoice.exe",
                    "type_description": "Win32 EXE",
                    "popular_threat_classification": {
                        "suggested_threat_label": "trojan.emotet"
                    }
                }
            }
        })))
        .mount(&server)
        .await;

    let source = HashAnalyzerSource::new("vt-key".into(), Some(server.uri())).unwrap();
    let observation = source
        .fetch(&Indicator::new(hash, IocType::Hash))
        .await
        .unwrap();

    let reputation = observation.reputation.unwrap();
    // 50 of 70 engines flagged it
    assert!((reputation.score - 50.0 / 70.0 * 100.0).abs() < 1e-9);
    assert_eq!(reputation.verdict, Verdict::Malicious);

    assert_eq!(observation.metadata.threats.len(), 1);
    assert_eq!(observation.metadata.threats[0].name, "trojan.emotet");
    assert!(observation.metadata.first_seen.is_some());
    assert_eq!(observation.tags, vec!["trojan", "packed"]);
}

#[tokio::test]
async fn analyzer_with_no_engine_data_reports_low_confidence() {
    let server = MockServer::start().await;
    let hash = "d41d8cd98f00b204e9800998ecf8427e";
    Mock::given(method("GET"))
        .and(path(format!("/files/{hash}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "attributes": {} }
        })))
        .mount(&server)
        .await;

    let source = HashAnalyzerSource::new("vt-key".into(), Some(server.uri())).unwrap();
    let observation = source
        .fetch(&Indicator::new(hash, IocType::Hash))
        .await
        .unwrap();
    let reputation = observation.reputation.unwrap();
    assert_eq!(reputation.score, 0.0);
    assert!(reputation.confidence <= 0.2);
}

#[tokio::test]
async fn wrapped_adapter_fails_shaped_not_thrown() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/check"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let source = Arc::new(
        AbuseFeedSource::new("test-key".into(), Some(server.uri())).unwrap(),
    );
    let provider = Provider::new(
        source,
        ProviderConfig {
            retry_attempts: 0,
            timeout_ms: 2_000,
            ..Default::default()
        },
        Arc::new(NoEvents),
    );

    let result = provider.enrich(&Indicator::new("203.0.113.9", IocType::Ip)).await;
    assert!(!result.success);
    assert_eq!(result.provider, "abuse-feed");
    assert!(result.error.is_some());
}
