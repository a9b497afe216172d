//! Multi-engine analyzer source (VirusTotal-style API)

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::models::{
    Indicator, IocType, Observation, ProviderMetadata, Reputation, ThreatInfo, Verdict,
};
use crate::providers::IntelSource;

const DEFAULT_BASE_URL: &str = "https://www.virustotal.com/api/v3";

#[derive(Debug, Deserialize, Default)]
struct AnalysisStats {
    #[serde(default)]
    malicious: u32,
    #[serde(default)]
    suspicious: u32,
    #[serde(default)]
    harmless: u32,
    #[serde(default)]
    undetected: u32,
}

impl AnalysisStats {
    fn total(&self) -> u32 {
        self.malicious + self.suspicious + self.harmless + self.undetected
    }
}

#[derive(Debug, Deserialize)]
struct Attributes {
    last_analysis_stats: Option<AnalysisStats>,
    last_analysis_date: Option<i64>,
    first_submission_date: Option<i64>,
    #[serde(default)]
    tags: Vec<String>,
    meaningful_name: Option<String>,
    type_description: Option<String>,
    #[serde(default)]
    popular_threat_classification: Option<ThreatClassification>,
}

#[derive(Debug, Deserialize)]
struct ThreatClassification {
    suggested_threat_label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectData {
    attributes: Attributes,
}

#[derive(Debug, Deserialize)]
struct ObjectResponse {
    data: ObjectData,
}

/// Source wrapping a multi-engine analysis REST API
pub struct HashAnalyzerSource {
    client: Client,
    api_key: String,
    base_url: String,
}

impl HashAnalyzerSource {
    pub fn new(api_key: String, base_url: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }

    fn endpoint(&self, indicator: &Indicator) -> String {
        match indicator.ioc_type {
            IocType::Hash => format!("{}/files/{}", self.base_url, indicator.value),
            IocType::Domain => format!("{}/domains/{}", self.base_url, indicator.value),
            IocType::Ip => format!("{}/ip_addresses/{}", self.base_url, indicator.value),
            _ => format!("{}/search?query={}", self.base_url, indicator.value),
        }
    }

    async fn lookup(&self, indicator: &Indicator) -> Result<Attributes> {
        let response = self
            .client
            .get(self.endpoint(indicator))
            .header("x-apikey", &self.api_key)
            .send()
            .await
            .context("Failed to send request to analyzer")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Analyzer API error: {} - {}", status, body);
        }

        let parsed: ObjectResponse = response
            .json()
            .await
            .context("Failed to parse analyzer response")?;
        Ok(parsed.data.attributes)
    }
}

fn epoch_to_utc(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

#[async_trait]
impl IntelSource for HashAnalyzerSource {
    fn id(&self) -> &str {
        "hash-analyzer"
    }

    fn description(&self) -> &str {
        "specializes in multi-engine file and domain analysis"
    }

    fn supported_types(&self) -> &[IocType] {
        &[IocType::Hash, IocType::Domain, IocType::Ip, IocType::Url]
    }

    fn specialties(&self) -> &[IocType] {
        &[IocType::Hash]
    }

    async fn fetch(&self, indicator: &Indicator) -> Result<Observation> {
        let attrs = self.lookup(indicator).await?;

        let stats = attrs.last_analysis_stats.unwrap_or_default();
        let total = stats.total();
        let (score, confidence) = if total > 0 {
            let flagged = stats.malicious + stats.suspicious;
            let score = flagged as f64 / total as f64 * 100.0;
            // More engines voting means a firmer answer
            let confidence = (0.4 + total as f64 / 100.0).min(0.95);
            (score, confidence)
        } else {
            (0.0, 0.2)
        };

        let mut threats = Vec::new();
        if let Some(label) = attrs
            .popular_threat_classification
            .and_then(|c| c.suggested_threat_label)
        {
            threats.push(ThreatInfo {
                name: label,
                category: attrs.type_description.clone(),
                confidence,
            });
        }

        let mut extra = std::collections::HashMap::new();
        extra.insert("engines_total".into(), total.into());
        extra.insert("engines_malicious".into(), stats.malicious.into());
        if let Some(name) = &attrs.meaningful_name {
            extra.insert("meaningful_name".into(), name.clone().into());
        }

        Ok(Observation {
            reputation: Some(Reputation {
                score,
                verdict: Verdict::from_score(score),
                confidence,
            }),
            metadata: ProviderMetadata {
                threats,
                first_seen: attrs.first_submission_date.and_then(epoch_to_utc),
                last_seen: attrs.last_analysis_date.and_then(epoch_to_utc),
                extra,
                ..Default::default()
            },
            tags: attrs.tags,
            ..Default::default()
        })
    }

    async fn ping(&self) -> Result<()> {
        let response = self
            .client
            .get(format!(
                "{}/files/d41d8cd98f00b204e9800998ecf8427e",
                self.base_url
            ))
            .header("x-apikey", &self.api_key)
            .send()
            .await
            .context("Analyzer unreachable")?;
        // 404 is fine; it proves auth and reachability
        if response.status().is_server_error() || response.status() == 401 {
            anyhow::bail!("Analyzer health check failed: {}", response.status());
        }
        Ok(())
    }
}
