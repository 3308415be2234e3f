use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use crate::config::Config;
use crate::device::DeviceIdentity;
use crate::model::{AlertLevel, AlertResponse};

const BODY_LOG_LIMIT: usize = 200;

/// Client for the cloud alert endpoint. Every call carries a hard timeout.
pub struct CloudClient {
    http: reqwest::Client,
    base_url: String,
}

impl CloudClient {
    pub fn new(config: &Config) -> Result<CloudClient> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_seconds))
            .build()
            .context("Building cloud HTTP client")?;
        Ok(CloudClient {
            http,
            base_url: config.cloud_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn fetch_alert(&self, device: &DeviceIdentity) -> Result<AlertResponse> {
        let url = format!("{}/api/alert/{}", self.base_url, device);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {}", url))?;
        let status = response.status();
        if !status.is_success() {
            bail!("Cloud alert endpoint returned {}", status);
        }
        let body = response.text().await.context("Reading alert response body")?;
        match serde_json::from_str(&body) {
            Ok(parsed) => Ok(parsed),
            Err(err) => {
                warn!("Malformed alert payload: {} (body: {})", err, truncated(&body));
                bail!("Malformed alert payload: {}", err)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct WeatherFeed {
    #[serde(default)]
    features: Vec<WeatherFeature>,
}

#[derive(Debug, Deserialize)]
struct WeatherFeature {
    #[serde(default)]
    properties: WeatherProperties,
}

#[derive(Debug, Default, Deserialize)]
struct WeatherProperties {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    headline: Option<String>,
}

/// Fallback client against the upstream weather API. Used when the cloud
/// endpoint is unreachable; severity is derived locally from alert titles.
pub struct WeatherClient {
    http: reqwest::Client,
    base_url: String,
    latitude: f64,
    longitude: f64,
}

impl WeatherClient {
    pub fn new(config: &Config) -> Result<WeatherClient> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_seconds))
            .user_agent("wavealert360")
            .build()
            .context("Building weather HTTP client")?;
        Ok(WeatherClient {
            http,
            base_url: config.weather_api_url.trim_end_matches('/').to_string(),
            latitude: config.latitude,
            longitude: config.longitude,
        })
    }

    /// Titles of the currently active alert features for the configured
    /// point. An empty list means no active hazards.
    pub async fn fetch_alert_titles(&self) -> Result<Vec<String>> {
        let url = format!(
            "{}/alerts/active?point={},{}",
            self.base_url, self.latitude, self.longitude
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {}", url))?;
        let status = response.status();
        if !status.is_success() {
            bail!("Weather API returned {}", status);
        }
        let body = response.text().await.context("Reading weather response body")?;
        let feed: WeatherFeed = serde_json::from_str(&body).map_err(|err| {
            warn!("Malformed weather payload: {} (body: {})", err, truncated(&body));
            anyhow::anyhow!("Malformed weather payload: {}", err)
        })?;
        Ok(feed
            .features
            .into_iter()
            .filter_map(|f| f.properties.event.or(f.properties.headline))
            .collect())
    }
}

const DANGER_KEYWORDS: &[&str] = &[
    "high surf warning",
    "rip current",
    "tsunami",
    "storm surge",
    "hurricane",
];

const CAUTION_KEYWORDS: &[&str] = &[
    "beach hazards",
    "high surf",
    "coastal flood",
    "small craft",
    "gale",
];

/// Maps active alert titles to a severity. Danger keywords win over caution
/// keywords; no recognizable hazard maps to `Safe`.
pub fn classify_titles(titles: &[String]) -> AlertLevel {
    let mut level = AlertLevel::Safe;
    for title in titles {
        let title = title.to_lowercase();
        if DANGER_KEYWORDS.iter().any(|kw| title.contains(kw)) {
            return AlertLevel::Danger;
        }
        if CAUTION_KEYWORDS.iter().any(|kw| title.contains(kw)) {
            level = AlertLevel::Caution;
        }
    }
    level
}

fn truncated(body: &str) -> &str {
    match body.char_indices().nth(BODY_LOG_LIMIT) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
