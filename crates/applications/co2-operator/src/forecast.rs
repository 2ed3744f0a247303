//! WattTime forecast client
//!
//! Live alternative to the random walk. For each node:
//!
//! 1. Resolve the node's coordinates to a grid region (`/v3/region-from-loc`, cached)
//! 2. Read the zero-horizon `co2_moer` forecast for that region (`/v3/forecast`)
//! 3. Use the first forecast point as the node's MOER value
//!
//! Authentication is a bearer token from `/login` (HTTP basic auth). The token
//! is cached and fetched again once if the API answers 401. Rejected
//! credentials are a configuration error.

use crate::emission::EmissionStrategy;
use crate::error::{OperatorError, Result};
use crate::store::NodeLocation;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// WattTime API base URL
pub const DEFAULT_BASE_URL: &str = "https://api.watttime.org";

/// Signal queried for every region
const SIGNAL_TYPE: &str = "co2_moer";

/// Request timeout for every API call
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct RegionResponse {
    region: String,
}

#[derive(Debug, Deserialize)]
struct ForecastPoint {
    value: f64,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    data: Vec<ForecastPoint>,
}

/// Emission strategy backed by the WattTime API
pub struct WattTimeForecast {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    token: Option<String>,
    regions: HashMap<String, String>,
}

impl WattTimeForecast {
    /// Create a client for the public API
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL, username, password)
    }

    /// Create a client for a custom API endpoint
    pub fn with_base_url(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            token: None,
            regions: HashMap::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn login(&mut self) -> Result<String> {
        info!("Logging in to WattTime");
        let response = self
            .client
            .get(self.url("/login"))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(OperatorError::config(format!(
                "WattTime rejected the configured credentials ({status})"
            )));
        }
        let response: LoginResponse = response.error_for_status()?.json().await?;

        self.token = Some(response.token.clone());
        Ok(response.token)
    }

    /// GET `path` with the cached token, logging in again once on 401
    async fn get_json(
        &mut self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value> {
        let token = match self.token.clone() {
            Some(token) => token,
            None => self.login().await?,
        };

        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(&token)
            .query(query)
            .send()
            .await?;

        let response = if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            debug!("WattTime token rejected, logging in again");
            let token = self.login().await?;
            self.client
                .get(self.url(path))
                .bearer_auth(&token)
                .query(query)
                .send()
                .await?
        } else {
            response
        };

        Ok(response.error_for_status()?.json().await?)
    }

    async fn region_for(&mut self, location: &NodeLocation) -> Result<String> {
        if let Some(region) = self.regions.get(&location.node_name) {
            return Ok(region.clone());
        }

        let body = self
            .get_json(
                "/v3/region-from-loc",
                &[
                    ("latitude", location.lat.to_string()),
                    ("longitude", location.lng.to_string()),
                    ("signal_type", SIGNAL_TYPE.to_string()),
                ],
            )
            .await?;
        let region = parse_region(body)?;

        debug!(node = %location.node_name, region = %region, "Resolved grid region");
        self.regions
            .insert(location.node_name.clone(), region.clone());
        Ok(region)
    }
}

/// Extract the region code from a `/v3/region-from-loc` body
fn parse_region(body: serde_json::Value) -> Result<String> {
    let response: RegionResponse = serde_json::from_value(body)?;
    Ok(response.region)
}

/// Extract the first forecast value from a `/v3/forecast` body
fn parse_forecast(body: serde_json::Value) -> Result<f64> {
    let response: ForecastResponse = serde_json::from_value(body)?;
    response
        .data
        .first()
        .map(|point| point.value)
        .ok_or_else(|| OperatorError::forecast("forecast contained no data points"))
}

#[async_trait]
impl EmissionStrategy for WattTimeForecast {
    fn name(&self) -> &'static str {
        "watttime"
    }

    async fn moer(&mut self, location: &NodeLocation) -> Result<f64> {
        let region = self.region_for(location).await?;
        let body = self
            .get_json(
                "/v3/forecast",
                &[
                    ("region", region),
                    ("signal_type", SIGNAL_TYPE.to_string()),
                    ("horizon_hours", "0".to_string()),
                ],
            )
            .await?;
        parse_forecast(body)
    }
}
