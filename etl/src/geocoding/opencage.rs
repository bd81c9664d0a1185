use super::Geocoder;
use crate::models::{Coordinates, PlaceQuery};
use async_trait::async_trait;
use common::config::GeocoderConfig;
use common::{Error, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    geometry: Geometry,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    lat: f64,
    lng: f64,
}

/// Client for OpenCage-compatible forward geocoding endpoints.
pub struct OpenCageGeocoder {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
}

impl OpenCageGeocoder {
    pub fn new(config: &GeocoderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("weather-etl/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: Url::parse(&config.base_url)?,
            api_key: config.api_key.clone(),
        })
    }

    fn request_url(&self, query: &PlaceQuery) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("q", &query.text())
            .append_pair("key", &self.api_key)
            .append_pair("limit", "1")
            .append_pair("no_annotations", "1");
        url
    }

    /// The first result is the service's best match; no results means no match.
    pub fn parse_response(body: &str) -> Result<Option<Coordinates>> {
        let response: GeocodeResponse = serde_json::from_str(body)?;
        Ok(response
            .results
            .first()
            .map(|r| Coordinates::new(r.geometry.lat, r.geometry.lng)))
    }
}

#[async_trait]
impl Geocoder for OpenCageGeocoder {
    async fn lookup(&self, query: &PlaceQuery) -> Result<Option<Coordinates>> {
        debug!(id = query.id, query = %query.text(), "Geocoding place");

        let response = self.client.get(self.request_url(query)).send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(match status.as_u16() {
                401 | 403 => Error::Forbidden,
                429 => Error::RateLimit,
                504 => Error::GatewayTimeout,
                code if status.is_server_error() => {
                    Error::Geocoding(format!("server error: HTTP {}", code))
                }
                code => Error::Geocoding(format!("unexpected status: HTTP {}", code)),
            });
        }

        let body = response.text().await?;
        Self::parse_response(&body)
    }
}
