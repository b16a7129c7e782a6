// src/services/remote_service.rs
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::time::Duration;
use tracing;

use crate::{
    errors::{SparrowError, SparrowResult},
    models::event::TripEvent,
};

/// Backend calls the trip core depends on.
#[async_trait]
pub trait TripRemote: Send + Sync {
    /// Events for trips involving `user_id` reported after `since`, oldest first.
    async fn trip_events(&self, user_id: &str, since: DateTime<Utc>) -> SparrowResult<Vec<TripEvent>>;
    async fn cancel_trip(&self, trip_id: &str, user_id: &str, cancellation_fee: f64) -> SparrowResult<()>;
}

#[derive(Debug, Clone)]
pub struct HttpRemoteConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub timeout: Duration,
}

pub struct HttpTripRemote {
    config: HttpRemoteConfig,
    client: reqwest::Client,
}

impl HttpTripRemote {
    pub fn new(config: HttpRemoteConfig) -> SparrowResult<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check_status(response: reqwest::Response) -> SparrowResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
        Err(SparrowError::RemoteStatus { status: status.as_u16(), message })
    }
}

#[async_trait]
impl TripRemote for HttpTripRemote {
    async fn trip_events(&self, user_id: &str, since: DateTime<Utc>) -> SparrowResult<Vec<TripEvent>> {
        tracing::debug!("Fetching trip events for user {} since {}", user_id, since);

        let request = self
            .client
            .get(self.url(&format!("users/{}/trip-events", user_id)))
            .query(&[("since", since.to_rfc3339_opts(SecondsFormat::Millis, true))]);

        let response = Self::check_status(self.authorize(request).send().await?).await?;
        let entries: Vec<Value> = response.json().await?;
        Ok(decode_events(entries))
    }

    async fn cancel_trip(&self, trip_id: &str, user_id: &str, cancellation_fee: f64) -> SparrowResult<()> {
        tracing::info!("Cancelling trip {} remotely for user {}", trip_id, user_id);

        let request = self
            .client
            .post(self.url(&format!("trips/{}/cancel", trip_id)))
            .json(&json!({
                "user_id": user_id,
                "cancellation_fee": cancellation_fee,
            }));

        Self::check_status(self.authorize(request).send().await?).await?;
        Ok(())
    }
}

/// Decodes feed entries one at a time. An entry this build does not
/// understand is logged and skipped so it cannot hold back the rest.
pub(crate) fn decode_events(entries: Vec<Value>) -> Vec<TripEvent> {
    entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<TripEvent>(entry.clone()) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!("Skipping undecodable trip event {}: {}", entry, e);
                None
            }
        })
        .collect()
}

/// Used when no backend is configured: the feed is empty and writes are
/// reported as unavailable so callers queue them.
#[derive(Debug, Default)]
pub struct OfflineTripRemote;

#[async_trait]
impl TripRemote for OfflineTripRemote {
    async fn trip_events(&self, _user_id: &str, _since: DateTime<Utc>) -> SparrowResult<Vec<TripEvent>> {
        Ok(Vec::new())
    }

    async fn cancel_trip(&self, trip_id: &str, _user_id: &str, _cancellation_fee: f64) -> SparrowResult<()> {
        tracing::warn!("[OFFLINE] Cannot cancel trip {} remotely", trip_id);
        Err(SparrowError::ServiceUnavailable("trip backend not configured".to_string()))
    }
}
