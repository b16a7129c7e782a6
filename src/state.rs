// src/state.rs
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::{
    errors::{SparrowError, SparrowResult},
    models::trip::DEFAULT_TRIP_DURATION_SECS,
    services::{
        remote_service::{HttpRemoteConfig, HttpTripRemote, OfflineTripRemote, TripRemote},
        request_service::{RequestOperations, RequestService},
        storage_service::{KeyValueStore, MemoryStore, RedisStore, StorageKeys},
        sync_service::{PollConfig, SyncHandle, TripSynchronizer},
        trip_service::{TripOperations, TripService, TripSettings},
    },
};

#[derive(Debug, Clone, PartialEq)]
pub struct RideConfig {
    pub redis_url: Option<String>,
    pub namespace: String,
    pub api_url: Option<String>,
    pub api_token: Option<String>,
    pub poll_interval: Duration,
    pub poll_max_interval: Duration,
    pub waiting_window_secs: u64,
    pub cancellation_fee: f64,
    pub http_timeout: Duration,
}

impl Default for RideConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            namespace: "sparrow".to_string(),
            api_url: None,
            api_token: None,
            poll_interval: Duration::from_secs(3),
            poll_max_interval: Duration::from_secs(30),
            waiting_window_secs: DEFAULT_TRIP_DURATION_SECS,
            cancellation_fee: 0.0,
            http_timeout: Duration::from_secs(10),
        }
    }
}

impl RideConfig {
    pub fn from_env() -> SparrowResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset or blank keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> SparrowResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let config = Self {
            redis_url: get("SPARROW_REDIS_URL"),
            namespace: get("SPARROW_NAMESPACE").unwrap_or(defaults.namespace),
            api_url: get("SPARROW_API_URL"),
            api_token: get("SPARROW_API_TOKEN"),
            poll_interval: match get("SPARROW_POLL_INTERVAL_MS") {
                Some(raw) => Duration::from_millis(parse_number("SPARROW_POLL_INTERVAL_MS", &raw)?),
                None => defaults.poll_interval,
            },
            poll_max_interval: match get("SPARROW_POLL_MAX_INTERVAL_MS") {
                Some(raw) => Duration::from_millis(parse_number("SPARROW_POLL_MAX_INTERVAL_MS", &raw)?),
                None => defaults.poll_max_interval,
            },
            waiting_window_secs: match get("SPARROW_WAITING_WINDOW_SECS") {
                Some(raw) => parse_number("SPARROW_WAITING_WINDOW_SECS", &raw)?,
                None => defaults.waiting_window_secs,
            },
            cancellation_fee: match get("SPARROW_CANCELLATION_FEE") {
                Some(raw) => parse_number("SPARROW_CANCELLATION_FEE", &raw)?,
                None => defaults.cancellation_fee,
            },
            http_timeout: match get("SPARROW_HTTP_TIMEOUT_MS") {
                Some(raw) => Duration::from_millis(parse_number("SPARROW_HTTP_TIMEOUT_MS", &raw)?),
                None => defaults.http_timeout,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> SparrowResult<()> {
        if self.poll_interval.is_zero() {
            return Err(SparrowError::configuration("poll interval must be greater than zero"));
        }
        if self.poll_max_interval < self.poll_interval {
            return Err(SparrowError::configuration("max poll interval is below the poll interval"));
        }
        if !self.cancellation_fee.is_finite() || self.cancellation_fee < 0.0 {
            return Err(SparrowError::configuration("cancellation fee must be a non-negative number"));
        }
        Ok(())
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            interval: self.poll_interval,
            max_interval: self.poll_max_interval,
            ..PollConfig::default()
        }
    }

    pub fn trip_settings(&self) -> TripSettings {
        TripSettings {
            default_duration: self.waiting_window_secs,
            cancellation_fee: self.cancellation_fee,
            ..TripSettings::default()
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> SparrowResult<T> {
    raw.parse()
        .map_err(|_| SparrowError::configuration(format!("{} is not a valid number: {:?}", key, raw)))
}

/// Everything one rider session needs, wired together.
pub struct RideContext {
    pub user_id: String,
    pub store: Arc<dyn KeyValueStore>,
    pub keys: StorageKeys,
    pub requests: Arc<dyn RequestOperations>,
    pub trips: Arc<TripService>,
    pub remote: Arc<dyn TripRemote>,
    pub config: RideConfig,
    sync: Mutex<Option<SyncHandle>>,
}

impl RideContext {
    pub async fn new(config: RideConfig, user_id: impl Into<String>) -> SparrowResult<Self> {
        let store: Arc<dyn KeyValueStore> = match &config.redis_url {
            Some(url) => Arc::new(RedisStore::connect(url, config.namespace.clone()).await?),
            None => {
                tracing::warn!("SPARROW_REDIS_URL not set, keeping rides in memory");
                Arc::new(MemoryStore::new())
            }
        };

        let remote: Arc<dyn TripRemote> = match &config.api_url {
            Some(base_url) => Arc::new(HttpTripRemote::new(HttpRemoteConfig {
                base_url: base_url.clone(),
                api_token: config.api_token.clone(),
                timeout: config.http_timeout,
            })?),
            None => {
                tracing::warn!("SPARROW_API_URL not set, using offline trip backend");
                Arc::new(OfflineTripRemote)
            }
        };

        Ok(Self::with_parts(config, user_id, store, remote))
    }

    pub fn with_parts(
        config: RideConfig,
        user_id: impl Into<String>,
        store: Arc<dyn KeyValueStore>,
        remote: Arc<dyn TripRemote>,
    ) -> Self {
        let user_id = user_id.into();
        let keys = StorageKeys::new(config.namespace.clone());
        let requests: Arc<dyn RequestOperations> = Arc::new(RequestService::new(store.clone(), keys.clone()));
        let trips = Arc::new(TripService::new(
            user_id.clone(),
            store.clone(),
            keys.clone(),
            requests.clone(),
            remote.clone(),
            config.trip_settings(),
        ));

        Self {
            user_id,
            store,
            keys,
            requests,
            trips,
            remote,
            config,
            sync: Mutex::new(None),
        }
    }

    pub fn synchronizer(&self) -> TripSynchronizer {
        TripSynchronizer::new(
            self.trips.clone(),
            self.requests.clone(),
            self.remote.clone(),
            self.store.clone(),
            self.keys.clone(),
            self.config.poll_config(),
        )
    }

    /// Starts background polling, replacing any loop already running.
    pub async fn start_sync(&self) {
        let handle = Arc::new(self.synchronizer()).spawn();
        let previous = self.sync.lock().await.replace(handle);
        if let Some(previous) = previous {
            previous.stop().await;
        }
    }

    pub async fn stop_sync(&self) {
        let running = self.sync.lock().await.take();
        if let Some(handle) = running {
            handle.stop().await;
        }
    }

    /// Stops polling and clears this user's trip state.
    pub async fn teardown(&self) -> SparrowResult<()> {
        self.stop_sync().await;
        self.trips.teardown().await?;
        tracing::info!("Ride session for user {} torn down", self.user_id);
        Ok(())
    }
}
