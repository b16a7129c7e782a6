// src/services/sync_service.rs
//! Polling reconciliation between the rider's trip and facts written elsewhere.
//!
//! Each tick pulls the tracked request from the request store and the events
//! feed from the backend, compares them with the trip manager's belief and
//! applies only what differs. Applying the same fact twice is a no-op.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing;

use crate::{
    errors::{SparrowError, SparrowResult},
    models::{
        event::TripEvent,
        request::{normalize_driver_id, RideRequest, RideStatus},
        trip::TripStart,
    },
    services::{
        remote_service::TripRemote,
        request_service::RequestOperations,
        storage_service::{read_json, write_json, KeyValueStore, StorageKeys},
        trip_service::{TripOperations, TripService},
    },
};

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_interval: Duration,
    pub backoff_factor: u32,
    pub jitter: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_interval: Duration::from_secs(30),
            backoff_factor: 2,
            jitter: Duration::from_millis(250),
        }
    }
}

/// Exponential backoff over consecutive quiet ticks.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: PollConfig,
    misses: u32,
}

impl Backoff {
    pub fn new(config: PollConfig) -> Self {
        Self { config, misses: 0 }
    }

    pub fn reset(&mut self) -> Duration {
        self.misses = 0;
        self.with_jitter(self.config.interval)
    }

    pub fn miss(&mut self) -> Duration {
        let delay = self
            .config
            .interval
            .saturating_mul(self.config.backoff_factor.max(1).saturating_pow(self.misses))
            .min(self.config.max_interval);
        self.misses = self.misses.saturating_add(1);
        self.with_jitter(delay)
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        let max_jitter = self.config.jitter.as_millis() as u64;
        if max_jitter == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::random_range(0..=max_jitter))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TripChange {
    Tracking { request_id: String },
    DriverAssigned { driver_id: String, driver_name: Option<String> },
    StatusChanged { from: Option<RideStatus>, to: RideStatus },
    Ended(RideStatus),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub changes: Vec<TripChange>,
    pub errors: usize,
    pub finished: bool,
}

pub struct TripSynchronizer {
    user_id: String,
    requests: Arc<dyn RequestOperations>,
    trips: Arc<TripService>,
    remote: Arc<dyn TripRemote>,
    store: Arc<dyn KeyValueStore>,
    keys: StorageKeys,
    config: PollConfig,
    started_at: DateTime<Utc>,
}

impl TripSynchronizer {
    pub fn new(
        trips: Arc<TripService>,
        requests: Arc<dyn RequestOperations>,
        remote: Arc<dyn TripRemote>,
        store: Arc<dyn KeyValueStore>,
        keys: StorageKeys,
        config: PollConfig,
    ) -> Self {
        Self {
            user_id: trips.user_id().to_string(),
            requests,
            trips,
            remote,
            store,
            keys,
            config,
            started_at: Utc::now(),
        }
    }

    /// Starts polling on its own task. The loop ends when the tracked trip
    /// finishes, when `stop` is called, or when the handle is dropped.
    pub fn spawn(self: Arc<Self>) -> SyncHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move { self.run(shutdown_rx).await });
        SyncHandle { shutdown_tx, join }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.config.clone());
        tracing::info!("Trip sync started for user {}", self.user_id);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let report = self.tick().await;
            if report.finished {
                tracing::info!("Tracked trip finished, sync for user {} done", self.user_id);
                break;
            }

            let delay = if report.changes.is_empty() { backoff.miss() } else { backoff.reset() };
            tracing::debug!("Next trip sync for user {} in {:?}", self.user_id, delay);

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!("Trip sync stopped for user {}", self.user_id);
    }

    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        let still_queued = self.trips.retry_pending_remote().await;
        if still_queued > 0 {
            tracing::debug!("{} remote operations still queued", still_queued);
        }

        if let Err(e) = self.reconcile_with_store(&mut report).await {
            tracing::warn!("Request store reconciliation failed: {}", e);
            report.errors += 1;
        }

        if let Err(e) = self.pull_events(&mut report).await {
            tracing::warn!("Trip events poll failed for user {}: {}", self.user_id, e);
            report.errors += 1;
        }

        let before = self.trips.snapshot().status;
        self.trips.tick_countdown().await;
        let after = self.trips.snapshot().status;
        if let Some(to) = after.filter(|status| Some(*status) != before) {
            report.changes.push(TripChange::StatusChanged { from: before, to });
        }

        let ended = report.changes.iter().any(|change| matches!(change, TripChange::Ended(_)));
        if ended {
            if let Err(e) = self.store.remove_many(&self.keys.user_trip_keys(&self.user_id)).await {
                tracing::warn!("Failed to clear trip keys for user {}: {}", self.user_id, e);
            }
        }

        // Only the tick that saw the trip end finishes; a trip already ended
        // before this tick leaves room to pick up the user's next request.
        report.finished = ended;
        report
    }

    async fn reconcile_with_store(&self, report: &mut TickReport) -> SparrowResult<()> {
        let trip = self.trips.snapshot();
        match &trip.request_id {
            Some(request_id) if trip.is_active => match self.requests.get_request_by_id(request_id).await? {
                Some(request) => self.observe(&request, report).await,
                None => tracing::debug!("Tracked request {} is no longer stored", request_id),
            },
            _ => {
                if let Some(request) = self.requests.get_user_active_request(&self.user_id).await? {
                    tracing::info!("Tracking active request {} for user {}", request.id, self.user_id);
                    let started = self.trips.start_trip(TripStart::for_request(&request)).await;
                    report.changes.push(TripChange::Tracking { request_id: request.id.clone() });
                    if let Some(driver_id) = started.driver_id {
                        report.changes.push(TripChange::DriverAssigned {
                            driver_id,
                            driver_name: started.driver_name,
                        });
                    }
                    self.observe(&request, report).await;
                }
            }
        }
        Ok(())
    }

    async fn pull_events(&self, report: &mut TickReport) -> SparrowResult<()> {
        let watermark_key = self.keys.trip_events_since(&self.user_id);
        let since = match read_json::<DateTime<Utc>>(self.store.as_ref(), &watermark_key).await {
            Ok(Some((_, since))) => since,
            Ok(None) => self.started_at,
            Err(e) => {
                tracing::warn!("Unreadable trip events watermark, starting from session: {}", e);
                self.started_at
            }
        };

        let issued_at = Utc::now();
        let events = self.remote.trip_events(&self.user_id, since).await?;
        tracing::debug!("Received {} trip events for user {}", events.len(), self.user_id);

        for event in events {
            self.apply_event(event, report).await;
        }

        write_json(self.store.as_ref(), &watermark_key, &issued_at).await?;
        Ok(())
    }

    async fn apply_event(&self, event: TripEvent, report: &mut TickReport) {
        let trip = self.trips.snapshot();
        if trip.request_id.as_deref() != Some(event.trip_id.as_str()) {
            tracing::debug!("Skipping {} for untracked trip {}", event.event_type(), event.trip_id);
            return;
        }

        let recorded = match event.status {
            RideStatus::Accepted => {
                let Some(driver_id) = normalize_driver_id(event.driver_id.clone()) else {
                    tracing::warn!("Ignoring {} without a driver", event.event_type());
                    return;
                };
                let driver_name = event.driver_name.clone().unwrap_or_default();
                self.requests.accept_request(&event.trip_id, &driver_id, &driver_name).await
            }
            status => self.requests.update_request_status(&event.trip_id, status).await,
        };

        let facts = match recorded {
            Ok(request) => Some(request),
            Err(SparrowError::Conflict { status, driver_id, .. }) => {
                // Someone else got there first; the stored record wins
                tracing::debug!(
                    "Trip {} already {} (driver {:?}), using stored facts",
                    event.trip_id,
                    status,
                    driver_id
                );
                self.stored_request(&event.trip_id).await
            }
            Err(SparrowError::InvalidTransition { from, .. }) => {
                tracing::debug!("Trip {} already {} in store", event.trip_id, from);
                None
            }
            Err(SparrowError::NotFound(_)) => None,
            Err(e) => {
                tracing::warn!("Could not record {} for {}: {}", event.event_type(), event.trip_id, e);
                None
            }
        };

        match facts {
            Some(request) => self.observe(&request, report).await,
            None => {
                self.observe_facts(
                    &event.trip_id,
                    event.status,
                    normalize_driver_id(event.driver_id),
                    event.driver_name,
                    report,
                )
                .await
            }
        }
    }

    async fn stored_request(&self, request_id: &str) -> Option<RideRequest> {
        match self.requests.get_request_by_id(request_id).await {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Failed to reload request {}: {}", request_id, e);
                None
            }
        }
    }

    async fn observe(&self, request: &RideRequest, report: &mut TickReport) {
        self.observe_facts(
            &request.id,
            request.status,
            request.driver_id.clone(),
            request.driver_name.clone(),
            report,
        )
        .await
    }

    /// Moves the trip toward the observed facts, touching nothing that
    /// already matches.
    async fn observe_facts(
        &self,
        request_id: &str,
        status: RideStatus,
        driver_id: Option<String>,
        driver_name: Option<String>,
        report: &mut TickReport,
    ) {
        let trip = self.trips.snapshot();
        if trip.request_id.as_deref() != Some(request_id) || trip.is_terminal() {
            return;
        }

        if status.is_terminal() {
            if self.trips.apply_terminal(status).await {
                report.changes.push(TripChange::Ended(status));
            }
            return;
        }

        if let Some(driver_id) = driver_id {
            if trip.driver_id.as_deref() != Some(driver_id.as_str()) {
                self.trips
                    .start_trip(TripStart {
                        request_id: trip.request_id.clone(),
                        driver_id: Some(driver_id.clone()),
                        driver_name: driver_name.clone(),
                        origin: trip.origin.clone(),
                        destination: trip.destination.clone(),
                        fare: trip.fare,
                        duration: Some(trip.trip_duration),
                    })
                    .await;
                tracing::info!("Driver {} assigned to trip {}", driver_id, request_id);
                report.changes.push(TripChange::DriverAssigned { driver_id, driver_name });
            }
        }

        let current = self.trips.snapshot().status;
        if current.is_some_and(|current| current.can_transition_to(status))
            && self.trips.update_trip_status(status).await
        {
            report.changes.push(TripChange::StatusChanged { from: current, to: status });
        }
    }
}

/// Owns a running synchronizer task. Dropping the handle closes the shutdown
/// channel, which also ends the loop.
pub struct SyncHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SyncHandle {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.join().await;
    }

    /// Waits for the loop to end on its own.
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            if e.is_panic() {
                tracing::error!("Trip sync task panicked: {}", e);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::request::{Customer, NewRideRequest, Place};
    use crate::services::remote_service::fake::FakeRemote;
    use crate::services::request_service::RequestService;
    use crate::services::storage_service::MemoryStore;
    use crate::services::trip_service::TripSettings;

    struct Fixture {
        store: Arc<MemoryStore>,
        requests: Arc<RequestService>,
        remote: Arc<FakeRemote>,
        trips: Arc<TripService>,
        sync: Arc<TripSynchronizer>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let keys = StorageKeys::new("test");
        let requests = Arc::new(RequestService::new(store.clone(), keys.clone()));
        let remote = Arc::new(FakeRemote::default());
        let trips = Arc::new(TripService::new(
            "1",
            store.clone(),
            keys.clone(),
            requests.clone(),
            remote.clone(),
            TripSettings::default(),
        ));
        let sync = Arc::new(TripSynchronizer::new(
            trips.clone(),
            requests.clone(),
            remote.clone(),
            store.clone(),
            keys,
            PollConfig {
                interval: Duration::from_millis(100),
                max_interval: Duration::from_secs(1),
                backoff_factor: 2,
                jitter: Duration::ZERO,
            },
        ));
        Fixture { store, requests, remote, trips, sync }
    }

    async fn create_request(requests: &RequestService) -> RideRequest {
        requests
            .create_request(NewRideRequest {
                customer: Customer { id: "1".to_string(), name: "A".to_string() },
                pickup: Place::new("X", 0.0, 0.0),
                destination: Place::new("Y", 1.0, 1.0),
                fare: 1500.0,
            })
            .await
            .unwrap()
    }

    fn event(status: RideStatus, trip_id: &str, driver: Option<&str>) -> TripEvent {
        TripEvent {
            status,
            trip_id: trip_id.to_string(),
            customer_id: "1".to_string(),
            driver_id: driver.map(str::to_string),
            driver_name: driver.map(|_| "Ivan".to_string()),
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_tick_starts_tracking_active_request() {
        let f = fixture();
        let request = create_request(&f.requests).await;

        let report = f.sync.tick().await;
        assert_eq!(report.changes, vec![TripChange::Tracking { request_id: request.id.clone() }]);

        let trip = f.trips.snapshot();
        assert!(trip.is_active);
        assert_eq!(trip.status, Some(RideStatus::Searching));
        assert_eq!(trip.origin, "X");

        let report = f.sync.tick().await;
        assert!(report.changes.is_empty());
    }

    #[tokio::test]
    async fn test_driver_accepting_on_another_device() {
        let f = fixture();
        let request = create_request(&f.requests).await;
        f.sync.tick().await;

        f.requests.accept_request(&request.id, "driver9", "Ivan").await.unwrap();
        let report = f.sync.tick().await;

        assert_eq!(
            report.changes,
            vec![TripChange::DriverAssigned {
                driver_id: "driver9".to_string(),
                driver_name: Some("Ivan".to_string()),
            }]
        );
        assert_eq!(f.trips.snapshot().status, Some(RideStatus::Accepted));
    }

    #[tokio::test]
    async fn test_duplicate_accepted_event_is_idempotent() {
        let f = fixture();
        let request = create_request(&f.requests).await;
        f.sync.tick().await;

        f.remote.push_event(event(RideStatus::Accepted, &request.id, Some("driver9"))).await;
        let first = f.sync.tick().await;
        assert!(first.changes.iter().any(|c| matches!(c, TripChange::DriverAssigned { .. })));
        let after_once = f.trips.snapshot();

        f.remote.push_event(event(RideStatus::Accepted, &request.id, Some("driver9"))).await;
        let second = f.sync.tick().await;
        assert!(second.changes.is_empty());
        assert_eq!(f.trips.snapshot(), after_once);

        let stored = f.requests.get_request_by_id(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.driver_id.as_deref(), Some("driver9"));
    }

    #[tokio::test]
    async fn test_conflicting_accept_uses_stored_driver() {
        let f = fixture();
        let request = create_request(&f.requests).await;
        f.sync.tick().await;
        f.requests.accept_request(&request.id, "driverB", "Kofi").await.unwrap();

        f.remote.push_event(event(RideStatus::Accepted, &request.id, Some("driverA"))).await;
        f.sync.tick().await;

        let trip = f.trips.snapshot();
        assert_eq!(trip.driver_id.as_deref(), Some("driverB"));
        assert_eq!(trip.driver_name.as_deref(), Some("Kofi"));
    }

    #[tokio::test]
    async fn test_duplicate_completed_event() {
        let f = fixture();
        let request = create_request(&f.requests).await;
        f.sync.tick().await;
        f.remote.push_event(event(RideStatus::Accepted, &request.id, Some("driver9"))).await;
        f.sync.tick().await;

        f.remote.push_event(event(RideStatus::Completed, &request.id, Some("driver9"))).await;
        let first = f.sync.tick().await;
        assert!(first.finished);
        assert!(first.changes.contains(&TripChange::Ended(RideStatus::Completed)));
        let after_once = f.trips.snapshot();
        assert!(!after_once.is_active);

        f.remote.push_event(event(RideStatus::Completed, &request.id, Some("driver9"))).await;
        let second = f.sync.tick().await;
        assert!(second.changes.is_empty());
        assert_eq!(f.trips.snapshot(), after_once);

        let stored = f.requests.get_request_by_id(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RideStatus::Completed);
    }

    #[tokio::test]
    async fn test_terminal_clears_trip_keys() {
        let f = fixture();
        let request = create_request(&f.requests).await;
        f.sync.tick().await;
        assert!(f.store.get("test:user:1:active_trip").await.unwrap().is_some());
        assert!(f.store.get("test:user:1:trip_events_since").await.unwrap().is_some());

        f.remote.push_event(event(RideStatus::Cancelled, &request.id, None)).await;
        let report = f.sync.tick().await;
        assert!(report.finished);

        for key in StorageKeys::new("test").user_trip_keys("1") {
            assert_eq!(f.store.get(&key).await.unwrap(), None);
        }
        let stored = f.requests.get_request_by_id(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RideStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_next_request_is_tracked_after_trip_ends() {
        let f = fixture();
        let first = create_request(&f.requests).await;
        f.sync.tick().await;
        f.remote.push_event(event(RideStatus::Cancelled, &first.id, None)).await;
        assert!(f.sync.tick().await.finished);

        let second = create_request(&f.requests).await;
        let restarted = TripSynchronizer::new(
            f.trips.clone(),
            f.requests.clone(),
            f.remote.clone(),
            f.store.clone(),
            StorageKeys::new("test"),
            PollConfig::default(),
        );
        let report = restarted.tick().await;

        assert!(!report.finished);
        assert_eq!(report.changes, vec![TripChange::Tracking { request_id: second.id.clone() }]);
        let trip = f.trips.snapshot();
        assert!(trip.is_active);
        assert_eq!(trip.request_id.as_deref(), Some(second.id.as_str()));
        assert_eq!(trip.status, Some(RideStatus::Searching));
    }

    #[tokio::test]
    async fn test_idle_after_ended_trip_keeps_polling() {
        let f = fixture();
        let request = create_request(&f.requests).await;
        f.sync.tick().await;
        f.trips.cancel_trip(None).await.unwrap();

        let report = f.sync.tick().await;
        assert!(!report.finished);
        assert!(report.changes.is_empty());
        assert_eq!(f.trips.snapshot().request_id.as_deref(), Some(request.id.as_str()));
    }

    #[tokio::test]
    async fn test_unknown_feed_entry_does_not_hide_later_events() {
        let f = fixture();
        let request = create_request(&f.requests).await;
        f.sync.tick().await;

        f.remote
            .push_raw(serde_json::json!({
                "type": "trip_arrived",
                "trip_id": request.id,
                "customer_id": "1",
            }))
            .await;
        f.remote.push_event(event(RideStatus::Accepted, &request.id, Some("driver9"))).await;
        let report = f.sync.tick().await;

        assert_eq!(report.errors, 0);
        assert!(report.changes.iter().any(|c| matches!(c, TripChange::DriverAssigned { .. })));
        assert_eq!(f.trips.snapshot().driver_id.as_deref(), Some("driver9"));
        let stored = f.requests.get_request_by_id(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RideStatus::Accepted);
    }

    #[tokio::test]
    async fn test_events_for_other_trips_are_ignored() {
        let f = fixture();
        create_request(&f.requests).await;
        f.sync.tick().await;

        f.remote.push_event(event(RideStatus::Cancelled, "req-250101-otherone", None)).await;
        let report = f.sync.tick().await;

        assert!(report.changes.is_empty());
        assert!(f.trips.check_trip_active());
    }

    #[tokio::test]
    async fn test_watermark_advances_only_on_success() {
        let f = fixture();
        f.sync.tick().await;
        f.sync.tick().await;

        let calls = f.remote.feed_calls.lock().await.clone();
        assert_eq!(calls.len(), 2);
        assert!(calls[1] > calls[0]);

        let (_, stored): (String, DateTime<Utc>) =
            read_json(f.store.as_ref(), "test:user:1:trip_events_since").await.unwrap().unwrap();
        assert!(stored >= calls[1]);

        *f.remote.fail_feed.lock().await = true;
        let report = f.sync.tick().await;
        assert_eq!(report.errors, 1);

        let (_, after_failure): (String, DateTime<Utc>) =
            read_json(f.store.as_ref(), "test:user:1:trip_events_since").await.unwrap().unwrap();
        assert_eq!(after_failure, stored);
    }

    #[tokio::test]
    async fn test_tick_retries_queued_cancel() {
        let f = fixture();
        create_request(&f.requests).await;
        f.sync.tick().await;
        f.remote.fail_next_cancels(1).await;
        f.trips.cancel_trip(None).await.unwrap();
        assert_eq!(f.trips.pending_remote_ops().await.len(), 1);

        f.sync.tick().await;
        assert!(f.trips.pending_remote_ops().await.is_empty());
        assert_eq!(f.remote.cancels.lock().await.len(), 1);
    }

    #[test]
    fn test_backoff_grows_and_resets() {
        let mut backoff = Backoff::new(PollConfig {
            interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(5),
            backoff_factor: 2,
            jitter: Duration::ZERO,
        });

        assert_eq!(backoff.miss(), Duration::from_secs(1));
        assert_eq!(backoff.miss(), Duration::from_secs(2));
        assert_eq!(backoff.miss(), Duration::from_secs(4));
        assert_eq!(backoff.miss(), Duration::from_secs(5));
        assert_eq!(backoff.miss(), Duration::from_secs(5));
        assert_eq!(backoff.reset(), Duration::from_secs(1));
        assert_eq!(backoff.miss(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let mut backoff = Backoff::new(PollConfig {
            interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(5),
            backoff_factor: 2,
            jitter: Duration::from_millis(100),
        });

        for _ in 0..20 {
            let delay = backoff.reset();
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_follows_trip_to_completion() {
        let f = fixture();
        let request = create_request(&f.requests).await;
        let mut rx = f.trips.subscribe();
        let handle = f.sync.clone().spawn();

        f.requests.accept_request(&request.id, "driver9", "Ivan").await.unwrap();
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                rx.changed().await.unwrap();
                if rx.borrow_and_update().driver_id.is_some() {
                    break;
                }
            }
        })
        .await
        .expect("driver never observed");

        f.requests.update_request_status(&request.id, RideStatus::InProgress).await.unwrap();
        f.requests.update_request_status(&request.id, RideStatus::Completed).await.unwrap();

        tokio::time::timeout(Duration::from_secs(60), handle.join()).await.expect("sync never finished");
        let trip = f.trips.snapshot();
        assert_eq!(trip.status, Some(RideStatus::Completed));
        assert!(!trip.is_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_idle_loop() {
        let f = fixture();
        let handle = f.sync.clone().spawn();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!handle.is_finished());

        tokio::time::timeout(Duration::from_secs(1), handle.stop()).await.expect("stop hung");
    }
}
