// src/services/trip_service.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing;

use crate::{
    errors::{SparrowError, SparrowResult},
    models::{
        request::{normalize_driver_id, Place, RideStatus},
        trip::{TripData, TripStart, DEFAULT_TRIP_DURATION_SECS},
    },
    services::{
        remote_service::TripRemote,
        request_service::RequestOperations,
        storage_service::{read_json, write_json, KeyValueStore, StorageKeys},
    },
};

#[async_trait]
pub trait TripOperations: Send + Sync {
    async fn start_order_flow(&self);
    async fn select_route(&self, pickup: Place, destination: Place);
    async fn start_trip(&self, params: TripStart) -> TripData;
    async fn update_trip_status(&self, status: RideStatus) -> bool;
    async fn apply_terminal(&self, status: RideStatus) -> bool;
    async fn tick_countdown_at(&self, now: DateTime<Utc>) -> u64;
    async fn cancel_trip(&self, cancellation_fee: Option<f64>) -> SparrowResult<CancelOutcome>;
    async fn resume(&self) -> SparrowResult<bool>;
    async fn teardown(&self) -> SparrowResult<()>;

    fn remaining_time_at(&self, now: DateTime<Utc>) -> u64;
    fn check_trip_active(&self) -> bool;
    fn snapshot(&self) -> TripData;
    fn subscribe(&self) -> watch::Receiver<TripData>;

    fn remaining_time(&self) -> u64 {
        self.remaining_time_at(Utc::now())
    }

    async fn tick_countdown(&self) -> u64 {
        self.tick_countdown_at(Utc::now()).await
    }
}

#[derive(Debug, Clone)]
pub struct TripSettings {
    pub default_duration: u64,
    pub cancellation_fee: f64,
    pub max_remote_retries: u32,
}

impl Default for TripSettings {
    fn default() -> Self {
        Self {
            default_duration: DEFAULT_TRIP_DURATION_SECS,
            cancellation_fee: 0.0,
            max_remote_retries: 5,
        }
    }
}

/// A remote write that failed and is waiting for the synchronizer to retry it.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingRemoteOp {
    Cancel {
        trip_id: String,
        user_id: String,
        cancellation_fee: f64,
    },
}

#[derive(Debug)]
struct QueuedOp {
    op: PendingRemoteOp,
    attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCancel {
    Confirmed,
    Queued { reason: String },
    Rejected { reason: String },
    NotSent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancelOutcome {
    pub request_id: Option<String>,
    pub remote: RemoteCancel,
}

/// Owns the rider's current trip. All writes to `TripData` go through here;
/// everyone else reads snapshots or subscribes to changes.
pub struct TripService {
    user_id: String,
    state: watch::Sender<TripData>,
    store: Arc<dyn KeyValueStore>,
    keys: StorageKeys,
    requests: Arc<dyn RequestOperations>,
    remote: Arc<dyn TripRemote>,
    settings: TripSettings,
    retry_queue: Mutex<VecDeque<QueuedOp>>,
    // Held from publish to stored write so mirrors land in publish order
    mirror_lock: Mutex<()>,
}

impl TripService {
    pub fn new(
        user_id: impl Into<String>,
        store: Arc<dyn KeyValueStore>,
        keys: StorageKeys,
        requests: Arc<dyn RequestOperations>,
        remote: Arc<dyn TripRemote>,
        settings: TripSettings,
    ) -> Self {
        let (state, _) = watch::channel(TripData::inactive(settings.default_duration));
        Self {
            user_id: user_id.into(),
            state,
            store,
            keys,
            requests,
            remote,
            settings,
            retry_queue: Mutex::new(VecDeque::new()),
            mirror_lock: Mutex::new(()),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn commit<F>(&self, apply: F) -> bool
    where
        F: FnOnce(&mut TripData) -> bool,
    {
        let _mirror = self.mirror_lock.lock().await;
        let changed = self.state.send_if_modified(apply);
        if changed {
            let published = self.snapshot();
            self.mirror(&published).await;
        }
        changed
    }

    /// Keeps the stored copy of the trip in line with memory. Failures are
    /// logged only; memory stays authoritative for this session.
    async fn mirror(&self, trip: &TripData) {
        let key = self.keys.active_trip(&self.user_id);
        let result = if trip.is_active {
            write_json(self.store.as_ref(), &key, trip).await
        } else {
            self.store.remove(&key).await
        };

        if let Err(e) = result {
            tracing::warn!("Failed to mirror trip for user {}: {}", self.user_id, e);
        }
    }

    async fn clear_trip_keys(&self) -> SparrowResult<()> {
        self.store.remove_many(&self.keys.user_trip_keys(&self.user_id)).await?;
        Ok(())
    }

    async fn enqueue(&self, op: PendingRemoteOp) {
        tracing::info!("Queued remote operation for retry: {:?}", op);
        self.retry_queue.lock().await.push_back(QueuedOp { op, attempts: 1 });
    }

    pub async fn pending_remote_ops(&self) -> Vec<PendingRemoteOp> {
        self.retry_queue.lock().await.iter().map(|queued| queued.op.clone()).collect()
    }

    /// Retries queued remote writes once each. Returns how many remain queued.
    pub async fn retry_pending_remote(&self) -> usize {
        let queued: Vec<QueuedOp> = self.retry_queue.lock().await.drain(..).collect();
        let mut remaining = Vec::new();

        for mut item in queued {
            let result = match &item.op {
                PendingRemoteOp::Cancel { trip_id, user_id, cancellation_fee } => {
                    self.remote.cancel_trip(trip_id, user_id, *cancellation_fee).await
                }
            };

            match result {
                Ok(()) => tracing::info!("Remote operation succeeded on retry: {:?}", item.op),
                Err(e) if e.is_transient() && item.attempts < self.settings.max_remote_retries => {
                    item.attempts += 1;
                    tracing::debug!("Remote retry {} failed: {}", item.attempts, e);
                    remaining.push(item);
                }
                Err(e) => {
                    tracing::warn!("Dropping remote operation {:?} after {} attempts: {}", item.op, item.attempts, e)
                }
            }
        }

        let mut queue = self.retry_queue.lock().await;
        // Anything queued while we were retrying goes after the older entries
        for item in remaining.into_iter().rev() {
            queue.push_front(item);
        }
        queue.len()
    }
}

#[async_trait]
impl TripOperations for TripService {
    async fn start_order_flow(&self) {
        let fresh = TripData::inactive(self.settings.default_duration);
        self.commit(|trip| {
            if *trip == fresh {
                return false;
            }
            *trip = fresh;
            true
        })
        .await;
        tracing::debug!("Order flow started for user {}", self.user_id);
    }

    async fn select_route(&self, pickup: Place, destination: Place) {
        self.commit(|trip| {
            let next = (
                pickup.name.clone(),
                destination.name.clone(),
                Some(pickup.coordinates),
                Some(destination.coordinates),
            );
            let current = (
                trip.origin.clone(),
                trip.destination.clone(),
                trip.pickup_coordinates,
                trip.destination_coordinates,
            );
            if next == current {
                return false;
            }
            (trip.origin, trip.destination, trip.pickup_coordinates, trip.destination_coordinates) = next;
            true
        })
        .await;
    }

    async fn start_trip(&self, params: TripStart) -> TripData {
        let now = Utc::now();
        let duration = params.duration.unwrap_or(self.settings.default_duration);

        let changed = self
            .commit(|trip| {
                let refresh = trip.is_active
                    && !trip.is_terminal()
                    && params.request_id.is_some()
                    && trip.request_id == params.request_id;

                let mut driver_id = normalize_driver_id(params.driver_id.clone());
                let mut driver_name = driver_id.as_ref().and(params.driver_name.clone());
                if refresh && driver_id.is_none() {
                    driver_id = trip.driver_id.clone();
                    driver_name = trip.driver_name.clone();
                }

                let target = if driver_id.is_some() { RideStatus::Accepted } else { RideStatus::Searching };
                let status = match trip.status {
                    Some(current) if refresh && !current.can_transition_to(target) => current,
                    _ => target,
                };
                let start_time = if refresh && trip.driver_id == driver_id {
                    trip.start_time.or(Some(now))
                } else {
                    Some(now)
                };

                let next = TripData {
                    is_active: true,
                    request_id: params.request_id.clone(),
                    start_time,
                    end_time: None,
                    trip_duration: duration,
                    driver_id,
                    driver_name,
                    origin: params.origin.clone(),
                    destination: params.destination.clone(),
                    pickup_coordinates: trip.pickup_coordinates,
                    destination_coordinates: trip.destination_coordinates,
                    fare: params.fare,
                    status: Some(status),
                };

                if next == *trip {
                    return false;
                }
                *trip = next;
                true
            })
            .await;

        let trip = self.snapshot();
        if changed {
            tracing::info!(
                "Trip started for user {}: request {:?}, driver {:?}, status {}",
                self.user_id,
                trip.request_id,
                trip.driver_id,
                trip.rider_label()
            );
        }
        trip
    }

    async fn update_trip_status(&self, status: RideStatus) -> bool {
        let now = Utc::now();
        let mut previous = None;

        let applied = self
            .commit(|trip| {
                let Some(current) = trip.status else {
                    return false;
                };
                previous = Some(current);
                if !trip.is_active || !current.can_transition_to(status) {
                    return false;
                }
                if status.requires_driver() && trip.driver_id.is_none() {
                    return false;
                }

                trip.status = Some(status);
                if status.is_terminal() {
                    trip.is_active = false;
                    trip.end_time = Some(now);
                }
                true
            })
            .await;

        if applied {
            tracing::info!("Trip status for user {}: {:?} -> {}", self.user_id, previous, status);
        } else {
            tracing::debug!("Ignored trip status update {:?} -> {}", previous, status);
        }
        applied
    }

    async fn apply_terminal(&self, status: RideStatus) -> bool {
        if !status.is_terminal() {
            return false;
        }
        let now = Utc::now();

        let applied = self
            .commit(|trip| {
                if trip.status.is_none() || trip.is_terminal() {
                    return false;
                }
                trip.status = Some(status);
                trip.is_active = false;
                trip.end_time = Some(now);
                true
            })
            .await;

        if applied {
            tracing::info!("Trip for user {} ended: {}", self.user_id, status);
        }
        applied
    }

    async fn tick_countdown_at(&self, now: DateTime<Utc>) -> u64 {
        let remaining = self.remaining_time_at(now);
        let trip = self.snapshot();

        if remaining == 0 && trip.is_active && trip.status == Some(RideStatus::Accepted) {
            tracing::info!("Waiting window elapsed, presuming driver {:?} arrived", trip.driver_id);
            self.update_trip_status(RideStatus::InProgress).await;
        }
        remaining
    }

    async fn cancel_trip(&self, cancellation_fee: Option<f64>) -> SparrowResult<CancelOutcome> {
        let trip = self.snapshot();
        if !trip.is_active {
            return Err(SparrowError::not_found(format!("active trip for user {}", self.user_id)));
        }
        let fee = cancellation_fee.unwrap_or(self.settings.cancellation_fee);

        if let Some(request_id) = &trip.request_id {
            match self.requests.update_request_status(request_id, RideStatus::Cancelled).await {
                Ok(_) => {}
                Err(SparrowError::InvalidTransition { from, .. }) => {
                    tracing::debug!("Request {} already {}", request_id, from)
                }
                Err(e) => tracing::warn!("Failed to cancel request {} locally: {}", request_id, e),
            }
        }

        let remote = match &trip.request_id {
            Some(request_id) => match self.remote.cancel_trip(request_id, &self.user_id, fee).await {
                Ok(()) => RemoteCancel::Confirmed,
                Err(e) if e.is_transient() => {
                    tracing::warn!("Remote cancel of {} failed, will retry: {}", request_id, e);
                    self.enqueue(PendingRemoteOp::Cancel {
                        trip_id: request_id.clone(),
                        user_id: self.user_id.clone(),
                        cancellation_fee: fee,
                    })
                    .await;
                    RemoteCancel::Queued { reason: e.to_string() }
                }
                Err(e) => {
                    tracing::warn!("Remote cancel of {} rejected: {}", request_id, e);
                    RemoteCancel::Rejected { reason: e.to_string() }
                }
            },
            None => RemoteCancel::NotSent,
        };

        self.apply_terminal(RideStatus::Cancelled).await;
        if let Err(e) = self.clear_trip_keys().await {
            tracing::warn!("Failed to clear trip keys for user {}: {}", self.user_id, e);
        }

        Ok(CancelOutcome { request_id: trip.request_id, remote })
    }

    async fn resume(&self) -> SparrowResult<bool> {
        let key = self.keys.active_trip(&self.user_id);
        let Some((_, stored)) = read_json::<TripData>(self.store.as_ref(), &key).await? else {
            return Ok(false);
        };
        if !stored.is_active || stored.is_terminal() {
            self.store.remove(&key).await?;
            return Ok(false);
        }

        tracing::info!("Resuming trip {:?} for user {}", stored.request_id, self.user_id);
        let _mirror = self.mirror_lock.lock().await;
        self.state.send_replace(stored);
        Ok(true)
    }

    async fn teardown(&self) -> SparrowResult<()> {
        let _mirror = self.mirror_lock.lock().await;
        self.state.send_replace(TripData::inactive(self.settings.default_duration));
        self.clear_trip_keys().await?;
        tracing::debug!("Trip state torn down for user {}", self.user_id);
        Ok(())
    }

    fn remaining_time_at(&self, now: DateTime<Utc>) -> u64 {
        let trip = self.state.borrow();
        if !trip.is_active {
            return 0;
        }
        trip.remaining_at(now)
    }

    fn check_trip_active(&self) -> bool {
        self.state.borrow().is_active
    }

    fn snapshot(&self) -> TripData {
        self.state.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<TripData> {
        self.state.subscribe()
    }
}
