// src/services/request_service.rs
use async_trait::async_trait;
use chrono::Utc;
use futures::future::try_join_all;
use std::sync::Arc;
use tracing;

use crate::{
    errors::{SparrowError, SparrowResult},
    models::request::{is_real_driver, NewRideRequest, RideRequest, RideStatus},
    services::storage_service::{read_json, to_json, KeyValueStore, StorageKeys},
    utils::id_generator::generate_request_id,
};

const MAX_CAS_ATTEMPTS: usize = 8;

#[async_trait]
pub trait RequestOperations: Send + Sync {
    async fn create_request(&self, request: NewRideRequest) -> SparrowResult<RideRequest>;
    async fn get_request_by_id(&self, request_id: &str) -> SparrowResult<Option<RideRequest>>;
    async fn get_user_active_request(&self, user_id: &str) -> SparrowResult<Option<RideRequest>>;
    async fn list_requests(&self) -> SparrowResult<Vec<RideRequest>>;
    async fn update_request_status(&self, request_id: &str, status: RideStatus) -> SparrowResult<RideRequest>;
    async fn accept_request(&self, request_id: &str, driver_id: &str, driver_name: &str) -> SparrowResult<RideRequest>;
    async fn delete_request(&self, request_id: &str) -> SparrowResult<bool>;
}

/// Ride requests stored one record per key, with a per-user index and an
/// active-request pointer. Every write is a compare-and-set against the value
/// that was read, so concurrent writers never silently overwrite each other.
pub struct RequestService {
    store: Arc<dyn KeyValueStore>,
    keys: StorageKeys,
}

impl RequestService {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: StorageKeys) -> Self {
        Self { store, keys }
    }

    /// Read-modify-write of a single record, retried on contention.
    async fn mutate<F>(&self, request_id: &str, mut apply: F) -> SparrowResult<RideRequest>
    where
        F: FnMut(&mut RideRequest) -> SparrowResult<()> + Send,
    {
        let key = self.keys.request(request_id);

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let (raw, mut request) = read_json::<RideRequest>(self.store.as_ref(), &key)
                .await?
                .ok_or_else(|| SparrowError::request_not_found(request_id))?;

            apply(&mut request)?;
            request.touch();

            let json = to_json(&request)?;
            if self.store.compare_and_set(&key, Some(&raw), &json).await? {
                if request.status.is_terminal() {
                    self.release_active_pointer(&request).await;
                }
                return Ok(request);
            }

            tracing::debug!("Concurrent write on {} (attempt {}), retrying", request_id, attempt);
        }

        Err(SparrowError::Storage(format!(
            "gave up updating {} after {} conflicting writes",
            request_id, MAX_CAS_ATTEMPTS
        )))
    }

    async fn update_user_index<F>(&self, user_id: &str, apply: F) -> SparrowResult<()>
    where
        F: Fn(&mut Vec<String>) + Send + Sync,
    {
        let key = self.keys.user_requests(user_id);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = read_json::<Vec<String>>(self.store.as_ref(), &key).await?;
            let (expected, mut ids) = match current {
                Some((raw, ids)) => (Some(raw), ids),
                None => (None, Vec::new()),
            };

            apply(&mut ids);
            let json = to_json(&ids)?;
            if self.store.compare_and_set(&key, expected.as_deref(), &json).await? {
                return Ok(());
            }
        }

        Err(SparrowError::Storage(format!("gave up updating request index for user {}", user_id)))
    }

    async fn user_request_ids(&self, user_id: &str) -> SparrowResult<Vec<String>> {
        let key = self.keys.user_requests(user_id);
        Ok(read_json::<Vec<String>>(self.store.as_ref(), &key)
            .await?
            .map(|(_, ids)| ids)
            .unwrap_or_default())
    }

    /// Points the user's active-request slot at `request_id`. A slot holding a
    /// finished or missing request is stale and gets taken over.
    async fn claim_active_pointer(&self, user_id: &str, request_id: &str) -> SparrowResult<()> {
        let key = self.keys.user_active_request(user_id);

        for _ in 0..MAX_CAS_ATTEMPTS {
            if self.store.compare_and_set(&key, None, request_id).await? {
                return Ok(());
            }

            let Some(current) = self.store.get(&key).await? else {
                continue;
            };

            if let Some(existing) = self.get_request_by_id(&current).await? {
                if existing.status.is_active() {
                    return Err(SparrowError::ActiveRequestExists {
                        user_id: user_id.to_string(),
                        request_id: existing.id,
                    });
                }
            }

            tracing::debug!("Replacing stale active request {} for user {}", current, user_id);
            if self.store.compare_and_set(&key, Some(&current), request_id).await? {
                return Ok(());
            }
        }

        Err(SparrowError::Storage(format!("gave up claiming active request for user {}", user_id)))
    }

    async fn release_active_pointer(&self, request: &RideRequest) {
        let key = self.keys.user_active_request(&request.customer.id);
        let result = async {
            if self.store.get(&key).await?.as_deref() == Some(request.id.as_str()) {
                self.store.remove(&key).await?;
            }
            Ok::<(), SparrowError>(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!("Failed to release active request {}: {}", request.id, e);
        }
    }
}

#[async_trait]
impl RequestOperations for RequestService {
    async fn create_request(&self, request: NewRideRequest) -> SparrowResult<RideRequest> {
        if request.customer.id.trim().is_empty() {
            return Err(SparrowError::validation_error("customer.id", "Customer id is required"));
        }
        if !request.fare.is_finite() || request.fare < 0.0 {
            return Err(SparrowError::validation_error("fare", "Fare must be a non-negative amount"));
        }

        let user_id = request.customer.id.clone();
        tracing::info!("Creating ride request for customer: {}", user_id);

        let mut created = None;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let ride = RideRequest::new(generate_request_id(), request.clone(), Utc::now());
            let json = to_json(&ride)?;
            if self.store.compare_and_set(&self.keys.request(&ride.id), None, &json).await? {
                created = Some(ride);
                break;
            }
            tracing::warn!("Request id collision on {}, regenerating", ride.id);
        }
        let ride = created.ok_or_else(|| SparrowError::Storage("could not allocate a request id".to_string()))?;

        if let Err(e) = self.claim_active_pointer(&user_id, &ride.id).await {
            self.store.remove(&self.keys.request(&ride.id)).await?;
            return Err(e);
        }

        let request_id = ride.id.clone();
        if let Err(e) = self.update_user_index(&user_id, move |ids| ids.push(request_id.clone())).await {
            tracing::warn!("Indexing request {} failed, rolling back: {}", ride.id, e);
            self.release_active_pointer(&ride).await;
            self.store.remove(&self.keys.request(&ride.id)).await?;
            return Err(e);
        }

        tracing::info!("Ride request created: {} - fare {}", ride.id, ride.fare);
        Ok(ride)
    }

    async fn get_request_by_id(&self, request_id: &str) -> SparrowResult<Option<RideRequest>> {
        tracing::debug!("Getting ride request: {}", request_id);
        let key = self.keys.request(request_id);
        Ok(read_json(self.store.as_ref(), &key).await?.map(|(_, request)| request))
    }

    async fn get_user_active_request(&self, user_id: &str) -> SparrowResult<Option<RideRequest>> {
        if let Some(pointer) = self.store.get(&self.keys.user_active_request(user_id)).await? {
            if let Some(request) = self.get_request_by_id(&pointer).await? {
                if request.status.is_active() {
                    return Ok(Some(request));
                }
            }
        }

        // Records written before the pointer existed: first live one in creation order
        for request_id in self.user_request_ids(user_id).await? {
            if let Some(request) = self.get_request_by_id(&request_id).await? {
                if request.status.is_active() {
                    return Ok(Some(request));
                }
            }
        }

        Ok(None)
    }

    async fn list_requests(&self) -> SparrowResult<Vec<RideRequest>> {
        let prefix = self.keys.request_prefix();
        let keys: Vec<String> = self
            .store
            .get_all_keys()
            .await?
            .into_iter()
            .filter(|key| key.starts_with(&prefix))
            .collect();

        let store = self.store.as_ref();
        let loaded = try_join_all(keys.iter().map(|key| read_json::<RideRequest>(store, key))).await?;

        let mut requests: Vec<RideRequest> = loaded.into_iter().flatten().map(|(_, r)| r).collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(requests)
    }

    async fn update_request_status(&self, request_id: &str, status: RideStatus) -> SparrowResult<RideRequest> {
        tracing::info!("Updating ride request status: {} to {}", request_id, status);

        self.mutate(request_id, |request| {
            if !request.status.can_transition_to(status) {
                return Err(SparrowError::InvalidTransition { from: request.status, to: status });
            }
            if status == RideStatus::Accepted {
                return Err(SparrowError::validation_error(
                    "status",
                    "Use accept_request to assign a driver",
                ));
            }
            if status.requires_driver() && !request.has_driver() {
                return Err(SparrowError::InvalidTransition { from: request.status, to: status });
            }
            request.status = status;
            Ok(())
        })
        .await
    }

    async fn accept_request(&self, request_id: &str, driver_id: &str, driver_name: &str) -> SparrowResult<RideRequest> {
        if !is_real_driver(driver_id) {
            return Err(SparrowError::validation_error("driver_id", "A real driver id is required"));
        }

        tracing::info!("Driver {} accepting ride request {}", driver_id, request_id);

        let accepted = self
            .mutate(request_id, |request| {
                if !matches!(request.status, RideStatus::Pending | RideStatus::Searching) {
                    return Err(SparrowError::Conflict {
                        request_id: request.id.clone(),
                        status: request.status,
                        driver_id: request.driver_id.clone(),
                    });
                }
                request.status = RideStatus::Accepted;
                request.driver_id = Some(driver_id.to_string());
                request.driver_name = Some(driver_name.to_string());
                Ok(())
            })
            .await?;

        tracing::info!("Driver {} assigned to ride request {}", driver_id, request_id);
        Ok(accepted)
    }

    async fn delete_request(&self, request_id: &str) -> SparrowResult<bool> {
        let Some(request) = self.get_request_by_id(request_id).await? else {
            return Ok(false);
        };

        tracing::info!("Deleting ride request: {}", request_id);
        self.store.remove(&self.keys.request(request_id)).await?;

        let removed_id = request_id.to_string();
        self.update_user_index(&request.customer.id, move |ids| ids.retain(|id| *id != removed_id))
            .await?;
        self.release_active_pointer(&request).await;

        Ok(true)
    }
}
