// src/models/trip.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::request::{deserialize_driver_id, Coordinates, RideStatus};

pub const DEFAULT_TRIP_DURATION_SECS: u64 = 120;

/// The rider's view of the trip currently being tracked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripData {
    pub is_active: bool,
    pub request_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub trip_duration: u64, // Seconds budgeted for the waiting countdown
    #[serde(default, deserialize_with = "deserialize_driver_id")]
    pub driver_id: Option<String>,
    pub driver_name: Option<String>,
    pub origin: String,
    pub destination: String,
    pub pickup_coordinates: Option<Coordinates>,
    pub destination_coordinates: Option<Coordinates>,
    pub fare: f64,
    pub status: Option<RideStatus>,
}

impl Default for TripData {
    fn default() -> Self {
        Self::inactive(DEFAULT_TRIP_DURATION_SECS)
    }
}

impl TripData {
    pub fn inactive(trip_duration: u64) -> Self {
        Self {
            is_active: false,
            request_id: None,
            start_time: None,
            end_time: None,
            trip_duration,
            driver_id: None,
            driver_name: None,
            origin: String::new(),
            destination: String::new(),
            pickup_coordinates: None,
            destination_coordinates: None,
            fare: 0.0,
            status: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_some_and(|status| status.is_terminal())
    }

    pub fn rider_label(&self) -> &'static str {
        self.status.map(|status| status.rider_label()).unwrap_or("inactive")
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> u64 {
        let Some(start) = self.start_time else {
            return 0;
        };
        let elapsed = now.signed_duration_since(start).num_seconds().max(0) as u64;
        self.trip_duration.saturating_sub(elapsed)
    }
}

/// Parameters for starting (or refreshing) a trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripStart {
    pub request_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_driver_id")]
    pub driver_id: Option<String>,
    pub driver_name: Option<String>,
    pub origin: String,
    pub destination: String,
    pub fare: f64,
    pub duration: Option<u64>,
}

impl TripStart {
    pub fn for_request(request: &super::request::RideRequest) -> Self {
        Self {
            request_id: Some(request.id.clone()),
            driver_id: request.driver_id.clone(),
            driver_name: request.driver_name.clone(),
            origin: request.pickup.name.clone(),
            destination: request.destination.name.clone(),
            fare: request.fare,
            duration: None,
        }
    }
}
