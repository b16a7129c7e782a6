// src/models/event.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::request::{deserialize_driver_id, RideStatus};

/// A state change reported by the trip events feed.
///
/// On the wire the kind is carried as `"type": "trip_<status>"`, for example
/// `trip_accepted` or `trip_cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripEvent {
    #[serde(rename = "type", with = "event_type")]
    pub status: RideStatus,
    pub trip_id: String,
    pub customer_id: String,
    #[serde(default, deserialize_with = "deserialize_driver_id")]
    pub driver_id: Option<String>,
    #[serde(default)]
    pub driver_name: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl TripEvent {
    pub fn event_type(&self) -> String {
        format!("{}{}", event_type::PREFIX, self.status)
    }
}

mod event_type {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use crate::models::request::RideStatus;

    pub const PREFIX: &str = "trip_";

    pub fn serialize<S: Serializer>(status: &RideStatus, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}{}", PREFIX, status))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<RideStatus, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let status = raw
            .strip_prefix(PREFIX)
            .ok_or_else(|| D::Error::custom(format!("unknown trip event type: {}", raw)))?;
        status.parse().map_err(D::Error::custom)
    }
}
