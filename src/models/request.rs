// src/models/request.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Placeholder some clients write instead of leaving the driver empty.
pub const PENDING_DRIVER: &str = "pending_driver";

/// Shared status vocabulary for ride requests and the rider's trip view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Pending,   // Request created, nobody looking at it yet
    Searching, // Offered to nearby drivers
    #[serde(alias = "waiting")]
    Accepted, // Driver assigned and on the way to pickup
    #[serde(alias = "active")]
    InProgress, // Rider on board
    Completed,
    Cancelled,
}

impl RideStatus {
    pub const ALL: [RideStatus; 6] = [
        RideStatus::Pending,
        RideStatus::Searching,
        RideStatus::Accepted,
        RideStatus::InProgress,
        RideStatus::Completed,
        RideStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RideStatus::Pending => "pending",
            RideStatus::Searching => "searching",
            RideStatus::Accepted => "accepted",
            RideStatus::InProgress => "in_progress",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        }
    }

    /// Label shown to the rider while tracking a trip.
    pub fn rider_label(&self) -> &'static str {
        match self {
            RideStatus::Pending | RideStatus::Searching | RideStatus::Accepted => "waiting",
            RideStatus::InProgress => "active",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Statuses that only make sense once a driver has been assigned.
    pub fn requires_driver(&self) -> bool {
        matches!(
            self,
            RideStatus::Accepted | RideStatus::InProgress | RideStatus::Completed
        )
    }

    fn rank(&self) -> u8 {
        match self {
            RideStatus::Pending => 0,
            RideStatus::Searching => 1,
            RideStatus::Accepted => 2,
            RideStatus::InProgress => 3,
            RideStatus::Completed | RideStatus::Cancelled => 4,
        }
    }

    pub fn can_transition_to(&self, next: RideStatus) -> bool {
        if self.is_terminal() || *self == next {
            return false;
        }
        match next {
            RideStatus::Cancelled => true,
            RideStatus::Completed => {
                matches!(self, RideStatus::Accepted | RideStatus::InProgress)
            }
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RideStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RideStatus::Pending),
            "searching" => Ok(RideStatus::Searching),
            "accepted" | "waiting" => Ok(RideStatus::Accepted),
            "in_progress" | "active" => Ok(RideStatus::InProgress),
            "completed" => Ok(RideStatus::Completed),
            "cancelled" => Ok(RideStatus::Cancelled),
            other => Err(format!("unknown ride status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub name: String,
    pub coordinates: Coordinates,
}

impl Place {
    pub fn new(name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            name: name.into(),
            coordinates: Coordinates { latitude, longitude },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideRequest {
    pub id: String,
    pub status: RideStatus,
    pub customer: Customer,
    pub pickup: Place,
    pub destination: Place,
    pub fare: f64,
    #[serde(default, deserialize_with = "deserialize_driver_id")]
    pub driver_id: Option<String>,
    #[serde(default)]
    pub driver_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub revision: u64,
}

/// Caller-supplied part of a ride request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRideRequest {
    pub customer: Customer,
    pub pickup: Place,
    pub destination: Place,
    pub fare: f64,
}

impl RideRequest {
    pub fn new(id: String, request: NewRideRequest, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: RideStatus::Pending,
            customer: request.customer,
            pickup: request.pickup,
            destination: request.destination,
            fare: request.fare,
            driver_id: None,
            driver_name: None,
            created_at: now,
            updated_at: now,
            revision: 1,
        }
    }

    pub fn has_driver(&self) -> bool {
        self.driver_id.is_some()
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.revision += 1;
    }
}

pub fn is_real_driver(driver_id: &str) -> bool {
    !driver_id.is_empty() && driver_id != PENDING_DRIVER
}

/// Normalises the "no driver yet" sentinel to `None`.
pub fn normalize_driver_id(driver_id: Option<String>) -> Option<String> {
    driver_id.filter(|id| is_real_driver(id))
}

pub(crate) fn deserialize_driver_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(normalize_driver_id(raw))
}
