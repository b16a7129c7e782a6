// src/models/mod.rs
pub mod event;
pub mod request;
pub mod trip;

pub use event::TripEvent;
pub use request::{Coordinates, Customer, NewRideRequest, Place, RideRequest, RideStatus};
pub use trip::{TripData, TripStart};
