pub mod errors;
pub mod models;
pub mod services;
pub mod state;
pub mod utils;

// Re-export commonly used types
pub use errors::{SparrowError, SparrowResult, ValidationError};
pub use models::{RideRequest, RideStatus, TripData, TripEvent};
pub use services::request_service::RequestOperations;
pub use services::trip_service::TripOperations;
pub use state::{RideConfig, RideContext};
