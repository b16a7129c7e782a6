// src/services/mod.rs
pub mod remote_service;
pub mod request_service;
pub mod storage_service;
pub mod sync_service;
pub mod trip_service;
