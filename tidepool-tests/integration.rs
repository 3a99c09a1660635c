//! Integration tests for Tidepool
//!
//! These tests drive the file service, sweeper and HTTP router together
//! against temporary volumes, checking the storage guarantees end to end.

#[path = "integration/common.rs"]
mod common;

#[path = "integration/round_trip.rs"]
mod round_trip;

#[path = "integration/expiry_lifecycle.rs"]
mod expiry_lifecycle;

#[path = "integration/upload_limits.rs"]
mod upload_limits;

#[path = "integration/placement_balance.rs"]
mod placement_balance;

#[path = "integration/concurrent_uploads.rs"]
mod concurrent_uploads;

#[path = "integration/restart_recovery.rs"]
mod restart_recovery;

#[path = "integration/http_api.rs"]
mod http_api;
