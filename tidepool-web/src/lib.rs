//! Tidepool Web - JSON API Server

#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::too_many_lines)]
//!
//! Upload, download, inspect and delete expiring files over HTTP, plus a
//! usage report across storage volumes.

pub mod error;
pub mod handlers;
pub mod server;

// Re-export main types
pub use error::ApiError;
pub use server::{AppState, build_router, run_server};
