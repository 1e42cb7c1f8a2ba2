//! turbo-cache-gateway - A Turborepo remote cache server
//!
//! This crate stores and serves build artifacts for the Turborepo client with:
//! - Swappable object storage backends (S3, GCS, local filesystem)
//! - One storage container per team, named from a hash of the team ID
//! - Bearer token authorization against a fixed allow-list
//! - The `/v8/artifacts` REST API

pub mod api;
pub mod auth;
pub mod config;
pub mod object_store;
pub mod tenant;
#[cfg(test)]
pub mod testutil;

use std::sync::Arc;

use config::Config;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub object_store: Arc<dyn object_store::ObjectStore>,
}

impl AppState {
    pub fn new(config: Config, object_store: Arc<dyn object_store::ObjectStore>) -> Self {
        Self {
            config,
            object_store,
        }
    }
}
