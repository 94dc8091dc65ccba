// ABOUTME: Library root for subscriber-sync
// ABOUTME: Exposes the sync engine, its admin surface and configuration

pub mod admin;
pub mod cache;
pub mod config;
pub mod detector;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod mirror;
pub mod orchestrator;
pub mod resolution;
pub mod scheduler;
pub mod server;
pub mod utils;

pub mod admin_proto {
    tonic::include_proto!("subscribersync.admin");
}

pub use error::{Result, SyncError};
pub use sync_store as store;
