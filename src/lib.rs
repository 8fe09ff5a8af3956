//! Offline-first sync core for roof-tile inspections.
//!
//! Records and photos live in a local SQLite store; every mutation also
//! appends to a durable queue that the sync engine drains against the
//! inspection server whenever the network allows.

pub mod config;
pub mod connectivity;
pub mod db;
pub mod engine;
pub mod error;
pub mod listeners;
pub mod model;
pub mod remote;
pub mod service;
pub mod status;
pub mod store;

pub use error::{Result, SyncError};
