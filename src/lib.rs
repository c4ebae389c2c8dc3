//! CANARY: shadow experimentation and adaptive threshold management.
//!
//! Library crate exposing all modules for use by integration tests
//! and the daemon entry point.

pub mod alerts;
pub mod api;
pub mod config;
pub mod engine;
pub mod feeds;
pub mod params;
pub mod shadow;
pub mod storage;
pub mod strategy;
pub mod thresholds;
pub mod types;
