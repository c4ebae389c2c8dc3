//! Core engine: the cadence loop tying the shadow pipeline to the
//! threshold manager.

pub mod orchestrator;

pub use orchestrator::{DailyReport, Orchestrator, Schedule};
