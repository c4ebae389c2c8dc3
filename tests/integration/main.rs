//! Integration tests for the shadow pipeline and threshold manager.
//!
//! Everything runs against in-process stores and deterministic feeds, on
//! fixed timelines, so no network access or wall-clock waits are needed.

mod harness;
mod pipeline;
mod safety;
