//! Shadow experimentation pipeline.
//!
//! `registry` defines the variations, `logger` records what each would have
//! done at every production scan, `evaluator` replays those decisions
//! against later prices (via `simulator`), and `analyzer` turns the
//! resolved outcomes into snapshots and recommendations (via `stats`).

pub mod analyzer;
pub mod evaluator;
pub mod logger;
pub mod registry;
pub mod simulator;
pub mod stats;

pub use analyzer::{AnalysisReport, AnalyzerConfig, ShadowAnalyzer};
pub use evaluator::{EvaluationReport, EvaluatorConfig, ShadowEvaluator};
pub use logger::{ScanContext, ShadowLogger};
pub use registry::{Override, Variation, VariationId, VariationRegistry};
