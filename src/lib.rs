//! Statistical inference engine for A/B experiments.
//!
//! Deterministic variant assignment, CUPED variance reduction, two-sample
//! hypothesis tests, power planning, multiple-testing correction, sequential
//! alpha spending and a ship / do-not-ship orchestrator. Every engine
//! function is synchronous and pure over borrowed inputs.

pub mod assignment;
pub mod cli;
pub mod config;
pub mod correction;
pub mod cuped;
pub mod error;
pub mod hypothesis;
pub mod orchestrator;
pub mod power;
pub mod sequential;
pub mod stats;
pub mod table;

pub use assignment::{Assigner, Variant};
pub use config::{AnalysisConfig, AssignmentConfig, EngineConfig};
pub use correction::CorrectionMethod;
pub use error::{EngineError, Result};
pub use hypothesis::{HypothesisTester, TestResult};
pub use orchestrator::{analyze, Analyzer, ExperimentReport, Recommendation};
pub use table::{UnitRecord, UnitTable};
