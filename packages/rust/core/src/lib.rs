//! Core of the xaio pipeline runner: fingerprints, retries, the stage
//! executor, the resumable generator, the concrete stages, and the driver
//! that walks the queue.

pub mod artifacts;
pub mod driver;
pub mod fingerprint;
pub mod generator;
pub mod input;
pub mod layout;
pub mod llm;
pub mod queue;
pub mod retry;
pub mod segment;
pub mod stage;
pub mod stages;
pub mod status;

#[cfg(test)]
mod testing;

pub use driver::{DriverOptions, PipelineDriver, RunContext, RunProgress, RunSummary, SilentProgress};
pub use stage::{Stage, StageContext, StageExecutor, StageOutcome, StageOutput, StagePlan};
