//! Load generator.
//!
//! - `session`: one connection, one measured echo round trip
//! - `worker`: drives sessions under a time or repetition budget
//! - `orchestrator`: synchronized start, fan-out, aggregation
//! - `report`: renders the result for downstream tooling

pub mod orchestrator;
pub mod report;
pub mod session;
pub mod worker;

pub use orchestrator::Experiment;
