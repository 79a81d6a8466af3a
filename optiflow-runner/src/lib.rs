//! Submitter: creates a task run and its stages, seeds the first stage
//! queue, and waits for a terminal outcome on the success queue or the
//! dead-letter queue, then writes the objective vector.

pub mod config;
pub mod objectives;
pub mod report;
pub mod submit;
