//! Stage worker: a single-shot HTTP endpoint invoked once per queue
//! delivery. Each delivery walks one stage through its lifecycle: fetch the
//! stage row, gate on cancellation, download config and input, run the stage
//! command, upload the output, hand the run over to the successor stages,
//! finalize.

pub mod archive;
pub mod materialize;
pub mod request;
pub mod subprocess;
pub mod uploads;
pub mod worker;

pub use worker::{Worker, WorkerConfig};
