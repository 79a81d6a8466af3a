mod run;
mod stage;

pub use run::{TaskRun, TaskRunStatus};
pub use stage::{Stage, StageStatus, STAGE_INITIAL_STATUS};
