mod job;
mod state;

pub use job::{
    CommandId, Job, JobId, JobOutcome, JobReport, LockRequest, Step, StepArgs, StepResult,
    StepState,
};
pub use state::{JobEvent, JobState, StateMachine, Transition};
