use thiserror::Error;

use crate::model::EntityRef;
use crate::state_machine::{CommandId, JobId};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("No transition for {entity} from '{from}' to '{to}'")]
    NoSuchTransition {
        entity: EntityRef,
        from: String,
        to: String,
    },

    #[error("Dependency cycle: {}", chain.join(" -> "))]
    DependencyCycle { chain: Vec<String> },

    #[error("Entity not found: {0}")]
    EntityNotFound(EntityRef),

    #[error("Invalid state '{state}' for {entity}")]
    InvalidState { entity: EntityRef, state: String },

    #[error("Invalid entity {entity}: {message}")]
    InvalidEntity { entity: EntityRef, message: String },

    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Command not found: {0}")]
    CommandNotFound(CommandId),

    #[error("Confirmation required for: {}", jobs.join("; "))]
    ConfirmationRequired { jobs: Vec<String> },

    #[error("{dependent} depends on {dependency} and has no state to fall back to")]
    UnfixableDependency {
        dependent: EntityRef,
        dependency: EntityRef,
    },

    #[error("Cannot plan '{job}' for {entity}: {message}")]
    InvalidJob {
        job: String,
        entity: EntityRef,
        message: String,
    },

    #[error("Command {command} finished abnormally: job {job} ({description}) failed: {message}")]
    AbnormalCompletion {
        command: CommandId,
        job: JobId,
        description: String,
        message: String,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Could not replace store file: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("Step result {step_index} of job {job_id} is already final")]
    Finalized { job_id: JobId, step_index: usize },

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Classifies a step failure for logs and step results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// The agent ran the operation and it failed.
    Agent,
    /// No answer within the step timeout.
    Timeout,
    /// The agent could not be reached or answered garbage.
    Transport,
    /// A crash interrupted a step that is unsafe to re-run.
    Interrupted,
    /// Recording progress failed.
    Store,
    /// A success hook rejected the completed job.
    Hook,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Agent => write!(f, "Agent"),
            FailureKind::Timeout => write!(f, "Timeout"),
            FailureKind::Transport => write!(f, "Transport"),
            FailureKind::Interrupted => write!(f, "Interrupted"),
            FailureKind::Store => write!(f, "Store"),
            FailureKind::Hook => write!(f, "Hook"),
        }
    }
}

/// A failed step: recorded on the job, never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} failure in step {step_index} ({step}): {message}")]
pub struct StepFailure {
    pub kind: FailureKind,
    pub step_index: usize,
    pub step: String,
    pub message: String,
    pub backtrace: String,
}
