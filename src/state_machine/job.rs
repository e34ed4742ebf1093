use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::state::JobState;
use crate::model::EntityRef;

pub type JobId = u64;
pub type CommandId = u64;

/// Key/value arguments passed to an agent operation.
pub type StepArgs = serde_json::Map<String, Value>;

/// A named remote operation executed on one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    /// FQDN of the host whose agent runs the operation.
    pub host: String,
    #[serde(default)]
    pub args: StepArgs,
    /// Safe to re-run after a crash interrupted it.
    #[serde(default)]
    pub idempotent: bool,
    /// The agent needs the stored record of the job's entity.
    #[serde(default)]
    pub requires_local_state: bool,
    /// Fire-and-forget: the step succeeds once dispatched and the agent's
    /// answer is only logged.
    #[serde(default)]
    pub detached: bool,
    /// Per-step override of the configured step timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Step {
    pub fn new(name: &str, host: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            host: host.into(),
            args: StepArgs::new(),
            idempotent: false,
            requires_local_state: false,
            detached: false,
            timeout_ms: None,
        }
    }

    pub fn arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn local_state(mut self) -> Self {
        self.requires_local_state = true;
        self
    }

    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Incomplete,
    Success,
    Failed,
}

/// Record of one step execution. Written as `incomplete` when the step
/// starts and finalized exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub job_id: JobId,
    pub step_index: usize,
    pub step_name: String,
    pub state: StepState,
    #[serde(default)]
    pub console: String,
    #[serde(default)]
    pub backtrace: String,
    #[serde(default)]
    pub result: Option<Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn begin(job_id: JobId, step_index: usize, step: &Step) -> Self {
        Self {
            job_id,
            step_index,
            step_name: step.name.clone(),
            state: StepState::Incomplete,
            console: String::new(),
            backtrace: String::new(),
            result: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_final(&self) -> bool {
        self.state != StepState::Incomplete
    }

    pub fn succeed(mut self, result: Option<Value>, console: String) -> Self {
        self.state = StepState::Success;
        self.result = result;
        self.console = console;
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn fail(mut self, console: String, backtrace: String) -> Self {
        self.state = StepState::Failed;
        self.console = console;
        self.backtrace = backtrace;
        self.finished_at = Some(Utc::now());
        self
    }
}

/// A claim on an entity for the span of a job. Two requests conflict when
/// they name the same entity and at least one of them is a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub entity: EntityRef,
    pub begin_state: String,
    pub end_state: String,
    pub write: bool,
}

impl LockRequest {
    pub fn write(entity: EntityRef, begin_state: &str, end_state: &str) -> Self {
        Self {
            entity,
            begin_state: begin_state.to_string(),
            end_state: end_state.to_string(),
            write: true,
        }
    }

    pub fn read(entity: EntityRef, state: &str) -> Self {
        Self {
            entity,
            begin_state: state.to_string(),
            end_state: state.to_string(),
            write: false,
        }
    }

    pub fn conflicts_with(&self, other: &LockRequest) -> bool {
        self.entity == other.entity && (self.write || other.write)
    }
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Errored,
    Cancelled,
}

/// One unit of scheduled work: a single transition hop of one entity, or an
/// advertised job that runs steps without changing state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// The command that created the job. Later commands may share it.
    pub command_id: CommandId,
    /// Transition rule or advertised job name.
    pub name: String,
    #[serde(default)]
    pub advertised: bool,
    pub entity: EntityRef,
    pub from_state: String,
    pub to_state: String,
    #[serde(default)]
    pub args: StepArgs,
    pub description: String,
    pub steps: Vec<Step>,
    pub locks: Vec<LockRequest>,
    pub wait_for: Vec<JobId>,
    #[serde(default)]
    pub requires_confirmation: bool,
    pub state: JobState,
    #[serde(default)]
    pub errored: bool,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub failure: Option<String>,
    /// Cache generation the job was resolved against. Only logged; admission
    /// re-checks `from_state` against the cache instead.
    #[serde(default)]
    pub planned_generation: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Job {
    pub fn changes_state(&self) -> bool {
        !self.advertised && self.from_state != self.to_state
    }

    pub fn is_complete(&self) -> bool {
        self.state == JobState::Complete
    }

    pub fn outcome(&self) -> Option<JobOutcome> {
        match self.state {
            JobState::Complete if self.errored => Some(JobOutcome::Errored),
            JobState::Complete if self.cancelled => Some(JobOutcome::Cancelled),
            JobState::Complete => Some(JobOutcome::Succeeded),
            _ => None,
        }
    }

    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }
}

/// Summary of a finished job, suitable for logs and the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub description: String,
    pub entity: EntityRef,
    pub outcome: Option<JobOutcome>,
    pub steps_run: usize,
    pub steps_total: usize,
    pub failure: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl JobReport {
    pub fn from_job(job: &Job, results: &[StepResult]) -> Self {
        let duration = job.modified_at - job.created_at;
        Self {
            job_id: job.id,
            description: job.description.clone(),
            entity: job.entity,
            outcome: job.outcome(),
            steps_run: results.iter().filter(|r| r.is_final()).count(),
            steps_total: job.steps.len(),
            failure: job.failure.clone(),
            started_at: job.created_at,
            completed_at: job.modified_at,
            duration_ms: duration.num_milliseconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_builder_defaults_to_non_idempotent() {
        let step = Step::new("format_target", "oss1")
            .arg("device", "/dev/sdb")
            .timeout_ms(500);
        assert!(!step.idempotent);
        assert!(!step.requires_local_state);
        assert_eq!(step.args["device"], "/dev/sdb");
        assert_eq!(step.timeout_ms, Some(500));
    }

    #[test]
    fn locks_conflict_only_on_same_entity_with_a_writer() {
        let w = LockRequest::write(EntityRef::lnet(1), "lnet_down", "lnet_up");
        let r = LockRequest::read(EntityRef::lnet(1), "lnet_up");
        let other = LockRequest::write(EntityRef::lnet(2), "lnet_down", "lnet_up");
        assert!(w.conflicts_with(&r));
        assert!(r.conflicts_with(&w));
        assert!(!r.conflicts_with(&r.clone()));
        assert!(!w.conflicts_with(&other));
    }

    #[test]
    fn step_result_finalizes_once() {
        let step = Step::new("load_lnet", "mds1");
        let result = StepResult::begin(4, 0, &step);
        assert!(!result.is_final());
        let done = result.succeed(None, "ok".into());
        assert!(done.is_final());
        assert_eq!(done.state, StepState::Success);
        assert!(done.finished_at.is_some());
    }
}
