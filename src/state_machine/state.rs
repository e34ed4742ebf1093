use std::fmt;

use serde::{Deserialize, Serialize};

use super::job::{Job, JobOutcome};

/// Job lifecycle: `pending → running → complete`.
///
/// A complete job carries its outcome in the `errored`/`cancelled` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Complete,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Complete => write!(f, "complete"),
        }
    }
}

/// Something that happened to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// Admitted by the scheduler; a worker picked it up.
    Start,
    Succeeded,
    Errored(String),
    Cancelled,
    /// Crash recovery put an interrupted job back in the queue.
    Reset,
}

/// The result of applying an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Next(JobState),
    Complete(JobOutcome),
    /// The event does not apply in the job's current state.
    Rejected { state: JobState, event: JobEvent },
}

/// Drives a [`Job`] through its lifecycle.
pub struct StateMachine;

impl StateMachine {
    /// Apply `event` to `job` and return the transition taken.
    ///
    /// - `Pending` starts, or completes as errored/cancelled without running.
    /// - `Running` completes with any outcome, or is reset by recovery.
    /// - `Complete` is terminal; every event is rejected.
    pub fn next(job: &mut Job, event: JobEvent) -> Transition {
        let transition = match (job.state, &event) {
            (JobState::Pending, JobEvent::Start) => Transition::Next(JobState::Running),
            (JobState::Running, JobEvent::Reset) => Transition::Next(JobState::Pending),
            (JobState::Running, JobEvent::Succeeded) => {
                Transition::Complete(JobOutcome::Succeeded)
            }
            (JobState::Pending | JobState::Running, JobEvent::Errored(_)) => {
                Transition::Complete(JobOutcome::Errored)
            }
            (JobState::Pending | JobState::Running, JobEvent::Cancelled) => {
                Transition::Complete(JobOutcome::Cancelled)
            }
            (state, _) => Transition::Rejected {
                state,
                event: event.clone(),
            },
        };

        match &transition {
            Transition::Next(next) => {
                job.state = *next;
                job.touch();
            }
            Transition::Complete(outcome) => {
                job.state = JobState::Complete;
                match outcome {
                    JobOutcome::Succeeded => {}
                    JobOutcome::Errored => {
                        job.errored = true;
                        if let JobEvent::Errored(message) = &event {
                            job.failure = Some(message.clone());
                        }
                    }
                    JobOutcome::Cancelled => job.cancelled = true,
                }
                job.touch();
            }
            Transition::Rejected { .. } => {}
        }

        transition
    }
}
