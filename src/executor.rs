//! Runs the steps of one job against the fleet agents.
//!
//! Each step result is written as `incomplete` before the agent is called
//! and finalized before the next step starts, so a restart can tell which
//! step was in flight. The executor never touches job or entity state; the
//! scheduler applies the outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::agent::{AgentError, AgentRequest, AgentResponse, AgentRpc};
use crate::error::{FailureKind, StepFailure};
use crate::state_machine::{Job, Step, StepResult, StepState};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded,
    Failed(StepFailure),
    /// Cancellation was observed between steps.
    Cancelled,
}

pub struct JobExecutor {
    agent: Arc<dyn AgentRpc>,
    store: Arc<dyn Store>,
    default_timeout: Duration,
}

impl JobExecutor {
    pub fn new(agent: Arc<dyn AgentRpc>, store: Arc<dyn Store>, default_timeout: Duration) -> Self {
        Self {
            agent,
            store,
            default_timeout,
        }
    }

    /// Run every step of `job` in order. `cancel` is checked before each
    /// step; a step already sent to an agent always runs to completion.
    pub async fn execute(&self, job: &Job, cancel: &AtomicBool) -> ExecutionOutcome {
        let previous = match self.store.step_results(job.id) {
            Ok(results) => results,
            Err(e) => return store_failure(0, "(load)", e.to_string()),
        };

        for (index, step) in job.steps.iter().enumerate() {
            if previous
                .iter()
                .any(|r| r.step_index == index && r.state == StepState::Success)
            {
                debug!(job_id = job.id, step = %step.name, "step already completed, skipping");
                continue;
            }
            if cancel.load(Ordering::SeqCst) {
                info!(job_id = job.id, step = %step.name, "cancelled before step");
                return ExecutionOutcome::Cancelled;
            }

            let started = StepResult::begin(job.id, index, step);
            if let Err(e) = self.store.save_step_result(&started) {
                return store_failure(index, &step.name, e.to_string());
            }

            let request = match self.request_for(job, step, index) {
                Ok(r) => r,
                Err(failure) => return self.finish_failed(started, failure),
            };

            debug!(job_id = job.id, step = %step.name, host = %step.host, "running step");
            match self.call(step, request).await {
                Ok(response) => {
                    let done = started.succeed(response.result, response.console);
                    if let Err(e) = self.store.save_step_result(&done) {
                        return store_failure(index, &step.name, e.to_string());
                    }
                }
                Err(err) => {
                    let failure = StepFailure {
                        kind: err.kind(),
                        step_index: index,
                        step: step.name.clone(),
                        message: err.to_string(),
                        backtrace: err.backtrace().to_string(),
                    };
                    let console = err.console().to_string();
                    let done = started.fail(console, failure.backtrace.clone());
                    if let Err(e) = self.store.save_step_result(&done) {
                        warn!(job_id = job.id, error = %e, "could not record step failure");
                    }
                    warn!(job_id = job.id, step = %step.name, error = %failure, "step failed");
                    return ExecutionOutcome::Failed(failure);
                }
            }
        }
        ExecutionOutcome::Succeeded
    }

    fn request_for(&self, job: &Job, step: &Step, index: usize) -> Result<AgentRequest, StepFailure> {
        let mut request = AgentRequest::new(&step.host, &step.name, step.args.clone());
        if step.requires_local_state {
            let record = self
                .store
                .entity(job.entity)
                .map_err(|e| StepFailure {
                    kind: FailureKind::Store,
                    step_index: index,
                    step: step.name.clone(),
                    message: e.to_string(),
                    backtrace: String::new(),
                })?;
            request.local_state = record.and_then(|e| serde_json::to_value(e).ok());
        }
        Ok(request)
    }

    fn finish_failed(&self, started: StepResult, failure: StepFailure) -> ExecutionOutcome {
        let done = started.fail(String::new(), failure.message.clone());
        if let Err(e) = self.store.save_step_result(&done) {
            warn!(step = %failure.step, error = %e, "could not record step failure");
        }
        ExecutionOutcome::Failed(failure)
    }

    async fn call(&self, step: &Step, request: AgentRequest) -> Result<AgentResponse, AgentError> {
        if step.detached {
            let agent = self.agent.clone();
            tokio::spawn(async move {
                match agent.invoke(&request).await {
                    Ok(_) => debug!(host = %request.host, operation = %request.operation, "detached step finished"),
                    Err(e) => warn!(host = %request.host, operation = %request.operation, error = %e, "detached step failed"),
                }
            });
            return Ok(AgentResponse {
                result: None,
                console: format!("{} dispatched", step.name),
            });
        }

        let limit = step
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        match tokio::time::timeout(limit, self.agent.invoke(&request)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout {
                after_ms: limit.as_millis() as u64,
            }),
        }
    }
}

fn store_failure(index: usize, step: &str, message: String) -> ExecutionOutcome {
    ExecutionOutcome::Failed(StepFailure {
        kind: FailureKind::Store,
        step_index: index,
        step: step.to_string(),
        message,
        backtrace: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::SimulatedAgent;
    use crate::fixture::demo_cluster;
    use crate::model::EntityRef;
    use crate::state_machine::{JobState, StepArgs};
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn job(steps: Vec<Step>) -> Job {
        let now = Utc::now();
        Job {
            id: 1,
            command_id: 1,
            name: "load_lnet".into(),
            advertised: false,
            entity: EntityRef::lnet(1),
            from_state: "lnet_unloaded".into(),
            to_state: "lnet_down".into(),
            args: StepArgs::new(),
            description: "Load LNet on mds1".into(),
            steps,
            locks: Vec::new(),
            wait_for: Vec::new(),
            requires_confirmation: false,
            state: JobState::Running,
            errored: false,
            cancelled: false,
            failure: None,
            planned_generation: 0,
            created_at: now,
            modified_at: now,
        }
    }

    fn setup(agent: SimulatedAgent) -> (Arc<SimulatedAgent>, Arc<MemoryStore>, JobExecutor) {
        let agent = Arc::new(agent);
        let store = Arc::new(MemoryStore::with_entities(demo_cluster()));
        let executor = JobExecutor::new(agent.clone(), store.clone(), Duration::from_secs(5));
        (agent, store, executor)
    }

    #[tokio::test]
    async fn runs_steps_in_order_and_records_results() {
        let (agent, store, executor) = setup(SimulatedAgent::new());
        let job = job(vec![
            Step::new("load_lnet", "mds1.local"),
            Step::new("get_lnet_state", "mds1.local").local_state(),
        ]);
        let outcome = executor.execute(&job, &AtomicBool::new(false)).await;
        assert_eq!(outcome, ExecutionOutcome::Succeeded);
        assert_eq!(
            agent.operations(),
            vec!["mds1.local:load_lnet", "mds1.local:get_lnet_state"]
        );

        let results = store.step_results(1).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.state == StepState::Success));

        let calls = agent.calls();
        assert!(calls[0].local_state.is_none());
        let local = calls[1].local_state.as_ref().unwrap();
        assert_eq!(local["id"], "lnet_configuration:1");
    }

    #[tokio::test]
    async fn failure_skips_remaining_steps() {
        let agent = SimulatedAgent::new();
        agent.fail("load_lnet", "modprobe failed");
        let (agent, store, executor) = setup(agent);
        let job = job(vec![
            Step::new("load_lnet", "mds1.local"),
            Step::new("get_lnet_state", "mds1.local"),
        ]);

        let ExecutionOutcome::Failed(failure) = executor.execute(&job, &AtomicBool::new(false)).await
        else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, FailureKind::Agent);
        assert_eq!(failure.step_index, 0);
        assert!(failure.message.contains("modprobe failed"));
        assert_eq!(agent.operations().len(), 1);

        let results = store.step_results(1).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].state, StepState::Failed);
        assert_eq!(results[0].backtrace, "simulated failure in load_lnet");
    }

    #[tokio::test]
    async fn slow_step_times_out() {
        let (_agent, store, executor) =
            setup(SimulatedAgent::new().with_latency(Duration::from_millis(200)));
        let job = job(vec![Step::new("load_lnet", "mds1.local").timeout_ms(10)]);

        let ExecutionOutcome::Failed(failure) = executor.execute(&job, &AtomicBool::new(false)).await
        else {
            panic!("expected timeout");
        };
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert_eq!(store.step_results(1).unwrap()[0].state, StepState::Failed);
    }

    #[tokio::test]
    async fn cancel_is_observed_before_the_first_step() {
        let (agent, store, executor) = setup(SimulatedAgent::new());
        let job = job(vec![Step::new("load_lnet", "mds1.local")]);
        let outcome = executor.execute(&job, &AtomicBool::new(true)).await;
        assert_eq!(outcome, ExecutionOutcome::Cancelled);
        assert!(agent.calls().is_empty());
        assert!(store.step_results(1).unwrap().is_empty());
    }

    #[tokio::test]
    async fn detached_step_succeeds_once_dispatched() {
        let agent = SimulatedAgent::new();
        agent.fail("deploy_agent", "unreachable");
        let (_agent, store, executor) = setup(agent);
        let job = job(vec![Step::new("deploy_agent", "oss1.local").detached()]);

        let outcome = executor.execute(&job, &AtomicBool::new(false)).await;
        assert_eq!(outcome, ExecutionOutcome::Succeeded);
        let results = store.step_results(1).unwrap();
        assert_eq!(results[0].console, "deploy_agent dispatched");
    }

    #[tokio::test]
    async fn completed_steps_are_not_sent_again() {
        let (agent, store, executor) = setup(SimulatedAgent::new());
        let steps = vec![
            Step::new("load_lnet", "mds1.local").idempotent(),
            Step::new("get_lnet_state", "mds1.local").idempotent(),
        ];
        let done = StepResult::begin(1, 0, &steps[0]).succeed(None, "ok".into());
        store.save_step_result(&done).unwrap();

        let outcome = executor.execute(&job(steps), &AtomicBool::new(false)).await;
        assert_eq!(outcome, ExecutionOutcome::Succeeded);
        assert_eq!(agent.operations(), vec!["mds1.local:get_lnet_state"]);
    }
}
