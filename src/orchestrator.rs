use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::agent::AgentRpc;
use crate::cache::{self, ObjectCache};
use crate::commands::{Command, CommandTracker};
use crate::config::SchedulerConfig;
use crate::error::{FailureKind, SchedulerError};
use crate::executor::{ExecutionOutcome, JobExecutor};
use crate::locks::{Admission, LockManager};
use crate::model::{Catalog, Entity, EntityRef, JobContext, SuccessFn};
use crate::resolver::{DependencyResolver, JobGraph, Upstream};
use crate::state_machine::{
    CommandId, Job, JobEvent, JobId, JobState, StateMachine, StepArgs, StepResult, StepState,
};
use crate::store::Store;

/// Message recorded on jobs a restart found mid-step in a step that is not
/// safe to run twice.
pub const OPERATOR_INTERVENTION: &str = "operator intervention required";

struct SchedulerState {
    cache: ObjectCache,
    locks: LockManager,
    jobs: BTreeMap<JobId, Job>,
    commands: CommandTracker,
    /// Jobs currently executing, with their cancellation flags.
    running: BTreeMap<JobId, Arc<AtomicBool>>,
    next_job_id: JobId,
}

struct Shared {
    catalog: Catalog,
    store: Arc<dyn Store>,
    executor: JobExecutor,
    worker_count: usize,
    state: Mutex<SchedulerState>,
    changed: Notify,
}

/// The single scheduling authority: plans commands, admits jobs under the
/// lock rules, runs them on a bounded set of workers and records results.
///
/// Cheap to clone; all clones drive the same scheduler. Must be used from
/// within a Tokio runtime.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Load everything from `store`, recover jobs a previous process left
    /// running and start admitting work.
    pub fn start(
        catalog: Catalog,
        store: Arc<dyn Store>,
        agent: Arc<dyn AgentRpc>,
        config: &SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let snapshot = store.load()?;
        let cache = ObjectCache::from_entities(&catalog, snapshot.entities)?;
        let next_job_id = snapshot.jobs.iter().map(|j| j.id + 1).max().unwrap_or(1);
        let mut jobs: BTreeMap<JobId, Job> =
            snapshot.jobs.into_iter().map(|j| (j.id, j)).collect();

        for job in jobs.values_mut().filter(|j| j.state == JobState::Running) {
            let results = store.step_results(job.id)?;
            recover(job, &results);
            store.save_job(job)?;
        }

        let mut locks = LockManager::new();
        for job in jobs.values().filter(|j| !j.is_complete()) {
            locks.register(job.id, job.locks.clone());
        }

        info!(
            entities = cache.len(),
            jobs = jobs.len(),
            pending = jobs.values().filter(|j| !j.is_complete()).count(),
            "scheduler started"
        );

        let executor = JobExecutor::new(
            agent,
            store.clone(),
            Duration::from_millis(config.step_timeout_ms),
        );
        let scheduler = Self {
            shared: Arc::new(Shared {
                catalog,
                store,
                executor,
                worker_count: config.worker_count.max(1),
                state: Mutex::new(SchedulerState {
                    cache,
                    locks,
                    jobs,
                    commands: CommandTracker::from_commands(snapshot.commands),
                    running: BTreeMap::new(),
                    next_job_id,
                }),
                changed: Notify::new(),
            }),
        };
        {
            let mut st = scheduler.lock();
            scheduler.refresh_commands(&mut st);
        }
        scheduler.tick();
        Ok(scheduler)
    }

    pub fn catalog(&self) -> &Catalog {
        &self.shared.catalog
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The jobs that `set_state(entity, state)` would create right now,
    /// with locks and ordering attached. Nothing is scheduled.
    pub fn plan(&self, entity: EntityRef, state: &str) -> Result<JobGraph, SchedulerError> {
        let st = self.lock();
        let mut graph =
            DependencyResolver::new(&self.shared.catalog, &st.cache, &st.locks).resolve(entity, state)?;
        st.locks.annotate(&mut graph);
        Ok(graph)
    }

    /// Request that `entity` reaches `state`.
    ///
    /// Fails without scheduling anything when the plan contains jobs that
    /// need confirmation and `confirmed` is false.
    pub fn set_state(
        &self,
        entity: EntityRef,
        state: &str,
        message: Option<String>,
        confirmed: bool,
    ) -> Result<Command, SchedulerError> {
        let command = {
            let mut st = self.lock();
            let mut graph = DependencyResolver::new(&self.shared.catalog, &st.cache, &st.locks)
                .resolve(entity, state)?;
            st.locks.annotate(&mut graph);
            let label = st
                .cache
                .get(entity)
                .map(|e| e.label.clone())
                .unwrap_or_else(|| entity.to_string());
            let message = message.unwrap_or_else(|| format!("Set {label} to {state}"));
            self.submit(&mut st, graph, message, confirmed)?
        };
        self.tick();
        Ok(command)
    }

    /// Run an advertised job against `entity`.
    pub fn run_job(
        &self,
        name: &str,
        entity: EntityRef,
        args: StepArgs,
        confirmed: bool,
    ) -> Result<Command, SchedulerError> {
        let command = {
            let mut st = self.lock();
            let mut graph = DependencyResolver::new(&self.shared.catalog, &st.cache, &st.locks)
                .resolve_advertised(name, entity, args)?;
            st.locks.annotate(&mut graph);
            let message = graph
                .jobs
                .last()
                .map(|j| j.description.clone())
                .unwrap_or_else(|| name.to_string());
            self.submit(&mut st, graph, message, confirmed)?
        };
        self.tick();
        Ok(command)
    }

    fn submit(
        &self,
        st: &mut SchedulerState,
        graph: JobGraph,
        message: String,
        confirmed: bool,
    ) -> Result<Command, SchedulerError> {
        let needing = graph.needing_confirmation();
        if !confirmed && !needing.is_empty() {
            return Err(SchedulerError::ConfirmationRequired { jobs: needing });
        }

        let command_id = st.commands.peek_id();
        let first = st.next_job_id;
        let ids: Vec<JobId> = (0..graph.jobs.len() as u64).map(|i| first + i).collect();
        let now = Utc::now();

        let mut created = Vec::with_capacity(graph.jobs.len());
        for (planned, id) in graph.jobs.into_iter().zip(&ids) {
            let wait_for = planned
                .wait_for
                .iter()
                .map(|u| match u {
                    Upstream::Planned(index) => ids[*index],
                    Upstream::Existing(job) => *job,
                })
                .collect();
            created.push(Job {
                id: *id,
                command_id,
                name: planned.name,
                advertised: planned.advertised,
                entity: planned.entity,
                from_state: planned.from_state,
                to_state: planned.to_state,
                args: planned.args,
                description: planned.description,
                steps: planned.steps,
                locks: planned.locks,
                wait_for,
                requires_confirmation: planned.requires_confirmation,
                state: JobState::Pending,
                errored: false,
                cancelled: false,
                failure: None,
                planned_generation: graph.generation,
                created_at: now,
                modified_at: now,
            });
        }

        for job in &created {
            self.shared.store.save_job(job)?;
        }
        st.next_job_id = first + ids.len() as u64;

        let mut job_ids = ids.clone();
        for shared in graph.shared {
            if !job_ids.contains(&shared) && st.jobs.get(&shared).is_some_and(|j| !j.is_complete()) {
                job_ids.push(shared);
            }
        }
        let command = st.commands.create(message, job_ids);
        self.shared.store.save_command(&command)?;

        for job in created {
            debug!(job_id = job.id, entity = %job.entity, wait_for = ?job.wait_for, "job created");
            st.locks.register(job.id, job.locks.clone());
            st.jobs.insert(job.id, job);
        }
        info!(
            command = command.id,
            jobs = ids.len(),
            shared = command.job_ids.len() - ids.len(),
            message = %command.message,
            "command created"
        );
        Ok(command)
    }

    pub fn command(&self, id: CommandId) -> Result<Command, SchedulerError> {
        self.lock()
            .commands
            .get(id)
            .cloned()
            .ok_or(SchedulerError::CommandNotFound(id))
    }

    pub fn commands(&self) -> Vec<Command> {
        self.lock().commands.all().cloned().collect()
    }

    pub fn job(&self, id: JobId) -> Result<Job, SchedulerError> {
        self.lock()
            .jobs
            .get(&id)
            .cloned()
            .ok_or(SchedulerError::JobNotFound(id))
    }

    /// The jobs a command tracks, in id order.
    pub fn jobs_of(&self, id: CommandId) -> Result<Vec<Job>, SchedulerError> {
        let st = self.lock();
        let command = st.commands.get(id).ok_or(SchedulerError::CommandNotFound(id))?;
        let mut jobs: Vec<Job> = command
            .job_ids
            .iter()
            .filter_map(|j| st.jobs.get(j).cloned())
            .collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    pub fn step_results(&self, job: JobId) -> Result<Vec<StepResult>, SchedulerError> {
        Ok(self.shared.store.step_results(job)?)
    }

    pub fn entity(&self, id: EntityRef) -> Option<Entity> {
        self.lock().cache.get(id).cloned()
    }

    pub fn entities(&self) -> Vec<Entity> {
        self.lock().cache.entities().cloned().collect()
    }

    pub fn available_states(&self, id: EntityRef) -> Result<Vec<String>, SchedulerError> {
        let st = self.lock();
        let entity = st.cache.require(id)?;
        Ok(self.shared.catalog.available_states(&st.cache, entity))
    }

    /// Cancel the command's own jobs that have not finished. Pending jobs are
    /// cancelled at once; running jobs stop before their next step.
    pub fn cancel_command(&self, id: CommandId, confirmed: bool) -> Result<Command, SchedulerError> {
        let command = {
            let mut st = self.lock();
            let command = st
                .commands
                .get(id)
                .cloned()
                .ok_or(SchedulerError::CommandNotFound(id))?;
            if command.complete {
                return Ok(command);
            }

            let unfinished: Vec<JobId> = st
                .jobs
                .values()
                .filter(|j| j.command_id == id && !j.is_complete())
                .map(|j| j.id)
                .collect();
            let needing: Vec<String> = unfinished
                .iter()
                .filter_map(|j| st.jobs.get(j))
                .filter(|j| j.requires_confirmation)
                .map(|j| j.description.clone())
                .collect();
            if !confirmed && !needing.is_empty() {
                return Err(SchedulerError::ConfirmationRequired { jobs: needing });
            }

            if let Some(c) = st.commands.mark_cancelled(id) {
                self.shared.store.save_command(&c)?;
            }
            for job_id in unfinished {
                match st.running.get(&job_id).cloned() {
                    Some(flag) => {
                        info!(command = id, job_id, "stopping running job after its current step");
                        flag.store(true, Ordering::SeqCst);
                    }
                    None => self.close_job(&mut st, job_id, JobEvent::Cancelled),
                }
            }
            self.refresh_commands(&mut st);
            info!(command = id, "command cancelled");
            st.commands.get(id).cloned().unwrap_or(command)
        };
        self.shared.changed.notify_waiters();
        self.tick();
        Ok(command)
    }

    pub fn dismiss_command(&self, id: CommandId) -> Result<Command, SchedulerError> {
        let mut st = self.lock();
        let command = st
            .commands
            .dismiss(id)
            .ok_or(SchedulerError::CommandNotFound(id))?;
        self.shared.store.save_command(&command)?;
        Ok(command)
    }

    /// Wait until the command completes. A command that finished with an
    /// errored job is reported as [`SchedulerError::AbnormalCompletion`].
    pub async fn wait_for_command(&self, id: CommandId) -> Result<Command, SchedulerError> {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let st = self.lock();
                let command = st.commands.get(id).ok_or(SchedulerError::CommandNotFound(id))?;
                if command.complete {
                    if !command.errored {
                        return Ok(command.clone());
                    }
                    let (job, description, message) =
                        match st.commands.first_failure(id, &st.jobs) {
                            Some(job) => (
                                job.id,
                                job.description.clone(),
                                job.failure.clone().unwrap_or_else(|| "cancelled".into()),
                            ),
                            None => (0, String::new(), "unknown failure".into()),
                        };
                    return Err(SchedulerError::AbnormalCompletion {
                        command: id,
                        job,
                        description,
                        message,
                    });
                }
            }
            notified.await;
        }
    }

    /// Wait until no job is pending or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock().jobs.values().all(|j| j.is_complete()) {
                return;
            }
            notified.await;
        }
    }

    /// Admission pass: cancel jobs whose prerequisites failed and start
    /// every ready job a free worker can take.
    fn tick(&self) {
        let mut changed = false;
        let mut dispatched = Vec::new();
        {
            let mut st = self.lock();
            let ready = loop {
                let running: BTreeSet<JobId> = st.running.keys().copied().collect();
                let mut ready = Vec::new();
                let mut doomed = Vec::new();
                for job in st.jobs.values().filter(|j| j.state == JobState::Pending) {
                    match st.locks.can_start(job, &st.jobs, &running) {
                        Admission::Doomed(prerequisite) => doomed.push((job.id, prerequisite)),
                        Admission::Ready if running.len() + ready.len() < self.shared.worker_count => {
                            ready.push(job.id)
                        }
                        _ => {}
                    }
                }
                if doomed.is_empty() {
                    break ready;
                }
                changed = true;
                for (job_id, prerequisite) in doomed {
                    info!(job_id, prerequisite, "cancelling job: prerequisite did not succeed");
                    if let Some(job) = st.jobs.get_mut(&job_id) {
                        job.failure = Some(format!("prerequisite job {prerequisite} did not succeed"));
                    }
                    self.close_job(&mut st, job_id, JobEvent::Cancelled);
                }
            };

            for job_id in ready {
                let Some(job) = st.jobs.get(&job_id) else {
                    continue;
                };
                let current = st.cache.state_of(job.entity);
                if job.changes_state() && current != Some(job.from_state.as_str()) {
                    let message = format!(
                        "{} is in state '{}', expected '{}'",
                        job.entity,
                        current.unwrap_or("unknown"),
                        job.from_state
                    );
                    warn!(job_id, %message, "refusing to start job");
                    self.close_job(&mut st, job_id, JobEvent::Errored(message));
                    changed = true;
                    continue;
                }

                let mut job = job.clone();
                StateMachine::next(&mut job, JobEvent::Start);
                // A job is dispatched only once its start is durable.
                if let Err(e) = self.shared.store.save_job(&job) {
                    error!(job_id, error = %e, "could not record job start");
                    let message = format!("{}: {e}", FailureKind::Store);
                    self.close_job(&mut st, job_id, JobEvent::Errored(message));
                    changed = true;
                    continue;
                }
                info!(
                    job_id,
                    entity = %job.entity,
                    description = %job.description,
                    planned_generation = job.planned_generation,
                    generation = st.cache.generation(),
                    "job started"
                );
                st.jobs.insert(job_id, job.clone());
                let flag = Arc::new(AtomicBool::new(false));
                st.running.insert(job_id, flag.clone());
                changed = true;
                dispatched.push(job_id);

                let scheduler = self.clone();
                tokio::spawn(async move {
                    let outcome = scheduler.shared.executor.execute(&job, &flag).await;
                    scheduler.finish(job.id, outcome);
                });
            }

            if changed {
                self.refresh_commands(&mut st);
            }
        }
        if changed {
            self.shared.changed.notify_waiters();
        }
        if !dispatched.is_empty() {
            debug!(jobs = ?dispatched, "workers dispatched");
        }
    }

    /// Record the end of a job run and re-run admission.
    fn finish(&self, job_id: JobId, outcome: ExecutionOutcome) {
        {
            let mut st = self.lock();
            let cancelled = st
                .running
                .remove(&job_id)
                .is_some_and(|flag| flag.load(Ordering::SeqCst));
            match outcome {
                ExecutionOutcome::Succeeded if cancelled => {
                    // The state change stands; dependents must not start.
                    info!(job_id, "job finished after its command was cancelled");
                    self.complete_job(&mut st, job_id, JobEvent::Cancelled);
                }
                ExecutionOutcome::Succeeded => self.complete_job(&mut st, job_id, JobEvent::Succeeded),
                ExecutionOutcome::Failed(failure) => {
                    warn!(job_id, kind = %failure.kind, error = %failure, "job failed");
                    self.close_job(&mut st, job_id, JobEvent::Errored(failure.to_string()));
                }
                ExecutionOutcome::Cancelled => {
                    info!(job_id, "job cancelled");
                    self.close_job(&mut st, job_id, JobEvent::Cancelled);
                }
            }
            self.refresh_commands(&mut st);
        }
        self.shared.changed.notify_waiters();
        self.tick();
    }

    /// Apply a job whose steps all succeeded: state change and success hook
    /// go to the store in one commit, then to the cache. `event` is the
    /// outcome recorded on the job.
    fn complete_job(&self, st: &mut SchedulerState, job_id: JobId, event: JobEvent) {
        let Some(mut job) = st.jobs.get(&job_id).cloned() else {
            return;
        };
        let updates = match self.success_updates(&st.cache, &job) {
            Ok(updates) => updates,
            Err(message) => {
                let message = format!("{} failure: {message}", FailureKind::Hook);
                warn!(job_id, %message, "success hook rejected job");
                self.close_job(st, job_id, JobEvent::Errored(message));
                return;
            }
        };

        StateMachine::next(&mut job, event);
        if let Err(e) = self.shared.store.commit_job(&job, &updates) {
            error!(job_id, error = %e, "could not commit job");
            self.close_job(st, job_id, JobEvent::Errored(format!("{}: {e}", FailureKind::Store)));
            return;
        }
        if let Err(e) = st.cache.apply(&updates) {
            error!(job_id, error = %e, "committed job could not be applied to the cache");
        }
        st.locks.release(job_id);
        info!(
            job_id,
            entity = %job.entity,
            state = %job.to_state,
            generation = st.cache.generation(),
            "job complete"
        );
        st.jobs.insert(job_id, job);
    }

    fn success_updates(&self, cache: &ObjectCache, job: &Job) -> Result<Vec<Entity>, String> {
        let before = cache.require(job.entity).map_err(|e| e.to_string())?;
        let hook: Option<SuccessFn> = if job.advertised {
            self.shared.catalog.advertised(&job.name).and_then(|a| a.hooks.on_success)
        } else {
            self.shared.catalog.rule(&job.name).and_then(|r| r.hooks.on_success)
        };

        let mut entity = before.clone();
        if job.changes_state() {
            entity.set_state(&job.to_state);
        }
        let mut updates = match hook {
            Some(f) => f(
                &JobContext {
                    cache,
                    entity: before,
                    args: &job.args,
                },
                &mut entity,
            )?,
            None => Vec::new(),
        };
        updates.insert(0, entity);
        for update in &updates {
            cache::validate(update).map_err(|e| e.to_string())?;
        }
        Ok(updates)
    }

    /// Move a pending or running job to complete through `event` and drop
    /// its locks.
    fn close_job(&self, st: &mut SchedulerState, job_id: JobId, event: JobEvent) {
        st.running.remove(&job_id);
        if let Some(job) = st.jobs.get_mut(&job_id) {
            StateMachine::next(job, event);
            if let Err(e) = self.shared.store.save_job(job) {
                error!(job_id, error = %e, "could not record job");
            }
        }
        st.locks.release(job_id);
    }

    fn refresh_commands(&self, st: &mut SchedulerState) {
        let open: Vec<CommandId> = st
            .commands
            .all()
            .filter(|c| !c.complete)
            .map(|c| c.id)
            .collect();
        for id in open {
            if let Some(command) = st.commands.refresh(id, &st.jobs) {
                if command.complete {
                    info!(command = id, errored = command.errored, "command finished");
                }
                if let Err(e) = self.shared.store.save_command(&command) {
                    error!(command = id, error = %e, "could not record command");
                }
            }
        }
    }
}

/// Decide what to do with a job a previous process left running.
///
/// The job resumes from its first step without a final result. If that step
/// had already been sent to an agent and is not idempotent, or any step
/// failed, the job is errored instead.
fn recover(job: &mut Job, results: &[StepResult]) {
    let result_of = |index: usize| results.iter().find(|r| r.step_index == index);

    if let Some(failed) = results.iter().find(|r| r.state == StepState::Failed) {
        let message = format!("step {} ({}) failed before restart", failed.step_index, failed.step_name);
        warn!(job_id = job.id, %message, "recovering job");
        StateMachine::next(job, JobEvent::Errored(message));
        return;
    }

    let interrupted = job
        .steps
        .iter()
        .enumerate()
        .find(|(i, _)| !result_of(*i).is_some_and(|r| r.is_final()));
    match interrupted {
        Some((index, step)) if result_of(index).is_some() && !step.idempotent => {
            let message = format!(
                "{OPERATOR_INTERVENTION}: step {index} ({}) was interrupted and is not idempotent",
                step.name
            );
            warn!(job_id = job.id, %message, "recovering job");
            StateMachine::next(job, JobEvent::Errored(message));
        }
        _ => {
            info!(job_id = job.id, "resuming interrupted job");
            StateMachine::next(job, JobEvent::Reset);
        }
    }
}
