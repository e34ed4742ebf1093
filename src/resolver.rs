//! Dependency resolution: turns "entity E should reach state S" into a graph
//! of jobs.
//!
//! Resolution works against an *expected* view of the world. An entity's
//! expected state is the state the plan under construction leaves it in, or
//! failing that the end state of the latest in-flight job writing it, or
//! failing that its cached state. Whenever a requirement is met by a job
//! (planned or in flight) the requiring job waits on that job.
//!
//! For every hop the resolver gathers three kinds of prerequisites:
//! the job's own dependencies, the descriptors the entity will hold in its
//! new state, and the entities depending on this one whose descriptors the
//! new state would violate. The latter are first driven to their fix state.
//!
//! Jobs are pushed only after their prerequisites, so the emitted order is
//! already a topological order of the `wait_for` edges.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::cache::ObjectCache;
use crate::error::SchedulerError;
use crate::model::{
    Catalog, DependOn, Dependencies, Entity, EntityRef, JobContext, TransitionRule,
};
use crate::state_machine::{JobId, LockRequest, Step, StepArgs};

/// A prerequisite job: one from the plan being built, or one already
/// pending or running in another command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Upstream {
    Planned(usize),
    Existing(JobId),
}

/// Read access to jobs that are pending or running.
pub trait InFlight {
    /// The latest pending or running job holding a write lock on `entity`,
    /// with the state that job leaves it in.
    fn latest_write(&self, entity: EntityRef) -> Option<(JobId, String)>;
}

/// Nothing is in flight: planning happens against the cache alone.
pub struct Quiescent;

impl InFlight for Quiescent {
    fn latest_write(&self, _entity: EntityRef) -> Option<(JobId, String)> {
        None
    }
}

/// A job as produced by the resolver, before it has an id.
#[derive(Debug, Clone)]
pub struct PlannedJob {
    pub name: String,
    pub advertised: bool,
    pub entity: EntityRef,
    pub from_state: String,
    pub to_state: String,
    pub args: StepArgs,
    pub description: String,
    pub steps: Vec<Step>,
    /// Locks beyond the default write lock on `entity`.
    pub locks: Vec<LockRequest>,
    pub wait_for: Vec<Upstream>,
    pub requires_confirmation: bool,
}

/// Resolver output: jobs in dependency order plus the in-flight jobs the
/// request is satisfied by without new work.
#[derive(Debug, Clone, Default)]
pub struct JobGraph {
    pub jobs: Vec<PlannedJob>,
    /// In-flight jobs the requested state depends on.
    pub shared: Vec<JobId>,
    /// Cache generation the graph was resolved against.
    pub generation: u64,
}

impl JobGraph {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty() && self.shared.is_empty()
    }

    pub fn needing_confirmation(&self) -> Vec<String> {
        self.jobs
            .iter()
            .filter(|j| j.requires_confirmation)
            .map(|j| j.description.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Prerequisites of the job itself: unmet requirements on entities
    /// under resolution are cycles.
    Job,
    /// Descriptors the entity holds in its new state: entities under
    /// resolution are left alone.
    Stateful,
}

pub struct DependencyResolver<'a> {
    catalog: &'a Catalog,
    cache: &'a ObjectCache,
    in_flight: &'a dyn InFlight,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(catalog: &'a Catalog, cache: &'a ObjectCache, in_flight: &'a dyn InFlight) -> Self {
        Self {
            catalog,
            cache,
            in_flight,
        }
    }

    /// Plan the jobs that take `entity` to `desired`.
    pub fn resolve(&self, entity: EntityRef, desired: &str) -> Result<JobGraph, SchedulerError> {
        let target = self.cache.require(entity)?;
        if !entity.kind.has_state(desired) {
            return Err(SchedulerError::InvalidState {
                entity,
                state: desired.to_string(),
            });
        }
        debug!(entity = %target, desired, "resolving");

        let mut planner = Planner::new(self);
        let upstream = planner.emit(entity, desired)?;
        Ok(planner.finish(upstream))
    }

    /// Plan an advertised job against `entity`.
    pub fn resolve_advertised(
        &self,
        name: &str,
        entity: EntityRef,
        args: StepArgs,
    ) -> Result<JobGraph, SchedulerError> {
        let job = self
            .catalog
            .advertised(name)
            .ok_or_else(|| SchedulerError::UnknownJobType(name.to_string()))?;
        if job.kind != entity.kind {
            return Err(SchedulerError::InvalidJob {
                job: name.to_string(),
                entity,
                message: format!("applies to {} entities", job.kind),
            });
        }
        self.cache.require(entity)?;
        debug!(entity = %entity, job = name, "resolving advertised job");

        let mut planner = Planner::new(self);
        let invalid = |message: String| SchedulerError::InvalidJob {
            job: name.to_string(),
            entity,
            message,
        };

        let mut wait = Vec::new();
        let before = planner.view(entity)?;
        let deps = (job.hooks.deps)(&JobContext {
            cache: self.cache,
            entity: &before,
            args: &args,
        })
        .map_err(invalid)?;
        planner.satisfy(&deps, Mode::Job, &mut wait)?;

        let (state, producer) = planner.expected(entity);
        wait.extend(producer);
        let view = planner.view(entity)?;
        let ctx = JobContext {
            cache: self.cache,
            entity: &view,
            args: &args,
        };
        let steps = (job.hooks.steps)(&ctx).map_err(invalid)?;
        let locks = job.hooks.locks.map(|f| f(&ctx)).unwrap_or_default();
        let description = job.description(&ctx);
        dedup(&mut wait);

        let index = planner.push(PlannedJob {
            name: name.to_string(),
            advertised: true,
            entity,
            from_state: state.clone(),
            to_state: state.clone(),
            args: args.clone(),
            description,
            steps,
            locks,
            wait_for: wait,
            requires_confirmation: job.requires_confirmation,
        });
        planner.project(entity, state, Upstream::Planned(index));
        Ok(planner.finish(Some(Upstream::Planned(index))))
    }
}

struct Planner<'r, 'a> {
    resolver: &'r DependencyResolver<'a>,
    jobs: Vec<PlannedJob>,
    projected: HashMap<EntityRef, (String, Upstream)>,
    /// (entity, desired state) pairs currently being resolved.
    stack: Vec<(EntityRef, String)>,
}

impl<'r, 'a> Planner<'r, 'a> {
    fn new(resolver: &'r DependencyResolver<'a>) -> Self {
        Self {
            resolver,
            jobs: Vec::new(),
            projected: HashMap::new(),
            stack: Vec::new(),
        }
    }

    fn finish(self, upstream: Option<Upstream>) -> JobGraph {
        let mut shared: Vec<JobId> = Vec::new();
        let referenced = self
            .jobs
            .iter()
            .flat_map(|j| j.wait_for.iter())
            .chain(upstream.iter());
        for up in referenced {
            if let Upstream::Existing(id) = up {
                if !shared.contains(id) {
                    shared.push(*id);
                }
            }
        }
        JobGraph {
            jobs: self.jobs,
            shared,
            generation: self.resolver.cache.generation(),
        }
    }

    fn push(&mut self, job: PlannedJob) -> usize {
        trace!(index = self.jobs.len(), job = %job.description, "planned");
        self.jobs.push(job);
        self.jobs.len() - 1
    }

    fn project(&mut self, entity: EntityRef, state: String, producer: Upstream) {
        self.projected.insert(entity, (state, producer));
    }

    fn expected(&self, entity: EntityRef) -> (String, Option<Upstream>) {
        if let Some((state, producer)) = self.projected.get(&entity) {
            return (state.clone(), Some(*producer));
        }
        if let Some((job, state)) = self.resolver.in_flight.latest_write(entity) {
            return (state, Some(Upstream::Existing(job)));
        }
        let state = self
            .resolver
            .cache
            .state_of(entity)
            .unwrap_or_default()
            .to_string();
        (state, None)
    }

    /// The cached entity with its state replaced by the expected one.
    fn view(&self, entity: EntityRef) -> Result<Entity, SchedulerError> {
        let mut view = self.resolver.cache.require(entity)?.clone();
        view.state = self.expected(entity).0;
        Ok(view)
    }

    fn on_stack(&self, entity: EntityRef) -> bool {
        self.stack.iter().any(|(e, _)| *e == entity)
    }

    fn cycle(&self, entity: EntityRef, state: &str) -> SchedulerError {
        let mut chain: Vec<String> = self
            .stack
            .iter()
            .map(|(e, s)| format!("{e}={s}"))
            .collect();
        chain.push(format!("{entity}={state}"));
        SchedulerError::DependencyCycle { chain }
    }

    /// Drive `entity` to `desired`, returning the job that produces that
    /// state, if any.
    fn emit(&mut self, entity: EntityRef, desired: &str) -> Result<Option<Upstream>, SchedulerError> {
        let (current, producer) = self.expected(entity);
        if current == desired {
            return Ok(producer);
        }
        if self
            .stack
            .iter()
            .any(|(e, s)| *e == entity && s == desired)
        {
            return Err(self.cycle(entity, desired));
        }

        let record = self.resolver.cache.require(entity)?;
        if record.immutable && desired != "forgotten" {
            return Err(SchedulerError::NoSuchTransition {
                entity,
                from: current,
                to: desired.to_string(),
            });
        }

        self.stack.push((entity, desired.to_string()));
        let result = self.walk(entity, desired);
        self.stack.pop();
        result
    }

    /// Emit one job per hop until the expected state is `desired`. The
    /// route is recomputed after every hop because resolving a hop's
    /// prerequisites may itself move the entity.
    fn walk(&mut self, entity: EntityRef, desired: &str) -> Result<Option<Upstream>, SchedulerError> {
        let budget = entity.kind.states().len() * 2;
        for _ in 0..budget {
            let (from, _) = self.expected(entity);
            if from == desired {
                return Ok(self.expected(entity).1);
            }
            let catalog = self.resolver.catalog;
            let rule = catalog
                .route(entity.kind, &from, desired)
                .and_then(|route| route.into_iter().next())
                .ok_or_else(|| SchedulerError::NoSuchTransition {
                    entity,
                    from: from.clone(),
                    to: desired.to_string(),
                })?;
            self.hop(entity, rule, &from)?;
        }
        Err(self.cycle(entity, desired))
    }

    fn hop(&mut self, entity: EntityRef, rule: &TransitionRule, from: &str) -> Result<(), SchedulerError> {
        let args = StepArgs::new();
        let view = self.view(entity)?;
        let invalid = |message: String| SchedulerError::InvalidJob {
            job: rule.name.to_string(),
            entity,
            message,
        };
        let ctx = JobContext {
            cache: self.resolver.cache,
            entity: &view,
            args: &args,
        };

        let mut wait: Vec<Upstream> = self.expected(entity).1.into_iter().collect();

        let deps = (rule.hooks.deps)(&ctx).map_err(invalid)?;
        self.satisfy(&deps, Mode::Job, &mut wait)?;

        let held = self.resolver.catalog.state_deps(self.resolver.cache, &view, rule.to);
        self.satisfy(&held, Mode::Stateful, &mut wait)?;

        self.fix_dependents(entity, rule.to, &mut wait)?;

        // Prerequisites must not move the entity under resolution.
        if self.expected(entity).0 != from {
            return Err(self.cycle(entity, rule.to));
        }

        let steps = (rule.hooks.steps)(&ctx).map_err(invalid)?;
        let locks = rule.hooks.locks.map(|f| f(&ctx)).unwrap_or_default();
        let description = rule.description(&ctx);
        dedup(&mut wait);

        let index = self.push(PlannedJob {
            name: rule.name.to_string(),
            advertised: false,
            entity,
            from_state: from.to_string(),
            to_state: rule.to.to_string(),
            args,
            description,
            steps,
            locks,
            wait_for: wait,
            requires_confirmation: rule.requires_confirmation,
        });
        self.project(entity, rule.to.to_string(), Upstream::Planned(index));
        Ok(())
    }

    fn satisfy(
        &mut self,
        deps: &Dependencies,
        mode: Mode,
        wait: &mut Vec<Upstream>,
    ) -> Result<(), SchedulerError> {
        match deps {
            Dependencies::On(dep) => self.satisfy_one(dep, mode, wait),
            Dependencies::All(all) => {
                for dep in all {
                    self.satisfy(dep, mode, wait)?;
                }
                Ok(())
            }
            Dependencies::Any(any) => {
                let Some(first) = any.first() else {
                    return Ok(());
                };
                let met = any
                    .iter()
                    .find(|d| d.satisfied(&|r| Some(self.expected(r).0)));
                match met {
                    Some(met) => {
                        for leaf in met.leaves() {
                            wait.extend(self.expected(leaf.entity).1);
                        }
                        Ok(())
                    }
                    None => self.satisfy(first, mode, wait),
                }
            }
        }
    }

    fn satisfy_one(
        &mut self,
        dep: &DependOn,
        mode: Mode,
        wait: &mut Vec<Upstream>,
    ) -> Result<(), SchedulerError> {
        let (state, producer) = self.expected(dep.entity);
        if dep.accepts(&state) {
            wait.extend(producer);
            return Ok(());
        }
        if self.on_stack(dep.entity) {
            return match mode {
                Mode::Job => Err(self.cycle(dep.entity, &dep.required_state)),
                Mode::Stateful => {
                    debug!(
                        dependency = %dep,
                        expected = %state,
                        "requirement on an entity under resolution skipped"
                    );
                    Ok(())
                }
            };
        }
        trace!(dependency = %dep, "unmet, resolving");
        let upstream = self.emit(dep.entity, &dep.required_state)?;
        wait.extend(upstream);
        Ok(())
    }

    /// Before `entity` moves to `new_state`, move every dependent whose
    /// descriptors would reject that state to the descriptor's fix state.
    fn fix_dependents(
        &mut self,
        entity: EntityRef,
        new_state: &str,
        wait: &mut Vec<Upstream>,
    ) -> Result<(), SchedulerError> {
        let cache = self.resolver.cache;
        let record = cache.require(entity)?;
        for dependent in cache.dependents(record) {
            if self.on_stack(dependent) {
                continue;
            }
            let budget = dependent.kind.states().len();
            for _ in 0..budget {
                let view = self.view(dependent)?;
                if !view.not_deleted {
                    break;
                }
                let Some(violated) = self.violation(&view, entity, new_state) else {
                    // Compliant only once its in-flight writer finishes.
                    let (_, producer) = self.expected(dependent);
                    if let Some(producer) = producer
                        && let Some(cached) = cache.get(dependent)
                        && self.violation(cached, entity, new_state).is_some()
                    {
                        trace!(dependent = %dependent, ?producer, "dependent fixed in flight");
                        wait.push(producer);
                    }
                    break;
                };
                let fix = violated
                    .fix_state
                    .clone()
                    .ok_or(SchedulerError::UnfixableDependency {
                        dependent,
                        dependency: entity,
                    })?;
                if fix == view.state {
                    return Err(SchedulerError::UnfixableDependency {
                        dependent,
                        dependency: entity,
                    });
                }
                debug!(dependent = %dependent, fix = %fix, "fixing dependent first");
                let upstream = self.emit(dependent, &fix)?;
                wait.extend(upstream);
            }
        }
        Ok(())
    }

    /// The descriptor `dependent` holds on `entity` in its current state
    /// that `new_state` would break.
    fn violation(&self, dependent: &Entity, entity: EntityRef, new_state: &str) -> Option<DependOn> {
        let held = self
            .resolver
            .catalog
            .state_deps(self.resolver.cache, dependent, &dependent.state);
        held.leaves()
            .into_iter()
            .find(|d| d.entity == entity && !d.accepts(new_state))
            .cloned()
    }
}

fn dedup(wait: &mut Vec<Upstream>) {
    let mut seen = Vec::with_capacity(wait.len());
    wait.retain(|u| {
        if seen.contains(u) {
            false
        } else {
            seen.push(*u);
            true
        }
    });
}
