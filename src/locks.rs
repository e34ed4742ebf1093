//! Lock bookkeeping for pending and running jobs.
//!
//! Every job locks the entity it changes. A lock taken by a pending or
//! running job stays registered until the job completes, so later plans see
//! it both as the expected state of the entity and as something to queue
//! behind.

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::model::EntityRef;
use crate::resolver::{InFlight, JobGraph, Upstream};
use crate::state_machine::{Job, JobId, LockRequest};

/// Whether a pending job may start now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Ready,
    /// Some `wait_for` job has not completed yet.
    Waiting,
    /// Conflicts with the given running or earlier pending job.
    Blocked(JobId),
    /// The given prerequisite errored or was cancelled.
    Doomed(JobId),
}

#[derive(Debug, Default)]
pub struct LockManager {
    held: BTreeMap<JobId, Vec<LockRequest>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the default write lock to every planned job and order each job
    /// after earlier holders of conflicting locks, both in flight and
    /// earlier in the plan.
    pub fn annotate(&self, graph: &mut JobGraph) {
        for index in 0..graph.jobs.len() {
            let job = &mut graph.jobs[index];
            if !job.advertised {
                let default =
                    LockRequest::write(job.entity, &job.from_state, &job.to_state);
                if !job.locks.contains(&default) {
                    job.locks.insert(0, default);
                }
            } else if job.locks.is_empty() {
                job.locks.push(LockRequest::read(job.entity, &job.from_state));
            }

            let mut edges: Vec<Upstream> = Vec::new();
            for (holder, locks) in &self.held {
                if conflicts(locks, &graph.jobs[index].locks) {
                    edges.push(Upstream::Existing(*holder));
                }
            }
            for earlier in 0..index {
                if conflicts(&graph.jobs[earlier].locks, &graph.jobs[index].locks) {
                    edges.push(Upstream::Planned(earlier));
                }
            }

            let job = &mut graph.jobs[index];
            for edge in edges {
                if !job.wait_for.contains(&edge) {
                    trace!(job = %job.description, ?edge, "lock ordering");
                    job.wait_for.push(edge);
                }
            }
        }
    }

    pub fn register(&mut self, job: JobId, locks: Vec<LockRequest>) {
        self.held.insert(job, locks);
    }

    pub fn release(&mut self, job: JobId) {
        self.held.remove(&job);
    }

    /// Decide whether `job` may start.
    ///
    /// `jobs` must contain every job referenced by `wait_for`; `running`
    /// lists the jobs currently executing.
    pub fn can_start(
        &self,
        job: &Job,
        jobs: &BTreeMap<JobId, Job>,
        running: &BTreeSet<JobId>,
    ) -> Admission {
        for prerequisite in &job.wait_for {
            match jobs.get(prerequisite) {
                Some(p) if p.is_complete() && (p.errored || p.cancelled) => {
                    return Admission::Doomed(*prerequisite);
                }
                Some(p) if !p.is_complete() => return Admission::Waiting,
                _ => {}
            }
        }

        for (holder, locks) in &self.held {
            if *holder == job.id {
                continue;
            }
            let earlier_pending = *holder < job.id;
            if (running.contains(holder) || earlier_pending) && conflicts(locks, &job.locks) {
                return Admission::Blocked(*holder);
            }
        }
        Admission::Ready
    }
}

impl InFlight for LockManager {
    fn latest_write(&self, entity: EntityRef) -> Option<(JobId, String)> {
        self.held.iter().rev().find_map(|(id, locks)| {
            locks
                .iter()
                .find(|l| l.write && l.entity == entity)
                .map(|l| (*id, l.end_state.clone()))
        })
    }
}

fn conflicts(a: &[LockRequest], b: &[LockRequest]) -> bool {
    a.iter().any(|x| b.iter().any(|y| x.conflicts_with(y)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::PlannedJob;
    use crate::state_machine::{JobState, StepArgs};
    use chrono::Utc;

    fn planned(entity: EntityRef, from: &str, to: &str) -> PlannedJob {
        PlannedJob {
            name: "test".into(),
            advertised: false,
            entity,
            from_state: from.into(),
            to_state: to.into(),
            args: StepArgs::new(),
            description: format!("{entity} {from}->{to}"),
            steps: Vec::new(),
            locks: Vec::new(),
            wait_for: Vec::new(),
            requires_confirmation: false,
        }
    }

    fn job(id: JobId, entity: EntityRef, wait_for: Vec<JobId>) -> Job {
        let now = Utc::now();
        Job {
            id,
            command_id: 1,
            name: "test".into(),
            advertised: false,
            entity,
            from_state: "unmounted".into(),
            to_state: "mounted".into(),
            args: StepArgs::new(),
            description: format!("job {id}"),
            steps: Vec::new(),
            locks: vec![LockRequest::write(entity, "unmounted", "mounted")],
            wait_for,
            requires_confirmation: false,
            state: JobState::Pending,
            errored: false,
            cancelled: false,
            failure: None,
            planned_generation: 0,
            created_at: now,
            modified_at: now,
        }
    }

    #[test]
    fn annotate_adds_default_lock_and_orders_after_in_flight_writer() {
        let mut locks = LockManager::new();
        locks.register(
            7,
            vec![LockRequest::write(EntityRef::client_mount(1), "mounted", "unmounted")],
        );
        let mut graph = JobGraph {
            jobs: vec![planned(EntityRef::client_mount(1), "unmounted", "mounted")],
            ..Default::default()
        };
        locks.annotate(&mut graph);
        let job = &graph.jobs[0];
        assert_eq!(job.locks.len(), 1);
        assert!(job.locks[0].write);
        assert_eq!(job.wait_for, vec![Upstream::Existing(7)]);
    }

    #[test]
    fn annotate_orders_within_plan() {
        let locks = LockManager::new();
        let mut graph = JobGraph {
            jobs: vec![
                planned(EntityRef::lnet(1), "lnet_unloaded", "lnet_down"),
                planned(EntityRef::host(1), "managed", "managed"),
                planned(EntityRef::lnet(1), "lnet_down", "lnet_up"),
            ],
            ..Default::default()
        };
        locks.annotate(&mut graph);
        assert!(graph.jobs[1].wait_for.is_empty());
        assert_eq!(graph.jobs[2].wait_for, vec![Upstream::Planned(0)]);
    }

    #[test]
    fn latest_write_prefers_newest_job() {
        let mut locks = LockManager::new();
        let e = EntityRef::lnet(2);
        locks.register(3, vec![LockRequest::write(e, "lnet_up", "lnet_down")]);
        locks.register(9, vec![LockRequest::write(e, "lnet_down", "lnet_unloaded")]);
        locks.register(11, vec![LockRequest::read(e, "lnet_unloaded")]);
        assert_eq!(locks.latest_write(e), Some((9, "lnet_unloaded".to_string())));
        locks.release(9);
        assert_eq!(locks.latest_write(e), Some((3, "lnet_down".to_string())));
        assert_eq!(locks.latest_write(EntityRef::lnet(5)), None);
    }

    #[test]
    fn can_start_checks_prerequisites_then_conflicts() {
        let mount = EntityRef::client_mount(1);
        let mut jobs = BTreeMap::new();
        let mut locks = LockManager::new();
        for j in [job(1, mount, vec![]), job(2, mount, vec![1]), job(3, EntityRef::client_mount(2), vec![])] {
            locks.register(j.id, j.locks.clone());
            jobs.insert(j.id, j);
        }
        let running = BTreeSet::from([1]);

        assert_eq!(locks.can_start(&jobs[&2], &jobs, &running), Admission::Waiting);
        assert_eq!(locks.can_start(&jobs[&3], &jobs, &running), Admission::Ready);

        let mut done = jobs[&1].clone();
        done.state = JobState::Complete;
        done.errored = true;
        jobs.insert(1, done);
        assert_eq!(
            locks.can_start(&jobs[&2], &jobs, &BTreeSet::new()),
            Admission::Doomed(1)
        );
    }

    #[test]
    fn earlier_pending_conflict_blocks_later_job() {
        let mount = EntityRef::client_mount(1);
        let mut jobs = BTreeMap::new();
        let mut locks = LockManager::new();
        for j in [job(4, mount, vec![]), job(5, mount, vec![])] {
            locks.register(j.id, j.locks.clone());
            jobs.insert(j.id, j);
        }
        assert_eq!(
            locks.can_start(&jobs[&5], &jobs, &BTreeSet::new()),
            Admission::Blocked(4)
        );
        assert_eq!(locks.can_start(&jobs[&4], &jobs, &BTreeSet::new()), Admission::Ready);
    }
}
