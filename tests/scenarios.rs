//! End-to-end scheduling scenarios against the demo cluster and a
//! simulated agent.

use std::sync::Arc;
use std::time::Duration;

use fsjobd::Scheduler;
use fsjobd::agent::SimulatedAgent;
use fsjobd::cache::ObjectCache;
use fsjobd::config::SchedulerConfig;
use fsjobd::error::SchedulerError;
use fsjobd::fixture::demo_cluster;
use fsjobd::model::{
    Catalog, DependOn, Entity, EntityAttrs, EntityKind, EntityRef, EntityType, HostAttrs,
    LnetAttrs, TransitionRule,
};
use fsjobd::resolver::{DependencyResolver, JobGraph, Quiescent, Upstream};
use fsjobd::state_machine::{Job, JobState};
use fsjobd::store::MemoryStore;

fn start(agent: &Arc<SimulatedAgent>, entities: Vec<Entity>, workers: usize) -> Scheduler {
    let config = SchedulerConfig {
        worker_count: workers,
        ..Default::default()
    };
    Scheduler::start(
        Catalog::standard(),
        Arc::new(MemoryStore::with_entities(entities)),
        agent.clone(),
        &config,
    )
    .unwrap()
}

fn names(graph: &JobGraph) -> Vec<(&str, EntityRef)> {
    graph.jobs.iter().map(|j| (j.name.as_str(), j.entity)).collect()
}

fn host(id: u64, state: &str) -> Entity {
    Entity::new(
        EntityRef::host(id),
        format!("node{id}"),
        state,
        EntityAttrs::Host(HostAttrs {
            fqdn: format!("node{id}.local"),
        }),
    )
}

fn lnet(id: u64, state: &str) -> Entity {
    Entity::new(
        EntityRef::lnet(id),
        format!("LNet on node{id}"),
        state,
        EntityAttrs::LnetConfiguration(LnetAttrs {
            host: id,
            nids: Vec::new(),
        }),
    )
}

async fn until_running(scheduler: &Scheduler, job: u64) {
    for _ in 0..200 {
        if scheduler.job(job).unwrap().state == JobState::Running {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {job} never started");
}

async fn until_called(agent: &SimulatedAgent, operation: &str) {
    for _ in 0..200 {
        if agent.calls().iter().any(|c| c.operation == operation) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{operation} never reached the agent");
}

#[tokio::test]
async fn every_available_state_is_reached_after_execution() {
    let survey = start(&Arc::new(SimulatedAgent::new()), demo_cluster(), 4);
    let mut requests = Vec::new();
    for entity in survey.entities() {
        for state in survey.available_states(entity.id).unwrap() {
            requests.push((entity.id, state));
        }
    }
    assert!(requests.len() > 10, "{requests:?}");

    for (entity, state) in requests {
        let agent = Arc::new(SimulatedAgent::new());
        let scheduler = start(&agent, demo_cluster(), 4);
        let command = scheduler.set_state(entity, &state, None, true).unwrap();
        scheduler
            .wait_for_command(command.id)
            .await
            .unwrap_or_else(|e| panic!("{entity} -> {state}: {e}"));
        assert_eq!(scheduler.entity(entity).unwrap().state, state, "{entity}");
    }
}

#[tokio::test]
async fn already_in_state_is_a_no_op() {
    let agent = Arc::new(SimulatedAgent::new());
    let scheduler = start(&agent, demo_cluster(), 4);

    assert!(scheduler.plan(EntityRef::lnet(1), "lnet_up").unwrap().is_empty());
    let command = scheduler
        .set_state(EntityRef::lnet(1), "lnet_up", None, false)
        .unwrap();
    assert!(command.job_ids.is_empty());
    assert!(command.complete && !command.errored);
    assert!(agent.calls().is_empty());
}

#[test]
fn lnet_from_unconfigured_to_up_is_a_three_job_chain() {
    let catalog = Catalog::standard();
    let cache = ObjectCache::from_entities(
        &catalog,
        vec![host(4, "managed"), lnet(4, "unconfigured")],
    )
    .unwrap();
    let graph = DependencyResolver::new(&catalog, &cache, &Quiescent)
        .resolve(EntityRef::lnet(4), "lnet_up")
        .unwrap();

    assert_eq!(
        names(&graph),
        vec![
            ("enable_lnet", EntityRef::lnet(4)),
            ("load_lnet", EntityRef::lnet(4)),
            ("start_lnet", EntityRef::lnet(4)),
        ]
    );
    assert!(graph.jobs[0].wait_for.is_empty());
    assert_eq!(graph.jobs[1].wait_for, vec![Upstream::Planned(0)]);
    assert_eq!(graph.jobs[2].wait_for, vec![Upstream::Planned(1)]);
    let states: Vec<(&str, &str)> = graph
        .jobs
        .iter()
        .map(|j| (j.from_state.as_str(), j.to_state.as_str()))
        .collect();
    assert_eq!(
        states,
        vec![
            ("unconfigured", "lnet_unloaded"),
            ("lnet_unloaded", "lnet_down"),
            ("lnet_down", "lnet_up"),
        ]
    );
}

#[test]
fn lnet_chain_installs_packages_on_an_unconfigured_host_first() {
    let catalog = Catalog::standard();
    let cache = ObjectCache::from_entities(
        &catalog,
        vec![host(4, "unconfigured"), lnet(4, "unconfigured")],
    )
    .unwrap();
    let graph = DependencyResolver::new(&catalog, &cache, &Quiescent)
        .resolve(EntityRef::lnet(4), "lnet_up")
        .unwrap();

    assert_eq!(
        names(&graph),
        vec![
            ("install_packages", EntityRef::host(4)),
            ("enable_lnet", EntityRef::lnet(4)),
            ("load_lnet", EntityRef::lnet(4)),
            ("start_lnet", EntityRef::lnet(4)),
        ]
    );
    assert_eq!(graph.jobs[1].wait_for, vec![Upstream::Planned(0)]);
}

#[test]
fn mutual_dependency_is_a_cycle() {
    let mut catalog = Catalog::new();
    catalog.register_type(EntityType::new(EntityKind::Host));
    catalog.register_type(EntityType::new(EntityKind::LnetConfiguration));
    catalog.register_rule(
        TransitionRule::new(
            EntityKind::LnetConfiguration,
            "enable",
            &["unconfigured"],
            "lnet_unloaded",
            "Enable",
        )
        .deps(|ctx| {
            let host = ctx.entity.lnet().map(|l| l.host).unwrap_or_default();
            Ok(DependOn::on(EntityRef::host(host), "removed").into())
        }),
    );
    catalog.register_rule(
        TransitionRule::new(EntityKind::Host, "retire", &["managed"], "removed", "Retire")
            .deps(|ctx| Ok(DependOn::on(EntityRef::lnet(ctx.entity.id.id), "lnet_unloaded").into())),
    );

    let cache = ObjectCache::from_entities(&catalog, vec![host(1, "managed"), lnet(1, "unconfigured")])
        .unwrap();
    let resolver = DependencyResolver::new(&catalog, &cache, &Quiescent);

    let err = resolver.resolve(EntityRef::lnet(1), "lnet_unloaded").unwrap_err();
    let chain = match err {
        SchedulerError::DependencyCycle { chain } => chain,
        other => panic!("expected a cycle, got {other:?}"),
    };
    assert_eq!(chain.first().map(String::as_str), Some("lnet_configuration:1=lnet_unloaded"));
    assert!(chain.iter().any(|c| c == "host:1=removed"));
}

#[tokio::test]
async fn removing_a_filesystem_unmounts_its_mgs_first() {
    let agent = Arc::new(SimulatedAgent::new());
    let scheduler = start(&agent, demo_cluster(), 4);

    let graph = scheduler.plan(EntityRef::filesystem(1), "removed").unwrap();
    let position = |name: &str, entity: EntityRef| {
        graph
            .jobs
            .iter()
            .position(|j| j.name == name && j.entity == entity)
            .unwrap_or_else(|| panic!("no {name} for {entity}"))
    };
    let stop_mgs = position("stop_target", EntityRef::target(1));
    let remove = position("remove_filesystem", EntityRef::filesystem(1));
    assert!(stop_mgs < remove);
    assert_eq!(graph.jobs[stop_mgs].from_state, "mounted");
    assert_eq!(graph.jobs[stop_mgs].to_state, "unmounted");
    assert!(graph.jobs[remove].wait_for.contains(&Upstream::Planned(stop_mgs)));
    assert_eq!(remove, graph.jobs.len() - 1);

    let command = scheduler
        .set_state(EntityRef::filesystem(1), "removed", None, true)
        .unwrap();
    scheduler.wait_for_command(command.id).await.unwrap();

    let fs = scheduler.entity(EntityRef::filesystem(1)).unwrap();
    assert_eq!(fs.state, "removed");
    assert!(!fs.not_deleted);
    assert_eq!(scheduler.entity(EntityRef::target(1)).unwrap().state, "unmounted");
    for ost_or_mdt in [EntityRef::target(2), EntityRef::target(3)] {
        assert_eq!(scheduler.entity(ost_or_mdt).unwrap().state, "removed");
    }
    assert!(agent.operations().contains(&"mds1.local:purge_configuration".to_string()));
}

#[tokio::test]
async fn two_commands_on_one_mount_run_in_creation_order() {
    let agent = Arc::new(SimulatedAgent::new());
    agent.hold("unmount_lustre_filesystems");
    let scheduler = start(&agent, demo_cluster(), 4);

    let first = scheduler
        .set_state(EntityRef::client_mount(1), "unmounted", None, true)
        .unwrap();
    let second = scheduler
        .set_state(EntityRef::client_mount(1), "mounted", None, true)
        .unwrap();
    let (unmount, mount) = (first.job_ids[0], second.job_ids[0]);
    assert!(mount > unmount);
    assert!(scheduler.job(mount).unwrap().wait_for.contains(&unmount));

    until_running(&scheduler, unmount).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(scheduler.job(mount).unwrap().state, JobState::Pending);

    agent.release("unmount_lustre_filesystems");
    scheduler.wait_for_command(first.id).await.unwrap();
    scheduler.wait_for_command(second.id).await.unwrap();

    assert_eq!(
        agent.operations(),
        vec![
            "client1.local:unmount_lustre_filesystems",
            "client1.local:mount_lustre_filesystems",
        ]
    );
    assert_eq!(
        scheduler.entity(EntityRef::client_mount(1)).unwrap().state,
        "mounted"
    );
}

#[tokio::test]
async fn cancelling_a_command_cancels_its_pending_chain() {
    let agent = Arc::new(SimulatedAgent::new());
    agent.hold("unmount_target");
    // One worker: the held job keeps everything else pending.
    let scheduler = start(&agent, demo_cluster(), 1);

    let blocker = scheduler
        .set_state(EntityRef::target(3), "unmounted", None, true)
        .unwrap();
    until_running(&scheduler, blocker.job_ids[0]).await;

    let command = scheduler
        .set_state(EntityRef::lnet(3), "lnet_down", None, true)
        .unwrap();
    let jobs = scheduler.jobs_of(command.id).unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs[1].wait_for.contains(&jobs[0].id));

    let cancelled = scheduler.cancel_command(command.id, true).unwrap();
    assert!(cancelled.cancelled && cancelled.complete && !cancelled.errored);
    for job in scheduler.jobs_of(command.id).unwrap() {
        assert!(job.cancelled, "{}", job.description);
    }

    agent.release("unmount_target");
    scheduler.wait_for_command(blocker.id).await.unwrap();
    assert!(!agent.operations().iter().any(|op| op.ends_with("unmount_lustre_filesystems")));
}

#[tokio::test]
async fn cancellation_errors_commands_depending_on_the_cancelled_job() {
    let agent = Arc::new(SimulatedAgent::new());
    agent.hold("unmount_target");
    let scheduler = start(&agent, demo_cluster(), 1);

    let blocker = scheduler
        .set_state(EntityRef::target(3), "unmounted", None, true)
        .unwrap();
    until_running(&scheduler, blocker.job_ids[0]).await;

    let unmount = scheduler
        .set_state(EntityRef::client_mount(1), "unmounted", None, true)
        .unwrap();
    let stop = scheduler
        .set_state(EntityRef::lnet(3), "lnet_down", None, true)
        .unwrap();
    let stop_job = scheduler.jobs_of(stop.id).unwrap()[0].id;
    assert!(scheduler.job(stop_job).unwrap().wait_for.contains(&unmount.job_ids[0]));

    scheduler.cancel_command(unmount.id, true).unwrap();
    agent.release("unmount_target");

    let err = scheduler.wait_for_command(stop.id).await.unwrap_err();
    assert!(matches!(err, SchedulerError::AbnormalCompletion { .. }));
    let stopped: Job = scheduler.job(stop_job).unwrap();
    assert!(stopped.cancelled);
    assert!(scheduler.command(unmount.id).unwrap().cancelled);
    assert_eq!(scheduler.entity(EntityRef::lnet(3)).unwrap().state, "lnet_up");
}

/// Small deterministic generator so failures can be replayed by seed.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: usize) -> usize {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) as usize) % bound
    }
}

fn conflicting_running_jobs(scheduler: &Scheduler) -> Option<(u64, u64)> {
    let running: Vec<Job> = scheduler
        .commands()
        .iter()
        .flat_map(|c| scheduler.jobs_of(c.id).unwrap())
        .filter(|j| j.state == JobState::Running)
        .collect();
    for (i, a) in running.iter().enumerate() {
        for b in &running[i + 1..] {
            if a.id != b.id
                && a.locks.iter().any(|x| b.locks.iter().any(|y| x.conflicts_with(y)))
            {
                return Some((a.id, b.id));
            }
        }
    }
    None
}

#[tokio::test]
async fn running_jobs_never_hold_conflicting_locks() {
    let requests = [
        (EntityRef::client_mount(1), "unmounted"),
        (EntityRef::client_mount(1), "mounted"),
        (EntityRef::lnet(3), "lnet_down"),
        (EntityRef::lnet(3), "lnet_up"),
        (EntityRef::target(3), "unmounted"),
        (EntityRef::target(3), "mounted"),
        (EntityRef::lnet(2), "lnet_down"),
        (EntityRef::lnet(2), "lnet_up"),
    ];

    for seed in 1..=6u64 {
        let mut rng = Lcg(seed);
        let agent = Arc::new(SimulatedAgent::new().with_latency(Duration::from_millis(3)));
        let scheduler = start(&agent, demo_cluster(), 1 + rng.next(4));

        let mut commands = Vec::new();
        for _ in 0..10 {
            let (entity, state) = requests[rng.next(requests.len())];
            if let Ok(command) = scheduler.set_state(entity, state, None, true) {
                commands.push(command.id);
            }
            if rng.next(2) == 0 {
                tokio::time::sleep(Duration::from_millis(rng.next(5) as u64)).await;
            }
            assert_eq!(conflicting_running_jobs(&scheduler), None, "seed {seed}");
        }

        let idle = scheduler.wait_idle();
        tokio::pin!(idle);
        loop {
            tokio::select! {
                _ = &mut idle => break,
                _ = tokio::time::sleep(Duration::from_millis(1)) => {
                    assert_eq!(conflicting_running_jobs(&scheduler), None, "seed {seed}");
                }
            }
        }
        for id in commands {
            assert!(scheduler.command(id).unwrap().complete, "seed {seed}");
        }
    }
}

#[tokio::test]
async fn dependent_moved_by_another_command_is_waited_on() {
    let agent = Arc::new(SimulatedAgent::new());
    agent.hold("unmount_lustre_filesystems");
    let scheduler = start(&agent, demo_cluster(), 4);

    let unmount = scheduler
        .set_state(EntityRef::client_mount(1), "unmounted", None, true)
        .unwrap();
    let unmount_job = unmount.job_ids[0];
    until_running(&scheduler, unmount_job).await;

    let stop = scheduler
        .set_state(EntityRef::lnet(3), "lnet_down", None, true)
        .unwrap();
    let stop_job = scheduler
        .jobs_of(stop.id)
        .unwrap()
        .into_iter()
        .find(|j| j.name == "stop_lnet")
        .unwrap();
    assert!(stop_job.wait_for.contains(&unmount_job), "{:?}", stop_job.wait_for);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(scheduler.job(stop_job.id).unwrap().state, JobState::Pending);
    assert!(!agent.operations().iter().any(|op| op.ends_with(":stop_lnet")));

    agent.release("unmount_lustre_filesystems");
    scheduler.wait_for_command(unmount.id).await.unwrap();
    scheduler.wait_for_command(stop.id).await.unwrap();

    let ops = agent.operations();
    let position = |op: &str| ops.iter().position(|o| o == op).unwrap();
    assert!(
        position("client1.local:unmount_lustre_filesystems")
            < position("client1.local:stop_lnet")
    );
    assert_eq!(scheduler.entity(EntityRef::lnet(3)).unwrap().state, "lnet_down");
}

#[tokio::test]
async fn job_finishing_after_cancel_does_not_unblock_other_commands() {
    let agent = Arc::new(SimulatedAgent::new());
    agent.hold("unmount_lustre_filesystems");
    let scheduler = start(&agent, demo_cluster(), 4);

    let unmount = scheduler
        .set_state(EntityRef::client_mount(1), "unmounted", None, true)
        .unwrap();
    let unmount_job = unmount.job_ids[0];
    until_called(&agent, "unmount_lustre_filesystems").await;

    let mount = scheduler
        .set_state(EntityRef::client_mount(1), "mounted", None, true)
        .unwrap();
    let mount_job = mount.job_ids[0];
    assert!(scheduler.job(mount_job).unwrap().wait_for.contains(&unmount_job));

    scheduler.cancel_command(unmount.id, true).unwrap();
    agent.release("unmount_lustre_filesystems");

    let cancelled = scheduler.wait_for_command(unmount.id).await.unwrap();
    assert!(cancelled.cancelled && !cancelled.errored);
    let err = scheduler.wait_for_command(mount.id).await.unwrap_err();
    assert!(matches!(err, SchedulerError::AbnormalCompletion { .. }));

    assert!(scheduler.job(unmount_job).unwrap().cancelled);
    assert!(scheduler.job(mount_job).unwrap().cancelled);
    // The unmount reached the agent, so its effect is kept.
    assert_eq!(
        scheduler.entity(EntityRef::client_mount(1)).unwrap().state,
        "unmounted"
    );
    assert_eq!(agent.operations(), vec!["client1.local:unmount_lustre_filesystems"]);
}
