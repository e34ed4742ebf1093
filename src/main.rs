use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fsjobd::Scheduler;
use fsjobd::agent::{AgentRpc, HttpAgentClient, SimulatedAgent};
use fsjobd::cli::{Cli, Command};
use fsjobd::commands::Command as SchedulerCommand;
use fsjobd::config::SchedulerConfig;
use fsjobd::fixture::ClusterFixture;
use fsjobd::model::{Catalog, EntityRef};
use fsjobd::state_machine::{JobReport, StepArgs};
use fsjobd::store::{JsonFileStore, MemoryStore, Store};
use fsjobd::ui::{self, CommandProgress};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = SchedulerConfig::load(cli.config.as_deref())?;
    if let Some(workers) = cli.workers {
        config.worker_count = workers;
    }
    if let Some(ms) = cli.step_timeout_ms {
        config.step_timeout_ms = ms;
    }

    let default_filter = if cli.verbose { "debug" } else { config.log_filter.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let fixture = match &cli.cluster {
        Some(path) => ClusterFixture::load(path)?,
        None => ClusterFixture::demo(),
    };
    let store: Arc<dyn Store> = match &config.store_path {
        Some(path) => Arc::new(JsonFileStore::open_seeded(path, fixture.entities)?),
        None => Arc::new(MemoryStore::with_entities(fixture.entities)),
    };

    let demo = matches!(cli.command, Command::Demo);
    let agent: Arc<dyn AgentRpc> = match &config.agent_url {
        Some(url) if !demo => Arc::new(HttpAgentClient::new(url.as_str())?),
        _ => Arc::new(SimulatedAgent::new().with_latency(Duration::from_millis(150))),
    };

    let scheduler = Scheduler::start(Catalog::standard(), store, agent, &config)?;
    info!(workers = config.worker_count, "scheduler ready");

    match cli.command {
        Command::Plan { entity, state } => {
            let graph = scheduler.plan(parse_entity(&entity)?, &state)?;
            ui::print_plan(&graph);
        }
        Command::Run { entity, state, message } => {
            let command = scheduler.set_state(parse_entity(&entity)?, &state, message, cli.yes)?;
            follow(&scheduler, command).await?;
        }
        Command::Job { name, entity, args } => {
            let args: StepArgs =
                serde_json::from_str(&args).context("--args must be a JSON object")?;
            let command = scheduler.run_job(&name, parse_entity(&entity)?, args, cli.yes)?;
            follow(&scheduler, command).await?;
        }
        Command::States { entity } => {
            let entity = parse_entity(&entity)?;
            for state in scheduler.available_states(entity)? {
                println!("{state}");
            }
        }
        Command::Entities => ui::print_entities(&scheduler.entities()),
        Command::Demo => run_demo(&scheduler).await?,
    }

    Ok(())
}

fn parse_entity(text: &str) -> Result<EntityRef> {
    text.parse::<EntityRef>().map_err(anyhow::Error::msg)
}

/// Wait for a command, printing each job as it finishes.
async fn follow(scheduler: &Scheduler, command: SchedulerCommand) -> Result<SchedulerCommand> {
    let progress = CommandProgress::start(&command);
    let result = scheduler.wait_for_command(command.id).await;

    for job in scheduler.jobs_of(command.id)? {
        let results = scheduler.step_results(job.id)?;
        progress.job_finished(&JobReport::from_job(&job, &results));
    }
    let finished = scheduler.command(command.id)?;
    progress.complete(&finished);
    Ok(result?)
}

async fn run_demo(scheduler: &Scheduler) -> Result<()> {
    println!("Cluster:");
    ui::print_entities(&scheduler.entities());

    let lnet = EntityRef::lnet(3);
    println!("\nPlan to take LNet down on client1:");
    ui::print_plan(&scheduler.plan(lnet, "lnet_down")?);

    println!();
    let command = scheduler.set_state(lnet, "lnet_down", None, true)?;
    follow(scheduler, command).await?;

    let mount = EntityRef::client_mount(1);
    println!("\nPlan to mount testfs on client1 again:");
    ui::print_plan(&scheduler.plan(mount, "mounted")?);

    println!();
    let command = scheduler.set_state(mount, "mounted", None, true)?;
    follow(scheduler, command).await?;

    println!("\nCluster:");
    ui::print_entities(&scheduler.entities());
    Ok(())
}
