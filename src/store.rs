//! Durable record of entities, commands, jobs and step results.
//!
//! The scheduler is the only writer. Completion of a job and the entity
//! updates it causes are written with a single [`Store::commit_job`] call so
//! that a crash never leaves a completed job without its state change.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::commands::Command;
use crate::error::StoreError;
use crate::model::{Entity, EntityRef};
use crate::state_machine::{CommandId, Job, JobId, StepResult};

/// Everything the store holds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub commands: Vec<Command>,
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
}

pub trait Store: Send + Sync {
    fn load(&self) -> Result<Snapshot, StoreError>;

    fn entity(&self, id: EntityRef) -> Result<Option<Entity>, StoreError>;

    fn save_command(&self, command: &Command) -> Result<(), StoreError>;

    fn save_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Insert or update a step result. A result that is already final
    /// cannot be overwritten.
    fn save_step_result(&self, result: &StepResult) -> Result<(), StoreError>;

    fn step_results(&self, job: JobId) -> Result<Vec<StepResult>, StoreError>;

    /// Record a completed job together with the entity updates it caused.
    fn commit_job(&self, job: &Job, entities: &[Entity]) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    entities: BTreeMap<EntityRef, Entity>,
    commands: BTreeMap<CommandId, Command>,
    jobs: BTreeMap<JobId, Job>,
    step_results: BTreeMap<(JobId, usize), StepResult>,
}

impl Tables {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            entities: snapshot.entities.into_iter().map(|e| (e.id, e)).collect(),
            commands: snapshot.commands.into_iter().map(|c| (c.id, c)).collect(),
            jobs: snapshot.jobs.into_iter().map(|j| (j.id, j)).collect(),
            step_results: snapshot
                .step_results
                .into_iter()
                .map(|r| ((r.job_id, r.step_index), r))
                .collect(),
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            entities: self.entities.values().cloned().collect(),
            commands: self.commands.values().cloned().collect(),
            jobs: self.jobs.values().cloned().collect(),
            step_results: self.step_results.values().cloned().collect(),
        }
    }

    fn put_step_result(&mut self, result: &StepResult) -> Result<(), StoreError> {
        let key = (result.job_id, result.step_index);
        if self.step_results.get(&key).is_some_and(|r| r.is_final()) {
            return Err(StoreError::Finalized {
                job_id: result.job_id,
                step_index: result.step_index,
            });
        }
        self.step_results.insert(key, result.clone());
        Ok(())
    }

    fn results_of(&self, job: JobId) -> Vec<StepResult> {
        self.step_results
            .range((job, 0)..(job + 1, 0))
            .map(|(_, r)| r.clone())
            .collect()
    }

    fn commit(&mut self, job: &Job, entities: &[Entity]) {
        for entity in entities {
            self.entities.insert(entity.id, entity.clone());
        }
        self.jobs.insert(job.id, job.clone());
    }
}

fn guard(tables: &Mutex<Tables>) -> Result<MutexGuard<'_, Tables>, StoreError> {
    tables.lock().map_err(|_| StoreError::Poisoned)
}

/// Volatile store for tests and the demo.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            tables: Mutex::new(Tables::from_snapshot(snapshot)),
        }
    }

    pub fn with_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        Self::with_snapshot(Snapshot {
            entities: entities.into_iter().collect(),
            ..Default::default()
        })
    }
}

impl Store for MemoryStore {
    fn load(&self) -> Result<Snapshot, StoreError> {
        Ok(guard(&self.tables)?.snapshot())
    }

    fn entity(&self, id: EntityRef) -> Result<Option<Entity>, StoreError> {
        Ok(guard(&self.tables)?.entities.get(&id).cloned())
    }

    fn save_command(&self, command: &Command) -> Result<(), StoreError> {
        guard(&self.tables)?
            .commands
            .insert(command.id, command.clone());
        Ok(())
    }

    fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        guard(&self.tables)?.jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn save_step_result(&self, result: &StepResult) -> Result<(), StoreError> {
        guard(&self.tables)?.put_step_result(result)
    }

    fn step_results(&self, job: JobId) -> Result<Vec<StepResult>, StoreError> {
        Ok(guard(&self.tables)?.results_of(job))
    }

    fn commit_job(&self, job: &Job, entities: &[Entity]) -> Result<(), StoreError> {
        guard(&self.tables)?.commit(job, entities);
        Ok(())
    }
}

/// Keeps the whole snapshot in one JSON file. Every mutation rewrites the
/// file through a temporary file in the same directory and an atomic
/// rename.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    tables: Mutex<Tables>,
}

impl JsonFileStore {
    /// Open `path`, starting empty when it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let snapshot = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            Snapshot::default()
        };
        debug!(path = %path.display(), entities = snapshot.entities.len(), "store opened");
        Ok(Self {
            path,
            tables: Mutex::new(Tables::from_snapshot(snapshot)),
        })
    }

    /// Open `path` and seed it with `entities` when it holds none yet.
    pub fn open_seeded(
        path: impl Into<PathBuf>,
        entities: impl IntoIterator<Item = Entity>,
    ) -> Result<Self, StoreError> {
        let store = Self::open(path)?;
        {
            let mut tables = guard(&store.tables)?;
            if tables.entities.is_empty() {
                for entity in entities {
                    tables.entities.insert(entity.id, entity);
                }
                store.flush(&tables)?;
            }
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, tables: &Tables) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, &tables.snapshot())?;
        tmp.flush()?;
        tmp.persist(&self.path)?;
        Ok(())
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut tables = guard(&self.tables)?;
        let out = f(&mut tables)?;
        self.flush(&tables)?;
        Ok(out)
    }
}

impl Store for JsonFileStore {
    fn load(&self) -> Result<Snapshot, StoreError> {
        Ok(guard(&self.tables)?.snapshot())
    }

    fn entity(&self, id: EntityRef) -> Result<Option<Entity>, StoreError> {
        Ok(guard(&self.tables)?.entities.get(&id).cloned())
    }

    fn save_command(&self, command: &Command) -> Result<(), StoreError> {
        self.mutate(|t| {
            t.commands.insert(command.id, command.clone());
            Ok(())
        })
    }

    fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.mutate(|t| {
            t.jobs.insert(job.id, job.clone());
            Ok(())
        })
    }

    fn save_step_result(&self, result: &StepResult) -> Result<(), StoreError> {
        self.mutate(|t| t.put_step_result(result))
    }

    fn step_results(&self, job: JobId) -> Result<Vec<StepResult>, StoreError> {
        Ok(guard(&self.tables)?.results_of(job))
    }

    fn commit_job(&self, job: &Job, entities: &[Entity]) -> Result<(), StoreError> {
        self.mutate(|t| {
            t.commit(job, entities);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::demo_cluster;
    use crate::state_machine::{JobState, Step};
    use chrono::Utc;

    fn step_result(job: JobId, index: usize) -> StepResult {
        StepResult::begin(job, index, &Step::new("load_lnet", "mds1"))
    }

    fn remove_host_job(id: JobId) -> Job {
        let now = Utc::now();
        Job {
            id,
            command_id: 1,
            name: "remove_host".into(),
            advertised: false,
            entity: EntityRef::host(1),
            from_state: "managed".into(),
            to_state: "removed".into(),
            args: Default::default(),
            description: "Remove mds1".into(),
            steps: Vec::new(),
            locks: Vec::new(),
            wait_for: Vec::new(),
            requires_confirmation: false,
            state: JobState::Complete,
            errored: false,
            cancelled: false,
            failure: None,
            planned_generation: 0,
            created_at: now,
            modified_at: now,
        }
    }

    #[test]
    fn finalized_step_result_cannot_be_rewritten() {
        let store = MemoryStore::new();
        let started = step_result(1, 0);
        store.save_step_result(&started).unwrap();
        let done = started.clone().succeed(None, "ok".into());
        store.save_step_result(&done).unwrap();
        assert!(matches!(
            store.save_step_result(&started),
            Err(StoreError::Finalized { job_id: 1, step_index: 0 })
        ));
    }

    #[test]
    fn step_results_are_per_job_in_step_order() {
        let store = MemoryStore::new();
        for (job, index) in [(2, 1), (1, 0), (2, 0), (3, 0)] {
            store.save_step_result(&step_result(job, index)).unwrap();
        }
        let results = store.step_results(2).unwrap();
        let indices: Vec<usize> = results.iter().map(|r| r.step_index).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = JsonFileStore::open_seeded(&path, demo_cluster()).unwrap();
        let mut host = store.entity(EntityRef::host(1)).unwrap().unwrap();
        host.set_state("removed");
        host.mark_deleted();
        store.commit_job(&remove_host_job(9), &[host]).unwrap();
        store.save_step_result(&step_result(9, 0)).unwrap();
        drop(store);

        let reopened = JsonFileStore::open_seeded(&path, Vec::new()).unwrap();
        let host = reopened.entity(EntityRef::host(1)).unwrap().unwrap();
        assert_eq!(host.state, "removed");
        assert!(!host.not_deleted);
        assert_eq!(reopened.step_results(9).unwrap().len(), 1);
        let jobs = reopened.load().unwrap().jobs;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state, JobState::Complete);
        assert_eq!(
            reopened.load().unwrap().entities.len(),
            demo_cluster().len()
        );
    }

    #[test]
    fn missing_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("absent.json")).unwrap();
        assert!(store.load().unwrap().entities.is_empty());
        assert!(!store.path().exists());
    }
}
