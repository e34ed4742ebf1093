//! Commands: the user-facing unit of work. A command owns the jobs its
//! request created and may also track in-flight jobs it shares with
//! earlier commands.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::{CommandId, Job, JobId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    /// Stable identifier for correlating logs across processes.
    pub correlation_id: Uuid,
    pub message: String,
    pub job_ids: Vec<JobId>,
    pub complete: bool,
    pub errored: bool,
    pub cancelled: bool,
    pub dismissed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct CommandTracker {
    commands: BTreeMap<CommandId, Command>,
    next_id: CommandId,
}

impl CommandTracker {
    pub fn new() -> Self {
        Self {
            commands: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn from_commands(commands: impl IntoIterator<Item = Command>) -> Self {
        let mut tracker = Self::new();
        for command in commands {
            tracker.next_id = tracker.next_id.max(command.id + 1);
            tracker.commands.insert(command.id, command);
        }
        tracker
    }

    /// The id the next [`CommandTracker::create`] will use.
    pub fn peek_id(&self) -> CommandId {
        self.next_id
    }

    pub fn create(&mut self, message: impl Into<String>, job_ids: Vec<JobId>) -> Command {
        let command = Command {
            id: self.next_id,
            correlation_id: Uuid::new_v4(),
            message: message.into(),
            complete: job_ids.is_empty(),
            job_ids,
            errored: false,
            cancelled: false,
            dismissed: false,
            created_at: Utc::now(),
        };
        self.next_id += 1;
        self.commands.insert(command.id, command.clone());
        command
    }

    pub fn get(&self, id: CommandId) -> Option<&Command> {
        self.commands.get(&id)
    }

    pub fn all(&self) -> impl Iterator<Item = &Command> {
        self.commands.values()
    }

    /// Recompute a command's flags from its jobs. `errored` and `cancelled`
    /// never clear once set. A job cancelled by anything other than this
    /// command's own cancellation counts as an error.
    ///
    /// Returns the command when any flag changed.
    pub fn refresh(&mut self, id: CommandId, jobs: &BTreeMap<JobId, Job>) -> Option<Command> {
        let command = self.commands.get_mut(&id)?;
        let before = (command.complete, command.errored);

        let mut complete = true;
        for job_id in &command.job_ids {
            match jobs.get(job_id) {
                Some(job) => {
                    complete &= job.is_complete();
                    if job.errored || (job.cancelled && !command.cancelled) {
                        command.errored = true;
                    }
                }
                None => complete = false,
            }
        }
        command.complete = complete;

        ((command.complete, command.errored) != before).then(|| command.clone())
    }

    pub fn mark_cancelled(&mut self, id: CommandId) -> Option<Command> {
        let command = self.commands.get_mut(&id)?;
        command.cancelled = true;
        Some(command.clone())
    }

    pub fn dismiss(&mut self, id: CommandId) -> Option<Command> {
        let command = self.commands.get_mut(&id)?;
        command.dismissed = true;
        Some(command.clone())
    }

    /// The first errored job of a command, for reporting.
    pub fn first_failure<'a>(
        &self,
        id: CommandId,
        jobs: &'a BTreeMap<JobId, Job>,
    ) -> Option<&'a Job> {
        let command = self.commands.get(&id)?;
        let members = move || command.job_ids.iter().filter_map(move |j| jobs.get(j));
        members()
            .find(|j| j.errored)
            .or_else(|| members().find(|j| j.cancelled))
    }
}
