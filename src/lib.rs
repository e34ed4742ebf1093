//! State-driven job scheduler for a clustered Lustre filesystem.
//!
//! Entities (hosts, LNet configurations, targets, filesystems, client mounts
//! and HA tickets) are finite-state objects. A request to move one entity to
//! a new state is resolved into a graph of jobs, ordered by dependencies and
//! locks, and executed against the agents running on the managed hosts.

pub mod agent;
pub mod cache;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod executor;
pub mod fixture;
pub mod locks;
pub mod model;
pub mod orchestrator;
pub mod resolver;
pub mod state_machine;
pub mod store;
pub mod ui;

pub use orchestrator::Scheduler;
