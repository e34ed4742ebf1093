//! Fleet agent RPC: the trait the executor calls, an HTTP client and an
//! in-process simulator.

pub mod client;
pub mod error;
pub mod sim;
pub mod types;

use async_trait::async_trait;

pub use client::HttpAgentClient;
pub use error::AgentError;
pub use sim::SimulatedAgent;
pub use types::{AgentRequest, AgentResponse};

/// Invokes operations on the agent running on a managed host.
#[async_trait]
pub trait AgentRpc: Send + Sync {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError>;
}
