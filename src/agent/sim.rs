use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::debug;

use super::error::AgentError;
use super::types::{AgentRequest, AgentResponse};
use super::AgentRpc;

/// In-process agent for the demo command and tests.
///
/// Every operation succeeds after `latency` unless told otherwise. Calls are
/// recorded in arrival order.
#[derive(Default)]
pub struct SimulatedAgent {
    latency: Duration,
    calls: Mutex<Vec<AgentRequest>>,
    failures: Mutex<HashMap<String, String>>,
    results: Mutex<HashMap<String, Value>>,
    holds: Mutex<HashMap<String, Arc<Notify>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make every call to `operation` fail with `message`.
    pub fn fail(&self, operation: &str, message: &str) {
        lock(&self.failures).insert(operation.to_string(), message.to_string());
    }

    pub fn succeed(&self, operation: &str) {
        lock(&self.failures).remove(operation);
    }

    /// Value returned as the result of `operation`.
    pub fn respond(&self, operation: &str, result: Value) {
        lock(&self.results).insert(operation.to_string(), result);
    }

    /// Calls to `operation` block until [`SimulatedAgent::release`].
    pub fn hold(&self, operation: &str) {
        lock(&self.holds).insert(operation.to_string(), Arc::new(Notify::new()));
    }

    pub fn release(&self, operation: &str) {
        if let Some(gate) = lock(&self.holds).remove(operation) {
            gate.notify_waiters();
            gate.notify_one();
        }
    }

    pub fn calls(&self) -> Vec<AgentRequest> {
        lock(&self.calls).clone()
    }

    /// `host:operation` for every call so far.
    pub fn operations(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .map(|c| format!("{}:{}", c.host, c.operation))
            .collect()
    }
}

#[async_trait]
impl AgentRpc for SimulatedAgent {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        debug!(host = %request.host, operation = %request.operation, "simulated call");
        lock(&self.calls).push(request.clone());

        let gate = lock(&self.holds).get(&request.operation).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let failure = lock(&self.failures).get(&request.operation).cloned();
        if let Some(message) = failure {
            return Err(AgentError::Remote {
                host: request.host.clone(),
                operation: request.operation.clone(),
                status: 500,
                message,
                console: format!("{} on {}", request.operation, request.host),
                backtrace: format!("simulated failure in {}", request.operation),
            });
        }

        Ok(AgentResponse {
            result: lock(&self.results).get(&request.operation).cloned(),
            console: format!("{} ok", request.operation),
        })
    }
}
