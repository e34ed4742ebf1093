use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::error::AgentError;
use super::types::{AgentFault, AgentRequest, AgentResponse};
use super::AgentRpc;
use crate::state_machine::StepArgs;

/// Posts operations to `{base_url}/agents/{host}/{operation}`.
pub struct HttpAgentClient {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct InvokeBody<'a> {
    args: &'a StepArgs,
    #[serde(skip_serializing_if = "Option::is_none")]
    local_state: Option<&'a Value>,
}

impl HttpAgentClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, AgentError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, request: &AgentRequest) -> String {
        format!(
            "{}/agents/{}/{}",
            self.base_url, request.host, request.operation
        )
    }
}

#[async_trait]
impl AgentRpc for HttpAgentClient {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        let url = self.url(request);
        debug!(%url, "invoking agent");
        let response = self
            .client
            .post(&url)
            .json(&InvokeBody {
                args: &request.args,
                local_state: request.local_state.as_ref(),
            })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let fault = serde_json::from_str::<AgentFault>(&body).unwrap_or_else(|_| AgentFault {
                message: if body.is_empty() {
                    status.to_string()
                } else {
                    body.clone()
                },
                ..Default::default()
            });
            return Err(AgentError::Remote {
                host: request.host.clone(),
                operation: request.operation.clone(),
                status: status.as_u16(),
                message: fault.message,
                console: fault.console,
                backtrace: fault.backtrace,
            });
        }

        if body.trim().is_empty() {
            return Ok(AgentResponse::default());
        }
        serde_json::from_str(&body).map_err(|e| AgentError::Decode(e.to_string()))
    }
}
