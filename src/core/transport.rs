//! Controller-side calls into agents.

use super::agent::{AffinityResponse, Agent, AgentStatus, AllocateRequest, ReleaseRequest};
use super::CoreIndex;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentCallError {
    #[error("agent {agent} unreachable: {message}")]
    Unreachable { agent: String, message: String },

    #[error("agent {agent} rejected the call ({status}): {message}")]
    Rejected {
        agent: String,
        status: u16,
        message: String,
    },

    #[error("agent {agent} sent an invalid response: {message}")]
    Decode { agent: String, message: String },
}

#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn status(&self, agent: &Agent) -> Result<AgentStatus, AgentCallError>;

    /// Bind `req.pid` to `req.cores`; returns the cores actually bound.
    async fn allocate(
        &self,
        agent: &Agent,
        req: &AllocateRequest,
    ) -> Result<Vec<CoreIndex>, AgentCallError>;

    /// Narrow a job to `req.keep_cores`, or clear it when empty.
    async fn release(
        &self,
        agent: &Agent,
        req: &ReleaseRequest,
    ) -> Result<Vec<CoreIndex>, AgentCallError>;
}

/// JSON-over-HTTP transport with a per-call timeout.
#[derive(Debug, Clone)]
pub struct HttpAgentTransport {
    client: reqwest::Client,
}

impl HttpAgentTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        use anyhow::Context;

        crate::tls::ensure_rustls_provider_installed();
        let client = reqwest::Client::builder()
            .user_agent(format!("corebroker/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("Failed to build agent HTTP client")?;
        Ok(Self { client })
    }

    async fn affinity_call<B: serde::Serialize + Sync>(
        &self,
        agent: &Agent,
        path: &str,
        body: &B,
    ) -> Result<Vec<CoreIndex>, AgentCallError> {
        let response = self
            .client
            .post(agent.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| unreachable(agent, e))?;

        let status = response.status();
        let body: AffinityResponse = response.json().await.map_err(|e| decode(agent, e))?;
        if !status.is_success() || !body.ok {
            return Err(AgentCallError::Rejected {
                agent: agent.name.clone(),
                status: status.as_u16(),
                message: body.error.unwrap_or_else(|| status.to_string()),
            });
        }
        Ok(body.cores)
    }
}

fn unreachable(agent: &Agent, e: reqwest::Error) -> AgentCallError {
    AgentCallError::Unreachable {
        agent: agent.name.clone(),
        message: e.to_string(),
    }
}

fn decode(agent: &Agent, e: reqwest::Error) -> AgentCallError {
    AgentCallError::Decode {
        agent: agent.name.clone(),
        message: e.to_string(),
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn status(&self, agent: &Agent) -> Result<AgentStatus, AgentCallError> {
        let response = self
            .client
            .get(agent.url("/status"))
            .send()
            .await
            .map_err(|e| unreachable(agent, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentCallError::Rejected {
                agent: agent.name.clone(),
                status: status.as_u16(),
                message: status.to_string(),
            });
        }
        response.json().await.map_err(|e| decode(agent, e))
    }

    async fn allocate(
        &self,
        agent: &Agent,
        req: &AllocateRequest,
    ) -> Result<Vec<CoreIndex>, AgentCallError> {
        self.affinity_call(agent, "/allocate", req).await
    }

    async fn release(
        &self,
        agent: &Agent,
        req: &ReleaseRequest,
    ) -> Result<Vec<CoreIndex>, AgentCallError> {
        self.affinity_call(agent, "/release", req).await
    }
}
