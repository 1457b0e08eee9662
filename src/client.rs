use crate::core::agent::Registration;
use crate::core::info::{CompleteRequest, CompleteResponse, CoreRequest, RequestResponse, Summary};
use crate::core::lifecycle::{ControllerApi, ControllerCallError};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client as ReqwestClient, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// HTTP client for the controller, used by agents and workers.
#[derive(Debug, Clone)]
pub struct ControllerClient {
    client: ReqwestClient,
    base_url: String,
    request_timeout: Duration,
    complete_timeout: Duration,
}

impl ControllerClient {
    pub fn build(base_url: &str) -> anyhow::Result<Self> {
        crate::tls::ensure_rustls_provider_installed();
        let client = ReqwestClient::builder()
            .user_agent(format!("corebroker/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build controller HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(30),
            complete_timeout: Duration::from_secs(10),
        })
    }

    pub fn with_timeouts(mut self, request: Duration, complete: Duration) -> Self {
        self.request_timeout = request;
        self.complete_timeout = complete;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Decode a JSON body. Error statuses still carry a JSON body, so the
    /// body is decoded first and only a non-decodable error becomes
    /// `Rejected`.
    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ControllerCallError> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ControllerCallError::Unreachable(e.to_string()))?;
        match serde_json::from_str(&text) {
            Ok(body) => Ok(body),
            Err(_) if !status.is_success() => Err(ControllerCallError::Rejected {
                status: status.as_u16(),
                message: text,
            }),
            Err(e) => Err(ControllerCallError::Decode(e.to_string())),
        }
    }

    pub async fn register(&self, reg: &Registration) -> Result<(), ControllerCallError> {
        tracing::debug!("Registering {}", reg.vm_name);
        let response = self
            .client
            .post(self.url("/register"))
            .timeout(self.request_timeout)
            .json(reg)
            .send()
            .await
            .map_err(|e| ControllerCallError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body: serde_json::Value = Self::decode(response).await?;
        Err(ControllerCallError::Rejected {
            status: status.as_u16(),
            message: body["message"].as_str().unwrap_or_default().to_string(),
        })
    }
}

#[async_trait]
impl ControllerApi for ControllerClient {
    async fn request(&self, req: &CoreRequest) -> Result<RequestResponse, ControllerCallError> {
        tracing::debug!("Requesting {} cores for {}|{}", req.cores_requested, req.vm, req.job);
        let response = self
            .client
            .post(self.url("/request"))
            .timeout(self.request_timeout)
            .json(req)
            .send()
            .await
            .map_err(|e| ControllerCallError::Unreachable(e.to_string()))?;
        Self::decode(response).await
    }

    async fn summary(&self, live: bool) -> Result<Summary, ControllerCallError> {
        let response = self
            .client
            .get(self.url("/summary"))
            .timeout(self.request_timeout)
            .query(&[("live", live)])
            .send()
            .await
            .map_err(|e| ControllerCallError::Unreachable(e.to_string()))?;
        Self::decode(response).await
    }

    async fn complete(
        &self,
        req: &CompleteRequest,
    ) -> Result<CompleteResponse, ControllerCallError> {
        tracing::debug!("Completing {}|{}", req.vm, req.job);
        let response = self
            .client
            .post(self.url("/complete"))
            .timeout(self.complete_timeout)
            .json(req)
            .send()
            .await
            .map_err(|e| ControllerCallError::Unreachable(e.to_string()))?;
        Self::decode(response).await
    }
}
