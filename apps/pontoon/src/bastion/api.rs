use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use super::{BastionPhase, BastionSpec, BastionStatus};

#[derive(Error, Debug)]
pub enum BastionApiError {
    #[error("invalid broker configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("broker rejected request: {0}")]
    Broker(String),
}

/// Broker operations a session needs, keyed by bastion name. Split out so
/// tests can script broker behavior without a server.
#[async_trait]
pub trait BastionApi: Send + Sync {
    async fn create(&self, spec: &BastionSpec) -> Result<(), BastionApiError>;
    async fn status(&self, name: &str) -> Result<BastionStatus, BastionApiError>;
    async fn keep_alive(&self, name: &str) -> Result<(), BastionApiError>;
    async fn delete(&self, name: &str) -> Result<(), BastionApiError>;
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    base_url: Url,
    bearer_token: Option<String>,
}

impl BrokerConfig {
    pub fn new(base_url: &str, bearer_token: Option<String>) -> Result<Self, BastionApiError> {
        let mut base_url: Url = base_url.parse().map_err(|err| {
            BastionApiError::InvalidConfig(format!("invalid broker URL {base_url:?}: {err}"))
        })?;
        // Url::join treats a path without a trailing slash as a file and
        // would drop its last segment.
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }
        Ok(Self {
            base_url,
            bearer_token,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, BastionApiError> {
        self.base_url.join(path).map_err(|err| {
            BastionApiError::InvalidConfig(format!("invalid broker endpoint {path:?}: {err}"))
        })
    }
}

pub struct HttpBastionApi {
    client: reqwest::Client,
    config: BrokerConfig,
}

impl HttpBastionApi {
    pub fn new(config: BrokerConfig) -> Result<Self, BastionApiError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()?;
        Ok(Self { client, config })
    }

    fn authorize(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.config.bearer_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

#[async_trait]
impl BastionApi for HttpBastionApi {
    async fn create(&self, spec: &BastionSpec) -> Result<(), BastionApiError> {
        let endpoint = self.config.endpoint("bastions")?;
        let request = CreateBastionRequest {
            name: &spec.name,
            public_key: &spec.public_key,
            allowed_cidrs: &spec.allowed_cidrs,
        };
        let response = self
            .authorize(self.client.post(endpoint))
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BastionApiError::HttpStatus(response.status()));
        }
        let ack = response.json::<AckResponse>().await?;
        if !ack.success {
            return Err(BastionApiError::Broker(
                ack.message
                    .unwrap_or_else(|| "bastion creation rejected".to_owned()),
            ));
        }
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<BastionStatus, BastionApiError> {
        let endpoint = self.config.endpoint(&format!("bastions/{name}"))?;
        let response = self.authorize(self.client.get(endpoint)).send().await?;
        if !response.status().is_success() {
            return Err(BastionApiError::HttpStatus(response.status()));
        }
        let payload = response.json::<StatusResponse>().await?;
        Ok(payload.into())
    }

    async fn keep_alive(&self, name: &str) -> Result<(), BastionApiError> {
        let endpoint = self.config.endpoint(&format!("bastions/{name}/keepalive"))?;
        let response = self.authorize(self.client.post(endpoint)).send().await?;
        if !response.status().is_success() {
            return Err(BastionApiError::HttpStatus(response.status()));
        }
        let ack = response.json::<AckResponse>().await?;
        if !ack.success {
            return Err(BastionApiError::Broker(
                ack.message
                    .unwrap_or_else(|| "keep-alive rejected".to_owned()),
            ));
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), BastionApiError> {
        let endpoint = self.config.endpoint(&format!("bastions/{name}"))?;
        let response = self.authorize(self.client.delete(endpoint)).send().await?;
        // A bastion that is already gone counts as deleted.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(BastionApiError::HttpStatus(response.status()));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct CreateBastionRequest<'a> {
    name: &'a str,
    public_key: &'a str,
    allowed_cidrs: &'a [String],
}

#[derive(Debug, Deserialize)]
struct AckResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    phase: WirePhase,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WirePhase {
    Pending,
    Ready,
    Failed,
}

impl From<StatusResponse> for BastionStatus {
    fn from(payload: StatusResponse) -> Self {
        let phase = match payload.phase {
            WirePhase::Pending => BastionPhase::Pending,
            WirePhase::Ready => BastionPhase::Ready,
            WirePhase::Failed => BastionPhase::Failed,
        };
        BastionStatus {
            phase,
            endpoint: payload.endpoint,
            message: payload.message,
        }
    }
}
