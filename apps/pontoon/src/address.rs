use async_trait::async_trait;
use reqwest::Client;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const IPV4_ENDPOINT: &str = "https://api.ipify.org";
const IPV6_ENDPOINT: &str = "https://api6.ipify.org";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),
    #[error("lookup against {endpoint} failed: {source}")]
    Lookup {
        endpoint: String,
        source: reqwest::Error,
    },
    #[error("{endpoint} returned an unparsable address {value:?}")]
    Unparsable { endpoint: String, value: String },
    #[error("no address service could be reached")]
    NoEndpoint,
}

/// Reports the public addresses the caller currently egresses from.
#[async_trait]
pub trait PublicAddressSource: Send + Sync {
    async fn discover(&self) -> Result<Vec<IpAddr>, DiscoveryError>;
}

/// Looks the addresses up via the ipify services, one query per family.
/// A family with no connectivity is skipped; only both families failing is
/// an error.
pub struct HttpAddressSource {
    client: Client,
    endpoints: Vec<String>,
}

impl HttpAddressSource {
    pub fn new() -> Result<Self, DiscoveryError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(DiscoveryError::Client)?;
        Ok(Self {
            client,
            endpoints: vec![IPV4_ENDPOINT.to_owned(), IPV6_ENDPOINT.to_owned()],
        })
    }

    #[cfg(test)]
    fn with_endpoints(endpoints: Vec<String>) -> Result<Self, DiscoveryError> {
        let mut source = Self::new()?;
        source.endpoints = endpoints;
        source
            .endpoints
            .retain(|endpoint| !endpoint.is_empty());
        Ok(source)
    }
}

#[async_trait]
impl PublicAddressSource for HttpAddressSource {
    async fn discover(&self) -> Result<Vec<IpAddr>, DiscoveryError> {
        let mut addresses: Vec<IpAddr> = Vec::new();
        let mut last_failure: Option<DiscoveryError> = None;

        for endpoint in &self.endpoints {
            match fetch_address(&self.client, endpoint).await {
                Ok(address) => {
                    if !addresses.contains(&address) {
                        addresses.push(address);
                    }
                }
                Err(err) => {
                    debug!(target: "pontoon::address", endpoint, error = %err, "address lookup failed");
                    last_failure = Some(err);
                }
            }
        }

        if addresses.is_empty() {
            return Err(last_failure.unwrap_or(DiscoveryError::NoEndpoint));
        }
        Ok(addresses)
    }
}

async fn fetch_address(client: &Client, endpoint: &str) -> Result<IpAddr, DiscoveryError> {
    let body = client
        .get(endpoint)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|source| DiscoveryError::Lookup {
            endpoint: endpoint.to_owned(),
            source,
        })?
        .text()
        .await
        .map_err(|source| DiscoveryError::Lookup {
            endpoint: endpoint.to_owned(),
            source,
        })?;

    parse_address(endpoint, &body)
}

fn parse_address(endpoint: &str, body: &str) -> Result<IpAddr, DiscoveryError> {
    let trimmed = body.trim();
    trimmed.parse().map_err(|_| DiscoveryError::Unparsable {
        endpoint: endpoint.to_owned(),
        value: trimmed.to_owned(),
    })
}
