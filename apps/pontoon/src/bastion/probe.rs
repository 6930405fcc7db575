use async_trait::async_trait;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PrivateKey, PublicKey};
use russh::Disconnect;
use std::net::{Ipv6Addr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::BASTION_USER;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("cannot resolve {endpoint:?}: {reason}")]
    Resolve { endpoint: String, reason: String },
    #[error("ssh transport error: {0}")]
    Ssh(#[from] russh::Error),
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("bastion rejected the session key")]
    AuthRejected,
}

/// Availability check for a freshly provisioned endpoint. A check passes
/// only when a full SSH handshake and key authentication succeed, the same
/// bar the interactive session has to clear.
#[async_trait]
pub trait EndpointProbe: Send + Sync {
    async fn check(&self, endpoint: &str, key: &PrivateKey) -> Result<(), ProbeError>;
}

pub struct SshProbe {
    user: String,
    handshake_timeout: Duration,
}

impl SshProbe {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self {
            user: BASTION_USER.to_owned(),
            handshake_timeout,
        }
    }
}

#[async_trait]
impl EndpointProbe for SshProbe {
    async fn check(&self, endpoint: &str, key: &PrivateKey) -> Result<(), ProbeError> {
        let address = host_port(endpoint);
        let socket_addr = address
            .to_socket_addrs()
            .map_err(|err| ProbeError::Resolve {
                endpoint: endpoint.to_owned(),
                reason: err.to_string(),
            })?
            .next()
            .ok_or_else(|| ProbeError::Resolve {
                endpoint: endpoint.to_owned(),
                reason: "no address found".to_owned(),
            })?;

        let config = Arc::new(client::Config::default());
        let mut handle = tokio::time::timeout(
            self.handshake_timeout,
            client::connect(config, socket_addr, AcceptAnyHostKey),
        )
        .await
        .map_err(|_| ProbeError::Timeout(self.handshake_timeout))??;

        let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key.clone()), None);
        let authenticated = handle
            .authenticate_publickey(&self.user, key_with_hash)
            .await?;
        if !authenticated.success() {
            return Err(ProbeError::AuthRejected);
        }

        debug!(target: "pontoon::bastion", endpoint, "availability check passed");
        let _ = handle
            .disconnect(Disconnect::ByApplication, "availability check", "en")
            .await;
        Ok(())
    }
}

/// Bastion host keys are minted together with the bastion moments before
/// the check runs, so there is nothing to verify them against.
struct AcceptAnyHostKey;

impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

fn host_port(endpoint: &str) -> String {
    if let Ok(v6) = endpoint.parse::<Ipv6Addr>() {
        return format!("[{v6}]:22");
    }
    let has_port = endpoint
        .rsplit_once(':')
        .map(|(_, port)| port.parse::<u16>().is_ok())
        .unwrap_or(false);
    if has_port {
        endpoint.to_owned()
    } else {
        format!("{endpoint}:22")
    }
}
