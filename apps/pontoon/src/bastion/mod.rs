pub mod api;
pub mod probe;
pub mod provision;

pub use api::{BastionApi, BastionApiError, BrokerConfig, HttpBastionApi};
pub use probe::{EndpointProbe, ProbeError, SshProbe};
pub use provision::{ProvisionConfig, ProvisionError, provision};

use uuid::Uuid;

/// Login accepted by bastion hosts for keys registered at creation time.
pub const BASTION_USER: &str = "pontoon";

/// What the broker needs to bring a bastion up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BastionSpec {
    pub name: String,
    /// authorized_keys line for the session key.
    pub public_key: String,
    /// Ranges allowed to reach the bastion's ingress.
    pub allowed_cidrs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BastionPhase {
    Pending,
    Ready,
    Failed,
}

#[derive(Debug, Clone)]
pub struct BastionStatus {
    pub phase: BastionPhase,
    /// Address to reach the bastion at; set once the phase is `Ready`.
    pub endpoint: Option<String>,
    pub message: Option<String>,
}

impl BastionStatus {
    pub fn pending() -> Self {
        Self {
            phase: BastionPhase::Pending,
            endpoint: None,
            message: None,
        }
    }

    pub fn ready(endpoint: &str) -> Self {
        Self {
            phase: BastionPhase::Ready,
            endpoint: Some(endpoint.to_owned()),
            message: None,
        }
    }

    pub fn failed(message: &str) -> Self {
        Self {
            phase: BastionPhase::Failed,
            endpoint: None,
            message: Some(message.to_owned()),
        }
    }
}

/// Produces a unique name for each bastion a session requests.
pub trait BastionNamer: Send + Sync {
    fn next_name(&self) -> String;
}

#[derive(Debug, Default)]
pub struct UuidNamer;

impl BastionNamer for UuidNamer {
    fn next_name(&self) -> String {
        let id = Uuid::new_v4().simple().to_string();
        format!("pontoon-{}", &id[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_names_are_prefixed_and_unique() {
        let namer = UuidNamer;
        let first = namer.next_name();
        let second = namer.next_name();
        assert!(first.starts_with("pontoon-"));
        assert_eq!(first.len(), "pontoon-".len() + 8);
        assert_ne!(first, second);
    }
}
