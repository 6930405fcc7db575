use thiserror::Error;

use crate::address::DiscoveryError;
use crate::bastion::BastionApiError;
use crate::session::SessionError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("broker configuration rejected: {0}")]
    Broker(#[from] BastionApiError),
    #[error("address discovery unavailable: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("{0}")]
    Session(#[from] SessionError),
}
