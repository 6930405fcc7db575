//! Session orchestration: drives one bastion-backed ssh session from
//! validation through cleanup.
//!
//! The manager owns nothing cloud-side permanently. Whatever it creates
//! along the way (bastion, staged key, background tasks) is recorded and
//! released on the way out, no matter how the session ended.

pub mod exec;
mod keepalive;

pub use exec::{CommandRunner, SshSessionSpec, SystemSshRunner, describe_exit_status, exit_code};
pub use keepalive::KeepAliveInterval;

use parking_lot::Mutex;
use russh::keys::PrivateKey;
use std::fmt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::PublicAddressSource;
use crate::bastion::{
    self, BastionApi, BastionNamer, BastionSpec, EndpointProbe, ProvisionConfig, ProvisionError,
};
use crate::credential::{KeySource, StagedCredential, StagingError};
use crate::policy::{self, AccessRequest, PolicyError, PolicyOutcome};
use crate::prompt::Prompt;
use crate::signal::InterruptSource;

const TARGET: &str = "pontoon::session";

/// Where the session currently is in its life. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Validating,
    Provisioning,
    Connecting,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Validating => "validating",
            SessionState::Provisioning => "provisioning",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// The pluggable edges of a session. Production wiring lives in the CLI;
/// tests swap in doubles.
#[derive(Clone)]
pub struct SessionCapabilities {
    pub api: Arc<dyn BastionApi>,
    pub addresses: Arc<dyn PublicAddressSource>,
    pub prompt: Arc<dyn Prompt>,
    pub keys: Arc<dyn KeySource>,
    pub probe: Arc<dyn EndpointProbe>,
    pub runner: Arc<dyn CommandRunner>,
    pub interrupts: Arc<dyn InterruptSource>,
    pub namer: Arc<dyn BastionNamer>,
}

#[derive(Debug, Clone)]
pub struct SessionTunables {
    /// Cadence of status polls while the bastion is coming up.
    pub poll_interval: Duration,
    /// Hard cap on the whole provisioning wait.
    pub wait_timeout: Duration,
    /// Initial keep-alive cadence once the session is active.
    pub keep_alive_interval: Duration,
    /// Handshake probes against a Ready bastion before giving up.
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
}

impl Default for SessionTunables {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            wait_timeout: Duration::from_secs(600),
            keep_alive_interval: Duration::from_secs(30),
            connect_attempts: 15,
            connect_retry_delay: Duration::from_secs(2),
        }
    }
}

/// One requested session: which node, as whom, guarded by which ranges.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub node_host: String,
    pub login: String,
    pub access: AccessRequest,
    /// Run this on the node instead of an interactive shell when non-empty.
    pub remote_command: Vec<String>,
}

/// How a session ended when nothing went wrong on our side.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The ssh client ran and exited with this status.
    Completed(ExitStatus),
    /// The operator declined the broad-range confirmation.
    Declined,
    /// The operator interrupted the session.
    Interrupted,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("failed to stage session credentials: {0}")]
    Staging(#[from] StagingError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error("bastion {name:?} never accepted an ssh handshake after {attempts} attempts: {last}")]
    Unreachable {
        name: String,
        attempts: u32,
        last: String,
    },
    #[error("failed to run ssh: {source}")]
    Exec {
        #[source]
        source: std::io::Error,
    },
    #[error("session interrupted")]
    Interrupted,
}

impl SessionError {
    fn is_interruption(&self) -> bool {
        matches!(
            self,
            SessionError::Interrupted | SessionError::Provision(ProvisionError::Interrupted { .. })
        )
    }
}

/// Cloud-side and process-side leftovers of a session in flight. Teardown
/// takes each entry out before releasing it, so running teardown again is
/// a no-op.
#[derive(Default)]
struct SessionResources {
    bastion: Option<String>,
    credential: Option<StagedCredential>,
    keepalive: Option<JoinHandle<()>>,
    interrupts: Option<JoinHandle<()>>,
}

pub struct SessionManager {
    capabilities: SessionCapabilities,
    tunables: SessionTunables,
    keep_alive: KeepAliveInterval,
    state: Mutex<SessionState>,
}

/// How `drive` ended; `run` folds teardown results on top of this.
enum DriveEnd {
    Declined,
    Completed(ExitStatus),
    Interrupted,
}

impl SessionManager {
    pub fn new(capabilities: SessionCapabilities, tunables: SessionTunables) -> Self {
        let keep_alive = KeepAliveInterval::new(tunables.keep_alive_interval);
        Self {
            capabilities,
            tunables,
            keep_alive,
            state: Mutex::new(SessionState::Validating),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Shared handle to the keep-alive cadence. Adjusting it takes effect
    /// on the running session's next keep-alive tick.
    pub fn keep_alive_interval(&self) -> KeepAliveInterval {
        self.keep_alive.clone()
    }

    /// Runs the session to completion. Cleanup always happens, exactly
    /// once, before this returns: cancellation and errors surface only
    /// after the bastion delete and key removal have been attempted.
    pub async fn run(&self, request: SessionRequest) -> Result<SessionOutcome, SessionError> {
        let cancel = CancellationToken::new();
        let mut resources = SessionResources::default();

        let drove = self.drive(&request, &cancel, &mut resources).await;

        cancel.cancel();
        self.transition(SessionState::Closing);
        self.teardown(&mut resources).await;
        self.transition(SessionState::Closed);

        match drove {
            Ok(DriveEnd::Completed(status)) => Ok(SessionOutcome::Completed(status)),
            Ok(DriveEnd::Declined) => Ok(SessionOutcome::Declined),
            Ok(DriveEnd::Interrupted) => Ok(SessionOutcome::Interrupted),
            Err(err) if err.is_interruption() => Ok(SessionOutcome::Interrupted),
            Err(err) => Err(err),
        }
    }

    async fn drive(
        &self,
        request: &SessionRequest,
        cancel: &CancellationToken,
        resources: &mut SessionResources,
    ) -> Result<DriveEnd, SessionError> {
        self.transition(SessionState::Validating);
        let policy = match policy::resolve(
            request.access.clone(),
            self.capabilities.addresses.as_ref(),
            self.capabilities.prompt.as_ref(),
        )
        .await?
        {
            PolicyOutcome::Accepted(policy) => policy,
            PolicyOutcome::Declined => {
                info!(target: TARGET, "no bastion created, operator declined");
                return Ok(DriveEnd::Declined);
            }
        };

        self.transition(SessionState::Provisioning);
        let interrupts = Arc::clone(&self.capabilities.interrupts);
        let interrupt_cancel = cancel.clone();
        resources.interrupts = Some(tokio::spawn(async move {
            match interrupts.recv().await {
                Ok(()) => {
                    info!(target: TARGET, "interrupt received, shutting the session down");
                    interrupt_cancel.cancel();
                }
                Err(err) => {
                    warn!(target: TARGET, error = %err, "interrupt listener failed, Ctrl-C will not be caught");
                }
            }
        }));

        let credential = StagedCredential::stage(self.capabilities.keys.as_ref())?;
        let public_key = credential.public_key_openssh().to_owned();
        let key_path = credential.private_key_path().to_owned();
        let private_key = credential.private_key().clone();
        resources.credential = Some(credential);

        let name = self.capabilities.namer.next_name();
        // Recorded before the create call so a half-registered bastion
        // still gets a delete on the way out.
        resources.bastion = Some(name.clone());

        let spec = BastionSpec {
            name: name.clone(),
            public_key,
            allowed_cidrs: policy.range_strings(),
        };
        let config = ProvisionConfig {
            poll_interval: self.tunables.poll_interval,
            wait_timeout: self.tunables.wait_timeout,
        };
        let endpoint =
            bastion::provision(self.capabilities.api.as_ref(), &spec, &config, cancel).await?;

        self.transition(SessionState::Connecting);
        self.await_reachable(&name, &endpoint, &private_key, cancel)
            .await?;
        println!("⚓ bastion ready at {endpoint}");

        self.transition(SessionState::Active);
        resources.keepalive = Some(tokio::spawn(keepalive::run(
            Arc::clone(&self.capabilities.api),
            name.clone(),
            self.keep_alive.clone(),
            cancel.child_token(),
        )));

        let session = SshSessionSpec {
            bastion_endpoint: endpoint,
            node_host: request.node_host.clone(),
            login: request.login.clone(),
            key_path,
            remote_command: request.remote_command.clone(),
        };
        let ran = self.capabilities.runner.run(&session, cancel).await;
        if cancel.is_cancelled() {
            return Ok(DriveEnd::Interrupted);
        }
        let status = ran.map_err(|source| SessionError::Exec { source })?;
        info!(target: TARGET, status = %describe_exit_status(status), "ssh finished");
        Ok(DriveEnd::Completed(status))
    }

    /// A Ready bastion can still be a second or two away from accepting
    /// connections, so the handshake is retried on a short delay.
    async fn await_reachable(
        &self,
        name: &str,
        endpoint: &str,
        key: &PrivateKey,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let attempts = self.tunables.connect_attempts.max(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(SessionError::Interrupted);
            }
            match self.capabilities.probe.check(endpoint, key).await {
                Ok(()) => {
                    debug!(target: TARGET, endpoint, attempt, "bastion accepted the session key");
                    return Ok(());
                }
                Err(err) => {
                    last = err.to_string();
                    debug!(target: TARGET, endpoint, attempt, error = %last, "bastion not accepting ssh yet");
                }
            }
            if attempt < attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SessionError::Interrupted),
                    _ = tokio::time::sleep(self.tunables.connect_retry_delay) => {}
                }
            }
        }
        Err(SessionError::Unreachable {
            name: name.to_owned(),
            attempts,
            last,
        })
    }

    /// Releases whatever the session acquired. Every step is best effort:
    /// a failed delete or file removal is logged and the rest still runs.
    async fn teardown(&self, resources: &mut SessionResources) {
        if let Some(task) = resources.keepalive.take() {
            task.abort();
        }
        if let Some(task) = resources.interrupts.take() {
            task.abort();
        }
        if let Some(name) = resources.bastion.take() {
            match self.capabilities.api.delete(&name).await {
                Ok(()) => info!(target: TARGET, name = %name, "bastion deleted"),
                Err(err) => {
                    warn!(target: TARGET, name = %name, error = %err, "failed to delete bastion, it will expire on its own");
                }
            }
        }
        if let Some(mut credential) = resources.credential.take() {
            if let Err(err) = credential.remove() {
                warn!(target: TARGET, error = %err, "failed to remove staged key file");
            }
        }
    }

    fn transition(&self, next: SessionState) {
        let mut state = self.state.lock();
        if *state == next {
            return;
        }
        debug!(target: TARGET, from = %*state, to = %next, "session state change");
        *state = next;
    }
}
