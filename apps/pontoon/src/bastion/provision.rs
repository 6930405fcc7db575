use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BastionApi, BastionApiError, BastionPhase, BastionSpec};

const TARGET: &str = "pontoon::bastion";

#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Delay between status polls.
    pub poll_interval: Duration,
    /// How long to wait for the bastion to become ready before giving up.
    pub wait_timeout: Duration,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            wait_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to create bastion {name:?}: {source}")]
    Create {
        name: String,
        #[source]
        source: BastionApiError,
    },
    #[error("bastion {name:?} did not become ready within {waited:?}")]
    TimedOut { name: String, waited: Duration },
    #[error("bastion {name:?} failed to provision: {message}")]
    Failed { name: String, message: String },
    #[error("bastion {name:?} reported ready without an endpoint")]
    MissingEndpoint { name: String },
    #[error("interrupted while waiting for bastion {name:?}")]
    Interrupted { name: String },
}

/// Creates the bastion and waits until it is reachable, returning its
/// endpoint. The create call is made once; only status polling retries.
pub async fn provision(
    api: &dyn BastionApi,
    spec: &BastionSpec,
    config: &ProvisionConfig,
    cancel: &CancellationToken,
) -> Result<String, ProvisionError> {
    api.create(spec).await.map_err(|source| ProvisionError::Create {
        name: spec.name.clone(),
        source,
    })?;
    info!(target: TARGET, name = %spec.name, "bastion requested");
    await_ready(api, &spec.name, config, cancel).await
}

/// Polls the bastion status until `Ready`, a definitive `Failed`, the
/// deadline, or cancellation. Transport errors while polling are retried
/// until the deadline; they never terminate the wait on their own.
pub async fn await_ready(
    api: &dyn BastionApi,
    name: &str,
    config: &ProvisionConfig,
    cancel: &CancellationToken,
) -> Result<String, ProvisionError> {
    let deadline = Instant::now() + config.wait_timeout;

    loop {
        if cancel.is_cancelled() {
            return Err(ProvisionError::Interrupted {
                name: name.to_owned(),
            });
        }

        match api.status(name).await {
            Ok(status) => match status.phase {
                BastionPhase::Ready => {
                    let endpoint = status.endpoint.ok_or_else(|| ProvisionError::MissingEndpoint {
                        name: name.to_owned(),
                    })?;
                    info!(target: TARGET, name, endpoint = %endpoint, "bastion is ready");
                    return Ok(endpoint);
                }
                BastionPhase::Failed => {
                    return Err(ProvisionError::Failed {
                        name: name.to_owned(),
                        message: status
                            .message
                            .unwrap_or_else(|| "no failure detail reported".to_owned()),
                    });
                }
                BastionPhase::Pending => {
                    debug!(target: TARGET, name, "bastion still pending");
                }
            },
            Err(err) => {
                warn!(target: TARGET, name, error = %err, "status poll failed, retrying");
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ProvisionError::TimedOut {
                name: name.to_owned(),
                waited: config.wait_timeout,
            });
        }
        let wait = deadline.duration_since(now).min(config.poll_interval);
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ProvisionError::Interrupted {
                    name: name.to_owned(),
                });
            }
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bastion::BastionStatus;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct ScriptedApi {
        statuses: Mutex<VecDeque<Result<BastionStatus, BastionApiError>>>,
        create_calls: Mutex<Vec<BastionSpec>>,
        status_calls: Mutex<usize>,
        create_error: Mutex<Option<BastionApiError>>,
    }

    impl ScriptedApi {
        fn with_statuses(
            statuses: Vec<Result<BastionStatus, BastionApiError>>,
        ) -> Self {
            Self {
                statuses: Mutex::new(statuses.into_iter().collect()),
                ..Self::default()
            }
        }

        fn status_calls(&self) -> usize {
            *self.status_calls.lock()
        }
    }

    #[async_trait]
    impl BastionApi for ScriptedApi {
        async fn create(&self, spec: &BastionSpec) -> Result<(), BastionApiError> {
            self.create_calls.lock().push(spec.clone());
            match self.create_error.lock().take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn status(&self, _name: &str) -> Result<BastionStatus, BastionApiError> {
            *self.status_calls.lock() += 1;
            self.statuses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(BastionStatus::pending()))
        }

        async fn keep_alive(&self, _name: &str) -> Result<(), BastionApiError> {
            Ok(())
        }

        async fn delete(&self, _name: &str) -> Result<(), BastionApiError> {
            Ok(())
        }
    }

    fn spec() -> BastionSpec {
        BastionSpec {
            name: "pontoon-test0001".to_owned(),
            public_key: "ssh-ed25519 AAAA test".to_owned(),
            allowed_cidrs: vec!["203.0.113.7/32".to_owned()],
        }
    }

    fn quick_config() -> ProvisionConfig {
        ProvisionConfig {
            poll_interval: Duration::from_millis(10),
            wait_timeout: Duration::from_secs(5),
        }
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn polls_once_per_status_until_ready() {
        let api = ScriptedApi::with_statuses(vec![
            Ok(BastionStatus::pending()),
            Ok(BastionStatus::pending()),
            Ok(BastionStatus::ready("192.0.2.10")),
        ]);
        let cancel = CancellationToken::new();

        let endpoint = provision(&api, &spec(), &quick_config(), &cancel)
            .await
            .expect("becomes ready");

        assert_eq!(endpoint, "192.0.2.10");
        assert_eq!(api.status_calls(), 3);
        assert_eq!(api.create_calls.lock().len(), 1);
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn transient_poll_errors_are_retried() {
        let api = ScriptedApi::with_statuses(vec![
            Err(BastionApiError::Broker("blip".to_owned())),
            Ok(BastionStatus::pending()),
            Err(BastionApiError::Broker("blip again".to_owned())),
            Ok(BastionStatus::ready("192.0.2.10")),
        ]);
        let cancel = CancellationToken::new();

        let endpoint = provision(&api, &spec(), &quick_config(), &cancel)
            .await
            .expect("recovers from transient errors");

        assert_eq!(endpoint, "192.0.2.10");
        assert_eq!(api.status_calls(), 4);
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn definitive_failure_is_terminal() {
        let api = ScriptedApi::with_statuses(vec![
            Ok(BastionStatus::pending()),
            Ok(BastionStatus::failed("quota exceeded")),
            Ok(BastionStatus::ready("192.0.2.10")),
        ]);
        let cancel = CancellationToken::new();

        let err = provision(&api, &spec(), &quick_config(), &cancel)
            .await
            .unwrap_err();

        match err {
            ProvisionError::Failed { name, message } => {
                assert_eq!(name, "pontoon-test0001");
                assert_eq!(message, "quota exceeded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // The ready status queued after the failure must never be consumed.
        assert_eq!(api.status_calls(), 2);
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn deadline_bounds_the_poll_count() {
        let api = ScriptedApi::default();
        let cancel = CancellationToken::new();
        let config = ProvisionConfig {
            poll_interval: Duration::from_millis(10),
            wait_timeout: Duration::from_millis(50),
        };

        let err = await_ready(&api, "pontoon-test0001", &config, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::TimedOut { .. }));
        let polls = api.status_calls();
        assert!((4..=8).contains(&polls), "unexpected poll count {polls}");
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn ready_without_endpoint_is_an_error() {
        let api = ScriptedApi::with_statuses(vec![Ok(BastionStatus {
            phase: BastionPhase::Ready,
            endpoint: None,
            message: None,
        })]);
        let cancel = CancellationToken::new();

        let err = await_ready(&api, "pontoon-test0001", &quick_config(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::MissingEndpoint { .. }));
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn create_failure_skips_polling() {
        let api = ScriptedApi::default();
        *api.create_error.lock() = Some(BastionApiError::Broker("denied".to_owned()));
        let cancel = CancellationToken::new();

        let err = provision(&api, &spec(), &quick_config(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::Create { .. }));
        assert_eq!(api.status_calls(), 0);
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn cancellation_stops_the_wait_promptly() {
        let api = ScriptedApi::default();
        let cancel = CancellationToken::new();
        let config = ProvisionConfig {
            poll_interval: Duration::from_secs(30),
            wait_timeout: Duration::from_secs(300),
        };

        let waiter = {
            let cancel = cancel.clone();
            async move { await_ready(&api, "pontoon-test0001", &config, &cancel).await }
        };
        let trigger = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(waiter, trigger);

        assert!(matches!(result.unwrap_err(), ProvisionError::Interrupted { .. }));
    }
}
