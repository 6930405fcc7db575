use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bastion::BastionApi;

const TARGET: &str = "pontoon::session";

/// Shared, adjustable keep-alive cadence. Cloning hands out another handle
/// to the same interval; `set` takes effect on the loop's next tick.
#[derive(Clone, Debug)]
pub struct KeepAliveInterval {
    current: Arc<Mutex<Duration>>,
}

impl KeepAliveInterval {
    pub fn new(initial: Duration) -> Self {
        Self {
            current: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn get(&self) -> Duration {
        *self.current.lock()
    }

    pub fn set(&self, interval: Duration) {
        *self.current.lock() = interval;
    }
}

/// Pings the broker so the bastion outlives long interactive sessions.
/// Strictly best-effort: failures are logged and the loop keeps going,
/// because a missed ping only shortens the bastion's lease.
pub async fn run(
    api: Arc<dyn BastionApi>,
    name: String,
    interval: KeepAliveInterval,
    cancel: CancellationToken,
) {
    loop {
        let wait = interval.get();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {
                match api.keep_alive(&name).await {
                    Ok(()) => debug!(target: TARGET, name = %name, "bastion keep-alive sent"),
                    Err(err) => {
                        warn!(target: TARGET, name = %name, error = %err, "bastion keep-alive failed");
                    }
                }
            }
        }
    }
    debug!(target: TARGET, name = %name, "keep-alive loop stopped");
}
