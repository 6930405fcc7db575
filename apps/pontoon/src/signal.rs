use async_trait::async_trait;

/// Resolves once when the operator asks the session to stop.
#[async_trait]
pub trait InterruptSource: Send + Sync {
    async fn recv(&self) -> std::io::Result<()>;
}

/// Ctrl-C / SIGINT, the interrupt every terminal user reaches for.
#[derive(Debug, Default)]
pub struct CtrlC;

#[async_trait]
impl InterruptSource for CtrlC {
    async fn recv(&self) -> std::io::Result<()> {
        tokio::signal::ctrl_c().await
    }
}
