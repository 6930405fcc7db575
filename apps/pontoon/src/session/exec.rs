use async_trait::async_trait;
use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command as TokioCommand;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bastion::BASTION_USER;

const TARGET: &str = "pontoon::session";

/// Everything needed to open the interactive hop to the node: the bastion
/// to relay through, the node behind it, and the staged key both hops
/// authenticate with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSessionSpec {
    pub bastion_endpoint: String,
    pub node_host: String,
    pub login: String,
    pub key_path: PathBuf,
    /// Run this instead of an interactive shell when non-empty.
    pub remote_command: Vec<String>,
}

/// Runs the external ssh client for the lifetime of the session.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        spec: &SshSessionSpec,
        cancel: &CancellationToken,
    ) -> std::io::Result<ExitStatus>;
}

/// Spawns the system ssh binary with inherited stdio so the operator talks
/// to the node directly. On cancellation the child gets a grace period to
/// exit on its own before it is killed.
pub struct SystemSshRunner {
    ssh_binary: String,
    extra_flags: Vec<String>,
    kill_grace: Duration,
}

impl SystemSshRunner {
    pub fn new(ssh_binary: String, extra_flags: Vec<String>, kill_grace: Duration) -> Self {
        Self {
            ssh_binary,
            extra_flags,
            kill_grace,
        }
    }
}

#[async_trait]
impl CommandRunner for SystemSshRunner {
    async fn run(
        &self,
        spec: &SshSessionSpec,
        cancel: &CancellationToken,
    ) -> std::io::Result<ExitStatus> {
        let args = ssh_arguments(spec, &self.extra_flags);
        debug!(target: TARGET, binary = %self.ssh_binary, ?args, "launching ssh");

        let mut child = TokioCommand::new(&self.ssh_binary)
            .args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;

        tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                debug!(target: TARGET, grace = ?self.kill_grace, "interrupt received, waiting for ssh to exit");
                match tokio::time::timeout(self.kill_grace, child.wait()).await {
                    Ok(status) => status,
                    Err(_) => {
                        if let Err(err) = child.start_kill() {
                            debug!(target: TARGET, error = %err, "ssh exited before it could be killed");
                        }
                        child.wait().await
                    }
                }
            }
        }
    }
}

/// Builds the ssh argument list: node hop authenticated with the staged
/// key, relayed through the bastion via ProxyCommand using the same key.
/// Host key checks are off on both hops; the hosts are created per session
/// and have no prior identity to pin.
pub fn ssh_arguments(spec: &SshSessionSpec, extra_flags: &[String]) -> Vec<String> {
    let key = spec.key_path.display().to_string();
    let (bastion_host, bastion_port) = split_endpoint(&spec.bastion_endpoint);

    // ssh hands ProxyCommand to a shell, so the key path must be quoted
    // there even though the outer argv needs no quoting.
    let proxy = format!(
        "ssh -W %h:%p -o StrictHostKeyChecking=no -o IdentitiesOnly=yes -i {} -p {} {}@{}",
        shell_quote(&key),
        bastion_port,
        BASTION_USER,
        bastion_host,
    );

    let mut args = vec![
        "-o".to_owned(),
        "StrictHostKeyChecking=no".to_owned(),
        "-o".to_owned(),
        "IdentitiesOnly=yes".to_owned(),
        "-i".to_owned(),
        key,
        "-o".to_owned(),
        format!("ProxyCommand={proxy}"),
    ];
    args.extend(extra_flags.iter().cloned());
    args.push(format!("{}@{}", spec.login, spec.node_host));
    args.extend(spec.remote_command.iter().cloned());
    args
}

fn split_endpoint(endpoint: &str) -> (String, u16) {
    if let Ok(v6) = endpoint.parse::<Ipv6Addr>() {
        return (v6.to_string(), 22);
    }
    if let Some((host, port)) = endpoint.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            let host = host.trim_start_matches('[').trim_end_matches(']');
            return (host.to_owned(), port);
        }
    }
    (endpoint.to_owned(), 22)
}

pub fn shell_quote(raw: &str) -> String {
    if raw.is_empty() {
        return "''".to_string();
    }
    let mut quoted = String::with_capacity(raw.len() + 2);
    quoted.push('\'');
    for ch in raw.chars() {
        if ch == '\'' {
            quoted.push_str("'\"'\"'");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

pub fn describe_exit_status(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {signal}");
        }
    }

    "unknown status".to_string()
}

/// Process exit code to report for a finished session, shell-style:
/// the child's own code, or 128 plus the signal that ended it.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    1
}
