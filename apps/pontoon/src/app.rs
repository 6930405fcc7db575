use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::address::HttpAddressSource;
use crate::bastion::{BrokerConfig, HttpBastionApi, SshProbe, UuidNamer};
use crate::cli::{self, Command, SshArgs};
use crate::credential::Ed25519KeySource;
use crate::error::CliError;
use crate::logging;
use crate::policy::AccessRequest;
use crate::prompt::TerminalPrompt;
use crate::session::{
    SessionCapabilities, SessionManager, SessionOutcome, SessionRequest, SessionTunables,
    SystemSshRunner, exit_code,
};
use crate::signal::CtrlC;

/// How long a cancelled ssh child gets to exit before it is killed.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Parses the command line, wires the production capabilities, and runs the
/// requested command. Returns the process exit code.
pub async fn run() -> Result<i32, CliError> {
    let cli = cli::parse();
    let log_config = cli.logging.to_config();
    logging::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    match cli.command {
        Command::Ssh(args) => run_ssh(&cli.broker, cli.broker_token, args).await,
    }
}

async fn run_ssh(broker: &str, token: Option<String>, args: SshArgs) -> Result<i32, CliError> {
    let target = cli::parse_target(&args.target);
    let login = args
        .login
        .clone()
        .or(target.login)
        .or_else(default_login)
        .unwrap_or_else(|| "root".to_owned());

    let config = BrokerConfig::new(broker, token)?;
    let capabilities = SessionCapabilities {
        api: Arc::new(HttpBastionApi::new(config)?),
        addresses: Arc::new(HttpAddressSource::new()?),
        prompt: Arc::new(TerminalPrompt),
        keys: Arc::new(Ed25519KeySource),
        probe: Arc::new(SshProbe::new(Duration::from_secs(args.handshake_timeout))),
        runner: Arc::new(SystemSshRunner::new(
            args.ssh_binary.clone(),
            args.ssh_flag.clone(),
            KILL_GRACE,
        )),
        interrupts: Arc::new(CtrlC),
        namer: Arc::new(UuidNamer),
    };
    let tunables = SessionTunables {
        wait_timeout: Duration::from_secs(args.wait_timeout),
        keep_alive_interval: Duration::from_secs(args.keep_alive_interval),
        ..SessionTunables::default()
    };

    let request = SessionRequest {
        node_host: target.host,
        login,
        access: AccessRequest {
            cidrs: args.cidrs.clone(),
            force: args.force,
        },
        remote_command: args.command.clone(),
    };

    let manager = SessionManager::new(capabilities, tunables);
    match manager.run(request).await? {
        SessionOutcome::Completed(status) => Ok(exit_code(status)),
        SessionOutcome::Declined => Ok(0),
        SessionOutcome::Interrupted => Ok(130),
    }
}

fn default_login() -> Option<String> {
    std::env::var("USER")
        .ok()
        .map(|login| login.trim().to_owned())
        .filter(|login| !login.is_empty())
}
