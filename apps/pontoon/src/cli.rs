use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "pontoon",
    about = "⚓ Open ssh sessions to private nodes through short-lived bastion hosts",
    author,
    version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("BUILD_TIMESTAMP"))
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "PONTOON_BROKER",
        default_value = "http://127.0.0.1:8080",
        help = "Base URL for the bastion broker"
    )]
    pub broker: String,

    #[arg(
        long = "broker-token",
        global = true,
        env = "PONTOON_BROKER_TOKEN",
        value_name = "TOKEN",
        hide_env_values = true,
        help = "Bearer token to authenticate broker requests"
    )]
    pub broker_token: Option<String>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "PONTOON_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "PONTOON_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Open an ssh session to a node through a bastion created for it
    Ssh(SshArgs),
}

#[derive(Args, Debug)]
pub struct SshArgs {
    #[arg(value_name = "TARGET", help = "Node to reach (login@host or host)")]
    pub target: String,

    #[arg(
        long = "cidr",
        value_name = "CIDR",
        action = clap::ArgAction::Append,
        help = "Range allowed to reach the bastion (repeatable; defaults to your public IPs)"
    )]
    pub cidrs: Vec<String>,

    #[arg(
        long,
        action = clap::ArgAction::SetTrue,
        help = "Accept broad CIDR ranges without confirmation"
    )]
    pub force: bool,

    #[arg(
        long,
        env = "PONTOON_LOGIN",
        value_name = "LOGIN",
        help = "Login name on the node (defaults to the target's login, then $USER)"
    )]
    pub login: Option<String>,

    #[arg(
        long = "wait-timeout",
        default_value_t = 600u64,
        value_name = "SECONDS",
        help = "Seconds to wait for the bastion to become ready"
    )]
    pub wait_timeout: u64,

    #[arg(
        long = "keep-alive-interval",
        default_value_t = 30u64,
        value_name = "SECONDS",
        help = "Seconds between keep-alive pings while the session is active"
    )]
    pub keep_alive_interval: u64,

    #[arg(
        long = "handshake-timeout",
        default_value_t = 10u64,
        value_name = "SECONDS",
        help = "Seconds to wait for the bastion's ssh handshake when probing"
    )]
    pub handshake_timeout: u64,

    #[arg(
        long = "ssh-binary",
        default_value = "ssh",
        value_name = "BIN",
        help = "SSH executable to invoke"
    )]
    pub ssh_binary: String,

    #[arg(
        long = "ssh-flag",
        value_name = "FLAG",
        action = clap::ArgAction::Append,
        help = "Additional flag to pass through to ssh (repeatable)"
    )]
    pub ssh_flag: Vec<String>,

    #[arg(
        trailing_var_arg = true,
        value_name = "COMMAND",
        help = "Command to run on the node instead of the default shell"
    )]
    pub command: Vec<String>,
}

/// A parsed `TARGET` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTarget {
    pub login: Option<String>,
    pub host: String,
}

/// Splits `login@host` on the last `@` so logins containing `@` survive.
/// A missing or empty part leaves the whole value as the host.
pub fn parse_target(raw: &str) -> NodeTarget {
    match raw.rsplit_once('@') {
        Some((login, host)) if !login.is_empty() && !host.is_empty() => NodeTarget {
            login: Some(login.to_owned()),
            host: host.to_owned(),
        },
        Some((login, host)) if login.is_empty() && !host.is_empty() => NodeTarget {
            login: None,
            host: host.to_owned(),
        },
        _ => NodeTarget {
            login: None,
            host: raw.to_owned(),
        },
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_splits_on_the_last_at() {
        assert_eq!(
            parse_target("core@10.250.1.17"),
            NodeTarget {
                login: Some("core".to_owned()),
                host: "10.250.1.17".to_owned(),
            }
        );
        assert_eq!(
            parse_target("user@corp@node-1"),
            NodeTarget {
                login: Some("user@corp".to_owned()),
                host: "node-1".to_owned(),
            }
        );
    }

    #[test]
    fn bare_hosts_and_degenerate_targets_keep_their_text() {
        assert_eq!(
            parse_target("node-1"),
            NodeTarget {
                login: None,
                host: "node-1".to_owned(),
            }
        );
        assert_eq!(
            parse_target("@node-1"),
            NodeTarget {
                login: None,
                host: "node-1".to_owned(),
            }
        );
        assert_eq!(
            parse_target("core@"),
            NodeTarget {
                login: None,
                host: "core@".to_owned(),
            }
        );
    }

    #[test]
    fn ssh_flags_and_command_parse_from_argv() {
        let cli = Cli::try_parse_from([
            "pontoon",
            "ssh",
            "core@node-1",
            "--cidr",
            "10.0.0.0/8",
            "--cidr",
            "192.168.0.0/16",
            "--ssh-flag=-vvv",
            "--",
            "uptime",
            "-p",
        ])
        .unwrap();

        let Command::Ssh(args) = cli.command;
        assert_eq!(args.target, "core@node-1");
        assert_eq!(args.cidrs, ["10.0.0.0/8", "192.168.0.0/16"]);
        assert_eq!(args.ssh_flag, ["-vvv"]);
        assert_eq!(args.command, ["uptime", "-p"]);
        assert!(!args.force);
        assert_eq!(args.wait_timeout, 600);
        assert_eq!(args.keep_alive_interval, 30);
    }

    #[test]
    fn broker_flag_is_global() {
        let cli = Cli::try_parse_from([
            "pontoon",
            "ssh",
            "node-1",
            "--broker",
            "https://broker.internal:9443/api",
        ])
        .unwrap();

        assert_eq!(cli.broker, "https://broker.internal:9443/api");
    }
}
