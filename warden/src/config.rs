//! Command line and environment configuration

use std::{ffi::OsString, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use warden_clock::DurationSecs;
use warden_tokens::{
    backoff::ErrorBackoffConfig, refresher::oauth2::dto::ClientCredentials, ClientId,
    ClientSecret, Provider,
};

use crate::controller::ControllerConfig;

/// Environment variables that are only set while serving a CGI request
pub const REQUEST_CONTEXT_VARS: [&str; 2] = ["GATEWAY_INTERFACE", "REQUEST_METHOD"];

/// An invalid configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A setting needed to run the daemon was not provided
    #[error("{0} is required to run the daemon")]
    Missing(&'static str),
    /// The token endpoint is not an http(s) URL
    #[error("token url must use http or https, not {0:?}")]
    UnsupportedScheme(String),
    /// A duration that must be positive was zero
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    /// The recovery delay would outlast the normal interval
    #[error("recovery delay ({recovery}s) must not exceed the interval ({interval}s)")]
    RecoveryExceedsInterval {
        /// The configured recovery delay, in seconds
        recovery: u64,
        /// The configured interval, in seconds
        interval: u64,
    },
    /// The process was launched to serve a web request
    #[error("refusing to run inside a web request ({0} is set)")]
    RequestContext(&'static str),
}

/// Keeps stored OAuth2 connections refreshed in the background
#[derive(Debug, Parser)]
#[command(name = "warden", version, about)]
pub struct Cli {
    /// What to do; defaults to `start`
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    #[allow(missing_docs)]
    pub opts: Opts,
}

impl Cli {
    /// The requested command, defaulting to `start`
    pub fn command(&self) -> Command {
        self.command.unwrap_or(Command::Start)
    }
}

/// Daemon lifecycle commands
#[derive(Clone, Copy, Debug, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground until it is told to stop
    Start,
    /// Ask a running daemon to stop and wait for it to exit
    Stop,
    /// Stop any running daemon, then start in the foreground
    Restart,
    /// Report whether a daemon is running
    Status,
}

/// Settings shared by every command
#[derive(Debug, Args)]
pub struct Opts {
    /// The SQLite database holding stored tokens
    #[arg(long, global = true, env = "WARDEN_DATABASE", default_value = "warden.db")]
    pub database: PathBuf,

    /// The provider tag whose connections are maintained
    #[arg(long, global = true, env = "WARDEN_PROVIDER", default_value = Provider::DEFAULT)]
    pub provider: Provider,

    /// The issuing authority's token request URL
    #[arg(long, global = true, env = "WARDEN_TOKEN_URL")]
    pub token_url: Option<reqwest::Url>,

    /// The client ID registered with the issuing authority
    #[arg(long, global = true, env = "WARDEN_CLIENT_ID")]
    pub client_id: Option<ClientId>,

    /// The client secret used to identify the client to the issuing authority
    #[arg(long, global = true, env = "WARDEN_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<ClientSecret>,

    /// Where the running daemon records its process ID
    #[arg(long, global = true, env = "WARDEN_PID_FILE", default_value = "warden.pid")]
    pub pid_file: PathBuf,

    /// Append log lines to this file instead of stderr
    #[arg(long, global = true, env = "WARDEN_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Seconds between maintenance passes
    #[arg(long, global = true, env = "WARDEN_INTERVAL_SECS", default_value_t = 900)]
    pub interval_secs: u64,

    /// Seconds to wait after the first failed pass
    #[arg(long, global = true, env = "WARDEN_RECOVERY_SECS", default_value_t = 60)]
    pub recovery_secs: u64,

    /// Tokens expiring within this many seconds are refreshed
    #[arg(long, global = true, env = "WARDEN_SKEW_MARGIN_SECS", default_value_t = 1200)]
    pub skew_margin_secs: u64,

    /// Timeout for each token endpoint request, in seconds
    #[arg(long, global = true, env = "WARDEN_HTTP_TIMEOUT_SECS", default_value_t = 30)]
    pub http_timeout_secs: u64,

    /// How long `stop` waits for the daemon to exit, in seconds
    #[arg(long, global = true, env = "WARDEN_STOP_TIMEOUT_SECS", default_value_t = 30)]
    pub stop_timeout_secs: u64,
}

/// Validated settings for running the daemon
#[derive(Debug)]
pub struct DaemonConfig {
    /// The SQLite database holding stored tokens
    pub database: PathBuf,
    /// The provider whose connections are maintained
    pub provider: Provider,
    /// The token endpoint
    pub token_url: reqwest::Url,
    /// The client's credentials at the token endpoint
    pub credentials: ClientCredentials,
    /// How close to expiry a token may get before it is refreshed
    pub skew_margin: DurationSecs,
    /// Timeout for each token endpoint request
    pub http_timeout: Duration,
}

impl Opts {
    /// Settings for the lifecycle controller
    ///
    /// Needed by every command, so no credentials are involved.
    pub fn controller_config(&self) -> Result<ControllerConfig, ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::Zero("interval"));
        }
        if self.recovery_secs == 0 {
            return Err(ConfigError::Zero("recovery delay"));
        }
        if self.recovery_secs > self.interval_secs {
            return Err(ConfigError::RecoveryExceedsInterval {
                recovery: self.recovery_secs,
                interval: self.interval_secs,
            });
        }

        let interval = Duration::from_secs(self.interval_secs);
        Ok(ControllerConfig {
            interval,
            backoff: ErrorBackoffConfig::new(Duration::from_secs(self.recovery_secs), interval, 2),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            ..ControllerConfig::default()
        })
    }

    /// Settings for the maintenance passes run by `start` and `restart`
    pub fn daemon_config(&self) -> Result<DaemonConfig, ConfigError> {
        let token_url = self
            .token_url
            .clone()
            .ok_or(ConfigError::Missing("token url"))?;
        if !matches!(token_url.scheme(), "http" | "https") {
            return Err(ConfigError::UnsupportedScheme(token_url.scheme().to_owned()));
        }

        let client_id = self
            .client_id
            .clone()
            .ok_or(ConfigError::Missing("client id"))?;
        let client_secret = self
            .client_secret
            .clone()
            .ok_or(ConfigError::Missing("client secret"))?;

        if self.http_timeout_secs == 0 {
            return Err(ConfigError::Zero("http timeout"));
        }

        Ok(DaemonConfig {
            database: self.database.clone(),
            provider: self.provider.clone(),
            token_url,
            credentials: ClientCredentials {
                client_id,
                client_secret,
            },
            skew_margin: DurationSecs(self.skew_margin_secs),
            http_timeout: Duration::from_secs(self.http_timeout_secs),
        })
    }
}

/// Fails if any variable set only while serving a web request is present
///
/// The daemon must be started by an operator or a supervisor, never as a side
/// effect of a page load.
pub fn ensure_not_in_request<I, K, V>(vars: I) -> Result<(), ConfigError>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<OsString>,
{
    for (key, _) in vars {
        let key = key.into();
        if let Some(found) = REQUEST_CONTEXT_VARS.iter().find(|v| key == **v) {
            return Err(ConfigError::RequestContext(found));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("warden").chain(args.iter().copied())).unwrap()
    }

    const CREDENTIALS: [&str; 6] = [
        "--token-url",
        "https://issuer.example.com/oauth/token",
        "--client-id",
        "client-1",
        "--client-secret",
        "secret-1",
    ];

    #[test]
    fn defaults_to_start_with_documented_settings() {
        let cli = parse(&[]);
        assert_eq!(cli.command(), Command::Start);
        assert_eq!(cli.opts.provider.as_str(), "default");
        assert_eq!(cli.opts.pid_file, PathBuf::from("warden.pid"));

        let controller = cli.opts.controller_config().unwrap();
        assert_eq!(controller.interval, Duration::from_secs(900));
        assert_eq!(
            controller.backoff.initial_error_delay(),
            Duration::from_secs(60)
        );
        assert_eq!(controller.backoff.max_error_delay(), controller.interval);
        assert_eq!(controller.stop_timeout, Duration::from_secs(30));
    }

    #[test]
    fn status_and_stop_need_no_credentials() {
        for command in ["status", "stop"] {
            let cli = parse(&[command]);
            assert!(cli.opts.controller_config().is_ok());
            assert!(matches!(
                cli.opts.daemon_config(),
                Err(ConfigError::Missing("token url"))
            ));
        }
    }

    #[test]
    fn daemon_config_collects_credentials() {
        let mut args = vec!["start", "--skew-margin-secs", "600"];
        args.extend(CREDENTIALS);
        let config = parse(&args).opts.daemon_config().unwrap();

        assert_eq!(config.credentials.client_id.as_str(), "client-1");
        assert_eq!(config.credentials.client_secret.as_str(), "secret-1");
        assert_eq!(config.skew_margin, DurationSecs(600));
        assert_eq!(config.http_timeout, Duration::from_secs(30));
    }

    #[test]
    fn secret_is_not_printed_in_debug_output() {
        let mut args = vec!["start"];
        args.extend(CREDENTIALS);
        let cli = parse(&args);
        assert!(!format!("{cli:?}").contains("secret-1"));
    }

    #[test]
    fn options_may_come_before_or_after_the_command() {
        let before = parse(&["--pid-file", "/run/warden.pid", "stop"]);
        let after = parse(&["stop", "--pid-file", "/run/warden.pid"]);

        for cli in [before, after] {
            assert_eq!(cli.command(), Command::Stop);
            assert_eq!(cli.opts.pid_file, PathBuf::from("/run/warden.pid"));
        }

        let mut args = vec!["restart"];
        args.extend(CREDENTIALS);
        args.extend(["--interval-secs", "600"]);
        let cli = parse(&args);
        assert_eq!(cli.command(), Command::Restart);
        assert_eq!(
            cli.opts.controller_config().unwrap().interval,
            Duration::from_secs(600)
        );
        assert!(cli.opts.daemon_config().is_ok());
    }

    #[test]
    fn rejects_non_http_token_url() {
        let cli = parse(&[
            "--token-url",
            "ftp://issuer.example.com/token",
            "--client-id",
            "c",
            "--client-secret",
            "s",
        ]);
        assert!(matches!(
            cli.opts.daemon_config(),
            Err(ConfigError::UnsupportedScheme(scheme)) if scheme == "ftp"
        ));
    }

    #[test]
    fn rejects_unparsable_token_url() {
        assert!(Cli::try_parse_from(["warden", "--token-url", "not a url"]).is_err());
    }

    #[test]
    fn rejects_bad_intervals() {
        assert!(matches!(
            parse(&["--interval-secs", "0"]).opts.controller_config(),
            Err(ConfigError::Zero("interval"))
        ));
        assert!(matches!(
            parse(&["--interval-secs", "30", "--recovery-secs", "60"])
                .opts
                .controller_config(),
            Err(ConfigError::RecoveryExceedsInterval {
                recovery: 60,
                interval: 30
            })
        ));
    }

    #[test]
    fn detects_request_context() {
        assert!(ensure_not_in_request([("PATH", "/usr/bin"), ("HOME", "/root")]).is_ok());
        assert!(matches!(
            ensure_not_in_request([("PATH", "/usr/bin"), ("REQUEST_METHOD", "GET")]),
            Err(ConfigError::RequestContext("REQUEST_METHOD"))
        ));
        assert!(matches!(
            ensure_not_in_request([("GATEWAY_INTERFACE", "CGI/1.1")]),
            Err(ConfigError::RequestContext("GATEWAY_INTERFACE"))
        ));
    }
}
