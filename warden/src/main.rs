use std::{
    fs::OpenOptions,
    path::Path,
    process::ExitCode,
    sync::{Arc, Mutex},
};

use clap::Parser;
use color_eyre::eyre::WrapErr;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use warden::{
    config::{self, Cli, Command, DaemonConfig},
    pidfile::PidFile,
    signals, ControlError, DaemonController, DaemonStatus,
};
use warden_tokens::{
    refresher::OAuth2Refresher, store::SqliteTokenStore, ConnectionMaintainer, ValidatorConfig,
};

fn init_tracing(log_file: Option<&Path>) -> color_eyre::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .wrap_err_with(|| format!("unable to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    Ok(())
}

fn build_maintainer(
    config: DaemonConfig,
) -> color_eyre::Result<ConnectionMaintainer<Arc<SqliteTokenStore>, OAuth2Refresher>> {
    let store = SqliteTokenStore::open(&config.database).wrap_err_with(|| {
        format!("unable to open token store {}", config.database.display())
    })?;

    let client = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()?;

    let refresher = OAuth2Refresher::new(client, config.token_url, config.credentials);

    tracing::info!(
        database = %config.database.display(),
        provider = %config.provider,
        token_url = %refresher.token_url(),
        skew_margin = config.skew_margin.0,
        "maintaining connections"
    );

    Ok(
        ConnectionMaintainer::new(Arc::new(store), refresher, config.provider)
            .with_validator(ValidatorConfig::new(config.skew_margin)),
    )
}

#[tokio::main]
async fn main() -> color_eyre::Result<ExitCode> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    config::ensure_not_in_request(std::env::vars_os())?;

    let cli = Cli::parse();
    init_tracing(cli.opts.log_file.as_deref())?;

    let controller = DaemonController::new(
        PidFile::new(&cli.opts.pid_file),
        cli.opts.controller_config()?,
    );

    match cli.command() {
        Command::Status => {
            let status = controller.status().await?;
            println!("warden is {status}");
            Ok(match status {
                DaemonStatus::Running { .. } => ExitCode::SUCCESS,
                DaemonStatus::Stopped => ExitCode::FAILURE,
            })
        }
        Command::Stop => match controller.stop().await {
            Ok(pid) => {
                println!("warden (pid {pid}) stopped");
                Ok(ExitCode::SUCCESS)
            }
            Err(ControlError::NotRunning) => {
                println!("warden is not running");
                Ok(ExitCode::FAILURE)
            }
            Err(error) => Err(error.into()),
        },
        command @ (Command::Start | Command::Restart) => {
            let maintainer = build_maintainer(cli.opts.daemon_config()?)?;

            let cancel = CancellationToken::new();
            let signal_task = signals::cancel_on_shutdown(cancel.clone());

            let result = if command == Command::Restart {
                controller.restart(&maintainer, &cancel).await
            } else {
                controller.start(&maintainer, &cancel).await
            };
            cancel.cancel();
            signal_task.await.ok();

            match result {
                Ok(()) => Ok(ExitCode::SUCCESS),
                Err(error @ ControlError::AlreadyRunning { .. }) => {
                    tracing::error!(%error, "not starting");
                    eprintln!("warden: {error}");
                    Ok(ExitCode::FAILURE)
                }
                Err(error) => Err(error.into()),
            }
        }
    }
}
