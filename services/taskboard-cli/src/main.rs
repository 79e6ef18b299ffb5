//! Taskboard command-line client
//!
//! Thin driver over the authenticated request pipeline:
//! 1. Loads TOML config (with env overlays)
//! 2. Restores the session from the credential file
//! 3. Runs one command; tokens are refreshed and persisted transparently

mod cli;
mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use api_client::{
    AuthEvent, HttpTransport, PipelineConfig, RequestDescriptor, RequestPipeline,
    spawn_refresh_task,
};
use clap::Parser;
use session_auth::CredentialStore;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command};
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs on stderr so command output on stdout stays parseable
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    let config_path = Config::resolve_path(cli.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    info!(
        base_url = %config.api.base_url,
        credentials = %config.session.credentials_path.display(),
        "configuration loaded"
    );

    let pipeline = build_pipeline(&config).await?;
    if let Some(output) = run(cli.command, &pipeline, &config).await? {
        println!("{}", serde_json::to_string_pretty(&output)?);
    }
    Ok(())
}

async fn build_pipeline(config: &Config) -> Result<RequestPipeline> {
    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let transport = Arc::new(HttpTransport::new(
        client,
        config.api.base_url.clone(),
        Duration::from_secs(config.api.timeout_secs),
    ));
    let store = CredentialStore::load(config.session.credentials_path.clone())
        .await
        .with_context(|| {
            format!(
                "failed to load credentials from {}",
                config.session.credentials_path.display()
            )
        })?;
    let pipeline_config = PipelineConfig {
        refresh_timeout: Duration::from_secs(config.api.refresh_timeout_secs),
        ..PipelineConfig::default()
    };
    Ok(RequestPipeline::new(transport, Arc::new(store), pipeline_config).await)
}

/// Run one command. Returns what to print, if anything.
async fn run(
    command: Command,
    pipeline: &RequestPipeline,
    config: &Config,
) -> Result<Option<serde_json::Value>> {
    match command {
        Command::Login { email } => {
            let password = config
                .password
                .as_ref()
                .context("TASKBOARD_PASSWORD must be set to log in")?;
            let user = pipeline.login(&email, password.expose_str()).await?;
            Ok(Some(serde_json::to_value(user)?))
        }
        Command::Register { name, email } => {
            let password = config
                .password
                .as_ref()
                .context("TASKBOARD_PASSWORD must be set to register")?;
            let user = pipeline
                .register(&name, &email, password.expose_str())
                .await?;
            Ok(Some(serde_json::to_value(user)?))
        }
        Command::Logout => {
            pipeline.logout().await;
            Ok(None)
        }
        Command::Whoami => {
            if !pipeline.store().is_authenticated().await {
                bail!("not logged in");
            }
            let user = pipeline.current_user().await?;
            Ok(Some(serde_json::to_value(user)?))
        }
        Command::Request { method, path, body } => {
            let mut descriptor = RequestDescriptor::new(method, path);
            descriptor.body = body;
            let payload = pipeline
                .send_with_retry(descriptor, &config.retry.policy())
                .await?;
            Ok(Some(payload))
        }
        Command::Keepalive => {
            keepalive(pipeline, config).await?;
            Ok(None)
        }
    }
}

/// Refresh proactively until Ctrl-C or until the session can't be renewed.
async fn keepalive(pipeline: &RequestPipeline, config: &Config) -> Result<()> {
    if !pipeline.store().is_authenticated().await {
        bail!("not logged in");
    }

    let mut events = pipeline.session().subscribe();
    let task = spawn_refresh_task(
        pipeline.clone(),
        Duration::from_secs(config.session.refresh_interval_secs),
        Duration::from_secs(config.session.refresh_threshold_secs),
    );
    info!(
        interval_secs = config.session.refresh_interval_secs,
        threshold_secs = config.session.refresh_threshold_secs,
        "keepalive running"
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let result = loop {
        tokio::select! {
            _ = &mut shutdown => break Ok(()),
            event = events.recv() => match event {
                Ok(AuthEvent::SessionExpired { reason }) => {
                    break Err(anyhow!("session expired, log in again: {reason}"));
                }
                Ok(event) => info!(?event, session = pipeline.session().status().label(), "auth event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed auth events"),
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    task.abort();
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
