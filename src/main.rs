//! Duoroute HTTP server
//!
//! Starts an Axum web server that classifies chat requests and dispatches
//! them to the agent or direct execution engine.

use clap::Parser;
use duoroute::{
    cli::{Cli, Command, generate_config_template},
    config::Config,
    experiment::Recommendation,
    handlers::{self, AppState},
    telemetry,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Some(Command::Config { output, force }) = cli.command {
        return write_config_template(output, force);
    }

    // Load configuration; the CLI log level wins over the file's.
    let mut config = Config::from_file(&cli.config)?;
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }

    // Initialize telemetry
    telemetry::init(&config.observability.log_level);

    tracing::info!(
        "Starting Duoroute server on {}:{}",
        config.server.host,
        config.server.port
    );

    // Create socket address
    let addr = SocketAddr::from((
        config
            .server
            .host
            .parse::<std::net::IpAddr>()
            .unwrap_or_else(|_| std::net::IpAddr::from([0, 0, 0, 0])),
        config.server.port,
    ));

    // Build shared state and the maintenance loops it depends on
    let state = AppState::new(config)?;
    spawn_background_tasks(&state);

    let app = handlers::app(state);

    tracing::info!("Listening on {}", addr);
    tracing::info!("Health check available at http://{}/health", addr);

    // Start server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Handle `duoroute config`: print the template, or write it to a file
///
/// An existing output file is never overwritten unless `--force` was given.
fn write_config_template(
    output: Option<String>,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let template = generate_config_template();
    match output {
        Some(path) => {
            let path = std::path::Path::new(&path);
            if path.exists() && !force {
                return Err(format!(
                    "refusing to overwrite existing file '{}'; pass --force to replace it",
                    path.display()
                )
                .into());
            }
            std::fs::write(path, template)?;
            println!("Wrote configuration template to {}", path.display());
        }
        None => print!("{template}"),
    }
    Ok(())
}

/// Spawn the three periodic maintenance loops: prompt cache sweep, resource
/// sweep, and experiment tick. Intervals come from the loaded config. Each
/// loop runs for the life of the process; a watchdog task logs if one
/// terminates, since a silently dead sweep means unbounded cache growth.
fn spawn_background_tasks(state: &AppState) {
    let prompt_interval = Duration::from_secs(state.config().prompt_cache.sweep_seconds);
    let resource_interval = Duration::from_secs(state.config().resources.sweep_seconds);
    let tick_interval = Duration::from_secs(state.config().experiment.tick_seconds);

    let prompts = Arc::clone(state.prompts());
    watch(
        "prompt cache sweep",
        tokio::spawn(async move {
            tracing::info!(
                interval_seconds = prompt_interval.as_secs(),
                "Starting prompt cache sweep loop"
            );
            loop {
                tokio::time::sleep(prompt_interval).await;
                let removed = prompts.cache().sweep();
                tracing::debug!(removed, "Prompt cache sweep complete");
            }
        }),
    );

    let resources = Arc::clone(state.resources());
    watch(
        "resource sweep",
        tokio::spawn(async move {
            tracing::info!(
                interval_seconds = resource_interval.as_secs(),
                "Starting resource sweep loop"
            );
            loop {
                tokio::time::sleep(resource_interval).await;
                let report = resources.sweep().await;
                tracing::debug!(
                    expired = report.expired_removed,
                    lru_evicted = report.lru_evicted,
                    pressure_evicted = report.pressure_evicted,
                    resources_cleaned = report.resources_cleaned,
                    cache_bytes = report.cache_bytes,
                    "Resource sweep complete"
                );
            }
        }),
    );

    let experiment = Arc::clone(state.experiment());
    watch(
        "experiment tick",
        tokio::spawn(async move {
            tracing::info!(
                interval_seconds = tick_interval.as_secs(),
                "Starting experiment tick loop"
            );
            loop {
                tokio::time::sleep(tick_interval).await;
                // tick() prunes windows and applies automatic rollback
                // itself (with its own warn); the loop only reports.
                let report = experiment.tick();
                tracing::debug!(
                    recommendation = ?report.recommendation,
                    reason = %report.reason,
                    "Experiment tick complete"
                );
                if report.recommendation == Recommendation::Increase {
                    tracing::info!(
                        reason = %report.reason,
                        "Experiment recommends increasing rollout"
                    );
                }
            }
        }),
    );
}

/// Log when a maintenance loop stops. The loops have no exit path, so any
/// completion means the task panicked or the runtime is shutting down.
fn watch(name: &'static str, handle: tokio::task::JoinHandle<()>) {
    tokio::spawn(async move {
        match handle.await {
            Ok(()) => tracing::error!(
                task = name,
                "Background task terminated unexpectedly; its maintenance \
                 has stopped until server restart"
            ),
            Err(e) => tracing::error!(
                task = name,
                error = %e,
                "Background task panicked; its maintenance has stopped \
                 until server restart"
            ),
        }
    });
}
