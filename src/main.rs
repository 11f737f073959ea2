#![forbid(unused_must_use)]
// only enables the `doc_cfg` feature when
// the `docsrs` configuration attribute is defined
#![cfg_attr(docsrs, feature(doc_cfg))]

use crate::app_config::{AppConfig, StorageBackend};
use crate::handlers::*;
use crate::upload::{
    spawn_sweeper, ArtifactStore, ChunkRepository, FilesystemChunkRepository,
    InMemoryChunkRepository, UploadCoordinator,
};
use axum::extract::DefaultBodyLimit;
use axum::http::{header, Method};
use axum::Router;
use clap::ArgMatches;
use directories::ProjectDirs;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use rendezvous::Rendezvous;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

mod app_config;
mod commands;
mod handlers;
mod health;
mod logging;
mod metrics;
mod services;
mod upload;

#[derive(Clone)]
pub struct AppState {
    shutdown_tx: broadcast::Sender<()>,
    coordinator: Arc<UploadCoordinator>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let matches = commands::build_command().get_matches();
    logging::initialize_from_matches(&matches);

    info!("Hi. 👋");

    let dirs = match ProjectDirs::from("io.github", "sunsided", "stitchery") {
        Some(dirs) => dirs,
        None => {
            error!("Could not determine the project directories");
            return ExitCode::FAILURE;
        }
    };

    let cfg = match AppConfig::load(dirs.config_local_dir(), &matches) {
        Ok(config) => config,
        Err(_) => {
            return ExitCode::FAILURE;
        }
    };

    let coordinator = match build_coordinator(&cfg).await {
        Ok(coordinator) => Arc::new(coordinator),
        Err(e) => {
            error!("Unable to prepare the upload storage: {error:#}", error = e);
            return ExitCode::from(exitcode::CANTCREAT as u8);
        }
    };

    // Provide a signal that can be used to shut down the server.
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    if let Err(e) = register_shutdown_handler(shutdown_tx.clone()) {
        error!("Error setting process termination handler: {error}", error = e);
        return ExitCode::from(exitcode::OSERR as u8);
    }

    // Create a rendezvous channel to ensure all relevant tasks have been shut down.
    let rendezvous = Rendezvous::new();

    match cfg.retention.policy() {
        Some(policy) => {
            let _sweeper = spawn_sweeper(
                coordinator.clone(),
                policy,
                shutdown_tx.subscribe(),
                rendezvous.fork_guard(),
            );
        }
        None => info!("Abandoned sessions are kept until completed"),
    }

    // The application state is shared with the Axum servers.
    let app_state = AppState {
        shutdown_tx: shutdown_tx.clone(),
        coordinator,
    };

    let exit_code = serve_requests(matches, &cfg, app_state).await.err();

    // If all servers are shut down, ensure the news is broadcast as well.
    stop_all_servers(shutdown_tx);
    rendezvous.rendezvous_async().await.ok();

    info!("Bye. 👋");
    exit_code.unwrap_or(ExitCode::SUCCESS)
}

/// Creates the storage directories and the coordinator on top of them.
async fn build_coordinator(cfg: &AppConfig) -> Result<UploadCoordinator, anyhow::Error> {
    let repository: Arc<dyn ChunkRepository> = match cfg.storage.backend {
        StorageBackend::Filesystem => {
            info!(
                "Storing chunks in {dir}",
                dir = cfg.storage.temp_dir.display()
            );
            Arc::new(FilesystemChunkRepository::new(&cfg.storage.temp_dir).await?)
        }
        StorageBackend::Memory => {
            warn!("Storing chunks in memory; unfinished uploads are lost on restart");
            Arc::new(InMemoryChunkRepository::new())
        }
    };

    info!("Using the {kind} chunk repository", kind = repository.kind());
    info!(
        "Storing merged files in {dir}",
        dir = cfg.storage.complete_dir.display()
    );
    let artifacts = ArtifactStore::new(&cfg.storage.complete_dir).await?;

    Ok(UploadCoordinator::new(
        repository,
        Arc::new(artifacts),
        cfg.limits.upload_limits(),
    ))
}

fn stop_all_servers(shutdown_tx: broadcast::Sender<()>) {
    // We take ownership of this channel so that it'll be closed after.
    shutdown_tx.send(()).ok();
}

fn build_router(cfg: &AppConfig, app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::ORIGIN, header::CONTENT_LENGTH, header::CONTENT_TYPE]);

    Router::new()
        .map_chunk_endpoints()
        .map_metrics_endpoint()
        .map_shutdown_endpoint()
        .map_health_endpoints()
        .with_state(app_state)
        .layer(DefaultBodyLimit::max(cfg.limits.max_chunk_size_bytes))
        .layer(cors)
        .layer(services::HttpCallMetricsLayer::default())
}

async fn serve_requests(
    matches: ArgMatches,
    cfg: &AppConfig,
    app_state: AppState,
) -> Result<(), ExitCode> {
    let shutdown_tx = app_state.shutdown_tx.clone();
    let app = build_router(cfg, app_state);

    // Get the HTTP socket addresses to bind on.
    let http_sockets: Vec<SocketAddr> = matches
        .get_many("bind_http")
        .into_iter()
        .flatten()
        .cloned()
        .collect();

    let mut servers = FuturesUnordered::new();
    for addr in http_sockets {
        let mut shutdown_rx = shutdown_tx.subscribe();

        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                info!("Now listening on http://{addr}", addr = addr);
                let server = axum::serve(listener, app.clone().into_make_service())
                    .with_graceful_shutdown(async move {
                        shutdown_rx.recv().await.ok();
                    });
                servers.push(async move {
                    if let Err(e) = server.await {
                        error!("Server on {addr} failed: {error}", error = e);
                    }
                });
            }
            Err(e) => {
                error!("Unable to bind to {addr}: {error}", addr = addr, error = e);

                // No servers are currently running since no await was called on any
                // of them yet. Therefore, exiting here is "graceful".
                return Err(ExitCode::from(exitcode::NOPERM as u8));
            }
        };
    }

    // Wait for all servers to stop.
    let mut exit_code = None;
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = servers.next() => {
            error!("Server task exited unexpectedly");
            exit_code = Some(ExitCode::FAILURE);
        },
        _ = shutdown_rx.recv() => {
            warn!("Stopping condition met, exiting...");
        }
    }

    // Ensure that all other servers also shut down in presence
    // of an error of any one of them.
    shutdown_tx.send(()).ok();
    while servers.next().await.is_some() {}

    if let Some(exit_code) = exit_code {
        Err(exit_code)
    } else {
        Ok(())
    }
}

fn register_shutdown_handler(shutdown_tx: broadcast::Sender<()>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        warn!("Initiating shutdown from OS");
        shutdown_tx.send(()).ok();
    })
}
