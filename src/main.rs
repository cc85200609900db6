//! AxoLocker server binary.
//!
//! A multi-user file locker: users register or log in, receive a signed
//! session token, and upload, list and delete files inside their own storage
//! directory. The main entry point loads configuration, opens the user store,
//! builds the Axum router and serves it over HTTP or HTTPS.

mod app;
mod atomic;
mod auth;
mod background;
mod config;
mod error;
mod files;
mod http;
mod logging;
mod middleware;
mod password;
mod response;
mod storage;
mod store;
mod tls;
mod token;
mod version;

use axum::extract::Extension;
use axum_server::Handle;
use clap::Parser;
use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use crate::app::{Services, build_router};
use crate::auth::{Authenticator, LoginThrottle};
use crate::background::spawn_background_tasks;
use crate::config::{Args, ConfigError};
use crate::files::UploadConfig;
use crate::http::{ForwardedTrust, RequestScheme, build_cors_layer};
use crate::storage::Storage;
use crate::store::{JsonStore, UserStore};
use crate::token::TokenService;

/// Starts the AxoLocker server and blocks until shutdown.
#[tokio::main]
async fn main() -> ExitCode {
    logging::init_logging();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "server failed to start or stopped with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    let signing_key = config::load_signing_key(&args)?;
    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|_| ConfigError::InvalidHost(args.host.clone()))?;

    let store: Arc<dyn UserStore> =
        Arc::new(JsonStore::open(PathBuf::from(&args.database)).await?);
    let storage = Arc::new(Storage::new(
        PathBuf::from(&args.storage_dir),
        args.upload_max_size,
    ));
    storage.ensure_root().await?;

    let tokens = TokenService::new(&signing_key, Duration::from_secs(args.token_ttl_secs));
    let throttle = Arc::new(LoginThrottle::new(
        Duration::from_secs(args.login_window_secs),
        args.login_max_attempts,
        Duration::from_secs(args.login_lockout_secs),
    ));
    let upload = Arc::new(UploadConfig {
        policy: args.upload_policy,
        temp_ttl: Duration::from_secs(args.upload_temp_ttl_secs),
    });
    let services = Services {
        authenticator: Arc::new(Authenticator::new(tokens, store.clone())),
        store,
        storage: storage.clone(),
        throttle: throttle.clone(),
        upload: upload.clone(),
        forwarded: ForwardedTrust(args.trust_forwarded),
    };
    let request_timeout =
        (args.request_timeout_secs > 0).then(|| Duration::from_secs(args.request_timeout_secs));
    let app = build_router(
        services,
        request_timeout,
        build_cors_layer(args.cors_origins.as_deref()),
    );

    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();
    tokio::spawn(shutdown_signal(handle.clone()));
    spawn_background_tasks(storage.clone(), throttle, upload);

    info!(
        storage = %storage.root_path().display(),
        database = %args.database,
        upload_policy = ?args.upload_policy,
        trust_forwarded = args.trust_forwarded,
        "storage ready"
    );

    match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            let tls_config = tls::load_rustls_config(Path::new(cert), Path::new(key)).await?;
            let app = app.layer(Extension(RequestScheme::Https));
            info!("🔒 Starting HTTPS server at {}", addr);
            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .await?;
        }
        _ => {
            let app = app.layer(Extension(RequestScheme::Http));
            info!("🚀 Starting HTTP server at {}", addr);
            axum_server::bind(addr)
                .handle(handle)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .await?;
        }
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
