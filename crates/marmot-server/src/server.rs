//! Process entry point: load config (or dump it and exit), open the
//! database, wire [`marmot_server::Services`], and serve the HTTP API
//! until a shutdown signal drains in-flight work (spec.md §6).

use marmot_server::api::{combined_routes, make_open_api_service};
use marmot_server::config::{apply_literal_env_overrides, make_config_loader};
use marmot_server::services::Services;
use marmot_common::tracing_init::{init_tracing_with_default_env_filter, TracingConfig};
use poem::listener::TcpListener;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

fn main() -> ExitCode {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start tokio runtime: {err}");
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(async_main())
}

async fn async_main() -> ExitCode {
    let loader = make_config_loader();
    let Some(mut config) = loader.load_or_dump_config() else {
        return ExitCode::SUCCESS;
    };
    apply_literal_env_overrides(&mut config);

    init_tracing_with_default_env_filter(&TracingConfig {
        default_level: "info".to_string(),
        json: false,
    });

    if std::env::args().any(|arg| arg == "--dump-openapi-yaml") {
        return dump_openapi_yaml().await;
    }

    let services = match Services::new(config).await {
        Ok(services) => services,
        Err(err) => {
            tracing::error!(%err, "failed to start marmot-server");
            return ExitCode::FAILURE;
        }
    };

    let bind_addr = services.config.bind_addr.clone();
    let cancel = CancellationToken::new();
    let background = services.spawn_background_tasks(cancel.clone());

    let app = combined_routes(&services);

    let server = poem::Server::new(TcpListener::bind(&bind_addr)).run_with_graceful_shutdown(
        app,
        shutdown_signal(),
        None,
    );

    tracing::info!(%bind_addr, "marmot-server listening");
    let result = server.await;

    cancel.cancel();
    for handle in background {
        let _ = handle.await;
    }
    services.shutdown().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "http server exited with an error");
            ExitCode::FAILURE
        }
    }
}

/// Builds a throwaway, unconnected-to-production [`Services`] purely to
/// print the OpenAPI spec — mirrors the teacher's `dump_openapi_yaml`.
async fn dump_openapi_yaml() -> ExitCode {
    let config = marmot_server::config::ServerConfig { core: allow_dump_core(), ..Default::default() };
    match Services::new(config).await {
        Ok(services) => {
            println!("{}", make_open_api_service(&services).spec_yaml());
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("failed to build services for --dump-openapi-yaml: {err}");
            ExitCode::FAILURE
        }
    }
}

fn allow_dump_core() -> marmot_common::config::CoreConfig {
    marmot_common::config::CoreConfig { allow_unencrypted: true, ..Default::default() }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

