// Gateway entry point.
//
// Exit codes: 0 on normal shutdown, 1 for configuration errors, 2 when the
// control database is unreachable at boot.
use gateway::config::GatewayConfig;
use gateway::{app, observability};
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    let metrics_handle = observability::init_observability();

    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "configuration error");
            std::process::exit(1);
        }
    };

    let control_pool = match PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(config.control_db_options())
        .await
    {
        Ok(pool) => pool,
        Err(err) => {
            tracing::error!(error = %err, "control database unreachable");
            std::process::exit(2);
        }
    };
    if let Err(err) = sqlx::migrate!("./migrations").run(&control_pool).await {
        tracing::error!(error = %err, "control database migrations failed");
        std::process::exit(2);
    }

    let shutdown = CancellationToken::new();
    let metrics_bind = config.metrics_bind;
    let bind_addr = config.bind_addr;
    let app_name = config.app_name.clone();
    let state = match app::build(config, control_pool, shutdown.clone()).await {
        Ok(state) => state,
        Err(err) => {
            tracing::error!(error = %err, "gateway bootstrap failed");
            std::process::exit(1);
        }
    };

    tokio::spawn(async move {
        if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
            tracing::warn!(error = %err, "metrics listener exited");
        }
    });

    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(addr = %bind_addr, error = %err, "cannot bind gateway listener");
            std::process::exit(1);
        }
    };
    tracing::info!(app = %app_name, addr = %bind_addr, "gateway started");

    let router = app::api_router(state.clone());
    let serve = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal());
    if let Err(err) = serve.await {
        tracing::error!(error = %err, "server error");
    }

    // Drain every tenant: sessions close with GOING_AWAY, replicators stop,
    // pools release.
    tracing::info!("draining tenants");
    state.supervisors.drain_all().await;
    shutdown.cancel();
    tracing::info!("gateway stopped");
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
