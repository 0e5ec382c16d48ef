use std::sync::Arc;

use mcp_stream_server::{
    build_app,
    config::Config,
    logging,
    procedures::DemoProcedures,
    session::{ReplyPolicy, SessionRegistry},
    AppState,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    let bind_socket = config.bind_socket()?;

    if config.transport.reply_policy == ReplyPolicy::FanOut {
        warn!("reply policy is fanout: every response is sent to every open session");
    }

    let state = AppState::new(Arc::new(DemoProcedures::default()), config.transport.clone());
    let registry = Arc::clone(&state.registry);
    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(bind_socket).await?;

    info!(
        bind_addr = %config.bind_addr,
        bind_port = config.bind_port,
        endpoint = %config.transport.endpoint_path,
        reply_policy = ?config.transport.reply_policy,
        "server starting"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;

    info!("server stopped");
    Ok(())
}

/// Waits for Ctrl-C or SIGTERM, then closes every session so open event
/// streams end and graceful shutdown can complete.
async fn shutdown_signal(registry: Arc<SessionRegistry>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    info!(open_sessions = registry.len(), "shutdown requested, closing sessions");
    registry.close_all();
}
