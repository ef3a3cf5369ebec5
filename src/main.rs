use std::sync::Arc;

use anyhow::Context;
use careline::{
    AppState,
    auth::TokenKeys,
    config::Config,
    db, logging,
    notify::{LogPush, PushSink, WebhookPush},
    profiles::{HttpProfiles, ProfileDirectory},
    store::SqliteChatStore,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();
    let cfg = Config::from_env()?;

    let db_pool = db::connect(&cfg.database_url, cfg.db_max_connections)
        .await
        .with_context(|| format!("opening {}", cfg.database_url))?;
    let store = Arc::new(SqliteChatStore::new(db_pool));

    let profiles = ProfileDirectory::new(cfg.profile_service_url.clone().map(HttpProfiles::new));
    let push: Arc<dyn PushSink> = match &cfg.push_webhook_url {
        Some(url) => Arc::new(WebhookPush::new(url.clone())),
        None => {
            warn!("PUSH_WEBHOOK_URL not set, notifications will only be logged");
            Arc::new(LogPush)
        }
    };

    let app_state = AppState::new(
        store,
        TokenKeys::new(cfg.jwt_secret.as_bytes()),
        profiles,
        push,
        cfg.projection_retries,
    );

    let listener = tokio::net::TcpListener::bind(cfg.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.bind_addr))?;
    info!(addr = %cfg.bind_addr, "careline listening");

    axum::serve(listener, careline::router(app_state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("careline stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
