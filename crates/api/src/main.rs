use anyhow::Context;

use dispatchgate_infra::DispatchConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dispatchgate_observability::init();

    let config = DispatchConfig::from_env().context("invalid configuration")?;
    if config.uses_dev_jwt_secret() {
        tracing::warn!("JWT_SECRET not set; using insecure dev default");
    }
    if config.uses_dev_webhook_secret() {
        tracing::warn!("WORKFLOW_WEBHOOK_SECRET not set; webhooks are signed with a dev key");
    }

    let bind_addr = config.bind_addr;
    let app = dispatchgate_api::app::build_app(config).await?;

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
