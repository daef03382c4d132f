use anyhow::Context;

use taskrelay_infra::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    taskrelay_observability::init();

    let config = AppConfig::from_env().context("failed to load configuration")?;
    let bind_addr = config.bind_addr;

    let app = taskrelay_api::app::build_app(&config).await?;

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
