use anyhow::Context;
use consult_rtc::config::ConsultConfig;
use consult_rtc::logger::init_tracing;
use consult_rtc::relay::{router, Relay};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ConsultConfig::from_env().context("invalid CONSULT_* configuration")?;
    let addr = config.relay_addr()?;

    let app = router(Relay::new());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Consultation relay listening on {}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
