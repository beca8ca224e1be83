use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    fmt().with_env_filter(filter).init();

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    let config = sentra::config::Config::from_env()?;
    info!(
        target: "sentra",
        "Sentra starting: RUST_LOG='{}', http_port={}, session_ttl={}s, refresh_window={}s, inactivity_budget={}s, warning_lead={}s",
        rust_log,
        config.http_port,
        config.policy.session_ttl.as_secs(),
        config.policy.refresh_window.as_secs(),
        config.policy.inactivity_budget.as_secs(),
        config.policy.warning_lead.as_secs()
    );

    sentra::server::run(config).await
}
