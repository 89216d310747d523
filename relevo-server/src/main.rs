use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (RELEVO_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("RELEVO_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("relevo_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = relevo_server::config::ServerConfig::parse();
    tracing::info!("Starting notification relay on {}", config.listen_addr);
    if config.backend_key.is_none() {
        tracing::warn!("No backend key configured, notify endpoints are open");
    }
    tracing::info!("Token oracle: {}", config.oracle_url);

    let server = relevo_server::server::Server::new(config);
    server.run().await
}
