//! Server configuration (CLI flags with env-var fallbacks).

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "relevo-server", about = "Real-time notification relay")]
pub struct ServerConfig {
    /// Address for the HTTP/WebSocket listener.
    #[arg(long, env = "RELEVO_LISTEN_ADDR", default_value = "0.0.0.0:4010")]
    pub listen_addr: String,

    /// Shared secret the backend must present in the `x-backend-key`
    /// header on notify requests. Unset = open relay (development only).
    #[arg(long, env = "RELEVO_BACKEND_KEY")]
    pub backend_key: Option<String>,

    /// Token-validation endpoint of the backend API.
    #[arg(
        long,
        env = "RELEVO_ORACLE_URL",
        default_value = "http://127.0.0.1:8000/api/ws/validate-token"
    )]
    pub oracle_url: String,

    /// Deadline for one oracle round trip, in seconds. A timeout resolves
    /// to VALIDATION_ERROR, it never hangs the handshake.
    #[arg(long, env = "RELEVO_ORACLE_TIMEOUT_SECS", default_value_t = 5)]
    pub oracle_timeout_secs: u64,

    /// Allowed CORS origins. Empty = allow any origin.
    #[arg(long = "cors-origin", env = "RELEVO_CORS_ORIGIN", value_delimiter = ',')]
    pub cors_origin: Vec<String>,

    /// Depth of each connection's outbox. Deliveries beyond a full outbox
    /// are dropped, not queued unboundedly.
    #[arg(long, env = "RELEVO_OUTBOX_DEPTH", default_value_t = 256)]
    pub outbox_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        // Match the CLI defaults so tests and embedders get the same config.
        Self::parse_from(["relevo-server"])
    }
}
