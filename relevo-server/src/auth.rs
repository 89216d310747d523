//! Authentication handshake and the token-validation oracle.
//!
//! A connection authenticates with either a bearer token (validated by the
//! external oracle) or the legacy `userId`/`userType` payload. Success binds
//! an [`Identity`] to the connection, assigns its role groups and personal
//! group, and announces `user_connected` to everyone else.
//!
//! Oracle failures are typed and propagated verbatim to the client — they
//! are never swallowed or retried here.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Deserialize;

use crate::registry::{AuthSource, Identity, RawId};
use crate::rooms::personal_group;
use crate::server::RelayState;

/// User types accepted on the legacy (token-less) path.
const LEGACY_USER_TYPES: [&str; 5] = ["cobrador", "client", "manager", "admin", "chofer"];

/// Credential payload from the client's `authenticate` event.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthRequest {
    pub token: Option<String>,
    pub user_id: Option<RawId>,
    pub user_type: Option<String>,
    pub user_name: Option<String>,
}

/// Typed handshake rejection. The wire code of each variant is part of the
/// client contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("token format is invalid")]
    InvalidFormat,
    #[error("token is malformed")]
    MalformedToken,
    #[error("token not found")]
    TokenNotFound,
    #[error("token expired")]
    TokenExpired,
    #[error("user associated with the token not found")]
    UserNotFound,
    #[error("user is inactive")]
    UserInactive,
    #[error("token validation failed")]
    ValidationError,
    #[error("userType must be one of: cobrador, client, manager, admin, chofer")]
    InvalidUserType,
    #[error("token or userId required")]
    MissingAuth,
    #[error("connection closed during authentication")]
    ConnectionClosed,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidFormat => "INVALID_FORMAT",
            AuthError::MalformedToken => "MALFORMED_TOKEN",
            AuthError::TokenNotFound => "TOKEN_NOT_FOUND",
            AuthError::TokenExpired => "TOKEN_EXPIRED",
            AuthError::UserNotFound => "USER_NOT_FOUND",
            AuthError::UserInactive => "USER_INACTIVE",
            AuthError::ValidationError => "VALIDATION_ERROR",
            AuthError::InvalidUserType => "INVALID_USERTYPE",
            AuthError::MissingAuth => "MISSING_AUTH",
            AuthError::ConnectionClosed => "CONNECTION_CLOSED",
        }
    }

    fn from_code(code: &str) -> Self {
        match code {
            "INVALID_FORMAT" => AuthError::InvalidFormat,
            "MALFORMED_TOKEN" => AuthError::MalformedToken,
            "TOKEN_NOT_FOUND" => AuthError::TokenNotFound,
            "TOKEN_EXPIRED" => AuthError::TokenExpired,
            "USER_NOT_FOUND" => AuthError::UserNotFound,
            "USER_INACTIVE" => AuthError::UserInactive,
            _ => AuthError::ValidationError,
        }
    }
}

/// Verified identity data returned by the oracle.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OracleUser {
    pub user_id: RawId,
    pub user_name: String,
    pub user_type: String,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OracleResponse {
    valid: bool,
    #[serde(default)]
    code: Option<String>,
    #[serde(flatten)]
    user: Option<OracleUser>,
}

type OracleFuture<'a> = Pin<Box<dyn Future<Output = Result<OracleUser, AuthError>> + Send + 'a>>;

/// The external token-validation oracle: given a token, returns validity
/// plus identity and roles. The DB-backed implementation lives behind the
/// backend's HTTP API; tests use the fixed variant.
#[derive(Clone)]
pub enum TokenOracle {
    Http(HttpOracle),
    Fixed(FixedOracle),
}

impl TokenOracle {
    /// Oracle backed by the backend's HTTP token-validation endpoint.
    pub fn http(url: String, timeout: Duration) -> Self {
        TokenOracle::Http(HttpOracle::new(url, timeout))
    }

    /// Oracle with a fixed token table (tests, offline development).
    pub fn fixed(tokens: HashMap<String, Result<OracleUser, AuthError>>) -> Self {
        TokenOracle::Fixed(FixedOracle {
            tokens,
            delay: None,
        })
    }

    /// Fixed oracle that answers after `delay` — for timeout and
    /// cancellation tests.
    pub fn fixed_with_delay(
        tokens: HashMap<String, Result<OracleUser, AuthError>>,
        delay: Duration,
    ) -> Self {
        TokenOracle::Fixed(FixedOracle {
            tokens,
            delay: Some(delay),
        })
    }

    pub fn validate<'a>(&'a self, token: &'a str) -> OracleFuture<'a> {
        match self {
            TokenOracle::Http(oracle) => Box::pin(oracle.validate(token)),
            TokenOracle::Fixed(oracle) => Box::pin(oracle.validate(token)),
        }
    }
}

/// HTTP oracle client. Transport failures and non-JSON responses surface as
/// `VALIDATION_ERROR`; the connection stays unauthenticated and the client
/// may retry.
#[derive(Clone)]
pub struct HttpOracle {
    client: reqwest::Client,
    url: String,
}

impl HttpOracle {
    fn new(url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client, url }
    }

    async fn validate(&self, token: &str) -> Result<OracleUser, AuthError> {
        // Cheap shape checks before the round trip: tokens are "<id>|<secret>".
        if !token.contains('|') {
            return Err(AuthError::InvalidFormat);
        }
        let mut parts = token.splitn(2, '|');
        let (id, secret) = (parts.next().unwrap_or(""), parts.next().unwrap_or(""));
        if id.is_empty() || secret.is_empty() {
            return Err(AuthError::MalformedToken);
        }

        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("Token oracle unreachable: {e}");
                AuthError::ValidationError
            })?;

        let body: OracleResponse = response.json().await.map_err(|e| {
            tracing::warn!("Token oracle returned unparseable body: {e}");
            AuthError::ValidationError
        })?;

        if !body.valid {
            let code = body.code.as_deref().unwrap_or("VALIDATION_ERROR");
            return Err(AuthError::from_code(code));
        }
        body.user.ok_or(AuthError::ValidationError)
    }
}

/// In-memory oracle with a fixed token table.
#[derive(Clone)]
pub struct FixedOracle {
    tokens: HashMap<String, Result<OracleUser, AuthError>>,
    delay: Option<Duration>,
}

impl FixedOracle {
    async fn validate(&self, token: &str) -> Result<OracleUser, AuthError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.tokens
            .get(token)
            .cloned()
            .unwrap_or(Err(AuthError::TokenNotFound))
    }
}

/// Outcome of a successful handshake, echoed back to the client.
#[derive(Debug)]
pub struct AuthOutcome {
    pub identity: Identity,
    pub auth_method: &'static str,
}

/// Run the handshake for a connection.
///
/// Token path first, legacy path second, `MISSING_AUTH` otherwise. On
/// success the connection is registered, joined to its role groups and
/// personal group, and `user_connected` is broadcast to every *other*
/// connection.
///
/// The oracle round trip is a suspension point: the connection holds no
/// identity and belongs to no group while it is pending, and a disconnect
/// during the wait abandons the handshake without registering.
pub async fn authenticate(
    state: &RelayState,
    conn_id: &str,
    request: AuthRequest,
) -> Result<AuthOutcome, AuthError> {
    let resolved = resolve_credentials(state, &request).await?;

    // A handshake that outlived its connection must not register — the
    // disconnect already won.
    if !state.registry.is_attached(conn_id) {
        tracing::info!(%conn_id, "Connection closed while authentication was pending");
        return Err(AuthError::ConnectionClosed);
    }

    let meta = state.registry.meta(conn_id);
    let identity = Identity {
        user_id: resolved.user_id,
        user_name: resolved.user_name,
        user_type: resolved.user_type,
        user_email: resolved.user_email,
        roles: resolved.roles,
        source: resolved.source,
        token_validated: resolved.token_validated,
        connected_at: chrono::Utc::now(),
    };

    // Re-authentication replaces the previous identity wholesale: vacate
    // every group before joining the new set.
    if state.registry.lookup(conn_id).is_some() {
        let vacated = state.rooms.leave_all(conn_id);
        tracing::info!(%conn_id, ?vacated, "Re-authentication, previous group membership vacated");
    }

    state.registry.register(conn_id, identity.clone());
    let joined = state
        .rooms
        .assign_role_groups(conn_id, &identity.user_id, &identity.user_type);

    let auth_method = match identity.source {
        AuthSource::Token => "token",
        AuthSource::Legacy => "legacy",
    };
    tracing::info!(
        %conn_id,
        user_id = %identity.user_id,
        user_type = %identity.user_type,
        method = auth_method,
        groups = ?joined,
        "User authenticated"
    );

    let mut announcement = identity.public_fields();
    if let (Some(meta), Some(obj)) = (meta, announcement.as_object_mut()) {
        obj.insert("clientIP".into(), meta.remote_addr.into());
    }
    state
        .dispatcher
        .broadcast_except(conn_id, "user_connected", &announcement);

    Ok(AuthOutcome {
        identity,
        auth_method,
    })
}

struct ResolvedCredentials {
    user_id: String,
    user_name: String,
    user_type: String,
    user_email: Option<String>,
    roles: Vec<String>,
    source: AuthSource,
    token_validated: bool,
}

async fn resolve_credentials(
    state: &RelayState,
    request: &AuthRequest,
) -> Result<ResolvedCredentials, AuthError> {
    if let Some(token) = request.token.as_deref().filter(|t| !t.is_empty()) {
        let deadline = state.oracle_timeout();
        let user = match tokio::time::timeout(deadline, state.oracle.validate(token)).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(timeout = ?deadline, "Token oracle timed out");
                return Err(AuthError::ValidationError);
            }
        };
        return Ok(ResolvedCredentials {
            user_id: user.user_id.normalized(),
            user_name: user.user_name,
            user_type: user.user_type,
            user_email: user.user_email,
            roles: user.roles,
            source: AuthSource::Token,
            token_validated: true,
        });
    }

    if let Some(user_id) = &request.user_id {
        let user_type = request
            .user_type
            .as_deref()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| LEGACY_USER_TYPES.contains(&t.as_str()))
            .ok_or(AuthError::InvalidUserType)?;
        let user_id = user_id.normalized();
        tracing::warn!(%user_id, "Legacy authentication without token");
        return Ok(ResolvedCredentials {
            user_name: request
                .user_name
                .clone()
                .unwrap_or_else(|| format!("Usuario {user_id}")),
            user_id,
            user_type,
            user_email: None,
            roles: Vec::new(),
            source: AuthSource::Legacy,
            token_validated: false,
        });
    }

    Err(AuthError::MissingAuth)
}

/// Tear down a connection: vacate every group, free the identity, drop the
/// outbox sender. Returns the freed identity (with its announcement
/// payload) so the caller can broadcast `user_disconnected`.
pub fn handle_disconnect(state: &RelayState, conn_id: &str) -> Option<serde_json::Value> {
    let vacated = state.rooms.leave_all(conn_id);
    let identity = state.registry.unregister(conn_id);
    let meta = state.registry.meta(conn_id);
    state.registry.detach(conn_id);

    match identity {
        Some(identity) => {
            tracing::info!(
                %conn_id,
                user_id = %identity.user_id,
                user_type = %identity.user_type,
                ?vacated,
                "User disconnected"
            );
            debug_assert!(vacated.contains(&personal_group(&identity.user_id)));
            let mut announcement = identity.public_fields();
            if let (Some(meta), Some(obj)) = (meta, announcement.as_object_mut()) {
                obj.insert("clientIP".into(), meta.remote_addr.into());
            }
            Some(announcement)
        }
        None => {
            tracing::info!(%conn_id, "Unauthenticated connection closed");
            None
        }
    }
}
