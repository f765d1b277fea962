//! Token verification for WebSocket connections

use axum::{
    extract::{Query, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::app::AppState;
use crate::util::time::unix_millis;

type HmacSha256 = Hmac<Sha256>;

/// Claims of a token issued by the accounts service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    pub username: String,
    /// Account id
    #[serde(default)]
    pub id: Option<u64>,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Issued at (Unix timestamp)
    #[serde(default)]
    pub iat: u64,
}

/// Verify an HS256 token and extract claims
pub fn verify_jwt(token: &str, secret: &str) -> Result<JwtClaims, AuthError> {
    let mut parts = token.split('.');
    let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::InvalidToken);
    };

    let header: TokenHeader = URL_SAFE_NO_PAD
        .decode(header_b64)
        .ok()
        .and_then(|raw| serde_json::from_slice(&raw).ok())
        .ok_or(AuthError::InvalidToken)?;
    if header.alg != "HS256" {
        return Err(AuthError::UnsupportedAlgorithm(header.alg));
    }

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::InvalidToken)?;
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(payload_b64.as_bytes());

    let provided_signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| AuthError::InvalidToken)?;
    mac.verify_slice(&provided_signature)
        .map_err(|_| AuthError::InvalidToken)?;

    let payload_json = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| AuthError::InvalidToken)?;
    let claims: JwtClaims =
        serde_json::from_slice(&payload_json).map_err(|_| AuthError::InvalidToken)?;

    if claims.exp < unix_millis() / 1000 {
        return Err(AuthError::TokenExpired);
    }
    if claims.username.trim().is_empty() {
        return Err(AuthError::InvalidToken);
    }

    Ok(claims)
}

#[derive(Deserialize)]
struct TokenHeader {
    alg: String,
}

/// Authentication error types
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing token")]
    MissingToken,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Unsupported token algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

/// Identity attached to a verified connection
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub username: String,
    pub claims: JwtClaims,
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// When a token secret is configured, require a valid token (query `token`
/// or bearer header) and attach the identity to the request
pub async fn ws_auth(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let Some(secret) = state.config.jwt_secret.as_deref() else {
        return Ok(next.run(request).await);
    };

    let token = query
        .token
        .as_deref()
        .or_else(|| bearer.as_ref().map(|TypedHeader(auth)| auth.token()))
        .ok_or(AuthError::MissingToken)?;

    let claims = verify_jwt(token, secret).map_err(|err| {
        warn!(error = %err, "WebSocket auth failed");
        err
    })?;
    debug!(username = %claims.username, "WebSocket token verified");

    request.extensions_mut().insert(AuthenticatedUser {
        username: claims.username.clone(),
        claims,
    });

    Ok(next.run(request).await)
}
