/*!
 * # Request Identity
 *
 * Users are authenticated by an external identity provider that issues
 * HS256 JWTs signed with a secret shared with this service. This module
 * only verifies those tokens and turns them into explicit identities that
 * handlers pass down to the services:
 *
 * - [`AuthUser`] for endpoints that require a signed-in user
 * - [`CartIdentity`] for cart endpoints, which also accept an anonymous
 *   session token
 */

use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::errors::ErrorResponse;

/// Role granting access to the admin endpoints
pub const ADMIN_ROLE: &str = "ADMIN";

/// Header carrying the anonymous cart token
pub const SESSION_HEADER: &str = "x-session-id";

const MAX_SESSION_TOKEN_LEN: usize = 128;

/// Claims issued by the identity provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
}

/// Authenticated user resolved from a bearer token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub roles: Vec<String>,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(ADMIN_ROLE))
    }
}

/// Key a cart is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CartIdentity {
    User(Uuid),
    Session(String),
}

impl CartIdentity {
    /// Stable string used for per-cart serialization.
    pub fn lock_key(&self) -> String {
        match self {
            CartIdentity::User(id) => format!("cart:user:{}", id),
            CartIdentity::Session(token) => format!("cart:session:{}", token),
        }
    }

    /// Validates a client-supplied session token.
    pub fn session(token: &str) -> Result<Self, AuthError> {
        let token = token.trim();
        if token.is_empty() || token.len() > MAX_SESSION_TOKEN_LEN {
            return Err(AuthError::InvalidSession);
        }
        Ok(CartIdentity::Session(token.to_string()))
    }
}

impl fmt::Display for CartIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CartIdentity::User(id) => write!(f, "user:{}", id),
            CartIdentity::Session(_) => write!(f, "session"),
        }
    }
}

impl From<&AuthUser> for CartIdentity {
    fn from(user: &AuthUser) -> Self {
        CartIdentity::User(user.user_id)
    }
}

/// Verifies bearer tokens against the shared secret
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 30;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthUser, AuthError> {
        let claims = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken,
            })?
            .claims;

        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AuthError::InvalidToken)?;
        Ok(AuthUser {
            user_id,
            roles: claims.roles,
        })
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("No authentication token provided")]
    MissingToken,

    #[error("Invalid authentication token")]
    InvalidToken,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Insufficient permissions")]
    InsufficientPermissions,

    #[error("A bearer token or session id is required")]
    MissingIdentity,

    #[error("Invalid session id")]
    InvalidSession,
}

impl AuthError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            Self::MissingToken => (StatusCode::UNAUTHORIZED, "AUTH_MISSING_TOKEN"),
            Self::InvalidToken => (StatusCode::UNAUTHORIZED, "AUTH_INVALID_TOKEN"),
            Self::TokenExpired => (StatusCode::UNAUTHORIZED, "AUTH_TOKEN_EXPIRED"),
            Self::InsufficientPermissions => {
                (StatusCode::FORBIDDEN, "AUTH_INSUFFICIENT_PERMISSIONS")
            }
            Self::MissingIdentity => (StatusCode::BAD_REQUEST, "AUTH_MISSING_IDENTITY"),
            Self::InvalidSession => (StatusCode::BAD_REQUEST, "AUTH_INVALID_SESSION"),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();
        let body = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: code.to_string(),
            message: self.to_string(),
            request_id: crate::telemetry::current_request_id().map(|rid| rid.0),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        (status, Json(body)).into_response()
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

fn session_token(parts: &Parts) -> Option<String> {
    if let Some(value) = parts
        .headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        return Some(value.to_string());
    }

    parts.uri.query().and_then(|query| {
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == "session_id").then(|| value.to_string())
        })
    })
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    Arc<TokenVerifier>: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(AuthError::MissingToken)?;
        let verifier = Arc::<TokenVerifier>::from_ref(state);
        verifier.verify(token).map_err(|e| {
            debug!("Rejected bearer token: {}", e);
            e
        })
    }
}

/// Requires an authenticated user holding the admin role
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthUser);

#[async_trait]
impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
    Arc<TokenVerifier>: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(AuthError::InsufficientPermissions);
        }
        Ok(AdminUser(user))
    }
}

/// A bearer token wins; otherwise the anonymous session token is used.
/// An invalid bearer token is rejected rather than downgraded to a session.
#[async_trait]
impl<S> FromRequestParts<S> for CartIdentity
where
    S: Send + Sync,
    Arc<TokenVerifier>: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if bearer_token(parts).is_some() {
            let user = AuthUser::from_request_parts(parts, state).await?;
            return Ok(CartIdentity::User(user.user_id));
        }

        match session_token(parts) {
            Some(token) => CartIdentity::session(&token),
            None => Err(AuthError::MissingIdentity),
        }
    }
}
