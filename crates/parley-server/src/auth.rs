//! Handshake authentication.
//!
//! Every upgrade request declares the conversation it wants to join and the
//! principal it claims to be, and presents a bearer credential. The
//! credential is verified once, under a deadline, and the principal it names
//! must be exactly the declared one. All of this happens before the
//! transport is upgraded, so a rejected request never reaches the broker.

use async_trait::async_trait;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use parley_core::message::validate_conversation_id;
use parley_core::PrincipalId;
use parley_protocol::{Version, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// An authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Principal id taken from the credential.
    pub id: PrincipalId,
}

/// Credential verification errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The credential is malformed, forged, or fails a claim check.
    #[error("Invalid token: {0}")]
    Invalid(String),

    /// The credential has expired.
    #[error("Token expired")]
    Expired,
}

/// Verifies bearer credentials.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify a credential and extract its principal.
    async fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

/// JWT claims carried by a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Principal id.
    pub sub: String,
    /// Expiry, seconds since the Unix epoch.
    pub exp: u64,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// HS256 JWT verifier.
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier for tokens signed with `secret`.
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Require a specific `iss` claim.
    #[must_use]
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    /// Require a specific `aud` claim.
    #[must_use]
    pub fn with_audience(mut self, audience: &str) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        self
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            },
        )?;

        if data.claims.sub.is_empty() {
            return Err(AuthError::Invalid("empty subject".to_string()));
        }
        Ok(Principal {
            id: data.claims.sub,
        })
    }
}

/// Query parameters of an upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct HandshakeQuery {
    pub conversation_id: Option<String>,
    pub user_id: Option<String>,
    pub version: Option<String>,
    pub token: Option<String>,
}

/// A normalized upgrade request.
#[derive(Debug, Clone, Default)]
pub struct HandshakeRequest {
    /// Room the client wants to join.
    pub conversation_id: String,
    /// Principal the client claims to be.
    pub user_id: String,
    /// Protocol version requested by the client.
    pub version: Option<String>,
    /// Bearer credential.
    pub token: Option<String>,
}

impl HandshakeRequest {
    /// Build a request from query parameters and headers.
    ///
    /// An `Authorization: Bearer` header takes precedence over a `token`
    /// query parameter.
    #[must_use]
    pub fn from_parts(query: HandshakeQuery, headers: &HeaderMap) -> Self {
        let token = bearer_token(headers).map(str::to_string).or(query.token);
        Self {
            conversation_id: query.conversation_id.unwrap_or_default(),
            user_id: query.user_id.unwrap_or_default(),
            version: query.version,
            token,
        }
    }
}

/// Extract a bearer token from the `Authorization` header.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Reasons a handshake is rejected.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The request is missing or has an invalid room or principal id.
    #[error("Invalid request: {0}")]
    InvalidRequest(&'static str),

    /// The requested protocol version is not supported.
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// No credential was presented.
    #[error("Missing credential")]
    MissingCredential,

    /// The credential failed verification.
    #[error("Invalid credential: {0}")]
    InvalidCredential(#[from] AuthError),

    /// The credential names a different principal than the request.
    #[error("Credential principal {authenticated} does not match declared principal {declared}")]
    AuthenticationMismatch {
        /// Principal declared by the request.
        declared: String,
        /// Principal named by the credential.
        authenticated: String,
    },

    /// Verification did not complete in time.
    #[error("Authentication timed out")]
    AuthenticationTimeout,
}

impl HandshakeError {
    /// HTTP status for the rejection.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            HandshakeError::InvalidRequest(_) | HandshakeError::UnsupportedVersion(_) => {
                StatusCode::BAD_REQUEST
            }
            HandshakeError::MissingCredential | HandshakeError::InvalidCredential(_) => {
                StatusCode::UNAUTHORIZED
            }
            HandshakeError::AuthenticationMismatch { .. } => StatusCode::FORBIDDEN,
            HandshakeError::AuthenticationTimeout => StatusCode::REQUEST_TIMEOUT,
        }
    }

    /// Short name, used for logs and metrics.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            HandshakeError::InvalidRequest(_) => "invalid_request",
            HandshakeError::UnsupportedVersion(_) => "unsupported_version",
            HandshakeError::MissingCredential => "missing_credential",
            HandshakeError::InvalidCredential(_) => "invalid_credential",
            HandshakeError::AuthenticationMismatch { .. } => "authentication_mismatch",
            HandshakeError::AuthenticationTimeout => "authentication_timeout",
        }
    }
}

impl IntoResponse for HandshakeError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": self.reason(),
            "message": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}

/// Authenticate an upgrade request.
///
/// # Errors
///
/// Returns the first check that fails; the request must then be rejected
/// without upgrading.
pub async fn authenticate(
    verifier: &dyn TokenVerifier,
    request: &HandshakeRequest,
    deadline: Duration,
) -> Result<Principal, HandshakeError> {
    validate_conversation_id(&request.conversation_id).map_err(HandshakeError::InvalidRequest)?;
    if request.user_id.is_empty() {
        return Err(HandshakeError::InvalidRequest("user_id is required"));
    }

    if let Some(requested) = &request.version {
        let version: Version = requested
            .parse()
            .map_err(|_| HandshakeError::UnsupportedVersion(requested.clone()))?;
        if !PROTOCOL_VERSION.is_compatible_with(&version) {
            return Err(HandshakeError::UnsupportedVersion(requested.clone()));
        }
    }

    let token = request
        .token
        .as_deref()
        .filter(|token| !token.is_empty())
        .ok_or(HandshakeError::MissingCredential)?;

    let principal = verify_within(verifier, token, deadline).await?;

    if principal.id != request.user_id {
        return Err(HandshakeError::AuthenticationMismatch {
            declared: request.user_id.clone(),
            authenticated: principal.id,
        });
    }
    Ok(principal)
}

/// Authenticate a plain HTTP request by its `Authorization` header.
///
/// # Errors
///
/// Returns an error if the header is absent or the credential is rejected.
pub async fn authenticate_bearer(
    verifier: &dyn TokenVerifier,
    headers: &HeaderMap,
    deadline: Duration,
) -> Result<Principal, HandshakeError> {
    let token = bearer_token(headers).ok_or(HandshakeError::MissingCredential)?;
    verify_within(verifier, token, deadline).await
}

async fn verify_within(
    verifier: &dyn TokenVerifier,
    token: &str,
    deadline: Duration,
) -> Result<Principal, HandshakeError> {
    match tokio::time::timeout(deadline, verifier.verify(token)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(HandshakeError::AuthenticationTimeout),
    }
}
