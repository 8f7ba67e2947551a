//! Admission gate for the WebSocket endpoint.
//!
//! Runs before the socket is upgraded and before any session is touched.
//! Credentials are RS256 JWTs; the verification key is resolved once at
//! startup and an absent key rejects every connection.

use std::fmt;

use axum::{
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("missing credential")]
    MissingCredential,
    #[error("missing game_id")]
    MissingSessionId,
    #[error("verification key not configured")]
    KeyNotConfigured,
    #[error("invalid credential: {0}")]
    InvalidCredential(#[from] jsonwebtoken::errors::Error),
    #[error("credential has no user_id claim")]
    MissingUserId,
}

impl AdmissionError {
    pub fn status(&self) -> StatusCode {
        match self {
            AdmissionError::MissingSessionId => StatusCode::BAD_REQUEST,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let body = match self {
            AdmissionError::MissingCredential => "Missing token",
            AdmissionError::MissingSessionId => "Missing game_id",
            _ => "Invalid token",
        };
        (self.status(), body).into_response()
    }
}

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct AdmissionParams {
    pub token: Option<String>,
    pub game_id: Option<String>,
}

/// Verified caller identity taken from credential claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub is_guest: bool,
    pub display_name: Option<String>,
}

impl Identity {
    /// Name to show in logs: display name when present, user id otherwise.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub identity: Identity,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    user_id: Option<Value>,
    #[serde(default)]
    is_guest: Option<Value>,
    #[serde(default)]
    display_name: Option<Value>,
}

impl Claims {
    fn into_identity(self) -> Result<Identity, AdmissionError> {
        let user_id = match self.user_id {
            Some(Value::String(s)) if !s.is_empty() => s,
            Some(Value::Null) | None => return Err(AdmissionError::MissingUserId),
            Some(Value::String(_)) => return Err(AdmissionError::MissingUserId),
            Some(other) => other.to_string(),
        };

        let is_guest = self.is_guest.and_then(|v| v.as_bool()).unwrap_or(false);

        let display_name = self
            .display_name
            .as_ref()
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Ok(Identity {
            user_id,
            is_guest,
            display_name,
        })
    }
}

#[derive(Clone)]
pub struct JwtVerifier {
    key: Option<DecodingKey>,
    validation: Validation,
}

impl JwtVerifier {
    /// A verifier with no key. Every credential is rejected.
    pub fn absent() -> Self {
        Self {
            key: None,
            validation: Self::validation(),
        }
    }

    pub fn from_rsa_pem(pem: &[u8]) -> Result<Self, jsonwebtoken::errors::Error> {
        Ok(Self {
            key: Some(DecodingKey::from_rsa_pem(pem)?),
            validation: Self::validation(),
        })
    }

    pub fn from_optional_pem(pem: Option<&str>) -> Result<Self, jsonwebtoken::errors::Error> {
        match pem {
            Some(pem) => Self::from_rsa_pem(pem.as_bytes()),
            None => Ok(Self::absent()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }

    pub fn verify(&self, token: &str) -> Result<Identity, AdmissionError> {
        let key = self.key.as_ref().ok_or(AdmissionError::KeyNotConfigured)?;
        let data = decode::<Claims>(token, key, &self.validation)?;
        data.claims.into_identity()
    }

    fn validation() -> Validation {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.algorithms = vec![Algorithm::RS256];
        validation.set_required_spec_claims(&["exp"]);
        validation
    }
}

impl fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("configured", &self.is_configured())
            .finish()
    }
}

/// Credential from the `token` query parameter, falling back to an
/// `Authorization: Bearer` header.
pub fn extract_credential(params: &AdmissionParams, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = params.token.as_deref().filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

pub fn admit(
    verifier: &JwtVerifier,
    params: &AdmissionParams,
    headers: &HeaderMap,
) -> Result<Admission, AdmissionError> {
    let token = extract_credential(params, headers).ok_or(AdmissionError::MissingCredential)?;

    let session_id = params
        .game_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or(AdmissionError::MissingSessionId)?
        .to_string();

    let identity = verifier.verify(&token)?;

    Ok(Admission {
        identity,
        session_id,
    })
}
