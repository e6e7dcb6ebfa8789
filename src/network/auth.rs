//! Connection Approval
//!
//! Decides whether a pending client is admitted. The session asks the
//! injected [`ApprovalAuthority`] once per connection request; the answer
//! may be deferred and given later through `Session::approve` / `Session::deny`.
//!
//! [`TokenApproval`] validates the connection payload as a JWT issued by an
//! external provider (Firebase, Auth0, Supabase, etc.). The session never
//! issues tokens, it only checks them.

use std::collections::{BTreeMap, HashSet};

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::core::hash::hash_with_domain;

use super::transport::ClientId;

/// Domain tag for subject identities.
const SUBJECT_DOMAIN: &[u8] = b"NETSYNC_SUBJECT_V1";

/// Where and as what an approved client's player object spawns.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ApprovalParams {
    /// Prefab index; `None` uses the configured player prefab.
    pub prefab: Option<u32>,
    /// Opaque position payload.
    pub position: [f32; 3],
    /// Opaque Euler rotation payload.
    pub rotation: [f32; 3],
}

/// Outcome of an approval check.
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    /// Admit now.
    Approve(ApprovalParams),
    /// Refuse and disconnect.
    Deny,
    /// Decide later; the approval timeout still applies.
    Defer,
}

/// Admission authority.
pub trait ApprovalAuthority {
    /// Judge a connection request from `client` carrying `payload`.
    fn decide(&mut self, client: ClientId, payload: &[u8]) -> Decision;

    /// `client` left, was rejected or timed out. Drop anything kept for it.
    fn on_disconnect(&mut self, _client: ClientId) {}
}

impl<F> ApprovalAuthority for F
where
    F: FnMut(ClientId, &[u8]) -> Decision,
{
    fn decide(&mut self, client: ClientId, payload: &[u8]) -> Decision {
        self(client, payload)
    }
}

/// Admits everyone.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl ApprovalAuthority for AllowAll {
    fn decide(&mut self, _client: ClientId, _payload: &[u8]) -> Decision {
        Decision::Approve(ApprovalParams::default())
    }
}

/// Refuses everyone.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAll;

impl ApprovalAuthority for DenyAll {
    fn decide(&mut self, _client: ClientId, _payload: &[u8]) -> Decision {
        Decision::Deny
    }
}

/// Never answers. Used when approval is required but no authority was
/// registered, so pending clients run into the timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeferAll;

impl ApprovalAuthority for DeferAll {
    fn decide(&mut self, _client: ClientId, _payload: &[u8]) -> Decision {
        Decision::Defer
    }
}

/// Key used to check token signatures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenKey {
    /// HS256 shared secret.
    Secret(String),
    /// RS256 public key, PEM encoded.
    RsaPem(String),
}

/// Token validation settings.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Signature key; `None` leaves token approval unconfigured.
    pub key: Option<TokenKey>,
    /// Required "iss" claim.
    pub issuer: Option<String>,
    /// Required "aud" claim.
    pub audience: Option<String>,
    /// Clock skew tolerated on "exp", in seconds.
    pub leeway_secs: u64,
    /// Reject tokens without an "exp" claim.
    pub require_expiry: bool,
}

impl AuthConfig {
    /// Settings from `NETSYNC_AUTH_*` variables. A PEM key wins over a secret.
    pub fn from_env() -> Self {
        let key = std::env::var("NETSYNC_AUTH_PUBLIC_KEY_PEM")
            .map(TokenKey::RsaPem)
            .or_else(|_| std::env::var("NETSYNC_AUTH_SECRET").map(TokenKey::Secret))
            .ok();
        Self {
            key,
            issuer: std::env::var("NETSYNC_AUTH_ISSUER").ok(),
            audience: std::env::var("NETSYNC_AUTH_AUDIENCE").ok(),
            leeway_secs: std::env::var("NETSYNC_AUTH_LEEWAY_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            require_expiry: std::env::var("NETSYNC_AUTH_REQUIRE_EXPIRY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }
}

/// Claims read from a connection token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject, the provider's user id.
    pub sub: String,
    /// Expiry, Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    /// Issued at, Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Audience, a string or a list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<serde_json::Value>,
}

impl TokenClaims {
    /// Stable identity for the subject, hex encoded.
    pub fn identity(&self) -> String {
        let digest = hash_with_domain(SUBJECT_DOMAIN, self.sub.as_bytes());
        hex::encode(&digest[..16])
    }
}

/// Token validation errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No signature key configured.
    #[error("token approval not configured")]
    NotConfigured,

    /// Configured key could not be loaded.
    #[error("invalid verification key: {0}")]
    InvalidKey(String),

    /// Not a JWT.
    #[error("malformed token")]
    Malformed,

    /// Signature does not verify.
    #[error("bad token signature")]
    BadSignature,

    /// Past its expiry.
    #[error("token expired")]
    Expired,

    /// Issuer does not match.
    #[error("unexpected issuer")]
    WrongIssuer,

    /// Audience does not match.
    #[error("unexpected audience")]
    WrongAudience,

    /// Required claim missing or empty.
    #[error("missing claim '{0}'")]
    MissingClaim(&'static str),

    /// Any other rejection from the JWT library.
    #[error("token rejected: {0}")]
    Rejected(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidSignature => AuthError::BadSignature,
            ErrorKind::InvalidIssuer => AuthError::WrongIssuer,
            ErrorKind::InvalidAudience => AuthError::WrongAudience,
            ErrorKind::MissingRequiredClaim(claim) if claim == "exp" => AuthError::MissingClaim("exp"),
            ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                AuthError::Malformed
            }
            _ => AuthError::Rejected(err.to_string()),
        }
    }
}

/// Decoding key and validation rules, built once from an [`AuthConfig`].
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Load the key and prepare validation.
    pub fn new(config: &AuthConfig) -> Result<Self, AuthError> {
        let (key, algorithm) = match &config.key {
            Some(TokenKey::RsaPem(pem)) => (
                DecodingKey::from_rsa_pem(pem.as_bytes())
                    .map_err(|e| AuthError::InvalidKey(e.to_string()))?,
                Algorithm::RS256,
            ),
            Some(TokenKey::Secret(secret)) => {
                (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256)
            }
            None => return Err(AuthError::NotConfigured),
        };

        let mut validation = Validation::new(algorithm);
        validation.leeway = config.leeway_secs;
        validation.required_spec_claims = if config.require_expiry {
            HashSet::from(["exp".to_string()])
        } else {
            HashSet::new()
        };
        match &config.issuer {
            Some(issuer) => validation.set_issuer(&[issuer]),
            None => validation.iss = None,
        }
        match &config.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Ok(Self { key, validation })
    }

    /// Check a token and return its claims.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let claims = decode::<TokenClaims>(token, &self.key, &self.validation)?.claims;
        if claims.sub.is_empty() {
            return Err(AuthError::MissingClaim("sub"));
        }
        Ok(claims)
    }
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("algorithms", &self.validation.algorithms)
            .finish_non_exhaustive()
    }
}

/// One-shot validation; prefer [`TokenVerifier`] when checking many tokens.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    TokenVerifier::new(config)?.verify(token)
}

/// Approval authority that treats the connection payload as a JWT.
#[derive(Debug, Clone)]
pub struct TokenApproval {
    verifier: TokenVerifier,
    identities: BTreeMap<ClientId, String>,
}

impl TokenApproval {
    /// Authority for the given settings; fails when no usable key is set.
    pub fn new(config: &AuthConfig) -> Result<Self, AuthError> {
        Ok(Self {
            verifier: TokenVerifier::new(config)?,
            identities: BTreeMap::new(),
        })
    }

    /// Identity of an approved client.
    pub fn identity(&self, client: ClientId) -> Option<&str> {
        self.identities.get(&client).map(String::as_str)
    }

    /// Forget a client, e.g. after it disconnected.
    pub fn forget(&mut self, client: ClientId) {
        self.identities.remove(&client);
    }

    /// Number of clients with a known identity.
    pub fn tracked(&self) -> usize {
        self.identities.len()
    }
}

impl ApprovalAuthority for TokenApproval {
    fn decide(&mut self, client: ClientId, payload: &[u8]) -> Decision {
        let Ok(token) = std::str::from_utf8(payload) else {
            warn!("Client {} sent a non UTF-8 token", client);
            return Decision::Deny;
        };
        match self.verifier.verify(token.trim()) {
            Ok(claims) => {
                let identity = claims.identity();
                info!("Client {} authenticated as {}", client, identity);
                self.identities.insert(client, identity);
                Decision::Approve(ApprovalParams::default())
            }
            Err(e) => {
                warn!("Client {} token rejected: {}", client, e);
                Decision::Deny
            }
        }
    }

    fn on_disconnect(&mut self, client: ClientId) {
        self.forget(client);
    }
}

// =============================================================================
// TESTS
// =============================================================================
