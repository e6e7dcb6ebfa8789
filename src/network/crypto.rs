//! Key Exchange
//!
//! Ephemeral x25519 agreement run once per admitted client, with an optional
//! ed25519 signature over `SHA-512(server_share)` so clients can pin the
//! server identity. The resulting shared secret is stretched into a
//! [`SessionKey`] with a domain-separated SHA-256.
//!
//! Flow:
//! 1. client: [`ClientHandshake::new`] → public share in ConnectionRequest
//! 2. server: [`server_respond`] → key + share (+ signature) in ConnectionApproved
//! 3. client: [`ClientHandshake::finish`] → same key, or an error that makes
//!    the client drop the connection

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use sha2::{Digest, Sha512};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::hash::{DomainHasher, SESSION_KEY_DOMAIN};

/// Length of an x25519 public share.
pub const PUBLIC_SHARE_LEN: usize = 32;

/// Handshake failures. All of them end the connection attempt.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// Public share has the wrong length.
    #[error("invalid public key share ({0} bytes)")]
    InvalidPublicKey(usize),

    /// Share is a low-order point and yields a predictable secret.
    #[error("non-contributory key share")]
    NonContributory,

    /// Signature bytes are malformed.
    #[error("malformed signature")]
    MalformedSignature,

    /// Signature does not match the trusted server key.
    #[error("key share signature mismatch")]
    SignatureMismatch,

    /// Signing is on but no trusted server key is configured.
    #[error("no trusted server key configured")]
    MissingVerifyingKey,
}

/// Symmetric key derived from one key exchange.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    fn derive(shared: &SharedSecret) -> Self {
        let mut hasher = DomainHasher::new(SESSION_KEY_DOMAIN);
        hasher.update_bytes(shared.as_bytes());
        Self(hasher.finalize())
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short hex fingerprint, safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha512::digest(self.0);
        hex::encode(&digest[..4])
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({})", self.fingerprint())
    }
}

/// Client half of an in-flight key exchange.
pub struct ClientHandshake {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl fmt::Debug for ClientHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandshake")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

impl Default for ClientHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientHandshake {
    /// Generate a fresh ephemeral key pair.
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Share to put in the connection request.
    pub fn public_share(&self) -> [u8; PUBLIC_SHARE_LEN] {
        self.public.to_bytes()
    }

    /// Complete the exchange with the server's response.
    ///
    /// `verifier` is `Some` exactly when signing is enabled; the signature
    /// is checked before the secret is computed.
    pub fn finish(
        self,
        server_share: &[u8],
        signature: Option<&[u8]>,
        verifier: Option<Option<&VerifyingKey>>,
    ) -> Result<SessionKey, HandshakeError> {
        if let Some(verifier) = verifier {
            let key = verifier.ok_or(HandshakeError::MissingVerifyingKey)?;
            let signature = signature.ok_or(HandshakeError::MalformedSignature)?;
            verify_share(key, server_share, signature)?;
        }

        let server_public = parse_share(server_share)?;
        let shared = self.secret.diffie_hellman(&server_public);
        if !shared.was_contributory() {
            return Err(HandshakeError::NonContributory);
        }
        Ok(SessionKey::derive(&shared))
    }
}

/// Server output for one client.
#[derive(Debug)]
pub struct ServerShare {
    /// Key stored on the remote client record.
    pub key: SessionKey,
    /// Server public share sent back to the client.
    pub public_share: [u8; PUBLIC_SHARE_LEN],
    /// Signature over `SHA-512(public_share)` when signing.
    pub signature: Option<Vec<u8>>,
}

/// Run the server half of the exchange against a client share.
pub fn server_respond(
    client_share: &[u8],
    signer: Option<&SigningKey>,
) -> Result<ServerShare, HandshakeError> {
    let client_public = parse_share(client_share)?;

    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public_share = PublicKey::from(&secret).to_bytes();
    let shared = secret.diffie_hellman(&client_public);
    if !shared.was_contributory() {
        return Err(HandshakeError::NonContributory);
    }

    let signature = signer.map(|key| sign_share(key, &public_share));

    Ok(ServerShare {
        key: SessionKey::derive(&shared),
        public_share,
        signature,
    })
}

/// Sign `SHA-512(share)`.
pub fn sign_share(key: &SigningKey, share: &[u8]) -> Vec<u8> {
    let digest = Sha512::digest(share);
    key.sign(&digest).to_bytes().to_vec()
}

/// Check a share signature against a trusted key.
pub fn verify_share(
    key: &VerifyingKey,
    share: &[u8],
    signature: &[u8],
) -> Result<(), HandshakeError> {
    let signature =
        Signature::from_slice(signature).map_err(|_| HandshakeError::MalformedSignature)?;
    let digest = Sha512::digest(share);
    key.verify(&digest, &signature)
        .map_err(|_| HandshakeError::SignatureMismatch)
}

fn parse_share(bytes: &[u8]) -> Result<PublicKey, HandshakeError> {
    let array: [u8; PUBLIC_SHARE_LEN] = bytes
        .try_into()
        .map_err(|_| HandshakeError::InvalidPublicKey(bytes.len()))?;
    Ok(PublicKey::from(array))
}

// =============================================================================
// TESTS
// =============================================================================
