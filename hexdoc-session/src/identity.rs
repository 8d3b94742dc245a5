//! Workspace identity: P-256 key pairs encoded as hex, the auth challenge,
//! and the route/URL encodings built on top of them.
//!
//! ```text
//!   share URL          {origin}/{public_hex}#{private_hex}
//!   relay URL          {relay_base}/ws/{public_hex}?token={signature_hex}
//!
//!   public_hex         SEC1 uncompressed point  04 || X || Y   (130 hex chars)
//!   private_hex        raw scalar                              (64 hex chars)
//!   signature_hex      ECDSA P-256 / SHA-256     r || s        (128 hex chars)
//! ```
//!
//! The private half lives in the URL fragment, which browsers never send
//! to a server. Holding both halves is the capability to read, write and
//! share a workspace.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed string signed to prove possession of a workspace private key.
pub const AUTH_CHALLENGE: &str = "hexdoc-relay-auth-v1";

/// Public half of the degraded-mode identity.
pub const FALLBACK_PUBLIC_HEX: &str = "04ae8f446e602b2d90cc4f29ee5aa4295ea214b9a43871d13801ca319e7e65ed66c4a4b4ec3594a24580373a0f29f78e77f505129e007744b2c93204b8155930e6";

/// Private half of the degraded-mode identity.
pub const FALLBACK_PRIVATE_HEX: &str =
    "3c1f5b6e9a7d2c4f8e0b1a2d3c4e5f60718293a4b5c6d7e8f9a0b1c2d3e4f5a6";

/// Hex decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HexError {
    #[error("hex string has odd length {0}")]
    OddLength(usize),
    #[error("invalid hex character {character:?} at index {index}")]
    InvalidCharacter { character: char, index: usize },
}

impl From<hex::FromHexError> for HexError {
    fn from(e: hex::FromHexError) -> Self {
        match e {
            hex::FromHexError::InvalidHexCharacter { c, index } => HexError::InvalidCharacter {
                character: c,
                index,
            },
            // Length is checked before decoding.
            hex::FromHexError::OddLength | hex::FromHexError::InvalidStringLength => {
                HexError::OddLength(0)
            }
        }
    }
}

/// Trim surrounding whitespace and lower-case a hex string.
pub fn normalize_hex(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

/// Decode a hex string. Either case is accepted; surrounding whitespace is ignored.
pub fn hex_to_bytes(s: &str) -> Result<Vec<u8>, HexError> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err(HexError::OddLength(s.len()));
    }
    Ok(hex::decode(s)?)
}

/// Encode bytes as lower-case hex.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Whether the platform's cryptographic subsystem can be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoSupport {
    Available,
    /// e.g. an insecure browsing context. Sessions run offline on the
    /// fallback identity.
    Unavailable,
}

/// A workspace address plus its capability secret, as hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceKeys {
    pub public_hex: String,
    pub private_hex: String,
}

impl WorkspaceKeys {
    /// Build keys from raw route values, normalizing case and whitespace.
    pub fn new(public_hex: &str, private_hex: &str) -> Self {
        Self {
            public_hex: normalize_hex(public_hex),
            private_hex: normalize_hex(private_hex),
        }
    }

    /// The fixed degraded-mode identity.
    pub fn fallback() -> Self {
        Self::new(FALLBACK_PUBLIC_HEX, FALLBACK_PRIVATE_HEX)
    }

    pub fn is_fallback(&self) -> bool {
        self.public_hex == FALLBACK_PUBLIC_HEX
    }
}

/// A reconstructed, self-verified P-256 key pair.
#[derive(Clone)]
pub struct WorkspaceKeyPair {
    signing: SigningKey,
    verifying: VerifyingKey,
}

impl std::fmt::Debug for WorkspaceKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceKeyPair")
            .field("public_hex", &self.public_hex())
            .finish_non_exhaustive()
    }
}

impl WorkspaceKeyPair {
    fn from_signing(signing: SigningKey) -> Self {
        let verifying = signing.verifying_key().clone();
        Self { signing, verifying }
    }

    /// Canonical lower-case public hex (uncompressed point).
    pub fn public_hex(&self) -> String {
        bytes_to_hex(self.verifying.to_encoded_point(false).as_bytes())
    }

    /// Canonical lower-case private scalar hex.
    pub fn private_hex(&self) -> String {
        bytes_to_hex(&self.signing.to_bytes())
    }

    /// Canonical hex keys derived from the key material, never from caller input.
    pub fn keys(&self) -> WorkspaceKeys {
        WorkspaceKeys {
            public_hex: self.public_hex(),
            private_hex: self.private_hex(),
        }
    }

    fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.verifying.verify(message, signature).is_ok()
    }
}

/// Derives, validates and signs with workspace key pairs.
#[derive(Debug, Clone, Copy)]
pub struct IdentityCodec {
    support: CryptoSupport,
}

impl Default for IdentityCodec {
    fn default() -> Self {
        Self::new(CryptoSupport::Available)
    }
}

impl IdentityCodec {
    pub fn new(support: CryptoSupport) -> Self {
        Self { support }
    }

    pub fn is_available(&self) -> bool {
        self.support == CryptoSupport::Available
    }

    /// Reconstruct a key pair and prove it by signing the challenge.
    ///
    /// Returns `None` (never an error) for malformed hex, an invalid point
    /// or scalar, a pair whose halves do not belong together, or when the
    /// subsystem is unavailable.
    pub fn import_key_pair(&self, public_hex: &str, private_hex: &str) -> Option<WorkspaceKeyPair> {
        if !self.is_available() {
            return None;
        }

        let public = hex_to_bytes(public_hex).ok()?;
        let private = hex_to_bytes(private_hex).ok()?;

        let verifying = VerifyingKey::from_sec1_bytes(&public).ok()?;
        let signing = SigningKey::from_slice(&private).ok()?;

        let pair = WorkspaceKeyPair { signing, verifying };
        let signature = pair.sign(AUTH_CHALLENGE.as_bytes());
        if !pair.verify(AUTH_CHALLENGE.as_bytes(), &signature) {
            log::debug!("Key pair for {} failed self-verification", normalize_hex(public_hex));
            return None;
        }
        Some(pair)
    }

    /// Sign the auth challenge. Deterministic (RFC 6979), 128 hex chars.
    pub fn sign_challenge(&self, pair: &WorkspaceKeyPair) -> String {
        bytes_to_hex(&pair.sign(AUTH_CHALLENGE.as_bytes()).to_bytes())
    }

    /// Create a fresh key pair and its share URL.
    pub fn generate_pair_and_url(&self, origin: &str) -> Option<(WorkspaceKeyPair, String)> {
        if !self.is_available() {
            return None;
        }
        let pair = WorkspaceKeyPair::from_signing(SigningKey::random(&mut OsRng));
        let url = share_url(origin, &pair.keys());
        Some((pair, url))
    }

    /// The degraded-mode identity. Using it never leads to a connection.
    pub fn fallback_keys(&self) -> WorkspaceKeys {
        WorkspaceKeys::fallback()
    }
}

/// `{origin}/{public_hex}#{private_hex}`
pub fn share_url(origin: &str, keys: &WorkspaceKeys) -> String {
    format!(
        "{}/{}#{}",
        origin.trim_end_matches('/'),
        keys.public_hex,
        keys.private_hex
    )
}

/// `{relay_base}/ws/{public_hex}?token={token}`
pub fn connection_url(relay_base: &str, public_hex: &str, token: &str) -> String {
    format!(
        "{}/ws/{}?token={}",
        relay_base.trim_end_matches('/'),
        public_hex,
        token
    )
}

/// Parse `/{public_hex}` + `#{private_hex}` route parts.
///
/// Case-insensitive; the result is always lower-case. Returns `None` when
/// either half is empty or not even-length hex.
pub fn parse_route(path: &str, fragment: &str) -> Option<WorkspaceKeys> {
    let public = path.trim().trim_start_matches('/').trim_end_matches('/');
    let private = fragment.trim().trim_start_matches('#');
    if public.is_empty() || private.is_empty() {
        return None;
    }
    hex_to_bytes(public).ok()?;
    hex_to_bytes(private).ok()?;
    Some(WorkspaceKeys::new(public, private))
}
