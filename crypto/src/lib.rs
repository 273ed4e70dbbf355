/*++
Licensed under the Apache-2.0 license.
Abstract:
    Account credentials for talking to an ACME certificate authority: the
    persisted account key, its JWK form and thumbprint, and JWS signing.
--*/

pub use account::{AccountKey, AccountKeyStore, KeyKind};
pub use jwk::{key_authorization, key_authorization_digest, Jwk};
pub use jws::{JwsAlgorithm, JwsKeyId, SignedRequest};

mod account;
mod jwk;
pub mod jws;

use base64ct::{Base64UrlUnpadded, Encoding};

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("unable to access account key {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed account key: {0}")]
    Pkcs8(#[from] pkcs8::Error),
    #[error("unsupported private key type: {0}")]
    UnsupportedKeyType(String),
    #[error("signing failed: {0}")]
    Signature(String),
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rsa::Error> for CryptoError {
    fn from(value: rsa::Error) -> Self {
        CryptoError::Signature(value.to_string())
    }
}

/// Encodes `bytes` with the URL-safe alphabet and no padding, as used
/// throughout JOSE.
pub fn base64url(bytes: &[u8]) -> String {
    Base64UrlUnpadded::encode_string(bytes)
}
