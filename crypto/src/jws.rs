// Licensed under the Apache-2.0 license

//! Flattened JSON JWS serialization for ACME requests (RFC 8555 section 6.2).

use crate::{base64url, AccountKey, CryptoError, Jwk};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JwsAlgorithm {
    Rs256,
    Es256,
    Es384,
}

impl JwsAlgorithm {
    pub const fn as_str(self) -> &'static str {
        match self {
            JwsAlgorithm::Rs256 => "RS256",
            JwsAlgorithm::Es256 => "ES256",
            JwsAlgorithm::Es384 => "ES384",
        }
    }
}

/// How the signer identifies itself in the protected header.
///
/// `newAccount` must embed the JWK; every later request names the account
/// URL instead.
#[derive(Debug, Clone, Copy)]
pub enum JwsKeyId<'a> {
    Jwk,
    Kid(&'a str),
}

#[derive(Serialize)]
struct ProtectedHeader<'a> {
    alg: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<&'a str>,
    nonce: &'a str,
    url: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRequest {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

/// Signs an ACME request body.
///
/// # Arguments
///
/// * `key` - Account key.
/// * `key_id` - Whether to embed the JWK or reference the account URL.
/// * `nonce` - Fresh anti-replay nonce from the CA.
/// * `url` - Target URL; must equal the request URL.
/// * `payload` - JSON payload, or `None` for a POST-as-GET request.
pub fn sign(
    key: &AccountKey,
    key_id: JwsKeyId,
    nonce: &str,
    url: &str,
    payload: Option<&serde_json::Value>,
) -> Result<SignedRequest, CryptoError> {
    let (jwk, kid) = match key_id {
        JwsKeyId::Jwk => (Some(key.jwk()), None),
        JwsKeyId::Kid(kid) => (None, Some(kid)),
    };
    let header = ProtectedHeader {
        alg: key.jws_algorithm().as_str(),
        jwk,
        kid,
        nonce,
        url,
    };

    let protected = base64url(&serde_json::to_vec(&header)?);
    let payload = match payload {
        Some(value) => base64url(&serde_json::to_vec(value)?),
        None => String::new(),
    };
    let signing_input = format!("{protected}.{payload}");
    let signature = base64url(&key.sign(signing_input.as_bytes())?);

    Ok(SignedRequest {
        protected,
        payload,
        signature,
    })
}
