// Licensed under the Apache-2.0 license

use crate::{base64url, AccountKey};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Public JSON Web Key (RFC 7517) for the key types an account may use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kty")]
pub enum Jwk {
    #[serde(rename = "RSA")]
    Rsa { n: String, e: String },
    #[serde(rename = "EC")]
    Ec { crv: String, x: String, y: String },
}

impl Jwk {
    pub fn rsa(modulus: &[u8], exponent: &[u8]) -> Jwk {
        Jwk::Rsa {
            n: base64url(strip_leading_zeros(modulus)),
            e: base64url(strip_leading_zeros(exponent)),
        }
    }

    pub fn ec(curve: &str, x: &[u8], y: &[u8]) -> Jwk {
        Jwk::Ec {
            crv: curve.to_string(),
            x: base64url(x),
            y: base64url(y),
        }
    }

    /// RFC 7638 thumbprint: base64url(SHA-256) over the required members in
    /// lexicographic order, without whitespace.
    pub fn thumbprint(&self) -> String {
        let canonical = match self {
            Jwk::Rsa { n, e } => format!(r#"{{"e":"{e}","kty":"RSA","n":"{n}"}}"#),
            Jwk::Ec { crv, x, y } => {
                format!(r#"{{"crv":"{crv}","kty":"EC","x":"{x}","y":"{y}"}}"#)
            }
        };
        base64url(&Sha256::digest(canonical.as_bytes()))
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// ACME key authorization string: `token || "." || thumbprint`.
pub fn key_authorization(token: &str, key: &AccountKey) -> String {
    format!("{token}.{}", key.thumbprint())
}

/// SHA-256 of the key authorization. This digest is what the module binds
/// into the certified key as qualifying data.
pub fn key_authorization_digest(token: &str, key: &AccountKey) -> [u8; 32] {
    Sha256::digest(key_authorization(token, key).as_bytes()).into()
}
