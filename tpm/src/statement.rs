// Licensed under the Apache-2.0 license

//! WebAuthn "tpm" attestation statement (W3C WebAuthn section 8.3).

use crate::{engine::CertificationParameters, TpmError};
use ciborium::value::{Integer, Value};

pub const FORMAT: &str = "tpm";
pub const VERSION: &str = "2.0";

type CborMap = Vec<(Value, Value)>;

/// `{fmt, attStmt: {alg, sig, ver, x5c, pubArea, certInfo}}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationObject {
    pub format: String,
    pub version: String,
    /// COSE algorithm of `signature`.
    pub algorithm: i64,
    /// AK certificate first.
    pub x5c: Vec<Vec<u8>>,
    pub signature: Vec<u8>,
    pub cert_info: Vec<u8>,
    pub pub_area: Vec<u8>,
}

impl AttestationObject {
    pub fn new(ak_certificate: &[u8], params: &CertificationParameters) -> AttestationObject {
        AttestationObject {
            format: FORMAT.to_string(),
            version: VERSION.to_string(),
            algorithm: params.scheme.cose_algorithm(),
            x5c: vec![ak_certificate.to_vec()],
            signature: params.create_signature.clone(),
            cert_info: params.create_attestation.clone(),
            pub_area: params.public.clone(),
        }
    }

    /// Canonical CBOR: map keys sorted by encoded length, then bytewise.
    pub fn encode(&self) -> Result<Vec<u8>, TpmError> {
        let statement = vec![
            text_entry("alg", Value::Integer(Integer::from(self.algorithm))),
            text_entry("sig", Value::Bytes(self.signature.clone())),
            text_entry("ver", Value::Text(self.version.clone())),
            text_entry(
                "x5c",
                Value::Array(self.x5c.iter().cloned().map(Value::Bytes).collect()),
            ),
            text_entry("pubArea", Value::Bytes(self.pub_area.clone())),
            text_entry("certInfo", Value::Bytes(self.cert_info.clone())),
        ];
        let object = Value::Map(vec![
            text_entry("fmt", Value::Text(self.format.clone())),
            text_entry("attStmt", Value::Map(statement)),
        ]);

        let mut out = Vec::new();
        ciborium::ser::into_writer(&object, &mut out)
            .map_err(|e| TpmError::Statement(e.to_string()))?;
        Ok(out)
    }

    /// Parses an encoded object. Every statement field must be present with
    /// its expected type and no others may appear.
    pub fn decode(bytes: &[u8]) -> Result<AttestationObject, TpmError> {
        let value: Value = ciborium::de::from_reader(bytes)
            .map_err(|e| TpmError::Statement(e.to_string()))?;
        let Value::Map(object) = value else {
            return Err(TpmError::Statement("attestation object is not a map".into()));
        };
        expect_keys(&object, &["fmt", "attStmt"])?;
        let format = get_text(&object, "fmt")?;
        let Some(Value::Map(statement)) = find_field(&object, "attStmt") else {
            return Err(TpmError::Statement("attStmt is not a map".into()));
        };
        expect_keys(
            statement,
            &["alg", "sig", "ver", "x5c", "pubArea", "certInfo"],
        )?;

        let algorithm = match find_field(statement, "alg") {
            Some(Value::Integer(i)) => i64::try_from(i128::from(*i))
                .map_err(|_| TpmError::Statement("alg out of range".into()))?,
            _ => return Err(TpmError::Statement("alg is not an integer".into())),
        };
        let x5c = match find_field(statement, "x5c") {
            Some(Value::Array(certs)) if !certs.is_empty() => certs
                .iter()
                .map(|cert| match cert {
                    Value::Bytes(der) => Ok(der.clone()),
                    _ => Err(TpmError::Statement("x5c entry is not a byte string".into())),
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => return Err(TpmError::Statement("x5c is not a non-empty array".into())),
        };

        Ok(AttestationObject {
            format,
            version: get_text(statement, "ver")?,
            algorithm,
            x5c,
            signature: get_bytes(statement, "sig")?,
            cert_info: get_bytes(statement, "certInfo")?,
            pub_area: get_bytes(statement, "pubArea")?,
        })
    }
}

/// Encodes the attestation object for an AK certificate and a key's
/// certification parameters.
pub fn encode(
    ak_certificate: &[u8],
    params: &CertificationParameters,
) -> Result<Vec<u8>, TpmError> {
    AttestationObject::new(ak_certificate, params).encode()
}

fn text_entry(key: &str, value: Value) -> (Value, Value) {
    (Value::Text(key.to_string()), value)
}

fn find_field<'a>(map: &'a CborMap, key: &str) -> Option<&'a Value> {
    map.iter().find_map(|(k, v)| match k {
        Value::Text(s) if s == key => Some(v),
        _ => None,
    })
}

fn expect_keys(map: &CborMap, keys: &[&str]) -> Result<(), TpmError> {
    for (key, _) in map {
        match key {
            Value::Text(s) if keys.contains(&s.as_str()) => (),
            _ => return Err(TpmError::Statement(format!("unexpected key {key:?}"))),
        }
    }
    if map.len() != keys.len() {
        return Err(TpmError::Statement("missing or duplicate keys".into()));
    }
    Ok(())
}

fn get_text(map: &CborMap, key: &str) -> Result<String, TpmError> {
    match find_field(map, key) {
        Some(Value::Text(s)) => Ok(s.clone()),
        _ => Err(TpmError::Statement(format!("{key} is not a text string"))),
    }
}

fn get_bytes(map: &CborMap, key: &str) -> Result<Vec<u8>, TpmError> {
    match find_field(map, key) {
        Some(Value::Bytes(b)) => Ok(b.clone()),
        _ => Err(TpmError::Statement(format!("{key} is not a byte string"))),
    }
}
