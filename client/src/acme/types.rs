// Licensed under the Apache-2.0 license

//! ACME resources (RFC 8555 section 7.1) as far as device attestation uses
//! them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier type naming a device by its serial number.
pub const PERMANENT_IDENTIFIER: &str = "permanent-identifier";

/// Challenge type fulfilled with a hardware attestation statement.
pub const DEVICE_ATTEST_01: &str = "device-attest-01";

pub const BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
    Expired,
    Deactivated,
    Revoked,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
    #[serde(default)]
    pub meta: DirectoryMeta,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
    pub terms_of_service: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl Identifier {
    pub fn permanent(serial: &str) -> Identifier {
        Identifier {
            kind: PERMANENT_IDENTIFIER.to_string(),
            value: serial.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub status: Status,
    /// Account URL from the `Location` header; used as the JWS `kid`.
    #[serde(skip)]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Order {
    pub status: Status,
    #[serde(default)]
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub authorizations: Vec<String>,
    pub finalize: String,
    pub certificate: Option<String>,
    pub error: Option<Problem>,
    #[serde(skip)]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Authorization {
    pub status: Status,
    pub identifier: Identifier,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
}

impl Authorization {
    /// First challenge of the given type, in the order the CA listed them.
    pub fn challenge(&self, kind: &str) -> Option<&Challenge> {
        self.challenges.iter().find(|c| c.kind == kind)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub status: Status,
    #[serde(default)]
    pub token: String,
    pub error: Option<Problem>,
}

/// RFC 7807 problem document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Problem {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub detail: String,
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_from_json() {
        let order: Order = serde_json::from_str(
            r#"{
                "status": "pending",
                "expires": "2030-01-01T00:00:00Z",
                "identifiers": [{"type": "permanent-identifier", "value": "12345"}],
                "authorizations": ["https://ca/authz/1"],
                "finalize": "https://ca/order/1/finalize"
            }"#,
        )
        .unwrap();
        assert_eq!(order.status, Status::Pending);
        assert_eq!(order.identifiers, [Identifier::permanent("12345")]);
        assert_eq!(order.authorizations, ["https://ca/authz/1"]);
        assert!(order.certificate.is_none());
        assert!(order.url.is_empty());
    }

    #[test]
    fn test_challenge_selection_by_type() {
        let authz: Authorization = serde_json::from_str(
            r#"{
                "status": "pending",
                "identifier": {"type": "permanent-identifier", "value": "12345"},
                "challenges": [
                    {"type": "http-01", "url": "https://ca/chal/0", "status": "pending", "token": "a"},
                    {"type": "device-attest-01", "url": "https://ca/chal/1", "status": "pending", "token": "b"},
                    {"type": "device-attest-01", "url": "https://ca/chal/2", "status": "pending", "token": "c"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(authz.challenge(DEVICE_ATTEST_01).unwrap().token, "b");
        assert!(authz.challenge("dns-01").is_none());
    }

    #[test]
    fn test_problem_display() {
        let problem: Problem = serde_json::from_str(
            r#"{"type": "urn:ietf:params:acme:error:badNonce", "detail": "stale", "status": 400}"#,
        )
        .unwrap();
        assert_eq!(problem.kind, BAD_NONCE);
        assert_eq!(problem.to_string(), "urn:ietf:params:acme:error:badNonce: stale");
    }
}
