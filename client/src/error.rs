// Licensed under the Apache-2.0 license

use crate::acme::AcmeError;
use crypto::CryptoError;
use platform::PlatformError;
use tpm::TpmError;

/// Why an issuance attempt stopped. Every variant is fatal; a new attempt
/// starts over with a fresh key.
#[derive(thiserror::Error, Debug)]
pub enum IssuanceError {
    #[error("account key: {0}")]
    KeyLoad(#[from] CryptoError),
    #[error("platform module unavailable: {0}")]
    ModuleUnavailable(#[source] PlatformError),
    #[error("platform module operation failed: {0}")]
    ModuleOperationFailed(#[source] TpmError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("CA request failed: {0}")]
    CaRequestFailed(#[source] AcmeError),
    #[error("challenge {url} rejected: {reason}")]
    ChallengeRejected { url: String, reason: String },
}

impl From<PlatformError> for IssuanceError {
    fn from(error: PlatformError) -> Self {
        IssuanceError::ModuleUnavailable(error)
    }
}

impl From<TpmError> for IssuanceError {
    fn from(error: TpmError) -> Self {
        match error {
            TpmError::Channel(error @ PlatformError::Unavailable { .. }) => {
                IssuanceError::ModuleUnavailable(error)
            }
            error => IssuanceError::ModuleOperationFailed(error),
        }
    }
}

impl From<AcmeError> for IssuanceError {
    fn from(error: AcmeError) -> Self {
        match error {
            AcmeError::Malformed(reason) => IssuanceError::ProtocolViolation(reason),
            error => IssuanceError::CaRequestFailed(error),
        }
    }
}
