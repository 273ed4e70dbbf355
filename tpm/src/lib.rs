/*++
Licensed under the Apache-2.0 license.

Abstract:
    TPM 2.0 key attestation. Wire codec for the command subset needed to
    create and certify keys, the attestation engine that drives it, the
    WebAuthn "tpm" attestation statement and the X.509 artifacts (AK
    certificate, CSR) built over module-resident keys.
--*/

pub use engine::{
    Algorithm, AkAlgorithm, AttestationKey, CertificationParameters, CertifiedKey, KeyConfig,
    Module, ModuleSigner, MAX_QUALIFYING_DATA_SIZE,
};
pub use statement::AttestationObject;
pub use structures::{
    Attest, CreationData, EccCurve, HashAlg, ObjectAttributes, Public, PublicParams, SigScheme,
    Signature, SignatureAlg, TkCreation,
};

pub mod commands;
pub mod engine;
pub mod marshal;
pub mod statement;
pub mod structures;
pub mod x509;

use platform::PlatformError;

/// Response codes used by the command subset. Values are the format-zero
/// and format-one base codes without parameter/handle/session numbers.
pub mod rc {
    pub const SUCCESS: u32 = 0x000;
    pub const BAD_TAG: u32 = 0x01E;
    pub const ATTRIBUTES: u32 = 0x082;
    pub const VALUE: u32 = 0x084;
    pub const HANDLE: u32 = 0x08B;
    pub const SCHEME: u32 = 0x092;
    pub const SIZE: u32 = 0x095;
    pub const KEY: u32 = 0x09C;
    pub const INTEGRITY: u32 = 0x09F;
    pub const TICKET: u32 = 0x0A8;
    pub const FAILURE: u32 = 0x101;
    pub const COMMAND_CODE: u32 = 0x143;
    pub const OBJECT_MEMORY: u32 = 0x902;
}

#[derive(thiserror::Error, Debug)]
pub enum TpmError {
    #[error(transparent)]
    Channel(#[from] PlatformError),
    #[error("module returned response code {0:#05x}")]
    ResponseCode(u32),
    #[error("malformed module structure: {0}")]
    Malformed(&'static str),
    #[error("{0} byte buffer does not fit a TPM2B")]
    Oversized(usize),
    #[error("unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("qualifying data is {0} bytes, at most {MAX_QUALIFYING_DATA_SIZE} are allowed")]
    QualifyingDataTooLarge(usize),
    #[error("{0} is not allowed in the current module state")]
    InvalidState(&'static str),
    #[error("key does not expose a usable signing interface")]
    UnsupportedSignerType,
    #[error("DER encoding failed: {0}")]
    Der(#[from] der::Error),
    #[error("public key encoding failed: {0}")]
    Spki(#[from] spki::Error),
    #[error("attestation statement: {0}")]
    Statement(String),
}
