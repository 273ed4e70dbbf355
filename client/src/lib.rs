/*++
Licensed under the Apache-2.0 license.

Abstract:
    Device attestation client. Obtains an X.509 certificate for a key held
    by the platform module by answering an ACME device-attest-01 challenge
    with a TPM attestation statement.
--*/

pub use config::{
    IssuanceConfig, KeyAlgorithm, ModuleConfig, DEFAULT_ACCOUNT_KEY_PATH, DEFAULT_CA_ENDPOINT,
    DEFAULT_DEVICE_SERIAL,
};
pub use error::IssuanceError;
pub use issuance::{open_module, CertificateChain, Issuer};

pub mod acme;
mod config;
mod error;
mod issuance;
