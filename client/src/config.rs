// Licensed under the Apache-2.0 license

use platform::DEFAULT_DEVICE_PATH;
use std::path::PathBuf;
use std::time::Duration;
use tpm::{AkAlgorithm, Algorithm};

pub const DEFAULT_CA_ENDPOINT: &str = "https://ca.attestation.dev/acme/acme/directory";
pub const DEFAULT_DEVICE_SERIAL: &str = "12345";
pub const DEFAULT_ACCOUNT_KEY_PATH: &str = "account.key";

/// Where the platform module is reached when it is not simulated in
/// process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleConfig {
    pub device_path: PathBuf,
    /// Socket of an out-of-process simulator. Only consulted when the
    /// simulator is selected.
    pub simulator_socket: Option<PathBuf>,
    pub ak_algorithm: AkAlgorithm,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        ModuleConfig {
            device_path: PathBuf::from(DEFAULT_DEVICE_PATH),
            simulator_socket: None,
            ak_algorithm: AkAlgorithm::default(),
        }
    }
}

/// Algorithm of the certified key the CA issues for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyAlgorithm {
    #[default]
    EcdsaP256,
    EcdsaP384,
    Rsa2048,
}

impl KeyAlgorithm {
    /// Module algorithm and key size.
    pub fn parameters(self) -> (Algorithm, u16) {
        match self {
            KeyAlgorithm::EcdsaP256 => (Algorithm::Ecdsa, 256),
            KeyAlgorithm::EcdsaP384 => (Algorithm::Ecdsa, 384),
            KeyAlgorithm::Rsa2048 => (Algorithm::Rsa, 2048),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IssuanceConfig {
    /// ACME directory URL.
    pub ca_endpoint: String,
    pub device_serial: String,
    pub use_simulator: bool,
    pub account_key_path: PathBuf,
    pub module: ModuleConfig,
    pub key_algorithm: KeyAlgorithm,
    pub accept_terms_of_service: bool,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        IssuanceConfig {
            ca_endpoint: DEFAULT_CA_ENDPOINT.to_string(),
            device_serial: DEFAULT_DEVICE_SERIAL.to_string(),
            use_simulator: false,
            account_key_path: PathBuf::from(DEFAULT_ACCOUNT_KEY_PATH),
            module: ModuleConfig::default(),
            key_algorithm: KeyAlgorithm::default(),
            accept_terms_of_service: true,
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            poll_attempts: 10,
        }
    }
}
