/*++
Licensed under the Apache-2.0 license.

Abstract:
    Issuance orchestrator. Binds a key certified by the platform module to
    an ACME device-attest-01 challenge and finalizes the order with a CSR
    signed by that key.
--*/

use crate::{
    acme::{AcmeClient, AcmeError, Challenge, Identifier, Status, DEVICE_ATTEST_01},
    IssuanceConfig, IssuanceError,
};
use base64ct::{Base64, Encoding};
use crypto::{key_authorization_digest, AccountKeyStore};
use log::{debug, info, warn};
use pem::{encode_config, EncodeConfig, LineEnding, Pem};
use platform::{ModuleChannel, Transport};
use serde_json::json;
use tpm::{
    engine::Module,
    statement,
    x509::{build_csr, synthesize_ak_certificate},
    AttestationKey, CertificationParameters, CertifiedKey, KeyConfig,
};

/// DER certificates returned by the CA, leaf first. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChain {
    certificates: Vec<Vec<u8>>,
}

impl CertificateChain {
    pub fn new(certificates: Vec<Vec<u8>>) -> Result<CertificateChain, IssuanceError> {
        if certificates.is_empty() {
            return Err(IssuanceError::ProtocolViolation(
                "empty certificate chain".into(),
            ));
        }
        Ok(CertificateChain { certificates })
    }

    pub fn certificates(&self) -> &[Vec<u8>] {
        &self.certificates
    }

    pub fn leaf(&self) -> &[u8] {
        &self.certificates[0]
    }

    pub fn leaf_pem(&self) -> String {
        encode_config(
            &Pem::new("CERTIFICATE", self.leaf()),
            EncodeConfig {
                line_ending: LineEnding::LF,
            },
        )
    }
}

/// Opens the module selected by `config` and creates its storage root key.
pub fn open_module(config: &IssuanceConfig) -> Result<Module, IssuanceError> {
    let channel = if config.use_simulator {
        match &config.module.simulator_socket {
            Some(path) => platform::open(&Transport::Socket(path.clone()))?,
            None => in_process_simulator()?,
        }
    } else {
        platform::open(&Transport::Device(config.module.device_path.clone()))?
    };
    Ok(Module::open(channel)?)
}

#[cfg(feature = "simulator")]
fn in_process_simulator() -> Result<Box<dyn ModuleChannel>, IssuanceError> {
    debug!("Using in-process simulator");
    Ok(Box::new(simulator::SimulatorChannel::new()))
}

#[cfg(not(feature = "simulator"))]
fn in_process_simulator() -> Result<Box<dyn ModuleChannel>, IssuanceError> {
    Err(IssuanceError::ModuleUnavailable(
        platform::PlatformError::Unavailable {
            path: "in-process simulator".into(),
            source: std::io::ErrorKind::Unsupported.into(),
        },
    ))
}

/// Runs one issuance from account registration to certificate download.
pub struct Issuer {
    config: IssuanceConfig,
}

impl Issuer {
    pub fn new(config: IssuanceConfig) -> Issuer {
        Issuer { config }
    }

    pub fn config(&self) -> &IssuanceConfig {
        &self.config
    }

    /// Every step runs strictly in order and the first failure ends the
    /// attempt. The module is opened before the CA sees any request, so a
    /// missing module never leaves an order behind.
    ///
    /// Each pending authorization gets its own certified key bound to its
    /// challenge. The key certified last signs the CSR.
    pub fn run(&self) -> Result<CertificateChain, IssuanceError> {
        let config = &self.config;
        let account_key = AccountKeyStore::new(&config.account_key_path).load_or_create()?;
        info!("Loaded {:?} account key", account_key.kind());

        let mut module = open_module(config)?;
        let ak = module.create_ak(config.module.ak_algorithm)?;
        let ak_certificate = synthesize_ak_certificate(&ak, &config.device_serial)?;
        info!("Created {:?} attestation key", config.module.ak_algorithm);

        let mut acme =
            AcmeClient::connect(&config.ca_endpoint, account_key, config.request_timeout)?;
        match acme.register(config.accept_terms_of_service) {
            Ok(account) => info!("Registered account {}", account.url),
            Err(AcmeError::AccountAlreadyExists) => info!(
                "Account already exists at {}",
                acme.account_url().unwrap_or_default()
            ),
            Err(e) => return Err(e.into()),
        }

        let order = acme.new_order(&[Identifier::permanent(&config.device_serial)])?;
        info!("Created order {}", order.url);
        if order.authorizations.is_empty() {
            return Err(IssuanceError::ProtocolViolation(format!(
                "order {} has no authorizations",
                order.url
            )));
        }

        let mut certified = None;
        for url in &order.authorizations {
            let authorization = acme.authorization(url)?;
            if authorization.status == Status::Valid {
                info!("Authorization {url} is already valid");
                continue;
            }
            let challenge = authorization.challenge(DEVICE_ATTEST_01).ok_or_else(|| {
                IssuanceError::ProtocolViolation(format!(
                    "authorization {url} offers no {DEVICE_ATTEST_01} challenge"
                ))
            })?;
            // The module holds one certified key at a time.
            if let Some(previous) = certified.take() {
                module.release_key(previous)?;
            }
            certified = Some(self.fulfill(&mut acme, &mut module, &ak, &ak_certificate, challenge)?);
        }
        let key = match certified {
            Some(key) => key,
            None => {
                info!("Every authorization was already valid");
                self.certify(&mut module, &ak, Vec::new())?.0
            }
        };

        let order = acme.poll_order(
            &order.url,
            Status::Ready,
            config.poll_interval,
            config.poll_attempts,
        )?;
        let csr = build_csr(&mut module.signer(&key)?, &config.device_serial)?;
        debug!("Built {} byte CSR", csr.len());
        if let Err(e) = module.close() {
            warn!("Closing the platform module failed: {e}");
        }

        let order = acme.finalize(&order, &csr)?;
        info!("Finalized order {}", order.url);
        let order = match order.status {
            Status::Valid => order,
            _ => acme.poll_order(
                &order.url,
                Status::Valid,
                config.poll_interval,
                config.poll_attempts,
            )?,
        };
        let url = order.certificate.ok_or_else(|| {
            IssuanceError::ProtocolViolation(format!("valid order {} has no certificate", order.url))
        })?;
        let chain = CertificateChain::new(acme.certificate_chain(&url)?)?;
        info!("Downloaded {} certificates from {url}", chain.certificates().len());
        Ok(chain)
    }

    /// Certifies a fresh key bound to `challenge` and submits the
    /// attestation statement as the challenge response.
    fn fulfill(
        &self,
        acme: &mut AcmeClient,
        module: &mut Module,
        ak: &AttestationKey,
        ak_certificate: &[u8],
        challenge: &Challenge,
    ) -> Result<CertifiedKey, IssuanceError> {
        if challenge.token.is_empty() {
            return Err(IssuanceError::ProtocolViolation(format!(
                "challenge {} has no token",
                challenge.url
            )));
        }
        let qualifying_data = key_authorization_digest(&challenge.token, acme.account_key());
        let (key, params) = self.certify(module, ak, qualifying_data.to_vec())?;

        let attestation = statement::encode(ak_certificate, &params)?;
        let payload = json!({ "attStmt": Base64::encode_string(&attestation) });
        let response = acme.accept_challenge(challenge, &payload)?;
        if let Some(problem) = response.error {
            return Err(IssuanceError::ChallengeRejected {
                url: challenge.url.clone(),
                reason: problem.to_string(),
            });
        }
        if response.status == Status::Invalid {
            return Err(IssuanceError::ChallengeRejected {
                url: challenge.url.clone(),
                reason: "challenge is invalid".into(),
            });
        }
        info!("Submitted attestation for challenge {}", challenge.url);
        Ok(key)
    }

    fn certify(
        &self,
        module: &mut Module,
        ak: &AttestationKey,
        qualifying_data: Vec<u8>,
    ) -> Result<(CertifiedKey, CertificationParameters), IssuanceError> {
        let (algorithm, size) = self.config.key_algorithm.parameters();
        Ok(module.certify_key(
            ak,
            &KeyConfig {
                algorithm,
                size,
                qualifying_data,
            },
        )?)
    }
}
