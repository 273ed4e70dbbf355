// Licensed under the Apache-2.0 license

use super::{permanent_identifier_extension, signature_algorithm};
use crate::{engine::AttestationKey, structures::SigScheme, TpmError};
use der::{asn1::BitString, Encode};
use log::debug;
use p256::ecdsa::{signature::Signer, DerSignature, SigningKey};
use rand::rngs::OsRng;
use std::{str::FromStr, time::Duration};
use x509_cert::{
    certificate::{Certificate, TbsCertificate, Version},
    name::Name,
    serial_number::SerialNumber,
    time::Validity,
};

const AK_ISSUER: &str = "CN=Attestation Key Issuer";
const AK_SERIAL: u8 = 2;
const AK_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Issues a certificate for the attestation key from a freshly generated
/// P-256 issuer that is discarded afterwards.
///
/// The certificate has an empty subject and names the device through its
/// permanent identifier. Nothing chains it to a manufacturer root, so a
/// relying party can only trust it by policy.
pub fn synthesize_ak_certificate(
    ak: &AttestationKey,
    device_id: &str,
) -> Result<Vec<u8>, TpmError> {
    let issuer_key = SigningKey::random(&mut OsRng);
    let algorithm = signature_algorithm(SigScheme::ECDSA_SHA256);

    let tbs_certificate = TbsCertificate {
        version: Version::V3,
        serial_number: SerialNumber::new(&[AK_SERIAL])?,
        signature: algorithm.clone(),
        issuer: Name::from_str(AK_ISSUER)?,
        validity: Validity::from_now(AK_VALIDITY)?,
        subject: Name::default(),
        subject_public_key_info: ak.public().subject_public_key_info()?,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: Some(vec![permanent_identifier_extension(device_id)?]),
    };
    let signature: DerSignature = issuer_key.sign(&tbs_certificate.to_der()?);

    let certificate = Certificate {
        tbs_certificate,
        signature_algorithm: algorithm,
        signature: BitString::from_bytes(signature.as_bytes())?,
    };
    let der = certificate.to_der()?;
    debug!("Synthesized {}-byte AK certificate for {device_id}", der.len());
    Ok(der)
}
