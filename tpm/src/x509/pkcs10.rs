// Licensed under the Apache-2.0 license

use super::{
    permanent_identifier_extension, signature_algorithm, signature_value, RequestSigner,
};
use crate::TpmError;
use der::{asn1::BitString, Encode};
use x509_cert::{
    attr::{Attribute, Attributes},
    name::Name,
    request::{CertReq, CertReqInfo, ExtensionReq, Version},
};

/// Builds a DER PKCS#10 request over the signer's key, signed by that key.
///
/// The request has an empty subject and carries the device permanent
/// identifier as a requested subject alternative name.
pub fn build_csr(signer: &mut impl RequestSigner, device_id: &str) -> Result<Vec<u8>, TpmError> {
    let public = signer.public();
    let scheme = public
        .scheme()
        .filter(|_| public.is_signing_key())
        .ok_or(TpmError::UnsupportedSignerType)?;
    let public_key = public.subject_public_key_info()?;

    let mut attributes = Attributes::new();
    attributes.insert(Attribute::try_from(ExtensionReq(vec![
        permanent_identifier_extension(device_id)?,
    ]))?)?;

    let info = CertReqInfo {
        version: Version::V1,
        subject: Name::default(),
        public_key,
        attributes,
    };
    let signature = signer.sign(&info.to_der()?)?;
    if signature.scheme() != scheme {
        return Err(TpmError::Malformed("signature scheme differs from the key's"));
    }

    let request = CertReq {
        info,
        algorithm: signature_algorithm(scheme),
        signature: BitString::from_bytes(&signature_value(&signature)?)?,
    };
    Ok(request.to_der()?)
}
