/*++
Licensed under the Apache-2.0 license.

Abstract:
    X.509 artifacts over module keys: the device permanent-identifier
    extension, the AK certificate and the certificate signing request.
--*/

pub use ak_cert::synthesize_ak_certificate;
pub use pkcs10::build_csr;

mod ak_cert;
mod pkcs10;

use crate::{
    structures::{HashAlg, Public, SigScheme, Signature, SignatureAlg},
    TpmError,
};
use const_oid::{
    db::rfc5912::{
        ECDSA_WITH_SHA_256, ECDSA_WITH_SHA_384, SHA_256_WITH_RSA_ENCRYPTION,
        SHA_384_WITH_RSA_ENCRYPTION,
    },
    AssociatedOid, ObjectIdentifier,
};
use der::{
    asn1::{Any, OctetString, UintRef},
    Decode, Encode, Sequence,
};
use spki::AlgorithmIdentifierOwned;
use x509_cert::ext::{
    pkix::{
        name::{GeneralName, OtherName},
        SubjectAltName,
    },
    Extension,
};

/// `id-on-permanentIdentifier` (RFC 4043).
pub const PERMANENT_IDENTIFIER: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.8.3");

/// Assigner recorded next to the device serial.
pub const DEVICE_ID_ASSIGNER: ObjectIdentifier = ObjectIdentifier::new_unwrap("0.1.2.3.4");

/// PermanentIdentifier ::= SEQUENCE {
///    identifierValue    UTF8String OPTIONAL,
///    assigner           OBJECT IDENTIFIER OPTIONAL
/// }
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct PermanentIdentifier {
    pub identifier_value: Option<String>,
    pub assigner: Option<ObjectIdentifier>,
}

impl PermanentIdentifier {
    pub fn device(serial: &str) -> PermanentIdentifier {
        PermanentIdentifier {
            identifier_value: Some(serial.to_string()),
            assigner: Some(DEVICE_ID_ASSIGNER),
        }
    }
}

/// Anything that can sign a certificate request for the key described by
/// `public`.
pub trait RequestSigner {
    fn public(&self) -> &Public;

    /// Signs `message` with the key's own scheme, hashing it first.
    fn sign(&mut self, message: &[u8]) -> Result<Signature, TpmError>;
}

/// Subject alternative name holding a single permanent identifier.
///
/// Certificates and requests built here carry an empty subject, so the
/// extension is marked critical.
pub fn permanent_identifier_extension(serial: &str) -> Result<Extension, TpmError> {
    let san = SubjectAltName(vec![GeneralName::OtherName(OtherName {
        type_id: PERMANENT_IDENTIFIER,
        value: Any::encode_from(&PermanentIdentifier::device(serial))?,
    })]);
    Ok(Extension {
        extn_id: SubjectAltName::OID,
        critical: true,
        extn_value: OctetString::new(san.to_der()?)?,
    })
}

/// Collects every permanent identifier found in subject alternative name
/// extensions.
pub fn permanent_identifiers(
    extensions: &[Extension],
) -> Result<Vec<PermanentIdentifier>, TpmError> {
    let mut found = Vec::new();
    for extension in extensions
        .iter()
        .filter(|e| e.extn_id == SubjectAltName::OID)
    {
        let san = SubjectAltName::from_der(extension.extn_value.as_bytes())?;
        for name in san.0 {
            if let GeneralName::OtherName(other) = name {
                if other.type_id == PERMANENT_IDENTIFIER {
                    found.push(other.value.decode_as::<PermanentIdentifier>()?);
                }
            }
        }
    }
    Ok(found)
}

pub(crate) fn signature_algorithm(scheme: SigScheme) -> AlgorithmIdentifierOwned {
    let (oid, parameters) = match (scheme.alg, scheme.hash) {
        (SignatureAlg::Ecdsa, HashAlg::Sha256) => (ECDSA_WITH_SHA_256, None),
        (SignatureAlg::Ecdsa, HashAlg::Sha384) => (ECDSA_WITH_SHA_384, None),
        (SignatureAlg::RsaSsa, HashAlg::Sha256) => (SHA_256_WITH_RSA_ENCRYPTION, Some(Any::null())),
        (SignatureAlg::RsaSsa, HashAlg::Sha384) => (SHA_384_WITH_RSA_ENCRYPTION, Some(Any::null())),
    };
    AlgorithmIdentifierOwned { oid, parameters }
}

/// Ecdsa-Sig-Value ::= SEQUENCE { r INTEGER, s INTEGER }
#[derive(Sequence)]
struct EcdsaSigValue<'a> {
    r: UintRef<'a>,
    s: UintRef<'a>,
}

/// X.509 signature value for a module signature.
pub(crate) fn signature_value(signature: &Signature) -> Result<Vec<u8>, TpmError> {
    match signature {
        Signature::RsaSsa { sig, .. } => Ok(sig.clone()),
        Signature::Ecdsa { r, s, .. } => Ok(EcdsaSigValue {
            r: UintRef::new(r)?,
            s: UintRef::new(s)?,
        }
        .to_der()?),
    }
}
