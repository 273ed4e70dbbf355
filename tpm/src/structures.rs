/*++
Licensed under the Apache-2.0 license.

Abstract:
    TPM 2.0 structures used by key creation and certification, with their
    big-endian wire encodings.
--*/

use crate::marshal::{Reader, Writer};
use crate::TpmError;
use bitflags::bitflags;
use der::Decode;
use sha2::{Digest, Sha256, Sha384};
use spki::{EncodePublicKey, SubjectPublicKeyInfoOwned};

/// `TPM_ALG_ID` values.
pub mod alg {
    pub const RSA: u16 = 0x0001;
    pub const AES: u16 = 0x0006;
    pub const SHA256: u16 = 0x000B;
    pub const SHA384: u16 = 0x000C;
    pub const NULL: u16 = 0x0010;
    pub const RSASSA: u16 = 0x0014;
    pub const ECDSA: u16 = 0x0018;
    pub const ECC: u16 = 0x0023;
    pub const CFB: u16 = 0x0043;
}

/// `TPM_ST` structure tags.
pub mod st {
    pub const NO_SESSIONS: u16 = 0x8001;
    pub const SESSIONS: u16 = 0x8002;
    pub const ATTEST_CREATION: u16 = 0x801A;
    pub const CREATION: u16 = 0x8021;
    pub const HASHCHECK: u16 = 0x8024;
}

/// Permanent handles and handle ranges.
pub mod handle {
    pub const RH_OWNER: u32 = 0x4000_0001;
    pub const RH_NULL: u32 = 0x4000_0007;
    pub const RS_PW: u32 = 0x4000_0009;
    pub const TRANSIENT_FIRST: u32 = 0x8000_0000;
}

/// `TPM_GENERATED_VALUE`, the magic that opens every `TPMS_ATTEST` produced
/// by a module.
pub const TPM_GENERATED: u32 = 0xff54_4347;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha256,
    Sha384,
}

impl HashAlg {
    pub const fn id(self) -> u16 {
        match self {
            HashAlg::Sha256 => alg::SHA256,
            HashAlg::Sha384 => alg::SHA384,
        }
    }

    pub fn from_id(id: u16) -> Result<HashAlg, TpmError> {
        match id {
            alg::SHA256 => Ok(HashAlg::Sha256),
            alg::SHA384 => Ok(HashAlg::Sha384),
            _ => Err(TpmError::UnsupportedAlgorithm(format!("hash {id:#06x}"))),
        }
    }

    pub const fn digest_size(self) -> usize {
        match self {
            HashAlg::Sha256 => 32,
            HashAlg::Sha384 => 48,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlg::Sha256 => Sha256::digest(data).to_vec(),
            HashAlg::Sha384 => Sha384::digest(data).to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EccCurve {
    P256,
    P384,
}

impl EccCurve {
    pub const fn id(self) -> u16 {
        match self {
            EccCurve::P256 => 0x0003,
            EccCurve::P384 => 0x0004,
        }
    }

    pub fn from_id(id: u16) -> Result<EccCurve, TpmError> {
        match id {
            0x0003 => Ok(EccCurve::P256),
            0x0004 => Ok(EccCurve::P384),
            _ => Err(TpmError::UnsupportedAlgorithm(format!("curve {id:#06x}"))),
        }
    }

    pub const fn coordinate_size(self) -> usize {
        match self {
            EccCurve::P256 => 32,
            EccCurve::P384 => 48,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlg {
    RsaSsa,
    Ecdsa,
}

impl SignatureAlg {
    pub const fn id(self) -> u16 {
        match self {
            SignatureAlg::RsaSsa => alg::RSASSA,
            SignatureAlg::Ecdsa => alg::ECDSA,
        }
    }

    fn from_id(id: u16) -> Result<SignatureAlg, TpmError> {
        match id {
            alg::RSASSA => Ok(SignatureAlg::RsaSsa),
            alg::ECDSA => Ok(SignatureAlg::Ecdsa),
            _ => Err(TpmError::UnsupportedAlgorithm(format!("scheme {id:#06x}"))),
        }
    }
}

/// A signing scheme together with its digest, as carried by
/// `TPMT_SIG_SCHEME` and the key-parameter scheme fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigScheme {
    pub alg: SignatureAlg,
    pub hash: HashAlg,
}

impl SigScheme {
    pub const RSASSA_SHA256: SigScheme = SigScheme {
        alg: SignatureAlg::RsaSsa,
        hash: HashAlg::Sha256,
    };
    pub const ECDSA_SHA256: SigScheme = SigScheme {
        alg: SignatureAlg::Ecdsa,
        hash: HashAlg::Sha256,
    };
    pub const ECDSA_SHA384: SigScheme = SigScheme {
        alg: SignatureAlg::Ecdsa,
        hash: HashAlg::Sha384,
    };

    /// Registered COSE algorithm identifier for signatures made with this
    /// scheme.
    pub const fn cose_algorithm(&self) -> i64 {
        match (self.alg, self.hash) {
            (SignatureAlg::RsaSsa, HashAlg::Sha256) => -257,
            (SignatureAlg::RsaSsa, HashAlg::Sha384) => -258,
            (SignatureAlg::Ecdsa, HashAlg::Sha256) => -7,
            (SignatureAlg::Ecdsa, HashAlg::Sha384) => -35,
        }
    }

    pub fn marshal(scheme: Option<&SigScheme>, w: &mut Writer) {
        match scheme {
            Some(scheme) => {
                w.u16(scheme.alg.id());
                w.u16(scheme.hash.id());
            }
            None => w.u16(alg::NULL),
        }
    }

    pub fn unmarshal(r: &mut Reader) -> Result<Option<SigScheme>, TpmError> {
        match r.u16()? {
            alg::NULL => Ok(None),
            id => Ok(Some(SigScheme {
                alg: SignatureAlg::from_id(id)?,
                hash: HashAlg::from_id(r.u16()?)?,
            })),
        }
    }
}

bitflags! {
    /// `TPMA_OBJECT`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectAttributes: u32 {
        const FIXED_TPM = 1 << 1;
        const FIXED_PARENT = 1 << 4;
        const SENSITIVE_DATA_ORIGIN = 1 << 5;
        const USER_WITH_AUTH = 1 << 6;
        const NO_DA = 1 << 10;
        const RESTRICTED = 1 << 16;
        const DECRYPT = 1 << 17;
        const SIGN_ENCRYPT = 1 << 18;
    }
}

/// Symmetric definition of a storage parent. Only AES in CFB mode is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymDef {
    pub key_bits: u16,
}

impl SymDef {
    fn marshal(sym: Option<&SymDef>, w: &mut Writer) {
        match sym {
            Some(sym) => {
                w.u16(alg::AES);
                w.u16(sym.key_bits);
                w.u16(alg::CFB);
            }
            None => w.u16(alg::NULL),
        }
    }

    fn unmarshal(r: &mut Reader) -> Result<Option<SymDef>, TpmError> {
        match r.u16()? {
            alg::NULL => Ok(None),
            alg::AES => {
                let key_bits = r.u16()?;
                if r.u16()? != alg::CFB {
                    return Err(TpmError::UnsupportedAlgorithm("symmetric mode".into()));
                }
                Ok(Some(SymDef { key_bits }))
            }
            id => Err(TpmError::UnsupportedAlgorithm(format!("symmetric {id:#06x}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicParams {
    Rsa {
        symmetric: Option<SymDef>,
        scheme: Option<SigScheme>,
        key_bits: u16,
        /// Zero selects the default exponent 65537.
        exponent: u32,
        modulus: Vec<u8>,
    },
    Ecc {
        symmetric: Option<SymDef>,
        scheme: Option<SigScheme>,
        curve: EccCurve,
        x: Vec<u8>,
        y: Vec<u8>,
    },
}

/// `TPMT_PUBLIC`, the public area of a module object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Public {
    pub name_alg: HashAlg,
    pub attributes: ObjectAttributes,
    pub auth_policy: Vec<u8>,
    pub params: PublicParams,
}

impl Public {
    pub fn marshal(&self, w: &mut Writer) {
        let type_id = match self.params {
            PublicParams::Rsa { .. } => alg::RSA,
            PublicParams::Ecc { .. } => alg::ECC,
        };
        w.u16(type_id);
        w.u16(self.name_alg.id());
        w.u32(self.attributes.bits());
        w.tpm2b(&self.auth_policy);
        match &self.params {
            PublicParams::Rsa {
                symmetric,
                scheme,
                key_bits,
                exponent,
                modulus,
            } => {
                SymDef::marshal(symmetric.as_ref(), w);
                SigScheme::marshal(scheme.as_ref(), w);
                w.u16(*key_bits);
                w.u32(*exponent);
                w.tpm2b(modulus);
            }
            PublicParams::Ecc {
                symmetric,
                scheme,
                curve,
                x,
                y,
            } => {
                SymDef::marshal(symmetric.as_ref(), w);
                SigScheme::marshal(scheme.as_ref(), w);
                w.u16(curve.id());
                // KDF scheme
                w.u16(alg::NULL);
                w.tpm2b(x);
                w.tpm2b(y);
            }
        }
    }

    pub fn unmarshal(r: &mut Reader) -> Result<Public, TpmError> {
        let type_id = r.u16()?;
        let name_alg = HashAlg::from_id(r.u16()?)?;
        let attributes = ObjectAttributes::from_bits_retain(r.u32()?);
        let auth_policy = r.tpm2b()?.to_vec();
        let params = match type_id {
            alg::RSA => PublicParams::Rsa {
                symmetric: SymDef::unmarshal(r)?,
                scheme: SigScheme::unmarshal(r)?,
                key_bits: r.u16()?,
                exponent: r.u32()?,
                modulus: r.tpm2b()?.to_vec(),
            },
            alg::ECC => {
                let symmetric = SymDef::unmarshal(r)?;
                let scheme = SigScheme::unmarshal(r)?;
                let curve = EccCurve::from_id(r.u16()?)?;
                if r.u16()? != alg::NULL {
                    return Err(TpmError::UnsupportedAlgorithm("ECC KDF scheme".into()));
                }
                PublicParams::Ecc {
                    symmetric,
                    scheme,
                    curve,
                    x: r.tpm2b()?.to_vec(),
                    y: r.tpm2b()?.to_vec(),
                }
            }
            id => return Err(TpmError::UnsupportedAlgorithm(format!("object {id:#06x}"))),
        };
        Ok(Public {
            name_alg,
            attributes,
            auth_policy,
            params,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TpmError> {
        let mut w = Writer::new();
        self.marshal(&mut w);
        w.finish()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Public, TpmError> {
        let mut r = Reader::new(bytes);
        let public = Public::unmarshal(&mut r)?;
        r.finish()?;
        Ok(public)
    }

    /// Object name: the name algorithm identifier followed by the digest of
    /// the marshalled public area.
    pub fn name(&self) -> Result<Vec<u8>, TpmError> {
        let mut name = self.name_alg.id().to_be_bytes().to_vec();
        name.extend(self.name_alg.digest(&self.to_bytes()?));
        Ok(name)
    }

    pub fn scheme(&self) -> Option<SigScheme> {
        match &self.params {
            PublicParams::Rsa { scheme, .. } | PublicParams::Ecc { scheme, .. } => *scheme,
        }
    }

    pub fn is_signing_key(&self) -> bool {
        self.attributes.contains(ObjectAttributes::SIGN_ENCRYPT)
            && !self.attributes.contains(ObjectAttributes::DECRYPT)
    }

    /// DER `SubjectPublicKeyInfo` for the key this public area describes.
    pub fn subject_public_key_info(&self) -> Result<SubjectPublicKeyInfoOwned, TpmError> {
        let der = match &self.params {
            PublicParams::Rsa {
                exponent, modulus, ..
            } => {
                let exponent = if *exponent == 0 { 65537 } else { *exponent };
                rsa::RsaPublicKey::new(
                    rsa::BigUint::from_bytes_be(modulus),
                    rsa::BigUint::from(exponent),
                )
                .map_err(|_| TpmError::Malformed("RSA public key"))?
                .to_public_key_der()?
            }
            PublicParams::Ecc { curve, x, y, .. } => {
                let size = curve.coordinate_size();
                if x.len() > size || y.len() > size {
                    return Err(TpmError::Malformed("ECC point coordinate"));
                }
                let mut sec1 = vec![0x04];
                for coordinate in [x, y] {
                    sec1.resize(sec1.len() + size - coordinate.len(), 0);
                    sec1.extend_from_slice(coordinate);
                }
                match curve {
                    EccCurve::P256 => p256::PublicKey::from_sec1_bytes(&sec1)
                        .map_err(|_| TpmError::Malformed("ECC point"))?
                        .to_public_key_der()?,
                    EccCurve::P384 => p384::PublicKey::from_sec1_bytes(&sec1)
                        .map_err(|_| TpmError::Malformed("ECC point"))?
                        .to_public_key_der()?,
                }
            }
        };
        Ok(SubjectPublicKeyInfoOwned::from_der(der.as_bytes())?)
    }
}

/// `TPMS_SENSITIVE_CREATE`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensitiveCreate {
    pub user_auth: Vec<u8>,
    pub data: Vec<u8>,
}

impl SensitiveCreate {
    pub fn marshal(&self, w: &mut Writer) {
        w.sized(|w| {
            w.tpm2b(&self.user_auth);
            w.tpm2b(&self.data);
        });
    }

    pub fn unmarshal(r: &mut Reader) -> Result<SensitiveCreate, TpmError> {
        r.sized(|r| {
            Ok(SensitiveCreate {
                user_auth: r.tpm2b()?.to_vec(),
                data: r.tpm2b()?.to_vec(),
            })
        })
    }
}

/// One entry of a `TPML_PCR_SELECTION`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrSelection {
    pub hash: u16,
    pub select: Vec<u8>,
}

impl PcrSelection {
    const MAX_COUNT: u32 = 16;

    pub fn marshal_list(list: &[PcrSelection], w: &mut Writer) {
        w.u32(list.len() as u32);
        for selection in list {
            w.u16(selection.hash);
            w.u8(selection.select.len() as u8);
            w.raw(&selection.select);
        }
    }

    pub fn unmarshal_list(r: &mut Reader) -> Result<Vec<PcrSelection>, TpmError> {
        let count = r.u32()?;
        if count > Self::MAX_COUNT {
            return Err(TpmError::Malformed("PCR selection count"));
        }
        (0..count)
            .map(|_| {
                let hash = r.u16()?;
                let len = r.u8()? as usize;
                Ok(PcrSelection {
                    hash,
                    select: r.take(len)?.to_vec(),
                })
            })
            .collect()
    }
}

/// `TPMS_CREATION_DATA`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreationData {
    pub pcr_select: Vec<PcrSelection>,
    pub pcr_digest: Vec<u8>,
    pub locality: u8,
    pub parent_name_alg: u16,
    pub parent_name: Vec<u8>,
    pub parent_qualified_name: Vec<u8>,
    pub outside_info: Vec<u8>,
}

impl CreationData {
    pub fn to_bytes(&self) -> Result<Vec<u8>, TpmError> {
        let mut w = Writer::new();
        PcrSelection::marshal_list(&self.pcr_select, &mut w);
        w.tpm2b(&self.pcr_digest);
        w.u8(self.locality);
        w.u16(self.parent_name_alg);
        w.tpm2b(&self.parent_name);
        w.tpm2b(&self.parent_qualified_name);
        w.tpm2b(&self.outside_info);
        w.finish()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<CreationData, TpmError> {
        let mut r = Reader::new(bytes);
        let data = CreationData {
            pcr_select: PcrSelection::unmarshal_list(&mut r)?,
            pcr_digest: r.tpm2b()?.to_vec(),
            locality: r.u8()?,
            parent_name_alg: r.u16()?,
            parent_name: r.tpm2b()?.to_vec(),
            parent_qualified_name: r.tpm2b()?.to_vec(),
            outside_info: r.tpm2b()?.to_vec(),
        };
        r.finish()?;
        Ok(data)
    }
}

/// `TPMT_TK_CREATION`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TkCreation {
    pub hierarchy: u32,
    pub digest: Vec<u8>,
}

impl TkCreation {
    pub fn marshal(&self, w: &mut Writer) {
        w.u16(st::CREATION);
        w.u32(self.hierarchy);
        w.tpm2b(&self.digest);
    }

    pub fn unmarshal(r: &mut Reader) -> Result<TkCreation, TpmError> {
        if r.u16()? != st::CREATION {
            return Err(TpmError::Malformed("creation ticket tag"));
        }
        Ok(TkCreation {
            hierarchy: r.u32()?,
            digest: r.tpm2b()?.to_vec(),
        })
    }
}

/// `TPMT_SIGNATURE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    RsaSsa { hash: HashAlg, sig: Vec<u8> },
    Ecdsa { hash: HashAlg, r: Vec<u8>, s: Vec<u8> },
}

impl Signature {
    pub fn marshal(&self, w: &mut Writer) {
        match self {
            Signature::RsaSsa { hash, sig } => {
                w.u16(alg::RSASSA);
                w.u16(hash.id());
                w.tpm2b(sig);
            }
            Signature::Ecdsa { hash, r, s } => {
                w.u16(alg::ECDSA);
                w.u16(hash.id());
                w.tpm2b(r);
                w.tpm2b(s);
            }
        }
    }

    pub fn unmarshal(r: &mut Reader) -> Result<Signature, TpmError> {
        let alg = SignatureAlg::from_id(r.u16()?)?;
        let hash = HashAlg::from_id(r.u16()?)?;
        Ok(match alg {
            SignatureAlg::RsaSsa => Signature::RsaSsa {
                hash,
                sig: r.tpm2b()?.to_vec(),
            },
            SignatureAlg::Ecdsa => Signature::Ecdsa {
                hash,
                r: r.tpm2b()?.to_vec(),
                s: r.tpm2b()?.to_vec(),
            },
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TpmError> {
        let mut w = Writer::new();
        self.marshal(&mut w);
        w.finish()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Signature, TpmError> {
        let mut r = Reader::new(bytes);
        let sig = Signature::unmarshal(&mut r)?;
        r.finish()?;
        Ok(sig)
    }

    pub fn scheme(&self) -> SigScheme {
        match self {
            Signature::RsaSsa { hash, .. } => SigScheme {
                alg: SignatureAlg::RsaSsa,
                hash: *hash,
            },
            Signature::Ecdsa { hash, .. } => SigScheme {
                alg: SignatureAlg::Ecdsa,
                hash: *hash,
            },
        }
    }
}

/// `TPMS_CLOCK_INFO`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockInfo {
    pub clock: u64,
    pub reset_count: u32,
    pub restart_count: u32,
    pub safe: bool,
}

/// `TPMS_ATTEST` carrying `TPMS_CREATION_INFO`, the only attestation type
/// produced by `CertifyCreation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attest {
    pub qualified_signer: Vec<u8>,
    pub extra_data: Vec<u8>,
    pub clock_info: ClockInfo,
    pub firmware_version: u64,
    pub object_name: Vec<u8>,
    pub creation_hash: Vec<u8>,
}

impl Attest {
    pub fn to_bytes(&self) -> Result<Vec<u8>, TpmError> {
        let mut w = Writer::new();
        w.u32(TPM_GENERATED);
        w.u16(st::ATTEST_CREATION);
        w.tpm2b(&self.qualified_signer);
        w.tpm2b(&self.extra_data);
        w.u64(self.clock_info.clock);
        w.u32(self.clock_info.reset_count);
        w.u32(self.clock_info.restart_count);
        w.u8(self.clock_info.safe as u8);
        w.u64(self.firmware_version);
        w.tpm2b(&self.object_name);
        w.tpm2b(&self.creation_hash);
        w.finish()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Attest, TpmError> {
        let mut r = Reader::new(bytes);
        if r.u32()? != TPM_GENERATED {
            return Err(TpmError::Malformed("attestation magic"));
        }
        if r.u16()? != st::ATTEST_CREATION {
            return Err(TpmError::Malformed("attestation type"));
        }
        let attest = Attest {
            qualified_signer: r.tpm2b()?.to_vec(),
            extra_data: r.tpm2b()?.to_vec(),
            clock_info: ClockInfo {
                clock: r.u64()?,
                reset_count: r.u32()?,
                restart_count: r.u32()?,
                safe: r.u8()? != 0,
            },
            firmware_version: r.u64()?,
            object_name: r.tpm2b()?.to_vec(),
            creation_hash: r.tpm2b()?.to_vec(),
        };
        r.finish()?;
        Ok(attest)
    }
}
