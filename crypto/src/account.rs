// Licensed under the Apache-2.0 license

use crate::{jwk::Jwk, CryptoError, JwsAlgorithm};
use log::{debug, info};
use pkcs8::{DecodePrivateKey, EncodePrivateKey, ObjectIdentifier, PrivateKeyInfo};
use rand::rngs::OsRng;
use rsa::{
    signature::{SignatureEncoding, Signer},
    traits::PublicKeyParts,
    RsaPrivateKey,
};
use sha2::Sha256;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const SECP256R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
const SECP384R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");

const RSA_KEY_BITS: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(test, derive(strum_macros::EnumIter))]
pub enum KeyKind {
    Rsa2048,
    EcdsaP256,
    EcdsaP384,
}

/// The long-term key identifying this client to the CA.
///
/// Only public material (JWK, thumbprint, signatures) ever leaves this type.
pub enum AccountKey {
    Rsa(RsaPrivateKey),
    EcdsaP256(p256::ecdsa::SigningKey),
    EcdsaP384(p384::ecdsa::SigningKey),
}

impl AccountKey {
    pub fn generate(kind: KeyKind) -> Result<AccountKey, CryptoError> {
        let key = match kind {
            KeyKind::Rsa2048 => AccountKey::Rsa(RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)?),
            KeyKind::EcdsaP256 => AccountKey::EcdsaP256(p256::ecdsa::SigningKey::random(&mut OsRng)),
            KeyKind::EcdsaP384 => AccountKey::EcdsaP384(p384::ecdsa::SigningKey::random(&mut OsRng)),
        };
        Ok(key)
    }

    /// Parses a PKCS#8 DER private key.
    ///
    /// # Arguments
    ///
    /// * `der` - PKCS#8 `PrivateKeyInfo` bytes. RSA, P-256 and P-384 keys are
    ///   accepted; anything else is `UnsupportedKeyType`.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<AccountKey, CryptoError> {
        let info = PrivateKeyInfo::try_from(der)?;
        let algorithm = info.algorithm.oid;

        if algorithm == RSA_ENCRYPTION {
            return Ok(AccountKey::Rsa(RsaPrivateKey::from_pkcs8_der(der)?));
        }
        if algorithm != EC_PUBLIC_KEY {
            return Err(CryptoError::UnsupportedKeyType(algorithm.to_string()));
        }

        let curve = info
            .algorithm
            .parameters_oid()
            .map_err(|_| CryptoError::UnsupportedKeyType("EC key without named curve".into()))?;
        if curve == SECP256R1 {
            Ok(AccountKey::EcdsaP256(
                p256::ecdsa::SigningKey::from_pkcs8_der(der)?,
            ))
        } else if curve == SECP384R1 {
            Ok(AccountKey::EcdsaP384(
                p384::ecdsa::SigningKey::from_pkcs8_der(der)?,
            ))
        } else {
            Err(CryptoError::UnsupportedKeyType(format!("EC curve {curve}")))
        }
    }

    pub fn to_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let doc = match self {
            AccountKey::Rsa(key) => key.to_pkcs8_der()?,
            AccountKey::EcdsaP256(key) => key.to_pkcs8_der()?,
            AccountKey::EcdsaP384(key) => key.to_pkcs8_der()?,
        };
        Ok(Zeroizing::new(doc.as_bytes().to_vec()))
    }

    pub fn kind(&self) -> KeyKind {
        match self {
            AccountKey::Rsa(_) => KeyKind::Rsa2048,
            AccountKey::EcdsaP256(_) => KeyKind::EcdsaP256,
            AccountKey::EcdsaP384(_) => KeyKind::EcdsaP384,
        }
    }

    pub fn jws_algorithm(&self) -> JwsAlgorithm {
        match self {
            AccountKey::Rsa(_) => JwsAlgorithm::Rs256,
            AccountKey::EcdsaP256(_) => JwsAlgorithm::Es256,
            AccountKey::EcdsaP384(_) => JwsAlgorithm::Es384,
        }
    }

    /// Public half of the key as a JWK.
    pub fn jwk(&self) -> Jwk {
        match self {
            AccountKey::Rsa(key) => Jwk::rsa(&key.n().to_bytes_be(), &key.e().to_bytes_be()),
            AccountKey::EcdsaP256(key) => {
                let point = key.verifying_key().to_encoded_point(false);
                Jwk::ec(
                    "P-256",
                    point.x().map(|x| x.as_slice()).unwrap_or_default(),
                    point.y().map(|y| y.as_slice()).unwrap_or_default(),
                )
            }
            AccountKey::EcdsaP384(key) => {
                let point = key.verifying_key().to_encoded_point(false);
                Jwk::ec(
                    "P-384",
                    point.x().map(|x| x.as_slice()).unwrap_or_default(),
                    point.y().map(|y| y.as_slice()).unwrap_or_default(),
                )
            }
        }
    }

    /// RFC 7638 thumbprint of the public key.
    pub fn thumbprint(&self) -> String {
        self.jwk().thumbprint()
    }

    /// Produces a JWS signature over `message`.
    ///
    /// RSA keys sign with PKCS#1 v1.5 / SHA-256. ECDSA signatures are the
    /// fixed-width `r || s` concatenation JWS requires, not DER.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let sig_err = |e: rsa::signature::Error| CryptoError::Signature(e.to_string());
        match self {
            AccountKey::Rsa(key) => {
                let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(key.clone());
                Ok(signer.try_sign(message).map_err(sig_err)?.to_vec())
            }
            AccountKey::EcdsaP256(key) => {
                let sig: p256::ecdsa::Signature = key.try_sign(message).map_err(sig_err)?;
                Ok(sig.to_bytes().to_vec())
            }
            AccountKey::EcdsaP384(key) => {
                let sig: p384::ecdsa::Signature = key.try_sign(message).map_err(sig_err)?;
                Ok(sig.to_bytes().to_vec())
            }
        }
    }
}

/// File-backed home of the account key.
///
/// The key is written once, on first use, and only read afterwards.
pub struct AccountKeyStore {
    path: PathBuf,
}

impl AccountKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted key, or generates and persists a P-256 key if
    /// none exists yet.
    pub fn load_or_create(&self) -> Result<AccountKey, CryptoError> {
        match fs::read(&self.path) {
            Ok(der) => {
                let der = Zeroizing::new(der);
                let key = AccountKey::from_pkcs8_der(&der)?;
                debug!("Loaded {:?} account key from {}", key.kind(), self.path.display());
                Ok(key)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let key = AccountKey::generate(KeyKind::EcdsaP256)?;
                self.persist(&key)?;
                info!("Created new account key at {}", self.path.display());
                Ok(key)
            }
            Err(err) => Err(self.io_error(err)),
        }
    }

    fn persist(&self, key: &AccountKey) -> Result<(), CryptoError> {
        let der = key.to_pkcs8_der()?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&self.path)
            .map_err(|err| self.io_error(err))?;
        file.write_all(&der).map_err(|err| self.io_error(err))?;
        file.sync_all().map_err(|err| self.io_error(err))
    }

    fn io_error(&self, source: std::io::Error) -> CryptoError {
        CryptoError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}
