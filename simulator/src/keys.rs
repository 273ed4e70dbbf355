// Licensed under the Apache-2.0 license

use p256::ecdsa::signature::hazmat::PrehashSigner;
use rand::rngs::StdRng;
use rsa::{traits::PublicKeyParts, BigUint, Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Sha256, Sha384};
use tpm::{
    rc, EccCurve, HashAlg, Public, PublicParams, SigScheme, Signature, SignatureAlg,
};

const DEFAULT_EXPONENT: u32 = 65537;

/// Private half of a loaded object.
#[derive(Clone)]
pub(crate) enum KeyMaterial {
    /// Storage parents only wrap children, which never leave the simulator.
    Storage,
    Rsa(RsaPrivateKey),
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
}

impl KeyMaterial {
    /// Generates a signing key for `template` and writes its public point
    /// or modulus into the template's unique field.
    pub fn generate(template: &mut Public, rng: &mut StdRng) -> Result<KeyMaterial, u32> {
        match &mut template.params {
            PublicParams::Rsa {
                scheme,
                key_bits,
                exponent,
                modulus,
                ..
            } => {
                if scheme.is_some_and(|s| s.alg != SignatureAlg::RsaSsa) {
                    return Err(rc::SCHEME);
                }
                if *key_bits != 2048 || !matches!(*exponent, 0 | DEFAULT_EXPONENT) {
                    return Err(rc::VALUE);
                }
                let key = RsaPrivateKey::new_with_exp(
                    rng,
                    *key_bits as usize,
                    &BigUint::from(DEFAULT_EXPONENT),
                )
                .map_err(|_| rc::FAILURE)?;
                *modulus = key.n().to_bytes_be();
                Ok(KeyMaterial::Rsa(key))
            }
            PublicParams::Ecc {
                scheme, curve, x, y, ..
            } => {
                if scheme.is_some_and(|s| s.alg != SignatureAlg::Ecdsa) {
                    return Err(rc::SCHEME);
                }
                let (key, point) = match curve {
                    EccCurve::P256 => {
                        let key = p256::ecdsa::SigningKey::random(rng);
                        let point = key.verifying_key().to_encoded_point(false);
                        (KeyMaterial::P256(key), point.as_bytes().to_vec())
                    }
                    EccCurve::P384 => {
                        let key = p384::ecdsa::SigningKey::random(rng);
                        let point = key.verifying_key().to_encoded_point(false);
                        (KeyMaterial::P384(key), point.as_bytes().to_vec())
                    }
                };
                // Uncompressed SEC1: 0x04 || x || y
                let (px, py) = point[1..].split_at(curve.coordinate_size());
                *x = px.to_vec();
                *y = py.to_vec();
                Ok(key)
            }
        }
    }

    /// Signs a digest that was computed with `scheme.hash`.
    pub fn sign(&self, scheme: SigScheme, digest: &[u8]) -> Result<Signature, u32> {
        if digest.len() != scheme.hash.digest_size() {
            return Err(rc::SIZE);
        }
        match (self, scheme.alg) {
            (KeyMaterial::Rsa(key), SignatureAlg::RsaSsa) => {
                let padding = match scheme.hash {
                    HashAlg::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
                    HashAlg::Sha384 => Pkcs1v15Sign::new::<Sha384>(),
                };
                let sig = key.sign(padding, digest).map_err(|_| rc::FAILURE)?;
                Ok(Signature::RsaSsa {
                    hash: scheme.hash,
                    sig,
                })
            }
            (KeyMaterial::P256(key), SignatureAlg::Ecdsa) => {
                let signature: p256::ecdsa::Signature =
                    key.sign_prehash(digest).map_err(|_| rc::FAILURE)?;
                let (r, s) = signature.split_bytes();
                Ok(Signature::Ecdsa {
                    hash: scheme.hash,
                    r: r.to_vec(),
                    s: s.to_vec(),
                })
            }
            (KeyMaterial::P384(key), SignatureAlg::Ecdsa) => {
                let signature: p384::ecdsa::Signature =
                    key.sign_prehash(digest).map_err(|_| rc::FAILURE)?;
                let (r, s) = signature.split_bytes();
                Ok(Signature::Ecdsa {
                    hash: scheme.hash,
                    r: r.to_vec(),
                    s: s.to_vec(),
                })
            }
            (KeyMaterial::Storage, _) => Err(rc::KEY),
            _ => Err(rc::SCHEME),
        }
    }
}
