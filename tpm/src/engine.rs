/*++
Licensed under the Apache-2.0 license.

Abstract:
    Attestation engine. Owns one module session, creates the attestation
    key and certifies a freshly created key with caller-supplied qualifying
    data.
--*/

use crate::{
    commands::{
        CertifyCreationCmd, CreateCmd, CreatePrimaryCmd, CreateResp, FlushContextCmd, HashCheck,
        LoadCmd, SignCmd, TpmCommand, TpmResponse,
    },
    structures::{
        handle, Attest, EccCurve, HashAlg, ObjectAttributes, Public, PublicParams,
        SensitiveCreate, SigScheme, Signature, SymDef,
    },
    x509::RequestSigner,
    TpmError,
};
use log::{debug, info, warn};
use platform::ModuleChannel;

/// Largest qualifying data a module accepts (the size of a SHA-512 digest).
pub const MAX_QUALIFYING_DATA_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AkAlgorithm {
    #[default]
    Rsa2048,
    EccP256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Ecdsa,
    Rsa,
}

/// Parameters for the key to certify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyConfig {
    pub algorithm: Algorithm,
    /// Curve size for ECDSA, modulus size for RSA.
    pub size: u16,
    pub qualifying_data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Opened,
    AkReady,
    KeyCertified,
}

/// A restricted signing key resident in the module.
#[derive(Debug)]
pub struct AttestationKey {
    handle: u32,
    public: Public,
    public_area: Vec<u8>,
    scheme: SigScheme,
}

impl AttestationKey {
    pub fn public(&self) -> &Public {
        &self.public
    }

    /// Marshalled `TPMT_PUBLIC` as returned by the module.
    pub fn public_area(&self) -> &[u8] {
        &self.public_area
    }

    /// Scheme the key certifies with.
    pub fn scheme(&self) -> SigScheme {
        self.scheme
    }
}

/// A module-resident key whose creation was certified by the attestation
/// key.
#[derive(Debug)]
pub struct CertifiedKey {
    handle: u32,
    public: Public,
}

impl CertifiedKey {
    pub fn public(&self) -> &Public {
        &self.public
    }
}

/// Proof that a key was created inside the module, all in wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificationParameters {
    /// `TPMT_PUBLIC` of the certified key.
    pub public: Vec<u8>,
    /// `TPMS_CREATION_DATA`; its `outsideInfo` is the qualifying data.
    pub create_data: Vec<u8>,
    /// `TPMS_ATTEST` produced by `CertifyCreation`.
    pub create_attestation: Vec<u8>,
    /// `TPMT_SIGNATURE` of the attestation key over `create_attestation`.
    pub create_signature: Vec<u8>,
    /// Scheme of `create_signature`.
    pub scheme: SigScheme,
}

/// Session with one platform module.
///
/// The session moves through `Opened -> AkReady -> KeyCertified`; each
/// operation is only valid in its state. Releasing the certified key moves
/// back to `AkReady`, so one session can certify a key per challenge while
/// holding at most one of them. Dropping the session flushes every
/// transient object it created and closes the channel.
pub struct Module<C: ModuleChannel = Box<dyn ModuleChannel>> {
    channel: C,
    state: State,
    srk: u32,
    transient: Vec<u32>,
    open: bool,
}

impl<C: ModuleChannel> Module<C> {
    /// Starts a session on `channel` and creates the storage root key that
    /// parents every later object.
    pub fn open(channel: C) -> Result<Module<C>, TpmError> {
        let mut module = Module {
            channel,
            state: State::Opened,
            srk: 0,
            transient: Vec::new(),
            open: true,
        };
        let srk = module.execute(&CreatePrimaryCmd {
            primary_handle: handle::RH_OWNER,
            in_sensitive: SensitiveCreate::default(),
            in_public: srk_template(),
            outside_info: vec![],
            creation_pcr: vec![],
        })?;
        module.transient.push(srk.object_handle);
        module.srk = srk.object_handle;
        debug!("Storage root key loaded at {:#010x}", srk.object_handle);
        Ok(module)
    }

    /// Creates a fresh, non-persistent attestation key.
    pub fn create_ak(&mut self, algorithm: AkAlgorithm) -> Result<AttestationKey, TpmError> {
        if self.state != State::Opened {
            return Err(TpmError::InvalidState("creating a second attestation key"));
        }

        let (handle, created) = self.create_and_load(ak_template(algorithm), vec![])?;
        let public = Public::from_bytes(&created.out_public)?;
        let scheme = public
            .scheme()
            .filter(|_| public.attributes.contains(ObjectAttributes::RESTRICTED))
            .ok_or(TpmError::Malformed("attestation key is not a restricted signer"))?;

        self.state = State::AkReady;
        info!("Created {algorithm:?} attestation key");
        Ok(AttestationKey {
            handle,
            public,
            public_area: created.out_public,
            scheme,
        })
    }

    /// Creates a new key and has `ak` certify its creation.
    ///
    /// The qualifying data enters the key's creation data and the
    /// attestation's `extraData`. It can only be bound while the key is
    /// being created, so every call creates a new key.
    ///
    /// # Arguments
    ///
    /// * `ak` - Attestation key created by this session.
    /// * `config` - Algorithm, size and qualifying data of the new key.
    pub fn certify_key(
        &mut self,
        ak: &AttestationKey,
        config: &KeyConfig,
    ) -> Result<(CertifiedKey, CertificationParameters), TpmError> {
        let qualifying_data = &config.qualifying_data;
        if qualifying_data.len() > MAX_QUALIFYING_DATA_SIZE {
            return Err(TpmError::QualifyingDataTooLarge(qualifying_data.len()));
        }
        match self.state {
            State::Opened => {
                return Err(TpmError::InvalidState(
                    "certifying before an attestation key exists",
                ))
            }
            State::KeyCertified => {
                return Err(TpmError::InvalidState(
                    "certifying while another certified key is loaded",
                ))
            }
            State::AkReady => (),
        }
        if !self.transient.contains(&ak.handle) {
            return Err(TpmError::InvalidState(
                "certifying with another session's attestation key",
            ));
        }

        let template = key_template(config.algorithm, config.size)?;
        let (handle, created) = self.create_and_load(template, qualifying_data.clone())?;
        let certified = self.execute(&CertifyCreationCmd {
            sign_handle: ak.handle,
            object_handle: handle,
            qualifying_data: qualifying_data.clone(),
            creation_hash: created.creation_hash,
            in_scheme: Some(ak.scheme),
            creation_ticket: created.creation_ticket,
        })?;

        let public = Public::from_bytes(&created.out_public)?;
        let attest = Attest::from_bytes(&certified.certify_info)?;
        if &attest.extra_data != qualifying_data || attest.object_name != public.name()? {
            return Err(TpmError::Malformed("attestation does not cover the new key"));
        }

        self.state = State::KeyCertified;
        info!(
            "Certified {:?}-{} key with {} bytes of qualifying data",
            config.algorithm,
            config.size,
            qualifying_data.len()
        );
        Ok((
            CertifiedKey { handle, public },
            CertificationParameters {
                public: created.out_public,
                create_data: created.creation_data,
                create_attestation: certified.certify_info,
                create_signature: certified.signature.to_bytes()?,
                scheme: ak.scheme,
            },
        ))
    }

    /// Borrows the session to sign with a certified key.
    pub fn signer<'a>(
        &'a mut self,
        key: &'a CertifiedKey,
    ) -> Result<ModuleSigner<'a, C>, TpmError> {
        if self.state != State::KeyCertified || !self.transient.contains(&key.handle) {
            return Err(TpmError::InvalidState("signing without a certified key"));
        }
        let scheme = key
            .public
            .scheme()
            .filter(|_| key.public.is_signing_key())
            .ok_or(TpmError::UnsupportedSignerType)?;
        Ok(ModuleSigner {
            module: self,
            key,
            scheme,
        })
    }

    /// Flushes a certified key that is no longer needed, making room for
    /// the next one.
    pub fn release_key(&mut self, key: CertifiedKey) -> Result<(), TpmError> {
        let position = self
            .transient
            .iter()
            .position(|&h| h == key.handle)
            .filter(|_| self.state == State::KeyCertified)
            .ok_or(TpmError::InvalidState("releasing a key this session does not hold"))?;
        self.execute(&FlushContextCmd {
            flush_handle: key.handle,
        })?;
        self.transient.remove(position);
        self.state = State::AkReady;
        debug!("Released certified key {:#010x}", key.handle);
        Ok(())
    }

    /// Flushes every transient object and closes the channel.
    pub fn close(mut self) -> Result<(), TpmError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), TpmError> {
        let mut result = Ok(());
        while let Some(handle) = self.transient.pop() {
            if let Err(e) = self.execute(&FlushContextCmd {
                flush_handle: handle,
            }) {
                warn!("Failed to flush {handle:#010x}: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.open = false;
        self.channel.close()?;
        result
    }

    fn create_and_load(
        &mut self,
        template: Public,
        outside_info: Vec<u8>,
    ) -> Result<(u32, CreateResp), TpmError> {
        let created = self.execute(&CreateCmd {
            parent_handle: self.srk,
            in_sensitive: SensitiveCreate::default(),
            in_public: template,
            outside_info,
            creation_pcr: vec![],
        })?;
        let loaded = self.execute(&LoadCmd {
            parent_handle: self.srk,
            in_private: created.out_private.clone(),
            in_public: created.out_public.clone(),
        })?;
        self.transient.push(loaded.object_handle);
        Ok((loaded.object_handle, created))
    }

    fn execute<T: TpmCommand>(&mut self, command: &T) -> Result<T::Response, TpmError> {
        debug!("Sending command {:#05x}", T::CODE);
        let response = self.channel.send(&command.serialize()?)?;
        T::Response::deserialize(&response)
    }
}

impl<C: ModuleChannel> Drop for Module<C> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.release() {
                warn!("Module session closed uncleanly: {e}");
            }
        }
    }
}

/// Signs through the module with a certified key.
pub struct ModuleSigner<'a, C: ModuleChannel> {
    module: &'a mut Module<C>,
    key: &'a CertifiedKey,
    scheme: SigScheme,
}

impl<C: ModuleChannel> RequestSigner for ModuleSigner<'_, C> {
    fn public(&self) -> &Public {
        &self.key.public
    }

    fn sign(&mut self, message: &[u8]) -> Result<Signature, TpmError> {
        let digest = self.scheme.hash.digest(message);
        let signed = self.module.execute(&SignCmd {
            key_handle: self.key.handle,
            digest,
            in_scheme: Some(self.scheme),
            validation: HashCheck::null(),
        })?;
        Ok(signed.signature)
    }
}

const PARENT_ATTRIBUTES: ObjectAttributes = ObjectAttributes::FIXED_TPM
    .union(ObjectAttributes::FIXED_PARENT)
    .union(ObjectAttributes::SENSITIVE_DATA_ORIGIN)
    .union(ObjectAttributes::USER_WITH_AUTH)
    .union(ObjectAttributes::NO_DA);

/// RSA-2048 storage root key with AES-128-CFB protection.
pub fn srk_template() -> Public {
    Public {
        name_alg: HashAlg::Sha256,
        attributes: PARENT_ATTRIBUTES
            .union(ObjectAttributes::RESTRICTED)
            .union(ObjectAttributes::DECRYPT),
        auth_policy: vec![],
        params: PublicParams::Rsa {
            symmetric: Some(SymDef { key_bits: 128 }),
            scheme: None,
            key_bits: 2048,
            exponent: 0,
            modulus: vec![],
        },
    }
}

pub fn ak_template(algorithm: AkAlgorithm) -> Public {
    let params = match algorithm {
        AkAlgorithm::Rsa2048 => PublicParams::Rsa {
            symmetric: None,
            scheme: Some(SigScheme::RSASSA_SHA256),
            key_bits: 2048,
            exponent: 0,
            modulus: vec![],
        },
        AkAlgorithm::EccP256 => PublicParams::Ecc {
            symmetric: None,
            scheme: Some(SigScheme::ECDSA_SHA256),
            curve: EccCurve::P256,
            x: vec![],
            y: vec![],
        },
    };
    Public {
        name_alg: HashAlg::Sha256,
        attributes: PARENT_ATTRIBUTES
            .union(ObjectAttributes::RESTRICTED)
            .union(ObjectAttributes::SIGN_ENCRYPT),
        auth_policy: vec![],
        params,
    }
}

pub fn key_template(algorithm: Algorithm, size: u16) -> Result<Public, TpmError> {
    let params = match (algorithm, size) {
        (Algorithm::Ecdsa, 256) => PublicParams::Ecc {
            symmetric: None,
            scheme: Some(SigScheme::ECDSA_SHA256),
            curve: EccCurve::P256,
            x: vec![],
            y: vec![],
        },
        (Algorithm::Ecdsa, 384) => PublicParams::Ecc {
            symmetric: None,
            scheme: Some(SigScheme::ECDSA_SHA384),
            curve: EccCurve::P384,
            x: vec![],
            y: vec![],
        },
        (Algorithm::Rsa, 2048) => PublicParams::Rsa {
            symmetric: None,
            scheme: Some(SigScheme::RSASSA_SHA256),
            key_bits: 2048,
            exponent: 0,
            modulus: vec![],
        },
        _ => {
            return Err(TpmError::UnsupportedAlgorithm(format!(
                "{algorithm:?} with size {size}"
            )))
        }
    };
    Ok(Public {
        name_alg: HashAlg::Sha256,
        attributes: PARENT_ATTRIBUTES.union(ObjectAttributes::SIGN_ENCRYPT),
        auth_policy: vec![],
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{
        error_response, Command, CreatePrimaryResp, FlushContextResp,
    };
    use crate::rc;
    use crate::structures::TkCreation;
    use platform::PlatformError;
    use std::cell::RefCell;
    use std::rc::Rc;

    const SRK_HANDLE: u32 = 0x8000_0000;
    const CLOSED: u32 = 0;

    /// Answers `CreatePrimary` and `FlushContext`, fails everything else,
    /// and records every command code it sees.
    struct ScriptedChannel {
        log: Rc<RefCell<Vec<u32>>>,
        fail_primary: bool,
    }

    impl ModuleChannel for ScriptedChannel {
        fn send(&mut self, command: &[u8]) -> Result<Vec<u8>, PlatformError> {
            let command = Command::deserialize(command).unwrap();
            self.log.borrow_mut().push(u32::from(&command));
            Ok(match command {
                Command::CreatePrimary(_) if self.fail_primary => error_response(rc::FAILURE),
                Command::CreatePrimary(cmd) => CreatePrimaryResp {
                    object_handle: SRK_HANDLE,
                    out_public: cmd.in_public.to_bytes().unwrap(),
                    creation_data: vec![],
                    creation_hash: vec![],
                    creation_ticket: TkCreation {
                        hierarchy: handle::RH_OWNER,
                        digest: vec![],
                    },
                    name: cmd.in_public.name().unwrap(),
                }
                .serialize(1).unwrap(),
                Command::FlushContext(_) => FlushContextResp.serialize(0).unwrap(),
                _ => error_response(rc::COMMAND_CODE),
            })
        }

        fn close(&mut self) -> Result<(), PlatformError> {
            self.log.borrow_mut().push(CLOSED);
            Ok(())
        }
    }

    fn scripted(fail_primary: bool) -> (ScriptedChannel, Rc<RefCell<Vec<u32>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        (
            ScriptedChannel {
                log: log.clone(),
                fail_primary,
            },
            log,
        )
    }

    fn ecdsa_config(qualifying_data: Vec<u8>) -> KeyConfig {
        KeyConfig {
            algorithm: Algorithm::Ecdsa,
            size: 256,
            qualifying_data,
        }
    }

    #[test]
    fn test_drop_flushes_and_closes() {
        let (channel, log) = scripted(false);
        let module = Module::open(channel).unwrap();
        drop(module);
        assert_eq!(
            *log.borrow(),
            [CreatePrimaryCmd::CODE, FlushContextCmd::CODE, CLOSED]
        );
    }

    #[test]
    fn test_close_is_not_repeated_by_drop() {
        let (channel, log) = scripted(false);
        Module::open(channel).unwrap().close().unwrap();
        assert_eq!(log.borrow().iter().filter(|&&c| c == CLOSED).count(), 1);
    }

    #[test]
    fn test_open_failure_still_closes_channel() {
        let (channel, log) = scripted(true);
        assert!(matches!(
            Module::open(channel),
            Err(TpmError::ResponseCode(rc::FAILURE))
        ));
        assert_eq!(*log.borrow(), [CreatePrimaryCmd::CODE, CLOSED]);
    }

    #[test]
    fn test_module_errors_propagate() {
        let (channel, _log) = scripted(false);
        let mut module = Module::open(channel).unwrap();
        assert!(matches!(
            module.create_ak(AkAlgorithm::Rsa2048),
            Err(TpmError::ResponseCode(rc::COMMAND_CODE))
        ));
    }

    #[test]
    fn test_certify_before_ak_is_invalid_state() {
        let (channel, log) = scripted(false);
        let mut module = Module::open(channel).unwrap();
        let foreign = AttestationKey {
            handle: 0x8000_0001,
            public: ak_template(AkAlgorithm::Rsa2048),
            public_area: vec![],
            scheme: SigScheme::RSASSA_SHA256,
        };
        assert!(matches!(
            module.certify_key(&foreign, &ecdsa_config(vec![0; 32])),
            Err(TpmError::InvalidState(_))
        ));
        assert_eq!(*log.borrow(), [CreatePrimaryCmd::CODE]);
    }

    #[test]
    fn test_oversized_qualifying_data_sends_nothing() {
        let (channel, log) = scripted(false);
        let mut module = Module::open(channel).unwrap();
        let foreign = AttestationKey {
            handle: 0x8000_0001,
            public: ak_template(AkAlgorithm::Rsa2048),
            public_area: vec![],
            scheme: SigScheme::RSASSA_SHA256,
        };
        assert!(matches!(
            module.certify_key(&foreign, &ecdsa_config(vec![0; 65])),
            Err(TpmError::QualifyingDataTooLarge(65))
        ));
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn test_key_templates() {
        assert!(key_template(Algorithm::Ecdsa, 256).unwrap().is_signing_key());
        assert_eq!(
            key_template(Algorithm::Ecdsa, 384).unwrap().scheme(),
            Some(SigScheme::ECDSA_SHA384)
        );
        assert!(matches!(
            key_template(Algorithm::Rsa, 1024),
            Err(TpmError::UnsupportedAlgorithm(_))
        ));
        assert!(!ak_template(AkAlgorithm::EccP256)
            .attributes
            .contains(ObjectAttributes::DECRYPT));
        assert!(srk_template().attributes.contains(ObjectAttributes::DECRYPT));
    }
}
