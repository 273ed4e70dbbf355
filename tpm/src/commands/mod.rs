/*++
Licensed under the Apache-2.0 license.

Abstract:
    TPM commands and responses used for key attestation, with serialization
    in both directions: the engine serializes commands and parses responses,
    the simulator does the reverse.
--*/
pub use self::certify_creation::{CertifyCreationCmd, CertifyCreationResp};
pub use self::create::{CreateCmd, CreateResp};
pub use self::create_primary::{CreatePrimaryCmd, CreatePrimaryResp};
pub use self::flush_context::{FlushContextCmd, FlushContextResp};
pub use self::load::{LoadCmd, LoadResp};
pub use self::sign::{HashCheck, SignCmd, SignResp};

use crate::{
    marshal::{Reader, Writer},
    rc,
    structures::{handle, st},
    TpmError,
};
use core::mem::size_of;
use zerocopy::{
    byteorder::big_endian::{U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
};

mod certify_creation;
mod create;
mod create_primary;
mod flush_context;
mod load;
mod sign;

/// Session attribute `continueSession`.
const CONTINUE_SESSION: u8 = 0x01;

/// A command of the supported subset.
pub trait TpmCommand: Sized {
    const CODE: u32;
    /// Number of handles in the handle area.
    const HANDLES: usize;
    /// Number of leading handles that take an authorization session.
    const AUTH_HANDLES: usize;

    type Response: TpmResponse;

    fn handles(&self) -> Vec<u32>;
    fn marshal_params(&self, w: &mut Writer);
    fn unmarshal(handles: &[u32], params: &mut Reader) -> Result<Self, TpmError>;

    /// Serializes the command with an empty password session for every
    /// authorized handle.
    fn serialize(&self) -> Result<Vec<u8>, TpmError> {
        let mut body = Writer::new();
        for handle in self.handles() {
            body.u32(handle);
        }
        if Self::AUTH_HANDLES > 0 {
            let mut auth = Writer::new();
            for _ in 0..Self::AUTH_HANDLES {
                auth.u32(handle::RS_PW);
                auth.tpm2b(&[]);
                auth.u8(CONTINUE_SESSION);
                auth.tpm2b(&[]);
            }
            body.u32(auth.len() as u32);
            body.raw(&auth.finish()?);
        }
        self.marshal_params(&mut body);

        let tag = if Self::AUTH_HANDLES > 0 {
            st::SESSIONS
        } else {
            st::NO_SESSIONS
        };
        Ok(frame(tag, Self::CODE, body.finish()?))
    }
}

/// The response to a [`TpmCommand`].
pub trait TpmResponse: Sized {
    /// Whether an object handle precedes the response parameters.
    const HAS_HANDLE: bool;

    fn handle(&self) -> Option<u32>;
    fn marshal_params(&self, w: &mut Writer);
    fn unmarshal(handle: Option<u32>, params: &mut Reader) -> Result<Self, TpmError>;

    /// Serializes a successful response.
    ///
    /// # Arguments
    ///
    /// * `sessions` - Number of sessions the command carried. Each gets a
    ///   password acknowledgement in the response.
    fn serialize(&self, sessions: usize) -> Result<Vec<u8>, TpmError> {
        let mut body = Writer::new();
        if let Some(handle) = self.handle() {
            body.u32(handle);
        }
        let mut params = Writer::new();
        self.marshal_params(&mut params);
        if sessions > 0 {
            body.u32(params.len() as u32);
            body.raw(&params.finish()?);
            for _ in 0..sessions {
                body.tpm2b(&[]);
                body.u8(CONTINUE_SESSION);
                body.tpm2b(&[]);
            }
        } else {
            body.raw(&params.finish()?);
        }

        let tag = if sessions > 0 {
            st::SESSIONS
        } else {
            st::NO_SESSIONS
        };
        Ok(frame(tag, rc::SUCCESS, body.finish()?))
    }

    /// Parses a response buffer. A non-zero response code becomes
    /// `TpmError::ResponseCode`.
    fn deserialize(bytes: &[u8]) -> Result<Self, TpmError> {
        let (header, body) = ResponseHdr::read_from_prefix(bytes)
            .map_err(|_| TpmError::Malformed("response header"))?;
        if header.size.get() as usize != bytes.len() {
            return Err(TpmError::Malformed("response size"));
        }
        if header.rc.get() != rc::SUCCESS {
            return Err(TpmError::ResponseCode(header.rc.get()));
        }

        let mut r = Reader::new(body);
        let handle = if Self::HAS_HANDLE {
            Some(r.u32()?)
        } else {
            None
        };
        match header.tag.get() {
            st::SESSIONS => {
                let size = r.u32()? as usize;
                let mut params = Reader::new(r.take(size)?);
                let response = Self::unmarshal(handle, &mut params)?;
                params.finish()?;
                Ok(response)
            }
            st::NO_SESSIONS => {
                let response = Self::unmarshal(handle, &mut r)?;
                r.finish()?;
                Ok(response)
            }
            _ => Err(TpmError::Malformed("response tag")),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    CreatePrimary(CreatePrimaryCmd),
    Create(CreateCmd),
    Load(LoadCmd),
    CertifyCreation(CertifyCreationCmd),
    Sign(SignCmd),
    FlushContext(FlushContextCmd),
}

impl Command {
    /// Returns the command with its parameters given a slice of bytes.
    ///
    /// Failures carry the response code a module would report where one
    /// applies.
    ///
    /// # Arguments
    ///
    /// * `bytes` - serialized command
    pub fn deserialize(bytes: &[u8]) -> Result<Command, TpmError> {
        let (header, body) = CommandHdr::read_from_prefix(bytes)
            .map_err(|_| TpmError::ResponseCode(rc::SIZE))?;
        if header.size.get() as usize != bytes.len() {
            return Err(TpmError::ResponseCode(rc::SIZE));
        }
        let tag = header.tag.get();

        match header.code.get() {
            CreatePrimaryCmd::CODE => Self::parse_command(Command::CreatePrimary, tag, body),
            CreateCmd::CODE => Self::parse_command(Command::Create, tag, body),
            LoadCmd::CODE => Self::parse_command(Command::Load, tag, body),
            CertifyCreationCmd::CODE => Self::parse_command(Command::CertifyCreation, tag, body),
            SignCmd::CODE => Self::parse_command(Command::Sign, tag, body),
            FlushContextCmd::CODE => Self::parse_command(Command::FlushContext, tag, body),
            _ => Err(TpmError::ResponseCode(rc::COMMAND_CODE)),
        }
    }

    fn parse_command<T: TpmCommand>(
        build: impl FnOnce(T) -> Command,
        tag: u16,
        bytes: &[u8],
    ) -> Result<Command, TpmError> {
        let expected = if T::AUTH_HANDLES > 0 {
            st::SESSIONS
        } else {
            st::NO_SESSIONS
        };
        if tag != expected {
            return Err(TpmError::ResponseCode(rc::BAD_TAG));
        }

        let mut r = Reader::new(bytes);
        let handles = (0..T::HANDLES)
            .map(|_| r.u32())
            .collect::<Result<Vec<_>, _>>()?;
        if T::AUTH_HANDLES > 0 {
            let size = r.u32()? as usize;
            let mut auth = Reader::new(r.take(size)?);
            for _ in 0..T::AUTH_HANDLES {
                if auth.u32()? != handle::RS_PW {
                    return Err(TpmError::ResponseCode(rc::HANDLE));
                }
                auth.tpm2b()?;
                auth.u8()?;
                auth.tpm2b()?;
            }
            auth.finish()?;
        }
        let command = T::unmarshal(&handles, &mut r)?;
        r.finish()?;
        Ok(build(command))
    }

    /// Number of authorization sessions the command carries.
    pub fn sessions(&self) -> usize {
        match self {
            Command::CreatePrimary(_) => CreatePrimaryCmd::AUTH_HANDLES,
            Command::Create(_) => CreateCmd::AUTH_HANDLES,
            Command::Load(_) => LoadCmd::AUTH_HANDLES,
            Command::CertifyCreation(_) => CertifyCreationCmd::AUTH_HANDLES,
            Command::Sign(_) => SignCmd::AUTH_HANDLES,
            Command::FlushContext(_) => FlushContextCmd::AUTH_HANDLES,
        }
    }
}

impl From<&Command> for u32 {
    fn from(cmd: &Command) -> u32 {
        match cmd {
            Command::CreatePrimary(_) => CreatePrimaryCmd::CODE,
            Command::Create(_) => CreateCmd::CODE,
            Command::Load(_) => LoadCmd::CODE,
            Command::CertifyCreation(_) => CertifyCreationCmd::CODE,
            Command::Sign(_) => SignCmd::CODE,
            Command::FlushContext(_) => FlushContextCmd::CODE,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Response {
    CreatePrimary(CreatePrimaryResp),
    Create(CreateResp),
    Load(LoadResp),
    CertifyCreation(CertifyCreationResp),
    Sign(SignResp),
    FlushContext(FlushContextResp),
}

impl Response {
    pub fn serialize(&self, sessions: usize) -> Result<Vec<u8>, TpmError> {
        match self {
            Response::CreatePrimary(response) => response.serialize(sessions),
            Response::Create(response) => response.serialize(sessions),
            Response::Load(response) => response.serialize(sessions),
            Response::CertifyCreation(response) => response.serialize(sessions),
            Response::Sign(response) => response.serialize(sessions),
            Response::FlushContext(response) => response.serialize(sessions),
        }
    }
}

/// A bare header carrying a failure code.
pub fn error_response(code: u32) -> Vec<u8> {
    frame(st::NO_SESSIONS, code, Vec::new())
}

fn frame(tag: u16, code: u32, body: Vec<u8>) -> Vec<u8> {
    let header = CommandHdr {
        tag: U16::new(tag),
        size: U32::new((size_of::<CommandHdr>() + body.len()) as u32),
        code: U32::new(code),
    };
    let mut bytes = header.as_bytes().to_vec();
    bytes.extend(body);
    bytes
}

// Wire headers

#[repr(C)]
#[derive(Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct CommandHdr {
    pub tag: U16,
    pub size: U32,
    pub code: U32,
}

#[repr(C)]
#[derive(Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ResponseHdr {
    pub tag: U16,
    pub size: U32,
    pub rc: U32,
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::structures::{
        EccCurve, HashAlg, ObjectAttributes, Public, PublicParams, SensitiveCreate, SigScheme,
        Signature, TkCreation,
    };

    pub fn ecc_template() -> Public {
        Public {
            name_alg: HashAlg::Sha256,
            attributes: ObjectAttributes::SIGN_ENCRYPT | ObjectAttributes::USER_WITH_AUTH,
            auth_policy: vec![],
            params: PublicParams::Ecc {
                symmetric: None,
                scheme: Some(SigScheme::ECDSA_SHA256),
                curve: EccCurve::P256,
                x: vec![],
                y: vec![],
            },
        }
    }

    #[test]
    fn test_header_size() {
        assert_eq!(size_of::<CommandHdr>(), 10);
        assert_eq!(size_of::<ResponseHdr>(), 10);
    }

    #[test]
    fn test_flush_context_bytes() {
        let bytes = FlushContextCmd {
            flush_handle: 0x8000_0001,
        }
        .serialize().unwrap();
        assert_eq!(
            bytes,
            [0x80, 0x01, 0x00, 0x00, 0x00, 0x0e, 0x00, 0x00, 0x01, 0x65, 0x80, 0x00, 0x00, 0x01]
        );
        assert_eq!(
            Command::deserialize(&bytes).unwrap(),
            Command::FlushContext(FlushContextCmd {
                flush_handle: 0x8000_0001
            })
        );
    }

    #[test]
    fn test_create_carries_password_session() {
        let cmd = CreateCmd {
            parent_handle: 0x8000_0000,
            in_sensitive: SensitiveCreate::default(),
            in_public: ecc_template(),
            outside_info: vec![0x42; 32],
            creation_pcr: vec![],
        };
        let bytes = cmd.serialize().unwrap();
        assert_eq!(&bytes[0..2], &[0x80, 0x02]);
        assert_eq!(&bytes[6..10], &[0x00, 0x00, 0x01, 0x53]);
        assert_eq!(&bytes[10..14], &[0x80, 0x00, 0x00, 0x00]);
        // authorizationSize, TPM_RS_PW, empty nonce, continueSession, empty password
        assert_eq!(
            &bytes[14..27],
            &[0, 0, 0, 9, 0x40, 0, 0, 0x09, 0, 0, 0x01, 0, 0]
        );

        let Command::Create(parsed) = Command::deserialize(&bytes).unwrap() else {
            panic!("expected Create");
        };
        assert_eq!(parsed, cmd);
    }

    #[test]
    fn test_oversized_parameter_fails_serialization() {
        let cmd = CreateCmd {
            parent_handle: 0x8000_0000,
            in_sensitive: SensitiveCreate::default(),
            in_public: ecc_template(),
            outside_info: vec![0; 0x1_0000],
            creation_pcr: vec![],
        };
        assert!(matches!(cmd.serialize(), Err(TpmError::Oversized(0x1_0000))));
    }

    #[test]
    fn test_deserialize_rejects_bad_input() {
        let mut bytes = FlushContextCmd { flush_handle: 1 }.serialize().unwrap();
        bytes[9] = 0x99;
        assert!(matches!(
            Command::deserialize(&bytes),
            Err(TpmError::ResponseCode(rc::COMMAND_CODE))
        ));

        let mut bytes = FlushContextCmd { flush_handle: 1 }.serialize().unwrap();
        bytes[1] = 0x02;
        assert!(matches!(
            Command::deserialize(&bytes),
            Err(TpmError::ResponseCode(rc::BAD_TAG))
        ));

        let bytes = FlushContextCmd { flush_handle: 1 }.serialize().unwrap();
        assert!(matches!(
            Command::deserialize(&bytes[..12]),
            Err(TpmError::ResponseCode(rc::SIZE))
        ));
    }

    #[test]
    fn test_response_with_handle_and_sessions() {
        let response = LoadResp {
            object_handle: 0x8000_0002,
            name: vec![0x00, 0x0b, 1, 2, 3],
        };
        let bytes = response.serialize(1).unwrap();
        assert_eq!(&bytes[0..2], &[0x80, 0x02]);
        assert_eq!(&bytes[10..14], &[0x80, 0x00, 0x00, 0x02]);
        assert_eq!(LoadResp::deserialize(&bytes).unwrap(), response);
    }

    #[test]
    fn test_response_codes_surface_as_errors() {
        let bytes = error_response(rc::HANDLE);
        assert!(matches!(
            SignResp::deserialize(&bytes),
            Err(TpmError::ResponseCode(rc::HANDLE))
        ));

        let mut bytes = SignResp {
            signature: Signature::Ecdsa {
                hash: HashAlg::Sha256,
                r: vec![1; 32],
                s: vec![2; 32],
            },
        }
        .serialize(1).unwrap();
        bytes.push(0);
        assert!(matches!(
            SignResp::deserialize(&bytes),
            Err(TpmError::Malformed("response size"))
        ));
    }

    #[test]
    fn test_certify_creation_round_trip() {
        let cmd = CertifyCreationCmd {
            sign_handle: 0x8000_0001,
            object_handle: 0x8000_0003,
            qualifying_data: vec![7; 32],
            creation_hash: vec![8; 32],
            in_scheme: Some(SigScheme::RSASSA_SHA256),
            creation_ticket: TkCreation {
                hierarchy: handle::RH_OWNER,
                digest: vec![9; 32],
            },
        };
        let bytes = cmd.serialize().unwrap();
        assert_eq!(
            Command::deserialize(&bytes).unwrap(),
            Command::CertifyCreation(cmd)
        );
    }
}
