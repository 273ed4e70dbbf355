// Licensed under the Apache-2.0 license

use super::{TpmCommand, TpmResponse};
use crate::{
    marshal::{Reader, Writer},
    structures::{handle, st, SigScheme, Signature},
    TpmError,
};

/// `TPMT_TK_HASHCHECK`. Unrestricted keys sign with the null ticket.
#[derive(Debug, PartialEq, Eq)]
pub struct HashCheck {
    pub hierarchy: u32,
    pub digest: Vec<u8>,
}

impl HashCheck {
    pub fn null() -> HashCheck {
        HashCheck {
            hierarchy: handle::RH_NULL,
            digest: vec![],
        }
    }

    pub fn is_null(&self) -> bool {
        self.hierarchy == handle::RH_NULL && self.digest.is_empty()
    }
}

/// `TPM2_Sign` over an externally computed digest.
#[derive(Debug, PartialEq, Eq)]
pub struct SignCmd {
    pub key_handle: u32,
    pub digest: Vec<u8>,
    pub in_scheme: Option<SigScheme>,
    pub validation: HashCheck,
}

impl TpmCommand for SignCmd {
    const CODE: u32 = 0x0000_015D;
    const HANDLES: usize = 1;
    const AUTH_HANDLES: usize = 1;

    type Response = SignResp;

    fn handles(&self) -> Vec<u32> {
        vec![self.key_handle]
    }

    fn marshal_params(&self, w: &mut Writer) {
        w.tpm2b(&self.digest);
        SigScheme::marshal(self.in_scheme.as_ref(), w);
        w.u16(st::HASHCHECK);
        w.u32(self.validation.hierarchy);
        w.tpm2b(&self.validation.digest);
    }

    fn unmarshal(handles: &[u32], r: &mut Reader) -> Result<Self, TpmError> {
        let digest = r.tpm2b()?.to_vec();
        let in_scheme = SigScheme::unmarshal(r)?;
        if r.u16()? != st::HASHCHECK {
            return Err(TpmError::ResponseCode(crate::rc::TICKET));
        }
        Ok(SignCmd {
            key_handle: handles[0],
            digest,
            in_scheme,
            validation: HashCheck {
                hierarchy: r.u32()?,
                digest: r.tpm2b()?.to_vec(),
            },
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct SignResp {
    pub signature: Signature,
}

impl TpmResponse for SignResp {
    const HAS_HANDLE: bool = false;

    fn handle(&self) -> Option<u32> {
        None
    }

    fn marshal_params(&self, w: &mut Writer) {
        self.signature.marshal(w);
    }

    fn unmarshal(_handle: Option<u32>, r: &mut Reader) -> Result<Self, TpmError> {
        Ok(SignResp {
            signature: Signature::unmarshal(r)?,
        })
    }
}
