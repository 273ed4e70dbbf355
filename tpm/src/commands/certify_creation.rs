// Licensed under the Apache-2.0 license

use super::{TpmCommand, TpmResponse};
use crate::{
    marshal::{Reader, Writer},
    structures::{SigScheme, Signature, TkCreation},
    TpmError,
};

/// `TPM2_CertifyCreation`: the key at `sign_handle` attests that the object
/// at `object_handle` was created by this module with the given creation
/// hash. `qualifying_data` is returned as `extraData` of the attestation.
#[derive(Debug, PartialEq, Eq)]
pub struct CertifyCreationCmd {
    pub sign_handle: u32,
    pub object_handle: u32,
    pub qualifying_data: Vec<u8>,
    pub creation_hash: Vec<u8>,
    pub in_scheme: Option<SigScheme>,
    pub creation_ticket: TkCreation,
}

impl TpmCommand for CertifyCreationCmd {
    const CODE: u32 = 0x0000_014A;
    const HANDLES: usize = 2;
    const AUTH_HANDLES: usize = 1;

    type Response = CertifyCreationResp;

    fn handles(&self) -> Vec<u32> {
        vec![self.sign_handle, self.object_handle]
    }

    fn marshal_params(&self, w: &mut Writer) {
        w.tpm2b(&self.qualifying_data);
        w.tpm2b(&self.creation_hash);
        SigScheme::marshal(self.in_scheme.as_ref(), w);
        self.creation_ticket.marshal(w);
    }

    fn unmarshal(handles: &[u32], r: &mut Reader) -> Result<Self, TpmError> {
        Ok(CertifyCreationCmd {
            sign_handle: handles[0],
            object_handle: handles[1],
            qualifying_data: r.tpm2b()?.to_vec(),
            creation_hash: r.tpm2b()?.to_vec(),
            in_scheme: SigScheme::unmarshal(r)?,
            creation_ticket: TkCreation::unmarshal(r)?,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct CertifyCreationResp {
    /// Marshalled `TPMS_ATTEST`, exactly the bytes `signature` covers.
    pub certify_info: Vec<u8>,
    pub signature: Signature,
}

impl TpmResponse for CertifyCreationResp {
    const HAS_HANDLE: bool = false;

    fn handle(&self) -> Option<u32> {
        None
    }

    fn marshal_params(&self, w: &mut Writer) {
        w.tpm2b(&self.certify_info);
        self.signature.marshal(w);
    }

    fn unmarshal(_handle: Option<u32>, r: &mut Reader) -> Result<Self, TpmError> {
        Ok(CertifyCreationResp {
            certify_info: r.tpm2b()?.to_vec(),
            signature: Signature::unmarshal(r)?,
        })
    }
}
