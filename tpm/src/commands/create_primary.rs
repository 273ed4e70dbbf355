// Licensed under the Apache-2.0 license

use super::{TpmCommand, TpmResponse};
use crate::{
    marshal::{Reader, Writer},
    structures::{PcrSelection, Public, SensitiveCreate, TkCreation},
    TpmError,
};

/// `TPM2_CreatePrimary`: derives a primary object from a hierarchy seed.
#[derive(Debug, PartialEq, Eq)]
pub struct CreatePrimaryCmd {
    pub primary_handle: u32,
    pub in_sensitive: SensitiveCreate,
    pub in_public: Public,
    pub outside_info: Vec<u8>,
    pub creation_pcr: Vec<PcrSelection>,
}

impl TpmCommand for CreatePrimaryCmd {
    const CODE: u32 = 0x0000_0131;
    const HANDLES: usize = 1;
    const AUTH_HANDLES: usize = 1;

    type Response = CreatePrimaryResp;

    fn handles(&self) -> Vec<u32> {
        vec![self.primary_handle]
    }

    fn marshal_params(&self, w: &mut Writer) {
        self.in_sensitive.marshal(w);
        w.sized(|w| self.in_public.marshal(w));
        w.tpm2b(&self.outside_info);
        PcrSelection::marshal_list(&self.creation_pcr, w);
    }

    fn unmarshal(handles: &[u32], r: &mut Reader) -> Result<Self, TpmError> {
        Ok(CreatePrimaryCmd {
            primary_handle: handles[0],
            in_sensitive: SensitiveCreate::unmarshal(r)?,
            in_public: r.sized(Public::unmarshal)?,
            outside_info: r.tpm2b()?.to_vec(),
            creation_pcr: PcrSelection::unmarshal_list(r)?,
        })
    }
}

/// Public area, creation data and attestation are kept as the module
/// marshalled them; names and signatures are computed over those bytes.
#[derive(Debug, PartialEq, Eq)]
pub struct CreatePrimaryResp {
    pub object_handle: u32,
    pub out_public: Vec<u8>,
    pub creation_data: Vec<u8>,
    pub creation_hash: Vec<u8>,
    pub creation_ticket: TkCreation,
    pub name: Vec<u8>,
}

impl TpmResponse for CreatePrimaryResp {
    const HAS_HANDLE: bool = true;

    fn handle(&self) -> Option<u32> {
        Some(self.object_handle)
    }

    fn marshal_params(&self, w: &mut Writer) {
        w.tpm2b(&self.out_public);
        w.tpm2b(&self.creation_data);
        w.tpm2b(&self.creation_hash);
        self.creation_ticket.marshal(w);
        w.tpm2b(&self.name);
    }

    fn unmarshal(handle: Option<u32>, r: &mut Reader) -> Result<Self, TpmError> {
        Ok(CreatePrimaryResp {
            object_handle: handle.ok_or(TpmError::Malformed("missing object handle"))?,
            out_public: r.tpm2b()?.to_vec(),
            creation_data: r.tpm2b()?.to_vec(),
            creation_hash: r.tpm2b()?.to_vec(),
            creation_ticket: TkCreation::unmarshal(r)?,
            name: r.tpm2b()?.to_vec(),
        })
    }
}
