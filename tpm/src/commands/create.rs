// Licensed under the Apache-2.0 license

use super::{TpmCommand, TpmResponse};
use crate::{
    marshal::{Reader, Writer},
    structures::{PcrSelection, Public, SensitiveCreate, TkCreation},
    TpmError,
};

/// `TPM2_Create`: creates an ordinary object under a loaded storage parent.
///
/// `outside_info` is copied verbatim into the creation data, so whatever the
/// caller passes here is covered by the creation hash and ticket.
#[derive(Debug, PartialEq, Eq)]
pub struct CreateCmd {
    pub parent_handle: u32,
    pub in_sensitive: SensitiveCreate,
    pub in_public: Public,
    pub outside_info: Vec<u8>,
    pub creation_pcr: Vec<PcrSelection>,
}

impl TpmCommand for CreateCmd {
    const CODE: u32 = 0x0000_0153;
    const HANDLES: usize = 1;
    const AUTH_HANDLES: usize = 1;

    type Response = CreateResp;

    fn handles(&self) -> Vec<u32> {
        vec![self.parent_handle]
    }

    fn marshal_params(&self, w: &mut Writer) {
        self.in_sensitive.marshal(w);
        w.sized(|w| self.in_public.marshal(w));
        w.tpm2b(&self.outside_info);
        PcrSelection::marshal_list(&self.creation_pcr, w);
    }

    fn unmarshal(handles: &[u32], r: &mut Reader) -> Result<Self, TpmError> {
        Ok(CreateCmd {
            parent_handle: handles[0],
            in_sensitive: SensitiveCreate::unmarshal(r)?,
            in_public: r.sized(Public::unmarshal)?,
            outside_info: r.tpm2b()?.to_vec(),
            creation_pcr: PcrSelection::unmarshal_list(r)?,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct CreateResp {
    pub out_private: Vec<u8>,
    pub out_public: Vec<u8>,
    pub creation_data: Vec<u8>,
    pub creation_hash: Vec<u8>,
    pub creation_ticket: TkCreation,
}

impl TpmResponse for CreateResp {
    const HAS_HANDLE: bool = false;

    fn handle(&self) -> Option<u32> {
        None
    }

    fn marshal_params(&self, w: &mut Writer) {
        w.tpm2b(&self.out_private);
        w.tpm2b(&self.out_public);
        w.tpm2b(&self.creation_data);
        w.tpm2b(&self.creation_hash);
        self.creation_ticket.marshal(w);
    }

    fn unmarshal(_handle: Option<u32>, r: &mut Reader) -> Result<Self, TpmError> {
        Ok(CreateResp {
            out_private: r.tpm2b()?.to_vec(),
            out_public: r.tpm2b()?.to_vec(),
            creation_data: r.tpm2b()?.to_vec(),
            creation_hash: r.tpm2b()?.to_vec(),
            creation_ticket: TkCreation::unmarshal(r)?,
        })
    }
}
