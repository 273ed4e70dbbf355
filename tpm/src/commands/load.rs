// Licensed under the Apache-2.0 license

use super::{TpmCommand, TpmResponse};
use crate::{
    marshal::{Reader, Writer},
    TpmError,
};

/// `TPM2_Load`. The public area is passed through exactly as `Create`
/// returned it.
#[derive(Debug, PartialEq, Eq)]
pub struct LoadCmd {
    pub parent_handle: u32,
    pub in_private: Vec<u8>,
    pub in_public: Vec<u8>,
}

impl TpmCommand for LoadCmd {
    const CODE: u32 = 0x0000_0157;
    const HANDLES: usize = 1;
    const AUTH_HANDLES: usize = 1;

    type Response = LoadResp;

    fn handles(&self) -> Vec<u32> {
        vec![self.parent_handle]
    }

    fn marshal_params(&self, w: &mut Writer) {
        w.tpm2b(&self.in_private);
        w.tpm2b(&self.in_public);
    }

    fn unmarshal(handles: &[u32], r: &mut Reader) -> Result<Self, TpmError> {
        Ok(LoadCmd {
            parent_handle: handles[0],
            in_private: r.tpm2b()?.to_vec(),
            in_public: r.tpm2b()?.to_vec(),
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct LoadResp {
    pub object_handle: u32,
    pub name: Vec<u8>,
}

impl TpmResponse for LoadResp {
    const HAS_HANDLE: bool = true;

    fn handle(&self) -> Option<u32> {
        Some(self.object_handle)
    }

    fn marshal_params(&self, w: &mut Writer) {
        w.tpm2b(&self.name);
    }

    fn unmarshal(handle: Option<u32>, r: &mut Reader) -> Result<Self, TpmError> {
        Ok(LoadResp {
            object_handle: handle.ok_or(TpmError::Malformed("missing object handle"))?,
            name: r.tpm2b()?.to_vec(),
        })
    }
}
