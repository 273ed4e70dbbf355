// Licensed under the Apache-2.0 license

use super::{TpmCommand, TpmResponse};
use crate::{
    marshal::{Reader, Writer},
    TpmError,
};

/// `TPM2_FlushContext`. The handle travels as a parameter, not in the handle
/// area, so the command takes no authorization.
#[derive(Debug, PartialEq, Eq)]
pub struct FlushContextCmd {
    pub flush_handle: u32,
}

impl TpmCommand for FlushContextCmd {
    const CODE: u32 = 0x0000_0165;
    const HANDLES: usize = 0;
    const AUTH_HANDLES: usize = 0;

    type Response = FlushContextResp;

    fn handles(&self) -> Vec<u32> {
        vec![]
    }

    fn marshal_params(&self, w: &mut Writer) {
        w.u32(self.flush_handle);
    }

    fn unmarshal(_handles: &[u32], r: &mut Reader) -> Result<Self, TpmError> {
        Ok(FlushContextCmd {
            flush_handle: r.u32()?,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct FlushContextResp;

impl TpmResponse for FlushContextResp {
    const HAS_HANDLE: bool = false;

    fn handle(&self) -> Option<u32> {
        None
    }

    fn marshal_params(&self, _w: &mut Writer) {}

    fn unmarshal(_handle: Option<u32>, _r: &mut Reader) -> Result<Self, TpmError> {
        Ok(FlushContextResp)
    }
}
