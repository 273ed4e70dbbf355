// Licensed under the Apache-2.0 license

//! Big-endian marshalling primitives shared by every TPM structure.

use crate::TpmError;

/// Marshals into a growing buffer. A `TPM2B` too large for its u16 size
/// prefix is remembered and reported by [`Writer::finish`].
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
    oversized: Option<usize>,
}

impl Writer {
    pub fn new() -> Writer {
        Writer::default()
    }

    pub fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Writes a `TPM2B` buffer: a u16 size followed by the bytes.
    pub fn tpm2b(&mut self, bytes: &[u8]) {
        match u16::try_from(bytes.len()) {
            Ok(len) => {
                self.u16(len);
                self.raw(bytes);
            }
            Err(_) => {
                self.oversized.get_or_insert(bytes.len());
            }
        }
    }

    /// Writes a `TPM2B` wrapping a structure marshalled by `f`.
    pub fn sized(&mut self, f: impl FnOnce(&mut Writer)) {
        let mut inner = Writer::new();
        f(&mut inner);
        if let Some(len) = inner.oversized {
            self.oversized.get_or_insert(len);
        }
        self.tpm2b(&inner.buf);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Result<Vec<u8>, TpmError> {
        match self.oversized {
            Some(len) => Err(TpmError::Oversized(len)),
            None => Ok(self.buf),
        }
    }
}

pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf }
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], TpmError> {
        if self.buf.len() < len {
            return Err(TpmError::Malformed("buffer too short"));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], TpmError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, TpmError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, TpmError> {
        self.array().map(u16::from_be_bytes)
    }

    pub fn u32(&mut self) -> Result<u32, TpmError> {
        self.array().map(u32::from_be_bytes)
    }

    pub fn u64(&mut self) -> Result<u64, TpmError> {
        self.array().map(u64::from_be_bytes)
    }

    pub fn tpm2b(&mut self) -> Result<&'a [u8], TpmError> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    /// Reads a `TPM2B` and hands its contents to `f` as a nested reader,
    /// which must consume it exactly.
    pub fn sized<T>(
        &mut self,
        f: impl FnOnce(&mut Reader<'a>) -> Result<T, TpmError>,
    ) -> Result<T, TpmError> {
        let mut inner = Reader::new(self.tpm2b()?);
        let value = f(&mut inner)?;
        inner.finish()?;
        Ok(value)
    }

    pub fn remaining(&self) -> &'a [u8] {
        self.buf
    }

    pub fn finish(&self) -> Result<(), TpmError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(TpmError::Malformed("trailing bytes"))
        }
    }
}
