// Licensed under the Apache-2.0 license

use crate::{frame_size, ModuleChannel, PlatformError, HEADER_SIZE};
use log::debug;
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Channel to a simulator process listening on a Unix socket.
///
/// Frames carry no extra envelope: the size field of the TPM header tells
/// the reader where each command or response ends.
pub struct SocketChannel {
    stream: Option<UnixStream>,
}

impl SocketChannel {
    pub fn connect(path: &Path) -> Result<SocketChannel, PlatformError> {
        let stream = UnixStream::connect(path).map_err(|source| PlatformError::Unavailable {
            path: path.display().to_string(),
            source,
        })?;
        debug!("Connected to module simulator at {}", path.display());
        Ok(SocketChannel {
            stream: Some(stream),
        })
    }
}

impl ModuleChannel for SocketChannel {
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>, PlatformError> {
        let stream = self.stream.as_mut().ok_or(PlatformError::Closed)?;
        stream.write_all(command)?;
        read_frame(stream)?.ok_or(PlatformError::Frame("simulator closed the connection"))
    }

    fn close(&mut self) -> Result<(), PlatformError> {
        let stream = self.stream.take().ok_or(PlatformError::Closed)?;
        stream.shutdown(Shutdown::Both)?;
        Ok(())
    }
}

/// Reads one self-delimited frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly before sending
/// a new header.
pub fn read_frame(reader: &mut impl Read) -> Result<Option<Vec<u8>>, PlatformError> {
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = reader.read(&mut header[filled..])?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(PlatformError::Frame("truncated header"))
            };
        }
        filled += n;
    }

    let size = frame_size(&header)?;
    let mut frame = vec![0u8; size];
    frame[..HEADER_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut frame[HEADER_SIZE..])?;
    Ok(Some(frame))
}
