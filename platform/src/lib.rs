/*++
Licensed under the Apache-2.0 license.
Abstract:
    Command channel to a platform module (TPM). The channel only moves
    opaque command/response buffers; it knows nothing about their contents.
--*/

pub use device::DeviceChannel;
pub use socket::{read_frame, SocketChannel};

mod device;
mod socket;

use std::path::PathBuf;

pub const DEFAULT_DEVICE_PATH: &str = "/dev/tpmrm0";
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/tpm-sim.socket";

/// Size of the tag/size/code header every command and response starts with.
pub const HEADER_SIZE: usize = 10;
/// Largest command or response buffer accepted on any channel.
pub const MAX_BUFFER_SIZE: usize = 4096;

#[derive(thiserror::Error, Debug)]
pub enum PlatformError {
    #[error("module unavailable at {path}: {source}")]
    Unavailable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("module channel I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Frame(&'static str),
    #[error("module channel already closed")]
    Closed,
}

/// Capability to exchange raw command buffers with a module.
///
/// One implementation exists per transport; the attestation engine only
/// ever sees this trait.
pub trait ModuleChannel {
    /// Sends one complete command and blocks until its complete response
    /// arrives.
    ///
    /// # Arguments
    ///
    /// * `command` - Serialized command, header included.
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>, PlatformError>;

    /// Releases the underlying transport. Later `send` calls fail with
    /// `PlatformError::Closed`.
    fn close(&mut self) -> Result<(), PlatformError>;
}

impl<T: ModuleChannel + ?Sized> ModuleChannel for Box<T> {
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>, PlatformError> {
        (**self).send(command)
    }

    fn close(&mut self) -> Result<(), PlatformError> {
        (**self).close()
    }
}

/// Where a hardware-backed channel should be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// A kernel device node such as the TPM resource manager.
    Device(PathBuf),
    /// A simulator listening on a Unix socket.
    Socket(PathBuf),
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Device(PathBuf::from(DEFAULT_DEVICE_PATH))
    }
}

/// Opens the channel described by `transport`.
pub fn open(transport: &Transport) -> Result<Box<dyn ModuleChannel>, PlatformError> {
    match transport {
        Transport::Device(path) => Ok(Box::new(DeviceChannel::open(path)?)),
        Transport::Socket(path) => Ok(Box::new(SocketChannel::connect(path)?)),
    }
}

/// Reads the total size field out of a command or response header.
pub fn frame_size(header: &[u8]) -> Result<usize, PlatformError> {
    let size: [u8; 4] = header
        .get(2..6)
        .and_then(|b| b.try_into().ok())
        .ok_or(PlatformError::Frame("short header"))?;
    let size = u32::from_be_bytes(size) as usize;
    if size < HEADER_SIZE {
        return Err(PlatformError::Frame("size smaller than header"));
    }
    if size > MAX_BUFFER_SIZE {
        return Err(PlatformError::Frame("size exceeds maximum buffer"));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        let header = [0x80, 0x01, 0x00, 0x00, 0x00, 0x0a, 0x00, 0x00, 0x01, 0x65];
        assert_eq!(frame_size(&header).unwrap(), 10);
        assert!(matches!(
            frame_size(&[0x80, 0x01, 0x00, 0x00, 0x00, 0x04]),
            Err(PlatformError::Frame(_))
        ));
        assert!(matches!(
            frame_size(&[0x80, 0x01, 0x00, 0x01, 0x00, 0x00]),
            Err(PlatformError::Frame(_))
        ));
        assert!(frame_size(&[0x80]).is_err());
    }

    #[test]
    fn test_open_missing_device_is_unavailable() {
        let transport = Transport::Device(PathBuf::from("/nonexistent/tpm-device"));
        assert!(matches!(
            open(&transport),
            Err(PlatformError::Unavailable { .. })
        ));
    }

    #[test]
    fn test_open_missing_socket_is_unavailable() {
        let transport = Transport::Socket(PathBuf::from("/nonexistent/tpm-sim.socket"));
        assert!(matches!(
            open(&transport),
            Err(PlatformError::Unavailable { .. })
        ));
    }
}
