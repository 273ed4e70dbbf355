// Licensed under the Apache-2.0 license

use crate::{frame_size, ModuleChannel, PlatformError, MAX_BUFFER_SIZE};
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

/// Channel to a TPM character device.
///
/// The kernel driver takes one whole command per `write` and hands back one
/// whole response per `read`.
pub struct DeviceChannel {
    file: Option<File>,
}

impl DeviceChannel {
    pub fn open(path: &Path) -> Result<DeviceChannel, PlatformError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| PlatformError::Unavailable {
                path: path.display().to_string(),
                source,
            })?;
        debug!("Opened module device {}", path.display());
        Ok(DeviceChannel { file: Some(file) })
    }
}

impl ModuleChannel for DeviceChannel {
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>, PlatformError> {
        let file = self.file.as_mut().ok_or(PlatformError::Closed)?;
        file.write_all(command)?;

        let mut response = vec![0u8; MAX_BUFFER_SIZE];
        let len = file.read(&mut response)?;
        response.truncate(len);

        if frame_size(&response)? != len {
            return Err(PlatformError::Frame("response size does not match header"));
        }
        Ok(response)
    }

    fn close(&mut self) -> Result<(), PlatformError> {
        self.file.take().ok_or(PlatformError::Closed).map(drop)
    }
}
