// Licensed under the Apache-2.0 license

use crate::Simulator;
use platform::{frame_size, ModuleChannel, PlatformError};
use std::{cell::RefCell, rc::Rc};

/// In-process channel to a [`Simulator`].
pub struct SimulatorChannel {
    simulator: Option<Rc<RefCell<Simulator>>>,
}

impl Default for SimulatorChannel {
    fn default() -> Self {
        SimulatorChannel::new()
    }
}

impl SimulatorChannel {
    /// A channel to a freshly seeded simulator of its own.
    pub fn new() -> SimulatorChannel {
        SimulatorChannel::attach(Rc::new(RefCell::new(Simulator::new())))
    }

    /// A channel to a simulator the caller keeps a handle on.
    pub fn attach(simulator: Rc<RefCell<Simulator>>) -> SimulatorChannel {
        SimulatorChannel {
            simulator: Some(simulator),
        }
    }
}

impl ModuleChannel for SimulatorChannel {
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>, PlatformError> {
        let simulator = self.simulator.as_ref().ok_or(PlatformError::Closed)?;
        if frame_size(command)? != command.len() {
            return Err(PlatformError::Frame("command size does not match header"));
        }
        Ok(simulator.borrow_mut().execute(command))
    }

    fn close(&mut self) -> Result<(), PlatformError> {
        self.simulator
            .take()
            .map(|_| ())
            .ok_or(PlatformError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm::commands::{FlushContextCmd, FlushContextResp, TpmCommand, TpmResponse};
    use tpm::{rc, TpmError};

    #[test]
    fn test_send_after_close_fails() {
        let mut channel = SimulatorChannel::new();
        channel.close().unwrap();
        assert!(matches!(
            channel.send(&FlushContextCmd { flush_handle: 1 }.serialize().unwrap()),
            Err(PlatformError::Closed)
        ));
        assert!(matches!(channel.close(), Err(PlatformError::Closed)));
    }

    #[test]
    fn test_rejects_truncated_frame() {
        let mut channel = SimulatorChannel::new();
        let command = FlushContextCmd { flush_handle: 1 }.serialize().unwrap();
        assert!(matches!(
            channel.send(&command[..12]),
            Err(PlatformError::Frame(_))
        ));
    }

    #[test]
    fn test_module_errors_are_responses() {
        let simulator = Rc::new(RefCell::new(Simulator::from_seed(0)));
        let mut channel = SimulatorChannel::attach(simulator.clone());
        let response = channel
            .send(&FlushContextCmd { flush_handle: 0x8000_0000 }.serialize().unwrap())
            .unwrap();
        assert!(matches!(
            FlushContextResp::deserialize(&response),
            Err(TpmError::ResponseCode(rc::HANDLE))
        ));
        assert_eq!(simulator.borrow().loaded_objects(), 0);
    }
}
