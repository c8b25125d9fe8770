use std::error::Error as StdError;
use std::fmt;

use crate::engine::EngineId;
use crate::mem::DeviceAddress;

#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
  /// The address is outside device memory, or isn't word aligned.
  InvalidAddress(DeviceAddress),
  OutOfDeviceMemory {
    words: usize,
  },
  UnknownEngine(EngineId),
  /// The engine was shut down and accepts no more work.
  EngineStopped(EngineId),
  /// The driver refused the submission.
  Rejected(String),
}

impl StdError for Error { }
impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Error::InvalidAddress(addr) => write!(f, "invalid device address {}", addr),
      Error::OutOfDeviceMemory { words, } => {
        write!(f, "out of device memory allocating {} words", words)
      },
      Error::UnknownEngine(id) => write!(f, "unknown engine {}", id),
      Error::EngineStopped(id) => write!(f, "{} is stopped", id),
      Error::Rejected(why) => write!(f, "submission rejected: {}", why),
    }
  }
}
