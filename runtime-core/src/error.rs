use std::error::Error as StdError;
use std::fmt;

use device_rt::EngineId;
use device_rt::error::Error as DeviceError;

use crate::gate::GateId;
use crate::submission::SubmissionId;
use crate::token::TokenId;

/// Why a wait did not observe completion.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WaitError {
  HangDetected(EngineId),
  /// The awaited work, or something it depends on, was aborted before it
  /// could run.
  ExecutionAborted,
  Timeout,
  InvalidToken(TokenId),
  Cancelled,
}

impl StdError for WaitError { }
impl fmt::Display for WaitError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{:?}", self)
  }
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
  /// The token pool is exhausted and may not grow any further.
  OutOfTokens,
  OutOfMemoryForHeaps {
    requested: u64,
    budget: u64,
  },
  HangDetected(EngineId),
  ExecutionAborted,
  Timeout,
  Cancelled,
  InvalidToken(TokenId),
  UnknownEngine(EngineId),
  UnknownGate(GateId),
  GateAlreadyResolved(GateId),
  UnknownSubmission(SubmissionId),
  /// Blit translation was requested from a device which has no copy engine.
  NoCopyEngine,
  /// A host function is still outstanding on the streamer.
  HostFunctionBusy,
  /// A worker thread couldn't be started.
  Thread(String),
  Device(DeviceError),
}

impl Error {
  pub fn is_hang(&self) -> bool {
    match self {
      Error::HangDetected(_) => true,
      _ => false,
    }
  }
}

impl StdError for Error {
  fn source(&self) -> Option<&(dyn StdError + 'static)> {
    match self {
      Error::Device(err) => Some(err),
      _ => None,
    }
  }
}
impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{:?}", self)
  }
}

impl From<DeviceError> for Error {
  #[inline(always)]
  fn from(v: DeviceError) -> Self {
    Error::Device(v)
  }
}
impl From<WaitError> for Error {
  #[inline(always)]
  fn from(v: WaitError) -> Self {
    match v {
      WaitError::HangDetected(engine) => Error::HangDetected(engine),
      WaitError::ExecutionAborted => Error::ExecutionAborted,
      WaitError::Timeout => Error::Timeout,
      WaitError::InvalidToken(token) => Error::InvalidToken(token),
      WaitError::Cancelled => Error::Cancelled,
    }
  }
}
