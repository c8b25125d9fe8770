//! The device side of the submission core: what an engine is, how device
//! memory is addressed, the commands an engine executes, and the traits a
//! driver implements so the runtime can submit to it.
//!
//! `sim` contains a software device which executes command buffers on one
//! worker thread per engine. It is what the runtime's tests run against.

extern crate indexed_vec as indexvec;
extern crate tracing as log;

pub mod cmd;
pub mod device;
pub mod engine;
pub mod error;
pub mod mem;
pub mod sim;

pub use crate::cmd::{Command, CommandBuffer, CompareOp, DeviceKernel, StateCategory,
                     TranslationDirection, };
pub use crate::device::Device;
pub use crate::engine::{EngineDesc, EngineId, EngineKind, };
pub use crate::error::Error;
pub use crate::mem::{Allocation, DeviceAddress, DeviceMemory, DeviceView, };
