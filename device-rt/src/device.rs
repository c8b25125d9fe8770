use crate::cmd::CommandBuffer;
use crate::engine::{EngineDesc, EngineId, };
use crate::error::Error;
use crate::mem::DeviceMemory;

/// A driver for one device.
///
/// Command buffers submitted to the same engine execute in submission order.
/// Nothing is implied about the relative order of different engines; that is
/// what semaphore waits are for.
pub trait Device: Send + Sync {
  fn engines(&self) -> &[EngineDesc];
  fn memory(&self) -> &dyn DeviceMemory;
  fn submit(&self, engine: EngineId, cmds: CommandBuffer) -> Result<(), Error>;

  fn engine(&self, id: EngineId) -> Option<&EngineDesc> {
    self.engines().iter().find(|e| e.id == id)
  }
}
