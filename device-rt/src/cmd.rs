use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize, };

use crate::error::Error;
use crate::mem::{DeviceAddress, DeviceView, };

/// Categories of engine state which are programmed independently of each
/// other. The declaration order is the order encoders emit them in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
pub enum StateCategory {
  PipelineSelect,
  ComputeMode,
  StateBaseAddress,
  L3Config,
  Preemption,
  Scratch,
}
impl StateCategory {
  pub const COUNT: usize = 6;
  pub const ALL: [StateCategory; StateCategory::COUNT] = [
    StateCategory::PipelineSelect,
    StateCategory::ComputeMode,
    StateCategory::StateBaseAddress,
    StateCategory::L3Config,
    StateCategory::Preemption,
    StateCategory::Scratch,
  ];

  #[inline(always)]
  pub fn index(self) -> usize { self as usize }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CompareOp {
  GreaterOrEqual,
  Equal,
  NotEqual,
}
impl CompareOp {
  #[inline(always)]
  pub fn satisfied(self, current: u64, operand: u64) -> bool {
    match self {
      CompareOp::GreaterOrEqual => current >= operand,
      CompareOp::Equal => current == operand,
      CompareOp::NotEqual => current != operand,
    }
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[derive(Serialize, Deserialize)]
pub enum TranslationDirection {
  /// Resolve the compressed representation so non-aware consumers can read it.
  ToUncompressed,
  ToCompressed,
}

/// Opaque device work. The runtime never looks inside a kernel; it only
/// orders it.
pub trait DeviceKernel: fmt::Debug + Send + Sync {
  fn label(&self) -> &str;
  fn execute(&self, view: &dyn DeviceView) -> Result<(), Error>;
}

#[derive(Clone, Debug)]
pub enum Command {
  ProgramState {
    category: StateCategory,
    value: u64,
  },
  /// Stall the engine until `compare(*address, value)` holds.
  SemaphoreWait {
    address: DeviceAddress,
    value: u64,
    compare: CompareOp,
  },
  StoreData {
    address: DeviceAddress,
    value: u64,
  },
  /// Flush and invalidate engine caches, then optionally write `post_sync`.
  CacheFlush {
    post_sync: Option<(DeviceAddress, u64)>,
  },
  Dispatch(Arc<dyn DeviceKernel>),
  /// Compression format translation of a buffer. `resource` is opaque to
  /// the device.
  Translate {
    resource: u64,
    direction: TranslationDirection,
  },
  /// Write `value` into `partitions` consecutive completion words starting
  /// at `address`, one per partition.
  SignalCompletion {
    address: DeviceAddress,
    value: u64,
    partitions: u32,
  },
}

#[derive(Clone, Debug, Default)]
pub struct CommandBuffer(Vec<Command>);

impl CommandBuffer {
  pub fn new() -> Self { CommandBuffer(Vec::new()) }

  #[inline(always)]
  pub fn push(&mut self, cmd: Command) {
    self.0.push(cmd);
  }
  pub fn append(&mut self, other: CommandBuffer) {
    self.0.extend(other.0);
  }
  #[inline(always)]
  pub fn len(&self) -> usize { self.0.len() }
  #[inline(always)]
  pub fn is_empty(&self) -> bool { self.0.is_empty() }
  pub fn iter(&self) -> impl Iterator<Item = &Command> {
    self.0.iter()
  }
  pub fn commands(&self) -> &[Command] { &self.0 }

  pub fn semaphore_waits(&self) -> impl Iterator<Item = (DeviceAddress, u64, CompareOp)> + '_ {
    self.0.iter().filter_map(|cmd| match cmd {
      &Command::SemaphoreWait { address, value, compare, } => {
        Some((address, value, compare))
      },
      _ => None,
    })
  }
  pub fn state_commands(&self) -> impl Iterator<Item = (StateCategory, u64)> + '_ {
    self.0.iter().filter_map(|cmd| match cmd {
      &Command::ProgramState { category, value, } => Some((category, value)),
      _ => None,
    })
  }
  pub fn cache_flushes(&self) -> usize {
    self.0.iter()
      .filter(|cmd| match cmd {
        Command::CacheFlush { .. } => true,
        _ => false,
      })
      .count()
  }
}
impl From<Vec<Command>> for CommandBuffer {
  fn from(v: Vec<Command>) -> Self { CommandBuffer(v) }
}
impl IntoIterator for CommandBuffer {
  type Item = Command;
  type IntoIter = std::vec::IntoIter<Command>;
  fn into_iter(self) -> Self::IntoIter { self.0.into_iter() }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn compare_ops() {
    assert!(CompareOp::GreaterOrEqual.satisfied(5, 5));
    assert!(CompareOp::GreaterOrEqual.satisfied(6, 5));
    assert!(!CompareOp::GreaterOrEqual.satisfied(4, 5));
    assert!(CompareOp::Equal.satisfied(0, 0));
    assert!(!CompareOp::NotEqual.satisfied(3, 3));
  }

  #[test]
  fn buffer_filters() {
    let mut cmds = CommandBuffer::new();
    cmds.push(Command::ProgramState {
      category: StateCategory::L3Config,
      value: 3,
    });
    cmds.push(Command::SemaphoreWait {
      address: DeviceAddress(0x1000),
      value: 5,
      compare: CompareOp::GreaterOrEqual,
    });
    cmds.push(Command::CacheFlush { post_sync: None, });

    let waits: Vec<_> = cmds.semaphore_waits().collect();
    assert_eq!(waits, vec![(DeviceAddress(0x1000), 5, CompareOp::GreaterOrEqual)]);
    let state: Vec<_> = cmds.state_commands().collect();
    assert_eq!(state, vec![(StateCategory::L3Config, 3)]);
    assert_eq!(cmds.cache_flushes(), 1);
  }
}
