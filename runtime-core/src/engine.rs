use std::sync::atomic::{AtomicU64, Ordering, };

use device_rt::{Allocation, DeviceAddress, DeviceMemory, EngineDesc, EngineId,
                EngineKind, };

use crate::error::Error;

/// The host's view of one engine's completion words: one word per partition,
/// each written by the device with the task count of the last submission that
/// partition finished.
pub struct EngineState {
  desc: EngineDesc,
  completion: Allocation,
  partitions: u32,
  /// Highest task count the host has observed complete on every partition.
  observed: AtomicU64,
}

impl EngineState {
  pub fn new(desc: EngineDesc, memory: &dyn DeviceMemory, partitions: u32)
    -> Result<Self, Error>
  {
    let partitions = partitions.max(1);
    let completion = memory.allocate(partitions as usize)?;
    log::debug!("{}: completion words at {}, {} partitions",
                desc.name, completion.base(), partitions);
    Ok(EngineState {
      desc,
      completion,
      partitions,
      observed: AtomicU64::new(0),
    })
  }

  #[inline(always)]
  pub fn id(&self) -> EngineId { self.desc.id }
  #[inline(always)]
  pub fn kind(&self) -> EngineKind { self.desc.kind }
  pub fn desc(&self) -> &EngineDesc { &self.desc }
  pub fn name(&self) -> &str { &self.desc.name }
  pub fn completion_address(&self) -> DeviceAddress { self.completion.base() }
  pub fn partitions(&self) -> u32 { self.partitions }

  pub fn observed(&self) -> u64 {
    self.observed.load(Ordering::Acquire)
  }

  /// Read every partition's completion word. The engine has completed a task
  /// count only once all partitions have, so this is the minimum over
  /// partitions. Never returns less than a value returned before.
  pub fn poll(&self, memory: &dyn DeviceMemory) -> Result<u64, Error> {
    if !memory.is_coherent() {
      memory.download(&self.completion)?;
    }
    let mut done = u64::MAX;
    for p in 0..self.partitions as usize {
      let addr = self.completion.base().offset_words(p);
      done = done.min(memory.read(addr)?);
    }
    Ok(self.note_observed(done))
  }

  fn note_observed(&self, value: u64) -> u64 {
    let prev = self.observed.fetch_max(value, Ordering::AcqRel);
    if value < prev {
      log::warn!("{}: completion word went backwards ({} < {}), keeping {}",
                 self.desc.name, value, prev, prev);
      prev
    } else {
      value
    }
  }

  pub(crate) fn release(&self, memory: &dyn DeviceMemory) {
    memory.free(self.completion);
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::utils::test::*;

  use device_rt::Device;

  #[test]
  fn partitions_complete_together() {
    let dev = sim(&[EngineKind::Compute]);
    let desc = dev.engines()[0].clone();
    let state = EngineState::new(desc, dev.memory(), 2).unwrap();
    let mem = dev.memory();
    let base = state.completion_address();

    mem.write(base, 3).unwrap();
    assert_eq!(state.poll(mem).unwrap(), 0);
    mem.write(base.offset_words(1), 4).unwrap();
    assert_eq!(state.poll(mem).unwrap(), 3);
  }

  #[test]
  fn observation_is_monotonic() {
    let dev = sim(&[EngineKind::Compute]);
    let desc = dev.engines()[0].clone();
    let state = EngineState::new(desc, dev.memory(), 1).unwrap();
    let mem = dev.memory();

    mem.write(state.completion_address(), 7).unwrap();
    assert_eq!(state.poll(mem).unwrap(), 7);
    mem.write(state.completion_address(), 2).unwrap();
    assert_eq!(state.poll(mem).unwrap(), 7);
    assert_eq!(state.observed(), 7);
  }
}
