//! Engine state programming, and the cache which remembers what was last
//! programmed so flushes only emit what changed.

use std::fmt;

use serde::{Deserialize, Serialize, };

use device_rt::StateCategory;

use crate::error::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum PipelineMode {
  Compute,
  Systolic,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum AddressingMode {
  /// Surfaces are addressed by pointer.
  Stateless,
  /// Surfaces are addressed relative to a heap base.
  Heap {
    base: u64,
  },
}
impl AddressingMode {
  fn is_stateless(&self) -> bool {
    match self {
      AddressingMode::Stateless => true,
      AddressingMode::Heap { .. } => false,
    }
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum PreemptionMode {
  Disabled,
  MidBatch,
  ThreadGroup,
  MidThread,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ComputeMode {
  pub coherent: bool,
  pub large_grf: bool,
  pub global_atomics: bool,
}

/// Everything a compute engine needs programmed before a workload runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct EngineConfig {
  pub pipeline: PipelineMode,
  pub compute_mode: ComputeMode,
  pub addressing: AddressingMode,
  pub l3_config: u32,
  pub preemption: PreemptionMode,
  /// Per-thread scratch space the workload needs.
  pub scratch_bytes: u64,
}

impl Default for EngineConfig {
  fn default() -> Self {
    EngineConfig {
      pipeline: PipelineMode::Compute,
      compute_mode: ComputeMode::default(),
      addressing: AddressingMode::Stateless,
      l3_config: 0,
      preemption: PreemptionMode::ThreadGroup,
      scratch_bytes: 0,
    }
  }
}

impl EngineConfig {
  /// The value a `ProgramState` command carries for `category`.
  pub fn value_of(&self, category: StateCategory) -> u64 {
    match category {
      StateCategory::PipelineSelect => self.pipeline as u64,
      StateCategory::ComputeMode => {
        (self.compute_mode.coherent as u64) |
          (self.compute_mode.large_grf as u64) << 1 |
          (self.compute_mode.global_atomics as u64) << 2
      },
      StateCategory::StateBaseAddress => match self.addressing {
        AddressingMode::Stateless => 0,
        AddressingMode::Heap { base, } => base,
      },
      StateCategory::L3Config => self.l3_config as u64,
      StateCategory::Preemption => self.preemption as u64,
      StateCategory::Scratch => self.scratch_bytes,
    }
  }

  fn same(&self, other: &Self, category: StateCategory) -> bool {
    match category {
      StateCategory::PipelineSelect => self.pipeline == other.pipeline,
      StateCategory::ComputeMode => self.compute_mode == other.compute_mode,
      StateCategory::StateBaseAddress => self.addressing == other.addressing,
      StateCategory::L3Config => self.l3_config == other.l3_config,
      StateCategory::Preemption => self.preemption == other.preemption,
      StateCategory::Scratch => self.scratch_bytes == other.scratch_bytes,
    }
  }

  fn take(&mut self, from: &Self, category: StateCategory) {
    match category {
      StateCategory::PipelineSelect => self.pipeline = from.pipeline,
      StateCategory::ComputeMode => self.compute_mode = from.compute_mode,
      StateCategory::StateBaseAddress => self.addressing = from.addressing,
      StateCategory::L3Config => self.l3_config = from.l3_config,
      StateCategory::Preemption => self.preemption = from.preemption,
      StateCategory::Scratch => self.scratch_bytes = from.scratch_bytes,
    }
  }

  pub fn check_heap_budget(&self, budget: u64) -> Result<(), Error> {
    if self.scratch_bytes > budget {
      return Err(Error::OutOfMemoryForHeaps {
        requested: self.scratch_bytes,
        budget,
      });
    }
    Ok(())
  }
}

/// A set of state categories.
#[derive(Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct DirtySet(u8);

impl DirtySet {
  pub fn empty() -> Self { DirtySet(0) }
  pub fn all() -> Self { DirtySet((1 << StateCategory::COUNT) - 1) }

  #[inline(always)]
  pub fn insert(&mut self, category: StateCategory) {
    self.0 |= 1 << category.index();
  }
  #[inline(always)]
  pub fn contains(&self, category: StateCategory) -> bool {
    self.0 & (1 << category.index()) != 0
  }
  pub fn is_empty(&self) -> bool { self.0 == 0 }
  pub fn len(&self) -> usize { self.0.count_ones() as usize }

  /// In programming order.
  pub fn iter(self) -> impl Iterator<Item = StateCategory> {
    (0..StateCategory::COUNT)
      .map(|idx| StateCategory::ALL[idx] )
      .filter(move |&c| self.contains(c) )
  }
}
impl fmt::Debug for DirtySet {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_set().entries(self.iter()).finish()
  }
}

/// What an engine was last programmed with, plus which categories must be
/// reprogrammed regardless of value.
///
/// Flushing is two phase: `stage` computes what the next flush needs to
/// emit without changing anything, and `commit` records it once the
/// submission was accepted. A failed submission leaves the cache untouched.
#[derive(Clone, Debug)]
pub struct DirtyStateCache {
  programmed: Option<EngineConfig>,
  dirty: DirtySet,
  /// Scratch space only ever grows; smaller requests reuse what's programmed.
  scratch_high_water: u64,
}

impl Default for DirtyStateCache {
  fn default() -> Self { Self::new() }
}

impl DirtyStateCache {
  pub fn new() -> Self {
    DirtyStateCache {
      programmed: None,
      dirty: DirtySet::all(),
      scratch_high_water: 0,
    }
  }

  pub fn programmed(&self) -> Option<&EngineConfig> { self.programmed.as_ref() }
  pub fn scratch_high_water(&self) -> u64 { self.scratch_high_water }
  pub fn is_dirty(&self, category: StateCategory) -> bool {
    self.dirty.contains(category)
  }

  pub fn stage(&self, config: &EngineConfig) -> DirtySet {
    let prev = match self.programmed {
      Some(ref prev) => prev,
      None => return DirtySet::all(),
    };
    if prev.addressing.is_stateless() != config.addressing.is_stateless() {
      // switching addressing models invalidates everything programmed
      // relative to the old one.
      return DirtySet::all();
    }

    let mut set = self.dirty;
    for &category in StateCategory::ALL.iter() {
      let changed = match category {
        StateCategory::Scratch => config.scratch_bytes > self.scratch_high_water,
        _ => !prev.same(config, category),
      };
      if changed {
        set.insert(category);
      }
    }
    set
  }

  pub fn commit(&mut self, config: &EngineConfig, programmed: DirtySet) {
    let mut next = self.programmed.unwrap_or(*config);
    for category in programmed.iter() {
      next.take(config, category);
    }
    if programmed.contains(StateCategory::Scratch) {
      self.scratch_high_water = self.scratch_high_water.max(config.scratch_bytes);
      next.scratch_bytes = self.scratch_high_water;
    }
    self.dirty = DirtySet(self.dirty.0 & !programmed.0);
    self.programmed = Some(next);
  }

  /// Everything is reprogrammed on the next flush, whatever the values.
  pub fn invalidate(&mut self) {
    self.dirty = DirtySet::all();
  }
  pub fn mark_dirty(&mut self, category: StateCategory) {
    self.dirty.insert(category);
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn first_flush_programs_everything() {
    let cache = DirtyStateCache::new();
    assert_eq!(cache.stage(&EngineConfig::default()), DirtySet::all());
  }

  #[test]
  fn identical_config_is_clean() {
    let mut cache = DirtyStateCache::new();
    let config = EngineConfig::default();
    let dirty = cache.stage(&config);
    cache.commit(&config, dirty);
    assert!(cache.stage(&config).is_empty());
  }

  #[test]
  fn only_changed_categories() {
    let mut cache = DirtyStateCache::new();
    let mut config = EngineConfig::default();
    cache.commit(&config, cache.stage(&config));

    config.l3_config = 7;
    config.preemption = PreemptionMode::MidThread;
    let dirty = cache.stage(&config);
    assert_eq!(dirty.iter().collect::<Vec<_>>(),
               vec![StateCategory::L3Config, StateCategory::Preemption]);

    // staging alone changes nothing.
    assert_eq!(cache.stage(&config), dirty);
    cache.commit(&config, dirty);
    assert!(cache.stage(&config).is_empty());
  }

  #[test]
  fn addressing_switch_dirties_all() {
    let mut cache = DirtyStateCache::new();
    let mut config = EngineConfig::default();
    cache.commit(&config, cache.stage(&config));

    config.addressing = AddressingMode::Heap { base: 0x4000, };
    assert_eq!(cache.stage(&config), DirtySet::all());
    cache.commit(&config, DirtySet::all());

    config.addressing = AddressingMode::Heap { base: 0x8000, };
    let dirty = cache.stage(&config);
    assert_eq!(dirty.iter().collect::<Vec<_>>(),
               vec![StateCategory::StateBaseAddress]);
  }

  #[test]
  fn scratch_high_water() {
    let mut cache = DirtyStateCache::new();
    let mut config = EngineConfig::default();
    config.scratch_bytes = 1024;
    cache.commit(&config, cache.stage(&config));

    config.scratch_bytes = 512;
    assert!(cache.stage(&config).is_empty());

    config.scratch_bytes = 4096;
    let dirty = cache.stage(&config);
    assert!(dirty.contains(StateCategory::Scratch));
    cache.commit(&config, dirty);
    assert_eq!(cache.scratch_high_water(), 4096);
    assert_eq!(cache.programmed().unwrap().scratch_bytes, 4096);
  }

  #[test]
  fn invalidate_forces_reprogramming() {
    let mut cache = DirtyStateCache::new();
    let config = EngineConfig::default();
    cache.commit(&config, cache.stage(&config));
    cache.invalidate();
    assert_eq!(cache.stage(&config), DirtySet::all());

    cache.commit(&config, DirtySet::all());
    cache.mark_dirty(StateCategory::ComputeMode);
    assert!(cache.is_dirty(StateCategory::ComputeMode));
    assert_eq!(cache.stage(&config).len(), 1);
  }

  #[test]
  fn heap_budget() {
    let mut config = EngineConfig::default();
    config.scratch_bytes = 10;
    assert!(config.check_heap_budget(10).is_ok());
    assert_eq!(config.check_heap_budget(9), Err(Error::OutOfMemoryForHeaps {
      requested: 10,
      budget: 9,
    }));
  }
}
