use std::fmt;
use std::sync::Arc;

use device_rt::{Command, CommandBuffer, CompareOp, DeviceAddress, StateCategory, };

use crate::config::EncoderKind;
use crate::deps::ResolvedWait;
use crate::state::{DirtySet, EngineConfig, };
use crate::submission::Workload;

/// Where a submission reports that it finished.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CompletionTarget {
  pub engine_completion: DeviceAddress,
  pub partitions: u32,
  pub task_count: u64,
  /// The submission's dependency token. Tag updates have none.
  pub token: Option<DeviceAddress>,
}

/// Turns one flush's worth of state, waits, workload and completion into
/// engine commands.
///
/// Implementations must emit nothing from `encode_state` for an empty dirty
/// set, so two flushes of the same config back to back only program the
/// engine once.
pub trait EngineEncoder: fmt::Debug + Send + Sync {
  fn kind(&self) -> EncoderKind;

  fn encode_state(&self, config: &EngineConfig, dirty: DirtySet, out: &mut CommandBuffer);

  fn encode_wait(&self, wait: &ResolvedWait, out: &mut CommandBuffer) {
    out.push(Command::SemaphoreWait {
      address: wait.address,
      value: wait.target,
      compare: CompareOp::GreaterOrEqual,
    });
  }

  fn encode_cache_flush(&self, out: &mut CommandBuffer) {
    out.push(Command::CacheFlush { post_sync: None, });
  }

  fn encode_workload(&self, workload: &Workload, out: &mut CommandBuffer) {
    workload.encode(out);
  }

  fn encode_completion(&self, completion: &CompletionTarget, out: &mut CommandBuffer);
}

pub fn encoder_for(kind: EncoderKind) -> Arc<dyn EngineEncoder> {
  match kind {
    EncoderKind::Lean => Arc::new(LeanEncoder),
    EncoderKind::FullState => Arc::new(FullStateEncoder),
  }
}

fn signal_engine(completion: &CompletionTarget, out: &mut CommandBuffer) {
  out.push(Command::SignalCompletion {
    address: completion.engine_completion,
    value: completion.task_count,
    partitions: completion.partitions,
  });
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LeanEncoder;

impl EngineEncoder for LeanEncoder {
  fn kind(&self) -> EncoderKind { EncoderKind::Lean }

  fn encode_state(&self, config: &EngineConfig, dirty: DirtySet, out: &mut CommandBuffer) {
    for category in dirty.iter() {
      out.push(Command::ProgramState {
        category,
        value: config.value_of(category),
      });
    }
  }

  fn encode_completion(&self, completion: &CompletionTarget, out: &mut CommandBuffer) {
    if let Some(token) = completion.token {
      out.push(Command::StoreData {
        address: token,
        value: completion.task_count,
      });
    }
    signal_engine(completion, out);
  }
}

/// Flushes caches ahead of pipeline and base address reprogramming, and
/// writes tokens as a flush post-sync so they only land once the workload's
/// writes are visible.
#[derive(Clone, Copy, Debug, Default)]
pub struct FullStateEncoder;

impl EngineEncoder for FullStateEncoder {
  fn kind(&self) -> EncoderKind { EncoderKind::FullState }

  fn encode_state(&self, config: &EngineConfig, dirty: DirtySet, out: &mut CommandBuffer) {
    for category in dirty.iter() {
      match category {
        StateCategory::PipelineSelect | StateCategory::StateBaseAddress => {
          self.encode_cache_flush(out);
        },
        _ => { },
      }
      out.push(Command::ProgramState {
        category,
        value: config.value_of(category),
      });
    }
  }

  fn encode_completion(&self, completion: &CompletionTarget, out: &mut CommandBuffer) {
    if let Some(token) = completion.token {
      out.push(Command::CacheFlush {
        post_sync: Some((token, completion.task_count)),
      });
    }
    signal_engine(completion, out);
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn completion() -> CompletionTarget {
    CompletionTarget {
      engine_completion: DeviceAddress(0x1000),
      partitions: 2,
      task_count: 9,
      token: Some(DeviceAddress(0x2000)),
    }
  }

  #[test]
  fn clean_state_encodes_nothing() {
    for &kind in [EncoderKind::Lean, EncoderKind::FullState].iter() {
      let enc = encoder_for(kind);
      let mut out = CommandBuffer::new();
      enc.encode_state(&EngineConfig::default(), DirtySet::empty(), &mut out);
      assert!(out.is_empty(), "{:?}", kind);
    }
  }

  #[test]
  fn lean_emits_dirty_categories_only() {
    let mut dirty = DirtySet::empty();
    dirty.insert(StateCategory::StateBaseAddress);
    dirty.insert(StateCategory::L3Config);
    let mut out = CommandBuffer::new();
    LeanEncoder.encode_state(&EngineConfig::default(), dirty, &mut out);
    assert_eq!(out.len(), 2);
    assert_eq!(out.cache_flushes(), 0);
  }

  #[test]
  fn full_state_flushes_before_base_address() {
    let mut dirty = DirtySet::empty();
    dirty.insert(StateCategory::StateBaseAddress);
    let mut out = CommandBuffer::new();
    FullStateEncoder.encode_state(&EngineConfig::default(), dirty, &mut out);
    match out.commands() {
      [Command::CacheFlush { post_sync: None, },
       Command::ProgramState { category: StateCategory::StateBaseAddress, .. }] => { },
      cmds => panic!("unexpected {:?}", cmds),
    }
  }

  #[test]
  fn completions() {
    let mut lean = CommandBuffer::new();
    LeanEncoder.encode_completion(&completion(), &mut lean);
    match lean.commands() {
      [Command::StoreData { address: DeviceAddress(0x2000), value: 9, },
       Command::SignalCompletion { value: 9, partitions: 2, .. }] => { },
      cmds => panic!("unexpected {:?}", cmds),
    }

    let mut full = CommandBuffer::new();
    FullStateEncoder.encode_completion(&completion(), &mut full);
    assert_eq!(full.cache_flushes(), 1);
    assert_eq!(full.len(), 2);
  }
}
