use std::time::Duration;

use serde::{Deserialize, Serialize, };

use crate::utils::env;

/// How engine state is encoded.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum EncoderKind {
  /// Only dirty categories are emitted.
  Lean,
  /// Dirty categories are emitted with the cache flushes that certain
  /// reprogramming needs, and completions use a flush with a post-sync write.
  FullState,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum DispatchMode {
  /// Submit every flushed command buffer to the device right away.
  Immediate,
  /// Hold flushed command buffers until a wait needs them or the engine is
  /// flushed explicitly.
  Batched,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum AuxTranslationMode {
  None,
  /// Translate with a builtin kernel on the workload's engine.
  Builtin,
  /// Translate on a copy engine. Falls back to `Builtin` on devices with no
  /// copy engine.
  Blit,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
  /// Tokens per device allocation in the token pool.
  pub token_chunk_size: usize,
  /// Upper bound on token pool chunks. `acquire` fails with `OutOfTokens`
  /// once every slot in every chunk is in use.
  pub max_token_chunks: usize,
  /// Number of partitions which each write their own completion word.
  pub partitions: u32,
  pub encoder: EncoderKind,
  pub dispatch_mode: DispatchMode,
  pub aux_translation: AuxTranslationMode,
  /// Whether engine caches are coherent with each other. When not, an
  /// explicit cache flush separates a workload from the translation which
  /// recompresses its buffers on another engine.
  pub coherent_engine_caches: bool,
  pub heap_budget_bytes: u64,
  pub poll_interval: Duration,
  /// Used by waits and host-function scheduling when no timeout is given.
  pub default_timeout: Duration,
}

impl Default for RuntimeConfig {
  fn default() -> Self {
    RuntimeConfig {
      token_chunk_size: 64,
      max_token_chunks: 16,
      partitions: 1,
      encoder: EncoderKind::Lean,
      dispatch_mode: DispatchMode::Immediate,
      aux_translation: AuxTranslationMode::Blit,
      coherent_engine_caches: false,
      heap_budget_bytes: 64 << 20,
      poll_interval: Duration::from_micros(50),
      default_timeout: Duration::from_secs(10),
    }
  }
}

impl RuntimeConfig {
  /// The defaults, with `ACCEL_*` environment overrides applied.
  pub fn from_env() -> Self {
    Self::default().with_env_overrides()
  }
  pub fn with_env_overrides(mut self) -> Self {
    env::apply(&mut self);
    self
  }

  pub fn token_capacity(&self) -> usize {
    self.token_chunk_size * self.max_token_chunks
  }
}
