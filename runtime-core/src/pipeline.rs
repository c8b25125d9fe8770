//! Per-engine submission pipeline: counters, the dirty-state cache, and the
//! step order of a flush.

use std::sync::Arc;

use device_rt::{CommandBuffer, Device, DeviceAddress, EngineId, EngineKind, };

use crate::config::DispatchMode;
use crate::deps::ResolvedWait;
use crate::encoder::{CompletionTarget, EngineEncoder, };
use crate::error::Error;
use crate::state::{DirtySet, DirtyStateCache, EngineConfig, };
use crate::submission::{CompletionStamp, Workload, };
use crate::token::Token;

pub struct FlushRequest<'a> {
  pub workload: &'a Workload,
  pub config: Option<&'a EngineConfig>,
  pub waits: &'a [ResolvedWait],
  pub token: Option<&'a Token>,
  /// Flush engine caches ahead of everything else.
  pub pre_flush: bool,
}

#[derive(Clone, Debug)]
pub struct FlushResult {
  pub stamp: CompletionStamp,
  pub commands: CommandBuffer,
  pub programmed: DirtySet,
}

pub struct SubmissionPipeline {
  engine: EngineId,
  kind: EngineKind,
  completion: DeviceAddress,
  partitions: u32,
  encoder: Arc<dyn EngineEncoder>,
  cache: DirtyStateCache,
  dispatch_mode: DispatchMode,
  heap_budget: u64,

  /// Task count of the last flushed submission ("latest sent").
  task_count: u64,
  /// Task count of the last submission handed to the device.
  latest_flushed: u64,
  /// Device submissions made so far.
  flush_sequence: u64,
  batched: CommandBuffer,
  cache_flush_requested: bool,
}

impl SubmissionPipeline {
  pub fn new(engine: EngineId, kind: EngineKind, completion: DeviceAddress,
             partitions: u32, encoder: Arc<dyn EngineEncoder>,
             dispatch_mode: DispatchMode, heap_budget: u64)
    -> Self
  {
    SubmissionPipeline {
      engine,
      kind,
      completion,
      partitions,
      encoder,
      cache: DirtyStateCache::new(),
      dispatch_mode,
      heap_budget,
      task_count: 0,
      latest_flushed: 0,
      flush_sequence: 0,
      batched: CommandBuffer::new(),
      cache_flush_requested: false,
    }
  }

  pub fn engine(&self) -> EngineId { self.engine }
  pub fn task_count(&self) -> u64 { self.task_count }
  pub fn latest_flushed(&self) -> u64 { self.latest_flushed }
  pub fn flush_sequence(&self) -> u64 { self.flush_sequence }
  pub fn has_batched(&self) -> bool { !self.batched.is_empty() }
  pub fn cache(&self) -> &DirtyStateCache { &self.cache }

  /// Copy engines have no programmable state.
  fn effective_config<'a>(&self, config: Option<&'a EngineConfig>) -> Option<&'a EngineConfig> {
    if self.kind.has_state() { config } else { None }
  }

  pub fn check_budget(&self, config: Option<&EngineConfig>) -> Result<(), Error> {
    match self.effective_config(config) {
      Some(config) => config.check_heap_budget(self.heap_budget),
      None => Ok(()),
    }
  }

  /// Encode and submit one submission:
  ///  1. dirty state (plus a pending cache flush),
  ///  2. one wait per foreign dependency,
  ///  3. the workload,
  ///  4. the completion signal,
  ///  5. submit,
  ///  6. commit the state cache and advance the counters.
  /// If the device refuses the submission nothing is committed.
  pub fn flush(&mut self, device: &dyn Device, req: FlushRequest) -> Result<FlushResult, Error> {
    let config = self.effective_config(req.config);
    if let Some(config) = config {
      config.check_heap_budget(self.heap_budget)?;
    }
    let dirty = match config {
      Some(config) => self.cache.stage(config),
      None => DirtySet::empty(),
    };

    let mut cmds = CommandBuffer::new();
    if self.cache_flush_requested || req.pre_flush {
      self.encoder.encode_cache_flush(&mut cmds);
    }
    if let Some(config) = config {
      self.encoder.encode_state(config, dirty, &mut cmds);
    }
    for wait in req.waits.iter() {
      debug_assert_ne!(wait.engine, self.engine);
      self.encoder.encode_wait(wait, &mut cmds);
    }
    self.encoder.encode_workload(req.workload, &mut cmds);

    let task_count = self.task_count + 1;
    let completion = CompletionTarget {
      engine_completion: self.completion,
      partitions: self.partitions,
      task_count,
      token: req.token.map(|t| t.address ),
    };
    self.encoder.encode_completion(&completion, &mut cmds);

    let flush_sequence = match self.dispatch_mode {
      DispatchMode::Immediate => {
        device.submit(self.engine, cmds.clone())?;
        self.flush_sequence += 1;
        self.latest_flushed = task_count;
        self.flush_sequence
      },
      DispatchMode::Batched => {
        self.batched.append(cmds.clone());
        self.flush_sequence + 1
      },
    };

    if let Some(config) = config {
      self.cache.commit(config, dirty);
    }
    self.cache_flush_requested = false;
    self.task_count = task_count;

    log::trace!("{}: task {} (flush {}), {} state, {} waits", self.engine,
                task_count, flush_sequence, dirty.len(), req.waits.len());
    Ok(FlushResult {
      stamp: CompletionStamp {
        engine: self.engine,
        task_count,
        flush_sequence,
      },
      commands: cmds,
      programmed: dirty,
    })
  }

  /// Hand every batched command buffer to the device as one submission.
  pub fn flush_batched(&mut self, device: &dyn Device) -> Result<(), Error> {
    if self.batched.is_empty() {
      return Ok(());
    }
    let cmds = std::mem::take(&mut self.batched);
    if let Err(err) = device.submit(self.engine, cmds.clone()) {
      self.batched = cmds;
      return Err(err.into());
    }
    self.flush_sequence += 1;
    self.latest_flushed = self.task_count;
    log::trace!("{}: batch flushed up to task {}", self.engine, self.task_count);
    Ok(())
  }

  /// Make sure the device has been handed everything up to `task_count`.
  pub fn ensure_submitted(&mut self, device: &dyn Device, task_count: u64) -> Result<(), Error> {
    if self.latest_flushed < task_count {
      self.flush_batched(device)?;
    }
    Ok(())
  }

  /// Submit an empty submission whose only effect is to bump the engine's
  /// completion words.
  pub fn tag_update(&mut self, device: &dyn Device) -> Result<CompletionStamp, Error> {
    let r = self.flush(device, FlushRequest {
      workload: &Workload::Barrier,
      config: None,
      waits: &[],
      token: None,
      pre_flush: false,
    })?;
    self.flush_batched(device)?;
    Ok(CompletionStamp {
      flush_sequence: self.flush_sequence,
      ..r.stamp
    })
  }

  /// Flush everything batched, or if nothing is, issue a tag update, so the
  /// returned stamp covers all work flushed so far.
  pub fn flush_engine(&mut self, device: &dyn Device) -> Result<CompletionStamp, Error> {
    if self.has_batched() {
      self.flush_batched(device)?;
      Ok(CompletionStamp {
        engine: self.engine,
        task_count: self.task_count,
        flush_sequence: self.flush_sequence,
      })
    } else {
      self.tag_update(device)
    }
  }

  pub fn request_cache_flush(&mut self) {
    self.cache_flush_requested = true;
  }
  pub fn invalidate_state(&mut self) {
    self.cache.invalidate();
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::utils::test::*;

  use device_rt::Command;
  use device_rt::sim::SimDevice;

  use crate::config::EncoderKind;
  use crate::encoder::encoder_for;

  fn pipeline(dev: &SimDevice, mode: DispatchMode) -> SubmissionPipeline {
    let completion = dev.memory().allocate(1).unwrap();
    SubmissionPipeline::new(EngineId(0), EngineKind::Compute, completion.base(), 1,
                            encoder_for(EncoderKind::Lean), mode, 1 << 20)
  }
  static BARRIER: Workload = Workload::Barrier;

  fn barrier<'a>(config: Option<&'a EngineConfig>) -> FlushRequest<'a> {
    FlushRequest {
      workload: &BARRIER,
      config,
      waits: &[],
      token: None,
      pre_flush: false,
    }
  }

  #[test]
  fn counters_are_monotonic() {
    let dev = sim(&[EngineKind::Compute]);
    let mut p = pipeline(&dev, DispatchMode::Immediate);
    for n in 1..=4 {
      let r = p.flush(&*dev, barrier(None)).unwrap();
      assert_eq!(r.stamp.task_count, n);
      assert_eq!(r.stamp.flush_sequence, n);
    }
    assert_eq!(p.latest_flushed(), 4);
    assert_eq!(dev.submitted(EngineId(0)).len(), 4);
  }

  #[test]
  fn state_is_programmed_once() {
    let dev = sim(&[EngineKind::Compute]);
    let mut p = pipeline(&dev, DispatchMode::Immediate);
    let config = EngineConfig::default();
    let first = p.flush(&*dev, barrier(Some(&config))).unwrap();
    assert_eq!(first.commands.state_commands().count(), device_rt::StateCategory::COUNT);
    let second = p.flush(&*dev, barrier(Some(&config))).unwrap();
    assert_eq!(second.commands.state_commands().count(), 0);
    assert!(second.programmed.is_empty());
  }

  #[test]
  fn over_budget_changes_nothing() {
    let dev = sim(&[EngineKind::Compute]);
    let mut p = pipeline(&dev, DispatchMode::Immediate);
    let mut config = EngineConfig::default();
    config.scratch_bytes = 2 << 20;
    match p.flush(&*dev, barrier(Some(&config))) {
      Err(Error::OutOfMemoryForHeaps { .. }) => { },
      r => panic!("unexpected {:?}", r.map(|r| r.stamp )),
    }
    assert_eq!(p.task_count(), 0);
    assert!(p.cache().programmed().is_none());
  }

  #[test]
  fn batched_submissions_wait_for_flush() {
    let dev = sim(&[EngineKind::Compute]);
    let mut p = pipeline(&dev, DispatchMode::Batched);
    let a = p.flush(&*dev, barrier(None)).unwrap();
    let b = p.flush(&*dev, barrier(None)).unwrap();
    assert_eq!(a.stamp.flush_sequence, 1);
    assert_eq!(b.stamp.flush_sequence, 1);
    assert!(dev.submitted(EngineId(0)).is_empty());
    assert_eq!(p.latest_flushed(), 0);

    p.ensure_submitted(&*dev, 2).unwrap();
    assert_eq!(p.latest_flushed(), 2);
    let submitted = dev.submitted(EngineId(0));
    assert_eq!(submitted.len(), 1);
    let signals = submitted[0].iter()
      .filter(|c| match c {
        Command::SignalCompletion { .. } => true,
        _ => false,
      })
      .count();
    assert_eq!(signals, 2);
  }

  #[test]
  fn tag_update_and_cache_flush_request() {
    let dev = sim(&[EngineKind::Compute]);
    let mut p = pipeline(&dev, DispatchMode::Immediate);
    p.request_cache_flush();
    let r = p.flush(&*dev, barrier(None)).unwrap();
    assert_eq!(r.commands.cache_flushes(), 1);
    let r = p.flush(&*dev, barrier(None)).unwrap();
    assert_eq!(r.commands.cache_flushes(), 0);

    let stamp = p.flush_engine(&*dev).unwrap();
    assert_eq!(stamp.task_count, 3);
    assert_eq!(stamp.flush_sequence, 3);
  }
}
