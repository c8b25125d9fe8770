//! The runtime context: one per device, owning every engine's pipeline, the
//! token pool, the dependency table and the deferred set.
//!
//! Locks are always taken in this order: the scheduler, then an engine's
//! pipeline, then (internally) the token pool. Waits only take the scheduler
//! briefly per poll, so other threads can enqueue, signal gates, or retire
//! while a wait is blocked.

use std::collections::{BTreeMap, HashMap, VecDeque, };
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use indexvec::{Idx, IndexVec, };

use parking_lot::Mutex;

use smallvec::SmallVec;

use device_rt::{CommandBuffer, Device, EngineDesc, EngineId, EngineKind, };
use device_rt::error::Error as DeviceError;

use crate::aux_translation::{AuxChain, AuxPlan, translation_workload, };
use crate::config::RuntimeConfig;
use crate::deps::{DependencyResolver, Producer, ResolvedWait, ResourceId, };
use crate::encoder::encoder_for;
use crate::engine::EngineState;
use crate::error::Error;
use crate::gate::{Blocked, GateId, GateState, Gates, };
use crate::hang::{HangMonitor, Watchdog, };
use crate::host_fn::{HostFunctionHandle, HostFunctionId, HostFunctionStreamer,
                     HostFunctionWorker, };
use crate::pipeline::{FlushRequest, SubmissionPipeline, };
use crate::submission::*;
use crate::token::{Token, TokenAllocator, TokenId, TokenStatus, };
use crate::wait::{CancellationToken, Clock, Completion, SystemClock, WaitCoordinator,
                  WaitTarget, };


/// Completed submissions remembered after retirement.
const RETIRED_HISTORY: usize = 4096;

struct Scheduler {
  resolver: DependencyResolver,
  gates: Gates,
  submissions: BTreeMap<SubmissionId, Submission>,
  /// In enqueue order.
  deferred: VecDeque<SubmissionId>,
  retired: RetiredLog,
  last_submission: u64,
}

impl Scheduler {
  fn issued(&self) -> SubmissionId {
    SubmissionId(self.last_submission + 1)
  }
  fn status(&self, id: SubmissionId) -> Option<SubmissionStatus> {
    match self.submissions.get(&id) {
      Some(sub) => Some(sub.status),
      None => self.retired.lookup(id, self.issued()),
    }
  }
}

#[derive(Clone, Copy, Debug, Default)]
struct Sweep {
  flushed: usize,
  aborted: usize,
}

pub struct RuntimeContext {
  device: Arc<dyn Device>,
  config: RuntimeConfig,
  engines: IndexVec<EngineId, EngineState>,
  pipelines: IndexVec<EngineId, Mutex<SubmissionPipeline>>,
  tokens: TokenAllocator,
  hang: HangMonitor,
  waiter: WaitCoordinator,
  sched: Mutex<Scheduler>,
  streamers: Mutex<HashMap<EngineId, Arc<HostFunctionStreamer>>>,
}

impl RuntimeContext {
  pub fn new(device: Arc<dyn Device>, config: RuntimeConfig) -> Result<Self, Error> {
    Self::with_clock(device, config, Arc::new(SystemClock))
  }
  /// Default configuration plus `ACCEL_*` environment overrides.
  pub fn from_env(device: Arc<dyn Device>) -> Result<Self, Error> {
    Self::new(device, RuntimeConfig::from_env())
  }

  pub fn with_clock(device: Arc<dyn Device>, config: RuntimeConfig, clock: Arc<dyn Clock>)
    -> Result<Self, Error>
  {
    let encoder = encoder_for(config.encoder);
    let mut engines: IndexVec<EngineId, EngineState> = IndexVec::new();
    let mut pipelines = IndexVec::new();
    for desc in device.engines().iter() {
      if desc.id.index() != engines.len() {
        let msg = format!("{} reported out of order", desc.id);
        return Err(DeviceError::Rejected(msg).into());
      }
      let state = EngineState::new(desc.clone(), device.memory(), config.partitions)?;
      let pipeline = SubmissionPipeline::new(desc.id, desc.kind,
                                             state.completion_address(),
                                             state.partitions(), encoder.clone(),
                                             config.dispatch_mode,
                                             config.heap_budget_bytes);
      engines.push(state);
      pipelines.push(Mutex::new(pipeline));
    }

    let tokens = TokenAllocator::new(device.clone(), config.token_chunk_size,
                                     config.max_token_chunks);
    log::info!("runtime context: {} engines, {:?} encoder, {:?} dispatch",
               engines.len(), config.encoder, config.dispatch_mode);

    Ok(RuntimeContext {
      hang: HangMonitor::new(engines.len()),
      waiter: WaitCoordinator::new(clock, config.poll_interval),
      sched: Mutex::new(Scheduler {
        resolver: DependencyResolver::new(),
        gates: Gates::default(),
        submissions: BTreeMap::new(),
        deferred: VecDeque::new(),
        retired: RetiredLog::new(RETIRED_HISTORY),
        last_submission: 0,
      }),
      streamers: Mutex::new(HashMap::new()),
      device,
      config,
      engines,
      pipelines,
      tokens,
    })
  }

  pub fn config(&self) -> &RuntimeConfig { &self.config }
  pub fn device(&self) -> &Arc<dyn Device> { &self.device }
  pub fn hang_monitor(&self) -> &HangMonitor { &self.hang }
  pub fn tokens(&self) -> &TokenAllocator { &self.tokens }

  pub fn engines(&self) -> impl Iterator<Item = &EngineDesc> {
    self.engines.iter().map(|e| e.desc() )
  }
  pub fn engine(&self, id: EngineId) -> Result<&EngineState, Error> {
    self.engines.get(id).ok_or(Error::UnknownEngine(id))
  }
  pub fn copy_engine(&self) -> Result<EngineId, Error> {
    self.engines.iter()
      .find(|e| e.kind() == EngineKind::Copy )
      .map(|e| e.id() )
      .ok_or(Error::NoCopyEngine)
  }
  pub fn token(&self, id: TokenId) -> Result<Token, Error> {
    self.tokens.get(id)
  }

  /// Task count of the last submission flushed to `engine`.
  pub fn task_count(&self, engine: EngineId) -> Result<u64, Error> {
    self.engine(engine)?;
    Ok(self.pipelines[engine].lock().task_count())
  }
  /// Task count `engine` has completed, read from its completion words.
  pub fn completed_task_count(&self, engine: EngineId) -> Result<u64, Error> {
    self.engine(engine)?.poll(self.device.memory())
  }

  pub fn status(&self, handle: &SubmissionHandle) -> Result<SubmissionStatus, Error> {
    self.sched.lock()
      .status(handle.id)
      .ok_or(Error::UnknownSubmission(handle.id))
  }
  /// The commands a submission was flushed with, while its record is kept.
  pub fn commands(&self, handle: &SubmissionHandle) -> Option<CommandBuffer> {
    self.sched.lock()
      .submissions
      .get(&handle.id)
      .and_then(|sub| sub.commands.clone() )
  }

  /// Resolve `op`'s dependencies and flush it, or defer it if it's gated
  /// (directly, or through a deferred producer).
  ///
  /// Errors from the token pool, the state cache, or the device are returned
  /// here. Whatever happens to the submission afterwards is reported by
  /// waiting on it.
  pub fn enqueue(&self, op: Operation) -> Result<SubmissionHandle, Error> {
    self.engine(op.engine)?;
    self.pipelines[op.engine].lock().check_budget(op.config.as_ref())?;

    let mut sched = self.sched.lock();
    self.retire_locked(&mut sched);
    self.enqueue_locked(&mut sched, op)
  }

  fn enqueue_locked(&self, sched: &mut Scheduler, op: Operation)
    -> Result<SubmissionHandle, Error>
  {
    if let Some(gate) = op.gate {
      sched.gates.state(gate)?;
    }

    let token = self.tokens.acquire(op.engine)?;
    let resolution = match sched.resolver.resolve(op.engine, &op.accesses, &self.tokens) {
      Ok(resolution) => resolution,
      Err(err) => {
        self.release_token(token.id);
        return Err(err);
      },
    };

    sched.last_submission += 1;
    let id = SubmissionId(sched.last_submission);

    let mut gates: SmallVec<[GateId; 2]> = op.gate.into_iter().collect();
    for producer in resolution.deferred_on.iter() {
      if let Some(sub) = sched.submissions.get(producer) {
        for gate in sub.gates.iter() {
          if !gates.contains(gate) {
            gates.push(*gate);
          }
        }
      }
    }
    for wait in resolution.waits.iter() {
      self.tokens.retain(wait.token)?;
    }
    let producer = Producer {
      engine: op.engine,
      token: token.id,
      submission: id,
    };
    sched.resolver.record(producer, &op.accesses, &self.tokens)?;

    let mut sub = Submission {
      id,
      engine: op.engine,
      label: op.label,
      workload: op.workload,
      config: op.config,
      token: token.id,
      waits: resolution.waits,
      gates,
      deferred_on: resolution.deferred_on,
      pre_flush: false,
      status: SubmissionStatus::Queued,
      commands: None,
    };
    let handle = sub.handle();

    let blocked = if resolution.aborted {
      Blocked::Aborted
    } else {
      match sched.gates.blocked(&sub.gates) {
        Blocked::Ready if !sub.deferred_on.is_empty() => {
          log::warn!("{} depends on unflushed work behind no gate", id);
          Blocked::Aborted
        },
        blocked => blocked,
      }
    };

    let result = match blocked {
      Blocked::Ready => self.flush_submission(&mut sub),
      Blocked::Pending => {
        log::debug!("{} ({}) deferred behind {:?}", id, sub.label, sub.gates);
        sub.status = SubmissionStatus::Deferred;
        sched.deferred.push_back(id);
        Ok(())
      },
      Blocked::Aborted => {
        self.abort_submission(&mut sub);
        Ok(())
      },
    };
    sched.submissions.insert(id, sub);
    result.map(|()| handle )
  }

  fn release_token(&self, token: TokenId) {
    if let Err(err) = self.tokens.release(token) {
      log::warn!("releasing {}: {}", token, err);
    }
  }

  fn ensure_submitted(&self, engine: EngineId, task_count: u64) -> Result<(), Error> {
    self.pipelines[engine].lock()
      .ensure_submitted(&*self.device, task_count)
  }

  fn flush_submission(&self, sub: &mut Submission) -> Result<(), Error> {
    match self.try_flush_submission(sub) {
      Ok(()) => Ok(()),
      Err(err) => {
        log::error!("{}: flushing {} ({}) failed: {}", sub.engine, sub.id, sub.label, err);
        self.abort_submission(sub);
        Err(err)
      },
    }
  }

  fn try_flush_submission(&self, sub: &mut Submission) -> Result<(), Error> {
    // a wait on work still sitting in another engine's batch would never
    // be satisfied.
    for wait in sub.waits.iter() {
      self.ensure_submitted(wait.engine, wait.target)?;
    }

    let token = self.tokens.get(sub.token)?;
    let flushed = {
      let mut pipeline = self.pipelines[sub.engine].lock();
      pipeline.flush(&*self.device, FlushRequest {
        workload: &sub.workload,
        config: sub.config.as_ref(),
        waits: &sub.waits,
        token: Some(&token),
        pre_flush: sub.pre_flush,
      })?
    };
    self.tokens.assign_target(sub.token, flushed.stamp.task_count)?;

    log::debug!("{} ({}) flushed as {}:{}, {} waits, programmed {:?}", sub.id, sub.label,
                sub.engine, flushed.stamp.task_count, sub.waits.len(), flushed.programmed);
    sub.status = SubmissionStatus::Flushed(flushed.stamp);
    sub.commands = Some(flushed.commands);
    Ok(())
  }

  fn abort_submission(&self, sub: &mut Submission) {
    sub.status = SubmissionStatus::Aborted;
    if let Err(err) = self.tokens.mark_aborted(sub.token) {
      log::warn!("marking {} aborted: {}", sub.token, err);
    }
    log::warn!("{} ({}) aborted", sub.id, sub.label);
  }

  /// Add waits for producers which were unflushed when `sub` was enqueued.
  /// Returns false if one of them was aborted.
  fn add_deferred_waits(&self, sched: &Scheduler, sub: &mut Submission) -> Result<bool, Error> {
    for producer in sub.deferred_on.clone().iter() {
      let status = sched.status(*producer)
        .ok_or(Error::UnknownSubmission(*producer))?;
      let stamp = match status {
        SubmissionStatus::Flushed(stamp) => stamp,
        SubmissionStatus::Completed(_) | SubmissionStatus::Retired => continue,
        SubmissionStatus::Aborted | SubmissionStatus::HangDetected => return Ok(false),
        SubmissionStatus::Queued | SubmissionStatus::Deferred => {
          log::warn!("{} leaving the deferred set before its producer {}", sub.id, producer);
          return Ok(false);
        },
      };
      if stamp.engine == sub.engine {
        continue;
      }
      let token = match sched.submissions.get(producer) {
        Some(p) => p.token,
        None => continue,
      };
      if self.tokens.is_complete(token)? {
        continue;
      }

      let wait = ResolvedWait {
        engine: stamp.engine,
        token,
        address: self.tokens.get(token)?.address,
        target: stamp.task_count,
      };
      match sub.waits.iter().position(|w| w.engine == wait.engine ) {
        Some(pos) if sub.waits[pos].target >= wait.target => { },
        Some(pos) => {
          self.tokens.retain(wait.token)?;
          let old = std::mem::replace(&mut sub.waits[pos], wait);
          self.release_token(old.token);
        },
        None => {
          self.tokens.retain(wait.token)?;
          sub.waits.push(wait);
        },
      }
    }
    sub.deferred_on.clear();
    Ok(true)
  }

  /// Flush or abort every deferred submission whose gates resolved, in
  /// enqueue order.
  fn sweep_deferred(&self, sched: &mut Scheduler) -> Result<Sweep, Error> {
    let mut sweep = Sweep::default();
    let mut first_err = None;
    let mut still = VecDeque::new();

    while let Some(id) = sched.deferred.pop_front() {
      let mut sub = match sched.submissions.remove(&id) {
        Some(sub) => sub,
        None => continue,
      };
      match sched.gates.blocked(&sub.gates) {
        Blocked::Pending => {
          still.push_back(id);
        },
        Blocked::Aborted => {
          self.abort_submission(&mut sub);
          sweep.aborted += 1;
        },
        Blocked::Ready => {
          let flushed = match self.add_deferred_waits(sched, &mut sub) {
            Ok(true) => self.flush_submission(&mut sub).map(|()| true ),
            Ok(false) => {
              self.abort_submission(&mut sub);
              Ok(false)
            },
            Err(err) => {
              self.abort_submission(&mut sub);
              Err(err)
            },
          };
          match flushed {
            Ok(true) => sweep.flushed += 1,
            Ok(false) => sweep.aborted += 1,
            Err(err) => {
              sweep.aborted += 1;
              first_err.get_or_insert(err);
            },
          }
        },
      }
      sched.submissions.insert(id, sub);
    }
    sched.deferred = still;

    match first_err {
      Some(err) => Err(err),
      None => Ok(sweep),
    }
  }

  pub fn create_gate(&self) -> GateId {
    self.sched.lock().gates.create()
  }
  pub fn gate_state(&self, gate: GateId) -> Result<GateState, Error> {
    self.sched.lock().gates.state(gate)
  }
  /// Flush everything no longer held back. Returns how many submissions
  /// were flushed.
  pub fn signal_gate(&self, gate: GateId) -> Result<usize, Error> {
    let mut sched = self.sched.lock();
    sched.gates.resolve(gate, GateState::Signaled)?;
    log::debug!("{} signaled", gate);
    Ok(self.sweep_deferred(&mut sched)?.flushed)
  }
  /// Abort everything held back by `gate`, and everything depending on
  /// that. Returns how many submissions were aborted.
  pub fn abort_gate(&self, gate: GateId) -> Result<usize, Error> {
    let mut sched = self.sched.lock();
    sched.gates.resolve(gate, GateState::Aborted)?;
    log::warn!("{} aborted", gate);
    Ok(self.sweep_deferred(&mut sched)?.aborted)
  }

  /// Submit whatever `engine` has batched, or if nothing is, a tag update.
  /// The stamp covers everything flushed to `engine` so far.
  pub fn flush(&self, engine: EngineId) -> Result<CompletionStamp, Error> {
    self.engine(engine)?;
    self.pipelines[engine].lock().flush_engine(&*self.device)
  }

  pub fn invalidate_state(&self, engine: EngineId) -> Result<(), Error> {
    self.engine(engine)?;
    self.pipelines[engine].lock().invalidate_state();
    Ok(())
  }
  pub fn request_cache_flush(&self, engine: EngineId) -> Result<(), Error> {
    self.engine(engine)?;
    self.pipelines[engine].lock().request_cache_flush();
    Ok(())
  }

  /// Enqueue `op` with the translations its `buffers` need around it, per
  /// the configured aux translation mode.
  pub fn enqueue_with_aux_translation(&self, op: Operation, buffers: &[ResourceId])
    -> Result<AuxChain, Error>
  {
    let kind = self.engine(op.engine)?.kind();
    let plan = AuxPlan::new(self.config.aux_translation, op.engine, kind,
                            self.copy_engine().ok(),
                            self.config.coherent_engine_caches, buffers);
    let plan = match plan {
      Some(plan) => plan,
      None => {
        return Ok(AuxChain {
          decompress: None,
          workload: self.enqueue(op)?,
          cache_flush: None,
          recompress: None,
        });
      },
    };
    self.pipelines[op.engine].lock().check_budget(op.config.as_ref())?;

    let gate = op.gate;
    let gated = |o: Operation| match gate {
      Some(gate) => o.gated_on(gate),
      None => o,
    };
    let writing = |mut o: Operation| {
      for buffer in plan.buffers() {
        o = o.writes(buffer);
      }
      o
    };

    let mut sched = self.sched.lock();
    self.retire_locked(&mut sched);

    let decompress = Operation::new(plan.translation_engine,
                                    translation_workload(&plan.decompress))
      .labeled("aux decompress");
    let decompress = self.enqueue_locked(&mut sched, gated(writing(decompress)))?;

    let mut op = op;
    for buffer in plan.buffers() {
      if !op.touches(buffer) {
        op = op.reads_writes(buffer);
      }
    }
    let workload_engine = op.engine;
    let workload = self.enqueue_locked(&mut sched, op)?;

    let cache_flush = if plan.cache_flush {
      let flush = Operation::new(workload_engine, Workload::CacheFlush)
        .labeled("aux cache flush");
      Some(self.enqueue_locked(&mut sched, gated(writing(flush)))?)
    } else {
      None
    };

    let recompress = Operation::new(plan.translation_engine,
                                    translation_workload(&plan.recompress))
      .labeled("aux recompress");
    let recompress = self.enqueue_locked(&mut sched, gated(writing(recompress)))?;

    Ok(AuxChain {
      decompress: Some(decompress),
      workload,
      cache_flush,
      recompress: Some(recompress),
    })
  }

  /// Block until `what` completes, fails, or `timeout` (default: the
  /// configured one) passes.
  pub fn wait_for_completion<C>(&self, what: C, timeout: Option<Duration>) -> Result<(), Error>
    where C: Completion,
  {
    self.wait(what.completion(), timeout, None)
  }
  pub fn wait_cancellable<C>(&self, what: C, timeout: Option<Duration>,
                             cancel: &CancellationToken)
    -> Result<(), Error>
    where C: Completion,
  {
    self.wait(what.completion(), timeout, Some(cancel))
  }

  fn wait(&self, target: WaitTarget, timeout: Option<Duration>,
          cancel: Option<&CancellationToken>)
    -> Result<(), Error>
  {
    match target {
      WaitTarget::Stamp(stamp) => { self.engine(stamp.engine)?; },
      WaitTarget::Submission(handle) => { self.engine(handle.engine)?; },
      WaitTarget::Token(_) => { },
    }

    let timeout = timeout.unwrap_or(self.config.default_timeout);
    let r = self.waiter.poll_until(timeout, cancel, || self.probe(&target) );
    match r {
      Ok(()) => {
        self.retire();
        Ok(())
      },
      Err(Error::HangDetected(engine)) => {
        // a hung producer elsewhere leaves this submission recoverable.
        match target {
          WaitTarget::Submission(handle) if handle.engine == engine => {
            let mut sched = self.sched.lock();
            if let Some(sub) = sched.submissions.get_mut(&handle.id) {
              sub.status = SubmissionStatus::HangDetected;
            }
          },
          _ => { },
        }
        Err(Error::HangDetected(engine))
      },
      Err(err) => Err(err),
    }
  }

  fn probe(&self, target: &WaitTarget) -> Poll<Result<(), Error>> {
    match *target {
      WaitTarget::Stamp(stamp) => self.probe_stamp(stamp),
      WaitTarget::Token(token) => self.probe_token(token),
      WaitTarget::Submission(handle) => self.probe_submission(handle),
    }
  }

  fn probe_stamp(&self, stamp: CompletionStamp) -> Poll<Result<(), Error>> {
    if let Err(err) = self.ensure_submitted(stamp.engine, stamp.task_count) {
      return Poll::Ready(Err(err));
    }
    match self.engines[stamp.engine].poll(self.device.memory()) {
      Err(err) => Poll::Ready(Err(err)),
      Ok(done) if done >= stamp.task_count => Poll::Ready(Ok(())),
      Ok(_) if self.hang.is_hung(stamp.engine) => {
        Poll::Ready(Err(Error::HangDetected(stamp.engine)))
      },
      Ok(done) => {
        log::trace!("{}: at {}, waiting for {}", stamp.engine, done, stamp.task_count);
        Poll::Pending
      },
    }
  }

  fn probe_token(&self, id: TokenId) -> Poll<Result<(), Error>> {
    let token = match self.tokens.get(id) {
      Ok(token) => token,
      Err(err) => return Poll::Ready(Err(err)),
    };
    match self.tokens.status(id) {
      Err(err) => Poll::Ready(Err(err)),
      Ok(TokenStatus::Aborted) => Poll::Ready(Err(Error::ExecutionAborted)),
      Ok(TokenStatus::Complete) => Poll::Ready(Ok(())),
      // deferred: never reached the device, so a hang can't concern it.
      Ok(TokenStatus::Unarmed) => Poll::Pending,
      Ok(TokenStatus::Pending { target, }) => {
        if let Err(err) = self.ensure_submitted(token.engine, target) {
          return Poll::Ready(Err(err));
        }
        if self.hang.is_hung(token.engine) {
          Poll::Ready(Err(Error::HangDetected(token.engine)))
        } else {
          Poll::Pending
        }
      },
    }
  }

  fn probe_submission(&self, handle: SubmissionHandle) -> Poll<Result<(), Error>> {
    let status = self.sched.lock().status(handle.id);
    match status {
      None => Poll::Ready(Err(Error::UnknownSubmission(handle.id))),
      Some(SubmissionStatus::Completed(_)) |
      Some(SubmissionStatus::Retired) => Poll::Ready(Ok(())),
      Some(SubmissionStatus::Aborted) => Poll::Ready(Err(Error::ExecutionAborted)),
      Some(SubmissionStatus::HangDetected) => {
        Poll::Ready(Err(Error::HangDetected(handle.engine)))
      },
      Some(SubmissionStatus::Queued) |
      Some(SubmissionStatus::Deferred) => Poll::Pending,
      Some(SubmissionStatus::Flushed(stamp)) => {
        if let Some(engine) = self.hung_producer(handle.id) {
          return Poll::Ready(Err(Error::HangDetected(engine)));
        }
        self.probe_stamp(stamp)
      },
    }
  }

  /// An engine which is hung while holding a token `id` still waits on.
  fn hung_producer(&self, id: SubmissionId) -> Option<EngineId> {
    let waits = {
      let sched = self.sched.lock();
      let sub = sched.submissions.get(&id)?;
      let waits: SmallVec<[(EngineId, TokenId); 4]> = sub.waits.iter()
        .filter(|w| w.engine != sub.engine )
        .map(|w| (w.engine, w.token) )
        .collect();
      waits
    };
    waits.into_iter()
      .filter(|&(engine, _)| self.hang.is_hung(engine) )
      .find(|&(_, token)| match self.tokens.status(token) {
        Ok(TokenStatus::Pending { .. }) => true,
        _ => false,
      })
      .map(|(engine, _)| engine )
  }

  /// Mark completed submissions, release their token references, and
  /// reclaim tokens the device is done with. Returns how many submissions
  /// retired.
  pub fn retire(&self) -> usize {
    let mut sched = self.sched.lock();
    self.retire_locked(&mut sched)
  }

  fn retire_locked(&self, sched: &mut Scheduler) -> usize {
    let memory = self.device.memory();
    let observed: IndexVec<EngineId, u64> = self.engines.iter()
      .map(|engine| match engine.poll(memory) {
        Ok(done) => done,
        Err(err) => {
          log::warn!("{}: reading completion: {}", engine.name(), err);
          engine.observed()
        },
      })
      .collect();

    let done: Vec<_> = sched.submissions.values()
      .filter(|sub| match sub.status {
        SubmissionStatus::Flushed(stamp) => stamp.task_count <= observed[sub.engine],
        SubmissionStatus::Aborted => true,
        _ => false,
      })
      .map(|sub| sub.id )
      .collect();

    for id in done.iter() {
      if let Some(mut sub) = sched.submissions.remove(id) {
        if let SubmissionStatus::Flushed(stamp) = sub.status {
          sub.status = SubmissionStatus::Completed(stamp);
        }
        self.finish(sched, sub);
      }
    }
    sched.resolver.prune(&self.tokens);
    self.tokens.reclaim();
    done.len()
  }

  /// Drop a terminal submission's token references and remember its fate.
  fn finish(&self, sched: &mut Scheduler, sub: Submission) {
    for wait in sub.waits.iter() {
      self.release_token(wait.token);
    }
    self.release_token(sub.token);
    log::trace!("{} retired as {:?}", sub.id, sub.status);
    sched.retired.record(sub.id, sub.status);
  }

  pub fn is_hung(&self, engine: EngineId) -> bool {
    self.hang.is_hung(engine)
  }
  /// For driver callbacks which detect hangs themselves.
  pub fn mark_hung(&self, engine: EngineId) -> Result<(), Error> {
    self.engine(engine)?;
    self.hang.mark_hung(engine);
    Ok(())
  }

  /// Run `probe` for every engine each `interval` on a background thread,
  /// marking engines it reports as hung.
  pub fn spawn_watchdog<P>(&self, interval: Duration, probe: P) -> Result<Watchdog, Error>
    where P: FnMut(EngineId) -> bool + Send + 'static,
  {
    Watchdog::spawn(self.hang.clone(), interval, probe)
      .map_err(|err| Error::Thread(err.to_string()) )
  }

  /// Recover `engine` after a hang, once the device itself was reset.
  /// Everything flushed to it which hadn't completed is lost and reported
  /// `HangDetected`; the engine's state is reprogrammed in full on its next
  /// flush. Returns how many submissions were lost.
  pub fn reset_engine(&self, engine: EngineId) -> Result<usize, Error> {
    let done = self.engine(engine)?.poll(self.device.memory())?;
    let mut sched = self.sched.lock();

    let lost: Vec<_> = sched.submissions.values()
      .filter(|sub| sub.engine == engine )
      .filter(|sub| match sub.status {
        SubmissionStatus::Flushed(stamp) => stamp.task_count > done,
        SubmissionStatus::HangDetected => true,
        _ => false,
      })
      .map(|sub| sub.id )
      .collect();

    let mut lost_tokens = Vec::with_capacity(lost.len());
    for id in lost.iter() {
      if let Some(mut sub) = sched.submissions.remove(id) {
        sub.status = SubmissionStatus::HangDetected;
        // dependents on other engines must not wait for it forever.
        if let Err(err) = self.tokens.mark_aborted(sub.token) {
          log::warn!("{}: aborting lost token {:?}: {}", engine, sub.token, err);
        }
        lost_tokens.push(sub.token);
        self.finish(&mut sched, sub);
      }
    }
    sched.resolver.forget(&lost_tokens, &self.tokens);
    drop(sched);

    self.pipelines[engine].lock().invalidate_state();
    self.hang.clear(engine);
    log::info!("{} reset, {} submissions lost", engine, lost.len());
    Ok(lost.len())
  }

  /// The host function streamer on `engine`, created on first use.
  pub fn host_function_streamer(&self, engine: EngineId)
    -> Result<Arc<HostFunctionStreamer>, Error>
  {
    self.engine(engine)?;
    let mut streamers = self.streamers.lock();
    if let Some(streamer) = streamers.get(&engine) {
      return Ok(streamer.clone());
    }
    let streamer = HostFunctionStreamer::new(engine, self.device.memory(),
                                             self.config.partitions)?;
    let streamer = Arc::new(streamer);
    streamers.insert(engine, streamer.clone());
    Ok(streamer)
  }

  /// Run `callback(user_data)` on the host once `engine` reaches this point
  /// in its stream. Blocks while a previous host function on `engine` is
  /// outstanding.
  pub fn schedule_host_function<F>(&self, engine: EngineId, callback: F, user_data: u64)
    -> Result<HostFunctionHandle, Error>
    where F: FnOnce(u64) + Send + 'static,
  {
    let streamer = self.host_function_streamer(engine)?;
    let id = streamer.begin(Box::new(callback), user_data, self.device.memory(),
                            self.waiter.clock(), self.config.default_timeout,
                            self.config.poll_interval, || self.hang.is_hung(engine) )?;
    self.submit_host_function(&streamer, id)
  }
  /// Like `schedule_host_function`, but fails with `HostFunctionBusy`
  /// instead of blocking.
  pub fn try_schedule_host_function<F>(&self, engine: EngineId, callback: F, user_data: u64)
    -> Result<HostFunctionHandle, Error>
    where F: FnOnce(u64) + Send + 'static,
  {
    let streamer = self.host_function_streamer(engine)?;
    let id = streamer.try_begin(Box::new(callback), user_data, self.device.memory())?;
    self.submit_host_function(&streamer, id)
  }

  fn submit_host_function(&self, streamer: &HostFunctionStreamer, id: HostFunctionId)
    -> Result<HostFunctionHandle, Error>
  {
    let engine = streamer.engine();
    let op = Operation::new(engine, Workload::Commands(streamer.encode(id)))
      .labeled(format!("host function {}", id.0));
    let submitted = self.enqueue(op)
      .and_then(|submission| {
        // the host can't run it until the engine gets to it.
        self.pipelines[engine].lock().flush_batched(&*self.device)?;
        Ok(submission)
      });
    match submitted {
      Ok(submission) => Ok(HostFunctionHandle { id, submission, }),
      Err(err) => {
        streamer.abandon(id);
        Err(err)
      },
    }
  }

  /// Check `engine`'s host function slots once, running a callback if one
  /// is due. For callers which don't run a `HostFunctionWorker`.
  pub fn poll_host_functions(&self, engine: EngineId) -> Result<Option<HostFunctionId>, Error> {
    self.host_function_streamer(engine)?
      .poll(self.device.memory())
  }

  pub fn spawn_host_function_worker(&self, engine: EngineId) -> Result<HostFunctionWorker, Error> {
    let streamer = self.host_function_streamer(engine)?;
    HostFunctionWorker::spawn(streamer, self.device.clone(), self.config.poll_interval)
      .map_err(|err| Error::Thread(err.to_string()) )
  }
}

impl Drop for RuntimeContext {
  fn drop(&mut self) {
    let memory = self.device.memory();
    for streamer in self.streamers.get_mut().values() {
      streamer.release(memory);
    }
    for engine in self.engines.iter() {
      engine.release(memory);
    }
  }
}
