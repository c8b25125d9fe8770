use std::collections::{HashMap, VecDeque, };
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use device_rt::{Command, CommandBuffer, DeviceKernel, EngineId, TranslationDirection, };

use crate::deps::{Access, ResolvedWait, ResourceId, };
use crate::gate::GateId;
use crate::state::EngineConfig;
use crate::token::TokenId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SubmissionId(pub u64);
impl fmt::Display for SubmissionId {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "sub{}", self.0)
  }
}

/// Identifies a flushed submission: its engine, the task count the engine
/// writes once it finishes, and which device submission carried it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct CompletionStamp {
  pub engine: EngineId,
  pub task_count: u64,
  pub flush_sequence: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubmissionStatus {
  Queued,
  /// Held back until its gates resolve.
  Deferred,
  Flushed(CompletionStamp),
  Completed(CompletionStamp),
  /// Completed, and its record has since been discarded.
  Retired,
  Aborted,
  HangDetected,
}
impl SubmissionStatus {
  pub fn is_terminal(&self) -> bool {
    match self {
      SubmissionStatus::Completed(_) | SubmissionStatus::Retired |
      SubmissionStatus::Aborted | SubmissionStatus::HangDetected => true,
      _ => false,
    }
  }
  pub fn stamp(&self) -> Option<CompletionStamp> {
    match self {
      &SubmissionStatus::Flushed(stamp) | &SubmissionStatus::Completed(stamp) => Some(stamp),
      _ => None,
    }
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SubmissionHandle {
  pub id: SubmissionId,
  pub engine: EngineId,
  pub token: TokenId,
}

/// The device work an operation carries.
#[derive(Clone, Debug)]
pub enum Workload {
  Kernel(Arc<dyn DeviceKernel>),
  Translate {
    resources: SmallVec<[ResourceId; 4]>,
    direction: TranslationDirection,
  },
  CacheFlush,
  /// No work; the submission only orders and signals.
  Barrier,
  Commands(CommandBuffer),
}

impl Workload {
  pub fn encode(&self, out: &mut CommandBuffer) {
    match self {
      Workload::Kernel(kernel) => out.push(Command::Dispatch(kernel.clone())),
      &Workload::Translate { ref resources, direction, } => {
        for resource in resources.iter() {
          out.push(Command::Translate {
            resource: resource.0,
            direction,
          });
        }
      },
      Workload::CacheFlush => out.push(Command::CacheFlush { post_sync: None, }),
      Workload::Barrier => { },
      Workload::Commands(cmds) => out.append(cmds.clone()),
    }
  }
}

/// A unit of work to enqueue on one engine, with the resources it touches.
#[derive(Clone, Debug)]
pub struct Operation {
  pub engine: EngineId,
  pub label: String,
  pub workload: Workload,
  pub accesses: SmallVec<[Access; 4]>,
  /// State the engine needs for this workload. Copy engines ignore it.
  pub config: Option<EngineConfig>,
  /// Hold the operation until this gate is signaled.
  pub gate: Option<GateId>,
}

impl Operation {
  pub fn new(engine: EngineId, workload: Workload) -> Self {
    Operation {
      engine,
      label: String::new(),
      workload,
      accesses: SmallVec::new(),
      config: None,
      gate: None,
    }
  }
  pub fn kernel<K>(engine: EngineId, kernel: K) -> Self
    where K: DeviceKernel + 'static,
  {
    let label = kernel.label().to_owned();
    Self::new(engine, Workload::Kernel(Arc::new(kernel)))
      .labeled(label)
  }
  pub fn barrier(engine: EngineId) -> Self {
    Self::new(engine, Workload::Barrier)
  }

  pub fn labeled<S>(mut self, label: S) -> Self
    where S: Into<String>,
  {
    self.label = label.into();
    self
  }
  pub fn reads(mut self, resource: ResourceId) -> Self {
    self.accesses.push(Access::read(resource));
    self
  }
  pub fn writes(mut self, resource: ResourceId) -> Self {
    self.accesses.push(Access::write(resource));
    self
  }
  pub fn reads_writes(mut self, resource: ResourceId) -> Self {
    self.accesses.push(Access::read_write(resource));
    self
  }
  pub fn with_config(mut self, config: EngineConfig) -> Self {
    self.config = Some(config);
    self
  }
  pub fn gated_on(mut self, gate: GateId) -> Self {
    self.gate = Some(gate);
    self
  }

  pub fn touches(&self, resource: ResourceId) -> bool {
    self.accesses.iter().any(|a| a.resource == resource )
  }
}

pub(crate) struct Submission {
  pub id: SubmissionId,
  pub engine: EngineId,
  pub label: String,
  pub workload: Workload,
  pub config: Option<EngineConfig>,
  pub token: TokenId,
  /// Each wait holds a reference on its token until this submission
  /// retires.
  pub waits: SmallVec<[ResolvedWait; 4]>,
  pub gates: SmallVec<[GateId; 2]>,
  /// Unflushed producers at enqueue time. Their waits are added when this
  /// submission leaves the deferred set.
  pub deferred_on: SmallVec<[SubmissionId; 2]>,
  /// Flush engine caches before the workload.
  pub pre_flush: bool,
  pub status: SubmissionStatus,
  pub commands: Option<CommandBuffer>,
}

impl Submission {
  pub fn handle(&self) -> SubmissionHandle {
    SubmissionHandle {
      id: self.id,
      engine: self.engine,
      token: self.token,
    }
  }
}

/// Statuses of submissions whose records were dropped. Failures are kept for
/// good; completions only for the most recent `capacity` submissions, and
/// anything older which isn't a known failure is reported `Retired`.
pub(crate) struct RetiredLog {
  completed: HashMap<SubmissionId, CompletionStamp>,
  order: VecDeque<SubmissionId>,
  capacity: usize,
  failed: HashMap<SubmissionId, SubmissionStatus>,
}

impl RetiredLog {
  pub fn new(capacity: usize) -> Self {
    RetiredLog {
      completed: HashMap::default(),
      order: VecDeque::new(),
      capacity,
      failed: HashMap::default(),
    }
  }

  pub fn record(&mut self, id: SubmissionId, status: SubmissionStatus) {
    match status {
      SubmissionStatus::Completed(stamp) => {
        self.completed.insert(id, stamp);
        self.order.push_back(id);
        while self.order.len() > self.capacity {
          if let Some(old) = self.order.pop_front() {
            self.completed.remove(&old);
          }
        }
      },
      SubmissionStatus::Aborted | SubmissionStatus::HangDetected => {
        self.failed.insert(id, status);
      },
      _ => { },
    }
  }

  /// `issued` is the first id not yet handed out.
  pub fn lookup(&self, id: SubmissionId, issued: SubmissionId) -> Option<SubmissionStatus> {
    if let Some(&status) = self.failed.get(&id) {
      return Some(status);
    }
    if let Some(&stamp) = self.completed.get(&id) {
      return Some(SubmissionStatus::Completed(stamp));
    }
    if id < issued {
      Some(SubmissionStatus::Retired)
    } else {
      None
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn retired_log_keeps_failures() {
    let mut log = RetiredLog::new(2);
    let stamp = |n| CompletionStamp {
      engine: EngineId(0),
      task_count: n,
      flush_sequence: n,
    };
    log.record(SubmissionId(1), SubmissionStatus::Aborted);
    for n in 2..6 {
      log.record(SubmissionId(n), SubmissionStatus::Completed(stamp(n)));
    }
    let issued = SubmissionId(6);
    assert_eq!(log.lookup(SubmissionId(1), issued), Some(SubmissionStatus::Aborted));
    assert_eq!(log.lookup(SubmissionId(2), issued), Some(SubmissionStatus::Retired));
    assert_eq!(log.lookup(SubmissionId(5), issued),
               Some(SubmissionStatus::Completed(stamp(5))));
    assert_eq!(log.lookup(SubmissionId(9), issued), None);
  }

  #[test]
  fn builder() {
    let op = Operation::barrier(EngineId(1))
      .reads(ResourceId(1))
      .writes(ResourceId(2))
      .labeled("b");
    assert!(op.touches(ResourceId(2)));
    assert!(!op.touches(ResourceId(3)));
    assert_eq!(op.accesses.len(), 2);
    assert_eq!(op.label, "b");
  }
}
