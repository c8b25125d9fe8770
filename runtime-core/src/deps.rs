//! Cross-engine dependency resolution.
//!
//! For every resource the resolver remembers the last submission which wrote
//! it, and the submissions which read it since (at most one per engine: a
//! later read on the same engine finishes after an earlier one). An operation
//! reading a resource depends on the last writer; an operation writing it
//! depends on the last writer and all of those readers.
//!
//! Dependencies are then trimmed:
//!  * producers on the operation's own engine need no wait, engines execute
//!    in order;
//!  * producers which already completed need no wait;
//!  * of several producers on one foreign engine only the one with the
//!    highest target is waited on, since the engine completes them in order.
//! Producers which haven't been flushed yet can't be waited on at all; the
//! operation is deferred behind them.

use std::collections::{BTreeMap, HashMap, };
use std::mem;

use serde::{Deserialize, Serialize, };

use smallvec::SmallVec;

use device_rt::{DeviceAddress, EngineId, };

use crate::error::Error;
use crate::submission::SubmissionId;
use crate::token::{TokenAllocator, TokenId, TokenStatus, };

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
pub struct ResourceId(pub u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Intent {
  Read,
  Write,
  ReadWrite,
}
impl Intent {
  #[inline(always)]
  pub fn reads(&self) -> bool {
    match self {
      Intent::Read | Intent::ReadWrite => true,
      Intent::Write => false,
    }
  }
  #[inline(always)]
  pub fn writes(&self) -> bool {
    match self {
      Intent::Write | Intent::ReadWrite => true,
      Intent::Read => false,
    }
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Access {
  pub resource: ResourceId,
  pub intent: Intent,
}
impl Access {
  pub fn read(resource: ResourceId) -> Self {
    Access { resource, intent: Intent::Read, }
  }
  pub fn write(resource: ResourceId) -> Self {
    Access { resource, intent: Intent::Write, }
  }
  pub fn read_write(resource: ResourceId) -> Self {
    Access { resource, intent: Intent::ReadWrite, }
  }
}

/// A wait the engine must perform before the workload: stall until the
/// token at `address` reaches `target`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResolvedWait {
  pub engine: EngineId,
  pub token: TokenId,
  pub address: DeviceAddress,
  pub target: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Producer {
  pub engine: EngineId,
  pub token: TokenId,
  pub submission: SubmissionId,
}

#[derive(Default)]
struct ResourceState {
  writer: Option<Producer>,
  readers: SmallVec<[Producer; 2]>,
}
impl ResourceState {
  fn producers(&self) -> impl Iterator<Item = &Producer> {
    self.writer.iter().chain(self.readers.iter())
  }
}

#[derive(Clone, Debug, Default)]
pub struct Resolution {
  /// At most one per foreign engine.
  pub waits: SmallVec<[ResolvedWait; 4]>,
  /// Producers which haven't been flushed.
  pub deferred_on: SmallVec<[SubmissionId; 2]>,
  /// Some producer was aborted, so this operation can never run.
  pub aborted: bool,
}
impl Resolution {
  pub fn is_ready(&self) -> bool {
    self.deferred_on.is_empty() && !self.aborted
  }
}

/// Holds one token reference for every producer it remembers.
#[derive(Default)]
pub struct DependencyResolver {
  table: HashMap<ResourceId, ResourceState>,
}

impl DependencyResolver {
  pub fn new() -> Self { Self::default() }

  pub fn tracked_resources(&self) -> usize { self.table.len() }

  pub fn resolve(&self, engine: EngineId, accesses: &[Access], tokens: &TokenAllocator)
    -> Result<Resolution, Error>
  {
    let mut resolution = Resolution::default();
    let mut latest: BTreeMap<EngineId, ResolvedWait> = BTreeMap::new();

    for access in accesses.iter() {
      let state = match self.table.get(&access.resource) {
        Some(state) => state,
        None => continue,
      };
      let readers: &[Producer] = if access.intent.writes() {
        &state.readers
      } else {
        &[]
      };
      for producer in state.writer.iter().chain(readers.iter()) {
        Self::consider(engine, producer, tokens, &mut resolution, &mut latest)?;
      }
    }

    resolution.waits = latest.into_iter()
      .map(|(_, wait)| wait )
      .collect();
    Ok(resolution)
  }

  fn consider(engine: EngineId, producer: &Producer, tokens: &TokenAllocator,
              resolution: &mut Resolution,
              latest: &mut BTreeMap<EngineId, ResolvedWait>)
    -> Result<(), Error>
  {
    match tokens.status(producer.token)? {
      TokenStatus::Aborted => {
        resolution.aborted = true;
      },
      TokenStatus::Complete => { },
      TokenStatus::Unarmed => {
        if !resolution.deferred_on.contains(&producer.submission) {
          resolution.deferred_on.push(producer.submission);
        }
      },
      TokenStatus::Pending { .. } if producer.engine == engine => { },
      TokenStatus::Pending { target, } => {
        let address = tokens.get(producer.token)?.address;
        let wait = ResolvedWait {
          engine: producer.engine,
          token: producer.token,
          address,
          target,
        };
        let slot = latest.entry(producer.engine).or_insert(wait);
        if slot.target < target {
          *slot = wait;
        }
      },
    }
    Ok(())
  }

  /// Remember `producer` as the newest writer or reader of everything it
  /// accesses.
  pub(crate) fn record(&mut self, producer: Producer, accesses: &[Access],
                       tokens: &TokenAllocator)
    -> Result<(), Error>
  {
    for access in accesses.iter() {
      let state = self.table.entry(access.resource).or_default();
      tokens.retain(producer.token)?;
      if access.intent.writes() {
        if let Some(old) = state.writer.replace(producer) {
          tokens.release(old.token)?;
        }
        for reader in state.readers.drain(..) {
          tokens.release(reader.token)?;
        }
        continue;
      }

      let same_engine = state.readers.iter()
        .position(|r| r.engine == producer.engine );
      match same_engine {
        // an unflushed reader isn't covered by a later flushed one.
        Some(pos) if tokens.get(state.readers[pos].token)?.target.is_some() => {
          let old = mem::replace(&mut state.readers[pos], producer);
          tokens.release(old.token)?;
        },
        _ => state.readers.push(producer),
      }
    }
    Ok(())
  }

  /// Drop every mention of `lost`: tokens whose submissions were lost with
  /// a reset engine and will never complete.
  pub fn forget(&mut self, lost: &[TokenId], tokens: &TokenAllocator) {
    let mut dropped = Vec::new();
    for state in self.table.values_mut() {
      if let Some(writer) = state.writer {
        if lost.contains(&writer.token) {
          state.writer = None;
          dropped.push(writer.token);
        }
      }
      state.readers.retain(|r| {
        if lost.contains(&r.token) {
          dropped.push(r.token);
          false
        } else {
          true
        }
      });
    }
    self.table.retain(|_, state| state.producers().next().is_some() );
    for token in dropped {
      if let Err(err) = tokens.release(token) {
        log::warn!("releasing lost {}: {}", token, err);
      }
    }
  }

  /// Forget resources whose producers are all done, dropping their token
  /// references.
  pub fn prune(&mut self, tokens: &TokenAllocator) -> usize {
    let mut done = Vec::new();
    for (&resource, state) in self.table.iter() {
      let finished = state.producers()
        .all(|p| match tokens.status(p.token) {
          Ok(TokenStatus::Complete) | Ok(TokenStatus::Aborted) => true,
          _ => false,
        });
      if finished {
        done.push(resource);
      }
    }

    for resource in done.iter() {
      if let Some(state) = self.table.remove(resource) {
        for producer in state.producers() {
          if let Err(err) = tokens.release(producer.token) {
            log::warn!("releasing {} for {:?}: {}", producer.token, resource, err);
          }
        }
      }
    }
    done.len()
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::utils::test::*;

  use std::sync::Arc;

  use device_rt::{Device, EngineKind, };
  use device_rt::sim::SimDevice;

  const A: EngineId = EngineId(0);
  const B: EngineId = EngineId(1);
  const R1: ResourceId = ResourceId(1);
  const R2: ResourceId = ResourceId(2);

  struct Fixture {
    dev: Arc<SimDevice>,
    tokens: TokenAllocator,
    resolver: DependencyResolver,
    next: u64,
  }
  impl Fixture {
    fn new() -> Self {
      let dev = sim(&[EngineKind::Compute, EngineKind::Copy]);
      let tokens = TokenAllocator::new(dev.clone(), 16, 4);
      Fixture {
        dev,
        tokens,
        resolver: DependencyResolver::new(),
        next: 0,
      }
    }
    /// Record a producer; `target` arms its token.
    fn produce(&mut self, engine: EngineId, target: Option<u64>, accesses: &[Access])
      -> Producer
    {
      let token = self.tokens.acquire(engine).unwrap();
      if let Some(target) = target {
        self.tokens.assign_target(token.id, target).unwrap();
      }
      self.next += 1;
      let p = Producer {
        engine,
        token: token.id,
        submission: SubmissionId(self.next),
      };
      self.resolver.record(p, accesses, &self.tokens).unwrap();
      p
    }
    fn complete(&self, p: &Producer) {
      let token = self.tokens.get(p.token).unwrap();
      self.dev.memory().write(token.address, token.target.unwrap()).unwrap();
    }
    fn resolve(&self, engine: EngineId, accesses: &[Access]) -> Resolution {
      self.resolver.resolve(engine, accesses, &self.tokens).unwrap()
    }
  }

  #[test]
  fn same_engine_needs_no_wait() {
    let mut f = Fixture::new();
    f.produce(A, Some(1), &[Access::write(R1)]);
    let r = f.resolve(A, &[Access::read(R1)]);
    assert!(r.waits.is_empty());
    assert!(r.is_ready());
  }

  #[test]
  fn one_wait_per_foreign_engine() {
    let mut f = Fixture::new();
    let p1 = f.produce(B, Some(3), &[Access::write(R1)]);
    let p2 = f.produce(B, Some(5), &[Access::write(R2)]);
    let r = f.resolve(A, &[Access::read(R1), Access::read(R2)]);
    assert_eq!(r.waits.len(), 1);
    assert_eq!(r.waits[0].target, 5);
    assert_eq!(r.waits[0].token, p2.token);
    assert_ne!(r.waits[0].token, p1.token);
  }

  #[test]
  fn completed_producers_are_elided() {
    let mut f = Fixture::new();
    let p = f.produce(B, Some(2), &[Access::write(R1)]);
    f.complete(&p);
    let r = f.resolve(A, &[Access::read(R1)]);
    assert!(r.waits.is_empty());
  }

  #[test]
  fn writes_wait_for_readers() {
    let mut f = Fixture::new();
    f.produce(A, Some(1), &[Access::write(R1)]);
    let reader = f.produce(B, Some(4), &[Access::read(R1)]);

    // another read only needs the writer, which is on its own engine.
    assert!(f.resolve(A, &[Access::read(R1)]).waits.is_empty());

    let r = f.resolve(A, &[Access::write(R1)]);
    assert_eq!(r.waits.len(), 1);
    assert_eq!(r.waits[0].engine, B);
    assert_eq!(r.waits[0].token, reader.token);
  }

  #[test]
  fn unflushed_producers_defer() {
    let mut f = Fixture::new();
    let p = f.produce(A, None, &[Access::write(R1)]);
    let r = f.resolve(A, &[Access::read(R1)]);
    assert_eq!(&r.deferred_on[..], &[p.submission]);
    assert!(!r.is_ready());
  }

  #[test]
  fn aborted_producers_poison() {
    let mut f = Fixture::new();
    let p = f.produce(B, None, &[Access::write(R1)]);
    f.tokens.mark_aborted(p.token).unwrap();
    assert!(f.resolve(A, &[Access::read(R1)]).aborted);
  }

  #[test]
  fn forget_lost_producers() {
    let mut f = Fixture::new();
    let lost = f.produce(B, Some(1), &[Access::write(R1)]);
    f.produce(B, Some(2), &[Access::read(R2)]);
    f.resolver.forget(&[lost.token], &f.tokens);
    assert_eq!(f.resolver.tracked_resources(), 1);
    assert!(f.resolve(A, &[Access::write(R1)]).waits.is_empty());
  }

  #[test]
  fn prune_releases_finished_resources() {
    let mut f = Fixture::new();
    let p = f.produce(B, Some(1), &[Access::write(R1)]);
    f.produce(B, Some(2), &[Access::write(R2)]);
    f.complete(&p);
    assert_eq!(f.resolver.prune(&f.tokens), 1);
    assert_eq!(f.resolver.tracked_resources(), 1);
    // the producer's own reference is still held.
    assert!(f.tokens.get(p.token).is_ok());
    f.tokens.release(p.token).unwrap();
    assert!(f.tokens.get(p.token).is_err());
  }
}
