//! Dependency tokens.
//!
//! A token is one device word the engine writes when the submission owning
//! the token finishes. Tokens live in chunks of device memory and are handed
//! out by index and generation, so a handle kept past the token's release is
//! detected instead of silently aliasing whichever submission reused the
//! slot.
//!
//! A token's slot is reclaimed only when both:
//!  * every holder has released it, and
//!  * the device has written (or can no longer write) the token's target.
//! Until then a released token sits on the pending reclaim list.

use std::fmt;
use std::mem;
use std::sync::Arc;

use device_rt::{Allocation, Device, DeviceAddress, DeviceMemory, EngineId, };

use parking_lot::Mutex;

use crate::error::Error;

/// Word value of a token which is in flight.
pub const TOKEN_NOT_READY: u64 = 0;
/// Written by the host into the token of a submission which was aborted
/// before it reached the device.
pub const TOKEN_ABORTED: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TokenId {
  index: u32,
  generation: u32,
}
impl TokenId {
  pub fn index(&self) -> u32 { self.index }
  pub fn generation(&self) -> u32 { self.generation }
}
impl fmt::Display for TokenId {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "token{}#{}", self.index, self.generation)
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Token {
  pub id: TokenId,
  /// The engine whose submission will write this token.
  pub engine: EngineId,
  pub address: DeviceAddress,
  /// Task count the owning submission was stamped with. `None` until the
  /// submission is flushed.
  pub target: Option<u64>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TokenStatus {
  /// The owning submission hasn't been flushed.
  Unarmed,
  Pending {
    target: u64,
  },
  Complete,
  Aborted,
}

struct Live {
  engine: EngineId,
  target: Option<u64>,
  refs: u32,
  aborted: bool,
  complete: bool,
}

struct Slot {
  generation: u32,
  address: DeviceAddress,
  live: Option<Live>,
}

#[derive(Default)]
struct TokenPool {
  slots: Vec<Slot>,
  free: Vec<u32>,
  /// Released, but possibly still written by the device.
  zombies: Vec<u32>,
  chunks: Vec<Allocation>,
}

pub struct TokenAllocator {
  device: Arc<dyn Device>,
  chunk_size: usize,
  max_chunks: usize,
  pool: Mutex<TokenPool>,
}

impl TokenAllocator {
  pub fn new(device: Arc<dyn Device>, chunk_size: usize, max_chunks: usize) -> Self {
    TokenAllocator {
      device,
      chunk_size: chunk_size.max(1),
      max_chunks,
      pool: Mutex::new(TokenPool::default()),
    }
  }

  fn memory(&self) -> &dyn DeviceMemory { self.device.memory() }

  /// Get an unarmed token for a submission on `engine`, holding one
  /// reference. The token's device word is reset before it is returned.
  pub fn acquire(&self, engine: EngineId) -> Result<Token, Error> {
    let mut pool = self.pool.lock();
    if pool.free.is_empty() {
      self.reclaim_locked(&mut pool);
    }
    if pool.free.is_empty() {
      self.grow(&mut pool)?;
    }
    let index = pool.free.pop().ok_or(Error::OutOfTokens)?;

    let slot = &mut pool.slots[index as usize];
    self.memory().write(slot.address, TOKEN_NOT_READY)?;
    slot.live = Some(Live {
      engine,
      target: None,
      refs: 1,
      aborted: false,
      complete: false,
    });

    Ok(Token {
      id: TokenId {
        index,
        generation: slot.generation,
      },
      engine,
      address: slot.address,
      target: None,
    })
  }

  fn grow(&self, pool: &mut TokenPool) -> Result<(), Error> {
    if pool.chunks.len() >= self.max_chunks {
      log::warn!("token pool exhausted: {} chunks of {}", pool.chunks.len(),
                 self.chunk_size);
      return Err(Error::OutOfTokens);
    }

    let chunk = self.memory().allocate(self.chunk_size)
      .map_err(|err| {
        log::warn!("growing token pool: {}", err);
        Error::OutOfTokens
      })?;
    let first = pool.slots.len() as u32;
    for idx in 0..self.chunk_size {
      pool.slots.push(Slot {
        generation: 0,
        address: chunk.base().offset_words(idx),
        live: None,
      });
    }
    // lowest index is handed out first.
    pool.free.extend((first..first + self.chunk_size as u32).rev());
    pool.chunks.push(chunk);
    log::debug!("token pool grew to {} chunks", pool.chunks.len());
    Ok(())
  }

  fn live(pool: &mut TokenPool, id: TokenId)
    -> Result<(DeviceAddress, &mut Live), Error>
  {
    let slot = pool.slots.get_mut(id.index as usize)
      .ok_or(Error::InvalidToken(id))?;
    if slot.generation != id.generation {
      return Err(Error::InvalidToken(id));
    }
    let address = slot.address;
    slot.live.as_mut()
      .map(|live| (address, live) )
      .ok_or(Error::InvalidToken(id))
  }
  /// Like `live`, but the caller must still hold a reference.
  fn held(pool: &mut TokenPool, id: TokenId)
    -> Result<(DeviceAddress, &mut Live), Error>
  {
    match Self::live(pool, id)? {
      (_, live) if live.refs == 0 => Err(Error::InvalidToken(id)),
      held => Ok(held),
    }
  }

  pub fn get(&self, id: TokenId) -> Result<Token, Error> {
    let mut pool = self.pool.lock();
    let (address, live) = Self::held(&mut pool, id)?;
    Ok(Token {
      id,
      engine: live.engine,
      address,
      target: live.target,
    })
  }

  /// Arm the token with the task count of the submission which owns it.
  pub fn assign_target(&self, id: TokenId, target: u64) -> Result<Token, Error> {
    let mut pool = self.pool.lock();
    let (address, live) = Self::live(&mut pool, id)?;
    live.target = Some(target);
    Ok(Token {
      id,
      engine: live.engine,
      address,
      target: live.target,
    })
  }

  pub fn retain(&self, id: TokenId) -> Result<(), Error> {
    let mut pool = self.pool.lock();
    let (_, live) = Self::held(&mut pool, id)?;
    live.refs += 1;
    Ok(())
  }

  pub fn release(&self, id: TokenId) -> Result<(), Error> {
    let mut pool = self.pool.lock();
    let (address, live) = Self::held(&mut pool, id)?;
    live.refs -= 1;
    if live.refs > 0 {
      return Ok(());
    }

    let reusable = match live.target {
      // the device was never told about it.
      None => true,
      Some(_) => {
        live.aborted || live.complete ||
          self.observe_target(address, live).unwrap_or(false)
      },
    };
    if reusable {
      Self::free_slot(&mut pool, id.index);
    } else {
      pool.zombies.push(id.index);
    }
    Ok(())
  }

  /// Write the aborted sentinel. Waiters on the token fail with
  /// `ExecutionAborted`.
  pub fn mark_aborted(&self, id: TokenId) -> Result<(), Error> {
    let mut pool = self.pool.lock();
    let (address, live) = Self::live(&mut pool, id)?;
    live.aborted = true;
    self.memory().write(address, TOKEN_ABORTED)?;
    Ok(())
  }

  pub fn status(&self, id: TokenId) -> Result<TokenStatus, Error> {
    let mut pool = self.pool.lock();
    let (address, live) = Self::live(&mut pool, id)?;
    if live.aborted {
      return Ok(TokenStatus::Aborted);
    }
    if live.complete {
      return Ok(TokenStatus::Complete);
    }
    let target = match live.target {
      Some(target) => target,
      None => return Ok(TokenStatus::Unarmed),
    };
    if self.observe_target(address, live)? {
      Ok(if live.aborted { TokenStatus::Aborted } else { TokenStatus::Complete })
    } else {
      Ok(TokenStatus::Pending { target, })
    }
  }

  pub fn is_complete(&self, id: TokenId) -> Result<bool, Error> {
    Ok(self.status(id)? == TokenStatus::Complete)
  }

  /// Reads the token's word. Once complete, the result is cached in `live`.
  fn observe_target(&self, address: DeviceAddress, live: &mut Live) -> Result<bool, Error> {
    let target = match live.target {
      Some(target) => target,
      None => return Ok(false),
    };
    let memory = self.memory();
    if !memory.is_coherent() {
      memory.download(&Allocation::single(address))?;
    }
    let value = memory.read(address)?;
    if value == TOKEN_ABORTED {
      live.aborted = true;
      return Ok(true);
    }
    if value >= target {
      live.complete = true;
    }
    Ok(live.complete)
  }

  fn free_slot(pool: &mut TokenPool, index: u32) {
    let slot = &mut pool.slots[index as usize];
    slot.live = None;
    slot.generation = slot.generation.wrapping_add(1);
    pool.free.push(index);
  }

  /// Move released tokens the device is done with back to the free list.
  pub fn reclaim(&self) -> usize {
    let mut pool = self.pool.lock();
    self.reclaim_locked(&mut pool)
  }

  fn reclaim_locked(&self, pool: &mut TokenPool) -> usize {
    let zombies = mem::take(&mut pool.zombies);
    let mut reclaimed = 0;
    for index in zombies {
      let slot = &mut pool.slots[index as usize];
      let address = slot.address;
      let done = match slot.live.as_mut() {
        // still referenced.
        Some(live) if live.refs > 0 => false,
        Some(live) => match self.observe_target(address, live) {
          Ok(done) => done,
          Err(err) => {
            log::warn!("reading token at {}: {}", address, err);
            false
          },
        },
        None => true,
      };
      if done {
        Self::free_slot(pool, index);
        reclaimed += 1;
      } else {
        pool.zombies.push(index);
      }
    }
    if reclaimed > 0 {
      log::trace!("reclaimed {} tokens", reclaimed);
    }
    reclaimed
  }

  pub fn live_tokens(&self) -> usize {
    let pool = self.pool.lock();
    pool.slots.len() - pool.free.len()
  }
  pub fn pending_reclaim(&self) -> usize {
    self.pool.lock().zombies.len()
  }
  pub fn capacity(&self) -> usize {
    self.pool.lock().slots.len()
  }
}

impl Drop for TokenAllocator {
  fn drop(&mut self) {
    let pool = self.pool.get_mut();
    for chunk in pool.chunks.drain(..) {
      self.device.memory().free(chunk);
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::utils::test::*;

  use device_rt::EngineKind;
  use device_rt::sim::{MemoryModel, SimDevice, };

  fn allocator(chunk: usize, max: usize) -> (Arc<SimDevice>, TokenAllocator) {
    let dev = sim(&[EngineKind::Compute, EngineKind::Copy]);
    let tokens = TokenAllocator::new(dev.clone(), chunk, max);
    (dev, tokens)
  }

  #[test]
  fn stale_handles_are_rejected() {
    let (dev, tokens) = allocator(4, 1);
    let t = tokens.acquire(EngineId(0)).unwrap();
    tokens.assign_target(t.id, 3).unwrap();
    dev.memory().write(t.address, 3).unwrap();
    tokens.release(t.id).unwrap();

    assert_eq!(tokens.get(t.id), Err(Error::InvalidToken(t.id)));
    assert_eq!(tokens.release(t.id), Err(Error::InvalidToken(t.id)));

    let again = tokens.acquire(EngineId(1)).unwrap();
    assert_eq!(again.id.index(), t.id.index());
    assert_ne!(again.id, t.id);
    assert_eq!(dev.memory().read(again.address).unwrap(), TOKEN_NOT_READY,
               "reused token word must be reset");
    assert_eq!(tokens.status(again.id).unwrap(), TokenStatus::Unarmed);
  }

  #[test]
  fn exhaustion_and_reclaim() {
    let (dev, tokens) = allocator(2, 1);
    let a = tokens.acquire(EngineId(0)).unwrap();
    let _b = tokens.acquire(EngineId(0)).unwrap();
    assert_eq!(tokens.acquire(EngineId(0)), Err(Error::OutOfTokens));

    tokens.assign_target(a.id, 1).unwrap();
    tokens.release(a.id).unwrap();
    assert_eq!(tokens.pending_reclaim(), 1);
    assert_eq!(tokens.acquire(EngineId(0)), Err(Error::OutOfTokens));

    dev.memory().write(a.address, 1).unwrap();
    let c = tokens.acquire(EngineId(0)).unwrap();
    assert_eq!(c.id.index(), a.id.index());
    assert_eq!(tokens.pending_reclaim(), 0);
  }

  #[test]
  fn references_hold_the_slot() {
    let (dev, tokens) = allocator(4, 1);
    let t = tokens.acquire(EngineId(0)).unwrap();
    tokens.assign_target(t.id, 2).unwrap();
    tokens.retain(t.id).unwrap();
    dev.memory().write(t.address, 2).unwrap();

    tokens.release(t.id).unwrap();
    assert!(tokens.is_complete(t.id).unwrap());
    tokens.release(t.id).unwrap();
    assert!(tokens.get(t.id).is_err());
    assert_eq!(tokens.live_tokens(), 0);
  }

  #[test]
  fn aborted_tokens() {
    let (dev, tokens) = allocator(4, 1);
    let t = tokens.acquire(EngineId(0)).unwrap();
    tokens.mark_aborted(t.id).unwrap();
    assert_eq!(tokens.status(t.id).unwrap(), TokenStatus::Aborted);
    assert_eq!(dev.memory().read(t.address).unwrap(), TOKEN_ABORTED);
    tokens.release(t.id).unwrap();
    assert_eq!(tokens.live_tokens(), 0);
  }

  #[test]
  fn pending_until_target() {
    let (dev, tokens) = allocator(4, 1);
    let t = tokens.acquire(EngineId(0)).unwrap();
    tokens.assign_target(t.id, 5).unwrap();
    dev.memory().write(t.address, 4).unwrap();
    assert_eq!(tokens.status(t.id).unwrap(), TokenStatus::Pending { target: 5, });
    dev.memory().write(t.address, 6).unwrap();
    assert_eq!(tokens.status(t.id).unwrap(), TokenStatus::Complete);
  }

  #[test]
  fn double_release_is_rejected() {
    let (_dev, tokens) = allocator(4, 1);
    let t = tokens.acquire(EngineId(0)).unwrap();
    tokens.assign_target(t.id, 3).unwrap();
    tokens.release(t.id).unwrap();
    assert_eq!(tokens.pending_reclaim(), 1);
    assert_eq!(tokens.release(t.id), Err(Error::InvalidToken(t.id)));
    assert_eq!(tokens.pending_reclaim(), 1);
  }

  #[test]
  fn released_tokens_cannot_be_retained() {
    let (dev, tokens) = allocator(4, 1);
    let t = tokens.acquire(EngineId(0)).unwrap();
    tokens.assign_target(t.id, 3).unwrap();
    tokens.release(t.id).unwrap();
    assert_eq!(tokens.retain(t.id), Err(Error::InvalidToken(t.id)));
    assert_eq!(tokens.get(t.id), Err(Error::InvalidToken(t.id)));

    dev.memory().write(t.address, 3).unwrap();
    assert_eq!(tokens.reclaim(), 1);
    assert_eq!(tokens.live_tokens(), 0);
  }

  #[test]
  fn device_exhaustion_is_out_of_tokens() {
    let dev = SimDevice::with_capacity(&[EngineKind::Compute], MemoryModel::Coherent, 4)
      .unwrap();
    let tokens = TokenAllocator::new(dev.clone(), 8, 4);
    assert_eq!(tokens.acquire(EngineId(0)), Err(Error::OutOfTokens));
    assert_eq!(tokens.capacity(), 0);
  }
}
