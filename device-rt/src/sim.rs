//! A software device. Each engine is a worker thread draining a FIFO of
//! command buffers; device memory is a flat array of atomic words.
//!
//! With `MemoryModel::Downloaded`, device writes land in the device array
//! only, and the host reads a shadow copy which is refreshed by
//! `DeviceMemory::download`.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering, };
use std::thread::{self, JoinHandle, };
use std::time::Duration;

use crossbeam_utils::Backoff;

use parking_lot::{Condvar, Mutex, };

use serde::{Deserialize, Serialize, };

use crate::cmd::{Command, CommandBuffer, };
use crate::device::Device;
use crate::engine::{EngineDesc, EngineId, EngineKind, };
use crate::error::Error;
use crate::mem::{Allocation, DeviceAddress, DeviceMemory, DeviceView, };

const HEAP_BASE: u64 = 0x10_0000;
const DEFAULT_WORDS: usize = 1 << 16;
const PARK_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MemoryModel {
  Coherent,
  Downloaded,
}

#[derive(Default)]
struct SimHeap {
  next: usize,
  /// (first word, words)
  free: Vec<(usize, usize)>,
}

pub struct SimMemory {
  model: MemoryModel,
  device: Box<[AtomicU64]>,
  host: Box<[AtomicU64]>,
  heap: Mutex<SimHeap>,
  downloads: AtomicUsize,
}

impl SimMemory {
  pub fn new(model: MemoryModel, words: usize) -> Self {
    let words_of = || {
      (0..words)
        .map(|_| AtomicU64::new(0) )
        .collect::<Vec<_>>()
        .into_boxed_slice()
    };
    SimMemory {
      model,
      device: words_of(),
      host: words_of(),
      heap: Mutex::new(SimHeap::default()),
      downloads: AtomicUsize::new(0),
    }
  }

  pub fn model(&self) -> MemoryModel { self.model }
  /// How many times the host has downloaded anything.
  pub fn downloads(&self) -> usize { self.downloads.load(Ordering::Acquire) }

  fn word_index(&self, addr: DeviceAddress) -> Result<usize, Error> {
    if !addr.is_word_aligned() || addr.0 < HEAP_BASE {
      return Err(Error::InvalidAddress(addr));
    }
    let idx = ((addr.0 - HEAP_BASE) / DeviceAddress::WORD_BYTES) as usize;
    if idx >= self.device.len() {
      return Err(Error::InvalidAddress(addr));
    }
    Ok(idx)
  }
  fn address_of(idx: usize) -> DeviceAddress {
    DeviceAddress(HEAP_BASE).offset_words(idx)
  }

  fn device_load(&self, addr: DeviceAddress) -> Result<u64, Error> {
    let idx = self.word_index(addr)?;
    Ok(self.device[idx].load(Ordering::Acquire))
  }
  fn device_store(&self, addr: DeviceAddress, value: u64) -> Result<(), Error> {
    let idx = self.word_index(addr)?;
    self.device[idx].store(value, Ordering::Release);
    Ok(())
  }
}

impl DeviceMemory for SimMemory {
  fn allocate(&self, words: usize) -> Result<Allocation, Error> {
    let words = words.max(1);
    let mut heap = self.heap.lock();
    let reuse = heap.free.iter()
      .position(|&(_, len)| len >= words );
    let start = if let Some(pos) = reuse {
      let (start, len) = heap.free.swap_remove(pos);
      if len > words {
        heap.free.push((start + words, len - words));
      }
      start
    } else {
      if heap.next + words > self.device.len() {
        return Err(Error::OutOfDeviceMemory { words, });
      }
      let start = heap.next;
      heap.next += words;
      start
    };

    for idx in start..start + words {
      self.device[idx].store(0, Ordering::Relaxed);
      self.host[idx].store(0, Ordering::Relaxed);
    }
    Ok(Allocation::new(Self::address_of(start), words))
  }
  fn free(&self, alloc: Allocation) {
    let start = match self.word_index(alloc.base()) {
      Ok(start) => start,
      Err(err) => {
        log::warn!("ignoring free of foreign allocation: {}", err);
        return;
      },
    };
    self.heap.lock().free.push((start, alloc.words()));
  }

  fn read(&self, addr: DeviceAddress) -> Result<u64, Error> {
    let idx = self.word_index(addr)?;
    let v = match self.model {
      MemoryModel::Coherent => self.device[idx].load(Ordering::Acquire),
      MemoryModel::Downloaded => self.host[idx].load(Ordering::Acquire),
    };
    Ok(v)
  }
  fn write(&self, addr: DeviceAddress, value: u64) -> Result<(), Error> {
    let idx = self.word_index(addr)?;
    self.host[idx].store(value, Ordering::Release);
    self.device[idx].store(value, Ordering::Release);
    Ok(())
  }
  fn download(&self, range: &Allocation) -> Result<(), Error> {
    let start = self.word_index(range.base())?;
    if start + range.words() > self.device.len() {
      return Err(Error::InvalidAddress(range.base().offset_words(range.words())));
    }
    for idx in start..start + range.words() {
      let v = self.device[idx].load(Ordering::Acquire);
      self.host[idx].store(v, Ordering::Release);
    }
    self.downloads.fetch_add(1, Ordering::AcqRel);
    Ok(())
  }

  fn is_coherent(&self) -> bool {
    self.model == MemoryModel::Coherent
  }
}

struct EngineView<'a>(&'a SimMemory);
impl<'a> DeviceView for EngineView<'a> {
  fn load(&self, addr: DeviceAddress) -> Result<u64, Error> {
    self.0.device_load(addr)
  }
  fn store(&self, addr: DeviceAddress, value: u64) -> Result<(), Error> {
    self.0.device_store(addr, value)
  }
}

#[derive(Default)]
struct SimQueue {
  pending: VecDeque<CommandBuffer>,
  log: Vec<CommandBuffer>,
  busy: bool,
}

struct SimEngine {
  desc: EngineDesc,
  queue: Mutex<SimQueue>,
  cv: Condvar,
  stalled: AtomicBool,
  shutdown: AtomicBool,
}

impl SimEngine {
  fn next(&self) -> Option<CommandBuffer> {
    let mut queue = self.queue.lock();
    queue.busy = false;
    loop {
      if self.shutdown.load(Ordering::Acquire) {
        return None;
      }
      if !self.stalled.load(Ordering::Acquire) {
        if let Some(cmds) = queue.pending.pop_front() {
          queue.busy = true;
          return Some(cmds);
        }
      }
      self.cv.wait_for(&mut queue, PARK_INTERVAL);
    }
  }

  /// Blocks while the engine is stalled. Returns false once shut down.
  fn hold(&self) -> bool {
    if self.stalled.load(Ordering::Acquire) {
      let mut queue = self.queue.lock();
      while self.stalled.load(Ordering::Acquire) &&
        !self.shutdown.load(Ordering::Acquire)
      {
        self.cv.wait_for(&mut queue, PARK_INTERVAL);
      }
    }
    !self.shutdown.load(Ordering::Acquire)
  }

  fn execute(&self, view: &EngineView, cmd: &Command) -> bool {
    if !self.hold() { return false; }

    let result = match cmd {
      &Command::ProgramState { category, value, } => {
        log::trace!("{}: program {:?} = {:#x}", self.desc.name, category, value);
        Ok(())
      },
      &Command::SemaphoreWait { address, value, compare, } => {
        let backoff = Backoff::new();
        loop {
          match view.load(address) {
            Ok(current) if compare.satisfied(current, value) => break Ok(()),
            Ok(_) => { },
            Err(err) => break Err(err),
          }
          if !self.hold() { return false; }
          if backoff.is_completed() {
            thread::sleep(Duration::from_micros(20));
          } else {
            backoff.snooze();
          }
        }
      },
      &Command::StoreData { address, value, } => view.store(address, value),
      &Command::CacheFlush { post_sync, } => match post_sync {
        Some((address, value)) => view.store(address, value),
        None => Ok(()),
      },
      Command::Dispatch(kernel) => {
        log::trace!("{}: dispatch {}", self.desc.name, kernel.label());
        kernel.execute(view)
      },
      &Command::Translate { resource, direction, } => {
        log::trace!("{}: translate resource {} {:?}", self.desc.name, resource, direction);
        Ok(())
      },
      &Command::SignalCompletion { address, value, partitions, } => {
        (0..partitions as usize)
          .map(|p| view.store(address.offset_words(p), value) )
          .collect()
      },
    };
    if let Err(err) = result {
      log::error!("{}: command {:?} failed: {}", self.desc.name, cmd, err);
    }
    true
  }

  fn run(&self, memory: &SimMemory) {
    let view = EngineView(memory);
    while let Some(cmds) = self.next() {
      for cmd in cmds.iter() {
        if !self.execute(&view, cmd) {
          return;
        }
      }
    }
    log::debug!("{}: worker exiting", self.desc.name);
  }
}

pub struct SimDevice {
  engines: Vec<EngineDesc>,
  memory: Arc<SimMemory>,
  queues: Vec<Arc<SimEngine>>,
  workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SimDevice {
  pub fn new(kinds: &[EngineKind], model: MemoryModel) -> io::Result<Arc<Self>> {
    Self::with_capacity(kinds, model, DEFAULT_WORDS)
  }
  pub fn with_capacity(kinds: &[EngineKind], model: MemoryModel, words: usize)
    -> io::Result<Arc<Self>>
  {
    let memory = Arc::new(SimMemory::new(model, words));
    let engines: Vec<_> = kinds.iter()
      .enumerate()
      .map(|(idx, &kind)| EngineDesc::new(EngineId(idx as u32), kind) )
      .collect();

    let mut queues = Vec::with_capacity(engines.len());
    let mut workers = Vec::with_capacity(engines.len());
    for desc in engines.iter() {
      let engine = Arc::new(SimEngine {
        desc: desc.clone(),
        queue: Mutex::new(SimQueue::default()),
        cv: Condvar::new(),
        stalled: AtomicBool::new(false),
        shutdown: AtomicBool::new(false),
      });
      let worker = {
        let engine = engine.clone();
        let memory = memory.clone();
        thread::Builder::new()
          .name(format!("sim-{}", desc.name))
          .spawn(move || engine.run(&memory) )?
      };
      queues.push(engine);
      workers.push(worker);
    }

    log::debug!("simulated device: {} engines, {:?} memory", engines.len(), model);
    Ok(Arc::new(SimDevice {
      engines,
      memory,
      queues,
      workers: Mutex::new(workers),
    }))
  }

  pub fn sim_memory(&self) -> &Arc<SimMemory> { &self.memory }

  fn queue(&self, engine: EngineId) -> Result<&Arc<SimEngine>, Error> {
    self.queues.get(engine.0 as usize)
      .ok_or(Error::UnknownEngine(engine))
  }

  /// Stop `engine` before its next command, as if it hung. Unknown engines
  /// are ignored.
  pub fn stall(&self, engine: EngineId) {
    if let Ok(q) = self.queue(engine) {
      let _queue = q.queue.lock();
      q.stalled.store(true, Ordering::Release);
    }
  }
  pub fn resume(&self, engine: EngineId) {
    if let Ok(q) = self.queue(engine) {
      let _queue = q.queue.lock();
      q.stalled.store(false, Ordering::Release);
      q.cv.notify_all();
    }
  }
  /// Every command buffer submitted to `engine`, in submission order.
  pub fn submitted(&self, engine: EngineId) -> Vec<CommandBuffer> {
    self.queue(engine)
      .map(|q| q.queue.lock().log.clone() )
      .unwrap_or_default()
  }
  pub fn is_idle(&self, engine: EngineId) -> bool {
    self.queue(engine)
      .map(|q| {
        let queue = q.queue.lock();
        !queue.busy && queue.pending.is_empty()
      })
      .unwrap_or(true)
  }
}

impl Device for SimDevice {
  fn engines(&self) -> &[EngineDesc] { &self.engines }
  fn memory(&self) -> &dyn DeviceMemory { &*self.memory }
  fn submit(&self, engine: EngineId, cmds: CommandBuffer) -> Result<(), Error> {
    let q = self.queue(engine)?;
    if q.shutdown.load(Ordering::Acquire) {
      return Err(Error::EngineStopped(engine));
    }
    let mut queue = q.queue.lock();
    queue.log.push(cmds.clone());
    queue.pending.push_back(cmds);
    q.cv.notify_all();
    Ok(())
  }
}

impl Drop for SimDevice {
  fn drop(&mut self) {
    for q in self.queues.iter() {
      let _queue = q.queue.lock();
      q.shutdown.store(true, Ordering::Release);
      q.cv.notify_all();
    }
    for worker in self.workers.lock().drain(..) {
      if worker.join().is_err() {
        log::error!("simulated engine worker panicked");
      }
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  use std::time::Instant;

  use crate::cmd::{CompareOp, DeviceKernel, };

  #[derive(Debug)]
  struct Store(DeviceAddress, u64);
  impl DeviceKernel for Store {
    fn label(&self) -> &str { "store" }
    fn execute(&self, view: &dyn DeviceView) -> Result<(), Error> {
      view.store(self.0, self.1)
    }
  }

  fn spin_until<F>(mut f: F) -> bool
    where F: FnMut() -> bool,
  {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
      if f() { return true; }
      thread::sleep(Duration::from_millis(1));
    }
    false
  }

  #[test]
  fn allocations_reuse_freed_words() {
    let mem = SimMemory::new(MemoryModel::Coherent, 16);
    let a = mem.allocate(4).unwrap();
    let b = mem.allocate(4).unwrap();
    assert_ne!(a.base(), b.base());
    mem.write(a.base(), 7).unwrap();
    mem.free(a);
    let c = mem.allocate(2).unwrap();
    assert_eq!(c.base(), a.base());
    assert_eq!(mem.read(c.base()).unwrap(), 0, "allocations start zeroed");
    assert!(mem.allocate(32).is_err());
  }

  #[test]
  fn bad_addresses() {
    let mem = SimMemory::new(MemoryModel::Coherent, 4);
    assert!(mem.read(DeviceAddress(0)).is_err());
    assert!(mem.read(DeviceAddress(HEAP_BASE + 3)).is_err());
    assert!(mem.read(DeviceAddress(HEAP_BASE).offset_words(4)).is_err());
  }

  #[test]
  fn downloaded_memory_needs_download() {
    let mem = SimMemory::new(MemoryModel::Downloaded, 4);
    let a = mem.allocate(1).unwrap();
    mem.device_store(a.base(), 9).unwrap();
    assert_eq!(mem.read(a.base()).unwrap(), 0);
    mem.download(&a).unwrap();
    assert_eq!(mem.read(a.base()).unwrap(), 9);
    assert_eq!(mem.downloads(), 1);
  }

  #[test]
  fn semaphore_orders_engines() {
    let dev = SimDevice::new(&[EngineKind::Compute, EngineKind::Copy],
                             MemoryModel::Coherent)
      .unwrap();
    let mem = dev.memory();
    let flag = mem.allocate(1).unwrap().base();
    let out = mem.allocate(1).unwrap().base();

    let mut waiter = CommandBuffer::new();
    waiter.push(Command::SemaphoreWait {
      address: flag,
      value: 2,
      compare: CompareOp::GreaterOrEqual,
    });
    waiter.push(Command::Dispatch(Arc::new(Store(out, 42))));
    dev.submit(EngineId(1), waiter).unwrap();

    thread::sleep(Duration::from_millis(20));
    assert_eq!(mem.read(out).unwrap(), 0);

    let mut signaler = CommandBuffer::new();
    signaler.push(Command::SignalCompletion {
      address: flag,
      value: 2,
      partitions: 1,
    });
    dev.submit(EngineId(0), signaler).unwrap();

    assert!(spin_until(|| mem.read(out).unwrap() == 42 ));
    assert_eq!(dev.submitted(EngineId(1)).len(), 1);
  }

  #[test]
  fn stalled_engine_makes_no_progress() {
    let dev = SimDevice::new(&[EngineKind::Compute], MemoryModel::Coherent)
      .unwrap();
    let out = dev.memory().allocate(2).unwrap().base();
    dev.stall(EngineId(0));

    let mut cmds = CommandBuffer::new();
    cmds.push(Command::SignalCompletion {
      address: out,
      value: 1,
      partitions: 2,
    });
    dev.submit(EngineId(0), cmds).unwrap();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(dev.memory().read(out).unwrap(), 0);
    assert!(!dev.is_idle(EngineId(0)));

    dev.resume(EngineId(0));
    assert!(spin_until(|| dev.memory().read(out.offset_words(1)).unwrap() == 1 ));
    assert!(spin_until(|| dev.is_idle(EngineId(0)) ));
  }

  #[test]
  fn unknown_engine() {
    let dev = SimDevice::new(&[EngineKind::Compute], MemoryModel::Coherent)
      .unwrap();
    let err = dev.submit(EngineId(3), CommandBuffer::new()).unwrap_err();
    assert_eq!(err, Error::UnknownEngine(EngineId(3)));
  }
}
