//! Host functions: CPU callbacks run at a point in an engine's command
//! stream.
//!
//! The engine stores the function's id into one slot per partition and then
//! stalls until every slot reads `HOST_FUNCTION_COMPLETED` again. A host
//! worker polls the slots, runs the callback once all partitions show the
//! id, and writes the completed marker back, releasing the engine.
//!
//! A streamer has at most one function outstanding. Scheduling another
//! blocks (or with `try_begin`, fails) until the previous one completed.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering, };
use std::thread::{self, JoinHandle, };
use std::time::{Duration, Instant, };

use parking_lot::{Condvar, Mutex, MutexGuard, };

use device_rt::{Allocation, Command, CommandBuffer, CompareOp, Device, DeviceMemory,
                EngineId, };

use crate::error::Error;
use crate::submission::SubmissionHandle;
use crate::wait::{Clock, Completion, WaitTarget, };

/// Slot value when no function is outstanding. Ids start at 1.
pub const HOST_FUNCTION_COMPLETED: u64 = 0;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HostFunctionId(pub u64);
impl fmt::Display for HostFunctionId {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "hostfn{}", self.0)
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostFunctionStatus {
  Pending,
  ReadyToExecute,
  Completed,
}

pub type HostCallback = Box<dyn FnOnce(u64) + Send + 'static>;

struct HostFunctionRecord {
  callback: Option<HostCallback>,
  user_data: u64,
  status: HostFunctionStatus,
}

#[derive(Default)]
struct StreamerState {
  last_id: u64,
  records: BTreeMap<HostFunctionId, HostFunctionRecord>,
}
impl StreamerState {
  fn outstanding(&self) -> Option<HostFunctionId> {
    self.records.keys().next().cloned()
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HostFunctionHandle {
  pub id: HostFunctionId,
  pub submission: SubmissionHandle,
}
impl Completion for HostFunctionHandle {
  fn completion(&self) -> WaitTarget {
    WaitTarget::Submission(self.submission)
  }
}

pub struct HostFunctionStreamer {
  engine: EngineId,
  slots: Allocation,
  partitions: u32,
  state: Mutex<StreamerState>,
  done: Condvar,
}

impl HostFunctionStreamer {
  pub fn new(engine: EngineId, memory: &dyn DeviceMemory, partitions: u32)
    -> Result<Self, Error>
  {
    let partitions = partitions.max(1);
    let slots = memory.allocate(partitions as usize)?;
    for p in 0..partitions as usize {
      memory.write(slots.base().offset_words(p), HOST_FUNCTION_COMPLETED)?;
    }
    Ok(HostFunctionStreamer {
      engine,
      slots,
      partitions,
      state: Mutex::new(StreamerState::default()),
      done: Condvar::new(),
    })
  }

  pub fn engine(&self) -> EngineId { self.engine }
  pub fn slots(&self) -> &Allocation { &self.slots }

  pub fn outstanding(&self) -> Option<HostFunctionId> {
    self.state.lock().outstanding()
  }
  pub fn status(&self, id: HostFunctionId) -> Option<HostFunctionStatus> {
    let state = self.state.lock();
    match state.records.get(&id) {
      Some(record) => Some(record.status),
      None if id.0 >= 1 && id.0 <= state.last_id => Some(HostFunctionStatus::Completed),
      None => None,
    }
  }

  /// Whether every partition's slot shows the completed marker.
  fn slots_clear(&self, memory: &dyn DeviceMemory) -> Result<bool, Error> {
    if !memory.is_coherent() {
      memory.download(&self.slots)?;
    }
    for p in 0..self.partitions as usize {
      if memory.read(self.slots.base().offset_words(p))? != HOST_FUNCTION_COMPLETED {
        return Ok(false);
      }
    }
    Ok(true)
  }

  fn issue(&self, state: &mut StreamerState, callback: HostCallback, user_data: u64)
    -> HostFunctionId
  {
    state.last_id += 1;
    let id = HostFunctionId(state.last_id);
    state.records.insert(id, HostFunctionRecord {
      callback: Some(callback),
      user_data,
      status: HostFunctionStatus::Pending,
    });
    log::debug!("{}: issued {}", self.engine, id);
    id
  }

  /// Issue the next id, first waiting up to `timeout` (as measured by
  /// `clock`) for the outstanding function to complete. `hung` is asked
  /// between waits; once it reports true this fails with `HangDetected`.
  pub(crate) fn begin<H>(&self, callback: HostCallback, user_data: u64,
                         memory: &dyn DeviceMemory, clock: &dyn Clock,
                         timeout: Duration, poll_interval: Duration, hung: H)
    -> Result<HostFunctionId, Error>
    where H: Fn() -> bool,
  {
    let start = clock.now();
    let mut state = self.state.lock();
    loop {
      if state.outstanding().is_none() && self.slots_clear(memory)? {
        break;
      }
      if hung() {
        return Err(Error::HangDetected(self.engine));
      }
      let elapsed = clock.now().saturating_duration_since(start);
      if elapsed >= timeout {
        return Err(Error::Timeout);
      }
      let slice = poll_interval.max(Duration::from_millis(1))
        .min(timeout - elapsed);
      MutexGuard::unlocked(&mut state, || clock.pause(slice) );
    }
    Ok(self.issue(&mut state, callback, user_data))
  }

  pub(crate) fn try_begin(&self, callback: HostCallback, user_data: u64,
                          memory: &dyn DeviceMemory)
    -> Result<HostFunctionId, Error>
  {
    let mut state = self.state.lock();
    if state.outstanding().is_some() || !self.slots_clear(memory)? {
      return Err(Error::HostFunctionBusy);
    }
    Ok(self.issue(&mut state, callback, user_data))
  }

  /// Forget `id` without running it. Used when its submission couldn't be
  /// enqueued.
  pub(crate) fn abandon(&self, id: HostFunctionId) {
    let mut state = self.state.lock();
    if state.records.remove(&id).is_some() {
      log::debug!("{}: abandoned {}", self.engine, id);
    }
    self.done.notify_all();
  }

  /// Commands which hand `id` to the host and stall the engine until the
  /// host is done with it.
  pub fn encode(&self, id: HostFunctionId) -> CommandBuffer {
    let mut cmds = CommandBuffer::new();
    for p in 0..self.partitions as usize {
      cmds.push(Command::StoreData {
        address: self.slots.base().offset_words(p),
        value: id.0,
      });
    }
    for p in 0..self.partitions as usize {
      cmds.push(Command::SemaphoreWait {
        address: self.slots.base().offset_words(p),
        value: HOST_FUNCTION_COMPLETED,
        compare: CompareOp::Equal,
      });
    }
    cmds
  }

  /// Take `id`'s callback, moving it to `ReadyToExecute`.
  pub fn prepare_for_execution(&self, id: HostFunctionId) -> Option<(HostCallback, u64)> {
    let mut state = self.state.lock();
    let record = match state.records.get_mut(&id) {
      Some(record) => record,
      None => {
        log::warn!("{}: {} appeared with no record", self.engine, id);
        return None;
      },
    };
    if record.status != HostFunctionStatus::Pending {
      return None;
    }
    record.status = HostFunctionStatus::ReadyToExecute;
    let user_data = record.user_data;
    record.callback.take()
      .map(|callback| (callback, user_data) )
  }

  /// Write the completed marker into every partition's slot, letting the
  /// engine continue, and retire `id`.
  pub fn signal_completion(&self, memory: &dyn DeviceMemory, id: HostFunctionId)
    -> Result<(), Error>
  {
    for p in 0..self.partitions as usize {
      memory.write(self.slots.base().offset_words(p), HOST_FUNCTION_COMPLETED)?;
    }
    let mut state = self.state.lock();
    if let Some(mut record) = state.records.remove(&id) {
      record.status = HostFunctionStatus::Completed;
    }
    log::debug!("{}: {} completed", self.engine, id);
    self.done.notify_all();
    Ok(())
  }

  /// Check the slots once, running the outstanding callback if every
  /// partition has reached it.
  pub fn poll(&self, memory: &dyn DeviceMemory) -> Result<Option<HostFunctionId>, Error> {
    if !memory.is_coherent() {
      memory.download(&self.slots)?;
    }
    let first = memory.read(self.slots.base())?;
    if first == HOST_FUNCTION_COMPLETED {
      return Ok(None);
    }
    for p in 1..self.partitions as usize {
      if memory.read(self.slots.base().offset_words(p))? != first {
        return Ok(None);
      }
    }

    let id = HostFunctionId(first);
    let (callback, user_data) = match self.prepare_for_execution(id) {
      Some(ready) => ready,
      None => return Ok(None),
    };
    log::trace!("{}: running {}", self.engine, id);
    callback(user_data);
    self.signal_completion(memory, id)?;
    Ok(Some(id))
  }

  /// Block until nothing is outstanding.
  pub fn wait_idle(&self, timeout: Duration) -> bool {
    let start = Instant::now();
    let mut state = self.state.lock();
    while state.outstanding().is_some() {
      let elapsed = start.elapsed();
      if elapsed >= timeout {
        return false;
      }
      self.done.wait_for(&mut state, timeout - elapsed);
    }
    true
  }

  pub(crate) fn release(&self, memory: &dyn DeviceMemory) {
    memory.free(self.slots);
  }
}

/// Polls a streamer on its own thread.
pub struct HostFunctionWorker {
  stop: Arc<AtomicBool>,
  thread: Option<JoinHandle<()>>,
}

impl HostFunctionWorker {
  pub fn spawn(streamer: Arc<HostFunctionStreamer>, device: Arc<dyn Device>,
               interval: Duration)
    -> io::Result<Self>
  {
    let stop = Arc::new(AtomicBool::new(false));
    let thread = {
      let stop = stop.clone();
      thread::Builder::new()
        .name(format!("accel-hostfn-{}", streamer.engine().0))
        .spawn(move || {
          while !stop.load(Ordering::Acquire) {
            match streamer.poll(device.memory()) {
              Ok(Some(_)) => continue,
              Ok(None) => { },
              Err(err) => {
                log::error!("{}: polling host functions: {}", streamer.engine(), err);
              },
            }
            thread::park_timeout(interval);
          }
        })?
    };
    Ok(HostFunctionWorker {
      stop,
      thread: Some(thread),
    })
  }
}
impl Drop for HostFunctionWorker {
  fn drop(&mut self) {
    self.stop.store(true, Ordering::Release);
    if let Some(thread) = self.thread.take() {
      thread.thread().unpark();
      if thread.join().is_err() {
        log::error!("host function callback panicked");
      }
    }
  }
}
