//! Hang detection. Something outside the runtime (a driver callback, or the
//! `Watchdog` below with a driver-provided probe) decides that an engine
//! has hung; waits consult the `HangMonitor` on every poll and fail fast.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering, };
use std::thread::{self, JoinHandle, };
use std::time::Duration;

use device_rt::EngineId;

#[derive(Clone)]
pub struct HangMonitor {
  flags: Arc<[AtomicBool]>,
}

impl HangMonitor {
  pub fn new(engines: usize) -> Self {
    let flags: Vec<_> = (0..engines)
      .map(|_| AtomicBool::new(false) )
      .collect();
    HangMonitor {
      flags: Arc::from(flags),
    }
  }

  pub fn engines(&self) -> impl Iterator<Item = EngineId> {
    (0..self.flags.len() as u32).map(EngineId)
  }

  /// Returns true if `engine` wasn't already marked.
  pub fn mark_hung(&self, engine: EngineId) -> bool {
    match self.flags.get(engine.0 as usize) {
      Some(flag) => {
        let first = !flag.swap(true, Ordering::AcqRel);
        if first {
          log::warn!("{} hung", engine);
        }
        first
      },
      None => {
        log::warn!("hang reported for unknown {}", engine);
        false
      },
    }
  }
  pub fn clear(&self, engine: EngineId) {
    if let Some(flag) = self.flags.get(engine.0 as usize) {
      flag.store(false, Ordering::Release);
    }
  }
  #[inline(always)]
  pub fn is_hung(&self, engine: EngineId) -> bool {
    self.flags.get(engine.0 as usize)
      .map(|flag| flag.load(Ordering::Acquire) )
      .unwrap_or(false)
  }
}

/// Periodically asks `probe` whether each engine is hung.
pub struct Watchdog {
  stop: Arc<AtomicBool>,
  thread: Option<JoinHandle<()>>,
}

impl Watchdog {
  pub fn spawn<P>(monitor: HangMonitor, interval: Duration, mut probe: P)
    -> io::Result<Self>
    where P: FnMut(EngineId) -> bool + Send + 'static,
  {
    let stop = Arc::new(AtomicBool::new(false));
    let thread = {
      let stop = stop.clone();
      thread::Builder::new()
        .name("accel-watchdog".into())
        .spawn(move || {
          while !stop.load(Ordering::Acquire) {
            for engine in monitor.engines() {
              if !monitor.is_hung(engine) && probe(engine) {
                monitor.mark_hung(engine);
              }
            }
            thread::park_timeout(interval);
          }
        })?
    };

    Ok(Watchdog {
      stop,
      thread: Some(thread),
    })
  }

  pub fn stop(self) { }
}
impl Drop for Watchdog {
  fn drop(&mut self) {
    self.stop.store(true, Ordering::Release);
    if let Some(thread) = self.thread.take() {
      thread.thread().unpark();
      if thread.join().is_err() {
        log::error!("watchdog probe panicked");
      }
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::utils::test::*;

  #[test]
  fn mark_and_clear() {
    let m = HangMonitor::new(2);
    assert!(!m.is_hung(EngineId(1)));
    assert!(m.mark_hung(EngineId(1)));
    assert!(!m.mark_hung(EngineId(1)));
    assert!(m.is_hung(EngineId(1)));
    assert!(!m.is_hung(EngineId(0)));
    m.clear(EngineId(1));
    assert!(!m.is_hung(EngineId(1)));
    assert!(!m.mark_hung(EngineId(5)));
  }

  #[test]
  fn watchdog_marks_probed_engines() {
    let m = HangMonitor::new(2);
    let dog = Watchdog::spawn(m.clone(), Duration::from_millis(1), |e| {
      e == EngineId(1)
    })
      .unwrap();
    assert!(spin_until(|| m.is_hung(EngineId(1)) ));
    dog.stop();
    assert!(!m.is_hung(EngineId(0)));
  }
}
