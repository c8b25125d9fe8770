use std::sync::Arc;
use std::time::{Duration, Instant, };

use parking_lot::Mutex;

use device_rt::{DeviceAddress, DeviceKernel, DeviceView, EngineKind, };
use device_rt::error::Error as DeviceError;
use device_rt::sim::{MemoryModel, SimDevice, };

use crate::config::RuntimeConfig;
use crate::context::RuntimeContext;
use crate::wait::Clock;

lazy_static::lazy_static! {
  static ref CONFIG: RuntimeConfig = {
    let mut config = RuntimeConfig::default();
    config.poll_interval = Duration::from_micros(20);
    config.default_timeout = Duration::from_secs(10);
    config
  };
}

pub fn config() -> RuntimeConfig {
  CONFIG.clone()
}

pub fn sim(kinds: &[EngineKind]) -> Arc<SimDevice> {
  SimDevice::new(kinds, MemoryModel::Coherent)
    .expect("create sim device")
}

pub fn context(dev: &Arc<SimDevice>) -> RuntimeContext {
  context_with(dev, config())
}
pub fn context_with(dev: &Arc<SimDevice>, config: RuntimeConfig) -> RuntimeContext {
  RuntimeContext::new(dev.clone(), config)
    .expect("create runtime context")
}

/// Time only moves when paused.
pub struct ManualClock(Mutex<Instant>);
impl ManualClock {
  pub fn new() -> Self {
    ManualClock(Mutex::new(Instant::now()))
  }
}
impl Clock for ManualClock {
  fn now(&self) -> Instant { *self.0.lock() }
  fn pause(&self, d: Duration) {
    *self.0.lock() += d;
  }
}

/// Poll `f` for up to five seconds.
pub fn spin_until<F>(mut f: F) -> bool
  where F: FnMut() -> bool,
{
  let start = Instant::now();
  while start.elapsed() < Duration::from_secs(5) {
    if f() {
      return true;
    }
    std::thread::sleep(Duration::from_micros(100));
  }
  f()
}

#[derive(Debug)]
pub struct StoreKernel {
  pub address: DeviceAddress,
  pub value: u64,
}
impl DeviceKernel for StoreKernel {
  fn label(&self) -> &str { "store" }
  fn execute(&self, view: &dyn DeviceView) -> Result<(), DeviceError> {
    view.store(self.address, self.value)
  }
}

#[derive(Debug)]
pub struct CopyWordKernel {
  pub src: DeviceAddress,
  pub dst: DeviceAddress,
}
impl DeviceKernel for CopyWordKernel {
  fn label(&self) -> &str { "copy word" }
  fn execute(&self, view: &dyn DeviceView) -> Result<(), DeviceError> {
    let v = view.load(self.src)?;
    view.store(self.dst, v)
  }
}
