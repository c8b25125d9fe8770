use std::fmt;

use crate::error::Error;

/// A device virtual address. All memory the runtime touches through these
/// traits is addressed in 64-bit words.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeviceAddress(pub u64);

impl DeviceAddress {
  pub const WORD_BYTES: u64 = 8;

  #[inline(always)]
  pub fn offset_words(self, words: usize) -> Self {
    DeviceAddress(self.0 + (words as u64) * Self::WORD_BYTES)
  }
  #[inline(always)]
  pub fn is_word_aligned(self) -> bool {
    self.0 % Self::WORD_BYTES == 0
  }
}
impl fmt::Display for DeviceAddress {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{:#x}", self.0)
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Allocation {
  base: DeviceAddress,
  words: usize,
}
impl Allocation {
  pub fn new(base: DeviceAddress, words: usize) -> Self {
    Allocation { base, words, }
  }
  #[inline(always)]
  pub fn base(&self) -> DeviceAddress { self.base }
  #[inline(always)]
  pub fn words(&self) -> usize { self.words }
  pub fn word(&self, idx: usize) -> Option<DeviceAddress> {
    if idx < self.words {
      Some(self.base.offset_words(idx))
    } else {
      None
    }
  }
  /// A one word sub-allocation. Used to download a single word.
  pub fn single(addr: DeviceAddress) -> Self {
    Allocation::new(addr, 1)
  }
  pub fn contains(&self, addr: DeviceAddress) -> bool {
    addr >= self.base && addr < self.base.offset_words(self.words)
  }
}

/// Host access to device memory.
///
/// Host writes are visible to the device immediately. Device writes are
/// visible to the host immediately only when `is_coherent()`; otherwise the
/// host sees them after `download`ing the containing range.
pub trait DeviceMemory: Send + Sync {
  fn allocate(&self, words: usize) -> Result<Allocation, Error>;
  fn free(&self, alloc: Allocation);

  fn read(&self, addr: DeviceAddress) -> Result<u64, Error>;
  fn write(&self, addr: DeviceAddress, value: u64) -> Result<(), Error>;
  fn download(&self, range: &Allocation) -> Result<(), Error>;

  fn is_coherent(&self) -> bool;
}

/// Device-side access, given to kernels while an engine executes them.
pub trait DeviceView {
  fn load(&self, addr: DeviceAddress) -> Result<u64, Error>;
  fn store(&self, addr: DeviceAddress, value: u64) -> Result<(), Error>;
}
