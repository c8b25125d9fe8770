use std::fmt;

use indexvec::Idx;

use serde::{Deserialize, Serialize, };

/// Index of an engine on its device. Engines are numbered densely from zero
/// in the order the device reports them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
pub struct EngineId(pub u32);

impl Idx for EngineId {
  #[inline(always)]
  fn new(v: usize) -> Self {
    EngineId(v as u32)
  }
  #[inline(always)]
  fn index(self) -> usize {
    self.0 as usize
  }
}
impl fmt::Display for EngineId {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "engine{}", self.0)
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
pub enum EngineKind {
  Compute,
  /// Copy/transfer engine. Has no programmable compute state.
  Copy,
}
impl EngineKind {
  #[inline(always)]
  pub fn has_state(&self) -> bool {
    match self {
      EngineKind::Compute => true,
      EngineKind::Copy => false,
    }
  }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct EngineDesc {
  pub id: EngineId,
  pub kind: EngineKind,
  pub name: String,
}
impl EngineDesc {
  pub fn new(id: EngineId, kind: EngineKind) -> Self {
    let name = match kind {
      EngineKind::Compute => format!("ccs{}", id.0),
      EngineKind::Copy => format!("bcs{}", id.0),
    };
    EngineDesc {
      id,
      kind,
      name,
    }
  }
}
