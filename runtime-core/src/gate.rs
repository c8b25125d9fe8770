//! Host-controlled gates. Operations enqueued behind a pending gate are
//! deferred; signaling the gate flushes them in the order they were
//! enqueued, aborting it aborts them along with everything that depends on
//! them.

use std::collections::HashMap;
use std::fmt;

use crate::error::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GateId(pub u64);
impl fmt::Display for GateId {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "gate{}", self.0)
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GateState {
  Pending,
  Signaled,
  Aborted,
}

/// Combined state of a set of gates.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Blocked {
  Ready,
  Pending,
  Aborted,
}

#[derive(Default)]
pub(crate) struct Gates {
  states: HashMap<GateId, GateState>,
  next: u64,
}

impl Gates {
  pub fn create(&mut self) -> GateId {
    self.next += 1;
    let id = GateId(self.next);
    self.states.insert(id, GateState::Pending);
    id
  }

  pub fn state(&self, id: GateId) -> Result<GateState, Error> {
    self.states.get(&id)
      .cloned()
      .ok_or(Error::UnknownGate(id))
  }

  pub fn resolve(&mut self, id: GateId, to: GateState) -> Result<(), Error> {
    let state = self.states.get_mut(&id)
      .ok_or(Error::UnknownGate(id))?;
    if *state != GateState::Pending {
      return Err(Error::GateAlreadyResolved(id));
    }
    *state = to;
    Ok(())
  }

  /// Aborted wins over pending.
  pub fn blocked(&self, gates: &[GateId]) -> Blocked {
    let mut blocked = Blocked::Ready;
    for gate in gates.iter() {
      match self.states.get(gate) {
        Some(GateState::Aborted) => return Blocked::Aborted,
        Some(GateState::Pending) => blocked = Blocked::Pending,
        Some(GateState::Signaled) => { },
        None => {
          log::warn!("{} referenced but never created", gate);
          return Blocked::Aborted;
        },
      }
    }
    blocked
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn resolve_once() {
    let mut gates = Gates::default();
    let g = gates.create();
    assert_eq!(gates.state(g).unwrap(), GateState::Pending);
    gates.resolve(g, GateState::Signaled).unwrap();
    assert_eq!(gates.resolve(g, GateState::Aborted), Err(Error::GateAlreadyResolved(g)));
    assert_eq!(gates.resolve(GateId(99), GateState::Signaled),
               Err(Error::UnknownGate(GateId(99))));
  }

  #[test]
  fn combined_state() {
    let mut gates = Gates::default();
    let a = gates.create();
    let b = gates.create();
    assert_eq!(gates.blocked(&[]), Blocked::Ready);
    assert_eq!(gates.blocked(&[a, b]), Blocked::Pending);
    gates.resolve(a, GateState::Signaled).unwrap();
    assert_eq!(gates.blocked(&[a]), Blocked::Ready);
    gates.resolve(b, GateState::Aborted).unwrap();
    assert_eq!(gates.blocked(&[a, b]), Blocked::Aborted);
  }
}
