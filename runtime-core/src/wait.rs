//! Blocking waits.
//!
//! All waits go through `WaitCoordinator::poll_until`: a probe is polled
//! until it's ready, the deadline passes, or the wait is cancelled. Between
//! polls the coordinator spins briefly and then sleeps one poll interval on
//! its `Clock`, so tests can drive time by hand.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering, };
use std::task::Poll;
use std::thread;
use std::time::{Duration, Instant, };

use crossbeam_utils::Backoff;

use crate::error::WaitError;
use crate::submission::{CompletionStamp, SubmissionHandle, };
use crate::token::TokenId;

pub trait Clock: Send + Sync {
  fn now(&self) -> Instant;
  fn pause(&self, d: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;
impl Clock for SystemClock {
  fn now(&self) -> Instant { Instant::now() }
  fn pause(&self, d: Duration) { thread::sleep(d) }
}

#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);
impl CancellationToken {
  pub fn new() -> Self { Self::default() }
  pub fn cancel(&self) {
    self.0.store(true, Ordering::Release);
  }
  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::Acquire)
  }
}

/// What a host thread can wait on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitTarget {
  Stamp(CompletionStamp),
  Token(TokenId),
  Submission(SubmissionHandle),
}

/// Anything which completes on the device.
pub trait Completion {
  fn completion(&self) -> WaitTarget;
}
impl Completion for WaitTarget {
  fn completion(&self) -> WaitTarget { *self }
}
impl Completion for CompletionStamp {
  fn completion(&self) -> WaitTarget { WaitTarget::Stamp(*self) }
}
impl Completion for TokenId {
  fn completion(&self) -> WaitTarget { WaitTarget::Token(*self) }
}
impl Completion for SubmissionHandle {
  fn completion(&self) -> WaitTarget { WaitTarget::Submission(*self) }
}
impl<'a, T> Completion for &'a T
  where T: Completion + ?Sized,
{
  fn completion(&self) -> WaitTarget { (**self).completion() }
}

pub struct WaitCoordinator {
  clock: Arc<dyn Clock>,
  poll_interval: Duration,
}

impl WaitCoordinator {
  pub fn new(clock: Arc<dyn Clock>, poll_interval: Duration) -> Self {
    WaitCoordinator {
      clock,
      poll_interval,
    }
  }

  pub fn poll_interval(&self) -> Duration { self.poll_interval }
  pub fn clock(&self) -> &dyn Clock { &*self.clock }

  /// Poll `probe` until it's ready. The probe always runs at least once, so
  /// an already complete target succeeds even with a zero timeout.
  pub fn poll_until<F, T, E>(&self, timeout: Duration, cancel: Option<&CancellationToken>,
                             mut probe: F)
    -> Result<T, E>
    where F: FnMut() -> Poll<Result<T, E>>,
          E: From<WaitError>,
  {
    let start = self.clock.now();
    let backoff = Backoff::new();
    loop {
      if let Poll::Ready(r) = probe() {
        return r;
      }
      if let Some(cancel) = cancel {
        if cancel.is_cancelled() {
          return Err(WaitError::Cancelled.into());
        }
      }
      if self.clock.now().saturating_duration_since(start) >= timeout {
        return Err(WaitError::Timeout.into());
      }

      if backoff.is_completed() {
        self.clock.pause(self.poll_interval);
      } else {
        backoff.snooze();
      }
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::utils::test::*;

  fn coordinator() -> WaitCoordinator {
    let clock = Arc::new(ManualClock::new());
    WaitCoordinator::new(clock, Duration::from_millis(1))
  }

  #[test]
  fn ready_immediately() {
    let w = coordinator();
    let r: Result<_, WaitError> = w.poll_until(Duration::from_secs(0), None, || {
      Poll::Ready(Ok(3))
    });
    assert_eq!(r, Ok(3));
  }

  #[test]
  fn times_out_on_the_clock() {
    let w = coordinator();
    let mut polls = 0;
    let r: Result<(), WaitError> = w.poll_until(Duration::from_millis(10), None, || {
      polls += 1;
      Poll::Pending
    });
    assert_eq!(r, Err(WaitError::Timeout));
    assert!(polls > 10);
  }

  #[test]
  fn probe_errors_pass_through() {
    let w = coordinator();
    let mut polls = 0;
    let r: Result<(), WaitError> = w.poll_until(Duration::from_secs(1), None, || {
      polls += 1;
      if polls == 3 {
        Poll::Ready(Err(WaitError::ExecutionAborted))
      } else {
        Poll::Pending
      }
    });
    assert_eq!(r, Err(WaitError::ExecutionAborted));
  }

  #[test]
  fn cancellation() {
    let w = coordinator();
    let cancel = CancellationToken::new();
    let mut polls = 0;
    let r: Result<(), WaitError> = w.poll_until(Duration::from_secs(1), Some(&cancel), || {
      polls += 1;
      if polls == 2 {
        cancel.cancel();
      }
      Poll::Pending
    });
    assert_eq!(r, Err(WaitError::Cancelled));
  }
}
