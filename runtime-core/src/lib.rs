//! Ordering and completion tracking for work submitted to the engines of a
//! multi-engine accelerator.
//!
//! Every submission gets a dependency token which the device writes once the
//! submission finishes. Before an operation is flushed to its engine the
//! runtime works out which earlier submissions it has to wait for (reads
//! after writes, writes after reads and writes, across engines), emits only
//! the engine state which changed since the engine was last programmed, and
//! stamps the submission with the engine's monotonic task counter. Host
//! threads block on stamps, tokens or submissions through a single polling
//! loop which notices hung engines and aborted work.

extern crate indexed_vec as indexvec;
extern crate tracing as log;

pub use device_rt;

pub mod aux_translation;
pub mod config;
pub mod context;
pub mod deps;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod gate;
pub mod hang;
pub mod host_fn;
pub mod pipeline;
pub mod state;
pub mod submission;
pub mod token;
pub mod wait;
mod utils;

pub use crate::config::RuntimeConfig;
pub use crate::context::RuntimeContext;
pub use crate::deps::{Access, Intent, ResourceId, };
pub use crate::error::{Error, WaitError, };
pub use crate::submission::{CompletionStamp, Operation, SubmissionHandle,
                            SubmissionStatus, Workload, };
pub use crate::token::TokenId;
pub use crate::wait::{Completion, WaitTarget, };
