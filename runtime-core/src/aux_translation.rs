//! Aux translation: buffers kept in a compressed form are translated to the
//! uncompressed form before a workload which can't consume compression, and
//! back afterwards.
//!
//! The plan decides where translations run and whether a cache flush must
//! separate the workload from the recompression. The context then enqueues
//! the pieces as ordinary operations, each writing the translated buffers,
//! so the dependency resolver produces the chain:
//!
//! ```text
//! decompress (Td) <- workload (Tw) [<- cache flush (Tf)] <- recompress
//! ```
//!
//! When everything runs on one engine the resolver emits no waits at all.

use smallvec::SmallVec;

use device_rt::{EngineId, EngineKind, TranslationDirection, };

use crate::config::AuxTranslationMode;
use crate::deps::ResourceId;
use crate::submission::{SubmissionHandle, Workload, };
use crate::wait::{Completion, WaitTarget, };

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct AuxTranslationRequest {
  pub buffer: ResourceId,
  pub direction: TranslationDirection,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuxPlan {
  pub translation_engine: EngineId,
  /// Interpose a cache flush on the workload's engine before recompressing.
  pub cache_flush: bool,
  pub decompress: SmallVec<[AuxTranslationRequest; 4]>,
  pub recompress: SmallVec<[AuxTranslationRequest; 4]>,
}

impl AuxPlan {
  /// `None` when there's nothing to translate.
  pub fn new(mode: AuxTranslationMode, workload_engine: EngineId,
             workload_kind: EngineKind, copy_engine: Option<EngineId>,
             coherent_caches: bool, buffers: &[ResourceId])
    -> Option<Self>
  {
    if buffers.is_empty() {
      return None;
    }
    let translation_engine = match (mode, copy_engine) {
      (AuxTranslationMode::None, _) => return None,
      (AuxTranslationMode::Blit, Some(copy)) => copy,
      (AuxTranslationMode::Blit, None) => {
        log::debug!("no copy engine, translating with the builtin kernel");
        workload_engine
      },
      (AuxTranslationMode::Builtin, _) => workload_engine,
    };
    let cache_flush = translation_engine != workload_engine &&
      workload_kind == EngineKind::Compute && !coherent_caches;

    let requests = |direction| -> SmallVec<[AuxTranslationRequest; 4]> {
      buffers.iter()
        .map(|&buffer| AuxTranslationRequest { buffer, direction, } )
        .collect()
    };
    Some(AuxPlan {
      translation_engine,
      cache_flush,
      decompress: requests(TranslationDirection::ToUncompressed),
      recompress: requests(TranslationDirection::ToCompressed),
    })
  }

  pub fn buffers(&self) -> impl Iterator<Item = ResourceId> + '_ {
    self.decompress.iter().map(|r| r.buffer )
  }
}

pub fn translation_workload(requests: &[AuxTranslationRequest]) -> Workload {
  let direction = requests.first()
    .map(|r| r.direction )
    .unwrap_or(TranslationDirection::ToUncompressed);
  Workload::Translate {
    resources: requests.iter().map(|r| r.buffer ).collect(),
    direction,
  }
}

/// The submissions enqueued around one workload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AuxChain {
  pub decompress: Option<SubmissionHandle>,
  pub workload: SubmissionHandle,
  pub cache_flush: Option<SubmissionHandle>,
  pub recompress: Option<SubmissionHandle>,
}

impl Completion for AuxChain {
  /// The chain is done once its last submission is.
  fn completion(&self) -> WaitTarget {
    WaitTarget::Submission(self.recompress.unwrap_or(self.workload))
  }
}

#[cfg(test)]
mod test {
  use super::*;

  const COMPUTE: EngineId = EngineId(0);
  const COPY: EngineId = EngineId(1);

  #[test]
  fn blit_uses_the_copy_engine() {
    let plan = AuxPlan::new(AuxTranslationMode::Blit, COMPUTE, EngineKind::Compute,
                            Some(COPY), false, &[ResourceId(1), ResourceId(2)])
      .unwrap();
    assert_eq!(plan.translation_engine, COPY);
    assert!(plan.cache_flush);
    assert_eq!(plan.decompress.len(), 2);
    assert!(plan.recompress.iter().all(|r| r.direction == TranslationDirection::ToCompressed ));
  }

  #[test]
  fn blit_falls_back_to_builtin() {
    let plan = AuxPlan::new(AuxTranslationMode::Blit, COMPUTE, EngineKind::Compute,
                            None, false, &[ResourceId(1)])
      .unwrap();
    assert_eq!(plan.translation_engine, COMPUTE);
    assert!(!plan.cache_flush);
  }

  #[test]
  fn coherent_caches_need_no_flush() {
    let plan = AuxPlan::new(AuxTranslationMode::Blit, COMPUTE, EngineKind::Compute,
                            Some(COPY), true, &[ResourceId(1)])
      .unwrap();
    assert!(!plan.cache_flush);
  }

  #[test]
  fn nothing_to_do() {
    assert!(AuxPlan::new(AuxTranslationMode::None, COMPUTE, EngineKind::Compute,
                         Some(COPY), false, &[ResourceId(1)]).is_none());
    assert!(AuxPlan::new(AuxTranslationMode::Blit, COMPUTE, EngineKind::Compute,
                         Some(COPY), false, &[]).is_none());
  }

  #[test]
  fn workload_of_requests() {
    let plan = AuxPlan::new(AuxTranslationMode::Builtin, COMPUTE, EngineKind::Compute,
                            Some(COPY), false, &[ResourceId(4)])
      .unwrap();
    match translation_workload(&plan.recompress) {
      Workload::Translate { resources, direction, } => {
        assert_eq!(&resources[..], &[ResourceId(4)]);
        assert_eq!(direction, TranslationDirection::ToCompressed);
      },
      w => panic!("unexpected {:?}", w),
    }
  }
}
