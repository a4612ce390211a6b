use crate::{entity::RecoverableFault, queue::QueueContents};
use super::{
  failure::{self, FixupAction},
  Backend, BackendCore, InstrumentLink,
};

/// Backend task for the sequenced instruments. The one variant that resolves
/// NeedNextTarget by copying the next scheduled target into the entry.
pub struct InstrumentTask {
  core: BackendCore,
}

impl InstrumentTask {
  pub fn new(link: Box<dyn InstrumentLink>) -> Self {
    InstrumentTask {
      core: BackendCore::new(link),
    }
  }
}

impl Backend for InstrumentTask {
  fn core(&self) -> &BackendCore {
    &self.core
  }

  fn core_mut(&mut self) -> &mut BackendCore {
    &mut self.core
  }

  fn add_failure_context(&mut self, q: &mut QueueContents) -> FixupAction {
    let Some(mut reason) = self.core_mut().take_failure() else {
      return FixupAction::Report;
    };
    let index = reason.index;
    let action = match reason.kind {
      RecoverableFault::MissingTarget => {
        failure::missing_target_context(&mut reason, q, index);
        FixupAction::Report
      }
      RecoverableFault::NeedNextTarget => failure::need_next_target_fixup(&mut reason, q, index),
    };
    self.core_mut().store_failure(reason);
    action
  }
}
