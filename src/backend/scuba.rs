use crate::{entity::RecoverableFault, queue::QueueContents};
use super::{
  failure::{self, FixupAction},
  Backend, BackendCore, InstrumentLink,
};

/// Backend task for the SCUBA mapping instrument. Carries the setup rule:
/// a setup observation's slew-track allowance is stretched to cover the block
/// of entries whose source it acquires.
pub struct ScubaTask {
  core: BackendCore,
}

impl ScubaTask {
  pub fn new(link: Box<dyn InstrumentLink>) -> Self {
    ScubaTask {
      core: BackendCore::new(link),
    }
  }
}

impl Backend for ScubaTask {
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
    if reason.kind == RecoverableFault::MissingTarget {
      failure::missing_target_context(&mut reason, q, index);
      failure::extend_setup_slew(&reason, q, index);
    }
    // NeedNextTarget is the instrument task's trick; here it is only
    // reported.
    self.core_mut().store_failure(reason);
    FixupAction::Report
  }
}
