#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::error::QueueResult;

/// The project database the accept/reject lifecycle reports to.
///
/// Implementations must bound their wait: the database is allowed to hang,
/// the event loop is not. A timeout comes back as an error; callers log it
/// and leave the pending record in place rather than retrying automatically.
pub trait ProjectDb: Send {
  /// Mark an MSB done after the operator accepted it.
  fn msb_done(
    &mut self,
    project: &str,
    msb_id: &str,
    user: Option<&str>,
    reason: Option<&str>,
  ) -> QueueResult<()>;

  /// Mark an MSB rejected ("observed but not good").
  fn msb_reject(
    &mut self,
    project: &str,
    msb_id: &str,
    user: Option<&str>,
    reason: Option<&str>,
  ) -> QueueResult<()>;

  /// Record a mid-MSB suspension at the given observation label.
  fn msb_suspend(&mut self, project: &str, msb_id: &str, obs_label: Option<&str>)
    -> QueueResult<()>;
}

/// Database stand-in for dry runs and engineering time: every call is logged
/// and succeeds.
#[derive(Debug, Default)]
pub struct SimDb;

impl ProjectDb for SimDb {
  fn msb_done(
    &mut self,
    project: &str,
    msb_id: &str,
    user: Option<&str>,
    _reason: Option<&str>,
  ) -> QueueResult<()> {
    info!(
      "simdb: done {project}/{msb_id} (user {})",
      user.unwrap_or("-")
    );
    Ok(())
  }

  fn msb_reject(
    &mut self,
    project: &str,
    msb_id: &str,
    user: Option<&str>,
    reason: Option<&str>,
  ) -> QueueResult<()> {
    info!(
      "simdb: reject {project}/{msb_id} (user {}, reason {})",
      user.unwrap_or("-"),
      reason.unwrap_or("-")
    );
    Ok(())
  }

  fn msb_suspend(
    &mut self,
    project: &str,
    msb_id: &str,
    obs_label: Option<&str>,
  ) -> QueueResult<()> {
    info!(
      "simdb: suspend {project}/{msb_id} at {}",
      obs_label.unwrap_or("-")
    );
    Ok(())
  }
}
