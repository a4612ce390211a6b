use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Telescope this queue serves. Decides which concrete entity kind the
/// manifest loader produces and prefixes MSB transaction ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Telescope {
  JCMT,
  UKIRT,
}

impl fmt::Display for Telescope {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Telescope::JCMT => write!(f, "JCMT"),
      Telescope::UKIRT => write!(f, "UKIRT"),
    }
  }
}

impl FromStr for Telescope {
  type Err = QueueError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "JCMT" => Ok(Telescope::JCMT),
      "UKIRT" => Ok(Telescope::UKIRT),
      other => Err(QueueError::BadArgument(format!(
        "unknown telescope \"{other}\" (expected JCMT or UKIRT)"
      ))),
    }
  }
}

/// Static configuration of one queue server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
  pub telescope: Telescope,
  /// Re-arm delay of the recurring poll.
  pub poll_interval: Duration,
  /// ADD_BACK / ADD_FRONT are refused while more than this many seconds
  /// remain on the queue, unless the highlight is already on the last entry.
  pub max_queue_time: u32,
  /// Suppress all project-database contact (dry runs, engineering).
  pub simdb: bool,
  /// Skip the accept-prompt lifecycle entirely; completed MSBs are cut.
  pub no_complete: bool,
  /// Where the pending-accepts table is persisted.
  pub pending_file: PathBuf,
  /// Per-cell width of the published Queue.Contents[] strings.
  pub contents_width: usize,
  /// Maximum number of published Queue.Contents[] slots.
  pub contents_slots: usize,
}

impl ServerConfig {
  pub fn new(telescope: Telescope) -> Self {
    ServerConfig {
      telescope,
      poll_interval: Duration::from_secs(1),
      max_queue_time: 40 * 60,
      simdb: false,
      no_complete: false,
      pending_file: default_pending_file(),
      contents_width: 110,
      contents_slots: 200,
    }
  }
}

/// Well-known location of the pending-accepts file, falling back to the OS
/// temp directory.
pub fn default_pending_file() -> PathBuf {
  env::temp_dir().join("obsqueue_pending_accepts.json")
}
