use thiserror::Error;

/// Errors surfaced by the queue server and its collaborators.
///
/// Command handlers report these back to the caller; the poll path logs them
/// and stops the queue instead of letting the event loop die.
#[derive(Debug, Error)]
pub enum QueueError {
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("XML parse error: {0}")]
  Xml(#[from] serde_xml_rs::Error),

  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("bad manifest: {0}")]
  Manifest(String),

  #[error("telescope mismatch: manifest says {manifest}, artifact says {artifact}")]
  TelescopeMismatch { manifest: String, artifact: String },

  #[error("bad argument: {0}")]
  BadArgument(String),

  #[error("queue holds {remaining} s of observations, over the {limit} s limit")]
  TooMuchOnQueue { remaining: u32, limit: u32 },

  #[error("replacement entry is not the same kind as the entry being replaced")]
  ReplaceTypeMismatch,

  #[error("entry project/MSB identity does not match the block it would join")]
  MsbMismatch,

  #[error("project database error: {0}")]
  Database(String),

  #[error("backend error: {0}")]
  Backend(String),

  #[error("queue server is no longer running")]
  ServerGone,
}

pub type QueueResult<T> = Result<T, QueueError>;
