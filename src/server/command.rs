use std::{collections::BTreeMap, path::PathBuf, sync::mpsc};

use mio_extras::channel as mio_channel;

use crate::error::QueueError;
use super::params::{ParamUpdate, ParamValue};

/// Alert codes published alongside a queue stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alert {
  None,
  /// The backend reported an error.
  BackendError,
  /// The queue ran out of entries.
  QueueEmpty,
}

impl Alert {
  pub fn code(&self) -> i32 {
    match self {
      Alert::None => 0,
      Alert::BackendError => 1,
      Alert::QueueEmpty => 2,
    }
  }
}

/// One accept/reject/ignore verdict for MSB_COMPLETE. Several can ride in a
/// single command.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
  pub key: String,
  /// Positive accepts, zero rejects, negative means "took no data".
  pub decision: i32,
  pub user: Option<String>,
  pub reason: Option<String>,
}

/// The operator action surface. Every command is serialized with the poll on
/// the server's event loop and replies only after its effects are published.
#[derive(Debug, Clone)]
pub enum Command {
  /// Run a poll pass now (the recurring poll re-arms itself).
  Poll,
  /// Stop the recurring poll from rescheduling.
  KickPoll,
  Start,
  Stop {
    alert: Option<Alert>,
  },
  Load {
    manifest: PathBuf,
    iscal: bool,
  },
  AddBack {
    manifest: PathBuf,
    iscal: bool,
  },
  AddFront {
    manifest: PathBuf,
    iscal: bool,
  },
  Insert {
    position: isize,
    manifest: PathBuf,
    iscal: bool,
  },
  Clear,
  Cut {
    index: usize,
    count: usize,
  },
  /// Cut the MSB containing `index`, or the highlighted one when absent.
  CutMsb {
    index: Option<usize>,
  },
  /// Overwrite the target of one entry from a TCS description.
  Modify {
    index: usize,
    target_xml: String,
    propagate: bool,
    no_auto_start: bool,
  },
  ClearTarget {
    index: usize,
  },
  /// Report a mid-MSB suspension and retire the block without a prompt.
  SuspendMsb,
  MsbComplete {
    requests: Vec<CompletionRequest>,
  },
  /// Structured dump of the entity at `index`.
  GetEntry {
    index: usize,
  },
  /// A monitor client wrote the INDEX parameter.
  SetIndex {
    index: i32,
  },
  /// Attach a monitor client to the parameter stream.
  Subscribe,
  /// Read the whole published parameter table (monitor bootstrap).
  GetParams,
  /// Clear the queue and terminate the loop.
  Exit,
}

/// Payload of a successful command.
pub enum CommandResponse {
  Done,
  Entity(serde_json::Value),
  Subscribed(mio_channel::Receiver<ParamUpdate>),
  Params(BTreeMap<String, ParamValue>),
}

pub type CommandReply = Result<CommandResponse, QueueError>;

/// A command paired with the channel its reply goes back on.
pub struct CommandRequest {
  pub command: Command,
  pub reply: mpsc::Sender<CommandReply>,
}
