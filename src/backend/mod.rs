//! The adapter between the queue and the downstream instrument controller.
//!
//! Two concrete tasks exist (the instrument task and the SCUBA task); the
//! server only depends on the [`Backend`] contract. The wire transport is
//! behind [`InstrumentLink`]: dispatch is non-blocking and the instrument's
//! replies come back as [`BackendEvent`]s on the server's backend channel.

pub(crate) mod failure;
pub(crate) mod instrument;
pub(crate) mod scuba;

use std::{
  collections::VecDeque,
  sync::{Arc, Mutex},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio_extras::channel as mio_channel;

use crate::{
  entity::PrepareError,
  error::{QueueError, QueueResult},
  queue::{EntryId, EntryStatus, MsbKey, QueueContents},
};
pub use failure::{FailureDetails, FailureReason, FixupAction};
pub use instrument::InstrumentTask;
pub use scuba::ScubaTask;

/// A status-tagged line from the backend. Status 0 is good news.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendMessage {
  pub status: i32,
  pub text: String,
}

/// Replies and chatter arriving from the instrument, multiplexed into the
/// server's event loop.
#[derive(Debug, Clone)]
pub enum BackendEvent {
  /// The dispatched observation ran to completion.
  ObsCompleted,
  /// The dispatched observation failed.
  ObsError { status: i32, message: String },
  /// The send has fully resolved, success or not; a new send may go out.
  SendDone,
  /// Informational traffic, drained by the next poll.
  Message { status: i32, text: String },
}

/// The dispatch side of the instrument connection. Implementations hold the
/// backend-event sender they were built with and reply through it.
pub trait InstrumentLink: Send {
  fn connect(&mut self) -> QueueResult<()> {
    Ok(())
  }

  /// Hand one artifact identifier to the instrument. Must not block.
  fn dispatch(&mut self, artifact: &str) -> QueueResult<()>;
}

// ----------------------------------------------
// ----------------------------------------------

/// How a [`SimLink`] answers each dispatch.
#[derive(Debug, Clone)]
pub enum SimReply {
  Success,
  Error { status: i32, message: String },
  /// Reply nothing; the test drives completion by hand.
  Silent,
}

/// Simulated instrument for dry runs and tests: echoes every dispatch into a
/// shared log and answers according to its configured reply.
pub struct SimLink {
  events: mio_channel::Sender<BackendEvent>,
  reply: SimReply,
  log: Arc<Mutex<Vec<String>>>,
}

impl SimLink {
  pub fn new(events: mio_channel::Sender<BackendEvent>) -> Self {
    SimLink {
      events,
      reply: SimReply::Success,
      log: Arc::new(Mutex::new(Vec::new())),
    }
  }

  pub fn with_reply(mut self, reply: SimReply) -> Self {
    self.reply = reply;
    self
  }

  /// Shared view of the artifacts dispatched so far.
  pub fn dispatch_log(&self) -> Arc<Mutex<Vec<String>>> {
    Arc::clone(&self.log)
  }

  fn emit(&self, event: BackendEvent) -> QueueResult<()> {
    self
      .events
      .send(event)
      .map_err(|_| QueueError::Backend("backend event channel closed".to_owned()))
  }
}

impl InstrumentLink for SimLink {
  fn dispatch(&mut self, artifact: &str) -> QueueResult<()> {
    if let Ok(mut log) = self.log.lock() {
      log.push(artifact.to_owned());
    }
    match self.reply.clone() {
      SimReply::Success => {
        self.emit(BackendEvent::Message {
          status: 0,
          text: format!("observation {artifact} completed"),
        })?;
        self.emit(BackendEvent::ObsCompleted)?;
        self.emit(BackendEvent::SendDone)?;
      }
      SimReply::Error { status, message } => {
        self.emit(BackendEvent::ObsError { status, message })?;
        self.emit(BackendEvent::SendDone)?;
      }
      SimReply::Silent => {}
    }
    Ok(())
  }
}

// ----------------------------------------------
// ----------------------------------------------

/// Outcome of one send attempt.
#[derive(Debug)]
pub enum SendOutcome {
  /// Dispatched; a completion event will follow.
  Sent,
  /// Preconditions not met; nothing happened.
  NotReady,
  /// Recoverable failure, enriched and stored for the FAILURE parameter.
  Failed(FailureReason),
}

/// What one poll pass produced: drained messages with their status codes,
/// plus any send trouble.
#[derive(Debug, Default)]
pub struct PollOutcome {
  pub statuses: Vec<i32>,
  pub messages: Vec<String>,
  pub send_failure: Option<FailureReason>,
  pub fatal: Option<QueueError>,
}

impl PollOutcome {
  pub fn local_ok(&self) -> bool {
    self.fatal.is_none()
  }

  fn absorb(&mut self, messages: Vec<BackendMessage>) {
    for m in messages {
      self.statuses.push(m.status);
      self.messages.push(m.text);
    }
  }
}

/// What the post-observation tidy decided.
#[derive(Debug, Default)]
pub struct TidyOutcome {
  /// The highlight ran off the end: the queue has stopped and the highlight
  /// is back at the start.
  pub end_of_queue: bool,
  /// Observing this entry completed its MSB.
  pub completed_msb: Option<MsbKey>,
}

/// State shared by both concrete backend tasks.
pub struct BackendCore {
  link: Box<dyn InstrumentLink>,
  connected: bool,
  accepting: bool,
  qrunning: bool,
  last_sent: Option<EntryId>,
  failure: Option<FailureReason>,
  messages: VecDeque<BackendMessage>,
}

impl BackendCore {
  pub fn new(link: Box<dyn InstrumentLink>) -> Self {
    BackendCore {
      link,
      // Connection to these tasks is implicit in each send.
      connected: true,
      accepting: true,
      qrunning: false,
      last_sent: None,
      failure: None,
      messages: VecDeque::new(),
    }
  }

  /// Take the stored failure out for enrichment; pair with `store_failure`.
  pub fn take_failure(&mut self) -> Option<FailureReason> {
    self.failure.take()
  }

  pub fn store_failure(&mut self, reason: FailureReason) {
    self.failure = Some(reason);
  }
}

/// The backend contract the queue server drives.
///
/// The state machine of one entry traversal:
/// `QUEUED --send--> SENT --success--> OBSERVED --tidy--> highlight advances`,
/// with the error leg `SENT --error--> ERROR` stopping the queue.
pub trait Backend: Send {
  fn core(&self) -> &BackendCore;
  fn core_mut(&mut self) -> &mut BackendCore;

  /// Enrich the stored recoverable failure with scan context. Variants
  /// differ: only the instrument task resolves NeedNextTarget, and only the
  /// SCUBA task extends setup slew times.
  fn add_failure_context(&mut self, q: &mut QueueContents) -> FixupAction;

  fn connect(&mut self) -> QueueResult<()> {
    self.core_mut().link.connect()?;
    self.core_mut().connected = true;
    Ok(())
  }

  fn disconnect(&mut self) {
    self.core_mut().connected = false;
  }

  fn is_connected(&self) -> bool {
    self.core().connected
  }

  fn is_accepting(&self) -> bool {
    self.core().accepting
  }

  fn set_accepting(&mut self, accepting: bool) {
    self.core_mut().accepting = accepting;
  }

  fn q_running(&self) -> bool {
    self.core().qrunning
  }

  fn set_q_running(&mut self, running: bool) {
    self.core_mut().qrunning = running;
  }

  fn last_sent(&self) -> Option<EntryId> {
    self.core().last_sent
  }

  fn failure(&self) -> Option<&FailureReason> {
    self.core().failure.as_ref()
  }

  fn clear_failure(&mut self) {
    self.core_mut().failure = None;
  }

  fn push_message(&mut self, status: i32, text: String) {
    self.core_mut().messages.push_back(BackendMessage { status, text });
  }

  fn drain_messages(&mut self) -> Vec<BackendMessage> {
    self.core_mut().messages.drain(..).collect()
  }

  /// Try to dispatch the highlighted entry.
  ///
  /// Preconditions: running, accepting, queue non-empty. A recoverable
  /// `prepare` failure is stored and enriched; if the fixup repaired the
  /// entry, `prepare` is retried once before giving up.
  fn send(&mut self, q: &mut QueueContents) -> QueueResult<SendOutcome> {
    if !self.q_running() || !self.is_accepting() || q.is_empty() {
      return Ok(SendOutcome::NotReady);
    }
    let (Some(id), Some(index)) = (q.get_for_observation(), q.current_index()) else {
      return Ok(SendOutcome::NotReady);
    };
    if !self.is_connected() {
      self.connect()?;
    }

    let mut retried = false;
    loop {
      let prepared = match q.get_mut(id) {
        Some(entry) => entry.entity_mut().prepare(),
        None => return Ok(SendOutcome::NotReady),
      };
      match prepared {
        Ok(artifact) => {
          if let Some(entry) = q.get_mut(id) {
            entry.set_status(EntryStatus::Sent);
          }
          self.core_mut().last_sent = Some(id);
          self.set_accepting(false);
          q.mark_sent();
          debug!("dispatching {artifact}");
          self.core_mut().link.dispatch(&artifact)?;
          return Ok(SendOutcome::Sent);
        }
        Err(PrepareError::Recoverable(fault)) => {
          let reason = match q.get(id) {
            Some(entry) => FailureReason::for_entry(fault, index, entry),
            None => return Ok(SendOutcome::NotReady),
          };
          info!("send held back: {} at index {index}", fault.as_str());
          self.core_mut().failure = Some(reason);
          let action = self.add_failure_context(q);
          if action == FixupAction::Fixed && !retried {
            retried = true;
            self.clear_failure();
            continue;
          }
          return match self.core().failure.clone() {
            Some(reason) => Ok(SendOutcome::Failed(reason)),
            None => Ok(SendOutcome::NotReady),
          };
        }
        Err(PrepareError::Fatal(e)) => return Err(e),
      }
    }
  }

  /// One poll pass: drain backend chatter, dispatch if ready, drain whatever
  /// the dispatch stirred up.
  fn poll(&mut self, q: &mut QueueContents) -> PollOutcome {
    let mut out = PollOutcome::default();
    out.absorb(self.drain_messages());
    if self.q_running() && self.is_accepting() && !q.is_empty() {
      match self.send(q) {
        Ok(SendOutcome::Sent) | Ok(SendOutcome::NotReady) => {}
        Ok(SendOutcome::Failed(reason)) => out.send_failure = Some(reason),
        Err(e) => out.fatal = Some(e),
      }
    }
    out.absorb(self.drain_messages());
    out
  }

  /// Book-keeping after a successful observation: mark the MSB observed,
  /// advance the highlight unless the queue was mutated behind the send's
  /// back, and trigger MSB completion off the block's closing entry.
  fn post_obs_tidy(&mut self, q: &mut QueueContents, id: EntryId) -> TidyOutcome {
    let mut out = TidyOutcome::default();

    if let Some(key) = q.get(id).and_then(|e| e.msb()) {
      if let Some(msb) = q.msb_mut(key) {
        msb.set_observed(true);
      }
    }

    let current = q.current_index();
    if current.is_some() && current == q.last_sent_index() {
      if let Some(i) = current {
        let next = i + 1;
        if next >= q.len() {
          self.set_q_running(false);
          q.set_current_index(0);
          out.end_of_queue = true;
        } else {
          q.set_current_index(next);
        }
      }
    }
    q.clear_last_sent();

    let closes_block = q.get(id).map(|e| e.last_in_msb()).unwrap_or(false);
    if closes_block {
      if let Some(key) = q.get(id).and_then(|e| e.msb()) {
        if let Some(msb) = q.msb_mut(key) {
          if msb.mark_completed_once() {
            out.completed_msb = Some(key);
          }
        }
      }
    }
    out
  }
}
