use std::collections::BTreeMap;

use chrono::Utc;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio_extras::channel as mio_channel;
use serde::Serialize;

/// Value of one observable parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ParamValue {
  Int(i32),
  Str(String),
  StrList(Vec<String>),
  Record(BTreeMap<String, String>),
  /// The parameter has been withdrawn (e.g. a decided MSBCOMPLETED slot).
  Cleared,
}

/// One change notification pushed to subscribed monitor clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamUpdate {
  pub name: String,
  pub value: ParamValue,
}

/// Publishes observable state to monitor clients.
///
/// Updates go out only when a value actually changed. Delivery is
/// best-effort: a subscriber with a full channel misses the update rather
/// than stalling the server, and a disconnected subscriber is dropped.
pub struct ParamPublisher {
  values: BTreeMap<String, ParamValue>,
  subscribers: Vec<mio_channel::SyncSender<ParamUpdate>>,
  contents_width: usize,
  contents_slots: usize,
}

const SUBSCRIBER_DEPTH: usize = 512;

impl ParamPublisher {
  pub fn new(contents_width: usize, contents_slots: usize) -> Self {
    ParamPublisher {
      values: BTreeMap::new(),
      subscribers: Vec::new(),
      contents_width,
      contents_slots,
    }
  }

  /// Attach a monitor client. It receives changes from now on; the current
  /// table is available through a snapshot.
  pub fn subscribe(&mut self) -> mio_channel::Receiver<ParamUpdate> {
    let (tx, rx) = mio_channel::sync_channel(SUBSCRIBER_DEPTH);
    self.subscribers.push(tx);
    rx
  }

  /// The whole published table, for monitor bootstrap.
  pub fn snapshot(&self) -> BTreeMap<String, ParamValue> {
    self.values.clone()
  }

  pub fn get(&self, name: &str) -> Option<&ParamValue> {
    self.values.get(name)
  }

  /// Publish `value` under `name` if it differs from what is already out.
  pub fn publish(&mut self, name: &str, value: ParamValue) {
    if self.values.get(name) == Some(&value) {
      return;
    }
    self.values.insert(name.to_owned(), value.clone());
    self.fan_out(ParamUpdate {
      name: name.to_owned(),
      value,
    });
  }

  /// Withdraw a parameter (it stops existing, rather than becoming empty).
  pub fn clear(&mut self, name: &str) {
    if self.values.remove(name).is_some() {
      self.fan_out(ParamUpdate {
        name: name.to_owned(),
        value: ParamValue::Cleared,
      });
    }
  }

  /// Names currently published under a dotted prefix, e.g. `MSBCOMPLETED.`.
  pub fn names_under(&self, prefix: &str) -> Vec<String> {
    self
      .values
      .keys()
      .filter(|k| k.starts_with(prefix))
      .cloned()
      .collect()
  }

  /// Publish the queue contents listing. Lines are clipped to the configured
  /// cell width, trailing whitespace is trimmed, the list is capped at the
  /// slot count and shrunk at the first empty line, and the result is
  /// compared element-wise with what is already published.
  pub fn publish_contents(&mut self, lines: Vec<String>) {
    let mut normalized: Vec<String> = Vec::with_capacity(lines.len());
    for line in lines.into_iter().take(self.contents_slots) {
      let mut cell: String = line.chars().take(self.contents_width).collect();
      cell.truncate(cell.trim_end().len());
      if cell.is_empty() {
        break;
      }
      normalized.push(cell);
    }
    self.publish("Queue.Contents", ParamValue::StrList(normalized));
  }

  /// Feed drained backend messages into the good and error streams. Lines
  /// are coalesced by contiguous status, prefixed with a UTC wall-clock
  /// stamp, and always emitted (streams are traffic, not state).
  pub fn publish_messages(&mut self, statuses: &[i32], messages: &[String]) {
    let stamp = Utc::now().format("%H:%M:%S").to_string();
    let mut run: Vec<String> = Vec::new();
    let mut run_status = 0;
    for (status, text) in statuses.iter().zip(messages.iter()) {
      let good = *status == 0;
      let run_good = run_status == 0;
      if !run.is_empty() && good != run_good {
        self.emit_stream(run_good, &stamp, &run);
        run.clear();
      }
      run_status = *status;
      run.push(format!("{stamp} {text}"));
    }
    if !run.is_empty() {
      self.emit_stream(run_status == 0, &stamp, &run);
    }
  }

  fn emit_stream(&mut self, good: bool, _stamp: &str, lines: &[String]) {
    let name = if good { "MESSAGES" } else { "ERSMESSAGES" };
    let value = ParamValue::Str(lines.join("\n"));
    // Streams bypass the change comparison: two identical reports a minute
    // apart are both news.
    self.values.insert(name.to_owned(), value.clone());
    self.fan_out(ParamUpdate {
      name: name.to_owned(),
      value,
    });
  }

  /// Best-effort delivery. A full channel is normal (nobody is required to
  /// be listening); a closed one retires the subscriber.
  fn fan_out(&mut self, update: ParamUpdate) {
    self.subscribers.retain(|tx| {
      match tx.try_send(update.clone()) {
        Ok(()) => true,
        Err(mio_channel::TrySendError::Full(_)) => {
          trace!("subscriber channel full, update dropped");
          true
        }
        Err(_) => false,
      }
    });
  }
}
