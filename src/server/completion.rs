use std::{
  collections::BTreeMap,
  fs, io,
  io::Write,
  path::{Path, PathBuf},
};

use chrono::Utc;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::{
  db::ProjectDb,
  error::{QueueError, QueueResult},
  queue::{MsbKey, QueueContents},
};
use super::params::{ParamPublisher, ParamValue};

/// An MSB waiting for the operator's accept/reject verdict.
///
/// Enough identity is kept to talk to the project database even if the queue
/// (and the MSB itself) is long gone; the live MSB reference is runtime-only
/// and not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAccept {
  pub project_id: String,
  pub msb_id: String,
  pub msb_title: String,
  pub transaction_id: String,
  pub queue_id: u32,
  /// Unix seconds at which the MSB completed.
  pub timestamp: i64,
  #[serde(skip)]
  pub msb: Option<MsbKey>,
}

impl PendingAccept {
  fn to_record(&self) -> BTreeMap<String, String> {
    let mut r = BTreeMap::new();
    r.insert("PROJECTID".to_owned(), self.project_id.clone());
    r.insert("MSBID".to_owned(), self.msb_id.clone());
    r.insert("MSBTID".to_owned(), self.transaction_id.clone());
    r.insert("MSBTITLE".to_owned(), self.msb_title.clone());
    r.insert("QUEUEID".to_owned(), self.queue_id.to_string());
    r.insert("TIMESTAMP".to_owned(), self.timestamp.to_string());
    r
  }
}

/// What the operator decided about a pending accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptDecision {
  Accept,
  Reject,
  /// "Took no data": retire the record without contacting the database.
  Ignore,
}

impl AcceptDecision {
  /// Decisions arrive as integers on the wire: positive accepts, zero
  /// rejects, negative ignores.
  pub fn from_code(code: i32) -> Self {
    if code > 0 {
      AcceptDecision::Accept
    } else if code == 0 {
      AcceptDecision::Reject
    } else {
      AcceptDecision::Ignore
    }
  }
}

/// Tracks completed MSBs through the accept/reject lifecycle and keeps the
/// pending set on disk so a restart does not lose outstanding prompts.
pub struct CompletionTracker {
  pending: BTreeMap<String, PendingAccept>,
  path: PathBuf,
  no_complete: bool,
}

impl CompletionTracker {
  /// Open the tracker, reading any pending accepts a previous run left
  /// behind. An unreadable file is logged and ignored; it will be rewritten
  /// on the next change.
  pub fn open(path: PathBuf, no_complete: bool) -> Self {
    let pending = match read_pending(&path) {
      Ok(p) => p,
      Err(e) => {
        warn!(
          "could not read pending accepts from {}: {e}",
          path.display()
        );
        BTreeMap::new()
      }
    };
    if !pending.is_empty() {
      info!(
        "recovered {} pending MSB accept(s) from {}",
        pending.len(),
        path.display()
      );
    }
    CompletionTracker {
      pending,
      path,
      no_complete,
    }
  }

  pub fn pending(&self) -> &BTreeMap<String, PendingAccept> {
    &self.pending
  }

  /// Re-announce every recovered record, so accepts outstanding at shutdown
  /// resume in the new run.
  pub fn republish(&self, params: &mut ParamPublisher) {
    for (key, rec) in &self.pending {
      params.publish(
        &format!("MSBCOMPLETED.{key}"),
        ParamValue::Record(rec.to_record()),
      );
    }
  }

  /// Handle a completion event from the queue: decide whether this MSB gets
  /// an accept prompt, store and persist the record, and publish it.
  /// Returns the completion key when a record was created.
  pub fn msb_completed(
    &mut self,
    key: MsbKey,
    queue: &mut QueueContents,
    params: &mut ParamPublisher,
  ) -> Option<String> {
    let Some(msb) = queue.msb(key) else {
      return None;
    };
    let project = msb.project_id().unwrap_or("UNKNOWN").to_owned();
    if project == "SCUBA" || project == "UNKNOWN" || project.ends_with("CAL") {
      info!("MSB of project {project} completed; no accept prompt for it");
      return None;
    }
    if self.no_complete {
      info!("no-complete mode: retiring MSB of {project} without a prompt");
      queue.cut_entries_of_msb(key);
      return None;
    }

    let record = PendingAccept {
      project_id: project,
      msb_id: msb.msb_id().unwrap_or_default().to_owned(),
      msb_title: msb.title().unwrap_or_default().to_owned(),
      transaction_id: msb.transaction_id().to_owned(),
      queue_id: msb.queue_id(),
      timestamp: Utc::now().timestamp(),
      msb: Some(key),
    };

    // The timestamp makes an adequate short key; bump while colliding.
    let mut stamp = record.timestamp;
    while self.pending.contains_key(&stamp.to_string()) {
      stamp += 1;
    }
    let completion_key = stamp.to_string();

    params.publish(
      &format!("MSBCOMPLETED.{completion_key}"),
      ParamValue::Record(record.to_record()),
    );
    self.pending.insert(completion_key.clone(), record);
    if let Err(e) = self.persist() {
      error!("could not persist pending accepts: {e}");
    }
    Some(completion_key)
  }

  /// Apply one operator decision. Database trouble is reported but leaves
  /// the record in place so the decision can be retried.
  pub fn decide(
    &mut self,
    completion_key: &str,
    decision: AcceptDecision,
    user: Option<&str>,
    reason: Option<&str>,
    simdb: bool,
    db: &mut dyn ProjectDb,
    queue: &mut QueueContents,
    params: &mut ParamPublisher,
  ) -> QueueResult<()> {
    let Some(record) = self.pending.get(completion_key) else {
      return Err(QueueError::BadArgument(format!(
        "no pending MSB accept under key {completion_key}"
      )));
    };

    if !simdb {
      let outcome = match decision {
        AcceptDecision::Accept => db.msb_done(&record.project_id, &record.msb_id, user, reason),
        AcceptDecision::Reject => db.msb_reject(&record.project_id, &record.msb_id, user, reason),
        AcceptDecision::Ignore => Ok(()),
      };
      if let Err(e) = outcome {
        error!(
          "project database refused {decision:?} for {}/{}: {e}",
          record.project_id, record.msb_id
        );
        return Err(QueueError::Database(e.to_string()));
      }
    }

    let Some(record) = self.pending.remove(completion_key) else {
      return Err(QueueError::BadArgument(format!(
        "no pending MSB accept under key {completion_key}"
      )));
    };
    if let Err(e) = self.persist() {
      error!("could not persist pending accepts: {e}");
    }
    params.clear(&format!("MSBCOMPLETED.{completion_key}"));
    if let Some(msb_key) = record.msb {
      queue.cut_entries_of_msb(msb_key);
    }
    Ok(())
  }

  /// Write the pending table atomically (write, then rename); remove the
  /// file outright when nothing is pending.
  fn persist(&self) -> QueueResult<()> {
    if self.pending.is_empty() {
      match fs::remove_file(&self.path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
      }
      return Ok(());
    }
    let dir = self
      .path
      .parent()
      .filter(|p| !p.as_os_str().is_empty())
      .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, &self.pending)?;
    tmp.flush()?;
    tmp
      .persist(&self.path)
      .map_err(|e| QueueError::Io(e.error))?;
    Ok(())
  }
}

fn read_pending(path: &Path) -> QueueResult<BTreeMap<String, PendingAccept>> {
  let text = match fs::read_to_string(path) {
    Ok(t) => t,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
    Err(e) => return Err(e.into()),
  };
  Ok(serde_json::from_str(&text)?)
}
