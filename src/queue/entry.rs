use std::{collections::HashMap, fmt};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::entity::ObsEntity;
use super::msb::MsbKey;

/// Stable identity of one entry, independent of its queue position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub(crate) u64);

/// Dispatch state of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
  Queued,
  Sent,
  Observed,
  Error,
}

impl fmt::Display for EntryStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EntryStatus::Queued => write!(f, "QUEUED"),
      EntryStatus::Sent => write!(f, "SENT"),
      EntryStatus::Observed => write!(f, "OBSERVED"),
      EntryStatus::Error => write!(f, "ERROR"),
    }
  }
}

/// One dispatchable observation sitting in the queue.
#[derive(Debug, Clone)]
pub struct Entry {
  label: String,
  status: EntryStatus,
  entity: ObsEntity,
  first_in_msb: bool,
  last_in_msb: bool,
  msb: Option<MsbKey>,
  msb_tid: Option<String>,
  warnings: Vec<String>,
  /// Slew-track time before the setup fixup extended it, so repeated fixups
  /// do not accumulate.
  original_slew_time: Option<u32>,
}

impl Entry {
  pub fn new(entity: ObsEntity) -> Self {
    let label = entity
      .obs_label()
      .map(str::to_owned)
      .unwrap_or_else(|| {
        entity
          .info()
          .path
          .file_stem()
          .map(|s| s.to_string_lossy().into_owned())
          .unwrap_or_else(|| "entry".to_owned())
      });
    Entry {
      label,
      status: EntryStatus::Queued,
      entity,
      first_in_msb: false,
      last_in_msb: false,
      msb: None,
      msb_tid: None,
      warnings: Vec::new(),
      original_slew_time: None,
    }
  }

  pub fn label(&self) -> &str {
    &self.label
  }

  pub fn status(&self) -> EntryStatus {
    self.status
  }

  pub fn set_status(&mut self, status: EntryStatus) {
    self.status = status;
  }

  pub fn entity(&self) -> &ObsEntity {
    &self.entity
  }

  pub fn entity_mut(&mut self) -> &mut ObsEntity {
    &mut self.entity
  }

  pub fn duration(&self) -> u32 {
    self.entity.duration()
  }

  pub fn msb(&self) -> Option<MsbKey> {
    self.msb
  }

  pub fn set_msb(&mut self, key: MsbKey, transaction_id: &str) {
    self.msb = Some(key);
    self.msb_tid = Some(transaction_id.to_owned());
  }

  pub fn clear_msb(&mut self) {
    self.msb = None;
  }

  pub fn msb_transaction_id(&self) -> Option<&str> {
    self.msb_tid.as_deref()
  }

  pub fn first_in_msb(&self) -> bool {
    self.first_in_msb
  }

  pub fn last_in_msb(&self) -> bool {
    self.last_in_msb
  }

  pub fn set_msb_flags(&mut self, first: bool, last: bool) {
    self.first_in_msb = first;
    self.last_in_msb = last;
  }

  pub fn add_warning(&mut self, text: impl Into<String>) {
    self.warnings.push(text.into());
  }

  pub fn warnings(&self) -> &[String] {
    &self.warnings
  }

  pub fn original_slew_time(&self) -> Option<u32> {
    self.original_slew_time
  }

  pub fn stash_original_slew_time(&mut self, seconds: u32) {
    if self.original_slew_time.is_none() {
      self.original_slew_time = Some(seconds);
    }
  }
}

/// Arena holding every live Entry by id. The queue order, MSB membership and
/// the in-flight send all refer into it, so there are no reference cycles to
/// break beyond dropping ids.
#[derive(Debug, Default)]
pub struct EntryStore {
  map: HashMap<EntryId, Entry>,
  next: u64,
}

impl EntryStore {
  pub fn insert(&mut self, entry: Entry) -> EntryId {
    let id = EntryId(self.next);
    self.next += 1;
    self.map.insert(id, entry);
    id
  }

  pub fn get(&self, id: EntryId) -> Option<&Entry> {
    self.map.get(&id)
  }

  pub fn get_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
    self.map.get_mut(&id)
  }

  pub fn remove(&mut self, id: EntryId) -> Option<Entry> {
    self.map.remove(&id)
  }

  pub fn contains(&self, id: EntryId) -> bool {
    self.map.contains_key(&id)
  }

  pub fn len(&self) -> usize {
    self.map.len()
  }

  pub fn is_empty(&self) -> bool {
    self.map.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (EntryId, &Entry)> {
    self.map.iter().map(|(id, e)| (*id, e))
  }
}
