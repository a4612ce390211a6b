use std::collections::HashMap;

use chrono::Utc;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  config::Telescope,
  error::{QueueError, QueueResult},
};
use super::entry::{EntryId, EntryStatus, EntryStore};

/// Stable identity of one MSB within the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MsbKey(pub(crate) u64);

/// A Minimum Schedulable Block: the group of entries that is accepted or
/// rejected as one unit.
#[derive(Debug, Clone)]
pub struct Msb {
  key: MsbKey,
  project_id: Option<String>,
  msb_id: Option<String>,
  title: Option<String>,
  transaction_id: String,
  queue_id: u32,
  members: Vec<EntryId>,
  has_been_observed: bool,
  has_been_completed: bool,
  /// The member the highlight most recently sat on.
  reference: Option<EntryId>,
}

impl Msb {
  /// Mint a new MSB. The transaction id is the stable cross-process key for
  /// accept/reject records: telescope name plus a high-resolution timestamp.
  pub fn new(
    telescope: Telescope,
    project_id: Option<String>,
    msb_id: Option<String>,
    title: Option<String>,
  ) -> Self {
    let now = Utc::now();
    let transaction_id = format!(
      "{}_{}.{:06}",
      telescope,
      now.timestamp(),
      now.timestamp_subsec_micros()
    );
    Msb {
      key: MsbKey(0), // assigned by the store
      project_id,
      msb_id,
      title,
      transaction_id,
      queue_id: 0,
      members: Vec::new(),
      has_been_observed: false,
      has_been_completed: false,
      reference: None,
    }
  }

  pub fn key(&self) -> MsbKey {
    self.key
  }

  pub fn project_id(&self) -> Option<&str> {
    self.project_id.as_deref()
  }

  pub fn msb_id(&self) -> Option<&str> {
    self.msb_id.as_deref()
  }

  pub fn title(&self) -> Option<&str> {
    self.title.as_deref()
  }

  pub fn transaction_id(&self) -> &str {
    &self.transaction_id
  }

  pub fn queue_id(&self) -> u32 {
    self.queue_id
  }

  pub fn set_queue_id(&mut self, qid: u32) {
    self.queue_id = qid;
  }

  pub fn members(&self) -> &[EntryId] {
    &self.members
  }

  pub fn has_been_observed(&self) -> bool {
    self.has_been_observed
  }

  pub fn set_observed(&mut self, observed: bool) {
    self.has_been_observed = observed;
  }

  pub fn has_been_completed(&self) -> bool {
    self.has_been_completed
  }

  /// Flip the completed latch, reporting whether this call was the one that
  /// completed the MSB. The latch never resets, so completion is delivered at
  /// most once over the MSB's lifetime.
  pub fn mark_completed_once(&mut self) -> bool {
    if self.has_been_completed {
      false
    } else {
      self.has_been_completed = true;
      true
    }
  }

  pub fn reference(&self) -> Option<EntryId> {
    self.reference
  }

  pub fn set_reference(&mut self, entry: EntryId) {
    self.reference = Some(entry);
  }

  /// Adopt `members` as this MSB's membership, stamping each entry's
  /// back-reference and transaction id, then recompute the edge flags.
  pub fn adopt_members(&mut self, members: Vec<EntryId>, store: &mut EntryStore) {
    for id in &members {
      if let Some(e) = store.get_mut(*id) {
        e.set_msb(self.key, &self.transaction_id);
      }
    }
    self.members = members;
    self.update(store);
  }

  /// Recompute first/last-in-MSB flags: the first member carries first, the
  /// last carries last, interior members carry neither.
  pub fn update(&self, store: &mut EntryStore) {
    let n = self.members.len();
    for (i, id) in self.members.iter().enumerate() {
      if let Some(e) = store.get_mut(*id) {
        e.set_msb_flags(i == 0, i + 1 == n);
      }
    }
  }

  /// Drop `removed` from the membership and decide whether the MSB has now
  /// run its course. Returns true when this cut completed the MSB.
  ///
  /// Completion requires the MSB to have been observed, and either no member
  /// remains, or the reference member was removed along with every member at
  /// or after its original position.
  pub fn cut(&mut self, removed: &[EntryId], store: &mut EntryStore) -> bool {
    let original: Vec<EntryId> = self.members.clone();
    self.members.retain(|id| !removed.contains(id));
    self.update(store);

    if !self.has_been_observed || self.has_been_completed {
      return false;
    }

    let complete = if self.members.is_empty() {
      true
    } else if let Some(reference) = self.reference {
      match original.iter().position(|id| *id == reference) {
        Some(ref_pos) if removed.contains(&reference) => original[ref_pos..]
          .iter()
          .all(|id| removed.contains(id)),
        _ => false,
      }
    } else {
      false
    };

    if complete {
      self.has_been_completed = true;
    }
    complete
  }

  /// Swap `old` for `new` in place. The incoming entry must carry the same
  /// project and MSB identity as this block; absent on both sides counts as a
  /// match.
  pub fn replace(&mut self, old: EntryId, new: EntryId, store: &mut EntryStore) -> QueueResult<()> {
    let Some(pos) = self.members.iter().position(|id| *id == old) else {
      return Err(QueueError::MsbMismatch);
    };
    {
      let Some(entry) = store.get(new) else {
        return Err(QueueError::MsbMismatch);
      };
      let entity = entry.entity();
      if entity.project_id() != self.project_id() || entity.msb_id() != self.msb_id() {
        return Err(QueueError::MsbMismatch);
      }
    }
    self.members[pos] = new;
    if let Some(e) = store.get_mut(new) {
      e.set_msb(self.key, &self.transaction_id);
    }
    if self.reference == Some(old) {
      self.reference = Some(new);
    }
    self.update(store);
    Ok(())
  }
}

/// Arena of live MSBs.
#[derive(Debug, Default)]
pub struct MsbStore {
  map: HashMap<MsbKey, Msb>,
  next: u64,
}

impl MsbStore {
  pub fn insert(&mut self, mut msb: Msb) -> MsbKey {
    let key = MsbKey(self.next);
    self.next += 1;
    msb.key = key;
    self.map.insert(key, msb);
    key
  }

  pub fn get(&self, key: MsbKey) -> Option<&Msb> {
    self.map.get(&key)
  }

  pub fn get_mut(&mut self, key: MsbKey) -> Option<&mut Msb> {
    self.map.get_mut(&key)
  }

  pub fn remove(&mut self, key: MsbKey) -> Option<Msb> {
    self.map.remove(&key)
  }

  /// Drop MSBs that no longer have members and are no longer back-referenced
  /// by any live entry (an in-flight SENT entry keeps its MSB alive until the
  /// send resolves).
  pub fn gc(&mut self, store: &EntryStore) {
    self.map.retain(|key, msb| {
      if !msb.members.is_empty() {
        return true;
      }
      store
        .iter()
        .any(|(_, e)| e.msb() == Some(*key) && e.status() == EntryStatus::Sent)
    });
  }
}
