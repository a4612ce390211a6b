use std::cmp::min;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  error::{QueueError, QueueResult},
  target::Target,
};
use super::{
  entry::{Entry, EntryId, EntryStatus, EntryStore},
  msb::{Msb, MsbKey, MsbStore},
};

/// A group of entries arriving together: either one MSB or stand-alone
/// calibrations.
#[derive(Debug)]
pub struct EntryBatch {
  pub entries: Vec<Entry>,
  pub msb: Option<Msb>,
}

impl EntryBatch {
  pub fn standalone(entries: Vec<Entry>) -> Self {
    EntryBatch { entries, msb: None }
  }

  pub fn block(entries: Vec<Entry>, msb: Msb) -> Self {
    EntryBatch {
      entries,
      msb: Some(msb),
    }
  }
}

/// The ordered queue contents: entries, their MSBs, the movable highlight and
/// the last-sent slot the post-observation tidy uses to detect concurrent
/// mutation.
///
/// Entries live in an arena and everything else refers to them by id, so the
/// Entry/MSB mutual references of the data model never form ownership cycles.
#[derive(Debug, Default)]
pub struct QueueContents {
  entries: EntryStore,
  msbs: MsbStore,
  order: Vec<EntryId>,
  current: Option<usize>,
  last_sent: Option<usize>,
}

impl QueueContents {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.order.len()
  }

  pub fn is_empty(&self) -> bool {
    self.order.is_empty()
  }

  pub fn current_index(&self) -> Option<usize> {
    self.current
  }

  /// Move the highlight, clamping into bounds. No-op on an empty queue.
  pub fn set_current_index(&mut self, index: usize) {
    if self.order.is_empty() {
      self.current = None;
    } else {
      self.current = Some(min(index, self.order.len() - 1));
    }
    self.sync_reference();
  }

  pub fn last_sent_index(&self) -> Option<usize> {
    self.last_sent
  }

  /// Record that the current entry has just been dispatched.
  pub fn mark_sent(&mut self) {
    self.last_sent = self.current;
  }

  pub fn clear_last_sent(&mut self) {
    self.last_sent = None;
  }

  pub fn entry_id_at(&self, index: usize) -> Option<EntryId> {
    self.order.get(index).copied()
  }

  pub fn entry_at(&self, index: usize) -> Option<&Entry> {
    self.order.get(index).and_then(|id| self.entries.get(*id))
  }

  pub fn entry_at_mut(&mut self, index: usize) -> Option<&mut Entry> {
    let id = *self.order.get(index)?;
    self.entries.get_mut(id)
  }

  pub fn get(&self, id: EntryId) -> Option<&Entry> {
    self.entries.get(id)
  }

  pub fn get_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
    self.entries.get_mut(id)
  }

  pub fn position_of(&self, id: EntryId) -> Option<usize> {
    self.order.iter().position(|x| *x == id)
  }

  pub fn msb(&self, key: MsbKey) -> Option<&Msb> {
    self.msbs.get(key)
  }

  pub fn msb_mut(&mut self, key: MsbKey) -> Option<&mut Msb> {
    self.msbs.get_mut(key)
  }

  /// The entry the next send will take: the highlighted one. The contents are
  /// indexed, not consumed; nothing is removed here.
  pub fn get_for_observation(&self) -> Option<EntryId> {
    self.current.and_then(|i| self.order.get(i)).copied()
  }

  // ----------------------------------------------
  // loading and insertion

  /// Clear, then append. Completions can fire from the clear when observed
  /// MSBs go away.
  pub fn load(&mut self, batch: EntryBatch) -> Vec<MsbKey> {
    let completed = self.clear();
    self.add_back(batch);
    completed
  }

  /// Swap the whole contents for a new set in one operation, keeping the
  /// numeric highlight where possible. Not on the command surface.
  pub fn replaceq(&mut self, batch: EntryBatch) -> Vec<MsbKey> {
    let old_index = self.current;
    let completed = self.clear();
    self.add_back(batch);
    if let Some(i) = old_index {
      self.set_current_index(i);
    }
    completed
  }

  pub fn add_back(&mut self, batch: EntryBatch) {
    let ids = self.admit(batch);
    self.order.extend(ids);
    if self.current.is_none() && !self.order.is_empty() {
      self.current = Some(0);
    }
    self.sync_reference();
  }

  pub fn add_front(&mut self, batch: EntryBatch) {
    let ids = self.admit(batch);
    let n = ids.len();
    self.order.splice(0..0, ids);
    self.current = match self.current {
      Some(c) => Some(c + n),
      None if !self.order.is_empty() => Some(0),
      None => None,
    };
    self.sync_reference();
  }

  /// Splice a batch in at `pos`. Out-of-range positions degrade to
  /// add_front/add_back, and inserting into an empty queue is add_back
  /// regardless of `pos`.
  pub fn insert(&mut self, pos: isize, batch: EntryBatch) {
    if self.order.is_empty() {
      return self.add_back(batch);
    }
    if pos <= 0 {
      return self.add_front(batch);
    }
    let pos = pos as usize;
    if pos > self.order.len() - 1 {
      return self.add_back(batch);
    }
    let ids = self.admit(batch);
    let n = ids.len();
    self.order.splice(pos..pos, ids);
    if let Some(c) = self.current {
      if c >= pos {
        self.current = Some(c + n);
      }
    }
    self.sync_reference();
  }

  fn admit(&mut self, batch: EntryBatch) -> Vec<EntryId> {
    let ids: Vec<EntryId> = batch
      .entries
      .into_iter()
      .map(|e| self.entries.insert(e))
      .collect();
    if let Some(msb) = batch.msb {
      let key = self.msbs.insert(msb);
      if let Some(m) = self.msbs.get_mut(key) {
        m.adopt_members(ids.clone(), &mut self.entries);
      }
    }
    ids
  }

  // ----------------------------------------------
  // removal

  /// Splice out `n` entries starting at `start`. Returns the MSBs this cut
  /// completed.
  pub fn cut(&mut self, start: usize, n: isize) -> Vec<MsbKey> {
    if n <= 0 || start >= self.order.len() {
      return Vec::new();
    }
    let n = min(n as usize, self.order.len() - start);
    let removed: Vec<EntryId> = self.order.drain(start..start + n).collect();

    // Group the casualties by MSB before touching back-references.
    let mut by_msb: Vec<(MsbKey, Vec<EntryId>)> = Vec::new();
    for id in &removed {
      let Some(entry) = self.entries.get(*id) else {
        continue;
      };
      if let Some(key) = entry.msb() {
        match by_msb.iter_mut().find(|(k, _)| *k == key) {
          Some((_, ids)) => ids.push(*id),
          None => by_msb.push((key, vec![*id])),
        }
      }
    }

    // An entry cut mid-send keeps its MSB back-reference until the send
    // resolves; everything else is detached now.
    for id in &removed {
      if let Some(entry) = self.entries.get_mut(*id) {
        if entry.status() != EntryStatus::Sent {
          entry.clear_msb();
        }
      }
    }

    let mut completed = Vec::new();
    for (key, ids) in by_msb {
      if let Some(msb) = self.msbs.get_mut(key) {
        if msb.cut(&ids, &mut self.entries) {
          completed.push(key);
        }
      }
    }

    for id in &removed {
      let sent = self
        .entries
        .get(*id)
        .map(|e| e.status() == EntryStatus::Sent)
        .unwrap_or(false);
      if !sent {
        self.entries.remove(*id);
      }
    }
    self.msbs.gc(&self.entries);

    self.last_sent = match self.last_sent {
      Some(i) if i >= start && i < start + n => None,
      Some(i) if i >= start + n => Some(i - n),
      other => other,
    };
    self.current = if self.order.is_empty() {
      None
    } else {
      match self.current {
        Some(i) if i >= start + n => Some(i - n),
        Some(i) if i >= start => Some(min(start, self.order.len() - 1)),
        other => other,
      }
    };
    self.sync_reference();
    completed
  }

  /// Cut the whole MSB the entry at `index` belongs to: the contiguous span
  /// of the queue covering its members, interleaved calibrations included.
  /// An entry with no MSB is cut alone.
  pub fn cut_msb(&mut self, index: usize) -> Vec<MsbKey> {
    let Some(entry) = self.entry_at(index) else {
      return Vec::new();
    };
    let Some(key) = entry.msb() else {
      return self.cut(index, 1);
    };
    let positions: Vec<usize> = self
      .msbs
      .get(key)
      .map(|m| {
        m.members()
          .iter()
          .filter_map(|id| self.position_of(*id))
          .collect()
      })
      .unwrap_or_default();
    match (positions.iter().min(), positions.iter().max()) {
      (Some(&lo), Some(&hi)) => self.cut(lo, (hi - lo + 1) as isize),
      _ => self.cut(index, 1),
    }
  }

  /// Remove the remaining member entries of an MSB, wherever they sit.
  /// Used when an accept/reject decision retires the block.
  pub fn cut_entries_of_msb(&mut self, key: MsbKey) -> Vec<MsbKey> {
    let mut completed = Vec::new();
    loop {
      let Some(pos) = self.msbs.get(key).and_then(|m| {
        m.members()
          .iter()
          .find_map(|id| self.position_of(*id))
      }) else {
        break;
      };
      completed.extend(self.cut(pos, 1));
    }
    completed
  }

  /// Empty the queue. MSB/entry references are dropped here, subject to the
  /// in-flight carve-out.
  pub fn clear(&mut self) -> Vec<MsbKey> {
    let n = self.order.len();
    self.cut(0, n as isize)
  }

  /// Resolve an entry that finished its send after being cut from the order:
  /// nothing refers to it any more, so it leaves the arena.
  pub fn drop_if_detached(&mut self, id: EntryId) {
    if self.position_of(id).is_some() {
      return;
    }
    if let Some(e) = self.entries.get_mut(id) {
      e.clear_msb();
    }
    self.entries.remove(id);
    self.msbs.gc(&self.entries);
  }

  // ----------------------------------------------
  // replacement

  /// Swap the entry at `pos` for `entry`. The newcomer must be the same
  /// entity kind, and when the incumbent belongs to an MSB the newcomer must
  /// carry the same project/MSB identity.
  pub fn replace(&mut self, pos: usize, entry: Entry) -> QueueResult<()> {
    let Some(old_id) = self.entry_id_at(pos) else {
      return Err(QueueError::BadArgument(format!(
        "replace index {pos} out of range"
      )));
    };
    let (old_kind_ok, old_msb, old_sent) = {
      let Some(old) = self.entries.get(old_id) else {
        return Err(QueueError::BadArgument(format!(
          "replace index {pos} out of range"
        )));
      };
      (
        entry.entity().same_kind(old.entity()),
        old.msb(),
        old.status() == EntryStatus::Sent,
      )
    };
    if !old_kind_ok {
      return Err(QueueError::ReplaceTypeMismatch);
    }

    let new_id = self.entries.insert(entry);
    if let Some(key) = old_msb {
      if let Some(msb) = self.msbs.get_mut(key) {
        if let Err(e) = msb.replace(old_id, new_id, &mut self.entries) {
          self.entries.remove(new_id);
          return Err(e);
        }
      }
    }
    self.order[pos] = new_id;
    if !old_sent {
      if let Some(e) = self.entries.get_mut(old_id) {
        e.clear_msb();
      }
      self.entries.remove(old_id);
    }
    if self.last_sent == Some(pos) {
      self.last_sent = None;
    }
    self.sync_reference();
    Ok(())
  }

  // ----------------------------------------------
  // targets

  /// Copy the target at `index` forward into target-less entries. The copy
  /// runs through science entries, is allowed into a calibration run, and
  /// ends on the first science entry after that run; an entry with its own
  /// target stops it immediately.
  pub fn propagate_target(&mut self, index: usize) {
    let Some(target) = self
      .entry_at(index)
      .and_then(|e| e.entity().get_target())
      .cloned()
    else {
      return;
    };
    let mut seen_cal = false;
    for i in index + 1..self.order.len() {
      let Some(entry) = self.entry_at_mut(i) else {
        break;
      };
      if entry.entity().get_target().is_some() {
        break;
      }
      entry.entity_mut().set_target(target.clone());
      if entry.entity().is_cal() {
        seen_cal = true;
      } else if seen_cal {
        break;
      }
    }
  }

  pub fn clear_target(&mut self, index: usize) {
    if let Some(entry) = self.entry_at_mut(index) {
      entry.entity_mut().clear_target();
    }
  }

  pub fn set_target(&mut self, index: usize, target: Target) -> QueueResult<()> {
    match self.entry_at_mut(index) {
      Some(entry) => {
        entry.entity_mut().set_target(target);
        Ok(())
      }
      None => Err(QueueError::BadArgument(format!(
        "entry index {index} out of range"
      ))),
    }
  }

  // ----------------------------------------------
  // reporting

  /// Seconds of observation left on the queue.
  pub fn remaining_time(&self) -> u32 {
    self
      .order
      .iter()
      .filter_map(|id| self.entries.get(*id))
      .map(|e| e.duration())
      .sum()
  }

  /// One line per entry for the published contents listing.
  pub fn stringified(&self) -> Vec<String> {
    self
      .order
      .iter()
      .filter_map(|id| self.entries.get(*id))
      .map(|e| {
        let marker = match (e.first_in_msb(), e.last_in_msb(), e.msb().is_some()) {
          (true, true, _) => '*',
          (true, false, _) => '+',
          (false, true, _) => '-',
          (false, false, true) => '|',
          (false, false, false) => ' ',
        };
        let flag = if e.warnings().is_empty() { "" } else { " !" };
        format!(
          "{:<8} {:<10} {} {}{}",
          e.status().to_string(),
          e.entity().project_id().unwrap_or("none"),
          marker,
          e.entity().summary(),
          flag
        )
      })
      .collect()
  }

  // ----------------------------------------------

  /// Keep the highlighted member recorded on its MSB; the cut completion rule
  /// is anchored on it.
  fn sync_reference(&mut self) {
    let Some(id) = self.get_for_observation() else {
      return;
    };
    if let Some(key) = self.entries.get(id).and_then(|e| e.msb()) {
      if let Some(msb) = self.msbs.get_mut(key) {
        msb.set_reference(id);
      }
    }
  }

  #[cfg(test)]
  pub(crate) fn arena_len(&self) -> usize {
    self.entries.len()
  }
}

#[cfg(test)]
mod tests {
  use crate::{
    config::Telescope,
    entity::{ArtifactInfo, ObsEntity, ObsKind},
  };
  use super::*;

  fn entry(duration: u32) -> Entry {
    let mut e = Entry::new(ObsEntity::dummy_science(Telescope::JCMT));
    e.entity_mut().info_mut().duration = duration;
    e
  }

  fn cal_entry() -> Entry {
    let mut info = ArtifactInfo::new("SCUBA-2", Telescope::JCMT, 30);
    info.path = std::path::PathBuf::from("/obs/cal.xml");
    info.kind = ObsKind::Calibration;
    Entry::new(ObsEntity::new_config(info))
  }

  fn targeted(name: &str, az: f64, el: f64) -> Entry {
    let mut e = entry(60);
    e.entity_mut().set_target(Target::new(name, az, el));
    e
  }

  fn msb_batch(n: usize) -> EntryBatch {
    EntryBatch::block(
      (0..n).map(|_| entry(60)).collect(),
      Msb::new(
        Telescope::JCMT,
        Some("M23BU042".to_owned()),
        Some("0b44".to_owned()),
        Some("CO map".to_owned()),
      ),
    )
  }

  fn check_invariants(q: &QueueContents) {
    // Highlight in bounds or absent.
    match q.current_index() {
      Some(i) => assert!(i < q.len(), "current index {i} out of bounds"),
      None => assert!(q.is_empty()),
    }
    // Edge flags and back-references per MSB.
    for i in 0..q.len() {
      let e = q.entry_at(i).unwrap();
      if let Some(key) = e.msb() {
        let msb = q.msb(key).expect("dangling MSB reference");
        let members = msb.members();
        assert!(members.contains(&q.entry_id_at(i).unwrap()));
        let pos = members
          .iter()
          .position(|id| *id == q.entry_id_at(i).unwrap())
          .unwrap();
        assert_eq!(e.first_in_msb(), pos == 0);
        assert_eq!(e.last_in_msb(), pos + 1 == members.len());
      }
    }
  }

  #[test]
  fn load_yields_exact_contents() {
    let mut q = QueueContents::new();
    q.load(msb_batch(3));
    assert_eq!(q.len(), 3);
    assert_eq!(q.current_index(), Some(0));
    check_invariants(&q);

    // Reloading replaces everything.
    q.load(msb_batch(2));
    assert_eq!(q.len(), 2);
    assert_eq!(q.current_index(), Some(0));
    assert_eq!(q.arena_len(), 2);
    check_invariants(&q);
  }

  #[test]
  fn empty_queue_operations_are_harmless() {
    let mut q = QueueContents::new();
    assert_eq!(q.current_index(), None);
    assert_eq!(q.get_for_observation(), None);
    assert_eq!(q.remaining_time(), 0);
    assert!(q.cut(0, 1).is_empty());
    assert!(q.cut_msb(0).is_empty());
    q.propagate_target(0);
    q.clear_target(0);
    assert!(q.stringified().is_empty());
  }

  #[test]
  fn cut_with_nonpositive_count_is_a_no_op() {
    let mut q = QueueContents::new();
    q.load(msb_batch(3));
    q.cut(1, 0);
    q.cut(1, -2);
    assert_eq!(q.len(), 3);
  }

  #[test]
  fn insert_into_empty_queue_is_add_back() {
    let mut q = QueueContents::new();
    q.insert(17, msb_batch(2));
    assert_eq!(q.len(), 2);
    assert_eq!(q.current_index(), Some(0));
    check_invariants(&q);
  }

  #[test]
  fn add_front_shifts_the_highlight() {
    let mut q = QueueContents::new();
    q.load(msb_batch(2));
    q.set_current_index(1);
    q.add_front(EntryBatch::standalone(vec![cal_entry(), cal_entry()]));
    assert_eq!(q.current_index(), Some(3));
    check_invariants(&q);
  }

  #[test]
  fn insert_before_highlight_shifts_it() {
    let mut q = QueueContents::new();
    q.load(msb_batch(4));
    q.set_current_index(2);
    q.insert(1, EntryBatch::standalone(vec![cal_entry()]));
    assert_eq!(q.current_index(), Some(3));
    q.insert(100, EntryBatch::standalone(vec![cal_entry()]));
    assert_eq!(q.current_index(), Some(3));
    assert_eq!(q.len(), 6);
    check_invariants(&q);
  }

  #[test]
  fn insert_then_cut_is_identity() {
    let mut q = QueueContents::new();
    q.load(msb_batch(4));
    let before: Vec<EntryId> = (0..4).map(|i| q.entry_id_at(i).unwrap()).collect();
    q.insert(2, EntryBatch::standalone(vec![cal_entry(), cal_entry()]));
    q.cut(2, 2);
    let after: Vec<EntryId> = (0..4).map(|i| q.entry_id_at(i).unwrap()).collect();
    assert_eq!(before, after);
    check_invariants(&q);
  }

  #[test]
  fn remaining_time_is_the_duration_sum() {
    let mut q = QueueContents::new();
    q.add_back(EntryBatch::standalone(vec![entry(100), entry(250), entry(9)]));
    assert_eq!(q.remaining_time(), 359);
  }

  #[test]
  fn cut_keeps_highlight_on_the_same_entry() {
    let mut q = QueueContents::new();
    q.load(msb_batch(5));
    q.set_current_index(3);
    let highlighted = q.entry_id_at(3).unwrap();
    q.cut(0, 2);
    assert_eq!(q.current_index(), Some(1));
    assert_eq!(q.entry_id_at(1), Some(highlighted));
    check_invariants(&q);
  }

  #[test]
  fn cut_covering_highlight_clamps_it() {
    let mut q = QueueContents::new();
    q.load(msb_batch(5));
    q.set_current_index(4);
    q.cut(3, 2);
    assert_eq!(q.current_index(), Some(2));
    q.clear();
    assert_eq!(q.current_index(), None);
    assert_eq!(q.arena_len(), 0);
  }

  #[test]
  fn cut_updates_last_sent_slot() {
    let mut q = QueueContents::new();
    q.load(msb_batch(5));
    q.set_current_index(3);
    q.mark_sent();
    assert_eq!(q.last_sent_index(), Some(3));

    // Cut after: untouched. Cut before: shifted. Cut across: gone.
    q.cut(4, 1);
    assert_eq!(q.last_sent_index(), Some(3));
    q.cut(0, 1);
    assert_eq!(q.last_sent_index(), Some(2));
    q.cut(2, 1);
    assert_eq!(q.last_sent_index(), None);
  }

  #[test]
  fn cut_full_observed_msb_completes_it() {
    // Scenario: highlight on e3 of a six-entry MSB, block observed, then the
    // whole block is cut.
    let mut q = QueueContents::new();
    q.load(msb_batch(6));
    q.set_current_index(2);
    let key = q.entry_at(2).unwrap().msb().unwrap();
    q.msb_mut(key).unwrap().set_observed(true);

    let completed = q.cut_msb(2);
    assert_eq!(completed, vec![key]);
    assert!(q.is_empty());

    // Again on the now-empty queue: no-op.
    assert!(q.cut_msb(2).is_empty());
  }

  #[test]
  fn cut_of_highlight_and_tail_completes_msb() {
    // Highlight on index 4, then the highlight and everything after it goes.
    let mut q = QueueContents::new();
    q.load(msb_batch(6));
    q.set_current_index(4);
    let key = q.entry_at(4).unwrap().msb().unwrap();
    q.msb_mut(key).unwrap().set_observed(true);

    let completed = q.cut(4, 2);
    assert_eq!(completed, vec![key]);
    assert_eq!(q.len(), 4);
    check_invariants(&q);
  }

  #[test]
  fn cut_msb_takes_interleaved_calibrations() {
    let mut q = QueueContents::new();
    q.load(msb_batch(3));
    // Slip a stand-alone calibration between the members.
    q.insert(1, EntryBatch::standalone(vec![cal_entry()]));
    assert_eq!(q.len(), 4);
    q.cut_msb(0);
    assert!(q.is_empty());
  }

  #[test]
  fn cut_preserves_inflight_entry_and_backref() {
    let mut q = QueueContents::new();
    q.load(msb_batch(3));
    let id = q.entry_id_at(1).unwrap();
    let key = q.entry_at(1).unwrap().msb().unwrap();
    q.get_mut(id).unwrap().set_status(EntryStatus::Sent);

    q.clear();
    assert!(q.is_empty());
    // The in-flight entry survives in the arena with its back-reference.
    assert_eq!(q.get(id).unwrap().msb(), Some(key));
    assert!(q.msb(key).is_some());

    // Send resolves; everything unwinds.
    q.get_mut(id).unwrap().set_status(EntryStatus::Observed);
    q.drop_if_detached(id);
    assert!(q.get(id).is_none());
    assert!(q.msb(key).is_none());
    assert_eq!(q.arena_len(), 0);
  }

  #[test]
  fn replace_checks_kind_and_identity() {
    let mut q = QueueContents::new();
    q.load(msb_batch(2));

    // Wrong entity kind.
    let mut info = ArtifactInfo::new("CGS4", Telescope::UKIRT, 10);
    info.path = std::path::PathBuf::from("/obs/u.xml");
    let seq = Entry::new(ObsEntity::new_sequence(info));
    assert!(matches!(
      q.replace(0, seq),
      Err(QueueError::ReplaceTypeMismatch)
    ));

    // Wrong project.
    let mut wrong = entry(60);
    wrong.entity_mut().info_mut().project_id = Some("M23BU099".to_owned());
    assert!(matches!(q.replace(0, wrong), Err(QueueError::MsbMismatch)));
    assert_eq!(q.len(), 2);
    check_invariants(&q);

    // Matching identity goes through and resets the last-sent slot.
    q.set_current_index(0);
    q.mark_sent();
    let mut ok = entry(60);
    ok.entity_mut().info_mut().project_id = Some("M23BU042".to_owned());
    ok.entity_mut().info_mut().msb_id = Some("0b44".to_owned());
    q.replace(0, ok).unwrap();
    assert_eq!(q.last_sent_index(), None);
    check_invariants(&q);
  }

  #[test]
  fn propagation_runs_through_one_calibration_run() {
    // [A(T), B(cal), C, D, E(U)]: T lands on B and C, D is left alone, E
    // keeps its own target.
    let mut q = QueueContents::new();
    q.add_back(EntryBatch::standalone(vec![
      targeted("T", 1.0, 2.0),
      cal_entry(),
      entry(60),
      entry(60),
      targeted("U", 3.0, 4.0),
    ]));
    q.propagate_target(0);

    let name = |q: &QueueContents, i: usize| {
      q.entry_at(i)
        .unwrap()
        .entity()
        .get_target()
        .map(|t| t.name.clone())
    };
    assert_eq!(name(&q, 1).as_deref(), Some("T"));
    assert_eq!(name(&q, 2).as_deref(), Some("T"));
    assert_eq!(name(&q, 3), None);
    assert_eq!(name(&q, 4).as_deref(), Some("U"));
  }

  #[test]
  fn propagation_stops_at_an_existing_target() {
    let mut q = QueueContents::new();
    q.add_back(EntryBatch::standalone(vec![
      targeted("T", 1.0, 2.0),
      entry(60),
      targeted("U", 3.0, 4.0),
      entry(60),
    ]));
    q.propagate_target(0);
    assert_eq!(
      q.entry_at(1).unwrap().entity().get_target().unwrap().name,
      "T"
    );
    // Nothing leaks past U.
    assert!(q.entry_at(3).unwrap().entity().get_target().is_none());
  }

  #[test]
  fn propagate_then_clear_restores_the_original() {
    let mut q = QueueContents::new();
    q.add_back(EntryBatch::standalone(vec![targeted("T", 1.0, 2.0), entry(60)]));
    q.propagate_target(0);
    q.clear_target(1);
    assert!(q.entry_at(1).unwrap().entity().get_target().is_none());
    assert_eq!(
      q.entry_at(0).unwrap().entity().get_target().unwrap().name,
      "T"
    );
  }

  #[test]
  fn replaceq_keeps_the_numeric_highlight() {
    let mut q = QueueContents::new();
    q.load(msb_batch(4));
    q.set_current_index(2);
    q.replaceq(msb_batch(3));
    assert_eq!(q.len(), 3);
    assert_eq!(q.current_index(), Some(2));
    q.replaceq(msb_batch(1));
    assert_eq!(q.current_index(), Some(0));
  }

  #[test]
  fn stringified_lines_carry_status_project_and_markers() {
    let mut q = QueueContents::new();
    q.load(msb_batch(3));
    q.add_back(EntryBatch::standalone(vec![cal_entry()]));
    let lines = q.stringified();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("QUEUED"));
    assert!(lines[0].contains("M23BU042"));
    assert!(lines[0].contains(" + "));
    assert!(lines[1].contains(" | "));
    assert!(lines[2].contains(" - "));
    assert!(!lines[3].contains('|'));
  }
}
