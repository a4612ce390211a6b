use std::collections::BTreeMap;

use chrono::Utc;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::Serialize;

use crate::{
  entity::RecoverableFault,
  queue::{Entry, QueueContents},
};

/// What a failure-context scan concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupAction {
  /// Report the enriched failure to the operator; the queue stops.
  Report,
  /// The entry was repaired in place and can be prepared again.
  Fixed,
}

/// A recoverable send failure, enriched with enough context for the operator
/// display to offer a sensible fix.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReason {
  pub kind: RecoverableFault,
  pub index: usize,
  pub mode: String,
  pub waveband: String,
  pub instrument: String,
  pub telescope: String,
  pub time: String,
  pub details: FailureDetails,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FailureDetails {
  pub az: Option<f64>,
  pub el: Option<f64>,
  pub ref_name: Option<String>,
  /// Direction of the scan that found the reference: true = ahead of the
  /// failed entry, false = behind it.
  pub following: Option<bool>,
  /// The usable marker found was a calibrator, not a target.
  pub cal: bool,
  /// Summary of the entry the reference came from.
  pub entry: Option<String>,
}

impl FailureReason {
  pub fn for_entry(kind: RecoverableFault, index: usize, entry: &Entry) -> Self {
    let entity = entry.entity();
    FailureReason {
      kind,
      index,
      mode: entity.obs_mode().to_owned(),
      waveband: entity.waveband().to_owned(),
      instrument: entity.instrument().to_owned(),
      telescope: entity.telescope().to_string(),
      time: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
      details: FailureDetails::default(),
    }
  }

  /// Flatten into the FAILURE.DETAILS parameter record.
  pub fn to_record(&self) -> BTreeMap<String, String> {
    let mut r = BTreeMap::new();
    r.insert("REASON".to_owned(), self.kind.as_str().to_owned());
    r.insert("INDEX".to_owned(), self.index.to_string());
    r.insert("MODE".to_owned(), self.mode.clone());
    r.insert("WAVEBAND".to_owned(), self.waveband.clone());
    r.insert("INSTRUMENT".to_owned(), self.instrument.clone());
    r.insert("TELESCOPE".to_owned(), self.telescope.clone());
    r.insert("TIME".to_owned(), self.time.clone());
    if let Some(az) = self.details.az {
      r.insert("AZ".to_owned(), az.to_string());
    }
    if let Some(el) = self.details.el {
      r.insert("EL".to_owned(), el.to_string());
    }
    if let Some(name) = &self.details.ref_name {
      r.insert("REFNAME".to_owned(), name.clone());
    }
    if let Some(following) = self.details.following {
      r.insert(
        "FOLLOWING".to_owned(),
        if following { "1" } else { "0" }.to_owned(),
      );
    }
    if self.details.cal {
      r.insert("CAL".to_owned(), "1".to_owned());
    }
    if let Some(entry) = &self.details.entry {
      r.insert("ENTRY".to_owned(), entry.clone());
    }
    r
  }
}

// ----------------------------------------------
// ----------------------------------------------

/// Enrich a MissingTarget failure: look ahead of the failed entry for a
/// usable target or a calibrator marker, without crossing out of the MSB run
/// (a last-in-MSB entry followed by a first-in-MSB entry is a boundary), and
/// fall back to looking behind within the same MSB.
///
/// The scan is read-only; AZ/EL are taken from the found target as stored,
/// with its use-now interpretation disabled.
pub fn missing_target_context(reason: &mut FailureReason, q: &QueueContents, index: usize) {
  // Forward leg.
  for i in index + 1..q.len() {
    let boundary = q
      .entry_at(i - 1)
      .map(|prev| prev.last_in_msb())
      .unwrap_or(false)
      && q.entry_at(i).map(|e| e.first_in_msb()).unwrap_or(false);
    if boundary {
      break;
    }
    let Some(entry) = q.entry_at(i) else {
      break;
    };
    if let Some(target) = entry.entity().get_target() {
      reason.details.az = Some(target.az);
      reason.details.el = Some(target.el);
      reason.details.ref_name = Some(target.name.clone());
      reason.details.following = Some(true);
      reason.details.entry = Some(entry.entity().summary());
      return;
    }
    if entry.entity().is_cal() {
      reason.details.cal = true;
      reason.details.entry = Some(entry.entity().summary());
      return;
    }
  }

  // Backward leg, confined to the failed entry's own MSB.
  let Some(msb) = q.entry_at(index).and_then(|e| e.msb()) else {
    return;
  };
  for i in (0..index).rev() {
    let Some(entry) = q.entry_at(i) else {
      break;
    };
    if entry.msb() != Some(msb) {
      break;
    }
    if let Some(target) = entry.entity().get_target() {
      reason.details.az = Some(target.az);
      reason.details.el = Some(target.el);
      reason.details.ref_name = Some(target.name.clone());
      reason.details.following = Some(false);
      reason.details.entry = Some(entry.entity().summary());
      return;
    }
  }
}

/// Resolve a NeedNextTarget failure by copying the next scheduled target into
/// the failed entry. MSB boundaries are ignored. A target-less science entry
/// in between defers the fix: that entry has to be repaired first.
pub fn need_next_target_fixup(
  reason: &mut FailureReason,
  q: &mut QueueContents,
  index: usize,
) -> FixupAction {
  let mut found: Option<(usize, crate::target::Target)> = None;
  for i in index + 1..q.len() {
    let Some(entry) = q.entry_at(i) else {
      break;
    };
    if entry.entity().is_missing_target() {
      debug!("need-next-target fix deferred: entry {i} is itself missing a target");
      return FixupAction::Report;
    }
    if let Some(target) = entry.entity().get_target() {
      found = Some((i, target.clone()));
      break;
    }
  }
  match found {
    Some((i, target)) => {
      reason.details.az = Some(target.az);
      reason.details.el = Some(target.el);
      reason.details.ref_name = Some(target.name.clone());
      reason.details.following = Some(true);
      reason.details.entry = q.entry_at(i).map(|e| e.entity().summary());
      if let Some(entry) = q.entry_at_mut(index) {
        entry.entity_mut().set_target(target.clone());
        entry.add_warning(format!("target {} copied from a following entry", target.name));
      }
      FixupAction::Fixed
    }
    None => FixupAction::Report,
  }
}

/// SCUBA-2 setup observations track the source of the following block of
/// entries, so their slew-track allowance has to cover that whole block.
/// Extends the failed entry's slew-track time by the summed slew times of the
/// contiguous run of entries sharing the found target, up to the end of that
/// run's MSB. The pre-adjustment value is stashed on the entry, so running
/// the fixup twice does not accumulate.
pub fn extend_setup_slew(reason: &FailureReason, q: &mut QueueContents, index: usize) {
  if !reason.mode.to_ascii_lowercase().starts_with("setup") {
    return;
  }
  let Some(ref_name) = reason.details.ref_name.clone() else {
    return;
  };
  if reason.details.following != Some(true) {
    return;
  }

  let mut sum: u32 = 0;
  let mut in_run = false;
  for i in index + 1..q.len() {
    let Some(entry) = q.entry_at(i) else {
      break;
    };
    let same = entry
      .entity()
      .get_target()
      .map(|t| t.name == ref_name)
      .unwrap_or(false);
    if same {
      in_run = true;
      sum += entry.entity().slew_track_time().unwrap_or(0);
      if entry.last_in_msb() {
        break;
      }
    } else if in_run {
      break;
    }
  }
  if sum == 0 {
    return;
  }

  if let Some(entry) = q.entry_at_mut(index) {
    let current = entry.entity().slew_track_time().unwrap_or(0);
    entry.stash_original_slew_time(current);
    let base = entry.original_slew_time().unwrap_or(current);
    entry.entity_mut().set_slew_track_time(base + sum);
    entry.add_warning(format!(
      "slew-track time extended to {} s to cover the {} block",
      base + sum,
      ref_name
    ));
    info!(
      "setup slew-track time extended to {} s to cover the {} block",
      base + sum,
      ref_name
    );
  }
}
