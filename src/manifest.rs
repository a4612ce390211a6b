use std::{
  fs,
  io::Write,
  path::{Path, PathBuf},
};

use chrono::Utc;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::Deserialize;

use crate::{
  config::Telescope,
  entity::ObsEntity,
  error::{QueueError, QueueResult},
  queue::Entry,
};

/// One `<Entry>` element of a QueueEntries manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
  /// Estimated total duration in seconds.
  pub duration: u32,
  pub instrument: String,
  /// Absolute path of the observation artifact.
  pub path: PathBuf,
}

/// A parsed entry manifest, the LOAD/ADD_* payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
  pub telescope: Telescope,
  pub entries: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct QueueEntriesDoc {
  telescope: String,
  #[serde(rename = "Entry", default)]
  entries: Vec<EntryElem>,
}

#[derive(Debug, Deserialize)]
struct EntryElem {
  #[serde(rename = "totalDuration")]
  total_duration: u32,
  instrument: String,
  #[serde(rename = "$value")]
  path: String,
}

/// Parse a QueueEntries manifest file.
pub fn read_manifest(path: &Path) -> QueueResult<Manifest> {
  let text = fs::read_to_string(path)
    .map_err(|e| QueueError::Manifest(format!("cannot read {}: {e}", path.display())))?;
  parse_manifest(&text)
}

pub fn parse_manifest(text: &str) -> QueueResult<Manifest> {
  let doc: QueueEntriesDoc = serde_xml_rs::from_str(text)?;
  let telescope: Telescope = doc.telescope.parse()?;
  let entries = doc
    .entries
    .into_iter()
    .map(|e| {
      let path = PathBuf::from(e.path.trim());
      if path.as_os_str().is_empty() {
        return Err(QueueError::Manifest("manifest entry has no artifact path".to_owned()));
      }
      Ok(ManifestEntry {
        duration: e.total_duration,
        instrument: e.instrument,
        path,
      })
    })
    .collect::<QueueResult<Vec<_>>>()?;
  Ok(Manifest { telescope, entries })
}

/// Load the artifacts a manifest names and wrap them as queue entries.
///
/// A manifest whose artifacts disagree with its own root telescope attribute
/// is rejected whole; the queue is left untouched by the caller.
pub fn load_entries(manifest: &Manifest) -> QueueResult<Vec<Entry>> {
  let mut out = Vec::with_capacity(manifest.entries.len());
  for me in &manifest.entries {
    let entity = ObsEntity::load(me.path.clone(), &me.instrument, me.duration)?;
    if entity.telescope() != manifest.telescope {
      return Err(QueueError::TelescopeMismatch {
        manifest: manifest.telescope.to_string(),
        artifact: entity.telescope().to_string(),
      });
    }
    out.push(Entry::new(entity));
  }
  Ok(out)
}

/// Write a manifest into `dir` under a timestamp-unique name
/// (`qentries_<sec>_<ms>.xml`) and return the full path.
pub fn write_manifest(
  dir: &Path,
  telescope: Telescope,
  entries: &[ManifestEntry],
) -> QueueResult<PathBuf> {
  let now = Utc::now();
  let name = format!(
    "qentries_{}_{:03}.xml",
    now.timestamp(),
    now.timestamp_subsec_millis()
  );
  let path = dir.join(name);

  let mut f = fs::File::create(&path)?;
  writeln!(f, r#"<?xml version="1.0" encoding="ISO-8859-1"?>"#)?;
  writeln!(f, r#"<QueueEntries telescope="{telescope}">"#)?;
  for e in entries {
    writeln!(
      f,
      r#"  <Entry totalDuration="{}" instrument="{}">{}</Entry>"#,
      e.duration,
      xml_escape(&e.instrument),
      xml_escape(&e.path.to_string_lossy()),
    )?;
  }
  writeln!(f, "</QueueEntries>")?;
  Ok(path)
}

fn xml_escape(s: &str) -> String {
  s.replace('&', "&amp;")
    .replace('<', "&lt;")
    .replace('>', "&gt;")
    .replace('"', "&quot;")
}
