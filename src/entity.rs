use std::{fs, path::PathBuf};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::{
  config::Telescope,
  error::{QueueError, QueueResult},
  target::Target,
};

/// Science/calibration classification of one observation artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObsKind {
  Science,
  Calibration,
  /// A calibration not tied to a particular source, usable anywhere.
  GenericCalibration,
}

/// Recoverable conditions `prepare` can report instead of an artifact id.
/// Anything else coming out of `prepare` is irrecoverable and stops the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoverableFault {
  /// The observation needs a target and none is set.
  MissingTarget,
  /// The observation wants the target of the next scheduled observation.
  NeedNextTarget,
}

impl RecoverableFault {
  pub fn as_str(&self) -> &'static str {
    match self {
      RecoverableFault::MissingTarget => "MissingTarget",
      RecoverableFault::NeedNextTarget => "NeedNextTarget",
    }
  }
}

#[derive(Debug)]
pub enum PrepareError {
  Recoverable(RecoverableFault),
  Fatal(QueueError),
}

/// Attributes queried from the opaque observation artifact.
///
/// The instrument-specific file formats are not parsed here; the translator
/// leaves a compact XML attribute document at the path the manifest names,
/// and everything the queue needs to know about the artifact is in it.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactInfo {
  pub path: PathBuf,
  pub instrument: String,
  pub telescope: Telescope,
  /// Estimated duration in seconds.
  pub duration: u32,
  pub obs_mode: String,
  pub project_id: Option<String>,
  pub msb_id: Option<String>,
  pub msb_title: Option<String>,
  pub waveband: String,
  pub kind: ObsKind,
  /// The artifact was translated without a target and expects one before send.
  pub missing_target: bool,
  /// The artifact wants the target of the observation that follows it.
  pub need_next_target: bool,
  /// Seconds budgeted for slewing and tracking, when the translator knows it.
  pub slew_track_time: Option<u32>,
  pub target: Option<Target>,
  pub obs_label: Option<String>,
}

impl ArtifactInfo {
  pub fn new(instrument: impl Into<String>, telescope: Telescope, duration: u32) -> Self {
    ArtifactInfo {
      path: PathBuf::new(),
      instrument: instrument.into(),
      telescope,
      duration,
      obs_mode: String::new(),
      project_id: None,
      msb_id: None,
      msb_title: None,
      waveband: String::new(),
      kind: ObsKind::Science,
      missing_target: false,
      need_next_target: false,
      slew_track_time: None,
      target: None,
      obs_label: None,
    }
  }
}

// -------------------------------------------------------------------------------
// -------------------------------------------------------------------------------

// On-disk attribute document. Example:
//
// <ObsDescription telescope="JCMT" obsmode="raster_pssw" project="M23BU042"
//                 msbid="0b44" msbtitle="CO map" waveband="345GHz"
//                 type="science" missingTarget="false" slewTime="60"
//                 obslabel="obs_1">
//   <target name="3C84" az="1.23" el="0.45"/>
// </ObsDescription>
#[derive(Debug, Deserialize)]
struct ObsDescriptionDoc {
  telescope: String,
  #[serde(rename = "obsmode", default)]
  obs_mode: Option<String>,
  #[serde(default)]
  project: Option<String>,
  #[serde(rename = "msbid", default)]
  msb_id: Option<String>,
  #[serde(rename = "msbtitle", default)]
  msb_title: Option<String>,
  #[serde(default)]
  waveband: Option<String>,
  #[serde(rename = "type", default)]
  obs_type: Option<String>,
  #[serde(rename = "missingTarget", default)]
  missing_target: bool,
  #[serde(rename = "needNextTarget", default)]
  need_next_target: bool,
  #[serde(rename = "slewTime", default)]
  slew_time: Option<u32>,
  #[serde(rename = "obslabel", default)]
  obs_label: Option<String>,
  #[serde(rename = "target", default)]
  target: Option<TargetDoc>,
}

#[derive(Debug, Deserialize)]
struct TargetDoc {
  name: String,
  az: f64,
  el: f64,
  #[serde(default)]
  current_az: bool,
  #[serde(default)]
  following_az: bool,
}

// -------------------------------------------------------------------------------
// -------------------------------------------------------------------------------

/// The pre-translated observation description an Entry dispatches.
///
/// Two concrete kinds exist: instrument sequence files (UKIRT style) and OCS
/// XML configurations (JCMT style). The queue core only uses the shared
/// operations below.
#[derive(Debug, Clone, Serialize)]
pub enum ObsEntity {
  Sequence(ArtifactInfo),
  Config(ArtifactInfo),
}

impl ObsEntity {
  pub fn new_sequence(info: ArtifactInfo) -> Self {
    ObsEntity::Sequence(info)
  }

  pub fn new_config(info: ArtifactInfo) -> Self {
    ObsEntity::Config(info)
  }

  /// Load the artifact named by a manifest entry. The entity kind follows the
  /// telescope: UKIRT artifacts are sequences, JCMT artifacts are OCS
  /// configurations.
  pub fn load(path: PathBuf, instrument: &str, duration: u32) -> QueueResult<ObsEntity> {
    let text = fs::read_to_string(&path)
      .map_err(|e| QueueError::Manifest(format!("cannot read artifact {}: {e}", path.display())))?;
    let doc: ObsDescriptionDoc = serde_xml_rs::from_str(&text)?;

    let telescope: Telescope = doc.telescope.parse()?;
    let kind = match doc.obs_type.as_deref() {
      None | Some("science") => ObsKind::Science,
      Some("cal") => ObsKind::Calibration,
      Some("genericcal") => ObsKind::GenericCalibration,
      Some(other) => {
        return Err(QueueError::Manifest(format!(
          "artifact {} has unknown observation type \"{other}\"",
          path.display()
        )))
      }
    };

    let info = ArtifactInfo {
      path,
      instrument: instrument.to_owned(),
      telescope,
      duration,
      obs_mode: doc.obs_mode.unwrap_or_default(),
      project_id: doc.project,
      msb_id: doc.msb_id,
      msb_title: doc.msb_title,
      waveband: doc.waveband.unwrap_or_default(),
      kind,
      missing_target: doc.missing_target,
      need_next_target: doc.need_next_target,
      slew_track_time: doc.slew_time,
      target: doc.target.map(|t| Target {
        name: t.name,
        az: t.az,
        el: t.el,
        current_az: t.current_az,
        following_az: t.following_az,
      }),
      obs_label: doc.obs_label,
    };

    Ok(match telescope {
      Telescope::UKIRT => ObsEntity::Sequence(info),
      Telescope::JCMT => ObsEntity::Config(info),
    })
  }

  pub fn info(&self) -> &ArtifactInfo {
    match self {
      ObsEntity::Sequence(i) | ObsEntity::Config(i) => i,
    }
  }

  pub fn info_mut(&mut self) -> &mut ArtifactInfo {
    match self {
      ObsEntity::Sequence(i) | ObsEntity::Config(i) => i,
    }
  }

  pub fn same_kind(&self, other: &ObsEntity) -> bool {
    matches!(
      (self, other),
      (ObsEntity::Sequence(_), ObsEntity::Sequence(_)) | (ObsEntity::Config(_), ObsEntity::Config(_))
    )
  }

  /// Validate the entity and produce the artifact identifier to dispatch.
  ///
  /// Recoverable faults come back as `PrepareError::Recoverable`; the backend
  /// enriches them into a FAILURE record. Anything else is fatal.
  pub fn prepare(&mut self) -> Result<String, PrepareError> {
    let info = self.info();
    if info.path.as_os_str().is_empty() {
      return Err(PrepareError::Fatal(QueueError::Backend(
        "observation artifact has no path".to_owned(),
      )));
    }
    if info.target.is_none() && info.kind == ObsKind::Science {
      if info.need_next_target {
        return Err(PrepareError::Recoverable(RecoverableFault::NeedNextTarget));
      }
      if info.missing_target {
        return Err(PrepareError::Recoverable(RecoverableFault::MissingTarget));
      }
    }
    Ok(info.path.to_string_lossy().into_owned())
  }

  pub fn duration(&self) -> u32 {
    self.info().duration
  }

  pub fn project_id(&self) -> Option<&str> {
    self.info().project_id.as_deref()
  }

  pub fn msb_id(&self) -> Option<&str> {
    self.info().msb_id.as_deref()
  }

  pub fn msb_title(&self) -> Option<&str> {
    self.info().msb_title.as_deref()
  }

  pub fn instrument(&self) -> &str {
    &self.info().instrument
  }

  pub fn telescope(&self) -> Telescope {
    self.info().telescope
  }

  pub fn obs_mode(&self) -> &str {
    &self.info().obs_mode
  }

  pub fn waveband(&self) -> &str {
    &self.info().waveband
  }

  pub fn obs_label(&self) -> Option<&str> {
    self.info().obs_label.as_deref()
  }

  pub fn get_target(&self) -> Option<&Target> {
    self.info().target.as_ref()
  }

  pub fn set_target(&mut self, target: Target) {
    self.info_mut().target = Some(target);
  }

  pub fn clear_target(&mut self) {
    self.info_mut().target = None;
  }

  pub fn is_cal(&self) -> bool {
    matches!(
      self.info().kind,
      ObsKind::Calibration | ObsKind::GenericCalibration
    )
  }

  pub fn is_generic_cal(&self) -> bool {
    self.info().kind == ObsKind::GenericCalibration
  }

  pub fn is_science_obs(&self) -> bool {
    self.info().kind == ObsKind::Science
  }

  pub fn is_missing_target(&self) -> bool {
    self.info().missing_target && self.info().target.is_none()
  }

  pub fn needs_next_target(&self) -> bool {
    self.info().need_next_target
  }

  pub fn slew_track_time(&self) -> Option<u32> {
    self.info().slew_track_time
  }

  pub fn set_slew_track_time(&mut self, seconds: u32) {
    self.info_mut().slew_track_time = Some(seconds);
  }

  pub fn target_is_current_az(&self) -> bool {
    self.info().target.as_ref().map(|t| t.current_az).unwrap_or(false)
  }

  pub fn target_is_following_az(&self) -> bool {
    self
      .info()
      .target
      .as_ref()
      .map(|t| t.following_az)
      .unwrap_or(false)
  }

  /// One-line human summary, used for CURRENT and the queue contents listing.
  pub fn summary(&self) -> String {
    let info = self.info();
    let target = info
      .target
      .as_ref()
      .map(|t| t.name.as_str())
      .unwrap_or("--");
    format!(
      "{} {} {} {} {}s",
      info.instrument,
      info.waveband,
      info.obs_mode,
      target,
      info.duration
    )
  }

  /// Portable structured dump of the entity, the GET_ENTRY payload.
  pub fn to_json(&self) -> QueueResult<serde_json::Value> {
    Ok(serde_json::to_value(self)?)
  }

  /// Minimal science entity used by tests across the crate.
  #[cfg(test)]
  pub(crate) fn dummy_science(telescope: Telescope) -> ObsEntity {
    let mut info = ArtifactInfo::new("ACSIS", telescope, 120);
    info.path = PathBuf::from("/obs/a.xml");
    info.obs_mode = "raster_pssw".to_owned();
    info.waveband = "345GHz".to_owned();
    match telescope {
      Telescope::UKIRT => ObsEntity::new_sequence(info),
      Telescope::JCMT => ObsEntity::new_config(info),
    }
  }
}
