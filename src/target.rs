use serde::{Deserialize, Serialize};

use crate::error::QueueResult;

/// A pointing for one observation.
///
/// Coordinate transformation is the telescope control system's business; the
/// queue only carries the reference name and the AZ/EL the translator (or an
/// operator MODIFY) supplied. The two flags describe how the entry wants the
/// coordinate interpreted rather than a computed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
  pub name: String,
  pub az: f64,
  pub el: f64,
  /// Track whatever azimuth the telescope is at now ("use-now" semantics).
  #[serde(default)]
  pub current_az: bool,
  /// Follow the azimuth of the next scheduled target.
  #[serde(default)]
  pub following_az: bool,
}

impl Target {
  pub fn new(name: impl Into<String>, az: f64, el: f64) -> Self {
    Target {
      name: name.into(),
      az,
      el,
      current_az: false,
      following_az: false,
    }
  }

  /// Parse an operator-supplied TCS target description, e.g.
  /// `<tcsTarget name="3C84" az="1.23" el="0.45"/>`.
  pub fn from_tcs_xml(xml: &str) -> QueueResult<Target> {
    let t: Target = serde_xml_rs::from_str(xml)?;
    Ok(t)
  }

  pub fn az_el(&self) -> (f64, f64) {
    (self.az, self.el)
  }
}
