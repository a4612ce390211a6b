//! End-to-end scenarios driving a spawned queue server over its handle, with
//! the simulated instrument link answering every dispatch.

use std::{
  path::{Path, PathBuf},
  sync::{Arc, Mutex},
};

use anyhow::Result;
use obsqueue::{
  backend::{Backend, InstrumentTask, SimLink, SimReply},
  config::{ServerConfig, Telescope},
  db::{ProjectDb, SimDb},
  error::{QueueError, QueueResult},
  server::{Command, CompletionRequest, ParamValue, QueueServer, ServerHandle},
};

// ----------------------------------------------
// fixtures

struct Artifact<'a> {
  name: &'a str,
  duration: u32,
  project: Option<&'a str>,
  target: Option<(&'a str, f64, f64)>,
  missing_target: bool,
}

impl<'a> Artifact<'a> {
  fn new(name: &'a str, duration: u32) -> Self {
    Artifact {
      name,
      duration,
      project: Some("M23BU042"),
      target: None,
      missing_target: false,
    }
  }

  fn with_target(mut self, name: &'a str, az: f64, el: f64) -> Self {
    self.target = Some((name, az, el));
    self
  }

  fn missing_target(mut self) -> Self {
    self.missing_target = true;
    self
  }
}

/// Write the attribute documents plus a manifest naming them all, returning
/// the manifest path.
fn write_manifest(dir: &Path, artifacts: &[Artifact<'_>]) -> PathBuf {
  let mut entries = String::new();
  for a in artifacts {
    let path = dir.join(format!("{}.xml", a.name));
    let target = match a.target {
      Some((name, az, el)) => format!(r#"<target name="{name}" az="{az}" el="{el}"/>"#),
      None => String::new(),
    };
    let project = match a.project {
      Some(p) => format!(r#"project="{p}" msbid="0b44" msbtitle="CO map""#),
      None => String::new(),
    };
    std::fs::write(
      &path,
      format!(
        r#"<ObsDescription telescope="JCMT" obsmode="raster_pssw" waveband="345GHz"
                            type="science" missingTarget="{}" obslabel="{}" {project}>
             {target}
           </ObsDescription>"#,
        a.missing_target, a.name,
      ),
    )
    .unwrap();
    entries.push_str(&format!(
      r#"  <Entry totalDuration="{}" instrument="ACSIS">{}</Entry>{}"#,
      a.duration,
      path.display(),
      '\n'
    ));
  }
  let manifest = dir.join("qentries.xml");
  std::fs::write(
    &manifest,
    format!(
      "<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?>\n<QueueEntries telescope=\"JCMT\">\n{entries}</QueueEntries>\n"
    ),
  )
  .unwrap();
  manifest
}

#[derive(Clone, Default)]
struct SharedDb {
  done: Arc<Mutex<Vec<(String, String, Option<String>)>>>,
  rejected: Arc<Mutex<Vec<String>>>,
  suspended: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

impl ProjectDb for SharedDb {
  fn msb_done(
    &mut self,
    project: &str,
    msb_id: &str,
    user: Option<&str>,
    _reason: Option<&str>,
  ) -> QueueResult<()> {
    self.done.lock().unwrap().push((
      project.to_owned(),
      msb_id.to_owned(),
      user.map(str::to_owned),
    ));
    Ok(())
  }

  fn msb_reject(
    &mut self,
    project: &str,
    _msb_id: &str,
    _user: Option<&str>,
    _reason: Option<&str>,
  ) -> QueueResult<()> {
    self.rejected.lock().unwrap().push(project.to_owned());
    Ok(())
  }

  fn msb_suspend(
    &mut self,
    project: &str,
    _msb_id: &str,
    obs_label: Option<&str>,
  ) -> QueueResult<()> {
    self
      .suspended
      .lock()
      .unwrap()
      .push((project.to_owned(), obs_label.map(str::to_owned)));
    Ok(())
  }
}

fn spawn_server(config: ServerConfig, reply: SimReply, db: Box<dyn ProjectDb>) -> ServerHandle {
  QueueServer::spawn(
    config,
    move |events| {
      Box::new(InstrumentTask::new(Box::new(
        SimLink::new(events).with_reply(reply),
      ))) as Box<dyn Backend>
    },
    db,
  )
  .unwrap()
}

fn test_config(dir: &Path) -> ServerConfig {
  let mut config = ServerConfig::new(Telescope::JCMT);
  // The tests drive every poll by hand.
  config.poll_interval = std::time::Duration::from_secs(3600);
  config.pending_file = dir.join("pending.json");
  config
}

fn param_int(handle: &ServerHandle, name: &str) -> i32 {
  match handle.params().unwrap().get(name) {
    Some(ParamValue::Int(i)) => *i,
    other => panic!("{name} is not an Int: {other:?}"),
  }
}

fn param_str(handle: &ServerHandle, name: &str) -> String {
  match handle.params().unwrap().get(name) {
    Some(ParamValue::Str(s)) => s.clone(),
    other => panic!("{name} is not a Str: {other:?}"),
  }
}

fn contents(handle: &ServerHandle) -> Vec<String> {
  match handle.params().unwrap().get("Queue.Contents") {
    Some(ParamValue::StrList(lines)) => lines.clone(),
    other => panic!("Queue.Contents is not a StrList: {other:?}"),
  }
}

fn completion_keys(handle: &ServerHandle) -> Vec<String> {
  handle
    .params()
    .unwrap()
    .keys()
    .filter_map(|k| k.strip_prefix("MSBCOMPLETED.").map(str::to_owned))
    .collect()
}

// ----------------------------------------------
// scenarios

#[test_log::test]
fn basic_dispatch_runs_the_block_to_completion() -> Result<()> {
  let dir = tempfile::tempdir()?;
  let manifest = write_manifest(
    dir.path(),
    &[
      Artifact::new("e1", 60).with_target("A", 1.0, 1.0),
      Artifact::new("e2", 60).with_target("B", 1.0, 1.0),
      Artifact::new("e3", 60).with_target("C", 1.0, 1.0),
    ],
  );
  let handle = spawn_server(test_config(dir.path()), SimReply::Success, Box::new(SimDb));

  handle.load(&manifest)?;
  assert_eq!(param_str(&handle, "STATUS"), "Stopped");
  assert_eq!(param_int(&handle, "INDEX"), 0);
  assert_eq!(param_int(&handle, "TIMEONQUEUE"), 3);
  assert_eq!(param_str(&handle, "CURRENT"), "None");

  // START dispatches e1. Its completion is processed before the next command
  // is served, so the snapshot below sees the highlight already advanced.
  handle.start()?;
  assert_eq!(param_int(&handle, "INDEX"), 1);
  assert_eq!(param_str(&handle, "STATUS"), "Running");
  let lines = contents(&handle);
  assert!(lines[0].starts_with("OBSERVED"), "got {:?}", lines[0]);
  assert!(lines[1].starts_with("QUEUED"), "got {:?}", lines[1]);
  let current = param_str(&handle, "CURRENT");
  assert!(current.contains("ACSIS"), "CURRENT = {current:?}");
  assert!(completion_keys(&handle).is_empty());

  // Each poll dispatches the next entry; the block runs through.
  handle.poll_now()?;
  handle.poll_now()?;
  handle.poll_now()?;
  assert_eq!(param_str(&handle, "STATUS"), "Stopped");
  assert_eq!(param_int(&handle, "ALERT"), 2);
  assert_eq!(param_int(&handle, "INDEX"), 0);

  // Exactly one accept prompt, carrying the block's identity.
  let keys = completion_keys(&handle);
  assert_eq!(keys.len(), 1);
  match handle.params()?.get(&format!("MSBCOMPLETED.{}", keys[0])) {
    Some(ParamValue::Record(r)) => {
      assert_eq!(r["PROJECTID"], "M23BU042");
      assert_eq!(r["MSBID"], "0b44");
      assert_eq!(r["QUEUEID"], "1");
      assert!(r["MSBTID"].starts_with("JCMT_"));
    }
    other => panic!("missing MSBCOMPLETED record: {other:?}"),
  }
  assert!(dir.path().join("pending.json").exists());

  handle.exit()?;
  Ok(())
}

#[test]
fn accept_flow_reports_done_and_retires_the_block() -> Result<()> {
  let dir = tempfile::tempdir()?;
  let manifest = write_manifest(
    dir.path(),
    &[Artifact::new("e1", 60).with_target("A", 1.0, 1.0)],
  );
  let db = SharedDb::default();
  let handle = spawn_server(
    test_config(dir.path()),
    SimReply::Success,
    Box::new(db.clone()),
  );

  handle.load(&manifest)?;
  handle.start()?;
  handle.poll_now()?;
  let keys = completion_keys(&handle);
  assert_eq!(keys.len(), 1);

  handle.command(Command::MsbComplete {
    requests: vec![CompletionRequest {
      key: keys[0].clone(),
      decision: 1,
      user: Some("u1".to_owned()),
      reason: None,
    }],
  })?;

  let done = db.done.lock().unwrap().clone();
  assert_eq!(
    done,
    vec![(
      "M23BU042".to_owned(),
      "0b44".to_owned(),
      Some("u1".to_owned())
    )]
  );
  assert!(completion_keys(&handle).is_empty());
  assert!(!dir.path().join("pending.json").exists());
  assert!(contents(&handle).is_empty());
  assert_eq!(param_int(&handle, "TIMEONQUEUE"), 0);

  handle.exit()?;
  Ok(())
}

#[test_log::test]
fn missing_target_failure_stops_the_queue_with_details() -> Result<()> {
  let dir = tempfile::tempdir()?;
  let manifest = write_manifest(
    dir.path(),
    &[
      Artifact::new("e1", 60).with_target("A", 9.0, 9.0),
      Artifact::new("e2", 60).missing_target(),
      Artifact::new("e3", 60).with_target("T", 1.23, 0.45),
    ],
  );
  let handle = spawn_server(test_config(dir.path()), SimReply::Success, Box::new(SimDb));

  handle.load(&manifest)?;
  handle.start()?;
  handle.poll_now()?; // e1 done, e2 fails to prepare

  assert_eq!(param_str(&handle, "STATUS"), "Stopped");
  assert_eq!(param_int(&handle, "ALERT"), 1);
  match handle.params()?.get("FAILURE.DETAILS") {
    Some(ParamValue::Record(r)) => {
      assert_eq!(r["REASON"], "MissingTarget");
      assert_eq!(r["INDEX"], "1");
      assert_eq!(r["AZ"], "1.23");
      assert_eq!(r["EL"], "0.45");
      assert_eq!(r["REFNAME"], "T");
      assert_eq!(r["FOLLOWING"], "1");
      assert_eq!(r["INSTRUMENT"], "ACSIS");
      assert_eq!(r["TELESCOPE"], "JCMT");
    }
    other => panic!("missing FAILURE.DETAILS: {other:?}"),
  }

  // MODIFY supplies the target, clears the failure and auto-starts; the
  // block then runs to completion.
  handle.command(Command::Modify {
    index: 1,
    target_xml: r#"<tcsTarget name="T" az="1.23" el="0.45"/>"#.to_owned(),
    propagate: false,
    no_auto_start: false,
  })?;
  assert!(handle.params()?.get("FAILURE.DETAILS").is_none());
  handle.poll_now()?;
  handle.poll_now()?;
  assert_eq!(param_int(&handle, "ALERT"), 2);
  assert_eq!(completion_keys(&handle).len(), 1);

  handle.exit()?;
  Ok(())
}

#[test]
fn pending_accepts_survive_a_server_restart() -> Result<()> {
  let dir = tempfile::tempdir()?;
  let manifest = write_manifest(
    dir.path(),
    &[Artifact::new("e1", 60).with_target("A", 1.0, 1.0)],
  );

  let key = {
    let handle = spawn_server(test_config(dir.path()), SimReply::Success, Box::new(SimDb));
    handle.load(&manifest)?;
    handle.start()?;
    handle.poll_now()?;
    let keys = completion_keys(&handle);
    assert_eq!(keys.len(), 1);
    handle.exit()?;
    keys.into_iter().next().unwrap()
  };

  // A fresh server on the same pending file republishes the record.
  let handle = spawn_server(test_config(dir.path()), SimReply::Success, Box::new(SimDb));
  let keys = completion_keys(&handle);
  assert_eq!(keys, vec![key.clone()]);
  match handle.params()?.get(&format!("MSBCOMPLETED.{key}")) {
    Some(ParamValue::Record(r)) => {
      assert_eq!(r["PROJECTID"], "M23BU042");
      assert_eq!(r["MSBID"], "0b44");
    }
    other => panic!("record lost across restart: {other:?}"),
  }

  // And it can still be decided.
  handle.command(Command::MsbComplete {
    requests: vec![CompletionRequest {
      key,
      decision: -1,
      user: None,
      reason: None,
    }],
  })?;
  assert!(completion_keys(&handle).is_empty());
  assert!(!dir.path().join("pending.json").exists());

  handle.exit()?;
  Ok(())
}

#[test]
fn external_index_write_snaps_the_highlight_and_stops() -> Result<()> {
  let dir = tempfile::tempdir()?;
  let manifest = write_manifest(
    dir.path(),
    &[
      Artifact::new("e1", 60).with_target("A", 1.0, 1.0),
      Artifact::new("e2", 60).with_target("B", 1.0, 1.0),
      Artifact::new("e3", 60).with_target("C", 1.0, 1.0),
    ],
  );
  // A silent link keeps the send in flight, so the queue stays Running.
  let handle = spawn_server(test_config(dir.path()), SimReply::Silent, Box::new(SimDb));

  handle.load(&manifest)?;
  handle.start()?;
  assert_eq!(param_str(&handle, "STATUS"), "Running");

  handle.command(Command::SetIndex { index: 2 })?;
  handle.poll_now()?;
  assert_eq!(param_int(&handle, "INDEX"), 2);
  assert_eq!(param_str(&handle, "STATUS"), "Stopped");

  handle.exit()?;
  Ok(())
}

#[test]
fn add_back_is_refused_while_the_queue_is_loaded() -> Result<()> {
  let dir = tempfile::tempdir()?;
  let manifest = write_manifest(
    dir.path(),
    &[
      Artifact::new("e1", 1800).with_target("A", 1.0, 1.0),
      Artifact::new("e2", 1800).with_target("B", 1.0, 1.0),
    ],
  );
  let handle = spawn_server(test_config(dir.path()), SimReply::Silent, Box::new(SimDb));

  handle.load(&manifest)?;
  let refused = handle.command(Command::AddBack {
    manifest: manifest.clone(),
    iscal: false,
  });
  assert!(matches!(refused, Err(QueueError::TooMuchOnQueue { .. })));
  assert_eq!(contents(&handle).len(), 2);

  // With the highlight on the last entry the same add goes through.
  handle.command(Command::SetIndex { index: 1 })?;
  handle.poll_now()?;
  handle.command(Command::AddBack {
    manifest,
    iscal: false,
  })?;
  assert_eq!(contents(&handle).len(), 4);

  handle.exit()?;
  Ok(())
}

#[test]
fn calibration_loads_are_not_grouped() -> Result<()> {
  let dir = tempfile::tempdir()?;
  let manifest = write_manifest(
    dir.path(),
    &[
      Artifact::new("c1", 30).with_target("A", 1.0, 1.0),
      Artifact::new("c2", 30).with_target("B", 1.0, 1.0),
    ],
  );
  let handle = spawn_server(test_config(dir.path()), SimReply::Silent, Box::new(SimDb));

  handle.command(Command::Load {
    manifest,
    iscal: true,
  })?;
  // Cutting "the MSB" of a stand-alone entry cuts that entry alone.
  handle.command(Command::CutMsb { index: Some(0) })?;
  assert_eq!(contents(&handle).len(), 1);

  handle.exit()?;
  Ok(())
}

#[test]
fn suspend_reports_and_cuts_without_a_prompt() -> Result<()> {
  let dir = tempfile::tempdir()?;
  let manifest = write_manifest(
    dir.path(),
    &[
      Artifact::new("e1", 60).with_target("A", 1.0, 1.0),
      Artifact::new("e2", 60).with_target("B", 1.0, 1.0),
      Artifact::new("e3", 60).with_target("C", 1.0, 1.0),
    ],
  );
  let db = SharedDb::default();
  let handle = spawn_server(
    test_config(dir.path()),
    SimReply::Success,
    Box::new(db.clone()),
  );

  handle.load(&manifest)?;
  handle.start()?;
  handle.poll_now()?; // e1 observed, e2 dispatched

  // By now e1 and e2 are observed and the highlight is on e3: the block is
  // part-way through and carries the observed flag.
  handle.command(Command::SuspendMsb)?;
  let suspended = db.suspended.lock().unwrap().clone();
  assert_eq!(
    suspended,
    vec![("M23BU042".to_owned(), Some("e3".to_owned()))]
  );
  // The block is gone and, despite having been observed, prompts nothing.
  assert!(contents(&handle).is_empty());
  assert!(completion_keys(&handle).is_empty());

  handle.exit()?;
  Ok(())
}

#[test]
fn get_entry_returns_a_structured_document() -> Result<()> {
  let dir = tempfile::tempdir()?;
  let manifest = write_manifest(
    dir.path(),
    &[Artifact::new("e1", 60).with_target("A", 1.0, 1.0)],
  );
  let handle = spawn_server(test_config(dir.path()), SimReply::Silent, Box::new(SimDb));

  handle.load(&manifest)?;
  let doc = handle.get_entry(0)?;
  assert_eq!(doc["Config"]["instrument"], "ACSIS");
  assert_eq!(doc["Config"]["project_id"], "M23BU042");
  assert_eq!(doc["Config"]["target"]["name"], "A");

  assert!(matches!(
    handle.get_entry(7),
    Err(QueueError::BadArgument(_))
  ));

  handle.exit()?;
  Ok(())
}

#[test]
fn backend_error_marks_the_entry_and_raises_the_alert() -> Result<()> {
  let dir = tempfile::tempdir()?;
  let manifest = write_manifest(
    dir.path(),
    &[
      Artifact::new("e1", 60).with_target("A", 1.0, 1.0),
      Artifact::new("e2", 60).with_target("B", 1.0, 1.0),
    ],
  );
  let handle = spawn_server(
    test_config(dir.path()),
    SimReply::Error {
      status: 42,
      message: "correlator fault".to_owned(),
    },
    Box::new(SimDb),
  );

  handle.load(&manifest)?;
  handle.start()?;
  handle.poll_now()?;

  assert_eq!(param_str(&handle, "STATUS"), "Stopped");
  assert_eq!(param_int(&handle, "ALERT"), 1);
  let lines = contents(&handle);
  assert!(lines[0].starts_with("ERROR"), "got {:?}", lines[0]);
  // The highlight did not advance.
  assert_eq!(param_int(&handle, "INDEX"), 0);

  handle.exit()?;
  Ok(())
}
