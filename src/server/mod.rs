//! The queue server: one thread owning the queue, the backend flags and the
//! published parameters, multiplexing the operator command channel, the
//! backend reply channel and the recurring poll on a single mio poll.

pub(crate) mod command;
pub(crate) mod completion;
pub(crate) mod params;

use std::{
  collections::BTreeMap,
  path::Path,
  sync::mpsc,
  thread,
  time::Duration,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio::{Events, Poll, PollOpt, Ready, Token};
use mio_extras::{channel as mio_channel, timer, timer::Timer};

use crate::{
  backend::{Backend, BackendEvent},
  config::ServerConfig,
  db::ProjectDb,
  error::{QueueError, QueueResult},
  manifest,
  queue::{EntryBatch, EntryStatus, Msb, MsbKey, QueueContents},
  target::Target,
};
pub use command::{Alert, Command, CommandReply, CommandRequest, CommandResponse, CompletionRequest};
pub use completion::{AcceptDecision, CompletionTracker, PendingAccept};
pub use params::{ParamPublisher, ParamUpdate, ParamValue};

const COMMAND_READY: Token = Token(0);
const BACKEND_READY: Token = Token(1);
const POLL_TIMER: Token = Token(2);

#[derive(Debug, PartialEq, Eq)]
enum Flow {
  Continue,
  Exit,
}

/// Client-side handle: sends commands into the loop and waits for replies.
/// Dropping the handle asks the server to exit.
pub struct ServerHandle {
  cmd_tx: mio_channel::Sender<CommandRequest>,
  thread: Option<thread::JoinHandle<()>>,
}

impl ServerHandle {
  pub fn command(&self, command: Command) -> CommandReply {
    let (tx, rx) = mpsc::channel();
    self
      .cmd_tx
      .send(CommandRequest { command, reply: tx })
      .map_err(|_| QueueError::ServerGone)?;
    rx.recv_timeout(Duration::from_secs(30))
      .map_err(|_| QueueError::ServerGone)?
  }

  fn done(&self, command: Command) -> QueueResult<()> {
    self.command(command).map(|_| ())
  }

  pub fn poll_now(&self) -> QueueResult<()> {
    self.done(Command::Poll)
  }

  pub fn start(&self) -> QueueResult<()> {
    self.done(Command::Start)
  }

  pub fn stop(&self) -> QueueResult<()> {
    self.done(Command::Stop { alert: None })
  }

  pub fn load(&self, manifest: &Path) -> QueueResult<()> {
    self.done(Command::Load {
      manifest: manifest.to_path_buf(),
      iscal: false,
    })
  }

  pub fn subscribe(&self) -> QueueResult<mio_channel::Receiver<ParamUpdate>> {
    match self.command(Command::Subscribe)? {
      CommandResponse::Subscribed(rx) => Ok(rx),
      _ => Err(QueueError::ServerGone),
    }
  }

  pub fn params(&self) -> QueueResult<BTreeMap<String, ParamValue>> {
    match self.command(Command::GetParams)? {
      CommandResponse::Params(p) => Ok(p),
      _ => Err(QueueError::ServerGone),
    }
  }

  pub fn get_entry(&self, index: usize) -> QueueResult<serde_json::Value> {
    match self.command(Command::GetEntry { index })? {
      CommandResponse::Entity(v) => Ok(v),
      _ => Err(QueueError::ServerGone),
    }
  }

  /// Clean shutdown: clears the queue, stops the loop and joins the thread.
  pub fn exit(mut self) -> QueueResult<()> {
    self.done(Command::Exit)?;
    if let Some(t) = self.thread.take() {
      let _ = t.join();
    }
    Ok(())
  }
}

impl Drop for ServerHandle {
  fn drop(&mut self) {
    if self.thread.is_some() {
      let (tx, _rx) = mpsc::channel();
      let _ = self.cmd_tx.send(CommandRequest {
        command: Command::Exit,
        reply: tx,
      });
    }
  }
}

/// The server state, owned entirely by the loop thread.
pub struct QueueServer {
  config: ServerConfig,
  poll: Poll,
  queue: QueueContents,
  backend: Box<dyn Backend>,
  db: Box<dyn ProjectDb>,
  params: ParamPublisher,
  completion: CompletionTracker,
  cmd_rx: mio_channel::Receiver<CommandRequest>,
  backend_rx: mio_channel::Receiver<BackendEvent>,
  timer: Timer<()>,
  pending_tick: Option<timer::Timeout>,
  queue_id_counter: u32,
  alert: Alert,
  /// INDEX as last published by us.
  known_index: Option<i32>,
  /// INDEX as last written by a client, not yet reconciled.
  external_index: Option<i32>,
  current_summary: String,
  poll_kicked: bool,
}

impl QueueServer {
  /// Start a server thread. `make_backend` receives the sender the backend's
  /// instrument link must reply through.
  pub fn spawn<F>(
    config: ServerConfig,
    make_backend: F,
    db: Box<dyn ProjectDb>,
  ) -> QueueResult<ServerHandle>
  where
    F: FnOnce(mio_channel::Sender<BackendEvent>) -> Box<dyn Backend> + Send + 'static,
  {
    let (cmd_tx, cmd_rx) = mio_channel::channel();
    let thread = thread::Builder::new()
      .name("obsqueue-server".to_owned())
      .spawn(move || {
        let (backend_tx, backend_rx) = mio_channel::channel();
        let backend = make_backend(backend_tx);
        match QueueServer::new(config, backend, db, cmd_rx, backend_rx) {
          Ok(mut server) => {
            if let Err(e) = server.run() {
              error!("queue server loop failed: {e}");
            }
          }
          Err(e) => error!("queue server failed to start: {e}"),
        }
      })?;
    Ok(ServerHandle {
      cmd_tx,
      thread: Some(thread),
    })
  }

  fn new(
    config: ServerConfig,
    backend: Box<dyn Backend>,
    db: Box<dyn ProjectDb>,
    cmd_rx: mio_channel::Receiver<CommandRequest>,
    backend_rx: mio_channel::Receiver<BackendEvent>,
  ) -> QueueResult<Self> {
    let poll = Poll::new()?;
    let timer = timer::Builder::default().build();
    poll.register(&cmd_rx, COMMAND_READY, Ready::readable(), PollOpt::edge())?;
    poll.register(&backend_rx, BACKEND_READY, Ready::readable(), PollOpt::edge())?;
    poll.register(&timer, POLL_TIMER, Ready::readable(), PollOpt::edge())?;

    let params = ParamPublisher::new(config.contents_width, config.contents_slots);
    let completion = CompletionTracker::open(config.pending_file.clone(), config.no_complete);

    Ok(QueueServer {
      config,
      poll,
      queue: QueueContents::new(),
      backend,
      db,
      params,
      completion,
      cmd_rx,
      backend_rx,
      timer,
      pending_tick: None,
      queue_id_counter: 0,
      alert: Alert::None,
      known_index: None,
      external_index: None,
      current_summary: "None".to_owned(),
      poll_kicked: false,
    })
  }

  fn run(&mut self) -> QueueResult<()> {
    info!("queue server for {} up", self.config.telescope);
    self.completion.republish(&mut self.params);
    self.publish_core();
    self.arm_poll_timer();

    let mut events = Events::with_capacity(64);
    loop {
      self.poll.poll(&mut events, None)?;
      let mut timer_fired = false;
      let mut commands_ready = false;
      for event in events.iter() {
        match event.token() {
          COMMAND_READY => commands_ready = true,
          POLL_TIMER => timer_fired = true,
          BACKEND_READY => {}
          _ => {}
        }
      }

      // Completion callbacks always run before anything else queued behind
      // them; no callback ever interleaves with a command.
      self.drain_backend_events();

      if timer_fired {
        while self.timer.poll().is_some() {}
        self.pending_tick = None;
        self.handle_poll(true);
      }

      if commands_ready {
        loop {
          match self.cmd_rx.try_recv() {
            Ok(request) => {
              self.drain_backend_events();
              if self.handle_command(request) == Flow::Exit {
                info!("queue server exiting");
                return Ok(());
              }
            }
            Err(mpsc::TryRecvError::Empty) => break,
            Err(mpsc::TryRecvError::Disconnected) => {
              info!("all handles dropped; queue server exiting");
              return Ok(());
            }
          }
        }
      }
    }
  }

  // ----------------------------------------------
  // the recurring poll

  fn arm_poll_timer(&mut self) {
    if self.poll_kicked {
      return;
    }
    // One tick in flight at a time, or explicit POLLs would multiply the
    // schedule.
    if let Some(tick) = self.pending_tick.take() {
      self.timer.cancel_timeout(&tick);
    }
    self.pending_tick = Some(self.timer.set_timeout(self.config.poll_interval, ()));
  }

  fn handle_poll(&mut self, rearm: bool) {
    self.sync_external_index();

    let outcome = self.backend.poll(&mut self.queue);
    if !outcome.statuses.is_empty() {
      self.params.publish_messages(&outcome.statuses, &outcome.messages);
    }
    if outcome.statuses.iter().any(|s| *s != 0) {
      self.stop_with_alert(Alert::BackendError);
    }
    if let Some(reason) = &outcome.send_failure {
      warn!(
        "send held: {} at index {}",
        reason.kind.as_str(),
        reason.index
      );
      self
        .params
        .publish("FAILURE.DETAILS", ParamValue::Record(reason.to_record()));
      self.stop_with_alert(Alert::BackendError);
    }
    if let Some(e) = &outcome.fatal {
      error!("backend send failed: {e}");
      self
        .params
        .publish_messages(&[1], &[format!("backend send failed: {e}")]);
      self.stop_with_alert(Alert::BackendError);
    }

    self.refresh_current_summary();
    self.publish_core();
    if rearm {
      self.arm_poll_timer();
    }
  }

  /// Reconcile the three INDEX views: the queue's own, the one we last
  /// published, and the latest client write. A client write that diverges
  /// from what we published moves the highlight and stops the queue.
  fn sync_external_index(&mut self) {
    let Some(external) = self.external_index.take() else {
      return;
    };
    if Some(external) == self.known_index {
      return;
    }
    warn!("INDEX moved externally to {external}; snapping highlight and stopping");
    if external >= 0 {
      self.queue.set_current_index(external as usize);
    } else {
      self.queue.set_current_index(0);
    }
    self.backend.set_q_running(false);
  }

  // ----------------------------------------------
  // backend events

  fn drain_backend_events(&mut self) {
    while let Ok(event) = self.backend_rx.try_recv() {
      self.handle_backend_event(event);
    }
  }

  fn handle_backend_event(&mut self, event: BackendEvent) {
    match event {
      BackendEvent::Message { status, text } => self.backend.push_message(status, text),
      BackendEvent::SendDone => self.backend.set_accepting(true),
      BackendEvent::ObsCompleted => {
        let Some(id) = self.backend.last_sent() else {
          warn!("completion event with no send in flight");
          return;
        };
        if let Some(entry) = self.queue.get_mut(id) {
          entry.set_status(EntryStatus::Observed);
        }
        let tidy = self.backend.post_obs_tidy(&mut self.queue, id);
        if tidy.end_of_queue {
          info!("queue ran dry; stopped with the highlight rewound");
          self.alert = Alert::QueueEmpty;
        }
        if let Some(key) = tidy.completed_msb {
          self.process_completion(key);
        }
        self.queue.drop_if_detached(id);
        self.refresh_current_summary();
        self.publish_core();
      }
      BackendEvent::ObsError { status, message } => {
        error!("observation failed ({status}): {message}");
        if let Some(id) = self.backend.last_sent() {
          if let Some(entry) = self.queue.get_mut(id) {
            entry.set_status(EntryStatus::Error);
          }
        }
        let status = if status == 0 { 1 } else { status };
        self.params.publish_messages(&[status], &[message]);
        self.stop_with_alert(Alert::BackendError);
        self.publish_core();
      }
    }
  }

  fn process_completion(&mut self, key: MsbKey) {
    if let Some(ck) = self
      .completion
      .msb_completed(key, &mut self.queue, &mut self.params)
    {
      info!("MSB accept pending under key {ck}");
    }
  }

  fn process_completions(&mut self, keys: Vec<MsbKey>) {
    for key in keys {
      self.process_completion(key);
    }
  }

  fn stop_with_alert(&mut self, alert: Alert) {
    self.backend.set_q_running(false);
    self.alert = alert;
  }

  // ----------------------------------------------
  // commands

  fn handle_command(&mut self, request: CommandRequest) -> Flow {
    let CommandRequest { command, reply } = request;
    trace!("command: {command:?}");
    let (result, flow) = self.dispatch(command);
    if let Err(e) = &result {
      info!("command refused: {e}");
    }
    let _ = reply.send(result);
    flow
  }

  fn dispatch(&mut self, command: Command) -> (CommandReply, Flow) {
    let result = match command {
      Command::Poll => {
        self.handle_poll(true);
        Ok(CommandResponse::Done)
      }
      Command::KickPoll => {
        self.poll_kicked = true;
        if let Some(tick) = self.pending_tick.take() {
          self.timer.cancel_timeout(&tick);
        }
        Ok(CommandResponse::Done)
      }
      Command::Start => self.do_start().map(|_| CommandResponse::Done),
      Command::Stop { alert } => {
        self.backend.set_q_running(false);
        if let Some(alert) = alert {
          self.alert = alert;
        }
        self.publish_core();
        Ok(CommandResponse::Done)
      }
      Command::Load { manifest, iscal } => self
        .do_load(&manifest, iscal, LoadMode::Load)
        .map(|_| CommandResponse::Done),
      Command::AddBack { manifest, iscal } => self
        .do_load(&manifest, iscal, LoadMode::Back)
        .map(|_| CommandResponse::Done),
      Command::AddFront { manifest, iscal } => self
        .do_load(&manifest, iscal, LoadMode::Front)
        .map(|_| CommandResponse::Done),
      Command::Insert {
        position,
        manifest,
        iscal,
      } => self
        .do_load(&manifest, iscal, LoadMode::Insert(position))
        .map(|_| CommandResponse::Done),
      Command::Clear => {
        let completed = self.queue.clear();
        self.process_completions(completed);
        self.publish_core();
        Ok(CommandResponse::Done)
      }
      Command::Cut { index, count } => {
        let completed = self.queue.cut(index, count as isize);
        self.process_completions(completed);
        self.publish_core();
        Ok(CommandResponse::Done)
      }
      Command::CutMsb { index } => self.do_cut_msb(index).map(|_| CommandResponse::Done),
      Command::Modify {
        index,
        target_xml,
        propagate,
        no_auto_start,
      } => self
        .do_modify(index, &target_xml, propagate, no_auto_start)
        .map(|_| CommandResponse::Done),
      Command::ClearTarget { index } => {
        self.queue.clear_target(index);
        self.publish_core();
        Ok(CommandResponse::Done)
      }
      Command::SuspendMsb => self.do_suspend().map(|_| CommandResponse::Done),
      Command::MsbComplete { requests } => {
        self.do_msb_complete(requests).map(|_| CommandResponse::Done)
      }
      Command::GetEntry { index } => self.do_get_entry(index).map(CommandResponse::Entity),
      Command::SetIndex { index } => {
        self.external_index = Some(index);
        Ok(CommandResponse::Done)
      }
      Command::Subscribe => Ok(CommandResponse::Subscribed(self.params.subscribe())),
      Command::GetParams => Ok(CommandResponse::Params(self.params.snapshot())),
      Command::Exit => {
        // Break Entry/MSB references; in-flight sends are the instrument's
        // problem now. Completions surfacing from this teardown are dropped
        // rather than turned into prompts.
        let dropped = self.queue.clear();
        if !dropped.is_empty() {
          info!("{} MSB completion(s) discarded at exit", dropped.len());
        }
        return (Ok(CommandResponse::Done), Flow::Exit);
      }
    };
    (result, Flow::Continue)
  }

  fn do_start(&mut self) -> QueueResult<()> {
    self.backend.set_q_running(true);
    self.alert = Alert::None;
    self.backend.clear_failure();
    self.params.clear("FAILURE.DETAILS");
    // Dispatch right away rather than waiting out the tick.
    self.handle_poll(false);
    Ok(())
  }

  fn do_load(&mut self, path: &Path, iscal: bool, mode: LoadMode) -> QueueResult<()> {
    if matches!(mode, LoadMode::Back | LoadMode::Front) {
      self.check_time_threshold()?;
    }
    let batch = self.load_batch(path, iscal)?;
    match mode {
      LoadMode::Load => {
        let completed = self.queue.load(batch);
        self.process_completions(completed);
      }
      LoadMode::Back => self.queue.add_back(batch),
      LoadMode::Front => self.queue.add_front(batch),
      LoadMode::Insert(pos) => self.queue.insert(pos, batch),
    }
    // New entries supersede any stale send failure.
    self.backend.clear_failure();
    self.params.clear("FAILURE.DETAILS");
    self.publish_core();
    Ok(())
  }

  fn load_batch(&mut self, path: &Path, iscal: bool) -> QueueResult<EntryBatch> {
    let m = manifest::read_manifest(path)?;
    if m.telescope != self.config.telescope {
      return Err(QueueError::Manifest(format!(
        "manifest is for {}, this queue serves {}",
        m.telescope, self.config.telescope
      )));
    }
    let entries = manifest::load_entries(&m)?;
    if entries.is_empty() {
      return Err(QueueError::Manifest("manifest names no entries".to_owned()));
    }
    if iscal {
      return Ok(EntryBatch::standalone(entries));
    }

    let project = entries
      .iter()
      .find_map(|e| e.entity().project_id().map(str::to_owned));
    let msb_id = entries
      .iter()
      .find_map(|e| e.entity().msb_id().map(str::to_owned));
    let title = entries
      .iter()
      .find_map(|e| e.entity().msb_title().map(str::to_owned));
    let mut msb = Msb::new(self.config.telescope, project, msb_id, title);
    self.queue_id_counter += 1;
    msb.set_queue_id(self.queue_id_counter);
    Ok(EntryBatch::block(entries, msb))
  }

  /// Refuse to stack more work while plenty remains, unless the highlight is
  /// already on the last entry (stacking during a long exposure is fine).
  fn check_time_threshold(&self) -> QueueResult<()> {
    let remaining = self.queue.remaining_time();
    let at_last = match self.queue.current_index() {
      Some(i) => i + 1 == self.queue.len(),
      None => true,
    };
    if remaining > self.config.max_queue_time && !at_last {
      return Err(QueueError::TooMuchOnQueue {
        remaining,
        limit: self.config.max_queue_time,
      });
    }
    Ok(())
  }

  fn do_cut_msb(&mut self, index: Option<usize>) -> QueueResult<()> {
    let index = match index.or_else(|| self.queue.current_index()) {
      Some(i) => i,
      None => return Ok(()), // empty queue: nothing to cut
    };
    let completed = self.queue.cut_msb(index);
    self.process_completions(completed);
    self.publish_core();
    Ok(())
  }

  fn do_modify(
    &mut self,
    index: usize,
    target_xml: &str,
    propagate: bool,
    no_auto_start: bool,
  ) -> QueueResult<()> {
    let target = Target::from_tcs_xml(target_xml)?;
    self.queue.set_target(index, target)?;
    if propagate {
      self.queue.propagate_target(index);
    }
    // The operator has supplied what the failed send was waiting for.
    self.backend.clear_failure();
    self.params.clear("FAILURE.DETAILS");
    if no_auto_start {
      self.publish_core();
    } else {
      self.do_start()?;
    }
    Ok(())
  }

  fn do_suspend(&mut self) -> QueueResult<()> {
    let Some(index) = self.queue.current_index() else {
      return Err(QueueError::BadArgument(
        "cannot suspend: the queue is empty".to_owned(),
      ));
    };
    let (project, msb_id, obs_label, msb_key) = {
      let Some(entry) = self.queue.entry_at(index) else {
        return Err(QueueError::BadArgument(
          "cannot suspend: no entry under the highlight".to_owned(),
        ));
      };
      (
        entry.entity().project_id().map(str::to_owned),
        entry.entity().msb_id().map(str::to_owned),
        entry.entity().obs_label().map(str::to_owned),
        entry.msb(),
      )
    };

    if !self.config.simdb {
      if let (Some(project), Some(msb_id)) = (&project, &msb_id) {
        if let Err(e) = self.db.msb_suspend(project, msb_id, obs_label.as_deref()) {
          // Non-fatal: the suspension still happens locally.
          error!("suspend report to the project database failed: {e}");
          self
            .params
            .publish_messages(&[1], &[format!("suspend report failed: {e}")]);
        }
      }
    }

    // No accept prompt for a suspended block.
    if let Some(key) = msb_key {
      if let Some(msb) = self.queue.msb_mut(key) {
        msb.set_observed(false);
      }
    }
    let completed = self.queue.cut_msb(index);
    self.process_completions(completed);
    self.publish_core();
    Ok(())
  }

  fn do_msb_complete(&mut self, requests: Vec<CompletionRequest>) -> QueueResult<()> {
    if requests.is_empty() {
      return Err(QueueError::BadArgument(
        "MSB_COMPLETE needs at least one decision".to_owned(),
      ));
    }
    let mut first_error = None;
    for request in requests {
      let decision = AcceptDecision::from_code(request.decision);
      let result = self.completion.decide(
        &request.key,
        decision,
        request.user.as_deref(),
        request.reason.as_deref(),
        self.config.simdb,
        &mut *self.db,
        &mut self.queue,
        &mut self.params,
      );
      if let Err(e) = result {
        if first_error.is_none() {
          first_error = Some(e);
        }
      }
    }
    self.publish_core();
    match first_error {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }

  fn do_get_entry(&self, index: usize) -> QueueResult<serde_json::Value> {
    match self.queue.entry_at(index) {
      Some(entry) => entry.entity().to_json(),
      None => Err(QueueError::BadArgument(format!(
        "entry index {index} out of range"
      ))),
    }
  }

  // ----------------------------------------------
  // publication

  fn refresh_current_summary(&mut self) {
    if let Some(id) = self.backend.last_sent() {
      if let Some(entry) = self.queue.get(id) {
        self.current_summary = entry.entity().summary();
      }
    }
  }

  fn publish_core(&mut self) {
    let running = self.backend.q_running();
    self.params.publish(
      "STATUS",
      ParamValue::Str(if running { "Running" } else { "Stopped" }.to_owned()),
    );
    self.params.publish("ALERT", ParamValue::Int(self.alert.code()));
    let index = self.queue.current_index().map(|i| i as i32).unwrap_or(0);
    self.params.publish("INDEX", ParamValue::Int(index));
    self.known_index = Some(index);
    self.params.publish(
      "TIMEONQUEUE",
      ParamValue::Int((self.queue.remaining_time() / 60) as i32),
    );
    self
      .params
      .publish("CURRENT", ParamValue::Str(self.current_summary.clone()));
    self.params.publish_contents(self.queue.stringified());
  }
}

#[derive(Debug, Clone, Copy)]
enum LoadMode {
  Load,
  Back,
  Front,
  Insert(isize),
}
