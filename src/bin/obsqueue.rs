//! Queue server front-end.
//!
//! Starts a queue server for one telescope with the simulated instrument
//! link, optionally loads an initial manifest, and then takes simple line
//! commands on stdin until EOF or `exit`. Exits 0 on a clean shutdown and
//! non-zero when startup fails.

use std::{
  io::{self, BufRead},
  path::PathBuf,
  process::ExitCode,
};

use clap::Parser;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use obsqueue::{
  backend::{Backend, InstrumentTask, ScubaTask, SimLink},
  config::{default_pending_file, ServerConfig, Telescope},
  db::SimDb,
  server::{Command, QueueServer, ServerHandle},
};

#[derive(Parser)]
#[command(name = "obsqueue", about = "Observation queue server")]
struct Args {
  /// Telescope this queue serves (JCMT or UKIRT).
  #[arg(long)]
  telescope: String,

  /// Drive the SCUBA backend task instead of the instrument task.
  #[arg(long)]
  scuba: bool,

  /// Suppress all project-database contact.
  #[arg(long)]
  simdb: bool,

  /// Skip the accept-prompt lifecycle; completed MSBs are cut.
  #[arg(long = "no-complete")]
  no_complete: bool,

  /// Recurring poll interval in milliseconds.
  #[arg(long, default_value_t = 1000)]
  poll_interval_ms: u64,

  /// Where to persist pending MSB accepts.
  #[arg(long)]
  pending_file: Option<PathBuf>,

  /// Manifest to load before accepting commands.
  #[arg(long)]
  load: Option<PathBuf>,
}

fn main() -> ExitCode {
  env_logger::init();
  let args = Args::parse();

  let telescope: Telescope = match args.telescope.parse() {
    Ok(t) => t,
    Err(e) => {
      eprintln!("obsqueue: {e}");
      return ExitCode::from(2);
    }
  };

  let mut config = ServerConfig::new(telescope);
  config.poll_interval = std::time::Duration::from_millis(args.poll_interval_ms);
  config.simdb = args.simdb;
  config.no_complete = args.no_complete;
  config.pending_file = args.pending_file.unwrap_or_else(default_pending_file);

  let scuba = args.scuba;
  let handle = match QueueServer::spawn(
    config,
    move |events| {
      if scuba {
        Box::new(ScubaTask::new(Box::new(SimLink::new(events)))) as Box<dyn Backend>
      } else {
        Box::new(InstrumentTask::new(Box::new(SimLink::new(events))))
      }
    },
    Box::new(SimDb),
  ) {
    Ok(h) => h,
    Err(e) => {
      eprintln!("obsqueue: cannot start the queue server: {e}");
      return ExitCode::from(2);
    }
  };

  // Probe the loop before declaring ourselves up.
  if let Err(e) = handle.params() {
    eprintln!("obsqueue: queue server did not come up: {e}");
    return ExitCode::from(2);
  }

  if let Some(manifest) = &args.load {
    if let Err(e) = handle.load(manifest) {
      eprintln!("obsqueue: cannot load {}: {e}", manifest.display());
      return ExitCode::from(2);
    }
  }

  info!("obsqueue serving {telescope}; reading commands from stdin");
  let stdin = io::stdin();
  for line in stdin.lock().lines() {
    let line = match line {
      Ok(l) => l,
      Err(_) => break,
    };
    if !run_line(&handle, line.trim()) {
      break;
    }
  }

  match handle.exit() {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      eprintln!("obsqueue: unclean shutdown: {e}");
      ExitCode::from(1)
    }
  }
}

/// Execute one console line. Returns false when the session should end.
fn run_line(handle: &ServerHandle, line: &str) -> bool {
  let mut words = line.split_whitespace();
  let result = match words.next() {
    None => return true,
    Some("exit") => return false,
    Some("start") => handle.start(),
    Some("stop") => handle.stop(),
    Some("poll") => handle.poll_now(),
    Some("clear") => handle.command(Command::Clear).map(|_| ()),
    Some("load") => match words.next() {
      Some(path) => handle.load(std::path::Path::new(path)),
      None => {
        eprintln!("usage: load <manifest.xml>");
        return true;
      }
    },
    Some("cut") => {
      let index = words.next().and_then(|w| w.parse().ok());
      let count = words.next().and_then(|w| w.parse().ok()).unwrap_or(1);
      match index {
        Some(index) => handle.command(Command::Cut { index, count }).map(|_| ()),
        None => {
          eprintln!("usage: cut <index> [count]");
          return true;
        }
      }
    }
    Some("params") => match handle.params() {
      Ok(params) => {
        for (name, value) in params {
          println!("{name} = {value:?}");
        }
        Ok(())
      }
      Err(e) => Err(e),
    },
    Some(other) => {
      eprintln!("unknown command {other:?} (start stop poll load cut clear params exit)");
      return true;
    }
  };
  if let Err(e) = result {
    eprintln!("obsqueue: {e}");
  }
  true
}
