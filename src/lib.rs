//! Observation queue server.
//!
//! A long-lived task that holds an ordered list of pre-translated observation
//! descriptions and dispatches them, one at a time, to a downstream
//! instrument controller. Entries are grouped into Minimum Schedulable Blocks
//! (MSBs); when a block finishes, the operator is prompted to accept or
//! reject it and the verdict is reported to the project database. Pending
//! verdicts survive a restart.
//!
//! The moving parts:
//!
//! * [`queue`] — the data model: [`queue::Entry`], [`queue::Msb`] and the
//!   ordered [`queue::QueueContents`] with its movable highlight.
//! * [`backend`] — the adapter driving the instrument: the send/poll/tidy
//!   state machine behind the [`backend::Backend`] trait, with the
//!   target-fixup scans in [`backend::failure`].
//! * [`server`] — the event loop serializing operator commands, the
//!   recurring poll and instrument replies, publishing observable state
//!   through [`server::ParamPublisher`], and tracking MSB accept/reject
//!   through [`server::CompletionTracker`].
//! * [`manifest`] — the QueueEntries XML surface used to load entries.
//!
//! A server is spawned with [`server::QueueServer::spawn`] and driven through
//! the returned [`server::ServerHandle`]:
//!
//! ```no_run
//! use obsqueue::{
//!   backend::{InstrumentTask, SimLink},
//!   config::{ServerConfig, Telescope},
//!   db::SimDb,
//!   server::QueueServer,
//! };
//!
//! let config = ServerConfig::new(Telescope::JCMT);
//! let handle = QueueServer::spawn(
//!   config,
//!   |events| Box::new(InstrumentTask::new(Box::new(SimLink::new(events)))),
//!   Box::new(SimDb),
//! )
//! .unwrap();
//! handle.load(std::path::Path::new("/obs/qentries.xml")).unwrap();
//! handle.start().unwrap();
//! ```

pub mod backend;
pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod manifest;
pub mod queue;
pub mod server;
pub mod target;

pub use backend::{Backend, BackendEvent, InstrumentLink, InstrumentTask, ScubaTask, SimLink, SimReply};
pub use config::{ServerConfig, Telescope};
pub use db::{ProjectDb, SimDb};
pub use entity::ObsEntity;
pub use error::{QueueError, QueueResult};
pub use queue::{Entry, EntryStatus, Msb, QueueContents};
pub use server::{
  Alert, Command, CommandResponse, CompletionRequest, ParamUpdate, ParamValue, QueueServer,
  ServerHandle,
};
pub use target::Target;
