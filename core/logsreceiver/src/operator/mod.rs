//! Operators: the stages of a log pipeline.
//!
//! A pipeline is a linear chain of operators. Every operator has exactly one
//! [`Capability`]:
//!
//! - An **input** receives log events from the outside world (a socket, a file, ...)
//!   and turns them into [`Entry`] values. Inputs are autonomous: in [`Operator::start`],
//!   they spawn their own tasks and push entries to the [`EntrySender`] given by the
//!   [`StartContext`]. An input can only be the first operator of a pipeline.
//!
//! - An **intermediate** operator modifies the entries that go through it
//!   (parsing, enrichment, filtering) in [`Operator::process`].
//!
//! - An **output** consumes the entries and does not forward them.
//!   An output can only be the last operator of a pipeline.
//!
//! Entries that leave the last operator of the chain are handed to the sink of the
//! pipeline, usually the [`Converter`](crate::converter::Converter).
//!
//! ## Writing an operator
//!
//! Implement [`Operator`] for the operator itself and [`OperatorBuilder`](registry::OperatorBuilder)
//! to make it available in the [`OperatorRegistry`](registry::OperatorRegistry).
//!
//! ```no_run
//! use logsreceiver::entry::Entry;
//! use logsreceiver::operator::{Capability, Operator, ProcessError};
//! use logsreceiver::operator::registry::OperatorBuilder;
//! use serde::Deserialize;
//!
//! struct Uppercase;
//!
//! #[derive(Deserialize)]
//! #[serde(deny_unknown_fields)]
//! struct UppercaseConfig {}
//!
//! impl Operator for Uppercase {
//!     fn process(&mut self, mut entry: Entry) -> Result<Option<Entry>, ProcessError> {
//!         if let Some(s) = entry.body.as_str() {
//!             entry.body = s.to_uppercase().into();
//!         }
//!         Ok(Some(entry))
//!     }
//! }
//!
//! impl OperatorBuilder for Uppercase {
//!     type Config = UppercaseConfig;
//!
//!     fn type_name() -> &'static str {
//!         "uppercase"
//!     }
//!
//!     fn capability() -> Capability {
//!         Capability::Intermediate
//!     }
//!
//!     fn build(_id: &str, _config: UppercaseConfig) -> anyhow::Result<Box<Self>> {
//!         Ok(Box::new(Uppercase))
//!     }
//! }
//! ```
use std::{fmt, future::Future, pin::Pin};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::entry::Entry;

pub mod error;
pub mod registry;

pub use error::{InvalidEntry, ProcessError};

/// A stage of the pipeline.
pub trait Operator: Send {
    /// Starts the operator.
    ///
    /// Inputs use the context to obtain their output and to spawn the tasks that
    /// produce entries. This method must not block: long-running work belongs to
    /// the spawned tasks.
    fn start(&mut self, ctx: &mut dyn StartContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Stops the operator.
    ///
    /// Stopping an operator that is not running must succeed.
    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Processes an entry.
    ///
    /// Returns the entry to forward to the next operator, or `None` if the entry
    /// has been consumed or filtered out. Inputs are never asked to process entries.
    fn process(&mut self, entry: Entry) -> Result<Option<Entry>, ProcessError> {
        Ok(Some(entry))
    }
}

/// The role of an operator in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Input,
    Intermediate,
    Output,
}

/// An asynchronous task spawned by an operator.
pub type OperatorTask = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

/// Gives access to the pipeline during [`Operator::start`].
pub trait StartContext {
    /// The unique id of the operator being started.
    fn operator_id(&self) -> &str;

    /// Returns the sender that forwards entries to the rest of the pipeline.
    fn output(&self) -> EntrySender;

    /// Returns a token that is cancelled when the pipeline shuts down.
    fn shutdown_token(&self) -> CancellationToken;

    /// Spawns a task on the pipeline runtime.
    ///
    /// The pipeline waits for the task to finish when it stops, and reports
    /// an error if the task fails.
    fn spawn(&mut self, task: OperatorTask);
}

/// Sends entries to the next stage of the pipeline.
#[derive(Clone)]
pub struct EntrySender(pub(crate) mpsc::Sender<Entry>);

/// The pipeline no longer accepts entries.
#[derive(Debug, thiserror::Error)]
#[error("the pipeline is closed, the entry has been dropped")]
pub struct PipelineClosed(pub Entry);

impl EntrySender {
    /// Sends an entry, waiting for capacity if the pipeline is busy.
    pub async fn send(&self, entry: Entry) -> Result<(), PipelineClosed> {
        self.0.send(entry).await.map_err(|e| PipelineClosed(e.0))
    }

    /// Returns `true` if the pipeline no longer accepts entries.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::Input => "input",
            Capability::Intermediate => "intermediate",
            Capability::Output => "output",
        };
        f.write_str(s)
    }
}
