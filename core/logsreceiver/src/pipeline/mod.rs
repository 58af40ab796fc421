//! Log pipelines: chains of operators.
//!
//! A [`Pipeline`] is created by the [`PipelineBuilder`](builder::PipelineBuilder), then
//! started with [`Pipeline::start`], which returns a [`RunningPipeline`].
//!
//! ## Runtime
//!
//! The input (first operator) produces entries from its own tasks. The entries go
//! through a channel to a single "chain" task, which applies the other operators in
//! order and gives the result to the sink of the pipeline. Entries produced by the
//! same task of the input are therefore handled in order.
//!
//! The operators are started from the last to the first, so that no entry is produced
//! before every stage is ready. They are stopped in the reverse order: the input stops
//! first, then the chain is drained, then the other operators are stopped.
use std::time::Duration;

use anyhow::{Context, anyhow};
use tokio::{
    sync::mpsc,
    task::{JoinHandle, JoinSet},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    entry::Entry,
    operator::{Capability, EntrySender, Operator, OperatorTask, ProcessError, StartContext},
};

pub mod builder;
pub mod error;

pub use builder::PipelineBuilder;
pub use error::BuildError;

/// Size of the buffer between the input and the chain task.
const CHAN_BUF_SIZE: usize = 2048;

/// An operator created by the builder.
pub struct BuiltOperator {
    pub id: String,
    pub type_name: String,
    pub capability: Capability,
    operator: Box<dyn Operator>,
}

impl std::fmt::Debug for BuiltOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltOperator")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}

/// A pipeline that has been built but not started.
#[derive(Debug)]
pub struct Pipeline {
    operators: Vec<BuiltOperator>,
}

/// Receives the entries that leave the last operator of the pipeline.
pub trait EntrySink: Send + 'static {
    fn accept(&mut self, entry: Entry);
}

impl<F: FnMut(Entry) + Send + 'static> EntrySink for F {
    fn accept(&mut self, entry: Entry) {
        self(entry)
    }
}

/// A pipeline that has been started.
pub struct RunningPipeline {
    input: Option<BuiltOperator>,
    /// Tasks spawned by the operators.
    tasks: JoinSet<()>,
    chain: JoinHandle<()>,
    entry_tx: Option<mpsc::Sender<Entry>>,
    failures: mpsc::UnboundedReceiver<anyhow::Error>,
    shutdown: CancellationToken,
    /// Forces the chain task to stop after processing the buffered entries.
    drain: CancellationToken,
}

impl Pipeline {
    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Returns the id, type and capability of each operator, in order.
    pub fn describe(&self) -> Vec<(&str, &str, Capability)> {
        self.operators
            .iter()
            .map(|o| (o.id.as_str(), o.type_name.as_str(), o.capability))
            .collect()
    }

    /// Starts the pipeline. The entries that leave the pipeline are given to `sink`.
    ///
    /// This function must be called from a tokio runtime. If an operator fails to start,
    /// the operators that have already been started are stopped and an error is returned.
    pub async fn start(self, sink: impl EntrySink) -> anyhow::Result<RunningPipeline> {
        let mut operators = self.operators;
        let starts_with_input = operators.first().is_some_and(|o| o.capability == Capability::Input);
        let input = if starts_with_input { Some(operators.remove(0)) } else { None };

        let shutdown = CancellationToken::new();
        let drain = CancellationToken::new();
        let (entry_tx, entry_rx) = mpsc::channel(CHAN_BUF_SIZE);
        let (failure_tx, failures) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        // Start the chain, last operator first.
        for i in (0..operators.len()).rev() {
            let op = &mut operators[i];
            let mut ctx = OperatorStartContext {
                operator_id: &op.id,
                output: &entry_tx,
                shutdown: &shutdown,
                tasks: &mut tasks,
                failures: &failure_tx,
            };
            if let Err(e) = op.operator.start(&mut ctx) {
                let e = e.context(format!("operator '{}' failed to start", op.id));
                shutdown.cancel();
                tasks.abort_all();
                stop_operators(&mut operators[i + 1..]);
                return Err(e);
            }
            log::debug!("Operator '{}' started.", op.id);
        }
        let chain = tokio::spawn(run_chain(entry_rx, operators, sink, drain.clone(), failure_tx.clone()));

        let mut running = RunningPipeline {
            input: None,
            tasks,
            chain,
            entry_tx: Some(entry_tx),
            failures,
            shutdown,
            drain,
        };

        // Input, last in order not to lose any entry.
        if let Some(mut input) = input {
            let mut ctx = OperatorStartContext {
                operator_id: &input.id,
                output: running.entry_tx.as_ref().context("entry channel already closed")?,
                shutdown: &running.shutdown,
                tasks: &mut running.tasks,
                failures: &failure_tx,
            };
            if let Err(e) = input.operator.start(&mut ctx) {
                let e = e.context(format!("operator '{}' failed to start", input.id));
                // Stopping the partially started input is best effort.
                if let Err(stop_err) = input.operator.stop() {
                    log::warn!("Error while stopping input '{}': {stop_err:#}", input.id);
                }
                if let Err(stop_err) = running.stop(Duration::ZERO).await {
                    log::warn!("Error while rolling back the pipeline: {stop_err:#}");
                }
                return Err(e);
            }
            log::debug!("Input '{}' started.", input.id);
            running.input = Some(input);
        }
        Ok(running)
    }
}

impl RunningPipeline {
    /// Returns a sender that pushes entries to the first operator after the input.
    ///
    /// This is how entries are given to a pipeline that has no input.
    /// Returns `None` once the pipeline is stopping.
    pub fn entry_sender(&self) -> Option<EntrySender> {
        self.entry_tx.as_ref().map(|tx| EntrySender(tx.clone()))
    }

    /// Waits for the next failure of an operator.
    ///
    /// Returns `None` when no operator can fail anymore.
    /// This function is cancel-safe.
    pub async fn next_failure(&mut self) -> Option<anyhow::Error> {
        self.failures.recv().await
    }

    /// Stops the pipeline.
    ///
    /// The input is stopped first. The tasks of the operators are given at most `timeout`
    /// to finish, after which they are aborted. Then, the entries that are still in the
    /// pipeline go through the remaining operators before they are stopped.
    pub async fn stop(mut self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + timeout;
        let mut errors = Vec::new();

        if let Some(input) = &mut self.input {
            if let Err(e) = input.operator.stop() {
                errors.push(e.context(format!("failed to stop operator '{}'", input.id)));
            }
        }
        self.shutdown.cancel();

        // wait for the tasks spawned by the operators
        let tasks = &mut self.tasks;
        let join_all = async {
            let mut panics = Vec::new();
            while let Some(res) = tasks.join_next().await {
                if let Err(e) = res {
                    if e.is_panic() {
                        panics.push(anyhow!("an operator task panicked: {e}"));
                    }
                }
            }
            panics
        };
        match tokio::time::timeout_at(deadline, join_all).await {
            Ok(panics) => errors.extend(panics),
            Err(_) => {
                log::warn!("Some operator tasks did not finish in time, aborting them.");
                self.tasks.abort_all();
            }
        }

        // drain the chain
        drop(self.entry_tx.take());
        let chain_result = match tokio::time::timeout_at(deadline, &mut self.chain).await {
            Ok(res) => res,
            Err(_) => {
                log::warn!("The pipeline is still receiving entries, processing the buffered ones and stopping.");
                self.drain.cancel();
                (&mut self.chain).await
            }
        };
        if let Err(e) = chain_result {
            errors.push(anyhow!("the chain task failed: {e}"));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            n => {
                let messages: Vec<String> = errors.iter().map(|e| format!("{e:#}")).collect();
                Err(anyhow!("{n} errors while stopping the pipeline: {}", messages.join("; ")))
            }
        }
    }
}

/// Applies the operators of the chain to the entries, in order.
async fn run_chain(
    mut rx: mpsc::Receiver<Entry>,
    mut operators: Vec<BuiltOperator>,
    mut sink: impl EntrySink,
    drain: CancellationToken,
    failures: mpsc::UnboundedSender<anyhow::Error>,
) {
    loop {
        tokio::select! {
            biased;

            entry = rx.recv() => {
                let Some(entry) = entry else { break };
                if let Err(e) = process_entry(&mut operators, &mut sink, entry) {
                    log::error!("The pipeline cannot process entries anymore: {e:#}");
                    let _ = failures.send(e);
                    break;
                }
            },
            _ = drain.cancelled() => {
                rx.close();
                while let Ok(entry) = rx.try_recv() {
                    if let Err(e) = process_entry(&mut operators, &mut sink, entry) {
                        log::error!("The pipeline cannot process entries anymore: {e:#}");
                        break;
                    }
                }
                break;
            }
        }
    }
    drop(rx);
    stop_operators(&mut operators);
}

fn process_entry(operators: &mut [BuiltOperator], sink: &mut impl EntrySink, entry: Entry) -> anyhow::Result<()> {
    let mut entry = entry;
    for op in operators.iter_mut() {
        match op.operator.process(entry) {
            Ok(Some(e)) => entry = e,
            Ok(None) => return Ok(()),
            Err(ProcessError::InvalidEntry(e)) => {
                log::warn!("Operator '{}' dropped an invalid entry: {e:#}", op.id);
                return Ok(());
            }
            Err(ProcessError::Fatal(e)) => {
                return Err(e.context(format!("fatal error in operator '{}'", op.id)));
            }
        }
    }
    sink.accept(entry);
    Ok(())
}

fn stop_operators(operators: &mut [BuiltOperator]) {
    for op in operators {
        match op.operator.stop() {
            Ok(()) => log::debug!("Operator '{}' stopped.", op.id),
            Err(e) => log::error!("Error while stopping operator '{}': {e:#}", op.id),
        }
    }
}

struct OperatorStartContext<'a> {
    operator_id: &'a str,
    output: &'a mpsc::Sender<Entry>,
    shutdown: &'a CancellationToken,
    tasks: &'a mut JoinSet<()>,
    failures: &'a mpsc::UnboundedSender<anyhow::Error>,
}

impl StartContext for OperatorStartContext<'_> {
    fn operator_id(&self) -> &str {
        self.operator_id
    }

    fn output(&self) -> EntrySender {
        EntrySender(self.output.clone())
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    fn spawn(&mut self, task: OperatorTask) {
        let id = self.operator_id.to_owned();
        let failures = self.failures.clone();
        self.tasks.spawn(async move {
            if let Err(e) = task.await {
                let e = e.context(format!("task of operator '{id}' failed"));
                log::error!("{e:#}");
                let _ = failures.send(e);
            }
        });
    }
}
