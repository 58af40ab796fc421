//! The receiver: a pipeline, a converter, and the delivery of batches to a consumer.
//!
//! ```text
//! input -> operators -> converter -> delivery loop -> consumer
//! ```
//!
//! The pipeline is built when the [`Receiver`] is created, so that configuration errors
//! are detected early. [`Receiver::start`] starts everything, from the consumer side to
//! the input side; [`Receiver::shutdown`] stops everything in the reverse order and
//! delivers the last entries. The shutdown is bounded by `shutdown_timeout`: during the
//! shutdown, a rejected batch is dropped instead of retried, and a consumer that does not
//! return in time is abandoned.
use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use anyhow::{Context, anyhow};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{DeliveryConfig, OnDeliveryError, ReceiverConfig},
    converter::{Batch, Converter},
    entry::Entry,
    logs::Logs,
    operator::{EntrySender, registry::OperatorRegistry},
    pipeline::{Pipeline, PipelineBuilder, RunningPipeline},
    plugin,
};

/// The application that runs the receiver.
pub trait Host: Send + Sync {
    /// Called when a part of the receiver fails and cannot recover.
    ///
    /// The receiver keeps running: it is up to the host to decide whether it should be
    /// shut down.
    fn report_fatal_error(&self, error: anyhow::Error);
}

impl<F: Fn(anyhow::Error) + Send + Sync> Host for F {
    fn report_fatal_error(&self, error: anyhow::Error) {
        self(error)
    }
}

pub type ConsumeFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// Receives the logs produced by the receiver.
pub trait LogsConsumer: Send + Sync {
    fn consume_logs(&self, logs: Logs) -> ConsumeFuture<'_>;
}

impl<F, Fut> LogsConsumer for F
where
    F: Fn(Logs) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn consume_logs(&self, logs: Logs) -> ConsumeFuture<'_> {
        Box::pin(self(logs))
    }
}

pub struct Receiver {
    state: State,
    converter: Arc<Converter>,
    consumer: Arc<dyn LogsConsumer>,
    delivery: DeliveryConfig,
    shutdown_timeout: Duration,
}

enum State {
    Created(Pipeline),
    Running(Running),
    Stopped,
}

struct Running {
    stop: CancellationToken,
    supervisor: JoinHandle<anyhow::Result<()>>,
    delivery: JoinHandle<()>,
    /// Cancelled when the receiver shuts down, ends the retries of the delivery loop.
    draining: CancellationToken,
    entry_tx: Option<mpsc::WeakSender<Entry>>,
}

impl Receiver {
    /// Creates a receiver and builds its pipeline.
    ///
    /// If the config has a `plugin_dir`, the plugin templates are loaded from it, even if
    /// the pipeline does not use any plugin.
    pub fn new(
        config: ReceiverConfig,
        registry: &OperatorRegistry,
        consumer: Arc<dyn LogsConsumer>,
    ) -> anyhow::Result<Self> {
        let templates = match &config.plugin_dir {
            Some(dir) => {
                let templates = plugin::load_dir(dir)?;
                log::debug!("{} plugin(s) loaded from {}", templates.len(), dir.display());
                Some(templates)
            }
            None => None,
        };

        let mut builder = PipelineBuilder::new(registry);
        if let Some(templates) = &templates {
            builder = builder.with_templates(templates);
        }
        let pipeline = builder.build(&config.pipeline)?;
        let converter = Converter::new(config.converter).context("invalid converter config")?;
        log::info!("Pipeline built with {} operator(s).", pipeline.len());

        Ok(Self {
            state: State::Created(pipeline),
            converter: Arc::new(converter),
            consumer,
            delivery: config.delivery,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running(_))
    }

    /// Returns a sender that pushes entries into the pipeline, after its input.
    ///
    /// Returns `None` if the receiver is not running.
    pub fn entry_sender(&self) -> Option<EntrySender> {
        match &self.state {
            State::Running(Running {
                entry_tx: Some(weak), ..
            }) => weak.upgrade().map(EntrySender),
            _ => None,
        }
    }

    /// Starts the receiver.
    ///
    /// Must be called from a tokio runtime. A receiver cannot be started twice, even
    /// after a failed start.
    pub async fn start(&mut self, host: Arc<dyn Host>) -> anyhow::Result<()> {
        let pipeline = match std::mem::replace(&mut self.state, State::Stopped) {
            State::Created(pipeline) => pipeline,
            previous => {
                self.state = previous;
                return Err(anyhow!("the receiver has already been started"));
            }
        };

        // consumer side
        let (batch_tx, batch_rx) = mpsc::unbounded_channel::<Batch>();
        self.converter.start(Box::new(move |batch: Batch| {
            batch_tx
                .send(batch)
                .map_err(|_| anyhow!("the delivery loop is not running"))
        }))?;
        let draining = CancellationToken::new();
        let delivery = tokio::spawn(run_delivery(
            batch_rx,
            self.consumer.clone(),
            self.delivery.clone(),
            draining.clone(),
        ));

        // input side
        let converter = self.converter.clone();
        let sink = move |entry: Entry| {
            if let Err(e) = converter.add_entry(entry) {
                log::warn!("Entry lost at the end of the pipeline: {e}");
            }
        };
        let pipeline = match pipeline.start(sink).await {
            Ok(p) => p,
            Err(e) => {
                self.converter.stop().await;
                draining.cancel();
                if let Err(join_err) = delivery.await {
                    log::error!("The delivery loop failed: {join_err}");
                }
                return Err(e.context("failed to start the pipeline"));
            }
        };
        let entry_tx = pipeline.entry_sender().map(|s| s.0.downgrade());

        let stop = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(pipeline, host, stop.clone(), self.shutdown_timeout));
        self.state = State::Running(Running {
            stop,
            supervisor,
            delivery,
            draining,
            entry_tx,
        });
        log::info!("Receiver started.");
        Ok(())
    }

    /// Stops the receiver and delivers the remaining entries.
    ///
    /// The pipeline and the delivery of the last batches are each given `shutdown_timeout`.
    /// Returns an error if some batches could not be delivered in time.
    /// Does nothing if the receiver is not running.
    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        let running = match std::mem::replace(&mut self.state, State::Stopped) {
            State::Running(running) => running,
            other => {
                self.state = other;
                return Ok(());
            }
        };
        log::info!("Shutting down the receiver...");

        running.stop.cancel();
        let pipeline_result = match running.supervisor.await {
            Ok(res) => res,
            Err(e) => Err(anyhow!("the supervisor of the pipeline failed: {e}")),
        };

        // the last batch, then the end of the delivery loop
        self.converter.stop().await;
        running.draining.cancel();
        let mut delivery = running.delivery;
        let delivery_result = match tokio::time::timeout(self.shutdown_timeout, &mut delivery).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow!("the delivery loop failed: {e}")),
            Err(_) => {
                delivery.abort();
                Err(anyhow!(
                    "the remaining logs could not be delivered within {:?}",
                    self.shutdown_timeout
                ))
            }
        };
        if let Err(e) = &delivery_result {
            log::error!("Logs lost during the shutdown: {e}");
        }
        log::info!("Receiver stopped.");
        pipeline_result.and(delivery_result)
    }
}

/// Reports the failures of the pipeline to the host, and stops the pipeline when asked.
async fn supervise(
    mut pipeline: RunningPipeline,
    host: Arc<dyn Host>,
    stop: CancellationToken,
    timeout: Duration,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            failure = pipeline.next_failure() => match failure {
                Some(e) => host.report_fatal_error(e),
                None => {
                    // nothing can fail anymore
                    stop.cancelled().await;
                    break;
                }
            }
        }
    }
    pipeline.stop(timeout).await
}

async fn run_delivery(
    mut batches: mpsc::UnboundedReceiver<Batch>,
    consumer: Arc<dyn LogsConsumer>,
    config: DeliveryConfig,
    draining: CancellationToken,
) {
    while let Some(batch) = batches.recv().await {
        deliver(consumer.as_ref(), Logs::from_batch(batch), &config, &draining).await;
    }
    log::debug!("Delivery loop finished.");
}

/// Gives the logs to the consumer, following the error policy.
///
/// Once `draining` is cancelled, a pending retry is attempted immediately and a failed
/// attempt is not retried.
async fn deliver(consumer: &dyn LogsConsumer, logs: Logs, config: &DeliveryConfig, draining: &CancellationToken) {
    let attempts = match config.on_error {
        OnDeliveryError::Drop => 1,
        OnDeliveryError::Retry => config.max_retries.saturating_add(1),
    };
    let count = logs.record_count();
    let mut backoff = config.retry_backoff;
    let mut attempt = 1;
    loop {
        match consumer.consume_logs(logs.clone()).await {
            Ok(()) => return,
            Err(e) if attempt < attempts && !draining.is_cancelled() => {
                log::warn!(
                    "Failed to deliver {count} log records (attempt {attempt}/{attempts}), retrying in {backoff:?}: {e:#}"
                );
                tokio::select! {
                    _ = draining.cancelled() => (),
                    _ = tokio::time::sleep(backoff) => (),
                }
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => {
                log::error!("{count} log records have been dropped: {e:#}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc, Mutex,
            atomic::{AtomicU32, Ordering},
        },
        time::Duration,
    };

    use anyhow::anyhow;
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;

    use crate::{
        config::{DeliveryConfig, OnDeliveryError},
        entry::Entry,
        logs::Logs,
    };

    use super::{LogsConsumer, deliver};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        delivered: Mutex<Vec<usize>>,
    }

    impl LogsConsumer for Flaky {
        fn consume_logs(&self, logs: Logs) -> super::ConsumeFuture<'_> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::Relaxed);
                if call < self.failures {
                    return Err(anyhow!("unavailable"));
                }
                self.delivered.lock().unwrap().push(logs.record_count());
                Ok(())
            })
        }
    }

    fn flaky(failures: u32) -> Flaky {
        Flaky {
            failures,
            calls: AtomicU32::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    fn logs() -> Logs {
        Logs::from_batch(vec![Entry::with_body("a"), Entry::with_body("b")])
    }

    #[tokio::test(start_paused = true)]
    async fn drop_on_error() {
        let consumer = flaky(1);
        deliver(&consumer, logs(), &DeliveryConfig::default(), &CancellationToken::new()).await;
        assert_eq!(consumer.calls.load(Ordering::Relaxed), 1);
        assert!(consumer.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_on_error() {
        let config = DeliveryConfig {
            on_error: OnDeliveryError::Retry,
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
        };
        let consumer = flaky(2);
        let start = tokio::time::Instant::now();
        deliver(&consumer, logs(), &config, &CancellationToken::new()).await;
        assert_eq!(consumer.calls.load(Ordering::Relaxed), 3);
        assert_eq!(*consumer.delivered.lock().unwrap(), vec![2]);
        // 1s, then 2s
        assert_eq!(start.elapsed(), Duration::from_secs(3));

        let consumer = flaky(10);
        deliver(&consumer, logs(), &config, &CancellationToken::new()).await;
        assert_eq!(consumer.calls.load(Ordering::Relaxed), 4);
        assert!(consumer.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn no_retry_while_draining() {
        let config = DeliveryConfig {
            on_error: OnDeliveryError::Retry,
            max_retries: 10,
            retry_backoff: Duration::from_secs(60),
        };
        let draining = CancellationToken::new();
        draining.cancel();
        let consumer = flaky(10);
        let start = tokio::time::Instant::now();
        deliver(&consumer, logs(), &config, &draining).await;
        assert_eq!(consumer.calls.load(Ordering::Relaxed), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn draining_ends_the_backoff() {
        let config = DeliveryConfig {
            on_error: OnDeliveryError::Retry,
            max_retries: 10,
            retry_backoff: Duration::from_secs(60),
        };
        let draining = CancellationToken::new();
        let cancel = draining.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            cancel.cancel();
        });
        let consumer = flaky(10);
        let start = tokio::time::Instant::now();
        deliver(&consumer, logs(), &config, &draining).await;
        // the first attempt, then a last one when the backoff is interrupted
        assert_eq!(consumer.calls.load(Ordering::Relaxed), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn closures_are_consumers() {
        let received = Arc::new(Mutex::new(0));
        let received2 = received.clone();
        let consumer = move |logs: Logs| {
            let received = received2.clone();
            async move {
                *received.lock().unwrap() += logs.record_count();
                anyhow::Ok(())
            }
        };
        deliver(&consumer, logs(), &DeliveryConfig::default(), &CancellationToken::new()).await;
        assert_eq!(*received.lock().unwrap(), 2);
    }
}
