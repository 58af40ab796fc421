//! Batching of entries.
//!
//! The [`Converter`] accumulates the entries that leave the pipeline and hands them to a
//! callback in batches. A batch is flushed when it reaches [`ConverterConfig::max_flush_count`]
//! entries, or when [`ConverterConfig::flush_interval`] has elapsed since the last flush,
//! whichever comes first.

use std::{
    mem,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{sync::Notify, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::entry::Entry;

/// An ordered group of entries.
pub type Batch = Vec<Entry>;

/// Receives the batches produced by the converter.
///
/// The callback is never called while the converter holds its buffer lock, it can take time.
/// Batches are given to the callback one at a time, in the order they were cut from the
/// buffer, so the callback must not call back into the converter.
/// An error is logged and the batch is dropped: the converter does not retry.
pub type BatchCallback = Box<dyn Fn(Batch) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConverterConfig {
    /// Maximum number of entries in a batch.
    pub max_flush_count: usize,
    /// Maximum time between two flushes.
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            max_flush_count: 100,
            flush_interval: Duration::from_millis(100),
        }
    }
}

/// Groups entries into batches.
pub struct Converter {
    config: ConverterConfig,
    shared: Arc<Shared>,
    timer: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

struct Shared {
    buffer: Mutex<Buffer>,
    max_flush_count: usize,
    /// Notified when the buffer is flushed by something else than the timer.
    flushed: Notify,
    /// Number of the next batch to give to the callback.
    turn: Mutex<u64>,
    turn_changed: Condvar,
}

struct Buffer {
    entries: Vec<Entry>,
    state: State,
    /// Number of the next batch cut from the buffer.
    next_batch: u64,
}

/// A batch that has been cut from the buffer and waits for its turn to be delivered.
struct Pending {
    batch: Batch,
    number: u64,
    callback: Arc<BatchCallback>,
}

enum State {
    Created,
    Running(Arc<BatchCallback>),
    Stopped,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConverterError {
    #[error("max_flush_count must be greater than zero")]
    InvalidMaxFlushCount,
    #[error("flush_interval must be greater than zero")]
    InvalidFlushInterval,
    #[error("the converter must be started within a tokio runtime")]
    NoRuntime,
    #[error("the converter has already been started")]
    AlreadyStarted,
    #[error("the converter is not running")]
    NotRunning,
}

impl Converter {
    pub fn new(config: ConverterConfig) -> Result<Self, ConverterError> {
        if config.max_flush_count == 0 {
            return Err(ConverterError::InvalidMaxFlushCount);
        }
        if config.flush_interval.is_zero() {
            return Err(ConverterError::InvalidFlushInterval);
        }
        let shared = Arc::new(Shared {
            buffer: Mutex::new(Buffer {
                entries: Vec::with_capacity(config.max_flush_count),
                state: State::Created,
                next_batch: 0,
            }),
            max_flush_count: config.max_flush_count,
            flushed: Notify::new(),
            turn: Mutex::new(0),
            turn_changed: Condvar::new(),
        });
        Ok(Self {
            config,
            shared,
            timer: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    /// Starts the converter: from now on, batches are given to `callback`.
    ///
    /// The flush timer is spawned on the current tokio runtime.
    pub fn start(&self, callback: BatchCallback) -> Result<(), ConverterError> {
        let rt = tokio::runtime::Handle::try_current().map_err(|_| ConverterError::NoRuntime)?;
        {
            let mut buffer = self.shared.lock();
            if !matches!(buffer.state, State::Created) {
                return Err(ConverterError::AlreadyStarted);
            }
            buffer.state = State::Running(Arc::new(callback));
        }

        let token = CancellationToken::new();
        let task = rt.spawn(run_timer(self.shared.clone(), self.config.flush_interval, token.clone()));
        *lock(&self.timer) = Some((token, task));
        log::debug!(
            "Converter started (max_flush_count: {}, flush_interval: {:?})",
            self.config.max_flush_count,
            self.config.flush_interval
        );
        Ok(())
    }

    /// Adds an entry to the current batch.
    ///
    /// If the batch is full, it is flushed immediately, on the calling thread.
    /// This method can be called from multiple threads at the same time.
    pub fn add_entry(&self, entry: Entry) -> Result<(), ConverterError> {
        let full_batch = {
            let mut buffer = self.shared.lock();
            if !matches!(buffer.state, State::Running(_)) {
                return Err(ConverterError::NotRunning);
            }
            buffer.entries.push(entry);
            if buffer.entries.len() >= self.shared.max_flush_count {
                buffer.cut(self.shared.max_flush_count)
            } else {
                None
            }
        };
        if let Some(pending) = full_batch {
            self.shared.flushed.notify_one();
            self.shared.deliver(pending);
        }
        Ok(())
    }

    /// Takes the current batch, leaving an empty one in its place.
    ///
    /// The entries are not given to the callback.
    pub fn take_batch(&self) -> Batch {
        let mut buffer = self.shared.lock();
        mem::take(&mut buffer.entries)
    }

    /// Flushes the current batch, if the converter is running and the batch is not empty.
    ///
    /// Returns the number of entries that have been flushed. The flush timer restarts
    /// from now.
    pub fn flush(&self) -> usize {
        let n = self.shared.flush();
        if n > 0 {
            self.shared.flushed.notify_one();
        }
        n
    }

    /// Stops the timer and flushes the remaining entries.
    ///
    /// After this call, [`add_entry`](Self::add_entry) returns an error.
    /// Stopping a converter that is not running does nothing.
    pub async fn stop(&self) {
        let timer = lock(&self.timer).take();
        if let Some((token, task)) = timer {
            token.cancel();
            if let Err(e) = task.await {
                log::error!("The flush timer of the converter failed: {e}");
            }
        }

        let (was_running, last) = {
            let mut buffer = self.shared.lock();
            let last = buffer.cut(0);
            let was_running = matches!(buffer.state, State::Running(_));
            buffer.state = State::Stopped;
            (was_running, last)
        };
        if let Some(pending) = last {
            self.shared.deliver(pending);
        }
        if was_running {
            log::debug!("Converter stopped.");
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Buffer> {
        lock(&self.buffer)
    }

    fn flush(&self) -> usize {
        let pending = self.lock().cut(self.max_flush_count);
        match pending {
            Some(pending) => {
                let n = pending.batch.len();
                self.deliver(pending);
                n
            }
            None => 0,
        }
    }

    /// Gives a batch to the callback, after the batches that were cut before it.
    fn deliver(&self, pending: Pending) {
        let mut turn = lock(&self.turn);
        while *turn != pending.number {
            turn = self.turn_changed.wait(turn).unwrap_or_else(PoisonError::into_inner);
        }
        // the next batch gets its turn even if the callback panics
        let _next = NextTurn {
            turn,
            changed: &self.turn_changed,
        };

        let n = pending.batch.len();
        log::trace!("Flushing a batch of {n} entries");
        if let Err(e) = (pending.callback)(pending.batch) {
            log::error!("A batch of {n} entries has been dropped: {e:#}");
        }
    }
}

impl Buffer {
    /// Takes the entries out of the buffer, if it is running and not empty.
    fn cut(&mut self, capacity: usize) -> Option<Pending> {
        let callback = match &self.state {
            State::Running(callback) if !self.entries.is_empty() => callback.clone(),
            _ => return None,
        };
        let number = self.next_batch;
        self.next_batch += 1;
        Some(Pending {
            batch: mem::replace(&mut self.entries, Vec::with_capacity(capacity)),
            number,
            callback,
        })
    }
}

struct NextTurn<'a> {
    turn: MutexGuard<'a, u64>,
    changed: &'a Condvar,
}

impl Drop for NextTurn<'_> {
    fn drop(&mut self) {
        *self.turn += 1;
        self.changed.notify_all();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // The buffer stays consistent if a callback panics, because callbacks run without the lock.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Flushes the buffer when no flush has happened during the last `interval`.
async fn run_timer(shared: Arc<Shared>, interval: Duration, stop: CancellationToken) {
    let mut deadline = Instant::now() + interval;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = shared.flushed.notified() => {
                deadline = Instant::now() + interval;
            }
            _ = tokio::time::sleep_until(deadline) => {
                shared.flush();
                deadline = Instant::now() + interval;
            }
        }
    }
}
