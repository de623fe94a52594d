//! The event queue between producers (collectors, assemblers) and the spooler.
//!
//! Admission has hysteresis: once the queue holds `high` messages producers
//! wait, and they resume only after the consumer has drained it down to `low`.
//! This keeps a burst of collectors from waking up and stalling again on every
//! single dequeue.

use crate::source::event::LogEvent;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::{mpsc, Notify};

/// Control requests that travel in-band with the events they apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Emit whatever is buffered now.
    Flush,
    /// Emit whatever is buffered, then exit.
    Stop,
}

/// Message consumed by the multiline assembler and the spooler.
#[derive(Debug)]
pub enum PipelineMessage {
    Data(LogEvent),
    Control(Control),
}

#[derive(Debug, Default)]
struct Level {
    len: usize,
    full: bool,
    closed: bool,
}

#[derive(Debug)]
struct Watermarks {
    high: usize,
    low: usize,
    level: Mutex<Level>,
    resumed: Notify,
}

impl Watermarks {
    fn lock(&self) -> MutexGuard<'_, Level> {
        self.level.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take a place in the queue, or false when the consumer is gone.
    async fn admit(&self) -> bool {
        loop {
            let resumed = self.resumed.notified();
            if let Some(admitted) = self.try_admit() {
                return admitted;
            }
            resumed.await;
        }
    }

    /// `None` while the queue is full.
    fn try_admit(&self) -> Option<bool> {
        let mut level = self.lock();
        if level.closed {
            return Some(false);
        }
        if level.full {
            return None;
        }
        level.len += 1;
        if level.len >= self.high {
            level.full = true;
        }
        Some(true)
    }

    fn release(&self) {
        let mut level = self.lock();
        level.len = level.len.saturating_sub(1);
        if level.full && level.len <= self.low {
            level.full = false;
            drop(level);
            self.resumed.notify_waiters();
        }
    }

    fn close(&self) {
        self.lock().closed = true;
        self.resumed.notify_waiters();
    }
}

/// Producer half. Cloning is cheap; every clone shares the same watermarks.
#[derive(Debug)]
pub struct Sender<T> {
    tx: mpsc::UnboundedSender<T>,
    marks: Arc<Watermarks>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            marks: self.marks.clone(),
        }
    }
}

impl<T> Sender<T> {
    /// Enqueue `message`, waiting while the queue is above its low watermark
    /// after having filled up. Cancel safe: nothing is enqueued unless this
    /// completes.
    pub async fn send(&self, message: T) -> Result<(), SendError<T>> {
        if !self.marks.admit().await {
            return Err(SendError(message));
        }
        self.push(message).map_err(|(TrySendError::Closed(m) | TrySendError::Full(m))| SendError(m))
    }

    /// Enqueue without waiting; fails with `Full` while producers are paused.
    pub fn try_send(&self, message: T) -> Result<(), TrySendError<T>> {
        match self.marks.try_admit() {
            Some(true) => self.push(message),
            Some(false) => Err(TrySendError::Closed(message)),
            None => Err(TrySendError::Full(message)),
        }
    }

    fn push(&self, message: T) -> Result<(), TrySendError<T>> {
        self.tx.send(message).map_err(|SendError(m)| {
            self.marks.release();
            TrySendError::Closed(m)
        })
    }

    /// Whether producers are currently held back.
    pub fn is_paused(&self) -> bool {
        self.marks.lock().full
    }
}

/// Consumer half.
#[derive(Debug)]
pub struct Receiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
    marks: Arc<Watermarks>,
}

impl<T> Receiver<T> {
    /// Next message, or `None` once every sender is gone. Cancel safe.
    pub async fn recv(&mut self) -> Option<T> {
        let message = self.rx.recv().await?;
        self.marks.release();
        Some(message)
    }

    pub fn len(&self) -> usize {
        self.marks.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.marks.close();
    }
}

/// Queue that pauses producers at `high` queued messages and resumes them at
/// `low`. `low` is clamped below `high`.
pub fn watermark_channel<T>(high: usize, low: usize) -> (Sender<T>, Receiver<T>) {
    let high = high.max(1);
    let marks = Arc::new(Watermarks {
        high,
        low: low.min(high - 1),
        level: Mutex::new(Level::default()),
        resumed: Notify::new(),
    });
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Sender {
            tx,
            marks: marks.clone(),
        },
        Receiver { rx, marks },
    )
}

/// Plain bounded queue: producers wait only while it holds `capacity` messages.
pub fn create_channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let capacity = capacity.max(1);
    watermark_channel(capacity, capacity - 1)
}
