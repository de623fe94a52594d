use crate::source::event::LogEvent;
use crate::storage::Checkpoint;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Request correlation number, taken from the send time in microseconds.
///
/// Two requests created within the same microsecond still get distinct,
/// increasing serials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Serial(u64);

static LAST_SERIAL: AtomicU64 = AtomicU64::new(0);

impl Serial {
    pub fn next() -> Self {
        let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
        let mut last = LAST_SERIAL.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last + 1);
            match LAST_SERIAL.compare_exchange_weak(last, candidate, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return Serial(candidate),
                Err(actual) => last = actual,
            }
        }
    }

    pub fn from_raw(value: u64) -> Self {
        Serial(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Parse the decimal wire form.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        std::str::from_utf8(bytes).ok()?.trim().parse().ok().map(Serial)
    }

    pub fn to_wire(&self) -> Vec<u8> {
        self.0.to_string().into_bytes()
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable batch of events on its way to the broker.
#[derive(Debug, Clone)]
pub struct Request {
    serial: Serial,
    events: Vec<LogEvent>,
}

impl Request {
    pub fn new(events: Vec<LogEvent>) -> Self {
        Self {
            serial: Serial::next(),
            events,
        }
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    pub fn events(&self) -> &[LogEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Position of the last event per path among the first `processed` events.
    pub fn checkpoints_through(&self, processed: usize) -> BTreeMap<PathBuf, Checkpoint> {
        let mut checkpoints = BTreeMap::new();
        for event in self.events.iter().take(processed) {
            checkpoints.insert(
                (*event.path).clone(),
                Checkpoint::new(event.identity, event.offset),
            );
        }
        checkpoints
    }

    /// The events past `processed`, as a fresh request with its own serial.
    pub fn tail(&self, processed: usize) -> Option<Request> {
        if processed >= self.events.len() {
            return None;
        }
        Some(Request::new(self.events[processed..].to_vec()))
    }
}
