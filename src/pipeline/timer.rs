use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// A deadline that can be cancelled and restarted, meant to sit in a
/// `tokio::select!` branch next to the channel it guards.
#[derive(Debug)]
pub struct RestartableTimer {
    period: Duration,
    deadline: Option<Instant>,
}

impl RestartableTimer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            deadline: None,
        }
    }

    /// Cancel any pending deadline and schedule a new one a full period away.
    pub fn restart(&mut self) {
        self.deadline = Some(Instant::now() + self.period);
    }

    /// Start the timer unless it is already running.
    pub fn start_if_idle(&mut self) {
        if self.deadline.is_none() {
            self.restart();
        }
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves when the deadline passes; never resolves while disarmed.
    /// The timer is left armed, so callers cancel or restart it after firing.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}
