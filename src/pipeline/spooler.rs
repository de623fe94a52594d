use crate::config::settings::SpoolSettings;
use crate::pipeline::channel::{Control, PipelineMessage, Receiver};
use crate::pipeline::request::Request;
use crate::pipeline::timer::RestartableTimer;
use crate::source::event::LogEvent;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("delivery client has shut down")]
    HandoffClosed,
}

/// A request together with the handoff slot it occupies. The slot frees up
/// when this is dropped, i.e. once the delivery client is done with it.
#[derive(Debug)]
pub struct PendingRequest {
    pub request: Request,
    _slot: OwnedSemaphorePermit,
}

/// Spooler side of the one-slot handoff to the delivery client.
#[derive(Debug, Clone)]
pub struct RequestSender {
    tx: mpsc::Sender<PendingRequest>,
    slot: Arc<Semaphore>,
}

impl RequestSender {
    /// Wait until the previous request is acknowledged, then hand this one over.
    pub async fn send(&self, request: Request) -> Result<(), SpoolError> {
        let slot = self
            .slot
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SpoolError::HandoffClosed)?;
        self.tx
            .send(PendingRequest {
                request,
                _slot: slot,
            })
            .await
            .map_err(|_| SpoolError::HandoffClosed)
    }
}

pub type RequestReceiver = mpsc::Receiver<PendingRequest>;

/// Create the handoff between spooler and delivery client. At most one request
/// is outstanding at any time.
pub fn request_handoff() -> (RequestSender, RequestReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (
        RequestSender {
            tx,
            slot: Arc::new(Semaphore::new(1)),
        },
        rx,
    )
}

/// Batches events from the shared queue into requests.
pub struct Spooler {
    settings: SpoolSettings,
    input: Receiver<PipelineMessage>,
    output: RequestSender,
    buffer: Vec<LogEvent>,
    timer: RestartableTimer,
}

impl Spooler {
    pub fn new(settings: SpoolSettings, input: Receiver<PipelineMessage>, output: RequestSender) -> Self {
        Self {
            timer: RestartableTimer::new(settings.flush_interval),
            buffer: Vec::with_capacity(settings.flush_size),
            settings,
            input,
            output,
        }
    }

    /// Drain the queue until `Stop` arrives or every producer is gone.
    pub async fn run(mut self) -> Result<(), SpoolError> {
        info!(
            flush_size = self.settings.flush_size,
            flush_interval = ?self.settings.flush_interval,
            "spooler started"
        );

        loop {
            tokio::select! {
                message = self.input.recv() => match message {
                    Some(PipelineMessage::Data(event)) => {
                        self.timer.start_if_idle();
                        self.buffer.push(event);
                        if self.buffer.len() >= self.settings.flush_size {
                            self.flush().await?;
                        }
                    }
                    Some(PipelineMessage::Control(Control::Flush)) => self.flush().await?,
                    Some(PipelineMessage::Control(Control::Stop)) | None => {
                        self.flush().await?;
                        info!("spooler stopped");
                        return Ok(());
                    }
                },
                _ = self.timer.expired() => self.flush().await?,
            }
        }
    }

    async fn flush(&mut self) -> Result<(), SpoolError> {
        self.timer.cancel();
        if self.buffer.is_empty() {
            return Ok(());
        }

        let events = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.settings.flush_size));
        let request = Request::new(events);
        debug!(serial = %request.serial(), events = request.len(), "flushing request");
        self.output.send(request).await
    }
}
