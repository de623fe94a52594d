use crate::config::{FileSettings, StartPosition};
use crate::pipeline::channel::{create_channel, Control, PipelineMessage, Sender};
use std::collections::VecDeque;
use crate::pipeline::fatal::abort_on_exhaustion;
use crate::source::event::{FileIdentity, LogEvent};
use crate::source::multiline::run_assembler;
use crate::source::tokenizer::LineTokenizer;
use crate::storage::StateStore;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn, Instrument};

/// Capacity of the channel between a collector and its multiline assembler.
const ASSEMBLER_QUEUE: usize = 256;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("event queue closed")]
    QueueClosed,

    /// Told to stop while waiting for room in the queue.
    #[error("stopped")]
    Stopped,
}

/// What the directory monitor (or the shutdown path) tells a collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Modified,
    Created,
    Deleted,
    Renamed,
    Replaced,
    Check,
    Flush,
    Stop,
}

pub type NotificationSender = mpsc::UnboundedSender<Notification>;
pub type NotificationReceiver = mpsc::UnboundedReceiver<Notification>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// Tails one path and turns its contents into events.
pub struct Collector {
    settings: Arc<FileSettings>,
    path: Arc<PathBuf>,
    file: Option<File>,
    identity: Option<FileIdentity>,
    /// Bytes consumed from the current file.
    read_offset: u64,
    /// Position right after the last complete line.
    line_offset: u64,
    tokenizer: LineTokenizer,
    output: Sender<PipelineMessage>,
    has_assembler: bool,
    notifications: NotificationReceiver,
    /// Notifications taken off the channel but not handled yet.
    pending: VecDeque<Notification>,
    /// Events produced outside an async context, sent before the next read.
    parked: Vec<LogEvent>,
    state: Option<StateStore>,
}

impl Collector {
    pub fn new(
        settings: Arc<FileSettings>,
        output: Sender<PipelineMessage>,
        has_assembler: bool,
        notifications: NotificationReceiver,
        state: Option<StateStore>,
    ) -> Self {
        Self {
            path: Arc::new(settings.path.clone()),
            tokenizer: LineTokenizer::new(settings.delimiter.clone()),
            settings,
            file: None,
            identity: None,
            read_offset: 0,
            line_offset: 0,
            output,
            has_assembler,
            notifications,
            pending: VecDeque::new(),
            parked: Vec::new(),
            state,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn identity(&self) -> Option<FileIdentity> {
        self.identity
    }

    pub fn offset(&self) -> u64 {
        self.read_offset
    }

    /// Open at `start`, then follow notifications until told to stop or the
    /// file goes away for good.
    pub async fn run(mut self, start: StartPosition) {
        let mut outcome = Ok(Flow::Continue);
        if self.open(start) {
            outcome = self.read_to_eof().await.map(|()| Flow::Continue);
        }

        loop {
            match outcome {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => break,
                Err(CollectorError::Stopped) => {
                    debug!("stopped while the event queue was full");
                    break;
                }
                Err(CollectorError::QueueClosed) => {
                    warn!("event queue closed, collector exiting");
                    break;
                }
                Err(e) => warn!(error = %e, "read failed, will retry on next change"),
            }

            let Some(notification) = self.next_notification().await else {
                break;
            };
            debug!(?notification, "notification");
            outcome = self.handle(notification).await;
        }

        self.close();
        // Dropping the output ends the assembler, which emits what it still holds
        debug!("collector stopped");
    }

    /// Next notification, with consecutive duplicates folded into one.
    async fn next_notification(&mut self) -> Option<Notification> {
        let current = match self.pending.pop_front() {
            Some(notification) => notification,
            None => self.notifications.recv().await?,
        };
        loop {
            let next = match self.pending.front() {
                Some(&next) => next,
                None => match self.notifications.try_recv() {
                    Ok(next) => {
                        self.pending.push_back(next);
                        next
                    }
                    Err(_) => break,
                },
            };
            if next != current {
                break;
            }
            self.pending.pop_front();
        }
        Some(current)
    }


    async fn handle(&mut self, notification: Notification) -> Result<Flow, CollectorError> {
        match notification {
            Notification::Modified => {
                if self.file.is_none() {
                    if self.open(StartPosition::Offset(0)) {
                        self.read_to_eof().await?;
                    }
                    return Ok(Flow::Continue);
                }
                if self.current_size().is_some_and(|size| size < self.read_offset) {
                    self.restart_truncated().await?;
                }
                self.read_to_eof().await?;
            }
            Notification::Created => {
                if self.file.is_none() {
                    if self.open(StartPosition::Offset(0)) {
                        self.read_to_eof().await?;
                    }
                } else {
                    self.check().await?;
                }
            }
            Notification::Check => self.check().await?,
            Notification::Deleted | Notification::Renamed | Notification::Replaced => {
                return self.linger().await;
            }
            Notification::Flush => {
                if self.has_assembler {
                    self.send(PipelineMessage::Control(Control::Flush)).await?;
                }
            }
            Notification::Stop => return Ok(Flow::Exit),
        }
        Ok(Flow::Continue)
    }

    /// Open the path and position the read offset. Returns false when the file
    /// could not be opened; the next `created` or `modified` retries.
    fn open(&mut self, start: StartPosition) -> bool {
        let opened = File::open(&*self.path).and_then(|file| {
            let metadata = file.metadata()?;
            Ok((file, metadata))
        });
        let (mut file, metadata) = match opened {
            Ok(opened) => opened,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("file does not exist yet, waiting for it");
                return false;
            }
            Err(e) => {
                let e = abort_on_exhaustion("collector", e);
                warn!(error = %e, "failed to open file");
                return false;
            }
        };

        let identity = FileIdentity::from_metadata(&metadata);
        self.close();
        self.park_partial_line();
        self.identity = Some(identity);

        let size = metadata.len();
        let offset = match start {
            StartPosition::End => size,
            StartPosition::Offset(n) if n > size => {
                info!(requested = n, size, "start position past end of file, reading from start");
                0
            }
            StartPosition::Offset(n) => n,
        };

        if let Err(e) = file.seek(SeekFrom::Start(offset)) {
            let e = abort_on_exhaustion("collector", e);
            warn!(error = %e, "failed to seek");
            return false;
        }

        self.read_offset = offset;
        self.line_offset = offset;
        self.file = Some(file);
        if let Some(state) = &self.state {
            state.record_active_file(&self.path, identity);
        }
        info!(%identity, offset, "opened file");
        true
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            debug!("closed file");
        }
    }

    /// Whatever was left unterminated belongs to the file being closed. It
    /// cannot be sent from a sync context, so it is parked for the next read.
    fn park_partial_line(&mut self) {
        if self.tokenizer.is_empty() {
            return;
        }
        let remainder = self.tokenizer.flush();
        if let Some(identity) = self.identity {
            self.parked.push(self.event(remainder, identity, self.read_offset));
        }
    }

    fn current_size(&self) -> Option<u64> {
        self.file
            .as_ref()
            .and_then(|file| file.metadata().ok())
            .map(|metadata| metadata.len())
    }

    async fn restart_truncated(&mut self) -> Result<(), CollectorError> {
        info!(offset = self.read_offset, "file truncated, reading from start");
        if !self.tokenizer.is_empty() {
            let remainder = self.tokenizer.flush();
            if let Some(identity) = self.identity {
                let event = self.event(remainder, identity, self.read_offset);
                self.emit(event).await?;
            }
        }
        if let Some(file) = self.file.as_mut() {
            file.seek(SeekFrom::Start(0)).map_err(|source| CollectorError::Read {
                path: self.path.to_path_buf(),
                source: abort_on_exhaustion("collector", source),
            })?;
        }
        self.read_offset = 0;
        self.line_offset = 0;
        Ok(())
    }

    /// Reopen from the start if the path now names a different file.
    async fn check(&mut self) -> Result<(), CollectorError> {
        let current = match FileIdentity::of_path(&self.path) {
            Ok(identity) => identity,
            Err(e) => {
                debug!(error = %e, "path not accessible during check");
                return Ok(());
            }
        };

        if self.identity == Some(current) && self.file.is_some() {
            return Ok(());
        }

        if self.file.is_some() {
            info!(old = ?self.identity, new = %current, "file replaced, draining old handle");
            self.read_to_eof().await?;
        }
        if self.open(StartPosition::Offset(0)) {
            self.read_to_eof().await?;
        }
        Ok(())
    }

    /// Keep reading a file that has left its path until it stays quiet for
    /// a full dead time.
    async fn linger(&mut self) -> Result<Flow, CollectorError> {
        if self.file.is_none() {
            return Ok(Flow::Exit);
        }
        self.read_to_eof().await?;

        loop {
            let before = self.read_offset;
            let deadline = Instant::now() + self.settings.deadtime;
            loop {
                tokio::select! {
                    _ = sleep_until(deadline) => break,
                    notification = self.notifications.recv() => match notification {
                        Some(Notification::Stop) | None => return Ok(Flow::Exit),
                        Some(other) => debug!(notification = ?other, "ignored while draining"),
                    }
                }
            }

            self.read_to_eof().await?;
            if self.read_offset == before {
                info!(
                    deadtime = ?self.settings.deadtime,
                    offset = self.read_offset,
                    "no new data, closing"
                );
                return Ok(Flow::Exit);
            }
        }
    }

    async fn read_to_eof(&mut self) -> Result<(), CollectorError> {
        for event in std::mem::take(&mut self.parked) {
            self.emit(event).await?;
        }

        let Some(identity) = self.identity else {
            return Ok(());
        };
        let mut buf = vec![0u8; self.settings.chunk_size];
        let delimiter_len = self.tokenizer.delimiter_len() as u64;

        loop {
            let n = match self.read_chunk(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(CollectorError::Read {
                        path: self.path.to_path_buf(),
                        source: abort_on_exhaustion("collector", source),
                    })
                }
            };
            self.read_offset += n as u64;

            for line in self.tokenizer.extract(&buf[..n]) {
                self.line_offset += line.len() as u64 + delimiter_len;
                if self.settings.accepts(&line) {
                    let event = self.event(line, identity, self.line_offset);
                    self.emit(event).await?;
                }
            }
        }
        Ok(())
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.read(buf),
            None => Ok(0),
        }
    }

    fn event(&self, line: Vec<u8>, identity: FileIdentity, offset: u64) -> LogEvent {
        LogEvent::new(
            self.path.clone(),
            line,
            identity,
            offset,
            self.settings.tags.clone(),
        )
    }

    async fn emit(&mut self, event: LogEvent) -> Result<(), CollectorError> {
        self.send(PipelineMessage::Data(event)).await
    }

    /// Send downstream. While the queue is full, notifications keep being
    /// accepted: `Stop` abandons the send and the rest are handled afterwards.
    async fn send(&mut self, message: PipelineMessage) -> Result<(), CollectorError> {
        let send = self.output.send(message);
        tokio::pin!(send);
        loop {
            tokio::select! {
                biased;
                sent = &mut send => return sent.map_err(|_| CollectorError::QueueClosed),
                notification = self.notifications.recv() => match notification {
                    Some(Notification::Stop) | None => return Err(CollectorError::Stopped),
                    Some(other) => {
                        if self.pending.back() != Some(&other) {
                            self.pending.push_back(other);
                        }
                    }
                },
            }
        }
    }
}

/// A running collector and, when multiline is configured, its assembler.
pub struct CollectorHandle {
    notifier: NotificationSender,
    task: JoinHandle<()>,
    assembler: Option<JoinHandle<()>>,
}

impl CollectorHandle {
    /// Queue a notification; false once the collector has exited.
    pub fn notify(&self, notification: Notification) -> bool {
        self.notifier.send(notification).is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the collector to stop and wait for it and its assembler.
    pub async fn stop(self) {
        self.notify(Notification::Stop);
        self.join().await;
    }

    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "collector task failed");
        }
        if let Some(assembler) = self.assembler {
            if let Err(e) = assembler.await {
                warn!(error = %e, "assembler task failed");
            }
        }
    }
}

/// Start a collector task (plus its assembler) feeding `queue`.
pub fn spawn_collector(
    settings: Arc<FileSettings>,
    start: StartPosition,
    queue: Sender<PipelineMessage>,
    state: Option<StateStore>,
) -> CollectorHandle {
    let (notifier, notifications) = mpsc::unbounded_channel();
    let span = tracing::info_span!("collector", path = %settings.path.display());

    let (output, assembler) = match settings.multiline.clone() {
        Some(multiline) => {
            let (tx, rx) = create_channel(ASSEMBLER_QUEUE);
            let handle = tokio::spawn(run_assembler(rx, queue, multiline).instrument(span.clone()));
            (tx, Some(handle))
        }
        None => (queue, None),
    };

    let collector = Collector::new(settings, output, assembler.is_some(), notifications, state);
    let task = tokio::spawn(collector.run(start).instrument(span));

    CollectorHandle {
        notifier,
        task,
        assembler,
    }
}
