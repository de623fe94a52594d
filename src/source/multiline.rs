use crate::config::MultilineSettings;
use crate::pipeline::channel::{Control, PipelineMessage, Receiver, Sender};
use crate::pipeline::timer::RestartableTimer;
use crate::source::event::LogEvent;
use tracing::{debug, warn};

/// Folds continuation lines into the event that precedes them.
pub struct MultilineAssembler {
    settings: MultilineSettings,
    held: Option<LogEvent>,
}

impl MultilineAssembler {
    pub fn new(settings: MultilineSettings) -> Self {
        Self {
            settings,
            held: None,
        }
    }

    /// Feed one line; returns the previously held event once it is complete.
    pub fn push(&mut self, event: LogEvent) -> Option<LogEvent> {
        if self.settings.is_continuation(&event.line) {
            match self.held.as_mut() {
                Some(held) => held.append(event),
                None => {
                    debug!(path = %event.path.display(), "continuation without a preceding line");
                    self.held = Some(event);
                }
            }
            None
        } else {
            self.held.replace(event)
        }
    }

    /// Release the held event, if any.
    pub fn flush(&mut self) -> Option<LogEvent> {
        self.held.take()
    }

    pub fn is_holding(&self) -> bool {
        self.held.is_some()
    }
}

/// Run an assembler between a collector and the shared event queue.
///
/// The held event is force-emitted after `wait` without input, on a `Flush`
/// control, and on `Stop` (or when the collector side hangs up).
pub async fn run_assembler(
    mut input: Receiver<PipelineMessage>,
    output: Sender<PipelineMessage>,
    settings: MultilineSettings,
) {
    let mut idle = RestartableTimer::new(settings.wait);
    let mut assembler = MultilineAssembler::new(settings);

    loop {
        let ready = tokio::select! {
            message = input.recv() => match message {
                Some(PipelineMessage::Data(event)) => {
                    idle.restart();
                    assembler.push(event)
                }
                Some(PipelineMessage::Control(Control::Flush)) => {
                    idle.cancel();
                    assembler.flush()
                }
                Some(PipelineMessage::Control(Control::Stop)) | None => {
                    if let Some(event) = assembler.flush() {
                        let _ = output.send(PipelineMessage::Data(event)).await;
                    }
                    debug!("multiline assembler stopped");
                    return;
                }
            },
            _ = idle.expired() => {
                idle.cancel();
                assembler.flush()
            }
        };

        if let Some(event) = ready {
            if output.send(PipelineMessage::Data(event)).await.is_err() {
                warn!("event queue closed, multiline assembler exiting");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::channel::create_channel;
    use crate::source::event::FileIdentity;
    use regex::bytes::Regex;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    fn settings(pattern: &str, invert: bool, wait: Duration) -> MultilineSettings {
        MultilineSettings {
            pattern: Regex::new(pattern).unwrap(),
            invert,
            wait,
        }
    }

    fn line(text: &str, offset: u64) -> LogEvent {
        LogEvent::new(
            Arc::new(PathBuf::from("/var/log/app.log")),
            text.as_bytes().to_vec(),
            FileIdentity::new(1, 2),
            offset,
            Arc::new(BTreeMap::new()),
        )
    }

    #[test]
    fn test_continuations_are_appended() {
        let mut assembler = MultilineAssembler::new(settings(r"^\s", false, Duration::from_secs(5)));

        assert!(assembler.push(line("Traceback:", 11)).is_none());
        assert!(assembler.push(line("  File x.py", 23)).is_none());
        assert!(assembler.push(line("  raise Error", 37)).is_none());

        let emitted = assembler.push(line("next record", 49)).unwrap();
        assert_eq!(emitted.message(), "Traceback:\n  File x.py\n  raise Error");
        assert_eq!(emitted.offset, 37);

        let last = assembler.flush().unwrap();
        assert_eq!(last.message(), "next record");
        assert!(!assembler.is_holding());
    }

    #[test]
    fn test_inverted_pattern() {
        // Lines NOT starting with a date continue the previous record
        let mut assembler =
            MultilineAssembler::new(settings(r"^\d{4}-", true, Duration::from_secs(5)));

        assert!(assembler.push(line("2025-01-01 start", 17)).is_none());
        assert!(assembler.push(line("detail", 24)).is_none());
        let emitted = assembler.push(line("2025-01-02 next", 40)).unwrap();
        assert_eq!(emitted.message(), "2025-01-01 start\ndetail");
    }

    #[test]
    fn test_leading_continuation_is_held() {
        let mut assembler = MultilineAssembler::new(settings(r"^\s", false, Duration::from_secs(5)));
        assert!(assembler.push(line("  orphan", 9)).is_none());
        assert!(assembler.push(line("  more", 16)).is_none());
        assert_eq!(assembler.flush().unwrap().message(), "  orphan\n  more");
    }

    #[tokio::test]
    async fn test_idle_wait_flushes_held_event() {
        let (in_tx, in_rx) = create_channel(16);
        let (out_tx, mut out_rx) = create_channel(16);
        let handle = tokio::spawn(run_assembler(
            in_rx,
            out_tx,
            settings(r"^\s", false, Duration::from_millis(50)),
        ));

        for (text, offset) in [("first", 6), ("  cont", 13), ("second", 20), ("  cont2", 28)] {
            in_tx.send(PipelineMessage::Data(line(text, offset))).await.unwrap();
        }

        let first = match out_rx.recv().await.unwrap() {
            PipelineMessage::Data(event) => event,
            other => panic!("unexpected message {:?}", other),
        };
        assert_eq!(first.message(), "first\n  cont");

        // Nothing else arrives until the idle wait passes
        let second = tokio::time::timeout(Duration::from_secs(1), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match second {
            PipelineMessage::Data(event) => {
                assert_eq!(event.message(), "second\n  cont2");
                assert_eq!(event.offset, 28);
            }
            other => panic!("unexpected message {:?}", other),
        }

        in_tx.send(PipelineMessage::Control(Control::Stop)).await.unwrap();
        handle.await.unwrap();
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_flush_control_emits_immediately() {
        let (in_tx, in_rx) = create_channel(16);
        let (out_tx, mut out_rx) = create_channel(16);
        tokio::spawn(run_assembler(
            in_rx,
            out_tx,
            settings(r"^\s", false, Duration::from_secs(60)),
        ));

        in_tx.send(PipelineMessage::Data(line("held", 5))).await.unwrap();
        in_tx.send(PipelineMessage::Control(Control::Flush)).await.unwrap();

        let flushed = tokio::time::timeout(Duration::from_millis(500), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(flushed, PipelineMessage::Data(ref e) if e.message() == "held"));
    }
}
