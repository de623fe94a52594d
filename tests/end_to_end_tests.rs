/// End-to-end tests for the shipping pipeline
///
/// Collector → (assembler) → spooler → delivery client → scripted broker,
/// with the state file checked on disk afterwards.
use async_trait::async_trait;
use flate2::read::ZlibDecoder;
use logship::config::settings::{NetworkSettings, SpoolSettings};
use logship::config::{FileSettings, MultilineSettings, StartPosition};
use logship::delivery::transport::Result as TransportResult;
use logship::delivery::{BrokerTransport, DeliveryClient};
use logship::pipeline::{request_handoff, watermark_channel, Control, PipelineMessage, Serial, Spooler};
use logship::source::collector::spawn_collector;
use logship::storage::StateStore;
use regex::bytes::Regex;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod tests {
    use super::*;

    /// Broker that acknowledges according to a script, then acknowledges everything.
    struct ScriptedBroker {
        /// Never answer, as if the broker were unreachable.
        silent: bool,
        partial_acks: VecDeque<usize>,
        inbox: VecDeque<Vec<Vec<u8>>>,
        payloads: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    #[async_trait]
    impl BrokerTransport for ScriptedBroker {
        async fn connect(&mut self) -> TransportResult<()> {
            Ok(())
        }

        async fn disconnect(&mut self) {}

        async fn send(&mut self, frames: Vec<Vec<u8>>) -> TransportResult<()> {
            let serial = Serial::parse(&frames[1]).unwrap();
            let mut json = String::new();
            ZlibDecoder::new(frames[2].as_slice()).read_to_string(&mut json).unwrap();
            let payload: serde_json::Value = serde_json::from_str(&json).unwrap();
            let n = payload["n"].as_u64().unwrap() as usize;
            self.payloads.lock().unwrap().push(payload);
            if self.silent {
                return Ok(());
            }

            let processed = self.partial_acks.pop_front().unwrap_or(n);
            self.inbox.push_back(vec![
                Vec::new(),
                serial.to_wire(),
                format!(r#"["ACK", {}]"#, processed).into_bytes(),
            ]);
            Ok(())
        }

        async fn recv(&mut self) -> TransportResult<Vec<Vec<u8>>> {
            match self.inbox.pop_front() {
                Some(frames) => Ok(frames),
                None => std::future::pending().await,
            }
        }
    }

    struct Pipeline {
        queue: logship::pipeline::Sender<PipelineMessage>,
        spooler: JoinHandle<Result<(), logship::pipeline::SpoolError>>,
        client: JoinHandle<()>,
        payloads: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    impl Pipeline {
        fn start(state: &StateStore, partial_acks: Vec<usize>) -> Self {
            let payloads = Arc::new(Mutex::new(Vec::new()));
            let broker = ScriptedBroker {
                silent: false,
                partial_acks: partial_acks.into(),
                inbox: VecDeque::new(),
                payloads: payloads.clone(),
            };

            let (queue, queue_rx) = watermark_channel(64, 48);
            let (request_tx, request_rx) = request_handoff();
            let network = NetworkSettings {
                servers: vec!["tcp://127.0.0.1:5559".to_string()],
                client_id: None,
                send_error_delay: Duration::from_millis(10),
                recv_tries: 3,
                recv_timeout: Duration::from_millis(200),
            };
            let spool = SpoolSettings {
                queue_high: 64,
                queue_low: 48,
                flush_interval: Duration::from_millis(50),
                flush_size: 100,
            };

            let client = DeliveryClient::new(
                broker,
                network,
                "test-host".to_string(),
                state.clone(),
                CancellationToken::new(),
            );
            Pipeline {
                client: tokio::spawn(client.run(request_rx)),
                spooler: tokio::spawn(Spooler::new(spool, queue_rx, request_tx).run()),
                queue,
                payloads,
            }
        }

        /// Stop the spooler and wait until everything is acknowledged.
        async fn finish(self) -> Vec<serde_json::Value> {
            self.queue.send(PipelineMessage::Control(Control::Stop)).await.unwrap();
            drop(self.queue);
            tokio::time::timeout(Duration::from_secs(5), self.spooler)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            tokio::time::timeout(Duration::from_secs(5), self.client)
                .await
                .unwrap()
                .unwrap();
            let payloads = self.payloads.lock().unwrap().clone();
            payloads
        }
    }

    fn messages(payloads: &[serde_json::Value]) -> Vec<String> {
        payloads
            .iter()
            .flat_map(|p| p["events"].as_array().unwrap().iter())
            .map(|e| e["msg"].as_str().unwrap().to_string())
            .collect()
    }

    fn saved_position(state_file: &Path, log: &Path) -> u64 {
        let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(state_file).unwrap()).unwrap();
        raw[log.to_str().unwrap()]["pos"].as_u64().unwrap()
    }

    /// Run one collector over `log` until it has produced `expected` events.
    async fn collect(
        settings: FileSettings,
        start: StartPosition,
        state: &StateStore,
        partial_acks: Vec<usize>,
        expected: usize,
    ) -> Vec<serde_json::Value> {
        let pipeline = Pipeline::start(state, partial_acks);
        let collector = spawn_collector(Arc::new(settings), start, pipeline.queue.clone(), Some(state.clone()));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while messages(&pipeline.payloads.lock().unwrap()).len() < expected {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for delivery");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        collector.stop().await;
        pipeline.finish().await
    }

    #[tokio::test]
    async fn test_lines_delivered_and_checkpointed() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("app.log");
        let state_file = dir.path().join("state.json");
        std::fs::write(&log, b"a\nb\nc\n").unwrap();

        let state = StateStore::load(&state_file);
        let payloads = collect(FileSettings::new(&log), StartPosition::Offset(0), &state, vec![], 3).await;

        assert_eq!(messages(&payloads), vec!["a", "b", "c"]);
        assert_eq!(payloads[0]["host"], "test-host");
        assert_eq!(payloads[0]["events"][0]["file"], log.to_str().unwrap());
        assert_eq!(saved_position(&state_file, &log), 6);
    }

    #[tokio::test]
    async fn test_partial_ack_resends_only_the_tail() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("app.log");
        let state_file = dir.path().join("state.json");
        std::fs::write(&log, b"one\ntwo\nthree\n").unwrap();

        let state = StateStore::load(&state_file);
        let payloads = collect(FileSettings::new(&log), StartPosition::Offset(0), &state, vec![1], 5).await;

        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0]["n"], 3);
        assert_eq!(payloads[1]["n"], 2);
        assert_ne!(payloads[0]["serial"], payloads[1]["serial"]);
        assert_eq!(messages(&payloads[1..]), vec!["two", "three"]);
        assert_eq!(saved_position(&state_file, &log), 14);
    }

    #[tokio::test]
    async fn test_restart_resumes_after_acknowledged_data() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("app.log");
        let state_file = dir.path().join("state.json");
        std::fs::write(&log, b"a\nb\nc\n").unwrap();

        let state = StateStore::load(&state_file);
        collect(FileSettings::new(&log), StartPosition::Offset(0), &state, vec![], 3).await;

        // Data written while the agent was down
        std::fs::OpenOptions::new()
            .append(true)
            .open(&log)
            .unwrap()
            .write_all(b"d\n")
            .unwrap();

        let state = StateStore::load(&state_file);
        let start = state.resolve_start(&log, StartPosition::End);
        assert_eq!(start, StartPosition::Offset(6));

        let payloads = collect(FileSettings::new(&log), start, &state, vec![], 1).await;
        assert_eq!(messages(&payloads), vec!["d"]);
        assert_eq!(saved_position(&state_file, &log), 8);
    }

    #[tokio::test]
    async fn test_restart_after_truncation_reads_from_start() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("app.log");
        let state_file = dir.path().join("state.json");
        std::fs::write(&log, b"first run line\n").unwrap();

        let state = StateStore::load(&state_file);
        collect(FileSettings::new(&log), StartPosition::Offset(0), &state, vec![], 1).await;

        std::fs::write(&log, b"new\n").unwrap();
        let state = StateStore::load(&state_file);
        let start = state.resolve_start(&log, StartPosition::End);
        assert_eq!(start, StartPosition::Offset(0));

        let payloads = collect(FileSettings::new(&log), start, &state, vec![], 1).await;
        assert_eq!(messages(&payloads), vec!["new"]);
        assert_eq!(saved_position(&state_file, &log), 4);
    }

    #[tokio::test]
    async fn test_multiline_record_flushed_after_idle_wait() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("app.log");
        let state_file = dir.path().join("state.json");
        std::fs::write(
            &log,
            b"Exception in main\n  at Foo.bar(Foo.java:10)\n  at Main.main(Main.java:3)\n",
        )
        .unwrap();

        let mut settings = FileSettings::new(&log);
        let mut multiline = MultilineSettings::new(Regex::new(r"^\s").unwrap());
        multiline.wait = Duration::from_millis(50);
        settings.multiline = Some(multiline);

        let state = StateStore::load(&state_file);
        let payloads = collect(settings, StartPosition::Offset(0), &state, vec![], 1).await;

        assert_eq!(
            messages(&payloads),
            vec!["Exception in main\n  at Foo.bar(Foo.java:10)\n  at Main.main(Main.java:3)"]
        );
        assert_eq!(saved_position(&state_file, &log), 72);
    }

    #[tokio::test]
    async fn test_tags_flattened_into_events() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("app.log");
        std::fs::write(&log, b"tagged\n").unwrap();

        let mut settings = FileSettings::new(&log);
        settings.tags = Arc::new([("app".to_string(), "billing".to_string())].into_iter().collect());

        let state = StateStore::load(dir.path().join("state.json"));
        let payloads = collect(settings, StartPosition::Offset(0), &state, vec![], 1).await;
        assert_eq!(payloads[0]["events"][0]["app"], "billing");
    }

    #[tokio::test]
    async fn test_shutdown_completes_with_unreachable_broker() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("app.log");
        let lines: String = (0..20).map(|n| format!("line {}\n", n)).collect();
        std::fs::write(&log, lines).unwrap();
        let state = StateStore::load(dir.path().join("state.json"));

        let payloads = Arc::new(Mutex::new(Vec::new()));
        let broker = ScriptedBroker {
            silent: true,
            partial_acks: VecDeque::new(),
            inbox: VecDeque::new(),
            payloads: payloads.clone(),
        };
        let network = NetworkSettings {
            servers: vec!["tcp://127.0.0.1:5559".to_string()],
            client_id: None,
            send_error_delay: Duration::from_millis(10),
            recv_tries: 2,
            recv_timeout: Duration::from_millis(20),
        };
        let spool = SpoolSettings {
            queue_high: 4,
            queue_low: 2,
            flush_interval: Duration::from_millis(50),
            flush_size: 2,
        };

        let (queue, queue_rx) = watermark_channel(spool.queue_high, spool.queue_low);
        let (request_tx, request_rx) = request_handoff();
        let shutdown = CancellationToken::new();
        let client = DeliveryClient::new(broker, network, "test-host".to_string(), state.clone(), shutdown.clone());
        let client = tokio::spawn(client.run(request_rx));
        let spooler = tokio::spawn(Spooler::new(spool, queue_rx, request_tx).run());
        let collector = spawn_collector(Arc::new(FileSettings::new(&log)), StartPosition::Offset(0), queue.clone(), Some(state.clone()));

        // Let the queue fill up behind the first undeliverable request
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(queue.is_paused());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), collector.stop())
            .await
            .expect("collector did not stop");
        tokio::time::timeout(Duration::from_secs(5), queue.send(PipelineMessage::Control(Control::Stop)))
            .await
            .unwrap()
            .unwrap();
        drop(queue);
        tokio::time::timeout(Duration::from_secs(5), spooler).await.unwrap().unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(5), client).await.unwrap().unwrap();

        // Nothing was acknowledged, so nothing may be checkpointed
        assert!(!payloads.lock().unwrap().is_empty());
        assert!(state.get(&log).is_none());
    }
}
