use crate::config::settings::NetworkSettings;
use crate::delivery::transport::{BrokerTransport, TransportError};
use crate::delivery::wire::{self, Response, WireError};
use crate::pipeline::request::{Request, Serial};
use crate::pipeline::spooler::RequestReceiver;
use crate::storage::StateStore;
use thiserror::Error;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Random client identity in the `C:XXXX-XXXX` form the broker expects.
pub fn random_client_id() -> String {
    let bytes = uuid::Uuid::new_v4();
    let bytes = bytes.as_bytes();
    format!(
        "C:{:04X}-{:04X}",
        u16::from_be_bytes([bytes[0], bytes[1]]),
        u16::from_be_bytes([bytes[2], bytes[3]])
    )
}

/// Result of one attempt (a bounded series of tries) at a request.
#[derive(Debug, PartialEq, Eq)]
enum Attempt {
    Acked(usize),
    Exhausted,
}

/// Result of waiting for the response to one try.
#[derive(Debug)]
enum Reply {
    Acked(usize),
    /// The response was for another request or unreadable.
    Resend,
    TimedOut,
}

/// Sends requests one at a time and checkpoints what the broker confirms.
pub struct DeliveryClient<T> {
    transport: T,
    settings: NetworkSettings,
    host: String,
    state: StateStore,
    shutdown: CancellationToken,
    connected: bool,
}

impl<T: BrokerTransport> DeliveryClient<T> {
    pub fn new(
        transport: T,
        settings: NetworkSettings,
        host: String,
        state: StateStore,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            settings,
            host,
            state,
            shutdown,
            connected: false,
        }
    }

    /// Deliver requests until the spooler closes the handoff. Between
    /// requests the open connection is still served, so broker pings never
    /// go unanswered.
    pub async fn run(mut self, mut requests: RequestReceiver) {
        info!(servers = ?self.settings.servers, "delivery client started");
        loop {
            tokio::select! {
                biased;
                pending = requests.recv() => match pending {
                    // The handoff slot stays taken until `pending` drops after delivery
                    Some(pending) => self.deliver(pending.request.clone()).await,
                    None => break,
                },
                frames = self.transport.recv(), if self.connected => self.handle_idle(frames).await,
            }
        }
        self.reset().await;
        info!("delivery client stopped");
    }

    async fn handle_idle(&mut self, frames: Result<Vec<Vec<u8>>, TransportError>) {
        let frames = match frames {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, "connection failed while idle, reconnecting on next request");
                self.reset().await;
                return;
            }
        };

        match wire::decode_response(&frames) {
            Ok(Response::Ping) => {
                debug!("ping from broker while idle");
                if let Err(e) = self.transport.send(wire::pong_frames()).await {
                    warn!(error = %e, "failed to answer ping, reconnecting on next request");
                    self.reset().await;
                }
            }
            Ok(Response::Ack { serial, processed }) => {
                debug!(%serial, processed, "late acknowledgment while idle, discarding");
            }
            Err(e) => debug!(error = %e, "discarding message while idle"),
        }
    }

    async fn deliver(&mut self, mut request: Request) {
        loop {
            let attempt = match self.attempt(&request).await {
                Ok(attempt) => attempt,
                Err(e) => {
                    error!(serial = %request.serial(), error = %e, "cannot encode request, dropping it");
                    return;
                }
            };

            match attempt {
                Attempt::Acked(processed) => {
                    let processed = processed.min(request.len());
                    self.commit(&request, processed);

                    if processed == request.len() {
                        debug!(serial = %request.serial(), events = processed, "request acknowledged");
                        return;
                    }
                    if processed == 0 {
                        warn!(serial = %request.serial(), "broker processed nothing, resending");
                        if self.abandon_or_wait(&request).await {
                            return;
                        }
                        continue;
                    }
                    if let Some(tail) = request.tail(processed) {
                        info!(
                            serial = %request.serial(),
                            processed,
                            remaining = tail.len(),
                            resend_serial = %tail.serial(),
                            "partial acknowledgment, resending the rest"
                        );
                        request = tail;
                    }
                }
                Attempt::Exhausted => {
                    warn!(
                        serial = %request.serial(),
                        tries = self.settings.recv_tries,
                        "no acknowledgment from broker"
                    );
                    if self.abandon_or_wait(&request).await {
                        return;
                    }
                }
            }
        }
    }

    /// Sleep the error delay before the next attempt. Returns true when the
    /// request should be given up because we are shutting down.
    async fn abandon_or_wait(&self, request: &Request) -> bool {
        if self.shutdown.is_cancelled() {
            error!(
                serial = %request.serial(),
                events = request.len(),
                "shutting down, abandoning undelivered events"
            );
            return true;
        }
        tokio::select! {
            _ = sleep(self.settings.send_error_delay) => {}
            _ = self.shutdown.cancelled() => {}
        }
        false
    }

    async fn attempt(&mut self, request: &Request) -> Result<Attempt, WireError> {
        let frames = wire::encode_request(request, &self.host)?;
        let serial = request.serial();

        for try_number in 1..=self.settings.recv_tries {
            if let Err(e) = self.ensure_connected().await {
                warn!(try_number, error = %e, "broker connection failed");
                continue;
            }

            debug!(%serial, try_number, events = request.len(), "sending request");
            if let Err(e) = self.transport.send(frames.clone()).await {
                warn!(%serial, try_number, error = %e, "send failed, reconnecting");
                self.reset().await;
                continue;
            }

            match self.await_reply(serial).await {
                Ok(Reply::Acked(processed)) => return Ok(Attempt::Acked(processed)),
                Ok(Reply::Resend) => {}
                Ok(Reply::TimedOut) => {
                    warn!(%serial, try_number, timeout = ?self.settings.recv_timeout, "no response, reconnecting");
                    self.reset().await;
                }
                Err(e) => {
                    warn!(%serial, try_number, error = %e, "receive failed, reconnecting");
                    self.reset().await;
                }
            }
        }
        Ok(Attempt::Exhausted)
    }

    async fn await_reply(&mut self, serial: Serial) -> Result<Reply, DeliveryError> {
        let mut deadline = Instant::now() + self.settings.recv_timeout;
        loop {
            let frames = match timeout_at(deadline, self.transport.recv()).await {
                Ok(frames) => frames?,
                Err(_) => return Ok(Reply::TimedOut),
            };

            match wire::decode_response(&frames) {
                Ok(Response::Ping) => {
                    debug!("ping from broker");
                    self.transport.send(wire::pong_frames()).await?;
                    deadline = Instant::now() + self.settings.recv_timeout;
                }
                Ok(Response::Ack { serial: acked, processed }) if acked == serial => {
                    return Ok(Reply::Acked(processed));
                }
                Ok(Response::Ack { serial: acked, processed }) => {
                    warn!(expected = %serial, received = %acked, processed, "acknowledgment for another request, discarding");
                    return Ok(Reply::Resend);
                }
                Err(e) => {
                    warn!(%serial, error = %e, "discarding response");
                    return Ok(Reply::Resend);
                }
            }
        }
    }

    fn commit(&self, request: &Request, processed: usize) {
        if processed == 0 {
            return;
        }
        let checkpoints = request.checkpoints_through(processed);
        match self.state.checkpoint(&checkpoints) {
            Ok(applied) => debug!(serial = %request.serial(), processed, applied, "checkpointed"),
            Err(e) => error!(serial = %request.serial(), error = %e, "failed to write state file"),
        }
    }

    async fn ensure_connected(&mut self) -> Result<(), TransportError> {
        if !self.connected {
            self.transport.connect().await?;
            self.connected = true;
        }
        Ok(())
    }

    async fn reset(&mut self) {
        if self.connected {
            self.transport.disconnect().await;
            self.connected = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::spooler::request_handoff;
    use crate::source::event::{FileIdentity, LogEvent};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, VecDeque};
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    /// What the scripted broker does with each incoming request.
    #[derive(Debug, Clone)]
    enum Script {
        Ack(usize),
        AckOther(usize),
        Ping,
        /// Acknowledge, then ping once the client has gone idle.
        AckThenPing(usize),
        Silent,
    }

    #[derive(Default)]
    struct Log {
        sent: Vec<Vec<Vec<u8>>>,
        connects: usize,
    }

    struct ScriptedTransport {
        script: VecDeque<Script>,
        inbox: VecDeque<Vec<Vec<u8>>>,
        log: Arc<Mutex<Log>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Script>) -> (Self, Arc<Mutex<Log>>) {
            let log = Arc::new(Mutex::new(Log::default()));
            (
                Self {
                    script: script.into(),
                    inbox: VecDeque::new(),
                    log: log.clone(),
                },
                log,
            )
        }
    }

    #[async_trait]
    impl BrokerTransport for ScriptedTransport {
        async fn connect(&mut self) -> crate::delivery::transport::Result<()> {
            self.log.lock().unwrap().connects += 1;
            Ok(())
        }

        async fn disconnect(&mut self) {
            self.inbox.clear();
        }

        async fn send(&mut self, frames: Vec<Vec<u8>>) -> crate::delivery::transport::Result<()> {
            self.log.lock().unwrap().sent.push(frames.clone());
            if frames.get(1).map(|f| f.as_slice()) == Some(&[wire::PONG][..]) {
                return Ok(());
            }
            let serial = Serial::parse(&frames[1]).unwrap();
            let ack = |serial: Serial, n: usize| {
                vec![Vec::new(), serial.to_wire(), format!(r#"["ACK", {}]"#, n).into_bytes()]
            };
            match self.script.pop_front() {
                Some(Script::Ack(n)) => self.inbox.push_back(ack(serial, n)),
                Some(Script::AckOther(n)) => {
                    self.inbox.push_back(ack(Serial::from_raw(serial.value() + 1), n))
                }
                Some(Script::Ping) => {
                    self.inbox.push_back(vec![Vec::new(), vec![wire::PING]]);
                    self.inbox.push_back(ack(serial, usize::MAX));
                }
                Some(Script::AckThenPing(n)) => {
                    self.inbox.push_back(ack(serial, n));
                    self.inbox.push_back(vec![Vec::new(), vec![wire::PING]]);
                }
                Some(Script::Silent) | None => {}
            }
            Ok(())
        }

        async fn recv(&mut self) -> crate::delivery::transport::Result<Vec<Vec<u8>>> {
            match self.inbox.pop_front() {
                Some(frames) => Ok(frames),
                None => std::future::pending().await,
            }
        }
    }

    fn network(recv_tries: usize) -> NetworkSettings {
        NetworkSettings {
            servers: vec!["tcp://127.0.0.1:5559".to_string()],
            client_id: None,
            send_error_delay: Duration::from_millis(10),
            recv_tries,
            recv_timeout: Duration::from_millis(30),
        }
    }

    fn request(offsets: &[u64]) -> Request {
        Request::new(
            offsets
                .iter()
                .map(|&offset| {
                    LogEvent::new(
                        Arc::new(PathBuf::from("/var/log/app.log")),
                        format!("line {}", offset).into_bytes(),
                        FileIdentity::new(1, 9),
                        offset,
                        Arc::new(BTreeMap::new()),
                    )
                })
                .collect(),
        )
    }

    fn sent_serials(log: &Arc<Mutex<Log>>) -> Vec<Serial> {
        log.lock()
            .unwrap()
            .sent
            .iter()
            .filter(|frames| frames.len() == 3)
            .map(|frames| Serial::parse(&frames[1]).unwrap())
            .collect()
    }

    async fn deliver(script: Vec<Script>, tries: usize, request: Request) -> (StateStore, Arc<Mutex<Log>>, TempDir) {
        let dir = TempDir::new().unwrap();
        let state = StateStore::load(dir.path().join("state.json"));
        let (transport, log) = ScriptedTransport::new(script);
        let (tx, rx) = request_handoff();
        let client = DeliveryClient::new(
            transport,
            network(tries),
            "test-host".to_string(),
            state.clone(),
            CancellationToken::new(),
        );
        let handle = tokio::spawn(client.run(rx));
        tx.send(request).await.unwrap();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        (state, log, dir)
    }

    #[test]
    fn test_client_id_format() {
        let id = random_client_id();
        assert_eq!(id.len(), 11);
        assert!(id.starts_with("C:"));
        assert_eq!(&id[6..7], "-");
        assert!(id[2..6].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[tokio::test]
    async fn test_full_ack_checkpoints_last_event() {
        let (state, log, _dir) = deliver(vec![Script::Ack(3)], 3, request(&[2, 4, 6])).await;
        assert_eq!(state.get(&PathBuf::from("/var/log/app.log")).unwrap().pos, 6);
        assert_eq!(sent_serials(&log).len(), 1);
    }

    #[tokio::test]
    async fn test_mismatched_ack_discarded_and_resent() {
        let original = request(&[2, 4]);
        let serial = original.serial();
        let (state, log, _dir) = deliver(vec![Script::AckOther(2), Script::Ack(2)], 3, original).await;

        let serials = sent_serials(&log);
        assert_eq!(serials, vec![serial, serial]);
        assert_eq!(state.get(&PathBuf::from("/var/log/app.log")).unwrap().pos, 4);
    }

    #[tokio::test]
    async fn test_partial_ack_resends_tail_with_new_serial() {
        let original = request(&[10, 20, 30, 40]);
        let serial = original.serial();
        let (state, log, _dir) = deliver(vec![Script::Ack(1), Script::Ack(3)], 3, original).await;

        let sent = log.lock().unwrap().sent.clone();
        assert_eq!(sent.len(), 2);
        let tail_serial = Serial::parse(&sent[1][1]).unwrap();
        assert_ne!(tail_serial, serial);

        let mut json = String::new();
        std::io::Read::read_to_string(&mut flate2::read::ZlibDecoder::new(sent[1][2].as_slice()), &mut json).unwrap();
        let payload: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(payload["n"], 3);
        assert_eq!(payload["events"][0]["msg"], "line 20");

        assert_eq!(state.get(&PathBuf::from("/var/log/app.log")).unwrap().pos, 40);
    }

    #[tokio::test]
    async fn test_timeout_reconnects_then_succeeds() {
        let (state, log, _dir) = deliver(vec![Script::Silent, Script::Ack(1)], 3, request(&[7])).await;
        assert_eq!(log.lock().unwrap().connects, 2);
        assert_eq!(state.get(&PathBuf::from("/var/log/app.log")).unwrap().pos, 7);
    }

    #[tokio::test]
    async fn test_exhausted_tries_retry_after_delay() {
        let script = vec![Script::Silent, Script::Silent, Script::Ack(1)];
        let (state, log, _dir) = deliver(script, 2, request(&[7])).await;
        assert_eq!(sent_serials(&log).len(), 3);
        assert_eq!(state.get(&PathBuf::from("/var/log/app.log")).unwrap().pos, 7);
    }

    #[tokio::test]
    async fn test_ping_answered_and_overcount_clamped() {
        let (state, log, _dir) = deliver(vec![Script::Ping], 1, request(&[3, 5])).await;
        let pongs = log
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|frames| frames.as_slice() == wire::pong_frames().as_slice())
            .count();
        assert_eq!(pongs, 1);
        assert_eq!(state.get(&PathBuf::from("/var/log/app.log")).unwrap().pos, 5);
    }

    #[tokio::test]
    async fn test_shutdown_abandons_after_one_attempt() {
        let dir = TempDir::new().unwrap();
        let state = StateStore::load(dir.path().join("state.json"));
        let (transport, log) = ScriptedTransport::new(vec![]);
        let (tx, rx) = request_handoff();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let client = DeliveryClient::new(transport, network(2), "test-host".to_string(), state.clone(), shutdown);
        let handle = tokio::spawn(client.run(rx));
        tx.send(request(&[1])).await.unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(sent_serials(&log).len(), 2);
        assert!(state.get(&PathBuf::from("/var/log/app.log")).is_none());
    }

    #[tokio::test]
    async fn test_ping_answered_while_idle() {
        let dir = TempDir::new().unwrap();
        let state = StateStore::load(dir.path().join("state.json"));
        let (transport, log) = ScriptedTransport::new(vec![Script::AckThenPing(1)]);
        let (tx, rx) = request_handoff();
        let client = DeliveryClient::new(
            transport,
            network(3),
            "test-host".to_string(),
            state.clone(),
            CancellationToken::new(),
        );
        let handle = tokio::spawn(client.run(rx));
        tx.send(request(&[4])).await.unwrap();

        // The handoff stays open, so the client sits idle after the ack
        let answered = async {
            loop {
                let pongs = log
                    .lock()
                    .unwrap()
                    .sent
                    .iter()
                    .filter(|frames| frames.as_slice() == wire::pong_frames().as_slice())
                    .count();
                if pongs == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), answered)
            .await
            .expect("ping while idle was not answered");
        assert_eq!(state.get(&PathBuf::from("/var/log/app.log")).unwrap().pos, 4);

        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
