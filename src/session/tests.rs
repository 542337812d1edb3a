//! Tests for the session state machine over a scripted transport.

use std::{
    collections::VecDeque,
    io,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use rstest::{fixture, rstest};

use crate::{
    formatter::{Formatter, ParseError},
    level::Severity,
    log_record::LogRecord,
    transport::{ConnectError, Link, ReceiveError, SendError, Transport},
    wire::{Opcode, WireMessage},
};

use super::{
    BackoffPolicy, BackoffState, ConnectionStatus, FatalSessionError, KeepalivePolicy, LogError,
    SessionConfig, SessionState, StreamSession,
};

enum Inbound {
    Message(WireMessage),
    Malformed,
    PeerGone,
}

#[derive(Default)]
struct Script {
    refuse_connects: usize,
    refuse_all: bool,
    fail_sends: usize,
    inbound: VecDeque<Inbound>,
    sent: Vec<WireMessage>,
    connects: usize,
    closes: usize,
}

/// In-memory transport whose behaviour is driven by a shared [`Script`].
#[derive(Clone, Default)]
struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

struct ScriptedLink {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    fn with(self, f: impl FnOnce(&mut Script)) -> Self {
        f(&mut self.script.lock());
        self
    }

    fn push_inbound(&self, inbound: Inbound) {
        self.script.lock().inbound.push_back(inbound);
    }

    fn sent_data(&self) -> Vec<String> {
        self.script
            .lock()
            .sent
            .iter()
            .filter(|m| m.opcode == Opcode::Data)
            .map(|m| {
                let record = Formatter::default()
                    .decode_record(&m.payload)
                    .expect("decodable record");
                record.message().to_owned()
            })
            .collect()
    }

    fn sent_opcodes(&self) -> Vec<Opcode> {
        self.script.lock().sent.iter().map(|m| m.opcode).collect()
    }

    fn connects(&self) -> usize {
        self.script.lock().connects
    }
}

impl Transport for ScriptedTransport {
    type Conn = ScriptedLink;

    fn connect(&mut self) -> Result<ScriptedLink, ConnectError> {
        let mut script = self.script.lock();
        script.connects += 1;
        if script.refuse_all || script.refuse_connects > 0 {
            script.refuse_connects = script.refuse_connects.saturating_sub(1);
            return Err(ConnectError::new(
                "scripted",
                io::Error::from(io::ErrorKind::ConnectionRefused),
            ));
        }
        Ok(ScriptedLink {
            script: Arc::clone(&self.script),
        })
    }

    fn describe(&self) -> String {
        "scripted".into()
    }
}

impl Link for ScriptedLink {
    fn send(&mut self, message: &WireMessage) -> Result<(), SendError> {
        let mut script = self.script.lock();
        if script.fail_sends > 0 && message.opcode == Opcode::Data {
            script.fail_sends -= 1;
            return Err(SendError::Io(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        script.sent.push(message.clone());
        Ok(())
    }

    fn poll_receive(&mut self, wait: Duration) -> Result<Option<WireMessage>, ReceiveError> {
        let next = self.script.lock().inbound.pop_front();
        match next {
            Some(Inbound::Message(message)) => Ok(Some(message)),
            Some(Inbound::Malformed) => Err(ReceiveError::Protocol(ParseError::UnknownOpcode(0x3))),
            Some(Inbound::PeerGone) => Err(ReceiveError::Closed),
            None => {
                thread::sleep(wait.min(Duration::from_millis(2)));
                Ok(None)
            }
        }
    }

    fn close(&mut self) {
        self.script.lock().closes += 1;
    }
}

#[fixture]
fn config() -> SessionConfig {
    SessionConfig {
        backoff: BackoffPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(4),
            jitter: 0.0,
            max_attempts: 3,
        },
        poll_interval: Duration::from_millis(5),
        drain_timeout: Duration::from_secs(2),
        ..SessionConfig::default()
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

fn no_fields() -> [(String, String); 0] {
    []
}

fn started(transport: &ScriptedTransport, config: SessionConfig) -> StreamSession {
    let session = StreamSession::with_transport(transport.clone(), config);
    assert!(session.start().expect("spawn session thread"));
    session
}

#[rstest]
fn delivers_records_in_order(config: SessionConfig) {
    let transport = ScriptedTransport::default();
    let session = started(&transport, config);
    for message in ["A", "B", "C"] {
        session.log(Severity::Info, message, no_fields()).expect("log");
    }
    assert!(session.flush(Duration::from_secs(5)));
    assert_eq!(transport.sent_data(), vec!["A", "B", "C"]);
    assert_eq!(session.status(), ConnectionStatus::Connected);
    session.stop().expect("clean stop");
}

#[rstest]
fn failed_send_is_redelivered_exactly_once(config: SessionConfig) {
    let transport = ScriptedTransport::default().with(|s| s.fail_sends = 1);
    let session = started(&transport, config);
    session.log(Severity::Warn, "D", no_fields()).expect("log");
    assert!(session.flush(Duration::from_secs(5)));
    assert_eq!(transport.sent_data(), vec!["D"]);
    assert_eq!(transport.connects(), 2);
    session.stop().expect("clean stop");
}

#[rstest]
fn reconnect_preserves_sequence_order(config: SessionConfig) {
    let transport = ScriptedTransport::default().with(|s| s.fail_sends = 2);
    let session = StreamSession::with_transport(transport.clone(), config);
    let seqs: Vec<u64> = ["one", "two", "three"]
        .into_iter()
        .map(|m| session.log(Severity::Info, m, no_fields()).expect("log"))
        .collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    session.start().expect("spawn");
    assert!(session.flush(Duration::from_secs(5)));
    assert_eq!(transport.sent_data(), vec!["one", "two", "three"]);
    assert_eq!(session.log(Severity::Info, "four", no_fields()), Ok(4));
}

#[rstest]
fn records_queue_before_start(config: SessionConfig) {
    let transport = ScriptedTransport::default();
    let session = StreamSession::with_transport(transport.clone(), config);
    session.log(Severity::Debug, "early", no_fields()).expect("log");
    assert_eq!(session.status(), ConnectionStatus::Disconnected);
    assert_eq!(session.queue_len(), 1);
    assert_eq!(transport.connects(), 0);
    assert!(session.start().expect("spawn"));
    assert!(!session.start().expect("second start is a no-op"));
    assert!(session.flush(Duration::from_secs(5)));
    assert_eq!(transport.sent_data(), vec!["early"]);
}

#[rstest]
fn exhausted_retries_are_fatal(config: SessionConfig) {
    let transport = ScriptedTransport::default().with(|s| s.refuse_all = true);
    let session = StreamSession::with_transport(transport.clone(), config);
    let reported: Arc<Mutex<Vec<FatalSessionError>>> = Arc::default();
    let sink = Arc::clone(&reported);
    session.on_error(move |err| sink.lock().push(err.clone()));
    session.log(Severity::Error, "never sent", no_fields()).expect("log");
    session.start().expect("spawn");

    assert!(wait_for(|| session.status() == ConnectionStatus::Closed));
    let err = session.stop().expect_err("retries exhausted");
    assert_eq!(err.attempts, 3);
    assert!(err.last_error.contains("scripted"), "got {err}");
    assert_eq!(transport.connects(), 4);
    assert_eq!(reported.lock().as_slice(), [err.clone()]);
    assert_eq!(session.fatal_error(), Some(err));
    assert_eq!(session.pending().len(), 1);
    assert_eq!(
        session.log(Severity::Info, "late", no_fields()),
        Err(LogError::Closed)
    );
}

#[rstest]
fn transient_connect_failures_recover(config: SessionConfig) {
    let transport = ScriptedTransport::default().with(|s| s.refuse_connects = 2);
    let session = started(&transport, config);
    session.log(Severity::Info, "eventually", no_fields()).expect("log");
    assert!(session.flush(Duration::from_secs(5)));
    assert_eq!(transport.connects(), 3);
    session.stop().expect("clean stop");
}

#[rstest]
fn ping_is_answered_without_dispatch(config: SessionConfig) {
    let transport = ScriptedTransport::default();
    transport.push_inbound(Inbound::Message(WireMessage::ping(b"hb".to_vec())));
    transport.push_inbound(Inbound::Message(WireMessage::data("hello")));
    let received: Arc<Mutex<Vec<WireMessage>>> = Arc::default();
    let sink = Arc::clone(&received);
    let session = StreamSession::with_transport(transport.clone(), config);
    session.subscribe(move |msg| sink.lock().push(msg.clone()));
    session.start().expect("spawn");

    assert!(wait_for(|| !received.lock().is_empty()));
    assert_eq!(received.lock().as_slice(), [WireMessage::data("hello")]);
    assert!(
        transport
            .script
            .lock()
            .sent
            .contains(&WireMessage::pong(b"hb".to_vec()))
    );
    session.stop().expect("clean stop");
}

#[rstest]
fn malformed_frames_do_not_end_session(config: SessionConfig) {
    let transport = ScriptedTransport::default();
    transport.push_inbound(Inbound::Malformed);
    transport.push_inbound(Inbound::Message(WireMessage::data("after")));
    let received: Arc<Mutex<Vec<WireMessage>>> = Arc::default();
    let sink = Arc::clone(&received);
    let session = StreamSession::with_transport(transport.clone(), config);
    session.subscribe(move |msg| sink.lock().push(msg.clone()));
    session.start().expect("spawn");

    assert!(wait_for(|| !received.lock().is_empty()));
    assert_eq!(transport.connects(), 1);
    assert_eq!(session.status(), ConnectionStatus::Connected);
    session.stop().expect("clean stop");
}

#[rstest]
fn panicking_subscriber_is_isolated(config: SessionConfig) {
    let transport = ScriptedTransport::default();
    transport.push_inbound(Inbound::Message(WireMessage::data("first")));
    transport.push_inbound(Inbound::Message(WireMessage::data("second")));
    let received: Arc<Mutex<Vec<WireMessage>>> = Arc::default();
    let sink = Arc::clone(&received);
    let session = StreamSession::with_transport(transport.clone(), config);
    session.subscribe(|msg| {
        if msg.text() == Some("first") {
            panic!("subscriber failure");
        }
    });
    session.subscribe(move |msg| sink.lock().push(msg.clone()));
    session.start().expect("spawn");

    assert!(wait_for(|| received.lock().len() == 2));
    session.stop().expect("clean stop");
}

#[rstest]
fn peer_close_triggers_reconnect(config: SessionConfig) {
    let transport = ScriptedTransport::default();
    transport.push_inbound(Inbound::Message(WireMessage::close("going away")));
    let received: Arc<Mutex<Vec<WireMessage>>> = Arc::default();
    let sink = Arc::clone(&received);
    let session = StreamSession::with_transport(transport.clone(), config);
    session.subscribe(move |msg| sink.lock().push(msg.clone()));
    session.start().expect("spawn");

    assert!(wait_for(|| transport.connects() >= 2));
    assert_eq!(received.lock().as_slice(), [WireMessage::close("going away")]);
    session.stop().expect("clean stop");
}

#[rstest]
fn lost_connection_reconnects(config: SessionConfig) {
    let transport = ScriptedTransport::default();
    transport.push_inbound(Inbound::PeerGone);
    let session = started(&transport, config);
    assert!(wait_for(|| transport.connects() >= 2));
    assert!(wait_for(|| session.status() == ConnectionStatus::Connected));
    assert!(transport.script.lock().closes >= 1);
    session.stop().expect("clean stop");
}

#[rstest]
fn stop_drains_then_closes(config: SessionConfig) {
    let transport = ScriptedTransport::default();
    let session = StreamSession::with_transport(transport.clone(), config);
    for message in ["x", "y"] {
        session.log(Severity::Info, message, no_fields()).expect("log");
    }
    session.start().expect("spawn");
    session.stop().expect("clean stop");

    assert_eq!(session.status(), ConnectionStatus::Closed);
    assert_eq!(transport.sent_data(), vec!["x", "y"]);
    assert_eq!(transport.sent_opcodes().last(), Some(&Opcode::Close));
    assert!(session.pending().is_empty());
    assert_eq!(session.log(Severity::Info, "z", no_fields()), Err(LogError::Closed));
    session.stop().expect("stop is idempotent");
}

#[rstest]
fn stop_gives_up_after_drain_timeout(mut config: SessionConfig) {
    config.backoff.base = Duration::from_millis(50);
    config.backoff.cap = Duration::from_millis(50);
    config.backoff.max_attempts = 1_000;
    config.drain_timeout = Duration::from_millis(100);
    let transport = ScriptedTransport::default().with(|s| s.refuse_all = true);
    let session = started(&transport, config);
    session.log(Severity::Info, "stranded", no_fields()).expect("log");

    let start = Instant::now();
    session.stop().expect("deadline is not fatal");
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(session.status(), ConnectionStatus::Closed);
    assert_eq!(session.pending().len(), 1);
    assert_eq!(session.pending()[0].record().message(), "stranded");
}

#[rstest]
fn stop_before_start_closes_without_connecting(config: SessionConfig) {
    let transport = ScriptedTransport::default();
    let session = StreamSession::with_transport(transport.clone(), config);
    session.stop().expect("clean stop");
    assert_eq!(session.status(), ConnectionStatus::Closed);
    assert!(!session.start().expect("start after stop"));
    assert_eq!(transport.connects(), 0);
}

#[rstest]
fn stop_from_subscriber_requests_shutdown(config: SessionConfig) {
    let transport = ScriptedTransport::default();
    transport.push_inbound(Inbound::Message(WireMessage::data("shutdown")));
    let session = Arc::new(StreamSession::with_transport(transport.clone(), config));
    session.log(Severity::Info, "queued", no_fields()).expect("log");
    let inner: Arc<Mutex<Vec<Result<(), FatalSessionError>>>> = Arc::default();
    let sink = Arc::clone(&inner);
    let weak = Arc::downgrade(&session);
    session.subscribe(move |msg| {
        if msg.text() == Some("shutdown") {
            if let Some(session) = weak.upgrade() {
                sink.lock().push(session.stop());
            }
        }
    });
    session.start().expect("spawn");

    assert!(wait_for(|| inner.lock().len() == 1));
    assert_eq!(inner.lock().as_slice(), [Ok(())]);
    session.stop().expect("outer stop waits for the session thread");
    assert_eq!(session.status(), ConnectionStatus::Closed);
    assert_eq!(transport.sent_data(), vec!["queued"]);
    assert_eq!(transport.sent_opcodes().last(), Some(&Opcode::Close));
    session.stop().expect("stop is idempotent");
}

#[rstest]
fn last_handle_dropped_on_session_thread_still_closes(config: SessionConfig) {
    let transport = ScriptedTransport::default();
    transport.push_inbound(Inbound::Message(WireMessage::data("release")));
    let session = Arc::new(StreamSession::with_transport(transport.clone(), config));
    session.log(Severity::Info, "queued", no_fields()).expect("log");
    let slot: Arc<Mutex<Option<Arc<StreamSession>>>> = Arc::default();
    let owner = Arc::clone(&slot);
    session.subscribe(move |msg| {
        if msg.text() == Some("release") {
            drop(owner.lock().take());
        }
    });
    *slot.lock() = Some(session);
    slot.lock()
        .as_ref()
        .expect("session held by slot")
        .start()
        .expect("spawn");

    assert!(wait_for(|| transport.sent_opcodes().last() == Some(&Opcode::Close)));
    assert!(slot.lock().is_none());
    assert_eq!(transport.sent_data(), vec!["queued"]);
}

#[rstest]
fn keepalive_pings_idle_connection(mut config: SessionConfig) {
    config.keepalive = Some(KeepalivePolicy {
        ping_interval: Duration::from_millis(20),
        pong_wait: Duration::from_secs(5),
    });
    let transport = ScriptedTransport::default();
    let session = started(&transport, config);
    assert!(wait_for(|| transport.sent_opcodes().contains(&Opcode::Ping)));
    session.stop().expect("clean stop");
}

#[rstest]
fn keepalive_timeout_reconnects(mut config: SessionConfig) {
    config.keepalive = Some(KeepalivePolicy {
        ping_interval: Duration::from_millis(10),
        pong_wait: Duration::from_millis(20),
    });
    let transport = ScriptedTransport::default();
    let session = started(&transport, config);
    assert!(wait_for(|| transport.connects() >= 2));
    session.stop().expect("clean stop");
}

#[rstest]
fn oversized_record_is_dropped_not_retried(mut config: SessionConfig) {
    config.formatter = Formatter::default().with_max_frame_size(128);
    let transport = ScriptedTransport::default();
    let session = started(&transport, config);
    session
        .log(Severity::Info, "x".repeat(300), no_fields())
        .expect("log");
    session.log(Severity::Info, "small", no_fields()).expect("log");
    assert!(session.flush(Duration::from_secs(5)));
    assert_eq!(transport.sent_data(), vec!["small"]);
    session.stop().expect("clean stop");
}

#[rstest]
fn full_queue_rejects_producer(mut config: SessionConfig) {
    config.max_queue_size = 2;
    let session = StreamSession::with_transport(ScriptedTransport::default(), config);
    session.log(Severity::Info, "1", no_fields()).expect("log");
    session.log(Severity::Info, "2", no_fields()).expect("log");
    let err = session
        .log(Severity::Info, "3", no_fields())
        .expect_err("queue full");
    assert!(matches!(err, LogError::QueueFull(full) if full.capacity == 2));
}

#[rstest]
fn invalid_field_names_are_rejected(config: SessionConfig) {
    let session = StreamSession::with_transport(ScriptedTransport::default(), config);
    let err = session
        .log(Severity::Info, "msg", [("bad name", "v")])
        .expect_err("space in field name");
    assert!(matches!(err, LogError::InvalidRecord(_)));
    assert_eq!(session.queue_len(), 0);
}

#[rstest]
fn log_stamps_session_hostname(mut config: SessionConfig) {
    config.hostname = crate::log_record::Hostname::parse("edge-7").expect("hostname");
    let transport = ScriptedTransport::default();
    let session = StreamSession::with_transport(transport, config);
    session
        .log(Severity::Info, "hi", [("zone", "eu")])
        .expect("log");
    let pending = session.pending();
    let record: &LogRecord = pending[0].record();
    assert_eq!(record.hostname().as_str(), "edge-7");
    assert_eq!(record.fields().get("zone").map(String::as_str), Some("eu"));
}

#[rstest]
#[case(0, Duration::from_secs(1))]
#[case(1, Duration::from_secs(2))]
#[case(3, Duration::from_secs(8))]
#[case(5, Duration::from_secs(30))]
#[case(40, Duration::from_secs(30))]
fn nominal_backoff_doubles_to_cap(#[case] attempt: u32, #[case] expected: Duration) {
    let state = BackoffState::new(BackoffPolicy::default());
    assert_eq!(state.nominal_delay(attempt), expected);
}

#[rstest]
fn backoff_delays_stay_within_jitter_band() {
    let policy = BackoffPolicy::default();
    let mut state = BackoffState::with_seed(policy.clone(), 7);
    for k in 0..policy.max_attempts {
        let nominal = state.nominal_delay(k);
        let delay = state.next_delay().expect("attempt budget remains");
        assert!(delay >= nominal.mul_f64(0.8), "attempt {k}: {delay:?}");
        assert!(delay <= nominal.mul_f64(1.2), "attempt {k}: {delay:?}");
    }
    assert_eq!(state.next_delay(), None);
    state.record_success();
    assert_eq!(state.attempts(), 0);
    assert!(state.next_delay().is_some());
}

#[rstest]
#[case(ConnectionStatus::Disconnected, ConnectionStatus::Connecting, true)]
#[case(ConnectionStatus::Connecting, ConnectionStatus::Connected, true)]
#[case(ConnectionStatus::Connecting, ConnectionStatus::Reconnecting, true)]
#[case(ConnectionStatus::Connected, ConnectionStatus::Reconnecting, true)]
#[case(ConnectionStatus::Connected, ConnectionStatus::Draining, true)]
#[case(ConnectionStatus::Draining, ConnectionStatus::Reconnecting, true)]
#[case(ConnectionStatus::Reconnecting, ConnectionStatus::Connecting, true)]
#[case(ConnectionStatus::Connecting, ConnectionStatus::Closed, true)]
#[case(ConnectionStatus::Disconnected, ConnectionStatus::Connected, false)]
#[case(ConnectionStatus::Reconnecting, ConnectionStatus::Connected, false)]
#[case(ConnectionStatus::Draining, ConnectionStatus::Connected, false)]
#[case(ConnectionStatus::Closed, ConnectionStatus::Connecting, false)]
fn transitions_follow_state_machine(
    #[case] from: ConnectionStatus,
    #[case] to: ConnectionStatus,
    #[case] allowed: bool,
) {
    assert_eq!(from.can_transition_to(to), allowed);
}

#[rstest]
fn session_state_rejects_undefined_transition() {
    let mut state = SessionState::default();
    let err = state
        .transition(ConnectionStatus::Connected)
        .expect_err("must pass through CONNECTING");
    assert_eq!(err.from, ConnectionStatus::Disconnected);
    state.transition(ConnectionStatus::Connecting).expect("start");
    state.transition(ConnectionStatus::Closed).expect("fatal");
    assert!(state.status().is_terminal());
}
