//! Worker thread driving the session state machine.
//!
//! The worker owns the transport exclusively. Each tick it checks for a stop
//! request, then acts on the current status: connecting, waiting out a
//! backoff delay, or (while connected or draining) interleaving queue drains
//! with inbound polling on the one connection.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::{
    formatter::Formatter,
    queue::DeliveryQueue,
    rate_limited_warner::RateLimitedWarner,
    transport::{Link, ReceiveError, SendError, Transport},
    wire::{Opcode, WireMessage},
};

use super::{
    FatalSessionError,
    backoff::BackoffState,
    config::{KeepalivePolicy, SessionConfig},
    state::{ConnectionStatus, SessionState},
};

/// Entries sent (or frames read) per tick before switching direction.
const MAX_BATCH: usize = 64;

pub(crate) type Subscriber = Arc<dyn Fn(&WireMessage) + Send + Sync>;
pub(crate) type ErrorCallback = Arc<dyn Fn(&FatalSessionError) + Send + Sync>;

/// Commands processed by the worker thread.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    Stop,
}

/// State shared between the handle and the worker.
pub(crate) struct Shared {
    pub(crate) queue: DeliveryQueue,
    status: AtomicU8,
    subscribers: RwLock<Vec<Subscriber>>,
    error_callbacks: RwLock<Vec<ErrorCallback>>,
    fatal: Mutex<Option<FatalSessionError>>,
}

impl Shared {
    pub(crate) fn new(queue: DeliveryQueue) -> Self {
        Self {
            queue,
            status: AtomicU8::new(ConnectionStatus::Disconnected as u8),
            subscribers: RwLock::new(Vec::new()),
            error_callbacks: RwLock::new(Vec::new()),
            fatal: Mutex::new(None),
        }
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn add_subscriber(&self, subscriber: Subscriber) {
        self.subscribers.write().push(subscriber);
    }

    pub(crate) fn add_error_callback(&self, callback: ErrorCallback) {
        self.error_callbacks.write().push(callback);
    }

    pub(crate) fn fatal(&self) -> Option<FatalSessionError> {
        self.fatal.lock().clone()
    }

    fn dispatch(&self, message: &WireMessage) {
        let subscribers = self.subscribers.read().clone();
        for subscriber in subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(message))).is_err() {
                error!("StreamSession subscriber panicked handling {} message", message.opcode);
            }
        }
    }

    fn report_fatal(&self, err: &FatalSessionError) {
        *self.fatal.lock() = Some(err.clone());
        let callbacks = self.error_callbacks.read().clone();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(err))).is_err() {
                error!("StreamSession error callback panicked");
            }
        }
    }
}

/// Why an I/O tick ended.
enum Tick {
    Continue,
    LinkLost(String),
    Finished,
}

pub(crate) struct Worker<T: Transport> {
    transport: T,
    shared: Arc<Shared>,
    control: Receiver<SessionCommand>,
    formatter: Formatter,
    keepalive: Option<KeepalivePolicy>,
    poll_interval: Duration,
    drain_timeout: Duration,
    backoff: BackoffState,
    state: SessionState,
    link: Option<T::Conn>,
    drain_deadline: Option<Instant>,
    last_inbound: Instant,
    ping_sent: Option<Instant>,
    warner: RateLimitedWarner,
}

impl<T: Transport> Worker<T> {
    pub(crate) fn new(
        transport: T,
        shared: Arc<Shared>,
        control: Receiver<SessionCommand>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            transport,
            shared,
            control,
            formatter: config.formatter.clone(),
            keepalive: config.keepalive,
            poll_interval: config.poll_interval,
            drain_timeout: config.drain_timeout,
            backoff: BackoffState::new(config.backoff.clone()),
            state: SessionState::default(),
            link: None,
            drain_deadline: None,
            last_inbound: Instant::now(),
            ping_sent: None,
            warner: RateLimitedWarner::new(config.warn_interval),
        }
    }

    pub(crate) fn run(mut self) -> Result<(), FatalSessionError> {
        self.enter(ConnectionStatus::Connecting);
        let outcome = loop {
            self.poll_control();
            match self.state.status() {
                ConnectionStatus::Disconnected | ConnectionStatus::Connecting => {
                    self.connect_step();
                }
                ConnectionStatus::Reconnecting => {
                    if let Err(err) = self.backoff_step() {
                        break Err(err);
                    }
                }
                ConnectionStatus::Connected | ConnectionStatus::Draining => {
                    match self.io_step() {
                        Tick::Continue => {}
                        Tick::LinkLost(reason) => self.link_lost(reason),
                        Tick::Finished => self.finish(),
                    }
                }
                ConnectionStatus::Closed => break Ok(()),
            }
        };
        self.shutdown(outcome)
    }

    fn enter(&mut self, next: ConnectionStatus) {
        let from = self.state.status();
        if let Err(err) = self.state.transition(next) {
            error!("StreamSession: {err}");
            return;
        }
        debug!("StreamSession {} {from} -> {next}", self.transport.describe());
        self.shared.set_status(next);
    }

    fn stopping(&self) -> bool {
        self.drain_deadline.is_some()
    }

    fn drain_expired(&self) -> bool {
        self.drain_deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn request_stop(&mut self) {
        if self.drain_deadline.is_none() {
            self.drain_deadline = Some(Instant::now() + self.drain_timeout);
        }
    }

    /// Observe a stop request at the tick boundary.
    fn poll_control(&mut self) {
        match self.control.try_recv() {
            Ok(SessionCommand::Stop) | Err(TryRecvError::Disconnected) => self.request_stop(),
            Err(TryRecvError::Empty) => {}
        }
        if !self.stopping() {
            return;
        }
        match self.state.status() {
            ConnectionStatus::Connected => self.enter(ConnectionStatus::Draining),
            ConnectionStatus::Reconnecting
                if self.shared.queue.is_empty() || self.drain_expired() =>
            {
                self.enter(ConnectionStatus::Closed)
            }
            _ => {}
        }
    }

    fn connect_step(&mut self) {
        match self.transport.connect() {
            Ok(link) => {
                info!("StreamSession connected to {}", self.transport.describe());
                self.backoff.record_success();
                self.link = Some(link);
                self.last_inbound = Instant::now();
                self.ping_sent = None;
                self.enter(ConnectionStatus::Connected);
            }
            Err(err) => {
                warn!("StreamSession failed to connect: {err}");
                self.state.record_error(err.to_string());
                self.enter(ConnectionStatus::Reconnecting);
            }
        }
    }

    fn backoff_step(&mut self) -> Result<(), FatalSessionError> {
        let Some(delay) = self.backoff.next_delay() else {
            let err = FatalSessionError {
                attempts: self.backoff.attempts(),
                last_error: self
                    .state
                    .last_error()
                    .unwrap_or("connection lost")
                    .to_owned(),
            };
            error!("StreamSession giving up: {err}");
            self.enter(ConnectionStatus::Closed);
            return Err(err);
        };
        self.state.set_attempts(self.backoff.attempts());
        debug!(
            "StreamSession reconnect attempt {} in {delay:?}",
            self.backoff.attempts()
        );
        let mut wait_until = Instant::now() + delay;
        if let Some(deadline) = self.drain_deadline {
            wait_until = wait_until.min(deadline);
        }
        loop {
            let remaining = wait_until.saturating_duration_since(Instant::now());
            match self.control.recv_timeout(remaining) {
                Ok(SessionCommand::Stop) => {
                    self.request_stop();
                    if self.shared.queue.is_empty() {
                        self.enter(ConnectionStatus::Closed);
                        return Ok(());
                    }
                    if let Some(deadline) = self.drain_deadline {
                        wait_until = wait_until.min(deadline);
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    self.request_stop();
                    break;
                }
            }
        }
        if self.drain_expired() {
            self.enter(ConnectionStatus::Closed);
        } else {
            self.enter(ConnectionStatus::Connecting);
        }
        Ok(())
    }

    fn io_step(&mut self) -> Tick {
        let Some(mut link) = self.link.take() else {
            return Tick::LinkLost("no active connection".into());
        };
        let tick = self.exchange(&mut link);
        self.link = Some(link);
        tick
    }

    fn exchange(&mut self, link: &mut T::Conn) -> Tick {
        if let Some(tick) = self.drain_queue(link) {
            return tick;
        }
        if self.state.status() == ConnectionStatus::Draining
            && (self.shared.queue.is_empty() || self.drain_expired())
        {
            return Tick::Finished;
        }
        if let Some(tick) = self.keepalive(link) {
            return tick;
        }
        self.receive(link)
    }

    /// Send queued entries oldest first. An entry leaves the queue only once
    /// its send succeeded.
    fn drain_queue(&mut self, link: &mut T::Conn) -> Option<Tick> {
        for _ in 0..MAX_BATCH {
            let entry = self.shared.queue.front()?;
            let result = self
                .formatter
                .encode_message(entry.record())
                .map_err(SendError::Encode)
                .and_then(|message| link.send(&message));
            match result {
                Ok(()) => {
                    self.shared.queue.ack(entry.sequence());
                }
                Err(SendError::Encode(err)) => {
                    // Unencodable records would block the queue forever.
                    self.shared.queue.ack(entry.sequence());
                    if let Some(count) = self.warner.note_drop() {
                        warn!("StreamSession dropped {count} unencodable records: {err}");
                    }
                }
                Err(SendError::Io(err)) => {
                    return Some(Tick::LinkLost(format!("send failed: {err}")));
                }
            }
        }
        None
    }

    fn keepalive(&mut self, link: &mut T::Conn) -> Option<Tick> {
        let policy = self.keepalive?;
        let now = Instant::now();
        if let Some(sent) = self.ping_sent {
            if now.duration_since(sent) >= policy.pong_wait {
                return Some(Tick::LinkLost("keepalive timed out".into()));
            }
            return None;
        }
        if now.duration_since(self.last_inbound) >= policy.ping_interval {
            if let Err(err) = link.send(&WireMessage::ping(Vec::<u8>::new())) {
                return Some(Tick::LinkLost(format!("keepalive ping failed: {err}")));
            }
            self.ping_sent = Some(now);
        }
        None
    }

    fn receive(&mut self, link: &mut T::Conn) -> Tick {
        let mut wait = if self.shared.queue.is_empty() {
            self.poll_interval
        } else {
            Duration::ZERO
        };
        for _ in 0..MAX_BATCH {
            match link.poll_receive(wait) {
                Ok(None) => break,
                Ok(Some(message)) => {
                    self.last_inbound = Instant::now();
                    self.ping_sent = None;
                    match message.opcode {
                        Opcode::Ping => {
                            if let Err(err) = link.send(&WireMessage::pong(message.payload)) {
                                return Tick::LinkLost(format!("pong failed: {err}"));
                            }
                        }
                        Opcode::Close => {
                            self.shared.dispatch(&message);
                            if self.stopping() && self.shared.queue.is_empty() {
                                return Tick::Finished;
                            }
                            return Tick::LinkLost("peer sent CLOSE".into());
                        }
                        Opcode::Data | Opcode::Pong => self.shared.dispatch(&message),
                    }
                }
                Err(ReceiveError::Protocol(err)) => {
                    warn!("StreamSession dropped malformed inbound frame: {err}");
                }
                Err(ReceiveError::Io(err)) => {
                    return Tick::LinkLost(format!("receive failed: {err}"));
                }
                Err(ReceiveError::Closed) => {
                    return Tick::LinkLost("connection closed by peer".into());
                }
            }
            wait = Duration::ZERO;
        }
        Tick::Continue
    }

    fn link_lost(&mut self, reason: String) {
        warn!(
            "StreamSession lost connection to {}: {reason}",
            self.transport.describe()
        );
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.state.record_error(reason);
        self.enter(ConnectionStatus::Reconnecting);
    }

    /// Leave DRAINING: say goodbye to the peer and release the connection.
    fn finish(&mut self) {
        if let Some(mut link) = self.link.take() {
            if let Err(err) = link.send(&WireMessage::close("session stopped")) {
                debug!("StreamSession could not send CLOSE: {err}");
            }
            link.close();
        }
        self.enter(ConnectionStatus::Closed);
    }

    fn shutdown(mut self, outcome: Result<(), FatalSessionError>) -> Result<(), FatalSessionError> {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.shared.queue.close();
        let pending = self.shared.queue.len();
        if pending > 0 {
            warn!("StreamSession closed with {pending} undelivered records");
        }
        if let Some(count) = self.warner.take_unreported() {
            warn!("StreamSession dropped {count} unencodable records since the last warning");
        }
        if let Err(err) = &outcome {
            self.shared.report_fatal(err);
        }
        info!("StreamSession for {} closed", self.transport.describe());
        outcome
    }
}
