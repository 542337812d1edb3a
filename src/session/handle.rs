//! Public session handle.

use std::{
    fmt, io,
    sync::{Arc, OnceLock},
    thread::{self, ThreadId},
    time::Duration,
};

use crossbeam_channel::{Sender, TrySendError, bounded};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::{
    level::Severity,
    log_record::{Facility, Hostname, LogRecord},
    queue::{DeliveryQueue, QueueEntry},
    transport::{Endpoint, NetworkTransport, Transport},
    wire::WireMessage,
};

use super::{
    FatalSessionError, LogError,
    config::SessionConfig,
    state::ConnectionStatus,
    worker::{SessionCommand, Shared, Worker},
};

type Outcome = Result<(), FatalSessionError>;
type Launch = Box<dyn FnOnce() -> io::Result<thread::JoinHandle<Outcome>> + Send>;

/// Client for one relay endpoint.
///
/// Producers call [`log`](Self::log) from any thread; records are queued and
/// delivered in order by a dedicated session thread, which also reconnects
/// with backoff and hands inbound messages to subscribers.
pub struct StreamSession {
    shared: Arc<Shared>,
    control: Sender<SessionCommand>,
    launch: Mutex<Option<Launch>>,
    handle: Mutex<Option<thread::JoinHandle<Outcome>>>,
    session_thread: OnceLock<ThreadId>,
    outcome: Mutex<Option<Outcome>>,
    hostname: Hostname,
    facility: Facility,
}

impl StreamSession {
    /// Build a session in the DISCONNECTED state. Nothing touches the
    /// network until [`start`](Self::start).
    pub fn create(endpoint: Endpoint, config: SessionConfig) -> Self {
        let endpoint = match (endpoint, &config.stream_path) {
            (Endpoint::WebSocket(ws), Some(path)) => Endpoint::WebSocket(ws.with_path(path)),
            (endpoint, Some(_)) => {
                warn!("StreamSession ignoring stream path for non-websocket endpoint {endpoint}");
                endpoint
            }
            (endpoint, None) => endpoint,
        };
        let transport = NetworkTransport::new(endpoint, config.connect_options());
        Self::with_transport(transport, config)
    }

    /// Create and immediately start a session.
    pub fn connect(endpoint: Endpoint, config: SessionConfig) -> io::Result<Self> {
        let session = Self::create(endpoint, config);
        session.start()?;
        Ok(session)
    }

    /// Run the session state machine over a custom transport.
    pub fn with_transport<T: Transport>(transport: T, config: SessionConfig) -> Self {
        let queue = DeliveryQueue::new(config.max_queue_size, config.overflow);
        let shared = Arc::new(Shared::new(queue));
        let (control, control_rx) = bounded(1);
        let worker = Worker::new(transport, Arc::clone(&shared), control_rx, &config);
        let launch: Launch = Box::new(move || {
            thread::Builder::new()
                .name("streamrelay-session".into())
                .spawn(move || worker.run())
        });
        Self {
            shared,
            control,
            launch: Mutex::new(Some(launch)),
            handle: Mutex::new(None),
            session_thread: OnceLock::new(),
            outcome: Mutex::new(None),
            hostname: config.hostname,
            facility: config.facility,
        }
    }

    /// Spawn the session thread. Returns `false` when the session was
    /// already started or stopped.
    pub fn start(&self) -> io::Result<bool> {
        let Some(launch) = self.launch.lock().take() else {
            return Ok(false);
        };
        let handle = launch()?;
        let _ = self.session_thread.set(handle.thread().id());
        *self.handle.lock() = Some(handle);
        Ok(true)
    }

    /// Queue a record built from the session's hostname and facility.
    ///
    /// Returns the record's sequence number.
    pub fn log<I, K, V>(
        &self,
        severity: Severity,
        message: impl Into<String>,
        fields: I,
    ) -> Result<u64, LogError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let record = LogRecord::new(severity, message)
            .with_hostname(self.hostname.clone())
            .with_facility(self.facility)
            .with_fields(fields)?;
        self.log_record(record)
    }

    /// Queue a fully built record.
    pub fn log_record(&self, record: LogRecord) -> Result<u64, LogError> {
        self.shared.queue.push(record).map_err(LogError::from)
    }

    /// Register a callback receiving every inbound message except PING, in
    /// receipt order. Callbacks run on the session thread.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&WireMessage) + Send + Sync + 'static,
    {
        self.shared.add_subscriber(Arc::new(callback));
    }

    /// Register a callback invoked once if the session gives up reconnecting.
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&FatalSessionError) + Send + Sync + 'static,
    {
        self.shared.add_error_callback(Arc::new(callback));
    }

    /// Stop accepting records, drain the queue and close the connection.
    ///
    /// Blocks until the session thread has exited, which is bounded by the
    /// configured drain timeout (plus one connect timeout if a connect
    /// attempt is in flight). Calling `stop` again returns the same result.
    ///
    /// From a subscriber or error callback the session thread cannot wait
    /// for itself, so `stop` only requests shutdown and returns `Ok(())`; a
    /// later `stop` from another thread still waits for the outcome.
    pub fn stop(&self) -> Result<(), FatalSessionError> {
        self.shared.queue.close();
        if self.launch.lock().take().is_some() {
            self.shared.set_status(ConnectionStatus::Closed);
        }
        if self.session_thread.get() == Some(&thread::current().id()) {
            self.request_stop();
            return Ok(());
        }
        let mut outcome = self.outcome.lock();
        if let Some(outcome) = outcome.as_ref() {
            return outcome.clone();
        }
        let handle = self.handle.lock().take();
        let result = match handle {
            Some(handle) => {
                self.request_stop();
                handle.join().unwrap_or_else(|_| {
                    warn!("StreamSession: worker thread panicked");
                    self.shared.set_status(ConnectionStatus::Closed);
                    Err(FatalSessionError {
                        attempts: 0,
                        last_error: "session thread panicked".into(),
                    })
                })
            }
            None => Ok(()),
        };
        *outcome = Some(result.clone());
        result
    }

    fn request_stop(&self) {
        match self.control.try_send(SessionCommand::Stop) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {
                debug!("StreamSession worker already exited");
            }
        }
    }

    /// Wait until every queued record has been delivered.
    pub fn flush(&self, timeout: Duration) -> bool {
        self.shared.queue.wait_empty(timeout)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status()
    }

    /// Records not yet delivered, oldest first.
    pub fn pending(&self) -> Vec<QueueEntry> {
        self.shared.queue.pending()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Records evicted by the drop-oldest overflow policy.
    pub fn dropped_count(&self) -> u64 {
        self.shared.queue.dropped_count()
    }

    /// The error that closed the session, if any.
    pub fn fatal_error(&self) -> Option<FatalSessionError> {
        self.shared.fatal()
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("status", &self.status())
            .field("queue", &self.shared.queue)
            .finish()
    }
}
