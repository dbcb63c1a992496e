//! Background card-presence listener
//!
//! One worker thread per session watches a single reader. Each insertion
//! edge (the reader going from empty or unknown to holding a responsive
//! card) triggers the identification command once; the UID or the failure is
//! delivered to the session's [`ListenerEventHandler`]. The listener moves
//! through the phases of [`ListenerPhase`] under one mutex, so `start` and
//! `stop` may be called from any thread.
//!
//! When the service restarts under a running session, the worker reports
//! the failure, backs off and re-acquires a context from the shared
//! [`ContextManager`], so listening resumes without a restart.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::backend::{CardService, ReaderStatus, ServiceContext, StatusChange, StatusWatch};
use crate::config::{BridgeConfig, ExchangeOptions};
use crate::context::ContextManager;
use crate::error::{BridgeError, Result, ServiceError};
use crate::event::{
    ListenerEvent, ListenerEventHandler, ListenerEventReceiver, ListenerPhase, SplitHandler,
    listener_event_channel,
};
use crate::reader::ReaderEnumerator;
use crate::report::{Stage, card_failure, classify, sink_message};

/// Extract the UID from an identification response
///
/// The UID is everything before the two status bytes, which must be `90 00`.
pub(crate) fn uid_from_response(reader: &str, response: &[u8]) -> Result<String> {
    let Some((uid, sw)) = response.split_last_chunk::<2>() else {
        return Err(card_failure(
            reader,
            format!("identification response too short ({} bytes)", response.len()),
        ));
    };
    if *sw != [0x90, 0x00] {
        return Err(card_failure(
            reader,
            format!(
                "card rejected identification with status {:02X}{:02X}",
                sw[0], sw[1]
            ),
        ));
    }
    if uid.is_empty() {
        return Err(card_failure(reader, "card returned an empty UID"));
    }
    Ok(hex::encode_upper(uid))
}

#[derive(Debug, Clone)]
struct ListenerSettings {
    poll_interval: Duration,
    error_backoff: Duration,
    identify_command: Vec<u8>,
    exchange: ExchangeOptions,
}

impl From<&BridgeConfig> for ListenerSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            error_backoff: config.error_backoff,
            identify_command: config.identify_command.clone(),
            exchange: config.exchange_options(),
        }
    }
}

// how often `stop` repeats the cancel while the worker is still running
const STOP_RECHECK: Duration = Duration::from_millis(10);

/// Context the worker currently waits on; replaced when the worker reconnects
struct ContextSlot<C>(Arc<Mutex<Arc<C>>>);

impl<C: ServiceContext> ContextSlot<C> {
    fn new(context: Arc<C>) -> Self {
        Self(Arc::new(Mutex::new(context)))
    }

    fn share(&self) -> Self {
        Self(Arc::clone(&self.0))
    }

    fn get(&self) -> Arc<C> {
        Arc::clone(&self.0.lock())
    }

    fn replace(&self, context: Arc<C>) {
        *self.0.lock() = context;
    }

    fn cancel(&self, reader: &str) {
        if let Err(e) = self.get().cancel() {
            debug!(reader, error = %e, "cancel of status wait failed");
        }
    }
}

/// Handle the controlling side keeps on a running worker
struct Session<C> {
    reader: String,
    context: ContextSlot<C>,
    stopping: Arc<AtomicBool>,
    wake: Sender<()>,
    worker: JoinHandle<()>,
}

impl<C: ServiceContext> Session<C> {
    /// Ask the worker to exit and interrupt whatever it is waiting on
    fn signal(self) -> (JoinHandle<()>, ContextSlot<C>) {
        self.stopping.store(true, Ordering::SeqCst);
        drop(self.wake);
        self.context.cancel(&self.reader);
        (self.worker, self.context)
    }
}

struct ListenerState<C> {
    phase: ListenerPhase,
    session: Option<Session<C>>,
    worker_id: Option<ThreadId>,
}

/// Background listener for card insertions on one reader at a time
pub struct CardListener<S: CardService> {
    contexts: Arc<ContextManager<S>>,
    readers: ReaderEnumerator<S>,
    settings: ListenerSettings,
    state: Mutex<ListenerState<S::Context>>,
    phase_changed: Condvar,
}

impl<S: CardService> fmt::Debug for CardListener<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardListener")
            .field("phase", &self.phase())
            .field("reader", &self.reader())
            .finish()
    }
}

impl<S: CardService> CardListener<S> {
    /// Create an idle listener
    pub fn new(contexts: Arc<ContextManager<S>>, config: &BridgeConfig) -> Self {
        Self {
            readers: ReaderEnumerator::new(Arc::clone(&contexts)),
            contexts,
            settings: config.into(),
            state: Mutex::new(ListenerState {
                phase: ListenerPhase::Idle,
                session: None,
                worker_id: None,
            }),
            phase_changed: Condvar::new(),
        }
    }

    /// Current phase
    pub fn phase(&self) -> ListenerPhase {
        self.state.lock().phase
    }

    /// Reader of the running session, if any
    pub fn reader(&self) -> Option<String> {
        self.state
            .lock()
            .session
            .as_ref()
            .map(|session| session.reader.clone())
    }

    /// Start listening on `reader`, delivering events to `handler`
    ///
    /// Returns as soon as the worker is running. Fails without side effects
    /// if a session already exists, the reader name is empty, the service is
    /// unreachable or the reader is not currently listed.
    pub fn start<H>(&self, reader: &str, handler: H) -> Result<()>
    where
        H: ListenerEventHandler + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            if state.phase != ListenerPhase::Idle {
                return Err(BridgeError::AlreadyListening);
            }
            if reader.is_empty() {
                return Err(BridgeError::InvalidParameter("reader name must not be empty"));
            }
            state.phase = ListenerPhase::Starting;
        }

        let launched = self.launch(reader, handler);

        let mut state = self.state.lock();
        let result = match launched {
            Ok(session) => {
                state.worker_id = Some(session.worker.thread().id());
                state.session = Some(session);
                state.phase = ListenerPhase::Running;
                info!(reader, "listener started");
                Ok(())
            }
            Err(e) => {
                state.phase = ListenerPhase::Idle;
                Err(e)
            }
        };
        self.phase_changed.notify_all();
        result
    }

    /// Start listening with separate UID and error sinks
    pub fn start_with<U, E>(&self, reader: &str, on_uid: U, on_error: E) -> Result<()>
    where
        U: FnMut(String) + Send + 'static,
        E: FnMut(String) + Send + 'static,
    {
        self.start(reader, SplitHandler::new(on_uid, on_error))
    }

    /// Start listening and receive events over a channel
    ///
    /// The channel disconnects once the session has stopped.
    pub fn start_channel(&self, reader: &str) -> Result<ListenerEventReceiver> {
        let (sender, receiver) = listener_event_channel();
        self.start(reader, move |event: ListenerEvent| {
            let _ = sender.send(event);
        })?;
        Ok(receiver)
    }

    fn launch<H>(&self, reader: &str, handler: H) -> Result<Session<S::Context>>
    where
        H: ListenerEventHandler + Send + 'static,
    {
        let context = self.contexts.acquire()?;
        self.readers.ensure_present(reader)?;

        let context = ContextSlot::new(context);
        let stopping = Arc::new(AtomicBool::new(false));
        let (wake, wake_rx) = bounded(0);
        let worker = Worker {
            reader: reader.to_string(),
            contexts: Arc::clone(&self.contexts),
            context: context.share(),
            settings: self.settings.clone(),
            stopping: Arc::clone(&stopping),
            wake: wake_rx,
        };

        let worker = thread::Builder::new()
            .name("cardbridge-listener".into())
            .spawn(move || worker.run(handler))
            .map_err(|e| {
                classify(
                    Stage::Establish,
                    reader,
                    ServiceError::Native {
                        code: e.raw_os_error().map_or(0, |c| c as u32),
                        message: format!("failed to start listener thread: {e}"),
                    },
                )
            })?;

        Ok(Session {
            reader: reader.to_string(),
            context,
            stopping,
            wake,
            worker,
        })
    }

    /// Stop the running session and wait for its worker to finish
    ///
    /// Returns immediately when idle. Once this returns, the session's
    /// handler is never invoked again. Called from inside the session's own
    /// handler, it signals the worker and returns without waiting for it.
    pub fn stop(&self) {
        let current = thread::current().id();
        let session = {
            let mut state = self.state.lock();
            loop {
                let phase = state.phase;
                match phase {
                    ListenerPhase::Idle => return,
                    ListenerPhase::Running => break,
                    ListenerPhase::Stopping if state.worker_id == Some(current) => return,
                    ListenerPhase::Starting | ListenerPhase::Stopping => {
                        self.phase_changed.wait(&mut state);
                    }
                }
            }
            state.phase = ListenerPhase::Stopping;
            state.session.take()
        };

        if let Some(session) = session {
            let reader = session.reader.clone();
            let (worker, context) = session.signal();
            if worker.thread().id() == current {
                warn!(%reader, "listener stopped from its own handler, not waiting for the worker");
            } else {
                // A cancel that lands before the worker enters its next wait is
                // lost, and the worker may have switched contexts meanwhile.
                while !worker.is_finished() {
                    thread::sleep(STOP_RECHECK);
                    context.cancel(&reader);
                }
                if worker.join().is_err() {
                    error!(%reader, "listener worker panicked");
                }
            }
            info!(%reader, "listener stopped");
        }

        let mut state = self.state.lock();
        state.phase = ListenerPhase::Idle;
        state.worker_id = None;
        self.phase_changed.notify_all();
    }
}

impl<S: CardService> Drop for CardListener<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The polling loop, owned by the worker thread
struct Worker<S: CardService> {
    reader: String,
    contexts: Arc<ContextManager<S>>,
    context: ContextSlot<S::Context>,
    settings: ListenerSettings,
    stopping: Arc<AtomicBool>,
    wake: Receiver<()>,
}

impl<S: CardService> Worker<S> {
    fn run<H: ListenerEventHandler>(self, mut handler: H) {
        info!(reader = %self.reader, "listening for cards");
        let mut watch = StatusWatch::new(self.reader.as_str());
        // cleared once an insertion has been handled, set again on removal
        let mut armed = true;

        while !self.is_stopping() {
            let context = self.context.get();
            let change = match context.wait_status_change(&watch, self.settings.poll_interval) {
                Ok(Some(change)) => change,
                Ok(None) => continue,
                Err(ServiceError::Cancelled) => {
                    debug!(reader = %self.reader, "status wait cancelled");
                    continue;
                }
                Err(e) => {
                    let lost = matches!(e, ServiceError::NoService | ServiceError::InvalidContext);
                    let err = classify(Stage::Status, &self.reader, e);
                    self.emit(&mut handler, ListenerEvent::Error(sink_message(&err)));
                    watch.acknowledge(ReaderStatus::Unknown);
                    self.pause();
                    if lost || !context.is_valid() {
                        self.reconnect(&context);
                    }
                    continue;
                }
            };

            self.process(&mut handler, &mut watch, &mut armed, change);
        }

        info!(reader = %self.reader, "listener worker exiting");
    }

    fn process<H: ListenerEventHandler>(
        &self,
        handler: &mut H,
        watch: &mut StatusWatch,
        armed: &mut bool,
        change: StatusChange,
    ) {
        let status = change.status;
        if watch.is_swap(status, change.event_count) {
            info!(reader = %self.reader, "card replaced");
            *armed = true;
        }
        debug!(reader = %self.reader, %status, armed = *armed, "reader status changed");
        watch.acknowledge_change(change);
        match status {
            ReaderStatus::Present if *armed => {
                *armed = false;
                info!(reader = %self.reader, "card detected");
                self.identify(handler);
            }
            ReaderStatus::Absent | ReaderStatus::Unknown => {
                if !*armed {
                    info!(reader = %self.reader, "card removed");
                }
                *armed = true;
            }
            ReaderStatus::Present | ReaderStatus::Mute => {}
        }
    }

    /// Switch to a fresh context after the one in use stopped working
    fn reconnect(&self, stale: &Arc<S::Context>) {
        if self.is_stopping() {
            return;
        }
        match self.contexts.acquire() {
            Ok(fresh) if Arc::ptr_eq(&fresh, stale) => {
                debug!(reader = %self.reader, "context still held, retrying with it");
            }
            Ok(fresh) => {
                info!(reader = %self.reader, "listener reconnected to card service");
                self.context.replace(fresh);
            }
            Err(e) => debug!(reader = %self.reader, error = %e, "reconnect failed"),
        }
    }

    fn identify<H: ListenerEventHandler>(&self, handler: &mut H) {
        let response = match self.context.get().exchange(
            &self.reader,
            &self.settings.identify_command,
            self.settings.exchange,
        ) {
            Ok(response) => response,
            Err(e) => {
                let err = classify(Stage::Identify, &self.reader, e);
                self.emit(handler, ListenerEvent::Error(sink_message(&err)));
                self.pause();
                return;
            }
        };

        match uid_from_response(&self.reader, &response) {
            Ok(uid) => {
                info!(reader = %self.reader, %uid, "card identified");
                self.emit(handler, ListenerEvent::Uid(uid));
            }
            Err(err) => self.emit(handler, ListenerEvent::Error(sink_message(&err))),
        }
    }

    fn emit<H: ListenerEventHandler>(&self, handler: &mut H, event: ListenerEvent) {
        if self.is_stopping() {
            debug!(reader = %self.reader, ?event, "dropping event after stop");
            return;
        }
        handler.handle_event(event);
    }

    /// Sleep for the error backoff, returning early when stopped
    fn pause(&self) {
        match self.wake.recv_timeout(self.settings.error_backoff) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                debug!(reader = %self.reader, "backoff interrupted");
            }
        }
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}
