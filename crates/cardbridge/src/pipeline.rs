//! Non-blocking APDU transmission
//!
//! Requests are handed to a fixed pool of worker threads and answered through
//! a [`TransmitHandle`]. Each reader has a lane: while one exchange runs on a
//! reader, later requests for that reader queue behind it in submission
//! order, and the worker that finishes the running exchange picks up the next
//! one. Requests for different readers run in parallel, up to the pool size.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, unbounded};
use futures::FutureExt;
use futures::channel::oneshot;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::backend::{CardService, ServiceContext};
use crate::config::{BridgeConfig, ExchangeOptions};
use crate::context::ContextManager;
use crate::error::{BridgeError, Result, ServiceError};
use crate::report::{Stage, classify};

/// Pending result of a transmit request
///
/// Await it, or call [`wait`](Self::wait) from synchronous code. Dropping the
/// handle does not cancel the exchange.
#[must_use = "the response is only observable through the handle"]
#[derive(Debug)]
pub struct TransmitHandle {
    reader: String,
    receiver: oneshot::Receiver<Result<Bytes>>,
}

impl TransmitHandle {
    fn new(reader: &str) -> (oneshot::Sender<Result<Bytes>>, Self) {
        let (sender, receiver) = oneshot::channel();
        let handle = Self {
            reader: reader.to_string(),
            receiver,
        };
        (sender, handle)
    }

    /// Reader the request was addressed to
    pub fn reader(&self) -> &str {
        &self.reader
    }

    /// Block the calling thread until the request completes
    pub fn wait(self) -> Result<Bytes> {
        futures::executor::block_on(self)
    }

    /// Take the result if the request has already completed
    ///
    /// Consumes the handle once it resolves, so a result is observed only
    /// once; a pending request hands the handle back in `Err`.
    pub fn try_take(mut self) -> std::result::Result<Result<Bytes>, Self> {
        match self.receiver.try_recv() {
            Ok(Some(result)) => Ok(result),
            Ok(None) => Err(self),
            Err(oneshot::Canceled) => Ok(Err(self.abandoned())),
        }
    }

    fn abandoned(&self) -> BridgeError {
        BridgeError::Transmission {
            reader: self.reader.clone(),
            source: ServiceError::Cancelled,
        }
    }
}

impl Future for TransmitHandle {
    type Output = Result<Bytes>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.receiver.poll_unpin(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(self.abandoned())),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct Job {
    reader: String,
    command: Bytes,
    reply: oneshot::Sender<Result<Bytes>>,
}

impl Job {
    fn finish(self, result: Result<Bytes>) {
        if self.reply.send(result).is_err() {
            trace!(reader = %self.reader, "transmit handle dropped before completion");
        }
    }
}

/// State shared by the pool
struct Shared<S: CardService> {
    contexts: Arc<ContextManager<S>>,
    options: ExchangeOptions,
    // a reader has an entry while one of its exchanges is running
    lanes: Mutex<HashMap<String, VecDeque<Job>>>,
}

impl<S: CardService> Shared<S> {
    /// Claim the reader's lane for `job`, or queue it behind the running exchange
    fn admit(&self, job: Job) -> Option<Job> {
        let mut lanes = self.lanes.lock();
        match lanes.get_mut(&job.reader) {
            Some(queue) => {
                debug!(reader = %job.reader, queued = queue.len() + 1, "reader busy, transmit queued");
                queue.push_back(job);
                None
            }
            None => {
                lanes.insert(job.reader.clone(), VecDeque::new());
                Some(job)
            }
        }
    }

    /// Next queued job for `reader`, releasing the lane when there is none
    fn next_in_lane(&self, reader: &str) -> Option<Job> {
        let mut lanes = self.lanes.lock();
        let next = lanes.get_mut(reader).and_then(VecDeque::pop_front);
        if next.is_none() {
            lanes.remove(reader);
        }
        next
    }

    fn run(&self, job: Job) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.exchange(&job.reader, &job.command)
        }))
        .unwrap_or_else(|_| {
            error!(reader = %job.reader, "exchange panicked");
            Err(BridgeError::Transmission {
                reader: job.reader.clone(),
                source: ServiceError::Native {
                    code: 0,
                    message: "exchange panicked".to_string(),
                },
            })
        });
        job.finish(outcome);
    }

    fn exchange(&self, reader: &str, command: &[u8]) -> Result<Bytes> {
        let context = self.contexts.acquire()?;
        trace!(reader, command = %hex::encode_upper(command), "transmitting APDU");
        let response = context
            .exchange(reader, command, self.options)
            .map_err(|e| classify(Stage::Transmit, reader, e))?;
        trace!(reader, response = %hex::encode_upper(&response), "APDU response");
        Ok(Bytes::from(response))
    }
}

fn worker_loop<S: CardService>(shared: Arc<Shared<S>>, jobs: Receiver<Job>) {
    while let Ok(job) = jobs.recv() {
        let reader = job.reader.clone();
        let mut next = Some(job);
        while let Some(job) = next {
            shared.run(job);
            next = shared.next_in_lane(&reader);
        }
    }
    debug!("transmit worker exiting");
}

/// Worker pool executing APDU exchanges off the caller's thread
pub struct TransmitPipeline<S: CardService> {
    shared: Arc<Shared<S>>,
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl<S: CardService> fmt::Debug for TransmitPipeline<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransmitPipeline")
            .field("workers", &self.workers.len())
            .field("busy_readers", &self.shared.lanes.lock().len())
            .finish()
    }
}

impl<S: CardService> TransmitPipeline<S> {
    /// Start a pool of `config.transmit_workers` threads (at least one)
    pub fn new(contexts: Arc<ContextManager<S>>, config: &BridgeConfig) -> Self {
        let shared = Arc::new(Shared {
            contexts,
            options: config.exchange_options(),
            lanes: Mutex::new(HashMap::new()),
        });
        let (sender, receiver) = unbounded();

        let workers = (0..config.transmit_workers.max(1))
            .filter_map(|index| {
                let shared = Arc::clone(&shared);
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("cardbridge-transmit-{index}"))
                    .spawn(move || worker_loop(shared, receiver))
                    .map_err(|e| error!(index, error = %e, "failed to start transmit worker"))
                    .ok()
            })
            .collect::<Vec<_>>();
        debug!(workers = workers.len(), "transmit pipeline started");

        Self {
            shared,
            jobs: (!workers.is_empty()).then_some(sender),
            workers,
        }
    }

    /// Number of running workers
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Queue `command` for `reader` and return at once
    ///
    /// Every failure, including invalid input, is delivered through the
    /// returned handle.
    pub fn transmit(&self, reader: &str, command: impl Into<Bytes>) -> TransmitHandle {
        let command = command.into();
        let (reply, handle) = TransmitHandle::new(reader);
        let job = Job {
            reader: reader.to_string(),
            command,
            reply,
        };

        if job.reader.is_empty() {
            job.finish(Err(BridgeError::InvalidParameter("reader name must not be empty")));
            return handle;
        }
        if job.command.is_empty() {
            job.finish(Err(BridgeError::InvalidParameter("APDU must not be empty")));
            return handle;
        }

        if let Some(job) = self.shared.admit(job) {
            self.dispatch(job);
        }
        handle
    }

    fn dispatch(&self, job: Job) {
        let Some(jobs) = &self.jobs else {
            self.reject(job);
            return;
        };
        if let Err(e) = jobs.send(job) {
            self.reject(e.into_inner());
        }
    }

    /// Fail a job that cannot reach a worker, along with its queued lane
    fn reject(&self, job: Job) {
        warn!(reader = %job.reader, "no transmit worker available");
        let reader = job.reader.clone();
        let mut next = Some(job);
        while let Some(job) = next {
            let err = BridgeError::Transmission {
                reader: job.reader.clone(),
                source: ServiceError::NoService,
            };
            job.finish(Err(err));
            next = self.shared.next_in_lane(&reader);
        }
    }
}

impl<S: CardService> Drop for TransmitPipeline<S> {
    /// Stop accepting work, let queued exchanges finish and join the workers
    fn drop(&mut self) {
        drop(self.jobs.take());
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("transmit worker panicked");
            }
        }
    }
}
