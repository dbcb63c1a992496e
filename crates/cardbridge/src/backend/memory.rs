//! In-process simulated card service
//!
//! [`MemoryService`] keeps a bank of named readers, each optionally holding a
//! [`SimulatedCard`]. Tests and demos drive it by inserting and removing
//! cards, taking the service down or injecting failures, then inspect the
//! exchange journal it keeps.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::{CardService, ReaderStatus, ServiceContext, StatusChange, StatusWatch};
use crate::config::{ExchangeOptions, GET_UID_COMMAND};
use crate::error::ServiceError;

/// Computes a card's response to a command (status bytes included)
pub type CardResponder = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Status word returned for commands a simulated card does not handle
const SW_INS_NOT_SUPPORTED: [u8; 2] = [0x6D, 0x00];

/// A card that can be placed in a simulated reader
#[derive(Clone)]
pub struct SimulatedCard {
    uid: Vec<u8>,
    mute: bool,
    responder: Option<CardResponder>,
}

impl fmt::Debug for SimulatedCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedCard")
            .field("uid", &hex::encode_upper(&self.uid))
            .field("mute", &self.mute)
            .field("has_responder", &self.responder.is_some())
            .finish()
    }
}

impl SimulatedCard {
    /// A responsive card with the given UID
    pub fn new(uid: impl Into<Vec<u8>>) -> Self {
        Self {
            uid: uid.into(),
            mute: false,
            responder: None,
        }
    }

    /// Make the card unresponsive
    pub const fn mute(mut self) -> Self {
        self.mute = true;
        self
    }

    /// Answer commands other than Get UID with `responder`
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// UID of the card
    pub fn uid(&self) -> &[u8] {
        &self.uid
    }

    fn respond(&self, command: &[u8]) -> Vec<u8> {
        if command == GET_UID_COMMAND {
            let mut response = self.uid.clone();
            response.extend_from_slice(&[0x90, 0x00]);
            return response;
        }
        match &self.responder {
            Some(responder) => responder(command),
            None => SW_INS_NOT_SUPPORTED.to_vec(),
        }
    }
}

/// One completed exchange, as seen by the simulated service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRecord {
    /// Reader the exchange went to
    pub reader: String,
    /// Command bytes
    pub command: Vec<u8>,
    /// Response bytes
    pub response: Vec<u8>,
}

#[derive(Debug)]
struct SimReader {
    name: String,
    card: Option<SimulatedCard>,
    // bumped on every insertion and removal
    events: u32,
    status_failure: Option<ServiceError>,
    exchange_failure: Option<ServiceError>,
}

#[derive(Debug, Default)]
struct Bank {
    unavailable: bool,
    generation: u64,
    readers: Vec<SimReader>,
    latency: Duration,
    journal: Vec<ExchangeRecord>,
    in_flight: HashMap<String, usize>,
    parallel: usize,
    peak_parallel: usize,
    overlaps: usize,
    established: usize,
}

impl Bank {
    fn reader(&self, name: &str) -> Result<&SimReader, ServiceError> {
        if self.unavailable {
            return Err(ServiceError::NoService);
        }
        self.readers
            .iter()
            .find(|r| r.name == name)
            .ok_or(ServiceError::UnknownReader)
    }

    fn reader_mut(&mut self, name: &str) -> Option<&mut SimReader> {
        self.readers.iter_mut().find(|r| r.name == name)
    }

    fn status(&self, name: &str) -> Result<StatusChange, ServiceError> {
        let reader = self.reader(name)?;
        if let Some(err) = &reader.status_failure {
            return Err(err.clone());
        }
        let status = match &reader.card {
            None => ReaderStatus::Absent,
            Some(card) if card.mute => ReaderStatus::Mute,
            Some(_) => ReaderStatus::Present,
        };
        Ok(StatusChange::new(status).with_event_count(reader.events))
    }

    /// Fail calls made through a context of an older generation
    fn check(&self, generation: u64) -> Result<(), ServiceError> {
        if self.unavailable {
            Err(ServiceError::NoService)
        } else if self.generation != generation {
            Err(ServiceError::InvalidContext)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    bank: Mutex<Bank>,
    changed: Condvar,
}

impl Shared {
    fn update<R>(&self, f: impl FnOnce(&mut Bank) -> R) -> R {
        let mut bank = self.bank.lock();
        let result = f(&mut *bank);
        drop(bank);
        self.changed.notify_all();
        result
    }
}

/// Simulated card service
#[derive(Debug, Clone, Default)]
pub struct MemoryService {
    shared: Arc<Shared>,
}

impl MemoryService {
    /// A service with no readers
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an empty reader (builder form)
    pub fn with_reader(self, name: impl Into<String>) -> Self {
        self.add_reader(name);
        self
    }

    /// Plug in an empty reader
    pub fn add_reader(&self, name: impl Into<String>) {
        let name = name.into();
        self.shared.update(|bank| {
            if bank.reader_mut(&name).is_none() {
                bank.readers.push(SimReader {
                    name,
                    card: None,
                    events: 0,
                    status_failure: None,
                    exchange_failure: None,
                });
            }
        });
    }

    /// Unplug a reader
    pub fn remove_reader(&self, name: &str) {
        self.shared
            .update(|bank| bank.readers.retain(|r| r.name != name));
    }

    /// Place a card in a reader, replacing any card already there
    pub fn insert_card(&self, reader: &str, card: SimulatedCard) {
        self.shared.update(|bank| match bank.reader_mut(reader) {
            Some(r) => {
                r.card = Some(card);
                r.events = r.events.wrapping_add(1);
            }
            None => debug!(reader, "insert into unknown simulated reader ignored"),
        });
    }

    /// Take the card out of a reader
    pub fn remove_card(&self, reader: &str) {
        self.shared.update(|bank| {
            if let Some(r) = bank.reader_mut(reader) {
                if r.card.take().is_some() {
                    r.events = r.events.wrapping_add(1);
                }
            }
        });
    }

    /// Take the whole service down or bring it back
    pub fn set_available(&self, available: bool) {
        self.shared.update(|bank| bank.unavailable = !available);
    }

    /// Make every context established so far invalid
    ///
    /// Invalidated contexts fail every call with `InvalidContext`, as after a
    /// resource manager restart.
    pub fn invalidate_contexts(&self) {
        self.shared.update(|bank| bank.generation += 1);
    }

    /// Time every exchange takes
    pub fn set_latency(&self, latency: Duration) {
        self.shared.update(|bank| bank.latency = latency);
    }

    /// Make status queries on a reader fail until cleared with `None`
    pub fn fail_status(&self, reader: &str, failure: Option<ServiceError>) {
        self.shared.update(|bank| {
            if let Some(r) = bank.reader_mut(reader) {
                r.status_failure = failure;
            }
        });
    }

    /// Make exchanges on a reader fail until cleared with `None`
    pub fn fail_exchanges(&self, reader: &str, failure: Option<ServiceError>) {
        self.shared.update(|bank| {
            if let Some(r) = bank.reader_mut(reader) {
                r.exchange_failure = failure;
            }
        });
    }

    /// Completed exchanges in completion order
    pub fn exchanges(&self) -> Vec<ExchangeRecord> {
        self.shared.bank.lock().journal.clone()
    }

    /// Number of times an exchange started while another was running on the same reader
    pub fn same_reader_overlaps(&self) -> usize {
        self.shared.bank.lock().overlaps
    }

    /// Highest number of exchanges seen running at once, across all readers
    pub fn peak_parallel_exchanges(&self) -> usize {
        self.shared.bank.lock().peak_parallel
    }

    /// Number of contexts established so far
    pub fn established_contexts(&self) -> usize {
        self.shared.bank.lock().established
    }
}

impl CardService for MemoryService {
    type Context = MemoryContext;

    fn establish(&self) -> Result<MemoryContext, ServiceError> {
        let mut bank = self.shared.bank.lock();
        if bank.unavailable {
            return Err(ServiceError::NoService);
        }
        bank.established += 1;
        Ok(MemoryContext {
            shared: Arc::clone(&self.shared),
            generation: bank.generation,
            cancel_epoch: AtomicU64::new(0),
        })
    }
}

/// Context handed out by [`MemoryService`]
#[derive(Debug)]
pub struct MemoryContext {
    shared: Arc<Shared>,
    generation: u64,
    cancel_epoch: AtomicU64,
}

/// Tracks one running exchange so the bookkeeping unwinds even if a responder panics
struct InFlight<'a> {
    shared: &'a Shared,
    reader: &'a str,
}

impl<'a> InFlight<'a> {
    fn enter(shared: &'a Shared, bank: &mut Bank, reader: &'a str) -> Self {
        let count = bank.in_flight.entry(reader.to_string()).or_default();
        *count += 1;
        if *count > 1 {
            bank.overlaps += 1;
        }
        bank.parallel += 1;
        bank.peak_parallel = bank.peak_parallel.max(bank.parallel);
        Self { shared, reader }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut bank = self.shared.bank.lock();
        if let Some(count) = bank.in_flight.get_mut(self.reader) {
            *count -= 1;
        }
        bank.parallel -= 1;
    }
}

impl ServiceContext for MemoryContext {
    fn list_readers(&self) -> Result<Vec<String>, ServiceError> {
        let bank = self.shared.bank.lock();
        bank.check(self.generation)?;
        Ok(bank.readers.iter().map(|r| r.name.clone()).collect())
    }

    fn reader_status(&self, reader: &str) -> Result<ReaderStatus, ServiceError> {
        let bank = self.shared.bank.lock();
        bank.check(self.generation)?;
        bank.status(reader).map(|change| change.status)
    }

    fn wait_status_change(
        &self,
        watch: &StatusWatch,
        timeout: Duration,
    ) -> Result<Option<StatusChange>, ServiceError> {
        let deadline = Instant::now() + timeout;
        let epoch = self.cancel_epoch.load(Ordering::SeqCst);
        let mut bank = self.shared.bank.lock();
        loop {
            if self.cancel_epoch.load(Ordering::SeqCst) != epoch {
                return Err(ServiceError::Cancelled);
            }
            bank.check(self.generation)?;
            let change = bank.status(watch.reader())?;
            if watch.differs(change.status, change.event_count) {
                return Ok(Some(change));
            }
            if self.shared.changed.wait_until(&mut bank, deadline).timed_out() {
                return Ok(None);
            }
        }
    }

    fn cancel(&self) -> Result<(), ServiceError> {
        self.cancel_epoch.fetch_add(1, Ordering::SeqCst);
        let _bank = self.shared.bank.lock();
        self.shared.changed.notify_all();
        Ok(())
    }

    fn exchange(
        &self,
        reader: &str,
        command: &[u8],
        _options: ExchangeOptions,
    ) -> Result<Vec<u8>, ServiceError> {
        let (card, latency, _guard) = {
            let mut bank = self.shared.bank.lock();
            bank.check(self.generation)?;
            let sim = bank.reader(reader)?;
            if let Some(err) = &sim.exchange_failure {
                return Err(err.clone());
            }
            let card = sim.card.clone().ok_or(ServiceError::NoCard)?;
            if card.mute {
                return Err(ServiceError::Unresponsive);
            }
            let latency = bank.latency;
            let guard = InFlight::enter(&self.shared, &mut bank, reader);
            (card, latency, guard)
        };

        if !latency.is_zero() {
            thread::sleep(latency);
        }
        let response = card.respond(command);

        self.shared.bank.lock().journal.push(ExchangeRecord {
            reader: reader.to_string(),
            command: command.to_vec(),
            response: response.clone(),
        });
        Ok(response)
    }

    fn is_valid(&self) -> bool {
        self.shared.bank.lock().check(self.generation).is_ok()
    }
}
