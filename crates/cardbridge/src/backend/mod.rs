//! Card-service backends
//!
//! A backend is the capability the bridge builds on: establish a context,
//! list readers, observe reader status and exchange raw bytes with a card.
//! [`PcscService`] talks to the system resource manager, [`MemoryService`]
//! simulates a bank of readers in process.

use std::fmt;
use std::time::Duration;

use crate::config::ExchangeOptions;
use crate::error::ServiceError;

pub mod memory;
mod native;

pub use self::memory::{CardResponder, ExchangeRecord, MemoryService, SimulatedCard};
pub use self::native::{PcscContext, PcscService};

/// Status of a reader and the card in it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReaderStatus {
    /// Reader is empty
    Absent,
    /// A responsive card is in the reader
    Present,
    /// A card is in the reader but does not answer
    Mute,
    /// Status could not be determined
    Unknown,
}

impl ReaderStatus {
    /// Whether a card sits in the reader, responsive or not
    pub const fn has_card(self) -> bool {
        matches!(self, Self::Present | Self::Mute)
    }
}

impl fmt::Display for ReaderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "no card"),
            Self::Present => write!(f, "card present"),
            Self::Mute => write!(f, "card mute"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A status reported by a status wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    /// Status the reader is in now
    pub status: ReaderStatus,
    /// Insertion/removal counter of the reader, if the backend keeps one
    pub event_count: Option<u32>,
}

impl StatusChange {
    /// A change from a backend without an event counter
    pub const fn new(status: ReaderStatus) -> Self {
        Self {
            status,
            event_count: None,
        }
    }

    /// Attach the reader's event counter
    pub const fn with_event_count(mut self, count: u32) -> Self {
        self.event_count = Some(count);
        self
    }
}

/// Listener-side bookkeeping for status waits on one reader
///
/// Holds the status the caller already knows about, so a wait returns only
/// once the reader reports something different. When the backend keeps an
/// event counter, a card that was swapped while nobody was waiting shows up
/// as a counter change with an unchanged status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusWatch {
    reader: String,
    known: ReaderStatus,
    event_count: Option<u32>,
}

impl StatusWatch {
    /// Start watching a reader with no knowledge of its status
    pub fn new(reader: impl Into<String>) -> Self {
        Self {
            reader: reader.into(),
            known: ReaderStatus::Unknown,
            event_count: None,
        }
    }

    /// Reader being watched
    pub fn reader(&self) -> &str {
        &self.reader
    }

    /// Last status acknowledged by the watcher
    pub const fn known(&self) -> ReaderStatus {
        self.known
    }

    /// Last event counter acknowledged by the watcher
    pub const fn event_count(&self) -> Option<u32> {
        self.event_count
    }

    /// Whether `status` with `event_count` differs from what the watcher knows
    ///
    /// A counter change only matters while a card is in the reader; removals
    /// already show up as a status change.
    pub fn differs(&self, status: ReaderStatus, event_count: Option<u32>) -> bool {
        status != self.known || self.is_swap(status, event_count)
    }

    /// Whether a card in the reader was replaced since the last acknowledgement
    pub fn is_swap(&self, status: ReaderStatus, event_count: Option<u32>) -> bool {
        status.has_card()
            && matches!((self.event_count, event_count), (Some(seen), Some(now)) if seen != now)
    }

    /// Record a status as seen, keeping the last known counter
    pub const fn acknowledge(&mut self, status: ReaderStatus) {
        self.known = status;
    }

    /// Record a change as seen
    pub const fn acknowledge_change(&mut self, change: StatusChange) {
        self.known = change.status;
        if change.event_count.is_some() {
            self.event_count = change.event_count;
        }
    }
}

/// Entry point of a backend: creates service contexts
pub trait CardService: Send + Sync + 'static {
    /// Context handle produced by this service
    type Context: ServiceContext;

    /// Establish a new context with the card service
    fn establish(&self) -> Result<Self::Context, ServiceError>;
}

/// A live connection to the card service
pub trait ServiceContext: Send + Sync + 'static {
    /// Names of all readers, in the order the service reports them
    fn list_readers(&self) -> Result<Vec<String>, ServiceError>;

    /// Current status of one reader, without waiting
    fn reader_status(&self, reader: &str) -> Result<ReaderStatus, ServiceError>;

    /// Wait up to `timeout` for the reader to differ from what `watch` knows
    ///
    /// See [`StatusWatch::differs`]. Returns `Ok(None)` when the timeout elapses and
    /// `Err(ServiceError::Cancelled)` when woken by [`ServiceContext::cancel`].
    /// The watch is not updated; the caller acknowledges what it processed.
    fn wait_status_change(
        &self,
        watch: &StatusWatch,
        timeout: Duration,
    ) -> Result<Option<StatusChange>, ServiceError>;

    /// Wake every status wait blocked on this context
    fn cancel(&self) -> Result<(), ServiceError>;

    /// Connect to the card, send `command`, return the full response and disconnect
    fn exchange(
        &self,
        reader: &str,
        command: &[u8],
        options: ExchangeOptions,
    ) -> Result<Vec<u8>, ServiceError>;

    /// Whether the context is still usable
    fn is_valid(&self) -> bool;
}
