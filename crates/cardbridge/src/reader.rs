//! Reader enumeration and status snapshots

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::backend::{CardService, ReaderStatus, ServiceContext};
use crate::context::ContextManager;
use crate::error::{BridgeError, Result};
use crate::report::{Stage, classify};

/// Snapshot of a reader taken during enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reader {
    name: String,
    status: ReaderStatus,
}

impl Reader {
    /// Create a reader snapshot
    pub const fn new(name: String, status: ReaderStatus) -> Self {
        Self { name, status }
    }

    /// Get the reader name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Status at the time of the snapshot
    pub const fn status(&self) -> ReaderStatus {
        self.status
    }

    /// Check if a card was in the reader at the time of the snapshot
    pub const fn has_card(&self) -> bool {
        self.status.has_card()
    }
}

/// Stateless reader queries over a shared context
pub struct ReaderEnumerator<S: CardService> {
    contexts: Arc<ContextManager<S>>,
}

impl<S: CardService> fmt::Debug for ReaderEnumerator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderEnumerator").finish_non_exhaustive()
    }
}

impl<S: CardService> Clone for ReaderEnumerator<S> {
    fn clone(&self) -> Self {
        Self {
            contexts: Arc::clone(&self.contexts),
        }
    }
}

impl<S: CardService> ReaderEnumerator<S> {
    /// Create an enumerator over `contexts`
    pub const fn new(contexts: Arc<ContextManager<S>>) -> Self {
        Self { contexts }
    }

    /// Names of all readers, in driver enumeration order
    pub fn list_readers(&self) -> Result<Vec<String>> {
        let context = self.contexts.acquire()?;
        let readers = context
            .list_readers()
            .map_err(|e| classify(Stage::Enumerate, "", e))?;
        debug!(count = readers.len(), "readers enumerated");
        Ok(readers)
    }

    /// All readers with their current status
    ///
    /// A reader whose status cannot be read is reported as
    /// [`ReaderStatus::Unknown`] rather than failing the whole listing.
    pub fn readers(&self) -> Result<Vec<Reader>> {
        let context = self.contexts.acquire()?;
        let names = context
            .list_readers()
            .map_err(|e| classify(Stage::Enumerate, "", e))?;

        Ok(names
            .into_iter()
            .map(|name| {
                let status = context.reader_status(&name).unwrap_or_else(|e| {
                    debug!(reader = %name, error = %e, "reader status unavailable");
                    ReaderStatus::Unknown
                });
                Reader::new(name, status)
            })
            .collect())
    }

    /// Current status of one reader, queried now
    pub fn reader_status(&self, reader: &str) -> Result<ReaderStatus> {
        let context = self.contexts.acquire()?;
        context
            .reader_status(reader)
            .map_err(|e| classify(Stage::Status, reader, e))
    }

    /// Fail with [`BridgeError::ReaderNotFound`] unless `reader` is currently listed
    pub fn ensure_present(&self, reader: &str) -> Result<()> {
        if self.list_readers()?.iter().any(|r| r == reader) {
            Ok(())
        } else {
            Err(BridgeError::ReaderNotFound(reader.to_string()))
        }
    }
}
