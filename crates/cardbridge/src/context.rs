//! Lifetime of the card-service context

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::backend::{CardService, ServiceContext};
use crate::error::Result;
use crate::report::{Stage, classify};

/// Owns the single live context of a card service
///
/// The context is established on the first [`acquire`](Self::acquire) and
/// shared by reference count with every component that needs it. It is only
/// re-established once the service reports it invalid, or after
/// [`release`](Self::release).
pub struct ContextManager<S: CardService> {
    service: S,
    slot: Mutex<Option<Arc<S::Context>>>,
}

impl<S: CardService> fmt::Debug for ContextManager<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextManager")
            .field("established", &self.is_established())
            .finish()
    }
}

impl<S: CardService> ContextManager<S> {
    /// Create a manager; no context is established yet
    pub fn new(service: S) -> Self {
        Self {
            service,
            slot: Mutex::new(None),
        }
    }

    /// The live context, establishing it if needed
    pub fn acquire(&self) -> Result<Arc<S::Context>> {
        let mut slot = self.slot.lock();
        if let Some(context) = slot.as_ref() {
            if context.is_valid() {
                return Ok(Arc::clone(context));
            }
            debug!("held context is no longer valid, re-establishing");
        }

        let context = self
            .service
            .establish()
            .map(Arc::new)
            .map_err(|e| classify(Stage::Establish, "", e))?;
        info!("card service context established");
        *slot = Some(Arc::clone(&context));
        Ok(context)
    }

    /// Drop the held context; a no-op when none is held
    ///
    /// Components still holding a clone keep it alive until they finish.
    pub fn release(&self) {
        if self.slot.lock().take().is_some() {
            info!("card service context released");
        }
    }

    /// Whether a context is currently held
    pub fn is_established(&self) -> bool {
        self.slot.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryService;
    use crate::error::ErrorKind;

    #[test]
    fn test_acquire_is_lazy_and_reused() {
        let service = MemoryService::new().with_reader("ACS ACR122 0");
        let manager = ContextManager::new(service.clone());
        assert!(!manager.is_established());
        assert_eq!(service.established_contexts(), 0);

        let first = manager.acquire().unwrap();
        let second = manager.acquire().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(service.established_contexts(), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let manager = ContextManager::new(MemoryService::new());
        manager.release();
        manager.acquire().unwrap();
        manager.release();
        manager.release();
        assert!(!manager.is_established());
    }

    #[test]
    fn test_unreachable_service() {
        let service = MemoryService::new();
        service.set_available(false);
        let manager = ContextManager::new(service);
        let err = manager.acquire().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Context);
        assert!(!manager.is_established());
    }

    #[test]
    fn test_invalid_context_is_replaced() {
        let service = MemoryService::new();
        let manager = ContextManager::new(service.clone());
        let first = manager.acquire().unwrap();

        service.invalidate_contexts();
        let second = manager.acquire().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(service.established_contexts(), 2);
    }
}
