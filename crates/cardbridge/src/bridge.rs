//! The bridge facade

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::info;

use crate::backend::{CardService, PcscService, ReaderStatus};
use crate::config::BridgeConfig;
use crate::context::ContextManager;
use crate::error::Result;
use crate::event::{ListenerEventHandler, ListenerEventReceiver, ListenerPhase};
use crate::listener::CardListener;
use crate::pipeline::{TransmitHandle, TransmitPipeline};
use crate::reader::{Reader, ReaderEnumerator};

/// Reader enumeration, card listening and APDU transmission over one context
///
/// All components share a single card-service context, established on first
/// use. At most one listener session exists per bridge.
pub struct CardBridge<S: CardService = PcscService> {
    contexts: Arc<ContextManager<S>>,
    readers: ReaderEnumerator<S>,
    listener: CardListener<S>,
    pipeline: TransmitPipeline<S>,
}

impl<S: CardService> fmt::Debug for CardBridge<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardBridge")
            .field("contexts", &self.contexts)
            .field("listener", &self.listener)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

impl CardBridge<PcscService> {
    /// Create a bridge over the system PC/SC service
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_service(PcscService::new(config.scope), config)
    }
}

impl Default for CardBridge<PcscService> {
    fn default() -> Self {
        Self::new(BridgeConfig::default())
    }
}

impl<S: CardService> CardBridge<S> {
    /// Create a bridge over any card service
    pub fn with_service(service: S, config: BridgeConfig) -> Self {
        let contexts = Arc::new(ContextManager::new(service));
        Self {
            readers: ReaderEnumerator::new(Arc::clone(&contexts)),
            listener: CardListener::new(Arc::clone(&contexts), &config),
            pipeline: TransmitPipeline::new(Arc::clone(&contexts), &config),
            contexts,
        }
    }

    /// Names of all connected readers
    pub fn list_readers(&self) -> Result<Vec<String>> {
        self.readers.list_readers()
    }

    /// All connected readers with their current status
    pub fn readers(&self) -> Result<Vec<Reader>> {
        self.readers.readers()
    }

    /// Current status of one reader
    pub fn reader_status(&self, reader: &str) -> Result<ReaderStatus> {
        self.readers.reader_status(reader)
    }

    /// Listen for cards on `reader`, calling `on_uid` and `on_error` from the worker
    pub fn start_listening<U, E>(&self, reader: &str, on_uid: U, on_error: E) -> Result<()>
    where
        U: FnMut(String) + Send + 'static,
        E: FnMut(String) + Send + 'static,
    {
        self.listener.start_with(reader, on_uid, on_error)
    }

    /// Listen for cards on `reader` with a single event handler
    pub fn start_listening_with<H>(&self, reader: &str, handler: H) -> Result<()>
    where
        H: ListenerEventHandler + Send + 'static,
    {
        self.listener.start(reader, handler)
    }

    /// Listen for cards on `reader` and receive the events over a channel
    pub fn start_listening_channel(&self, reader: &str) -> Result<ListenerEventReceiver> {
        self.listener.start_channel(reader)
    }

    /// Stop the listener session, waiting for its worker; no-op when idle
    pub fn stop_listening(&self) {
        self.listener.stop();
    }

    /// Phase of the listener
    pub fn listener_phase(&self) -> ListenerPhase {
        self.listener.phase()
    }

    /// Send `command` to the card in `reader` without blocking
    pub fn transmit(&self, reader: &str, command: impl Into<Bytes>) -> TransmitHandle {
        self.pipeline.transmit(reader, command)
    }

    /// Stop listening and release the context
    ///
    /// The bridge stays usable; the next operation establishes a new context.
    /// Transmits already queued run to completion.
    pub fn shutdown(&self) {
        self.listener.stop();
        self.contexts.release();
        info!("card bridge shut down");
    }

    /// The context manager shared by all components
    pub const fn contexts(&self) -> &Arc<ContextManager<S>> {
        &self.contexts
    }
}

impl<S: CardService> Drop for CardBridge<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryService, SimulatedCard};
    use crate::event::ListenerEvent;
    use std::time::Duration;

    const READER: &str = "ACS ACR122 0";

    fn bridge(service: &MemoryService) -> CardBridge<MemoryService> {
        let config = BridgeConfig::default().with_poll_interval(Duration::from_millis(20));
        CardBridge::with_service(service.clone(), config)
    }

    #[test]
    fn test_components_share_one_context() {
        let service = MemoryService::new().with_reader(READER);
        service.insert_card(READER, SimulatedCard::new([0x04, 0x11]));
        let bridge = bridge(&service);

        bridge.list_readers().unwrap();
        let events = bridge.start_listening_channel(READER).unwrap();
        assert_eq!(
            events.recv_timeout(Duration::from_secs(2)).unwrap(),
            ListenerEvent::Uid("0411".into())
        );
        bridge.transmit(READER, vec![0x00, 0xB0, 0x00, 0x00]).wait().unwrap();

        assert_eq!(service.established_contexts(), 1);
    }

    #[test]
    fn test_shutdown_releases_and_bridge_recovers() {
        let service = MemoryService::new().with_reader(READER);
        let bridge = bridge(&service);
        let _events = bridge.start_listening_channel(READER).unwrap();

        bridge.shutdown();
        assert_eq!(bridge.listener_phase(), ListenerPhase::Idle);
        assert!(!bridge.contexts().is_established());

        assert_eq!(bridge.list_readers().unwrap(), vec![READER]);
        assert_eq!(service.established_contexts(), 2);
    }
}
