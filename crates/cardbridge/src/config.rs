//! Configuration options for the card bridge

use std::time::Duration;

use pcsc::{Scope as PcscScope, ShareMode as PcscShareMode};

/// "Get UID" pseudo-APDU understood by PC/SC contactless readers
pub const GET_UID_COMMAND: [u8; 5] = [0xFF, 0xCA, 0x00, 0x00, 0x00];

/// Scope of the card service context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextScope {
    /// Context bound to the calling user
    User,
    /// System-wide context (default)
    System,
}

impl From<ContextScope> for PcscScope {
    fn from(scope: ContextScope) -> Self {
        match scope {
            ContextScope::User => Self::User,
            ContextScope::System => Self::System,
        }
    }
}

/// Sharing mode for card connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareMode {
    /// Exclusive access to the card
    Exclusive,
    /// Shared access to the card (default)
    Shared,
}

impl From<ShareMode> for PcscShareMode {
    fn from(mode: ShareMode) -> Self {
        match mode {
            ShareMode::Exclusive => Self::Exclusive,
            ShareMode::Shared => Self::Shared,
        }
    }
}

/// Per-exchange options handed to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    /// Sharing mode used to connect to the card
    pub share_mode: ShareMode,
    /// Size of the receive buffer
    pub max_response_len: usize,
}

/// Configuration options for the card bridge
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Scope of the card service context
    pub scope: ContextScope,

    /// Sharing mode for card connections
    pub share_mode: ShareMode,

    /// Bounded wait of a single listener status poll
    pub poll_interval: Duration,

    /// Pause after a failed status query or connect in the listener
    pub error_backoff: Duration,

    /// Identification command sent on card insertion
    pub identify_command: Vec<u8>,

    /// Receive buffer size for exchanges
    pub max_response_len: usize,

    /// Number of transmit workers
    pub transmit_workers: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            scope: ContextScope::System,
            share_mode: ShareMode::Shared,
            poll_interval: Duration::from_millis(1000),
            error_backoff: Duration::from_millis(500),
            identify_command: GET_UID_COMMAND.to_vec(),
            max_response_len: 260,
            transmit_workers: 4,
        }
    }
}

impl BridgeConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the context scope
    pub const fn with_scope(mut self, scope: ContextScope) -> Self {
        self.scope = scope;
        self
    }

    /// Set the sharing mode
    pub const fn with_share_mode(mut self, mode: ShareMode) -> Self {
        self.share_mode = mode;
        self
    }

    /// Set the listener poll interval
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the listener error backoff
    pub const fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Set the identification command
    pub fn with_identify_command(mut self, command: impl Into<Vec<u8>>) -> Self {
        self.identify_command = command.into();
        self
    }

    /// Set the receive buffer size
    pub const fn with_max_response_len(mut self, len: usize) -> Self {
        self.max_response_len = len;
        self
    }

    /// Set the number of transmit workers (at least one is always used)
    pub const fn with_transmit_workers(mut self, workers: usize) -> Self {
        self.transmit_workers = workers;
        self
    }

    pub(crate) const fn exchange_options(&self) -> ExchangeOptions {
        ExchangeOptions {
            share_mode: self.share_mode,
            max_response_len: self.max_response_len,
        }
    }
}
