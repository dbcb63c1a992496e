//! Error types for the card bridge
//!
//! Two layers are kept apart: [`ServiceError`] is what a card-service backend
//! reports, [`BridgeError`] is what callers of the bridge see. The mapping
//! between them lives in [`crate::report`].

/// Failure reported by a card-service backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// The card service (resource manager) is not running
    #[error("card service is not running")]
    NoService,

    /// The service context handle is no longer valid
    #[error("card service context is invalid")]
    InvalidContext,

    /// The reader name is not known to the service
    #[error("unknown reader")]
    UnknownReader,

    /// The reader exists but cannot be used right now
    #[error("reader is unavailable")]
    ReaderUnavailable,

    /// No card in the reader
    #[error("no card in reader")]
    NoCard,

    /// The card was removed during the operation
    #[error("card was removed")]
    CardRemoved,

    /// The card does not answer
    #[error("card is unresponsive")]
    Unresponsive,

    /// A bounded wait elapsed
    #[error("operation timed out")]
    Timeout,

    /// A blocking wait was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Any other native failure, with its code
    #[error("{message} (0x{code:08X})")]
    Native {
        /// Native status code
        code: u32,
        /// Native description
        message: String,
    },
}

impl ServiceError {
    /// Native status code carried by this error, if any
    pub const fn code(&self) -> Option<u32> {
        match self {
            Self::Native { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Coarse classification of a [`BridgeError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Card service unreachable or unavailable
    Context,
    /// Listing readers failed
    Enumeration,
    /// Bad input to an operation
    InvalidParameter,
    /// A listener session is already active
    AlreadyListening,
    /// The named reader does not exist
    ReaderNotFound,
    /// No card in the reader
    CardAbsent,
    /// Identification or generic card exchange failed
    CardCommunication,
    /// A transmit exchange failed
    Transmission,
}

/// Errors surfaced to callers of the bridge
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// Card service unreachable or unavailable
    #[error("Failed to establish card service context: {0}")]
    Context(#[source] ServiceError),

    /// A context in use stopped working, usually because the service restarted
    #[error("Card service context lost: {0}")]
    ContextLost(#[source] ServiceError),

    /// Listing readers failed
    #[error("Failed to list readers: {0}")]
    Enumeration(#[source] ServiceError),

    /// Bad input to an operation
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// A listener session is already active
    #[error("Listener is already active, stop it first")]
    AlreadyListening,

    /// The named reader does not exist
    #[error("Reader not found: {0}")]
    ReaderNotFound(String),

    /// No card in the reader
    #[error("No card present in reader: {0}")]
    CardAbsent(String),

    /// Identification or generic card exchange failed
    #[error("Card communication failed on reader '{reader}': {reason}")]
    CardCommunication {
        /// Reader the card sits in
        reader: String,
        /// What went wrong
        reason: String,
    },

    /// A transmit exchange failed
    #[error("APDU transmit failed on reader '{reader}': {source}")]
    Transmission {
        /// Reader the exchange was addressed to
        reader: String,
        /// Underlying backend failure
        #[source]
        source: ServiceError,
    },
}

impl BridgeError {
    /// Classification of this error
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Context(_) | Self::ContextLost(_) => ErrorKind::Context,
            Self::Enumeration(_) => ErrorKind::Enumeration,
            Self::InvalidParameter(_) => ErrorKind::InvalidParameter,
            Self::AlreadyListening => ErrorKind::AlreadyListening,
            Self::ReaderNotFound(_) => ErrorKind::ReaderNotFound,
            Self::CardAbsent(_) => ErrorKind::CardAbsent,
            Self::CardCommunication { .. } => ErrorKind::CardCommunication,
            Self::Transmission { .. } => ErrorKind::Transmission,
        }
    }

    /// Native status code behind this error, when the backend supplied one
    pub const fn native_code(&self) -> Option<u32> {
        match self {
            Self::Context(e) | Self::ContextLost(e) | Self::Enumeration(e) => e.code(),
            Self::Transmission { source, .. } => source.code(),
            _ => None,
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_code_is_exposed() {
        let err = BridgeError::Transmission {
            reader: "ACS ACR122 0".into(),
            source: ServiceError::Native {
                code: 0x8010_0016,
                message: "Not transacted".into(),
            },
        };
        assert_eq!(err.kind(), ErrorKind::Transmission);
        assert_eq!(err.native_code(), Some(0x8010_0016));
        assert!(err.to_string().contains("0x80100016"));
    }

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(BridgeError::AlreadyListening.kind(), ErrorKind::AlreadyListening);
        assert_eq!(
            BridgeError::CardAbsent("r".into()).kind(),
            ErrorKind::CardAbsent
        );
        assert_eq!(
            BridgeError::Context(ServiceError::NoService).native_code(),
            None
        );
    }
}
