//! Classification of backend failures into caller-visible errors
//!
//! Every backend failure passes through [`classify`] exactly once, so a given
//! native condition always maps to the same [`BridgeError`] member and the
//! same wording regardless of which component hit it. How the result reaches
//! the caller depends on the operation: setup calls return it, transmit
//! resolves its handle with it, and the listener renders it with
//! [`sink_message`] for the error sink.

use tracing::{error, warn};

use crate::error::{BridgeError, ServiceError};

/// Operation during which a backend failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Establishing the service context
    Establish,
    /// Listing readers
    Enumerate,
    /// Querying or waiting on reader status
    Status,
    /// The listener's default identification exchange
    Identify,
    /// A caller-requested transmit exchange
    Transmit,
}

/// Map a backend failure to the bridge taxonomy
pub fn classify(stage: Stage, reader: &str, err: ServiceError) -> BridgeError {
    let mapped = match (stage, err) {
        (Stage::Establish, e) => BridgeError::Context(e),
        (Stage::Enumerate, e) => BridgeError::Enumeration(e),
        (_, e @ (ServiceError::NoService | ServiceError::InvalidContext)) => {
            BridgeError::ContextLost(e)
        }
        (_, ServiceError::UnknownReader) => BridgeError::ReaderNotFound(reader.to_string()),
        (_, ServiceError::NoCard | ServiceError::CardRemoved) => {
            BridgeError::CardAbsent(reader.to_string())
        }
        (Stage::Transmit, source) => BridgeError::Transmission {
            reader: reader.to_string(),
            source,
        },
        (Stage::Status, ServiceError::ReaderUnavailable) => BridgeError::CardCommunication {
            reader: reader.to_string(),
            reason: "reader unavailable or card service stopped".to_string(),
        },
        (_, e) => BridgeError::CardCommunication {
            reader: reader.to_string(),
            reason: e.to_string(),
        },
    };

    match stage {
        Stage::Establish | Stage::Enumerate => error!(?stage, error = %mapped, "card service failure"),
        _ => warn!(?stage, reader, error = %mapped, "card operation failed"),
    }

    mapped
}

/// A card answered, but not in a usable way
pub fn card_failure(reader: &str, reason: impl Into<String>) -> BridgeError {
    let mapped = BridgeError::CardCommunication {
        reader: reader.to_string(),
        reason: reason.into(),
    };
    warn!(reader, error = %mapped, "card answered with an unusable response");
    mapped
}

/// Render a listener runtime error for the error sink
pub fn sink_message(err: &BridgeError) -> String {
    format!("Error: {err}")
}
