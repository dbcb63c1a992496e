//! Card service backed by the system PC/SC resource manager

use std::ffi::CString;
use std::time::{Duration, Instant};

use pcsc::{Context, Disposition, Protocols, ReaderState, State};
use tracing::{debug, trace};

use super::{CardService, ReaderStatus, ServiceContext, StatusChange, StatusWatch};
use crate::config::{ContextScope, ExchangeOptions};
use crate::error::ServiceError;

impl From<pcsc::Error> for ServiceError {
    fn from(err: pcsc::Error) -> Self {
        match err {
            pcsc::Error::NoService | pcsc::Error::ServiceStopped => Self::NoService,
            pcsc::Error::InvalidHandle => Self::InvalidContext,
            pcsc::Error::UnknownReader => Self::UnknownReader,
            pcsc::Error::ReaderUnavailable => Self::ReaderUnavailable,
            pcsc::Error::NoSmartcard => Self::NoCard,
            pcsc::Error::RemovedCard => Self::CardRemoved,
            pcsc::Error::UnresponsiveCard => Self::Unresponsive,
            pcsc::Error::Timeout => Self::Timeout,
            pcsc::Error::Cancelled => Self::Cancelled,
            other => Self::Native {
                code: other as u32,
                message: other.to_string(),
            },
        }
    }
}

/// Status a PC/SC state word describes
fn status_from_state(state: State) -> ReaderStatus {
    if state.intersects(State::UNKNOWN | State::UNAVAILABLE) {
        ReaderStatus::Unknown
    } else if state.contains(State::EMPTY) {
        ReaderStatus::Absent
    } else if state.contains(State::PRESENT) {
        if state.contains(State::MUTE) {
            ReaderStatus::Mute
        } else {
            ReaderStatus::Present
        }
    } else {
        ReaderStatus::Unknown
    }
}

fn change_from_state(state: &ReaderState) -> StatusChange {
    StatusChange::new(status_from_state(state.event_state())).with_event_count(state.event_count())
}

fn reader_cstring(reader: &str) -> Result<CString, ServiceError> {
    CString::new(reader).map_err(|_| ServiceError::UnknownReader)
}

/// Card service using the platform PC/SC stack
#[derive(Debug, Clone, Copy)]
pub struct PcscService {
    scope: ContextScope,
}

impl PcscService {
    /// Create a service establishing contexts in `scope`
    pub const fn new(scope: ContextScope) -> Self {
        Self { scope }
    }
}

impl Default for PcscService {
    fn default() -> Self {
        Self::new(ContextScope::System)
    }
}

impl CardService for PcscService {
    type Context = PcscContext;

    fn establish(&self) -> Result<PcscContext, ServiceError> {
        let context = Context::establish(self.scope.into())?;
        debug!(scope = ?self.scope, "PC/SC context established");
        Ok(PcscContext { context })
    }
}

/// Live PC/SC context
#[allow(missing_debug_implementations)]
pub struct PcscContext {
    context: Context,
}

impl ServiceContext for PcscContext {
    fn list_readers(&self) -> Result<Vec<String>, ServiceError> {
        match self.context.list_readers_owned() {
            Ok(readers) => Ok(readers
                .into_iter()
                .map(|r| r.to_string_lossy().into_owned())
                .collect()),
            Err(pcsc::Error::NoReadersAvailable) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn reader_status(&self, reader: &str) -> Result<ReaderStatus, ServiceError> {
        let mut states = [ReaderState::new(reader_cstring(reader)?, State::UNAWARE)];
        self.context
            .get_status_change(Duration::ZERO, &mut states)?;
        Ok(status_from_state(states[0].event_state()))
    }

    fn wait_status_change(
        &self,
        watch: &StatusWatch,
        timeout: Duration,
    ) -> Result<Option<StatusChange>, ServiceError> {
        let deadline = Instant::now() + timeout;
        let mut states = [ReaderState::new(reader_cstring(watch.reader())?, State::UNAWARE)];

        // An UNAWARE query returns at once with the current state and event
        // counter, which catches swaps that happened between two waits.
        self.context.get_status_change(Duration::ZERO, &mut states)?;
        let change = change_from_state(&states[0]);
        if watch.differs(change.status, change.event_count) {
            return Ok(Some(change));
        }

        // The resource manager also reports flag changes that do not alter the
        // card status (INUSE toggling while a card is connected); absorb those.
        loop {
            states[0].sync_current_state();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.context.get_status_change(remaining, &mut states) {
                Ok(()) => {}
                Err(pcsc::Error::Timeout) => return Ok(None),
                Err(e) => return Err(e.into()),
            }

            let change = change_from_state(&states[0]);
            trace!(
                reader = watch.reader(),
                event_state = ?states[0].event_state(),
                status = %change.status,
                event_count = ?change.event_count,
                "status change"
            );
            if watch.differs(change.status, change.event_count) {
                return Ok(Some(change));
            }
        }
    }

    fn cancel(&self) -> Result<(), ServiceError> {
        self.context.cancel().map_err(Into::into)
    }

    fn exchange(
        &self,
        reader: &str,
        command: &[u8],
        options: ExchangeOptions,
    ) -> Result<Vec<u8>, ServiceError> {
        let reader_cstr = reader_cstring(reader)?;
        let card = self
            .context
            .connect(&reader_cstr, options.share_mode.into(), Protocols::T0 | Protocols::T1)?;

        let mut response_buffer = vec![0u8; options.max_response_len];
        let result = card
            .transmit(command, &mut response_buffer)
            .map(<[u8]>::to_vec)
            .map_err(ServiceError::from);

        if let Err((_, e)) = card.disconnect(Disposition::LeaveCard) {
            debug!(reader, error = %e, "disconnect failed");
        }

        result
    }

    fn is_valid(&self) -> bool {
        self.context.is_valid().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(status_from_state(State::EMPTY), ReaderStatus::Absent);
        assert_eq!(
            status_from_state(State::PRESENT | State::INUSE),
            ReaderStatus::Present
        );
        assert_eq!(
            status_from_state(State::PRESENT | State::MUTE),
            ReaderStatus::Mute
        );
        assert_eq!(
            status_from_state(State::UNAVAILABLE | State::EMPTY),
            ReaderStatus::Unknown
        );
        assert_eq!(status_from_state(State::UNAWARE), ReaderStatus::Unknown);
    }

    #[test]
    fn test_unaware_state_carries_no_count() {
        let state = ReaderState::new(reader_cstring("ACS ACR122 0").unwrap(), State::UNAWARE);
        let change = change_from_state(&state);
        assert_eq!(change.status, ReaderStatus::Unknown);
        assert_eq!(change.event_count, Some(0));
    }

    #[test]
    fn test_error_translation() {
        assert_eq!(ServiceError::from(pcsc::Error::NoService), ServiceError::NoService);
        assert_eq!(ServiceError::from(pcsc::Error::NoSmartcard), ServiceError::NoCard);
        assert_eq!(
            ServiceError::from(pcsc::Error::UnknownReader),
            ServiceError::UnknownReader
        );
        let native = ServiceError::from(pcsc::Error::CommError);
        assert!(native.code().is_some());
    }

    #[test]
    fn test_reader_name_with_nul_is_unknown() {
        assert_eq!(reader_cstring("bad\0name"), Err(ServiceError::UnknownReader));
    }
}
