//! JSON-serializable event projections for external consumers (an FFI
//! boundary, a structured-logging sink, a UI event bus). Grounded on
//! `norddrop::device::types`'s `EventTransfer`/`ProgressEvent`/
//! `FinishEvent` structs: a separate serializable projection of internal
//! state rather than deriving `Serialize` on the domain types themselves,
//! since `Transfer::exception` carries a `SoulseekError` with no stable
//! wire representation of its own.

use serde::Serialize;

use crate::state::{Event, TransferProgressUpdated, TransferStateChanged};
use crate::transfer::Transfer;

#[derive(Debug, Serialize)]
pub struct TransferSnapshot {
    pub direction: String,
    pub username: String,
    pub filename: String,
    pub token: u32,
    pub remote_token: Option<u32>,
    pub size: Option<u64>,
    pub start_offset: u64,
    pub bytes_transferred: u64,
    pub state: String,
    pub exception: Option<String>,
}

impl From<&Transfer> for TransferSnapshot {
    fn from(t: &Transfer) -> Self {
        Self {
            direction: t.direction.to_string(),
            username: t.username.clone(),
            filename: t.filename.clone(),
            token: t.token,
            remote_token: t.remote_token,
            size: t.size,
            start_offset: t.start_offset,
            bytes_transferred: t.bytes_transferred,
            state: t.state.to_string(),
            exception: t.exception.as_ref().map(|e| e.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    StateChanged {
        previous_state: String,
        transfer: TransferSnapshot,
    },
    ProgressUpdated {
        transfer: TransferSnapshot,
    },
}

impl From<&Event> for EventPayload {
    fn from(event: &Event) -> Self {
        match event {
            Event::StateChanged(TransferStateChanged { previous_state, transfer }) => EventPayload::StateChanged {
                previous_state: previous_state.to_string(),
                transfer: transfer.into(),
            },
            Event::ProgressUpdated(TransferProgressUpdated { transfer }) => {
                EventPayload::ProgressUpdated { transfer: transfer.into() }
            }
        }
    }
}

/// Serializes one `Event` to a JSON string, the shape a consumer outside
/// this process (an FFI boundary, a log shipper) would want instead of the
/// live `Event` enum.
pub fn to_json(event: &Event) -> Result<String, serde_json::Error> {
    serde_json::to_string(&EventPayload::from(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Terminator, TransferState};
    use crate::transfer::Direction;

    #[test]
    fn state_changed_event_serializes_with_tagged_type() {
        let transfer = Transfer::new(Direction::Download, "alice", "song.mp3", 7, Some(4), 0);
        let event = Event::StateChanged(TransferStateChanged {
            previous_state: TransferState::None,
            transfer,
        });

        let json = to_json(&event).unwrap();
        assert!(json.contains("\"type\":\"StateChanged\""));
        assert!(json.contains("\"username\":\"alice\""));
        assert!(json.contains("\"state\":\"QueuedLocally\""));
    }

    #[test]
    fn exception_is_projected_as_its_display_string() {
        let mut transfer = Transfer::new(Direction::Download, "alice", "song.mp3", 7, Some(4), 0);
        transfer.state = TransferState::Completed(Terminator::Rejected);
        transfer.exception = Some(crate::error::SoulseekError::TransferRejected("File not shared.".into()));

        let snapshot = TransferSnapshot::from(&transfer);
        assert_eq!(snapshot.exception.as_deref(), Some("Transfer was rejected by the remote peer: File not shared."));
    }
}
