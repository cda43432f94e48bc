use std::fmt;

/// Terminal outcome recorded alongside `TransferState::Completed`. Spec
/// §4.6 models the completion disjunction as a tagged enum variant rather
/// than eight separate leaf states, per the corpus's "design notes".
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Terminator {
    Succeeded,
    Cancelled,
    TimedOut,
    Errored,
    Rejected,
    Aborted,
}

/// Composite (stage | terminator) transfer state, spec §3 / §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    None,
    QueuedLocally,
    Requested,
    QueuedRemotely,
    Initializing,
    InProgress,
    Completed(Terminator),
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferState::None => write!(f, "None"),
            TransferState::QueuedLocally => write!(f, "QueuedLocally"),
            TransferState::Requested => write!(f, "Requested"),
            TransferState::QueuedRemotely => write!(f, "QueuedRemotely"),
            TransferState::Initializing => write!(f, "Initializing"),
            TransferState::InProgress => write!(f, "InProgress"),
            TransferState::Completed(t) => write!(f, "Completed|{t}"),
        }
    }
}

impl TransferState {
    pub fn is_completed(&self) -> bool {
        matches!(self, TransferState::Completed(_))
    }

    /// The legal transition graph of spec §4.6: the forward chain
    /// None -> QueuedLocally -> Requested -> QueuedRemotely ->
    /// Initializing -> InProgress -> Completed, plus a transition into
    /// Completed from any non-completed state.
    pub fn can_transition_to(&self, next: &TransferState) -> bool {
        use TransferState::*;

        if next.is_completed() {
            return !self.is_completed();
        }

        matches!(
            (self, next),
            (None, QueuedLocally)
                | (QueuedLocally, Requested)
                | (Requested, QueuedRemotely)
                | (QueuedRemotely, Initializing)
                | (Initializing, InProgress)
        )
    }
}

/// Emitted whenever a `Transfer`'s state advances. Carries an immutable
/// snapshot, mirroring `drop_transfer::Event` variants carrying a cloned
/// `Transfer` rather than a live reference.
#[derive(Debug, Clone)]
pub struct TransferStateChanged {
    pub previous_state: TransferState,
    pub transfer: crate::transfer::Transfer,
}

/// Emitted while a transfer is `InProgress`; `bytes_transferred` is
/// monotonic non-decreasing per transfer (spec §5 ordering guarantees).
#[derive(Debug, Clone)]
pub struct TransferProgressUpdated {
    pub transfer: crate::transfer::Transfer,
}

#[derive(Debug, Clone)]
pub enum Event {
    StateChanged(TransferStateChanged),
    ProgressUpdated(TransferProgressUpdated),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_graph_is_legal() {
        use TransferState::*;
        let chain = [
            None,
            QueuedLocally,
            Requested,
            QueuedRemotely,
            Initializing,
            InProgress,
            Completed(Terminator::Succeeded),
        ];
        for pair in chain.windows(2) {
            assert!(
                pair[0].can_transition_to(&pair[1]),
                "{:?} -> {:?} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn completed_is_reachable_from_any_non_completed_state() {
        use TransferState::*;
        for state in [None, QueuedLocally, Requested, QueuedRemotely, Initializing, InProgress] {
            assert!(state.can_transition_to(&Completed(Terminator::Aborted)));
        }
    }

    #[test]
    fn no_back_transitions_and_no_skips() {
        use TransferState::*;
        assert!(!Requested.can_transition_to(&QueuedLocally));
        assert!(!QueuedLocally.can_transition_to(&Initializing));
    }

    #[test]
    fn completed_has_no_outgoing_transitions() {
        let completed = TransferState::Completed(Terminator::Succeeded);
        assert!(!completed.can_transition_to(&TransferState::InProgress));
        assert!(!completed.can_transition_to(&TransferState::Completed(Terminator::Errored)));
    }
}
