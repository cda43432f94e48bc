//! Per-transfer options (spec §6 "Client configuration", §4.2).

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::state::{TransferProgressUpdated, TransferStateChanged};
use crate::transfer::Transfer;

pub type StateChangedCallback = Arc<dyn Fn(&TransferStateChanged) + Send + Sync>;
pub type ProgressUpdatedCallback = Arc<dyn Fn(&TransferProgressUpdated) + Send + Sync>;
/// `(attempted, granted, actual)` reported after every chunk (spec §4.2(j)
/// step 3).
pub type ReporterCallback = Arc<dyn Fn(u64, u64, u64) + Send + Sync>;
/// Optional per-transfer governor: `(transfer, requested) -> granted`,
/// consulted before the client-wide token bucket (spec §4.2(j) step 1).
pub type GovernorCallback = Arc<dyn Fn(&Transfer, u64) -> BoxFuture<'static, u64> + Send + Sync>;

#[derive(Clone, Default)]
pub struct TransferOptions {
    pub dispose_output_stream_on_completion: bool,
    pub state_changed_cb: Option<StateChangedCallback>,
    pub progress_updated_cb: Option<ProgressUpdatedCallback>,
    pub reporter_cb: Option<ReporterCallback>,
    pub governor_cb: Option<GovernorCallback>,
}

impl TransferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispose_output_stream_on_completion(mut self, yes: bool) -> Self {
        self.dispose_output_stream_on_completion = yes;
        self
    }

    pub fn on_state_changed(mut self, cb: StateChangedCallback) -> Self {
        self.state_changed_cb = Some(cb);
        self
    }

    pub fn on_progress_updated(mut self, cb: ProgressUpdatedCallback) -> Self {
        self.progress_updated_cb = Some(cb);
        self
    }

    pub fn with_reporter(mut self, cb: ReporterCallback) -> Self {
        self.reporter_cb = Some(cb);
        self
    }

    pub fn with_governor(mut self, cb: GovernorCallback) -> Self {
        self.governor_cb = Some(cb);
        self
    }
}

impl std::fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOptions")
            .field(
                "dispose_output_stream_on_completion",
                &self.dispose_output_stream_on_completion,
            )
            .field("state_changed_cb", &self.state_changed_cb.is_some())
            .field("progress_updated_cb", &self.progress_updated_cb.is_some())
            .field("reporter_cb", &self.reporter_cb.is_some())
            .field("governor_cb", &self.governor_cb.is_some())
            .finish()
    }
}
