//! Download Orchestrator (spec §4.2): completes a single download
//! end-to-end through admission, endpoint/connection negotiation,
//! offset write, governed streaming, and guaranteed cleanup. Grounded on
//! `drop_transfer::ws::client::client_task_v1_v2`'s phase-by-phase state
//! loop (offer -> accept -> stream -> finalize) and
//! `drop_transfer::check`'s incoming-request validation flow.

use std::sync::Arc;
use std::time::Duration;

use slog::{debug, warn, Logger};
use tokio_util::sync::CancellationToken;

use crate::connection::{PeerConnectionManager, ServerConnection};
use crate::dispatch::{DispatchGlue, TransferNotification};
use crate::error::{ConnectionError, SoulseekError};
use crate::governor::TokenBucket;
use crate::options::TransferOptions;
use crate::protocol::{encode_transfer_offset, Endpoint, TransferRequest, TransferResponse};
use crate::registry::{TransferGuard, TransferRegistry};
use crate::sink::{DownloadSink, SinkFactory};
use crate::state::{Terminator, TransferProgressUpdated, TransferState, TransferStateChanged};
use crate::transfer::Transfer;
use crate::waiter::{WaitKey, Waiter};

/// Failure carried out of the negotiation/streaming phases, already
/// classified against the spec §4.2 failure taxonomy.
struct Failure {
    terminator: Terminator,
    error: SoulseekError,
}

impl Failure {
    fn new(terminator: Terminator, error: SoulseekError) -> Self {
        Self { terminator, error }
    }
}

/// The collaborators a download needs; one instance is shared by every
/// download the client runs (spec §5 "global state, process-wide").
pub struct DownloadOrchestrator {
    pub server: Arc<dyn ServerConnection>,
    pub connections: Arc<dyn PeerConnectionManager>,
    pub waiter: Arc<Waiter>,
    pub registry: Arc<TransferRegistry>,
    pub dispatch: Arc<DispatchGlue>,
    pub bucket: Arc<TokenBucket>,
    pub message_timeout: Duration,
    pub buffer_size: usize,
    pub logger: Logger,
}

impl DownloadOrchestrator {
    /// Runs phases (a)-(l) of spec §4.2. `Err` is returned only when
    /// admission itself collides (phase (a)) — no Transfer ever
    /// transitions in that case (spec §7 layer 1). Every other failure is
    /// recorded on `transfer` (state `Completed|<terminator>`, `exception`
    /// set to the root cause) and also surfaced as `Err` to the caller, so
    /// `download()` gets an idiomatic `Result` while event subscribers
    /// still see the full state-change sequence via `options` callbacks.
    pub async fn run(
        &self,
        mut transfer: Transfer,
        sink_factory: Box<dyn SinkFactory>,
        options: TransferOptions,
        cancel: CancellationToken,
    ) -> Result<Transfer, SoulseekError> {
        if let Err(err) = self
            .registry
            .reserve(transfer.token, transfer.direction, &transfer.username, &transfer.filename)
            .await
        {
            return Err(err);
        }

        let guard = TransferGuard::new(self.registry.clone(), transfer.token, self.logger.clone());
        let mut notifications = self
            .dispatch
            .register_notifications(&transfer.username, &transfer.filename)
            .await;

        self.emit_state(&mut transfer, TransferState::QueuedLocally, &options);

        let outcome = self
            .negotiate_and_stream(&mut transfer, sink_factory, &options, &cancel, &mut notifications)
            .await;

        self.dispatch
            .unregister_notifications(&transfer.username, &transfer.filename)
            .await;

        match outcome {
            Ok(sink) => {
                self.finalize(&mut transfer, sink, guard, &options).await;
                Ok(transfer)
            }
            Err(failure) => {
                transfer.exception = Some(failure.error.root_cause().clone());
                guard.release().await;
                self.emit_state(&mut transfer, TransferState::Completed(failure.terminator), &options);
                Err(failure.error)
            }
        }
    }

    /// Drives phases (b) through (j). Returns the opened sink on success
    /// so (k)'s finalization (final position capture, optional dispose)
    /// can still reach it.
    async fn negotiate_and_stream(
        &self,
        transfer: &mut Transfer,
        sink_factory: Box<dyn SinkFactory>,
        options: &TransferOptions,
        cancel: &CancellationToken,
        notifications: &mut tokio::sync::mpsc::UnboundedReceiver<TransferNotification>,
    ) -> Result<Box<dyn DownloadSink>, Failure> {
        // (b) endpoint resolution.
        let endpoint = self.resolve_endpoint(&transfer.username, cancel).await?;

        // (c) peer message connection.
        let message_conn = self
            .connections
            .get_message_connection(&transfer.username, endpoint)
            .await
            .map_err(|e| classify_negotiation_error(e, "Failed to establish peer connection"))?;

        // (d) issue TransferRequest.
        message_conn
            .send_transfer_request(TransferRequest {
                direction: transfer.direction,
                token: transfer.token,
                filename: transfer.filename.clone(),
                size: None,
            })
            .await
            .map_err(|e| classify_negotiation_error(e, "Failed to send transfer request"))?;
        self.emit_state(transfer, TransferState::Requested, options);

        // (e) await TransferResponse.
        let response = self
            .waiter
            .wait::<TransferResponse>(
                WaitKey::TransferResponse {
                    username: transfer.username.clone(),
                    token: transfer.token,
                },
                Some(self.message_timeout),
                cancel,
            )
            .await
            .map_err(|e| classify_negotiation_error(e, "Failed to negotiate transfer"))?;

        if response.is_rejection() {
            let message = response.message.clone().unwrap_or_default();
            return Err(Failure::new(
                Terminator::Rejected,
                SoulseekError::TransferRejected(message),
            ));
        }

        // (f) ready vs queued-by-message.
        let negotiated_size = if response.allowed {
            transfer.remote_token = Some(response.token);
            response.size.ok_or_else(|| {
                Failure::new(
                    Terminator::Errored,
                    SoulseekError::wrap(
                        "Failed to negotiate transfer",
                        SoulseekError::Connection(ConnectionError::TransferFailed(
                            "peer allowed the transfer but supplied no size".into(),
                        )),
                    ),
                )
            })?
        } else {
            let incoming = self
                .wait_with_notifications::<TransferRequest>(
                    WaitKey::TransferRequestIncoming {
                        username: transfer.username.clone(),
                        filename: transfer.filename.clone(),
                    },
                    None,
                    cancel,
                    notifications,
                )
                .await?;

            transfer.remote_token = Some(incoming.token);
            let size = incoming.size.ok_or_else(|| {
                Failure::new(
                    Terminator::Errored,
                    SoulseekError::wrap(
                        "Failed to negotiate transfer",
                        SoulseekError::Connection(ConnectionError::TransferFailed(
                            "peer's incoming request carried no size".into(),
                        )),
                    ),
                )
            })?;

            message_conn
                .send_transfer_response(TransferResponse {
                    token: transfer.token,
                    allowed: true,
                    size: Some(size),
                    message: None,
                })
                .await
                .map_err(|e| classify_negotiation_error(e, "Failed to acknowledge transfer"))?;

            size
        };
        // QueuedRemotely is always visited, even on the ready path.
        self.emit_state(transfer, TransferState::QueuedRemotely, options);

        // (g) size reconciliation.
        match transfer.size {
            Some(local) if local != negotiated_size => {
                return Err(Failure::new(
                    Terminator::Aborted,
                    SoulseekError::TransferSizeMismatch {
                        local,
                        remote: negotiated_size,
                    },
                ));
            }
            Some(_) => {}
            None => transfer.size = Some(negotiated_size),
        }
        let size = transfer.size.expect("size reconciled above");

        // (h) acquire transfer connection, peer-initiated first, outbound fallback.
        let mut socket = match tokio::time::timeout(
            self.message_timeout,
            self.connections
                .accept_transfer(&transfer.username, &transfer.filename, transfer.token, cancel),
        )
        .await
        {
            Ok(Ok(socket)) => socket,
            _ => {
                let endpoint = self.resolve_endpoint(&transfer.username, cancel).await?;
                self.connections
                    .connect_transfer(&transfer.username, endpoint, transfer.token)
                    .await
                    .map_err(|e| classify_negotiation_error(e, "Failed to open transfer connection"))?
            }
        };
        self.emit_state(transfer, TransferState::Initializing, options);

        // (i) offset write.
        socket
            .write_all(&encode_transfer_offset(transfer.start_offset))
            .await
            .map_err(classify_stream_error)?;

        // (j) stream bytes.
        let mut sink = sink_factory.open().await.map_err(|e| {
            Failure::new(Terminator::Errored, SoulseekError::wrap("Failed to open output sink", e))
        })?;

        self.emit_state(transfer, TransferState::InProgress, options);
        self.emit_progress(transfer, options);

        self.stream(transfer, socket.as_mut(), sink.as_mut(), size, options, cancel, notifications)
            .await?;

        Ok(sink)
    }

    async fn stream(
        &self,
        transfer: &mut Transfer,
        socket: &mut dyn crate::connection::TransferSocket,
        sink: &mut dyn DownloadSink,
        size: u64,
        options: &TransferOptions,
        cancel: &CancellationToken,
        notifications: &mut tokio::sync::mpsc::UnboundedReceiver<TransferNotification>,
    ) -> Result<(), Failure> {
        let mut buf = vec![0u8; self.buffer_size];

        while transfer.bytes_transferred < size {
            let remaining = size - transfer.bytes_transferred;
            let attempted = (self.buffer_size as u64).min(remaining);

            let governor_ask = match &options.governor_cb {
                Some(cb) => (cb)(transfer, attempted).await.min(attempted),
                None => attempted,
            };

            let granted = tokio::select! {
                biased;
                notif = notifications.recv() => return Err(notification_failure(notif)),
                g = self.bucket.get(governor_ask, cancel) => g.map_err(|e| Failure::new(Terminator::Cancelled, e))?,
            };

            let n = tokio::select! {
                biased;
                notif = notifications.recv() => return Err(notification_failure(notif)),
                r = socket.read(&mut buf[..granted as usize], cancel) => r.map_err(classify_stream_error)?,
            };

            if n == 0 {
                self.bucket.give_back(granted).await;
                return Err(Failure::new(
                    Terminator::Errored,
                    SoulseekError::wrap(
                        "Failed to download file",
                        SoulseekError::Connection(ConnectionError::TransferFailed(
                            "peer closed the transfer connection early".into(),
                        )),
                    ),
                ));
            }

            sink.write_all(&buf[..n]).await.map_err(io_stream_error)?;
            transfer.bytes_transferred += n as u64;
            self.bucket.give_back(granted - n as u64).await;

            if let Some(reporter) = &options.reporter_cb {
                reporter(attempted, granted, n as u64);
            }
        }

        Ok(())
    }

    /// (k) finalization: final progress snapshot, registry release, then
    /// `Completed|Succeeded`. (l)'s release must happen-before the terminal
    /// state event reaches subscribers (spec §5, P3), so `guard` is
    /// released here, immediately before `emit_state`, rather than after
    /// `run` returns.
    async fn finalize(
        &self,
        transfer: &mut Transfer,
        mut sink: Box<dyn DownloadSink>,
        guard: TransferGuard,
        options: &TransferOptions,
    ) {
        match sink.position().await {
            Ok(pos) => transfer.bytes_transferred = pos,
            Err(e) => warn!(self.logger, "failed to determine final position for {}: {e}", transfer.unique_key()),
        }
        self.emit_progress(transfer, options);
        guard.release().await;
        self.emit_state(transfer, TransferState::Completed(Terminator::Succeeded), options);

        if options.dispose_output_stream_on_completion {
            if let Err(e) = sink.flush_and_close().await {
                warn!(self.logger, "failed to flush/close output sink for {}: {e}", transfer.unique_key());
            }
        }
    }

    async fn resolve_endpoint(&self, username: &str, cancel: &CancellationToken) -> Result<Endpoint, Failure> {
        self.server
            .send_user_address_request(username)
            .await
            .map_err(|e| classify_negotiation_error(e, "Failed to resolve user endpoint"))?;

        self.waiter
            .wait::<Endpoint>(
                WaitKey::UserAddress { username: username.to_string() },
                Some(self.message_timeout),
                cancel,
            )
            .await
            .map_err(|e| classify_negotiation_error(e, "Failed to resolve user endpoint"))
    }

    async fn wait_with_notifications<T: Send + 'static>(
        &self,
        key: WaitKey,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        notifications: &mut tokio::sync::mpsc::UnboundedReceiver<TransferNotification>,
    ) -> Result<T, Failure> {
        tokio::select! {
            biased;
            notif = notifications.recv() => Err(notification_failure(notif)),
            res = self.waiter.wait::<T>(key, timeout, cancel) => {
                res.map_err(|e| classify_negotiation_error(e, "Failed to negotiate transfer"))
            }
        }
    }

    fn emit_state(&self, transfer: &mut Transfer, next: TransferState, options: &TransferOptions) {
        debug_assert!(
            transfer.state.can_transition_to(&next),
            "illegal transition {:?} -> {next:?}",
            transfer.state
        );
        let previous_state = transfer.state;
        transfer.state = next;
        debug!(self.logger, "transfer {} {previous_state} -> {next}", transfer.unique_key());

        let event = TransferStateChanged {
            previous_state,
            transfer: transfer.clone(),
        };
        if let Some(cb) = &options.state_changed_cb {
            cb(&event);
        }
    }

    fn emit_progress(&self, transfer: &Transfer, options: &TransferOptions) {
        let event = TransferProgressUpdated {
            transfer: transfer.clone(),
        };
        if let Some(cb) = &options.progress_updated_cb {
            cb(&event);
        }
    }
}

fn notification_failure(notif: Option<TransferNotification>) -> Failure {
    match notif {
        Some(TransferNotification::DownloadFailed) => Failure::new(
            Terminator::Errored,
            SoulseekError::wrap("Failed to download file", SoulseekError::RemoteDownloadFailed),
        ),
        Some(TransferNotification::DownloadDenied { message }) => {
            Failure::new(Terminator::Rejected, SoulseekError::TransferRejected(message))
        }
        Some(TransferNotification::QueueFailed { message }) => {
            Failure::new(Terminator::Rejected, SoulseekError::TransferRejected(message))
        }
        None => Failure::new(
            Terminator::Errored,
            SoulseekError::Connection(ConnectionError::TransferFailed(
                "notification channel closed unexpectedly".into(),
            )),
        ),
    }
}

/// Classifies a pre-stream negotiation error per spec §7 layer 2: the
/// semantically meaningful kinds pass through unwrapped; everything else
/// is wrapped under `context`.
fn classify_negotiation_error(err: SoulseekError, context: &'static str) -> Failure {
    match &err {
        SoulseekError::UserOffline(_) => Failure::new(Terminator::Errored, err),
        SoulseekError::Cancelled => Failure::new(Terminator::Cancelled, err),
        SoulseekError::Timeout(_) => Failure::new(Terminator::TimedOut, err),
        SoulseekError::TransferRejected(_) => Failure::new(Terminator::Rejected, err),
        _ => Failure::new(Terminator::Errored, SoulseekError::wrap(context, err)),
    }
}

/// Classifies a stream-phase error per spec §7 layer 3 / the §4.2 failure
/// table: always wrapped, terminator depends on the underlying cause.
fn classify_stream_error(err: SoulseekError) -> Failure {
    match err.root_cause() {
        SoulseekError::Cancelled => Failure::new(
            Terminator::Cancelled,
            SoulseekError::wrap("Operation cancelled", SoulseekError::Cancelled),
        ),
        SoulseekError::Timeout(_) => Failure::new(Terminator::TimedOut, err),
        _ => Failure::new(Terminator::Errored, SoulseekError::wrap("Failed to download file", err)),
    }
}

/// `DownloadSink::write_all` speaks `io::Result`, not `SoulseekError`; the
/// sink is local I/O, not peer connection I/O, so it is always classified
/// as an ordinary (non-timeout, non-cancel) stream failure.
fn io_stream_error(err: std::io::Error) -> Failure {
    classify_stream_error(SoulseekError::Connection(ConnectionError::from(err)))
}
