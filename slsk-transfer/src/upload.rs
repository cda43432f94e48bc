//! Upload Orchestrator (spec §4.3): mirrors the download orchestrator's
//! phase structure but from the uploader's side of the wire — we answer
//! an inbound `TransferRequest` with a `TransferResponse`, stream bytes
//! outward under the governor, and notify the peer with `UploadFailed`
//! on any failure. Grounded on `drop_transfer::ws::client::start_upload`
//! for the symmetric "reply, then stream" shape.

use std::sync::Arc;
use std::time::Duration;

use slog::{debug, Logger};
use tokio_util::sync::CancellationToken;

use crate::connection::{MessageConnection, PeerConnectionManager};
use crate::error::{ConnectionError, SoulseekError};
use crate::governor::TokenBucket;
use crate::options::TransferOptions;
use crate::protocol::{decode_transfer_offset, TransferRequest, TransferResponse, UploadFailed};
use crate::registry::{TransferGuard, TransferRegistry};
use crate::sink::{SourceFactory, UploadSource};
use crate::state::{Terminator, TransferProgressUpdated, TransferState, TransferStateChanged};
use crate::transfer::{Direction, Transfer};

struct Failure {
    terminator: Terminator,
    error: SoulseekError,
}

impl Failure {
    fn new(terminator: Terminator, error: SoulseekError) -> Self {
        Self { terminator, error }
    }
}

pub struct UploadOrchestrator {
    pub connections: Arc<dyn PeerConnectionManager>,
    pub registry: Arc<TransferRegistry>,
    pub bucket: Arc<TokenBucket>,
    pub message_timeout: Duration,
    pub buffer_size: usize,
    pub logger: Logger,
}

impl UploadOrchestrator {
    /// Handles one inbound request to upload `incoming.filename` to
    /// `username`, received on `message_conn`. Same `Err`-only-on-admission
    /// contract as `DownloadOrchestrator::run` (spec §7 layer 1).
    pub async fn run(
        &self,
        username: String,
        incoming: TransferRequest,
        message_conn: Arc<dyn MessageConnection>,
        source_factory: Box<dyn SourceFactory>,
        options: TransferOptions,
        cancel: CancellationToken,
    ) -> Result<Transfer, SoulseekError> {
        let token = self.registry.next_free_token().await;
        let mut transfer = Transfer::new(Direction::Upload, username, incoming.filename.clone(), token, None, 0);
        transfer.remote_token = Some(incoming.token);

        if let Err(err) = self
            .registry
            .reserve(token, Direction::Upload, &transfer.username, &transfer.filename)
            .await
        {
            return Err(err);
        }

        let guard = TransferGuard::new(self.registry.clone(), token, self.logger.clone());
        self.emit_state(&mut transfer, TransferState::QueuedLocally, &options);

        let outcome = self
            .negotiate_and_stream(&mut transfer, &incoming, &message_conn, source_factory, &options, &cancel)
            .await;

        match outcome {
            Ok(()) => {
                self.emit_progress(&transfer, &options);
                guard.release().await;
                self.emit_state(&mut transfer, TransferState::Completed(Terminator::Succeeded), &options);
                Ok(transfer)
            }
            Err(failure) => {
                let _ = message_conn
                    .send_upload_failed(UploadFailed { filename: transfer.filename.clone() })
                    .await;
                transfer.exception = Some(failure.error.root_cause().clone());
                guard.release().await;
                self.emit_state(&mut transfer, TransferState::Completed(failure.terminator), &options);
                Err(failure.error)
            }
        }
    }

    async fn negotiate_and_stream(
        &self,
        transfer: &mut Transfer,
        incoming: &TransferRequest,
        message_conn: &Arc<dyn MessageConnection>,
        source_factory: Box<dyn SourceFactory>,
        options: &TransferOptions,
        cancel: &CancellationToken,
    ) -> Result<(), Failure> {
        self.emit_state(transfer, TransferState::Requested, options);

        let (mut source, size) = source_factory.open().await.map_err(|e| {
            Failure::new(Terminator::Errored, SoulseekError::wrap("Failed to open upload source", e))
        })?;
        transfer.size = Some(size);

        message_conn
            .send_transfer_response(TransferResponse {
                token: incoming.token,
                allowed: true,
                size: Some(size),
                message: None,
            })
            .await
            .map_err(|e| wrap_negotiation(e, "Failed to acknowledge transfer"))?;
        self.emit_state(transfer, TransferState::QueuedRemotely, options);

        let mut socket = match tokio::time::timeout(
            self.message_timeout,
            self.connections
                .accept_transfer(&transfer.username, &transfer.filename, transfer.token, cancel),
        )
        .await
        {
            Ok(Ok(socket)) => socket,
            _ => {
                return Err(Failure::new(
                    Terminator::TimedOut,
                    SoulseekError::Timeout("transfer connection".into()),
                ))
            }
        };
        self.emit_state(transfer, TransferState::Initializing, options);

        let mut offset_buf = [0u8; 8];
        let mut read_so_far = 0usize;
        while read_so_far < 8 {
            let n = socket
                .read(&mut offset_buf[read_so_far..], cancel)
                .await
                .map_err(|e| classify_stream_error(e))?;
            if n == 0 {
                return Err(Failure::new(
                    Terminator::Errored,
                    SoulseekError::wrap(
                        "Failed to upload file",
                        SoulseekError::Connection(ConnectionError::TransferFailed(
                            "peer disconnected before sending the start offset".into(),
                        )),
                    ),
                ));
            }
            read_so_far += n;
        }
        transfer.start_offset = decode_transfer_offset(offset_buf);

        self.emit_state(transfer, TransferState::InProgress, options);
        self.emit_progress(transfer, options);

        self.stream(transfer, socket.as_mut(), source.as_mut(), size, options, cancel).await
    }

    async fn stream(
        &self,
        transfer: &mut Transfer,
        socket: &mut dyn crate::connection::TransferSocket,
        source: &mut dyn UploadSource,
        size: u64,
        options: &TransferOptions,
        cancel: &CancellationToken,
    ) -> Result<(), Failure> {
        let mut buf = vec![0u8; self.buffer_size];

        while transfer.bytes_transferred < size {
            let remaining = size - transfer.bytes_transferred;
            let attempted = (self.buffer_size as u64).min(remaining);

            let governor_ask = match &options.governor_cb {
                Some(cb) => (cb)(transfer, attempted).await.min(attempted),
                None => attempted,
            };
            let granted = self
                .bucket
                .get(governor_ask, cancel)
                .await
                .map_err(|e| Failure::new(Terminator::Cancelled, e))?;

            let n = source
                .read(&mut buf[..granted as usize])
                .await
                .map_err(io_stream_error)?;

            if n == 0 {
                self.bucket.give_back(granted).await;
                return Err(Failure::new(
                    Terminator::Errored,
                    SoulseekError::wrap(
                        "Failed to upload file",
                        SoulseekError::Connection(ConnectionError::TransferFailed(
                            "upload source ended before reaching the negotiated size".into(),
                        )),
                    ),
                ));
            }

            socket
                .write_all(&buf[..n])
                .await
                .map_err(|e| classify_stream_error(e))?;
            transfer.bytes_transferred += n as u64;
            self.bucket.give_back(granted - n as u64).await;

            if let Some(reporter) = &options.reporter_cb {
                reporter(attempted, granted, n as u64);
            }
        }

        Ok(())
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

fn wrap_negotiation(err: SoulseekError, context: &'static str) -> Failure {
    match &err {
        SoulseekError::Cancelled => Failure::new(Terminator::Cancelled, err),
        SoulseekError::Timeout(_) => Failure::new(Terminator::TimedOut, err),
        _ => Failure::new(Terminator::Errored, SoulseekError::wrap(context, err)),
    }
}

/// Classifies a stream-phase error per spec §7 layer 3 / the §4.2 failure
/// table, mirrored for the uploader's side (spec §4.3).
fn classify_stream_error(err: SoulseekError) -> Failure {
    match err.root_cause() {
        SoulseekError::Cancelled => Failure::new(
            Terminator::Cancelled,
            SoulseekError::wrap("Operation cancelled", SoulseekError::Cancelled),
        ),
        SoulseekError::Timeout(_) => Failure::new(Terminator::TimedOut, err),
        _ => Failure::new(Terminator::Errored, SoulseekError::wrap("Failed to upload file", err)),
    }
}

fn io_stream_error(err: std::io::Error) -> Failure {
    classify_stream_error(SoulseekError::Connection(ConnectionError::from(err)))
}
