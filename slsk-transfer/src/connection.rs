//! Peer Connection Manager surface (spec §4, "treated mostly as an
//! interface; the transfer core exercises only its surface"). Grounded
//! on the connection-acquisition shape of `drop_transfer::ws::client`
//! (cache-or-dial a message connection) and `ws::server` (accept an
//! inbound, peer-initiated connection), reduced to the trait boundary
//! the orchestrators actually call.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::SoulseekError;
use crate::protocol::{Endpoint, TransferRequest, TransferResponse, UploadFailed};

/// The persistent connection to the central server. Out of scope per
/// spec §1 ("the TCP connection implementations themselves"); only the
/// one request this core issues is modeled.
#[async_trait]
pub trait ServerConnection: Send + Sync {
    async fn send_user_address_request(&self, username: &str) -> Result<(), SoulseekError>;
}

/// A peer-to-peer channel carrying framed control messages (spec
/// GLOSSARY "Message connection"). Cached per peer by the connection
/// manager; the orchestrators never close it themselves (spec §5
/// resource discipline).
#[async_trait]
pub trait MessageConnection: Send + Sync {
    async fn send_transfer_request(&self, req: TransferRequest) -> Result<(), SoulseekError>;
    async fn send_transfer_response(&self, resp: TransferResponse) -> Result<(), SoulseekError>;
    async fn send_upload_failed(&self, msg: UploadFailed) -> Result<(), SoulseekError>;
}

/// A peer-to-peer channel carrying raw file bytes plus the 8-byte offset
/// prologue (spec GLOSSARY "Transfer connection"). Owned exclusively by
/// the orchestrator for the duration of streaming.
#[async_trait]
pub trait TransferSocket: Send + Sync {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), SoulseekError>;

    /// Reads up to `buf.len()` bytes. Returns `Ok(0)` on a clean peer
    /// disconnect once the expected size has been reached (spec §4.2(j)).
    /// Observes `cancel` so a pending read can be cancelled mid-flight
    /// (spec §5, §8 P7).
    async fn read(&mut self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize, SoulseekError>;
}

/// Obtains or creates message and transfer connections to a named peer
/// at a resolved endpoint; multiplexes inbound solicited/unsolicited
/// connections (spec §4, Peer Connection Manager).
#[async_trait]
pub trait PeerConnectionManager: Send + Sync {
    /// Cached per `(username, endpoint)` (spec §4.2(c), design note
    /// "two physical pools").
    async fn get_message_connection(
        &self,
        username: &str,
        endpoint: Endpoint,
    ) -> Result<Arc<dyn MessageConnection>, SoulseekError>;

    /// Dial the peer and open a new, ephemeral transfer connection (spec
    /// §4.2(h) outbound fallback).
    async fn connect_transfer(
        &self,
        username: &str,
        endpoint: Endpoint,
        token: u32,
    ) -> Result<Box<dyn TransferSocket>, SoulseekError>;

    /// Wait for the peer to initiate a transfer connection that
    /// correlates to `(username, filename, token)` (spec §4.2(h)).
    async fn accept_transfer(
        &self,
        username: &str,
        filename: &str,
        token: u32,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn TransferSocket>, SoulseekError>;
}
