//! Wire messages consumed/produced by the transfer core (spec §6).
//! Field order, little-endian integers, length-prefixed strings. Coded
//! as an explicit binary codec over `bytes::{Buf, BufMut}` rather than
//! the teacher's JSON-over-websocket framing (`drop_transfer::protocol`),
//! because spec §6 pins down a literal binary layout; the `bytes` crate
//! itself is carried in from the `cratetorrent` sibling example, which
//! codes a comparable length-prefixed binary wire format.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

use crate::error::{ConnectionError, SoulseekError};
use crate::transfer::Direction;

type CodecResult<T> = Result<T, SoulseekError>;

fn unexpected_end() -> SoulseekError {
    SoulseekError::Connection(ConnectionError::TransferFailed(
        "Unexpected end of message".into(),
    ))
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut Bytes) -> CodecResult<String> {
    if buf.remaining() < 4 {
        return Err(unexpected_end());
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(unexpected_end());
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec())
        .map_err(|_| SoulseekError::Connection(ConnectionError::TransferFailed("Invalid UTF-8 in message".into())))
}

fn put_option_u64(buf: &mut BytesMut, value: Option<u64>) {
    match value {
        Some(v) => {
            buf.put_u8(1);
            buf.put_u64_le(v);
        }
        None => buf.put_u8(0),
    }
}

fn get_option_u64(buf: &mut Bytes) -> CodecResult<Option<u64>> {
    if buf.remaining() < 1 {
        return Err(unexpected_end());
    }
    if buf.get_u8() == 0 {
        return Ok(None);
    }
    if buf.remaining() < 8 {
        return Err(unexpected_end());
    }
    Ok(Some(buf.get_u64_le()))
}

fn put_option_str(buf: &mut BytesMut, value: &Option<String>) {
    match value {
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s);
        }
        None => buf.put_u8(0),
    }
}

fn get_option_str(buf: &mut Bytes) -> CodecResult<Option<String>> {
    if buf.remaining() < 1 {
        return Err(unexpected_end());
    }
    if buf.get_u8() == 0 {
        return Ok(None);
    }
    Ok(Some(get_str(buf)?))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAddressRequest {
    pub username: String,
}

impl UserAddressRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.username);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> CodecResult<Self> {
        Ok(Self {
            username: get_str(&mut buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAddressResponse {
    pub username: String,
    pub endpoint: Endpoint,
}

impl UserAddressResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.username);
        buf.put_slice(&self.endpoint.ip.octets());
        buf.put_u16_le(self.endpoint.port);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> CodecResult<Self> {
        let username = get_str(&mut buf)?;
        if buf.remaining() < 6 {
            return Err(unexpected_end());
        }
        let mut octets = [0u8; 4];
        buf.copy_to_slice(&mut octets);
        let port = buf.get_u16_le();
        Ok(Self {
            username,
            endpoint: Endpoint {
                ip: Ipv4Addr::from(octets),
                port,
            },
        })
    }
}

/// `direction`: 0 = download, 1 = upload (of the *file*, from the
/// requester's point of view), matching spec §6's `direction:u32` field.
fn direction_to_u32(direction: Direction) -> u32 {
    match direction {
        Direction::Download => 0,
        Direction::Upload => 1,
    }
}

fn direction_from_u32(value: u32) -> CodecResult<Direction> {
    match value {
        0 => Ok(Direction::Download),
        1 => Ok(Direction::Upload),
        other => Err(SoulseekError::Connection(ConnectionError::TransferFailed(
            format!("Unknown transfer direction tag {other}"),
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub direction: Direction,
    pub token: u32,
    pub filename: String,
    /// Present on download-direction requests issued by the peer to us;
    /// absent on our request to the peer (spec §6).
    pub size: Option<u64>,
}

impl TransferRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(direction_to_u32(self.direction));
        buf.put_u32_le(self.token);
        put_str(&mut buf, &self.filename);
        put_option_u64(&mut buf, self.size);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> CodecResult<Self> {
        if buf.remaining() < 8 {
            return Err(unexpected_end());
        }
        let direction = direction_from_u32(buf.get_u32_le())?;
        let token = buf.get_u32_le();
        let filename = get_str(&mut buf)?;
        let size = get_option_u64(&mut buf)?;
        Ok(Self {
            direction,
            token,
            filename,
            size,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResponse {
    pub token: u32,
    pub allowed: bool,
    pub size: Option<u64>,
    pub message: Option<String>,
}

impl TransferResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.token);
        buf.put_u8(self.allowed as u8);
        put_option_u64(&mut buf, self.size);
        put_option_str(&mut buf, &self.message);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> CodecResult<Self> {
        if buf.remaining() < 5 {
            return Err(unexpected_end());
        }
        let token = buf.get_u32_le();
        let allowed = buf.get_u8() != 0;
        let size = get_option_u64(&mut buf)?;
        let message = get_option_str(&mut buf)?;
        Ok(Self {
            token,
            allowed,
            size,
            message,
        })
    }

    /// The only explicitly recognized rejection phrase (spec §4.2(e),
    /// open question (a) — other `allowed=false` messages are treated as
    /// queueing rather than guessed at).
    pub fn is_rejection(&self) -> bool {
        !self.allowed
            && self
                .message
                .as_deref()
                .map(|m| m.to_lowercase().contains("file not shared."))
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFailed {
    pub filename: String,
    pub message: String,
}

impl QueueFailed {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.filename);
        put_str(&mut buf, &self.message);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> CodecResult<Self> {
        Ok(Self {
            filename: get_str(&mut buf)?,
            message: get_str(&mut buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFailed {
    pub filename: String,
}

impl UploadFailed {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.filename);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> CodecResult<Self> {
        Ok(Self {
            filename: get_str(&mut buf)?,
        })
    }
}

/// Sent by the remote peer when it gives up on a download it had accepted
/// (spec §4.2 failure table "remote DownloadFailed notification").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadFailed {
    pub filename: String,
}

impl DownloadFailed {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.filename);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> CodecResult<Self> {
        Ok(Self {
            filename: get_str(&mut buf)?,
        })
    }
}

/// Sent by the remote peer to reject a download after having queued it
/// (spec §4.2 failure table "remote DownloadDenied notification").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadDenied {
    pub filename: String,
    pub message: String,
}

impl DownloadDenied {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.filename);
        put_str(&mut buf, &self.message);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> CodecResult<Self> {
        Ok(Self {
            filename: get_str(&mut buf)?,
            message: get_str(&mut buf)?,
        })
    }
}

/// Any inbound message the dispatch-glue layer routes, either into the
/// waiter or to an active transfer's observer hooks (spec §4, Dispatch
/// Glue component).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    TransferRequest(TransferRequest),
    TransferResponse(TransferResponse),
    QueueFailed(QueueFailed),
    UploadFailed(UploadFailed),
    DownloadFailed(DownloadFailed),
    DownloadDenied(DownloadDenied),
}

/// Encode the 8-byte little-endian start-offset prologue written as the
/// first bytes on a transfer connection (spec §4.2(i), §6, §8 P8).
pub fn encode_transfer_offset(offset: u64) -> [u8; 8] {
    offset.to_le_bytes()
}

pub fn decode_transfer_offset(bytes: [u8; 8]) -> u64 {
    u64::from_le_bytes(bytes)
}
