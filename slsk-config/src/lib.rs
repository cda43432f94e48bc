use std::time::Duration;

/// Default TCP port the Soulseek server listens on.
pub const SERVER_PORT: u16 = 2242;

/// Client-wide configuration. Mirrors the shape of the transfer connection
/// and message timeout knobs the protocol exposes; everything here is
/// optional at construction and backed by sane defaults.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Ceiling for a single waiter registration (response waits, connection
    /// waits). `wait_indefinitely` callers bypass this.
    pub message_timeout: Duration,
    /// Inactivity timeout applied to a peer message/transfer connection by
    /// the connection manager.
    pub peer_connection_inactivity_timeout: Duration,
    /// Bytes-per-second cap for the client-wide download token bucket.
    /// `None` means unmetered.
    pub download_token_bucket_rate: Option<u32>,
    /// Bytes-per-second cap for the client-wide upload token bucket.
    pub upload_token_bucket_rate: Option<u32>,
    /// Buffer size used per `read()` call while streaming a transfer.
    pub transfer_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            message_timeout: Duration::from_secs(5),
            peer_connection_inactivity_timeout: Duration::from_secs(15),
            download_token_bucket_rate: None,
            upload_token_bucket_rate: None,
            transfer_buffer_size: 16 * 1024,
        }
    }
}
