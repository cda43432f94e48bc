use std::fmt;

use crate::error::SoulseekError;
use crate::state::TransferState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    Download,
    Upload,
}

/// Derived identity used for duplicate-transfer detection (spec §3).
/// `"{direction}:{username}:{filename}"`.
pub fn unique_key(direction: Direction, username: &str, filename: &str) -> String {
    format!("{direction}:{username}:{filename}")
}

/// One negotiated file exchange. Cloned into event snapshots; the live,
/// mutable instance is owned exclusively by its orchestrator task while
/// active (spec §5 ownership model).
#[derive(Debug, Clone)]
pub struct Transfer {
    pub direction: Direction,
    pub username: String,
    pub filename: String,
    pub token: u32,
    pub remote_token: Option<u32>,
    pub size: Option<u64>,
    pub start_offset: u64,
    pub bytes_transferred: u64,
    pub state: TransferState,
    pub exception: Option<SoulseekError>,
}

impl Transfer {
    pub fn new(
        direction: Direction,
        username: impl Into<String>,
        filename: impl Into<String>,
        token: u32,
        size: Option<u64>,
        start_offset: u64,
    ) -> Self {
        Self {
            direction,
            username: username.into(),
            filename: filename.into(),
            token,
            remote_token: None,
            size,
            start_offset,
            bytes_transferred: 0,
            state: TransferState::None,
            exception: None,
        }
    }

    pub fn unique_key(&self) -> String {
        unique_key(self.direction, &self.username, &self.filename)
    }
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transfer({} {} {:?} token={} state={})",
            self.direction, self.username, self.filename, self.token, self.state
        )
    }
}
