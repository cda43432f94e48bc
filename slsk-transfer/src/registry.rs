//! Process-wide tracking of active transfers by token and by unique key.
//! Generalizes `drop_transfer::manager::TransferManager`'s
//! `HashMap<Uuid, TransferState>` + `Entry` API (spec §4.1 inv. 8-9,
//! §3 inv. 1-2 and 6, design note "two indexes, not one").

use std::collections::{HashMap, HashSet};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use slog::{debug, Logger};
use tokio::sync::Mutex;

use crate::error::{DuplicateTokenError, DuplicateTransferError, SoulseekError};
use crate::transfer::Direction;

#[derive(Default)]
struct Inner {
    by_token: HashMap<u32, String>,
    unique_keys: HashSet<String>,
    next_token: u32,
}

/// Two concurrent indexes: by-token (globally unique across directions)
/// and by-unique-key (semantic duplicate detection). Kept separate so
/// incoming-message dispatch, which only ever has a token, never needs to
/// reconstruct a composite lookup.
#[derive(Default)]
pub struct TransferRegistry {
    inner: Mutex<Inner>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically check-and-insert both indexes (spec §4.2(a) admission,
    /// folding in the §4.1 step 8/9 duplicate checks so check-then-insert
    /// is race free). Both indexes are checked for a collision before
    /// either is touched, so a token collision fails with
    /// `DuplicateTokenError` without ever inserting the unique key.
    pub async fn reserve(
        &self,
        token: u32,
        direction: Direction,
        username: &str,
        filename: &str,
    ) -> Result<(), SoulseekError> {
        let key = crate::transfer::unique_key(direction, username, filename);
        let mut inner = self.inner.lock().await;

        if inner.unique_keys.contains(&key) {
            return Err(SoulseekError::DuplicateTransfer(DuplicateTransferError {
                direction,
                username: username.to_string(),
                filename: filename.to_string(),
            }));
        }

        if inner.by_token.contains_key(&token) {
            return Err(SoulseekError::DuplicateToken(DuplicateTokenError(token)));
        }

        inner.unique_keys.insert(key.clone());
        inner.by_token.insert(token, key);
        Ok(())
    }

    /// Synchronous-looking precheck used by client-side input validation
    /// (spec §4.1 steps 8-9) so argument errors can be raised before any
    /// async admission work starts. Racy precheck only — `reserve` is the
    /// authoritative, atomic gate.
    pub async fn token_in_use(&self, token: u32) -> bool {
        self.inner.lock().await.by_token.contains_key(&token)
    }

    pub async fn unique_key_in_use(&self, direction: Direction, username: &str, filename: &str) -> bool {
        let key = crate::transfer::unique_key(direction, username, filename);
        self.inner.lock().await.unique_keys.contains(&key)
    }

    /// Blocking variant of `token_in_use`, for callers that cannot
    /// `.await` (e.g. the synchronous `state_changed` callback, used by
    /// tests to observe that cleanup ran before the terminal event it
    /// fires from, spec §5's happens-before guarantee). The lock is never
    /// held across an `.await` point anywhere in this type, so the wait
    /// here is always momentary.
    pub fn token_in_use_blocking(&self, token: u32) -> bool {
        futures::executor::block_on(self.inner.lock()).by_token.contains_key(&token)
    }

    /// Next free token starting from a monotonic counter, skipping values
    /// already reserved (spec §4.1 "If token is omitted...").
    pub async fn next_free_token(&self) -> u32 {
        let mut inner = self.inner.lock().await;
        loop {
            let candidate = inner.next_token;
            inner.next_token = inner.next_token.wrapping_add(1);
            if !inner.by_token.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Release both index entries for `token`. Idempotent: releasing a
    /// token that is not present is a no-op, so the guaranteed-cleanup
    /// epilogue (spec §4.2(l)) can call this unconditionally.
    pub async fn release(&self, token: u32) {
        let mut inner = self.inner.lock().await;
        if let Some(key) = inner.by_token.remove(&token) {
            inner.unique_keys.remove(&key);
        }
    }
}

/// Drop-triggered best-effort release, modeled on
/// `drop_transfer::manager::TransferGuard`: defense in depth for task
/// abort/panic unwind, on top of the explicit `release` call every
/// orchestrator epilogue makes on its ordinary exit paths.
pub struct TransferGuard {
    registry: ManuallyDrop<Arc<TransferRegistry>>,
    token: u32,
    logger: Logger,
}

impl TransferGuard {
    pub fn new(registry: Arc<TransferRegistry>, token: u32, logger: Logger) -> Self {
        Self {
            registry: ManuallyDrop::new(registry),
            token,
            logger,
        }
    }

    /// Explicit release on the ordinary exit path. Takes `self` by value
    /// and forgets it so `Drop` never fires a redundant release.
    pub async fn release(mut self) {
        let registry = unsafe { ManuallyDrop::take(&mut self.registry) };
        registry.release(self.token).await;
        std::mem::forget(self);
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        let registry = unsafe { ManuallyDrop::take(&mut self.registry) };
        let token = self.token;
        let logger = self.logger.clone();
        tokio::spawn(async move {
            debug!(logger, "TransferGuard dropped without explicit release, cleaning up token {}", token);
            registry.release(token).await;
        });
    }
}
