//! Keyed rendezvous between outgoing requests and inbound protocol
//! messages. Generalizes `drop_transfer::tasks::AliveWaiter`'s single
//! shutdown rendezvous into a concurrent map of one-shot completions
//! keyed by `WaitKey`, as spec §4.4 requires.

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::SoulseekError;

/// Composite key identifying a pending rendezvous. The core only ever
/// needs these four shapes (spec §3 "WaitKey").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WaitKey {
    UserAddress { username: String },
    TransferResponse { username: String, token: u32 },
    TransferRequestIncoming { username: String, filename: String },
    TransferConnection {
        username: String,
        filename: String,
        token: u32,
    },
}

impl fmt::Display for WaitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitKey::UserAddress { username } => write!(f, "UserAddress({username})"),
            WaitKey::TransferResponse { username, token } => {
                write!(f, "TransferResponse({username}, {token})")
            }
            WaitKey::TransferRequestIncoming { username, filename } => {
                write!(f, "TransferRequest({username}, {filename})")
            }
            WaitKey::TransferConnection {
                username,
                filename,
                token,
            } => write!(f, "TransferConnection({username}, {filename}, {token})"),
        }
    }
}

type Outcome = Result<Box<dyn Any + Send>, SoulseekError>;

/// A concurrent map from `WaitKey` to a single outstanding rendezvous.
/// Safe for concurrent mutation as spec §5 requires of all shared maps.
#[derive(Default)]
pub struct Waiter {
    pending: Mutex<HashMap<WaitKey, oneshot::Sender<Outcome>>>,
}

impl Waiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a one-shot wait, bounded by `timeout` and the supplied
    /// cancellation token. Removes the registration on every exit path.
    pub async fn wait<T: Send + 'static>(
        &self,
        key: WaitKey,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<T, SoulseekError> {
        let rx = self.register(key.clone()).await;

        let outcome = match timeout {
            Some(timeout) => {
                tokio::select! {
                    res = rx => res,
                    _ = tokio::time::sleep(timeout) => {
                        self.remove(&key).await;
                        Ok(Err(SoulseekError::Timeout(key.to_string())))
                    }
                    _ = cancel.cancelled() => {
                        self.remove(&key).await;
                        Ok(Err(SoulseekError::Cancelled))
                    }
                }
            }
            None => {
                tokio::select! {
                    res = rx => res,
                    _ = cancel.cancelled() => {
                        self.remove(&key).await;
                        Ok(Err(SoulseekError::Cancelled))
                    }
                }
            }
        };

        let outcome = outcome.unwrap_or(Err(SoulseekError::Cancelled));

        match outcome {
            Ok(boxed) => boxed
                .downcast::<T>()
                .map(|b| *b)
                .map_err(|_| SoulseekError::wrap("waiter type mismatch", SoulseekError::Cancelled)),
            Err(err) => Err(err),
        }
    }

    /// Identical to `wait` without a timeout (spec §4.4
    /// `wait_indefinitely`).
    pub async fn wait_indefinitely<T: Send + 'static>(
        &self,
        key: WaitKey,
        cancel: &CancellationToken,
    ) -> Result<T, SoulseekError> {
        self.wait(key, None, cancel).await
    }

    async fn register(&self, key: WaitKey) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().await;
        match pending.entry(key.clone()) {
            Entry::Occupied(_) => {
                panic!("a waiter is already registered for key {key}")
            }
            Entry::Vacant(v) => {
                v.insert(tx);
            }
        }
        rx
    }

    async fn remove(&self, key: &WaitKey) {
        self.pending.lock().await.remove(key);
    }

    /// Deliver `value` to exactly one waiter. Spurious completions (no
    /// waiter registered) are dropped silently.
    pub async fn complete<T: Send + 'static>(&self, key: &WaitKey, value: T) {
        if let Some(tx) = self.pending.lock().await.remove(key) {
            let _ = tx.send(Ok(Box::new(value)));
        }
    }

    /// Fail the waiter registered under `key` with `exception`. Dropped
    /// silently if no one is waiting.
    pub async fn throw(&self, key: &WaitKey, exception: SoulseekError) {
        if let Some(tx) = self.pending.lock().await.remove(key) {
            let _ = tx.send(Err(exception));
        }
    }
}
