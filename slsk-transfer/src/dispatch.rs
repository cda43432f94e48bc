//! Routes inbound peer/server messages into the waiter and into active
//! transfer observers (spec §4, "Dispatch Glue"). Grounded on
//! `drop_transfer::ws::client::ClientHandler::on_recv`'s match-based
//! router, generalized from a single active transfer per socket to a
//! process-wide table keyed by `(username, filename)`.

use std::collections::HashMap;
use std::sync::Arc;

use slog::{debug, warn, Logger};
use tokio::sync::{mpsc, Mutex};

use crate::protocol::{Endpoint, PeerMessage};
use crate::waiter::{WaitKey, Waiter};

/// An asynchronous notification that can arrive at any point during
/// streaming, outside the request/response rendezvous the waiter models
/// (spec §4.2 failure table: remote `DownloadFailed`/`DownloadDenied`,
/// and `QueueFailed`).
#[derive(Debug, Clone)]
pub enum TransferNotification {
    DownloadFailed,
    DownloadDenied { message: String },
    QueueFailed { message: String },
}

/// Process-wide router. One instance shared by the client, the peer
/// message-connection read loops, and every active orchestrator.
pub struct DispatchGlue {
    waiter: Arc<Waiter>,
    notifications: Mutex<HashMap<(String, String), mpsc::UnboundedSender<TransferNotification>>>,
    logger: Logger,
}

impl DispatchGlue {
    pub fn new(waiter: Arc<Waiter>, logger: Logger) -> Self {
        Self {
            waiter,
            notifications: Mutex::new(HashMap::new()),
            logger,
        }
    }

    /// Subscribe to out-of-band notifications for `(username, filename)`.
    /// An orchestrator selects on the returned receiver alongside its
    /// socket read during streaming (spec §4.2 failure table).
    pub async fn register_notifications(
        &self,
        username: &str,
        filename: &str,
    ) -> mpsc::UnboundedReceiver<TransferNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.notifications
            .lock()
            .await
            .insert((username.to_string(), filename.to_string()), tx);
        rx
    }

    pub async fn unregister_notifications(&self, username: &str, filename: &str) {
        self.notifications
            .lock()
            .await
            .remove(&(username.to_string(), filename.to_string()));
    }

    pub async fn dispatch_user_address_response(&self, username: &str, endpoint: Endpoint) {
        self.waiter
            .complete(&WaitKey::UserAddress { username: username.to_string() }, endpoint)
            .await;
    }

    pub async fn dispatch_user_offline(&self, username: &str) {
        self.waiter
            .throw(
                &WaitKey::UserAddress { username: username.to_string() },
                crate::error::SoulseekError::UserOffline(username.to_string()),
            )
            .await;
    }

    /// Route one inbound peer message, sent by `username`.
    pub async fn dispatch_peer_message(&self, username: &str, msg: PeerMessage) {
        match msg {
            PeerMessage::TransferResponse(resp) => {
                debug!(self.logger, "dispatch TransferResponse from {username}, token {}", resp.token);
                self.waiter
                    .complete(
                        &WaitKey::TransferResponse {
                            username: username.to_string(),
                            token: resp.token,
                        },
                        resp,
                    )
                    .await;
            }
            PeerMessage::TransferRequest(req) => {
                debug!(self.logger, "dispatch TransferRequest from {username} for {}", req.filename);
                self.waiter
                    .complete(
                        &WaitKey::TransferRequestIncoming {
                            username: username.to_string(),
                            filename: req.filename.clone(),
                        },
                        req,
                    )
                    .await;
            }
            PeerMessage::UploadFailed(_) => {
                // `UploadFailed` is only ever sent by us, to the peer, on
                // upload failure (spec §6). We never dispatch one inbound.
                warn!(self.logger, "Unexpected inbound UploadFailed from {username}, ignoring");
            }
            PeerMessage::DownloadFailed(msg) => {
                self.notify(username, &msg.filename, TransferNotification::DownloadFailed)
                    .await;
            }
            PeerMessage::DownloadDenied(msg) => {
                self.notify(
                    username,
                    &msg.filename,
                    TransferNotification::DownloadDenied { message: msg.message },
                )
                .await;
            }
            PeerMessage::QueueFailed(msg) => {
                self.notify(
                    username,
                    &msg.filename,
                    TransferNotification::QueueFailed { message: msg.message },
                )
                .await;
            }
        }
    }

    async fn notify(&self, username: &str, filename: &str, notification: TransferNotification) {
        let key = (username.to_string(), filename.to_string());
        let senders = self.notifications.lock().await;
        match senders.get(&key) {
            Some(tx) => {
                let _ = tx.send(notification);
            }
            None => warn!(self.logger, "No active transfer observer for {username}/{filename}, dropping notification"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TransferResponse;
    use tokio_util::sync::CancellationToken;

    fn test_logger() -> Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn transfer_response_reaches_the_waiter() {
        let waiter = Arc::new(Waiter::new());
        let glue = DispatchGlue::new(waiter.clone(), test_logger());

        let cancel = CancellationToken::new();
        let key = WaitKey::TransferResponse { username: "alice".into(), token: 7 };
        let w2 = waiter.clone();
        let k2 = key.clone();
        let handle = tokio::spawn(async move {
            w2.wait::<TransferResponse>(k2, None, &CancellationToken::new()).await
        });

        tokio::task::yield_now().await;
        glue.dispatch_peer_message(
            "alice",
            PeerMessage::TransferResponse(TransferResponse { token: 7, allowed: true, size: Some(4), message: None }),
        )
        .await;

        let resp = handle.await.unwrap().unwrap();
        assert_eq!(resp.token, 7);
        let _ = cancel;
    }

    #[tokio::test]
    async fn download_failed_reaches_registered_observer() {
        let waiter = Arc::new(Waiter::new());
        let glue = DispatchGlue::new(waiter, test_logger());

        let mut rx = glue.register_notifications("alice", "f").await;
        glue.dispatch_peer_message(
            "alice",
            PeerMessage::DownloadFailed(crate::protocol::DownloadFailed { filename: "f".into() }),
        )
        .await;

        let notification = rx.recv().await.unwrap();
        assert!(matches!(notification, TransferNotification::DownloadFailed));
    }

    #[tokio::test]
    async fn notification_with_no_observer_is_dropped_silently() {
        let waiter = Arc::new(Waiter::new());
        let glue = DispatchGlue::new(waiter, test_logger());
        glue.dispatch_peer_message(
            "alice",
            PeerMessage::DownloadFailed(crate::protocol::DownloadFailed { filename: "nope".into() }),
        )
        .await;
    }
}
