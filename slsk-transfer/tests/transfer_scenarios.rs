//! End-to-end scenarios from spec §8, driven through the public
//! `SoulseekClient` surface against in-memory loopback stand-ins for the
//! server connection and peer connection manager — the same shape as
//! `demos/sdrop.rs`, but scripted per scenario instead of wired to a CLI.
//!
//! Requires the `test-util` feature (enabled automatically for `cargo
//! test` via this crate's self-referencing dev-dependency) for the
//! in-memory sink fixtures.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use slog::Logger;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use slsk_config::ClientConfig;
use slsk_transfer::connection::{MessageConnection, PeerConnectionManager, ServerConnection, TransferSocket};
use slsk_transfer::dispatch::DispatchGlue;
use slsk_transfer::options::TransferOptions;
use slsk_transfer::protocol::{DownloadFailed, Endpoint, PeerMessage, TransferRequest, TransferResponse, UploadFailed};
use slsk_transfer::sink::MemorySinkFactory;
use slsk_transfer::state::{Terminator, TransferState};
use slsk_transfer::{SoulseekClient, SoulseekError};

type DispatchCell = Arc<OnceLock<Arc<DispatchGlue>>>;

fn test_logger() -> Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

/// A scripted reply to our `TransferRequest`: either an immediate `Ready`
/// response, a `Queued` response followed later by the peer's own
/// `TransferRequest`, or an outright rejection (spec §8 scenarios 1, 2, 4).
enum ResponseScript {
    Ready { size: u64 },
    QueuedThenRequest { size: u64, remote_token: u32 },
    Rejected { message: &'static str },
}

struct LoopbackMessageConn {
    dispatch: DispatchCell,
    username: String,
    script: ResponseScript,
    sent_responses: Arc<Mutex<Vec<TransferResponse>>>,
}

#[async_trait]
impl MessageConnection for LoopbackMessageConn {
    async fn send_transfer_request(&self, req: TransferRequest) -> Result<(), SoulseekError> {
        let dispatch = self.dispatch.get().expect("dispatch cell populated before first use").clone();
        let username = self.username.clone();
        match &self.script {
            ResponseScript::Ready { size } => {
                let resp = TransferResponse { token: req.token, allowed: true, size: Some(*size), message: None };
                tokio::spawn(async move {
                    dispatch.dispatch_peer_message(&username, PeerMessage::TransferResponse(resp)).await;
                });
            }
            ResponseScript::Rejected { message } => {
                let resp = TransferResponse {
                    token: req.token,
                    allowed: false,
                    size: None,
                    message: Some(message.to_string()),
                };
                tokio::spawn(async move {
                    dispatch.dispatch_peer_message(&username, PeerMessage::TransferResponse(resp)).await;
                });
            }
            ResponseScript::QueuedThenRequest { size, remote_token } => {
                let size = *size;
                let remote_token = *remote_token;
                let filename = req.filename.clone();
                tokio::spawn(async move {
                    let queued =
                        TransferResponse { token: req.token, allowed: false, size: None, message: Some("Queued".into()) };
                    dispatch.dispatch_peer_message(&username, PeerMessage::TransferResponse(queued)).await;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    let incoming = TransferRequest {
                        direction: req.direction,
                        token: remote_token,
                        filename,
                        size: Some(size),
                    };
                    dispatch.dispatch_peer_message(&username, PeerMessage::TransferRequest(incoming)).await;
                });
            }
        }
        Ok(())
    }

    async fn send_transfer_response(&self, resp: TransferResponse) -> Result<(), SoulseekError> {
        self.sent_responses.lock().await.push(resp);
        Ok(())
    }

    async fn send_upload_failed(&self, _msg: UploadFailed) -> Result<(), SoulseekError> {
        Ok(())
    }
}

/// Replays `remaining`. Once exhausted, blocks forever rather than
/// reporting a clean disconnect — a real socket would just sit there
/// waiting for more bytes, and scenarios that expect an out-of-band
/// notification to win the race (scenario 6) depend on that.
struct ScriptedSocket {
    remaining: StdMutex<VecDeque<u8>>,
}

#[async_trait]
impl TransferSocket for ScriptedSocket {
    async fn write_all(&mut self, _buf: &[u8]) -> Result<(), SoulseekError> {
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], _cancel: &CancellationToken) -> Result<usize, SoulseekError> {
        let is_empty = self.remaining.lock().unwrap().is_empty();
        if is_empty {
            std::future::pending::<()>().await;
            unreachable!()
        }
        let mut remaining = self.remaining.lock().unwrap();
        let n = remaining.len().min(buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = remaining.pop_front().unwrap();
        }
        Ok(n)
    }
}

struct LoopbackServer {
    dispatch: DispatchCell,
}

#[async_trait]
impl ServerConnection for LoopbackServer {
    async fn send_user_address_request(&self, username: &str) -> Result<(), SoulseekError> {
        let dispatch = self.dispatch.get().expect("dispatch cell populated before first use").clone();
        let username = username.to_string();
        tokio::spawn(async move {
            dispatch
                .dispatch_user_address_response(&username, Endpoint { ip: Ipv4Addr::LOCALHOST, port: 2234 })
                .await;
        });
        Ok(())
    }
}

/// Scripts and sockets are queued rather than held singly so a single
/// client can run more than one sequential transfer (needed by the P3
/// cleanup test, which must reuse one client's registry across downloads
/// to prove anything).
struct LoopbackConnections {
    dispatch: DispatchCell,
    scripts: StdMutex<VecDeque<ResponseScript>>,
    sockets: Mutex<VecDeque<Box<dyn TransferSocket>>>,
    sent_responses: Arc<Mutex<Vec<TransferResponse>>>,
}

#[async_trait]
impl PeerConnectionManager for LoopbackConnections {
    async fn get_message_connection(
        &self,
        username: &str,
        _endpoint: Endpoint,
    ) -> Result<Arc<dyn MessageConnection>, SoulseekError> {
        let script = self.scripts.lock().unwrap().pop_front().expect("no more scripted responses queued");
        Ok(Arc::new(LoopbackMessageConn {
            dispatch: self.dispatch.clone(),
            username: username.to_string(),
            script,
            sent_responses: self.sent_responses.clone(),
        }))
    }

    async fn connect_transfer(
        &self,
        _username: &str,
        _endpoint: Endpoint,
        _token: u32,
    ) -> Result<Box<dyn TransferSocket>, SoulseekError> {
        unreachable!("these scenarios always deliver an inbound transfer connection")
    }

    async fn accept_transfer(
        &self,
        _username: &str,
        _filename: &str,
        _token: u32,
        _cancel: &CancellationToken,
    ) -> Result<Box<dyn TransferSocket>, SoulseekError> {
        Ok(self.sockets.lock().await.pop_front().expect("no more sockets queued"))
    }
}

/// Builds a `SoulseekClient` wired to loopback fakes, one `(script, socket)`
/// pair per sequential transfer the test intends to run. The fakes need a
/// handle to the client's own `DispatchGlue` to simulate inbound
/// server/peer traffic; `dispatch_cell` closes that loop the same way
/// `demos/sdrop.rs` does.
fn build_client_with(
    scripted: Vec<(ResponseScript, Box<dyn TransferSocket>)>,
) -> (SoulseekClient, Arc<Mutex<Vec<TransferResponse>>>) {
    let dispatch_cell: DispatchCell = Arc::new(OnceLock::new());
    let sent_responses = Arc::new(Mutex::new(Vec::new()));

    let mut scripts = VecDeque::new();
    let mut sockets = VecDeque::new();
    for (script, socket) in scripted {
        scripts.push_back(script);
        sockets.push_back(socket);
    }

    let server: Arc<dyn ServerConnection> = Arc::new(LoopbackServer { dispatch: dispatch_cell.clone() });
    let connections: Arc<dyn PeerConnectionManager> = Arc::new(LoopbackConnections {
        dispatch: dispatch_cell.clone(),
        scripts: StdMutex::new(scripts),
        sockets: Mutex::new(sockets),
        sent_responses: sent_responses.clone(),
    });

    let client = SoulseekClient::new(server, connections, ClientConfig::default(), test_logger());
    dispatch_cell
        .set(client.dispatch().clone())
        .unwrap_or_else(|_| panic!("dispatch cell set twice"));
    client.set_connected(true);
    client.set_logged_in(true);

    (client, sent_responses)
}

fn build_client(script: ResponseScript, socket: Box<dyn TransferSocket>) -> (SoulseekClient, Arc<Mutex<Vec<TransferResponse>>>) {
    build_client_with(vec![(script, socket)])
}

fn scripted_bytes(bytes: Vec<u8>) -> Box<dyn TransferSocket> {
    Box::new(ScriptedSocket { remaining: StdMutex::new(bytes.into()) })
}

/// Scenario 1 (spec §8): happy ready path.
#[tokio::test]
async fn scenario_happy_ready_path() {
    let (client, _) = build_client(ResponseScript::Ready { size: 4 }, scripted_bytes(vec![0xDE, 0xAD, 0xBE, 0xEF]));

    let buffer = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let sink_factory = Box::new(MemorySinkFactory { buffer: buffer.clone() });

    let transfer = client
        .download_to_sink("u", "f", sink_factory, Some(4), None, Some(7), None, None)
        .await
        .unwrap();

    assert_eq!(transfer.state, TransferState::Completed(Terminator::Succeeded));
    assert_eq!(*buffer.lock().await, vec![0xDE, 0xAD, 0xBE, 0xEF]);
}

/// Scenario 2 (spec §8): queued, then admitted via the peer's own
/// `TransferRequest`; we must acknowledge it with our own token.
#[tokio::test]
async fn scenario_queued_then_admitted() {
    let (client, sent_responses) = build_client(
        ResponseScript::QueuedThenRequest { size: 4, remote_token: 99 },
        scripted_bytes(vec![0xDE, 0xAD, 0xBE, 0xEF]),
    );

    let buffer = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let sink_factory = Box::new(MemorySinkFactory { buffer: buffer.clone() });

    let transfer = client
        .download_to_sink("u", "f", sink_factory, Some(4), None, Some(7), None, None)
        .await
        .unwrap();

    assert_eq!(transfer.state, TransferState::Completed(Terminator::Succeeded));
    assert_eq!(sent_responses.lock().await[0].token, 7);
}

/// Scenario 3 (spec §8): size mismatch aborts before any bytes are written.
#[tokio::test]
async fn scenario_size_mismatch() {
    let (client, _) = build_client(ResponseScript::Ready { size: 5 }, scripted_bytes(vec![]));

    let buffer = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let sink_factory = Box::new(MemorySinkFactory { buffer: buffer.clone() });

    let err = client
        .download_to_sink("u", "f", sink_factory, Some(10), None, Some(7), None, None)
        .await
        .unwrap_err();

    match err {
        SoulseekError::TransferSizeMismatch { local, remote } => {
            assert_eq!(local, 10);
            assert_eq!(remote, 5);
        }
        other => panic!("expected TransferSizeMismatch, got {other:?}"),
    }
    assert!(buffer.lock().await.is_empty());
}

/// Scenario 4 (spec §8): "File not shared." rejection.
#[tokio::test]
async fn scenario_rejected_file_not_shared() {
    let (client, _) = build_client(ResponseScript::Rejected { message: "File not shared." }, scripted_bytes(vec![]));

    let buffer = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let sink_factory = Box::new(MemorySinkFactory { buffer });

    let err = client
        .download_to_sink("u", "f", sink_factory, Some(4), None, Some(7), None, None)
        .await
        .unwrap_err();

    assert!(matches!(err, SoulseekError::TransferRejected(_)));
}

/// Scenario 6 (spec §8): a remote `DownloadFailed` notification during
/// streaming errors the transfer with the documented wrapped exception.
#[tokio::test]
async fn scenario_remote_download_failed() {
    let (client, _) = build_client(ResponseScript::Ready { size: 4 }, scripted_bytes(vec![]));

    let dispatch = client.dispatch().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatch
            .dispatch_peer_message("u", PeerMessage::DownloadFailed(DownloadFailed { filename: "f".into() }))
            .await;
    });

    let buffer = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let sink_factory = Box::new(MemorySinkFactory { buffer });

    let err = client
        .download_to_sink("u", "f", sink_factory, Some(4), None, Some(7), None, None)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("Failed to download file"));
    assert!(matches!(err.root_cause(), SoulseekError::RemoteDownloadFailed));
}

/// Spec §8 P5: state and progress events fire in order on the success path
/// (six state changes ending in the terminal one, plus an initial and a
/// final progress report).
#[tokio::test]
async fn p5_event_ordering_on_success_path() {
    let (client, _) = build_client(ResponseScript::Ready { size: 4 }, scripted_bytes(vec![0xAA, 0xBB, 0xCC, 0xDD]));

    let states: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
    let progress: Arc<StdMutex<Vec<u64>>> = Arc::new(StdMutex::new(Vec::new()));
    let s2 = states.clone();
    let p2 = progress.clone();

    let options = TransferOptions::new()
        .on_state_changed(Arc::new(move |event| {
            s2.lock().unwrap().push(event.transfer.state.to_string());
        }))
        .on_progress_updated(Arc::new(move |event| {
            p2.lock().unwrap().push(event.transfer.bytes_transferred);
        }));

    let buffer = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let sink_factory = Box::new(MemorySinkFactory { buffer });

    client
        .download_to_sink("u", "f", sink_factory, Some(4), None, Some(7), Some(options), None)
        .await
        .unwrap();

    assert_eq!(
        *states.lock().unwrap(),
        vec!["QueuedLocally", "Requested", "QueuedRemotely", "Initializing", "InProgress", "Completed|Succeeded"]
    );
    assert_eq!(*progress.lock().unwrap(), vec![0, 4]);
}

/// Spec §8 P3 / §5: cleanup (registry release) happens-before the final
/// `Completed|*` state event reaches subscribers. Asserted from *inside*
/// the `state_changed` callback itself — the only place that can observe
/// the ordering directly, since by the time `download_to_sink` returns the
/// release has necessarily already happened regardless of ordering.
#[tokio::test]
async fn p3_cleanup_frees_token_before_the_terminal_state_event_fires() {
    let (client, _) = build_client_with(vec![
        (ResponseScript::Ready { size: 4 }, scripted_bytes(vec![1, 2, 3, 4])),
        (ResponseScript::Ready { size: 4 }, scripted_bytes(vec![5, 6, 7, 8])),
    ]);

    let still_in_use_on_completion = Arc::new(StdMutex::new(None));
    let probe = still_in_use_on_completion.clone();
    let registry = client.registry().clone();
    let options = TransferOptions::new().on_state_changed(Arc::new(move |event| {
        if event.transfer.state.is_completed() {
            *probe.lock().unwrap() = Some(registry.token_in_use_blocking(event.transfer.token));
        }
    }));

    let buffer = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let sink_factory = Box::new(MemorySinkFactory { buffer });
    client
        .download_to_sink("u", "f", sink_factory, Some(4), None, Some(7), Some(options), None)
        .await
        .unwrap();

    assert_eq!(
        *still_in_use_on_completion.lock().unwrap(),
        Some(false),
        "token 7 must already be released by the time the Completed event fires"
    );

    // Reusing the same token/unique-key immediately afterwards still works,
    // confirming the callback's observation wasn't a fluke of this probe.
    let buffer2 = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let sink_factory2 = Box::new(MemorySinkFactory { buffer: buffer2.clone() });
    client
        .download_to_sink("u", "f", sink_factory2, Some(4), None, Some(7), None, None)
        .await
        .unwrap();
}

/// Spec §8 P9: for a 42-byte transfer with a per-transfer governor
/// returning 21 and a buffer size larger than the transfer, the chunk loop
/// asks the governor for `min(buffer_size, size) = 42` and the governor
/// caps that at 21, which is what ultimately reaches the reporter and (via
/// an unmetered shared bucket) gets granted in full.
#[tokio::test]
async fn p9_per_transfer_governor_caps_the_shared_bucket_request() {
    let (client, _) = build_client(ResponseScript::Ready { size: 42 }, scripted_bytes(vec![7u8; 42]));

    let reports: Arc<StdMutex<Vec<(u64, u64, u64)>>> = Arc::new(StdMutex::new(Vec::new()));
    let r2 = reports.clone();
    let calls = Arc::new(AtomicUsize::new(0));
    let c2 = calls.clone();

    let options = TransferOptions::new()
        .with_reporter(Arc::new(move |attempted, granted, actual| {
            r2.lock().unwrap().push((attempted, granted, actual));
        }))
        .with_governor(Arc::new(move |_transfer, requested| {
            c2.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { requested.min(21) })
        }));

    let buffer = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let sink_factory = Box::new(MemorySinkFactory { buffer: buffer.clone() });

    client
        .download_to_sink("u", "f", sink_factory, Some(42), None, Some(7), Some(options), None)
        .await
        .unwrap();

    assert!(calls.load(Ordering::SeqCst) >= 1);
    let reports = reports.lock().unwrap();
    assert_eq!(reports[0], (42, 21, 21));
    assert_eq!(buffer.lock().await.len(), 42);
}
