//! Minimal CLI that drives `slsk-transfer` against in-memory, loopback
//! stand-ins for the server connection and peer connection manager,
//! modeled on the teacher's `udrop.rs` (CLI args + an event-driven `Service`
//! loop). This is a smoke-test harness, not a real Soulseek client: real
//! `ServerConnection`/`PeerConnectionManager` implementations talk actual
//! sockets and are out of scope per spec §1 ("treated mostly as an
//! interface").
//!
//! The loopback connections need a handle to the client's internally
//! constructed `DispatchGlue` to simulate inbound server/peer traffic; a
//! real socket-reading task would need the same handle for the same
//! reason, so it is threaded through a `OnceLock` set immediately after
//! `SoulseekClient::new` returns, before any transfer is started.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use clap::{arg, command, value_parser};
use slog::{o, Drain, Logger};
use slog_scope::info;
use tokio_util::sync::CancellationToken;

use slsk_config::ClientConfig;
use slsk_transfer::connection::{MessageConnection, PeerConnectionManager, ServerConnection, TransferSocket};
use slsk_transfer::dispatch::DispatchGlue;
use slsk_transfer::protocol::{Endpoint, PeerMessage, TransferRequest, TransferResponse, UploadFailed};
use slsk_transfer::SoulseekError;

type DispatchCell = Arc<OnceLock<Arc<DispatchGlue>>>;

fn dispatch_of(cell: &DispatchCell) -> &Arc<DispatchGlue> {
    cell.get().expect("dispatch cell populated before any transfer starts")
}

/// Replies to `download()`'s `TransferRequest` with an immediate
/// `allowed=true` response carrying the file's size, the way a cooperative
/// remote peer would.
struct LoopbackMessageConnection {
    dispatch: DispatchCell,
    username: String,
    size: u64,
}

#[async_trait]
impl MessageConnection for LoopbackMessageConnection {
    async fn send_transfer_request(&self, req: TransferRequest) -> Result<(), SoulseekError> {
        dispatch_of(&self.dispatch)
            .dispatch_peer_message(
                &self.username,
                PeerMessage::TransferResponse(TransferResponse {
                    token: req.token,
                    allowed: true,
                    size: Some(self.size),
                    message: None,
                }),
            )
            .await;
        Ok(())
    }

    async fn send_transfer_response(&self, _resp: TransferResponse) -> Result<(), SoulseekError> {
        Ok(())
    }

    async fn send_upload_failed(&self, _msg: UploadFailed) -> Result<(), SoulseekError> {
        Ok(())
    }
}

/// A transfer socket that replays a fixed byte slice then signals a clean
/// peer disconnect (`Ok(0)`), the shape of a real completed transfer.
struct ReplaySocket {
    remaining: Vec<u8>,
}

#[async_trait]
impl TransferSocket for ReplaySocket {
    async fn write_all(&mut self, _buf: &[u8]) -> Result<(), SoulseekError> {
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], _cancel: &CancellationToken) -> Result<usize, SoulseekError> {
        let n = self.remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&self.remaining[..n]);
        self.remaining.drain(..n);
        Ok(n)
    }
}

struct LoopbackServer {
    dispatch: DispatchCell,
}

#[async_trait]
impl ServerConnection for LoopbackServer {
    async fn send_user_address_request(&self, username: &str) -> Result<(), SoulseekError> {
        dispatch_of(&self.dispatch)
            .dispatch_user_address_response(username, Endpoint { ip: Ipv4Addr::LOCALHOST, port: 2234 })
            .await;
        Ok(())
    }
}

struct LoopbackConnections {
    dispatch: DispatchCell,
    payload: Vec<u8>,
}

#[async_trait]
impl PeerConnectionManager for LoopbackConnections {
    async fn get_message_connection(
        &self,
        username: &str,
        _endpoint: Endpoint,
    ) -> Result<Arc<dyn MessageConnection>, SoulseekError> {
        Ok(Arc::new(LoopbackMessageConnection {
            dispatch: self.dispatch.clone(),
            username: username.to_string(),
            size: self.payload.len() as u64,
        }))
    }

    async fn connect_transfer(
        &self,
        _username: &str,
        _endpoint: Endpoint,
        _token: u32,
    ) -> Result<Box<dyn TransferSocket>, SoulseekError> {
        unreachable!("loopback peer always delivers the inbound transfer connection")
    }

    async fn accept_transfer(
        &self,
        _username: &str,
        _filename: &str,
        _token: u32,
        _cancel: &CancellationToken,
    ) -> Result<Box<dyn TransferSocket>, SoulseekError> {
        Ok(Box::new(ReplaySocket { remaining: self.payload.clone() }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let start = Instant::now();
    let logger = Logger::root(
        slog_async::Async::new(
            slog_term::FullFormat::new(slog_term::TermDecorator::new().build())
                .use_custom_timestamp(move |writer: &mut dyn std::io::Write| {
                    let ts = start.elapsed();
                    write!(writer, "{:04}.{:03}", ts.as_secs(), ts.subsec_millis())
                })
                .build()
                .fuse(),
        )
        .build()
        .fuse(),
        o!(),
    );
    let _guard = slog_scope::set_global_logger(logger.clone());

    let matches = command!()
        .arg(arg!(-u --username <NAME> "Remote peer username").required(true))
        .arg(arg!(-f --filename <PATH> "Remote filename to request").required(true))
        .arg(
            arg!(-o --output <PATH> "Local destination path")
                .required(true)
                .value_parser(value_parser!(PathBuf)),
        )
        .get_matches();

    let username = matches.get_one::<String>("username").expect("required").clone();
    let filename = matches.get_one::<String>("filename").expect("required").clone();
    let output = matches.get_one::<PathBuf>("output").expect("required").clone();

    // Stand-in payload; a real deployment learns `size` from the negotiated
    // `TransferResponse`/`TransferRequest`, not a hardcoded buffer.
    let payload = b"hello from the loopback peer".to_vec();

    let dispatch_cell: DispatchCell = Arc::new(OnceLock::new());
    let server: Arc<dyn ServerConnection> = Arc::new(LoopbackServer { dispatch: dispatch_cell.clone() });
    let connections: Arc<dyn PeerConnectionManager> =
        Arc::new(LoopbackConnections { dispatch: dispatch_cell.clone(), payload });

    let client = slsk_transfer::SoulseekClient::new(server, connections, ClientConfig::default(), logger);
    dispatch_cell
        .set(client.dispatch().clone())
        .unwrap_or_else(|_| panic!("dispatch cell set twice"));
    client.set_connected(true);
    client.set_logged_in(true);

    info!("Requesting {filename} from {username}...");
    let transfer = client
        .download(username, filename, output, None, None, None, None, None)
        .await
        .context("download failed")?;

    info!("Download finished: {transfer}");
    Ok(())
}
