//! Inbound platform connections.
//!
//! Every accepted TCP connection is upgraded to TLS and then classified by
//! its first frame:
//!
//! - `AdminCommand`: executed by the control loop; the verdict goes back as a
//!   single `Response` and the connection is closed.
//! - `LinkRequest`: the connection becomes the requester side of a
//!   negotiation session and stays open until the session ends.
//! - anything else, a bad frame, or silence past the handshake timeout:
//!   `Response{ok: false}` and close.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fog_core::protocol::{FogMessage, Response};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::framed::{write_message, FrameReader};
use super::session::{run_session, SessionContext};
use crate::application::control_loop::ControlHandle;
use crate::application::negotiation::Outcome;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct AcceptorContext {
    pub control: ControlHandle,
    pub session: SessionContext,
    /// Bounds both the TLS handshake and the wait for the first frame.
    pub handshake_timeout: Duration,
}

/// How a connection was used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionKind {
    Admin { ok: bool },
    Negotiation(Outcome),
    /// The first frame was missing, invalid, or not allowed to open a
    /// connection.
    Rejected,
    /// The peer closed without sending anything.
    Closed,
}

/// Accepts connections until `shutdown` fires, then waits for the in-flight
/// ones (sessions observe the same token and wind down).
pub async fn run_acceptor(
    listener: TcpListener,
    tls: TlsAcceptor,
    ctx: Arc<AcceptorContext>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!("accepting platform connections on {}", listener.local_addr()?);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((tcp, peer)) => {
                    debug!("connection from {peer}");
                    connections.spawn(handle_connection(tcp, peer, tls.clone(), Arc::clone(&ctx)));
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    info!("acceptor stopping, {} connection(s) in flight", connections.len());
    while connections.join_next().await.is_some() {}
    Ok(())
}

async fn handle_connection(tcp: TcpStream, peer: SocketAddr, tls: TlsAcceptor, ctx: Arc<AcceptorContext>) {
    if let Err(e) = tcp.set_nodelay(true) {
        debug!("set_nodelay for {peer}: {e}");
    }
    let stream = match timeout(ctx.handshake_timeout, tls.accept(tcp)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("TLS handshake with {peer} failed: {e}");
            return;
        }
        Err(_) => {
            warn!("TLS handshake with {peer} timed out");
            return;
        }
    };

    match serve_connection(stream, peer, &ctx).await {
        Ok(kind) => debug!("connection from {peer} finished: {kind:?}"),
        Err(e) => warn!("connection from {peer} failed: {e:#}"),
    }
}

/// Classifies and serves one authenticated connection.
pub async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    ctx: &AcceptorContext,
) -> anyhow::Result<ConnectionKind>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half);

    let first = match timeout(ctx.handshake_timeout, reader.next_message()).await {
        Ok(Ok(Some(msg))) => msg,
        Ok(Ok(None)) => return Ok(ConnectionKind::Closed),
        Ok(Err(e)) => {
            warn!("bad first frame from {peer}: {e}");
            reply_and_close(&mut write_half, false).await?;
            return Ok(ConnectionKind::Rejected);
        }
        Err(_) => {
            warn!("{peer} sent nothing within {:?}", ctx.handshake_timeout);
            reply_and_close(&mut write_half, false).await?;
            return Ok(ConnectionKind::Rejected);
        }
    };

    match first {
        FogMessage::AdminCommand(command) => {
            info!(
                "admin command from {peer}: {} {:?}",
                if command.insert { "insert" } else { "delete" },
                command.entity
            );
            let ok = match ctx.control.submit(command).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("admin command from {peer} refused: {e}");
                    false
                }
            };
            reply_and_close(&mut write_half, ok).await?;
            Ok(ConnectionKind::Admin { ok })
        }
        FogMessage::LinkRequest(request) => {
            let outcome = run_session(reader, write_half, request, &ctx.session).await;
            Ok(ConnectionKind::Negotiation(outcome))
        }
        other => {
            warn!("{peer} opened with {:?}, expected AdminCommand or LinkRequest", other.fport());
            reply_and_close(&mut write_half, false).await?;
            Ok(ConnectionKind::Rejected)
        }
    }
}

async fn reply_and_close<W>(writer: &mut W, ok: bool) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_message(writer, &FogMessage::Response(Response { ok })).await?;
    writer.shutdown().await?;
    Ok(())
}
