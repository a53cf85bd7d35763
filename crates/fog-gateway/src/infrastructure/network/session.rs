//! Drives one [`Negotiation`] over real connections.
//!
//! `run_session` owns the requester connection handed over by the acceptor,
//! dials the provider when the state machine asks for it, and pumps frames
//! from both sides into a single event queue.  Every event is fed to the
//! state machine and the resulting actions are executed in order until the
//! machine finishes.
//!
//! Each side gets its own reader task, so a slow or silent peer never blocks
//! the other.  Writes are bounded by [`WRITE_TIMEOUT`] and the whole session
//! by the configured session timeout.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fog_core::protocol::{FogMessage, LinkContract};
use fog_core::Store;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::framed::{write_message, FrameError, FrameReader};
use crate::application::negotiation::{Action, Negotiation, Outcome, Side, TransportFailure};

/// Upper bound for writing one frame to either peer.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_QUEUE: usize = 32;

// ── Transport seams ───────────────────────────────────────────────────────────

/// Any bidirectional byte stream the session can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens the outbound connection to a provider platform.
///
/// The production implementation is `TlsDialer`; tests plug in in-memory
/// streams.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, address: &str) -> io::Result<BoxedStream>;
}

/// Everything a session needs besides its own connection.
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<dyn Store>,
    pub dialer: Arc<dyn Dialer>,
    /// Overall session deadline, measured from the moment the request is read.
    pub timeout: Duration,
    pub shutdown: CancellationToken,
}

// ── Driver ────────────────────────────────────────────────────────────────────

enum Event {
    Frame(Side, FogMessage),
    Failed(Side, TransportFailure),
}

/// Runs one negotiation to completion and returns how it ended.
///
/// `reader` and `writer` are the two halves of the requester connection,
/// positioned just after the `LinkRequest` frame (`request`).  Both
/// connections are shut down before this returns.
pub async fn run_session<R, W>(
    reader: FrameReader<R>,
    mut writer: W,
    request: LinkContract,
    ctx: &SessionContext,
) -> Outcome
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send,
{
    let session_id = Uuid::new_v4().to_string();
    let deadline = Instant::now() + ctx.timeout;
    let cancel = ctx.shutdown.child_token();
    let (tx, mut rx) = mpsc::channel(EVENT_QUEUE);

    let mut machine = Negotiation::new(session_id.clone(), Arc::clone(&ctx.store));
    let mut readers: Vec<JoinHandle<()>> = vec![tokio::spawn(pump_frames(
        Side::Requester,
        reader,
        tx.clone(),
        cancel.clone(),
    ))];
    let mut provider: Option<WriteHalf<BoxedStream>> = None;
    let mut pending: VecDeque<Action> = machine.on_link_request(request).into();

    let outcome = 'session: loop {
        while let Some(action) = pending.pop_front() {
            match action {
                Action::Send(side, msg) => {
                    let result = match side {
                        Side::Requester => send(&mut writer, &msg).await,
                        Side::Provider => match provider.as_mut() {
                            Some(w) => send(w, &msg).await,
                            None => Err("provider not connected".to_string()),
                        },
                    };
                    if let Err(e) = result {
                        debug!("session {session_id}: write to {side} failed: {e}");
                        pending.extend(machine.on_transport_failure(side, TransportFailure::Io(e)));
                    }
                }
                Action::Dial { address } => {
                    let dialed = tokio::select! {
                        _ = cancel.cancelled() => None,
                        r = timeout_at(deadline, ctx.dialer.dial(&address)) => Some(r),
                    };
                    let actions = match dialed {
                        None => machine.on_shutdown(),
                        Some(Err(_elapsed)) => machine.on_deadline(),
                        Some(Ok(Err(e))) => machine.on_dial_result(Err(e.to_string())),
                        Some(Ok(Ok(stream))) => {
                            debug!("session {session_id}: connected to provider at {address}");
                            let (read_half, write_half) = tokio::io::split(stream);
                            provider = Some(write_half);
                            readers.push(tokio::spawn(pump_frames(
                                Side::Provider,
                                FrameReader::new(read_half),
                                tx.clone(),
                                cancel.clone(),
                            )));
                            machine.on_dial_result(Ok(()))
                        }
                    };
                    pending.extend(actions);
                }
                Action::Finish(outcome) => break 'session outcome,
            }
        }

        let actions = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => machine.on_deadline(),
            _ = cancel.cancelled() => machine.on_shutdown(),
            event = rx.recv() => match event {
                Some(Event::Frame(side, msg)) => machine.on_frame(side, msg),
                Some(Event::Failed(side, failure)) => machine.on_transport_failure(side, failure),
                None => machine.on_shutdown(),
            },
        };
        pending.extend(actions);
    };

    // Stop the reader tasks, then close both connections.  Closing the queue
    // releases a reader parked on a full `send`.
    cancel.cancel();
    drop(tx);
    rx.close();
    let _ = timeout(WRITE_TIMEOUT, writer.shutdown()).await;
    if let Some(mut w) = provider {
        let _ = timeout(WRITE_TIMEOUT, w.shutdown()).await;
    }
    for handle in readers {
        let _ = handle.await;
    }

    match &outcome {
        Outcome::Linked(link) => info!("session {session_id}: finished, link {link}"),
        Outcome::Rejected(reason) => info!("session {session_id}: finished, rejected ({reason})"),
        Outcome::TimedOut => info!("session {session_id}: finished, timed out"),
    }
    outcome
}

async fn send<W>(writer: &mut W, msg: &FogMessage) -> Result<(), String>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    match timeout(WRITE_TIMEOUT, write_message(writer, msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("write timed out".to_string()),
    }
}

/// Forwards frames from one connection into the session's event queue until
/// the connection fails, the queue closes, or `cancel` fires.
async fn pump_frames<R>(
    side: Side,
    mut reader: FrameReader<R>,
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            r = reader.next_message() => r,
        };
        let event = match next {
            Ok(Some(msg)) => Event::Frame(side, msg),
            Ok(None) => Event::Failed(side, TransportFailure::Closed),
            Err(FrameError::Io(e)) => Event::Failed(side, TransportFailure::Io(e.to_string())),
            Err(FrameError::Protocol(e)) => {
                warn!("undecodable frame from {side}: {e}");
                Event::Failed(side, TransportFailure::Decode(e.to_string()))
            }
        };
        let last = matches!(event, Event::Failed(..));
        let sent = tokio::select! {
            _ = cancel.cancelled() => return,
            r = tx.send(event) => r,
        };
        if sent.is_err() || last {
            return;
        }
    }
}
