//! Link negotiation state machine.
//!
//! One [`Negotiation`] exists per accepted `LinkRequest` connection.  It
//! brokers the handshake between the requesting platform (which opened the
//! connection) and a providing platform (which the gateway dials), then
//! records the resulting Link.
//!
//! # Sans-I/O (for beginners)
//!
//! The state machine never touches a socket.  Each event (a frame arrived, a
//! dial finished, the deadline fired) is fed in through an `on_*` method,
//! and the machine answers with a list of [`Action`]s for the caller to carry
//! out: write a frame to one side, dial a provider, or finish.  The I/O
//! driver lives in `infrastructure::network::session`; keeping it separate
//! lets every transition below be unit-tested without a network.
//!
//! ```text
//! REQUESTED ──lookup ok──▶ PROVIDER_SELECTED ──dial ok──▶ CONTRACT_FORWARDED
//!                                                              │ relay / provider ok
//!                                                              ▼
//!                         LINKED ◀──provider ok── COMMIT_PENDING ◀──commit── RELAYING
//!
//! any Response{false}, protocol error, transport error ──▶ REJECTED
//! deadline ──▶ TIMED_OUT
//! ```

use std::fmt;
use std::sync::Arc;

use fog_core::protocol::{FogMessage, LinkContract, Response};
use fog_core::{LinkId, Node, Store};
use thiserror::Error;
use tracing::{debug, info, warn};

// ── Sides, states, outcomes ───────────────────────────────────────────────────

/// Which connection a frame came from or must go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The platform that opened the connection and sent `LinkRequest`.
    Requester,
    /// The platform the gateway dialled on behalf of the requester.
    Provider,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Requester => Side::Provider,
            Side::Provider => Side::Requester,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Requester => f.write_str("requester"),
            Side::Provider => f.write_str("provider"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Requested,
    ProviderSelected,
    ContractForwarded,
    Relaying,
    CommitPending,
    Linked,
    Rejected,
    TimedOut,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NegotiationState::Linked | NegotiationState::Rejected | NegotiationState::TimedOut
        )
    }
}

/// Why a session ended without a link.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RejectReason {
    #[error("requesting device is not a known node")]
    UnknownRequester,

    #[error("no unlinked provider for the requested interface type")]
    NoProvider,

    #[error("could not reach provider platform: {0}")]
    DialFailed(String),

    #[error("{0} answered Response{{ok: false}}")]
    PeerRefused(Side),

    #[error("{0} connection closed")]
    PeerClosed(Side),

    #[error("{side} transport error: {message}")]
    Transport { side: Side, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("commit does not match the negotiated contract")]
    ContractMismatch,

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("gateway is shutting down")]
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Linked(LinkId),
    Rejected(RejectReason),
    TimedOut,
}

/// A read or write on one side failed instead of producing a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    /// The peer closed its end cleanly.
    Closed,
    /// The socket returned an error.
    Io(String),
    /// The peer sent bytes that are not a valid frame.
    Decode(String),
}

/// Work the driver must perform on behalf of the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(Side, FogMessage),
    Dial { address: String },
    Finish(Outcome),
}

// ── State machine ─────────────────────────────────────────────────────────────

pub struct Negotiation {
    session: String,
    store: Arc<dyn Store>,
    state: NegotiationState,
    contract: Option<LinkContract>,
    requester: Option<Node>,
    provider: Option<Node>,
    provider_connected: bool,
}

impl Negotiation {
    /// `session` is only used to tag log lines.
    pub fn new(session: impl Into<String>, store: Arc<dyn Store>) -> Self {
        Self {
            session: session.into(),
            store,
            state: NegotiationState::Requested,
            contract: None,
            requester: None,
            provider: None,
            provider_connected: false,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn contract(&self) -> Option<&LinkContract> {
        self.contract.as_ref()
    }

    /// Step 1: the requester opened the session.  Resolves both nodes and asks
    /// the driver to dial the provider's platform.
    pub fn on_link_request(&mut self, request: LinkContract) -> Vec<Action> {
        if self.state != NegotiationState::Requested || self.contract.is_some() {
            return self.reject(RejectReason::Protocol("duplicate LinkRequest".into()), None);
        }
        info!(
            "session {}: link request from {} for {}",
            self.session, request.requester_device_id, request.interface_type
        );
        let interface_type = request.interface_type;
        let requester_id = request.requester_device_id.clone();
        self.contract = Some(request);

        let requester = match self.store.find_node(&requester_id) {
            Ok(Some(node)) => node,
            Ok(None) => return self.reject(RejectReason::UnknownRequester, None),
            Err(e) => return self.reject(RejectReason::Persistence(e.to_string()), None),
        };

        let provider = match self.store.find_available_provider_node(interface_type, requester.id) {
            Ok(Some(node)) => node,
            Ok(None) => return self.reject(RejectReason::NoProvider, None),
            Err(e) => return self.reject(RejectReason::Persistence(e.to_string()), None),
        };

        let platform = match self.store.get_platform(provider.platform_id) {
            Ok(platform) => platform,
            Err(e) => return self.reject(RejectReason::Persistence(e.to_string()), None),
        };

        debug!(
            "session {}: selected provider {} on platform {}",
            self.session, provider.device_id, platform.address
        );
        self.requester = Some(requester);
        self.provider = Some(provider);
        self.state = NegotiationState::ProviderSelected;
        vec![Action::Dial {
            address: platform.address,
        }]
    }

    /// Step 2: the outbound connection to the provider succeeded or failed.
    pub fn on_dial_result(&mut self, result: Result<(), String>) -> Vec<Action> {
        if self.state != NegotiationState::ProviderSelected {
            return self.reject(RejectReason::Protocol("unexpected dial result".into()), None);
        }
        if let Err(e) = result {
            return self.reject(RejectReason::DialFailed(e), Some(Side::Provider));
        }
        self.provider_connected = true;

        let provider_device = match &self.provider {
            Some(node) => node.device_id.clone(),
            None => return self.reject(RejectReason::Protocol("no provider selected".into()), None),
        };
        let Some(contract) = self.contract.as_mut() else {
            return self.reject(RejectReason::Protocol("no contract".into()), None);
        };
        contract.provider_device_id = provider_device;
        contract.linked = false;
        let forwarded = contract.clone();

        self.state = NegotiationState::ContractForwarded;
        vec![Action::Send(Side::Provider, FogMessage::LinkRequest(forwarded))]
    }

    /// Steps 3–7: a frame arrived from one of the two connections.
    pub fn on_frame(&mut self, from: Side, msg: FogMessage) -> Vec<Action> {
        use NegotiationState::*;

        if self.state.is_terminal() {
            return Vec::new();
        }
        let linked = self.contract.as_ref().is_some_and(|c| c.linked);

        match (self.state, from, msg) {
            (ContractForwarded | Relaying, side, FogMessage::LinkRelay(payload)) => {
                self.state = Relaying;
                debug!(
                    "session {}: relaying {} bytes from {}",
                    self.session,
                    payload.len(),
                    side
                );
                vec![Action::Send(side.other(), FogMessage::LinkRelay(payload))]
            }
            (ContractForwarded | Relaying, Side::Provider, FogMessage::Response(Response { ok: true }))
                if !linked =>
            {
                self.state = Relaying;
                match self.contract.clone() {
                    Some(contract) => {
                        info!("session {}: provider accepted, forwarding contract", self.session);
                        vec![Action::Send(Side::Requester, FogMessage::LinkRequest(contract))]
                    }
                    None => self.reject(RejectReason::Protocol("no contract".into()), None),
                }
            }
            (Relaying, Side::Requester, FogMessage::LinkCommit(commit)) => self.on_commit(commit),
            (CommitPending, Side::Provider, FogMessage::Response(Response { ok: true })) => {
                self.finalize()
            }
            (_, side, FogMessage::Response(Response { ok: false })) => {
                self.reject(RejectReason::PeerRefused(side), Some(side))
            }
            (state, side, other) => self.reject(
                RejectReason::Protocol(format!(
                    "unexpected {:?} from {side} in {state:?}",
                    other.fport()
                )),
                None,
            ),
        }
    }

    /// A connection failed instead of producing a frame.
    pub fn on_transport_failure(&mut self, side: Side, failure: TransportFailure) -> Vec<Action> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        match failure {
            TransportFailure::Closed => self.reject(RejectReason::PeerClosed(side), Some(side)),
            TransportFailure::Io(message) => {
                self.reject(RejectReason::Transport { side, message }, Some(side))
            }
            TransportFailure::Decode(message) => self.reject(RejectReason::Protocol(message), None),
        }
    }

    /// The session deadline elapsed.
    pub fn on_deadline(&mut self) -> Vec<Action> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        warn!("session {}: deadline elapsed in {:?}", self.session, self.state);
        let mut actions = self.notify_waiting(None);
        self.state = NegotiationState::TimedOut;
        actions.push(Action::Finish(Outcome::TimedOut));
        actions
    }

    /// The gateway is shutting down.
    pub fn on_shutdown(&mut self) -> Vec<Action> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        self.reject(RejectReason::Shutdown, None)
    }

    // ── Internal transitions ──────────────────────────────────────────────────

    fn on_commit(&mut self, commit: LinkContract) -> Vec<Action> {
        if !commit.linked {
            return self.reject(RejectReason::Protocol("LinkCommit without linked flag".into()), None);
        }
        let Some(contract) = self.contract.as_mut() else {
            return self.reject(RejectReason::Protocol("no contract".into()), None);
        };
        if !contract.same_parties(&commit) {
            return self.reject(RejectReason::ContractMismatch, None);
        }
        contract.linked = true;
        let forwarded = contract.clone();
        self.state = NegotiationState::CommitPending;
        info!("session {}: requester committed, waiting for provider", self.session);
        vec![Action::Send(Side::Provider, FogMessage::LinkCommit(forwarded))]
    }

    fn finalize(&mut self) -> Vec<Action> {
        let (provider, requester) = match (&self.provider, &self.requester) {
            (Some(p), Some(r)) => (p.id, r.id),
            _ => return self.reject(RejectReason::Protocol("nodes not resolved".into()), None),
        };
        match self.store.insert_link(provider, requester) {
            Ok(link) => {
                self.state = NegotiationState::Linked;
                info!(
                    "session {}: link {} established ({} -> {})",
                    self.session, link, provider, requester
                );
                vec![
                    Action::Send(Side::Requester, FogMessage::ok()),
                    Action::Finish(Outcome::Linked(link)),
                ]
            }
            Err(e) => self.reject(RejectReason::Persistence(e.to_string()), None),
        }
    }

    /// Moves to REJECTED, telling every connected side except `failed`.
    fn reject(&mut self, reason: RejectReason, failed: Option<Side>) -> Vec<Action> {
        warn!("session {}: rejected in {:?}: {}", self.session, self.state, reason);
        let mut actions = self.notify_waiting(failed);
        self.state = NegotiationState::Rejected;
        actions.push(Action::Finish(Outcome::Rejected(reason)));
        actions
    }

    fn notify_waiting(&self, skip: Option<Side>) -> Vec<Action> {
        let mut sides = vec![Side::Requester];
        if self.provider_connected {
            sides.push(Side::Provider);
        }
        sides
            .into_iter()
            .filter(|side| Some(*side) != skip)
            .map(|side| Action::Send(side, FogMessage::rejected()))
            .collect()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
