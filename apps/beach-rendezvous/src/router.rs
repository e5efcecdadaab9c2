use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use crate::{
    connection::Connection,
    envelope::{self, EnvelopeError, SignalEnvelope},
    registry::IdentityRegistry,
};

/// Identity state of a single connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterState {
    Unregistered,
    /// `bound` is false when another connection already owned `id`.
    Registered { id: String, bound: bool },
}

/// What happened to one inbound message. None of these end the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Empty,
    Malformed,
    MissingSender,
    KeepAlive,
    Forwarded { target: String },
    TargetNotFound { target: String },
    TargetStale { target: String },
    SendFailed { target: String },
    NoTarget,
}

impl RouteOutcome {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RouteOutcome::Empty => "empty",
            RouteOutcome::Malformed => "malformed",
            RouteOutcome::MissingSender => "missing_sender",
            RouteOutcome::KeepAlive => "keep_alive",
            RouteOutcome::Forwarded { .. } => "forwarded",
            RouteOutcome::TargetNotFound { .. } => "target_not_found",
            RouteOutcome::TargetStale { .. } => "target_stale",
            RouteOutcome::SendFailed { .. } => "send_failed",
            RouteOutcome::NoTarget => "no_target",
        }
    }
}

/// Per-connection protocol logic: one-shot registration, keep-alives,
/// forwarding and registry cleanup.
pub struct MessageRouter {
    registry: IdentityRegistry,
    connection: Connection,
    state: RouterState,
    closed: bool,
}

impl MessageRouter {
    pub fn new(registry: IdentityRegistry, connection: Connection) -> Self {
        Self {
            registry,
            connection,
            state: RouterState::Unregistered,
            closed: false,
        }
    }

    pub fn state(&self) -> &RouterState {
        &self.state
    }

    /// Working identity, set by the first valid envelope even when
    /// registration lost the race.
    pub fn identity(&self) -> Option<&str> {
        match &self.state {
            RouterState::Unregistered => None,
            RouterState::Registered { id, .. } => Some(id),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn handle_text(&mut self, raw: &str) -> RouteOutcome {
        let envelope = match envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(EnvelopeError::Empty) => return RouteOutcome::Empty,
            Err(EnvelopeError::MissingSender) => {
                debug!(
                    connection_id = %self.connection.id(),
                    "dropping envelope without senderId"
                );
                return RouteOutcome::MissingSender;
            }
            Err(err) => {
                warn!(
                    connection_id = %self.connection.id(),
                    error = %err,
                    "failed to parse envelope"
                );
                return RouteOutcome::Malformed;
            }
        };

        if self.state == RouterState::Unregistered {
            self.identify(&envelope.sender_id);
        }

        if envelope.is_keep_alive() {
            debug!(peer_id = %envelope.sender_id, "keep-alive");
            return RouteOutcome::KeepAlive;
        }

        match envelope.target() {
            Some(target) => self.forward(&envelope, target),
            None => {
                debug!(
                    peer_id = %envelope.sender_id,
                    kind = %envelope.kind(),
                    "envelope has no target; dropping"
                );
                RouteOutcome::NoTarget
            }
        }
    }

    fn identify(&mut self, sender_id: &str) {
        let bound = self.registry.register(sender_id, &self.connection);
        if bound {
            counter!("rendezvous_registrations_total", 1, "result" => "accepted");
            gauge!("rendezvous_registered_peers", self.registry.len() as f64);
            info!(
                peer_id = %sender_id,
                connection_id = %self.connection.id(),
                total = self.registry.len(),
                "peer registered"
            );
        } else {
            counter!("rendezvous_registrations_total", 1, "result" => "rejected");
            warn!(
                peer_id = %sender_id,
                connection_id = %self.connection.id(),
                "peer id already registered; connection stays unbound"
            );
        }

        self.state = RouterState::Registered {
            id: sender_id.to_string(),
            bound,
        };
    }

    fn forward(&self, envelope: &SignalEnvelope, target: &str) -> RouteOutcome {
        let Some(destination) = self.registry.lookup(target) else {
            info!(
                peer_id = %envelope.sender_id,
                target = %target,
                kind = %envelope.kind(),
                "target not found"
            );
            return RouteOutcome::TargetNotFound {
                target: target.to_string(),
            };
        };

        if !destination.is_open() {
            warn!(
                target = %target,
                state = %destination.state(),
                "target connection is not open; evicting"
            );
            if self.registry.remove(target, &destination) {
                gauge!("rendezvous_registered_peers", self.registry.len() as f64);
            }
            return RouteOutcome::TargetStale {
                target: target.to_string(),
            };
        }

        let sent = envelope::encode(envelope)
            .map_err(|err| err.to_string())
            .and_then(|text| destination.send(text).map_err(|err| err.to_string()));

        match sent {
            Ok(()) => {
                debug!(
                    peer_id = %envelope.sender_id,
                    target = %target,
                    kind = %envelope.kind(),
                    "forwarded envelope"
                );
                RouteOutcome::Forwarded {
                    target: target.to_string(),
                }
            }
            Err(err) => {
                warn!(target = %target, error = %err, "failed to forward envelope");
                RouteOutcome::SendFailed {
                    target: target.to_string(),
                }
            }
        }
    }

    /// Release this connection: drop its registry binding if it still owns
    /// it, queue a normal closure if the socket is still Open, mark Closed.
    /// Runs once; later calls (including the one from `Drop`) do nothing.
    /// Returns whether a close frame was queued.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;

        if let RouterState::Registered { id, .. } = &self.state {
            if self.registry.remove(id, &self.connection) {
                gauge!("rendezvous_registered_peers", self.registry.len() as f64);
                info!(
                    peer_id = %id,
                    connection_id = %self.connection.id(),
                    "peer disconnected"
                );
            }
        }

        let close_queued = self.connection.begin_close() && self.connection.send_close().is_ok();
        self.connection.mark_closed();
        close_queued
    }
}

impl Drop for MessageRouter {
    fn drop(&mut self) {
        self.close();
    }
}
