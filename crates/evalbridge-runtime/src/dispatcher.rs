//! Direction-based routing of inbound requests.
//!
//! ```text
//! Received ─┬─ to-peer ──► Forwarded      (sent on the peer link as to-local)
//!           └─ to-local ─► Evaluated ───► ResponseSent
//! ```

use crate::remote_eval::RemoteEvaluator;
use evalbridge_types::envelope::{Direction, Envelope, RequestEnvelope, ResponseEnvelope};
use std::net::SocketAddr;
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Where a dispatched request ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    /// Sent to the peer; its response arrives on the link later.
    Forwarded,
    /// Answered here.
    Responded(ResponseEnvelope),
}

/// Outbound half of the link requests are forwarded on.
#[derive(Debug, Clone)]
pub struct PeerLink {
    /// Identifies the link for detaching.
    pub link_id: u64,
    pub addr: SocketAddr,
    pub tx: mpsc::Sender<Envelope>,
}

/// Routes each request by its direction tag.
pub struct DirectionalDispatcher {
    evaluator: RemoteEvaluator,
    peer: RwLock<Option<PeerLink>>,
}

impl DirectionalDispatcher {
    pub fn new(evaluator: RemoteEvaluator) -> Self {
        Self {
            evaluator,
            peer: RwLock::new(None),
        }
    }

    /// Use `link` for forwarding, replacing any current link.
    pub fn attach_peer(&self, link: PeerLink) {
        let mut peer = self.peer.write().unwrap_or_else(|e| e.into_inner());
        debug!(link_id = link.link_id, addr = %link.addr, "Peer link attached");
        *peer = Some(link);
    }

    /// Use `link` for forwarding only if none is attached. Returns whether it
    /// was attached.
    pub fn attach_peer_if_vacant(&self, link: PeerLink) -> bool {
        let mut peer = self.peer.write().unwrap_or_else(|e| e.into_inner());
        if peer.is_some() {
            return false;
        }
        debug!(link_id = link.link_id, addr = %link.addr, "Peer link attached");
        *peer = Some(link);
        true
    }

    /// Drop the forwarding link if it is still `link_id`.
    pub fn detach_peer(&self, link_id: u64) {
        let mut peer = self.peer.write().unwrap_or_else(|e| e.into_inner());
        if peer.as_ref().is_some_and(|p| p.link_id == link_id) {
            debug!(link_id, "Peer link detached");
            *peer = None;
        }
    }

    /// Address of the attached peer link, if any.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|p| p.addr)
    }

    fn peer_sender(&self) -> Option<mpsc::Sender<Envelope>> {
        self.peer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|p| p.tx.clone())
    }

    /// Route one request. Never drops it silently: if it cannot be forwarded
    /// the caller gets an error response.
    pub async fn dispatch(&self, req: RequestEnvelope) -> Dispatched {
        debug!(id = %req.id, op = %req.op, direction = %req.direction, "Request received");
        match req.direction {
            Direction::ToPeer => {
                let Some(tx) = self.peer_sender() else {
                    warn!(id = %req.id, "No peer link to forward to");
                    return Dispatched::Responded(ResponseEnvelope::error(
                        &req.id,
                        "no peer link attached",
                    ));
                };
                let id = req.id.clone();
                let forwarded = RequestEnvelope {
                    direction: Direction::ToLocal,
                    ..req
                };
                match tx.send(Envelope::Request(forwarded)).await {
                    Ok(()) => {
                        debug!(id = %id, "Request forwarded");
                        Dispatched::Forwarded
                    }
                    Err(_) => {
                        warn!(id = %id, "Peer link closed while forwarding");
                        Dispatched::Responded(ResponseEnvelope::error(id, "peer link closed"))
                    }
                }
            }
            Direction::ToLocal => {
                let resp = self.evaluator.execute(req).await;
                debug!(id = %resp.id, status = %resp.status.as_str(), "Request evaluated");
                Dispatched::Responded(resp)
            }
        }
    }
}
