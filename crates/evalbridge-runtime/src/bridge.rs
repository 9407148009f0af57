//! Bridge node: request registry, dispatcher and TCP peer links.
//!
//! A [`Bridge`] accepts links from other bridges and dials out to one. Each
//! link carries bencoded envelopes in both directions: requests go to the
//! [`DirectionalDispatcher`], responses settle the [`RequestRegistry`].
//! Writes are funnelled through one task per link fed by an mpsc channel, so
//! concurrent requests never interleave their frames.

use crate::dispatcher::{Dispatched, DirectionalDispatcher, PeerLink};
use crate::evaluator::NreplEvaluator;
use crate::fs::LocalFs;
use crate::process::LocalProcessRunner;
use crate::remote_eval::RemoteEvaluator;
use evalbridge_types::config::BridgeConfig;
use evalbridge_types::envelope::{
    Direction, Envelope, OperationKind, Payload, RequestEnvelope, ResponseEnvelope,
};
use evalbridge_types::error::{BridgeError, BridgeResult};
use evalbridge_wire::envelope::{from_wire, to_wire};
use evalbridge_wire::frame::{write_frame, FrameReader, WireError};
use evalbridge_wire::{MessageIdGenerator, RequestRegistry, SessionOptions};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One evalbridge node.
pub struct Bridge {
    ids: Arc<MessageIdGenerator>,
    registry: RequestRegistry,
    dispatcher: DirectionalDispatcher,
    outbound_queue: usize,
    max_frame_bytes: usize,
    next_link: AtomicU64,
}

impl Bridge {
    /// `max_frame_bytes` bounds every frame read from a peer link; a link
    /// that sends a larger one is closed.
    pub fn new(
        ids: Arc<MessageIdGenerator>,
        registry: RequestRegistry,
        evaluator: RemoteEvaluator,
        outbound_queue: usize,
        max_frame_bytes: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            ids,
            registry,
            dispatcher: DirectionalDispatcher::new(evaluator),
            outbound_queue: outbound_queue.max(1),
            max_frame_bytes,
            next_link: AtomicU64::new(1),
        })
    }

    /// Build a node whose collaborators come from `config`: evaluation on
    /// the configured protocol peer, host filesystem and local processes.
    pub fn from_config(config: &BridgeConfig) -> Arc<Self> {
        let ids = Arc::new(MessageIdGenerator::new());
        let evaluator = NreplEvaluator::new(
            config.peer.address(),
            Arc::clone(&ids),
            SessionOptions::from(&config.session),
        );
        let fs = match &config.fs.root {
            Some(root) => LocalFs::confined(root.clone()),
            None => LocalFs::new(),
        };
        let runner = LocalProcessRunner::new(
            Duration::from_secs(config.shell.timeout_secs),
            config.shell.allowed_env_vars.clone(),
        );
        Self::new(
            ids,
            RequestRegistry::new(config.registry.call_timeout()),
            RemoteEvaluator::new(Arc::new(evaluator), Arc::new(fs), Arc::new(runner)),
            config.bridge.outbound_queue,
            config.session.max_frame_bytes,
        )
    }

    pub fn ids(&self) -> &Arc<MessageIdGenerator> {
        &self.ids
    }

    pub fn registry(&self) -> &RequestRegistry {
        &self.registry
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Address of the link requests are forwarded on, if any.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.dispatcher.peer_addr()
    }

    /// Issue a request and wait for its response.
    ///
    /// An error response surfaces as [`BridgeError::Remote`], a timeout
    /// response or an expired call as [`BridgeError::Timeout`].
    pub async fn call(
        &self,
        op: OperationKind,
        code: impl Into<Payload>,
        direction: Direction,
    ) -> BridgeResult<ResponseEnvelope> {
        let id = self.ids.generate().to_string();
        let req = RequestEnvelope::new(id, direction, op, code);
        let handle = self.registry.register(&req.id)?;
        debug!(id = %req.id, op = %req.op, direction = %direction, "Calling");
        self.submit(req).await;
        handle.wait().await
    }

    /// Route a request whose id the caller has already registered.
    ///
    /// A local answer settles the registry right away; a forwarded request
    /// is settled when the peer's response arrives on the link.
    pub async fn submit(&self, req: RequestEnvelope) {
        if let Dispatched::Responded(resp) = self.dispatcher.dispatch(req).await {
            self.registry.settle(resp);
        }
    }

    /// Accept peer links on `addr`. Returns the bound address and the accept
    /// loop's task.
    pub async fn listen(self: &Arc<Self>, addr: &str) -> BridgeResult<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Bridge listening");

        let bridge = Arc::clone(self);
        let accept_handle = tokio::spawn(async move {
            bridge.accept_loop(listener).await;
        });
        Ok((local_addr, accept_handle))
    }

    /// Dial a peer bridge and forward to-peer requests over that link.
    pub async fn connect(self: &Arc<Self>, addr: &str) -> BridgeResult<SocketAddr> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| BridgeError::Connection(format!("cannot connect to {addr}: {e}")))?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        self.spawn_link(stream, peer, true);
        Ok(peer)
    }

    /// Fail every pending call. Returns how many were pending.
    pub fn shutdown(&self) -> usize {
        self.registry.cancel_all("bridge shut down")
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(addr = %addr, "Accepted peer link");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(addr = %addr, error = %e, "set_nodelay failed");
                    }
                    self.spawn_link(stream, addr, false);
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Start the reader and writer tasks for one link.
    ///
    /// A dialed link always becomes the forwarding link; an accepted one only
    /// when no other link is attached.
    fn spawn_link(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr, dialed: bool) {
        let link_id = self.next_link.fetch_add(1, Ordering::Relaxed);
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Envelope>(self.outbound_queue);

        let link = PeerLink {
            link_id,
            addr,
            tx: tx.clone(),
        };
        let forwarding = if dialed {
            self.dispatcher.attach_peer(link);
            true
        } else {
            self.dispatcher.attach_peer_if_vacant(link)
        };
        info!(link_id, addr = %addr, dialed, forwarding, "Peer link up");

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(e) = write_frame(&mut write_half, &to_wire(&envelope)).await {
                    warn!(link_id, error = %e, "Peer link write failed");
                    break;
                }
            }
        });

        let bridge = Arc::clone(self);
        let max_frame = self.max_frame_bytes;
        tokio::spawn(async move {
            let mut reader = FrameReader::with_limit(read_half, max_frame);
            if let Err(e) = bridge.link_loop(&mut reader, link_id, &tx).await {
                debug!(link_id, error = %e, "Peer link ended");
            }
            bridge.dispatcher.detach_peer(link_id);
            info!(link_id, addr = %addr, "Peer link closed");
        });
    }

    async fn link_loop(
        self: &Arc<Self>,
        reader: &mut FrameReader<OwnedReadHalf>,
        link_id: u64,
        tx: &mpsc::Sender<Envelope>,
    ) -> Result<(), WireError> {
        loop {
            let frame = match reader.read_frame().await {
                Ok(frame) => frame,
                Err(WireError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            };

            match from_wire(&frame) {
                Ok(Envelope::Request(req)) => {
                    let bridge = Arc::clone(self);
                    let reply = tx.clone();
                    tokio::spawn(async move {
                        bridge.serve_remote(req, reply).await;
                    });
                }
                Ok(Envelope::Response(resp)) => {
                    debug!(link_id, id = %resp.id, status = resp.status.as_str(), "Response received");
                    self.registry.settle(resp);
                }
                Err(e) => {
                    warn!(link_id, error = %e, "Malformed envelope on peer link");
                    let Some(id) = frame.get_str("id") else {
                        continue;
                    };
                    if frame.get("status").is_some() {
                        self.registry.reject(id, e.into());
                    } else {
                        let resp = ResponseEnvelope::error(id, e.to_string());
                        if tx.send(Envelope::Response(resp)).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Answer a request that arrived on a link.
    ///
    /// To-peer requests are relayed: registered here under their own id,
    /// forwarded, and answered with whatever settles that registration.
    async fn serve_remote(self: Arc<Self>, req: RequestEnvelope, reply: mpsc::Sender<Envelope>) {
        let id = req.id.clone();
        let response = match req.direction {
            Direction::ToLocal => match self.dispatcher.dispatch(req).await {
                Dispatched::Responded(resp) => resp,
                // only to-peer requests are forwarded
                Dispatched::Forwarded => return,
            },
            Direction::ToPeer => match self.registry.register(&id) {
                Ok(handle) => {
                    self.submit(req).await;
                    settlement_response(&id, handle.wait().await)
                }
                Err(e) => ResponseEnvelope::error(&id, e.to_string()),
            },
        };
        if reply.send(Envelope::Response(response)).await.is_err() {
            warn!(id = %id, "Peer link closed before the response was sent");
        }
    }
}

/// Turn the outcome of a relayed call back into a response envelope.
fn settlement_response(id: &str, settled: BridgeResult<ResponseEnvelope>) -> ResponseEnvelope {
    match settled {
        Ok(resp) => resp,
        Err(BridgeError::Remote { message, .. }) => ResponseEnvelope::error(id, message),
        Err(e @ BridgeError::Timeout { .. }) => ResponseEnvelope::timeout(id, e.to_string()),
        Err(e) => ResponseEnvelope::error(id, e.to_string()),
    }
}
