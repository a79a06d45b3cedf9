//! Server session loop: admission, heartbeats, relay handshake and RPC routing

use crate::dispatcher::{Effect, RpcDispatcher};
use log::{debug, error, info, warn};
use shared::config::ServerConfig;
use shared::frame::{AuthResponse, Authentication, Frame, FrameBody};
use shared::heartbeat::HeartbeatMonitor;
use shared::host::EntityHost;
use shared::reliability::RecentFrames;
use shared::rpc::{DisconnectType, RpcEnvelope, Transform};
use shared::transport::{Inbound, Transport, TransportEvent};
use shared::{NetError, PeerId, LOST_CONNECTION, PROXY_ID, SERVER_ID};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant};

/// Reason given to every peer when the server shuts down
pub const SERVER_STOPPING: &str = "Server Stopping";

/// Messages from the heartbeat task and server handles to the session loop
#[derive(Debug)]
pub enum ServerMessage {
    PeerTimeout {
        peer_id: PeerId,
    },
    Kick {
        peer_id: PeerId,
        reason: String,
    },
    Ban {
        peer_id: PeerId,
        reason: String,
    },
    Spawn {
        prefab_index: i32,
        reply: oneshot::Sender<Option<i32>>,
    },
    Destroy {
        network_id: i32,
    },
    Update {
        rpc: RpcEnvelope,
    },
    Stop {
        reason: String,
    },
}

/// Cloneable control surface for a running server
#[derive(Debug, Clone)]
pub struct ServerHandle {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ServerHandle {
    fn post(&self, message: ServerMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    pub fn kick(&self, peer_id: impl Into<PeerId>, reason: impl Into<String>) -> bool {
        self.post(ServerMessage::Kick {
            peer_id: peer_id.into(),
            reason: reason.into(),
        })
    }

    /// Adds the peer to the ban list, then kicks it with the same reason
    pub fn ban(&self, peer_id: impl Into<PeerId>, reason: impl Into<String>) -> bool {
        self.post(ServerMessage::Ban {
            peer_id: peer_id.into(),
            reason: reason.into(),
        })
    }

    /// Spawns an entity owned by the server; resolves to its network id
    pub async fn spawn(&self, prefab_index: i32) -> Option<i32> {
        let (reply, response) = oneshot::channel();
        if !self.post(ServerMessage::Spawn {
            prefab_index,
            reply,
        }) {
            return None;
        }
        response.await.ok().flatten()
    }

    pub fn destroy(&self, network_id: i32) -> bool {
        self.post(ServerMessage::Destroy { network_id })
    }

    pub fn send_transform(&self, network_id: i32, transform: Transform) -> bool {
        self.post(ServerMessage::Update {
            rpc: RpcEnvelope::transform(network_id, transform),
        })
    }

    pub fn send_custom(
        &self,
        network_id: i32,
        kind: u8,
        payload: Vec<u8>,
        important: bool,
    ) -> bool {
        self.post(ServerMessage::Update {
            rpc: RpcEnvelope::custom(network_id, kind, payload, important),
        })
    }

    /// Kicks every peer, then ends the session loop
    pub fn stop(&self) -> bool {
        self.post(ServerMessage::Stop {
            reason: SERVER_STOPPING.to_string(),
        })
    }
}

/// Handshake state with the relay, when the server is reached through one
#[derive(Debug, Default)]
struct ProxyLink {
    connected: bool,
    attempts: u32,
}

/// Accepting side of a session
pub struct Server<H: EntityHost> {
    config: ServerConfig,
    transport: Transport,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    dispatcher: RpcDispatcher<H>,
    heartbeat: Arc<Mutex<HeartbeatMonitor>>,
    recent: RecentFrames,
    proxy: Option<ProxyLink>,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl<H: EntityHost> Server<H> {
    /// Binds the listening socket, or dials the relay when one is configured
    pub async fn new(config: ServerConfig, host: H) -> Result<Self, NetError> {
        let dispatcher = RpcDispatcher::new(&config, host);
        Self::with_dispatcher(config, dispatcher).await
    }

    pub async fn with_dispatcher(
        config: ServerConfig,
        dispatcher: RpcDispatcher<H>,
    ) -> Result<Self, NetError> {
        let (transport, events) = match config.proxy_addr {
            Some(relay) => {
                info!("Reaching clients through relay at {}", relay);
                Transport::dial(relay, SERVER_ID, &config.reliability).await?
            }
            None => Transport::listen(config.listen_addr, SERVER_ID, &config.reliability).await?,
        };

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let proxy = config.proxy_addr.map(|_| ProxyLink::default());

        Ok(Server {
            heartbeat: Arc::new(Mutex::new(HeartbeatMonitor::new(&config.heartbeat))),
            config,
            transport,
            events,
            dispatcher,
            recent: RecentFrames::default(),
            proxy,
            server_tx,
            server_rx,
        })
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            tx: self.server_tx.clone(),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        self.transport.local_addr()
    }

    fn proxy_ready(&self) -> bool {
        self.proxy.as_ref().map_or(true, |link| link.connected)
    }

    fn proxy_pending(&self) -> bool {
        self.proxy.as_ref().is_some_and(|link| !link.connected)
    }

    /// Spawns task that sends heartbeats to peers and reports the ones that went silent
    fn spawn_heartbeat(&self, mut stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let monitor = Arc::clone(&self.heartbeat);
        let sender = self.transport.sender();
        let server_tx = self.server_tx.clone();
        let period = self.config.heartbeat.interval;

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => {}
                }
                if *stop_rx.borrow() {
                    break;
                }

                let tick = monitor.lock().await.tick();

                for peer in tick.due {
                    sender.send(Frame::new(FrameBody::Heartbeat, SERVER_ID, peer));
                }
                for peer_id in tick.timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::PeerTimeout { peer_id }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        })
    }

    /// Sends the next relay authentication attempt
    fn retry_proxy(&mut self) -> Result<(), NetError> {
        let limit = self.config.proxy_attempts;
        let Some(link) = self.proxy.as_mut() else {
            return Ok(());
        };

        if link.attempts >= limit {
            error!("Relay did not answer after {} attempts", link.attempts);
            return Err(NetError::ConnectionFailed(link.attempts));
        }
        link.attempts += 1;
        debug!("Authenticating with relay (attempt {})", link.attempts);

        self.transport.send(Frame::new(
            FrameBody::Authentication(Authentication::request("")),
            SERVER_ID,
            PROXY_ID,
        ));
        Ok(())
    }

    fn handle_proxy_response(&mut self, auth: &Authentication) {
        let Some(link) = self.proxy.as_mut() else {
            return;
        };
        match auth.response {
            AuthResponse::Connected => {
                if !link.connected {
                    info!("Relay accepted the server");
                }
                link.connected = true;
            }
            other => warn!("Relay answered {:?}: {}", other, auth.message),
        }
    }

    /// Processes one inbound frame; the admission gate sits here
    ///
    /// A peer's address is bound when it is first admitted. Until then every answer goes
    /// back to the datagram's source only, and afterwards frames claiming its id from any
    /// other address are dropped.
    async fn handle_frame(&mut self, inbound: Inbound) {
        let Inbound { frame, addr } = inbound;
        let sender = frame.sender_id.clone();

        if let FrameBody::Authentication(auth) = &frame.body {
            if sender == PROXY_ID {
                self.handle_proxy_response(auth);
                return;
            }

            let newly = !self.dispatcher.peers().is_authorized(&sender);
            let proxy_ready = self.proxy_ready();
            let response = self
                .dispatcher
                .peers_mut()
                .authenticate(&sender, &auth.password, proxy_ready);

            if response.response == AuthResponse::Connected && newly {
                self.recent.forget(&sender);
                self.heartbeat.lock().await.track(sender.clone());
                self.transport.bind_peer(sender.clone(), addr);
            }
            self.transport.send_to(
                Frame::new(FrameBody::Authentication(response), SERVER_ID, sender),
                addr,
            );
            return;
        }

        if !self.dispatcher.peers().is_authorized(&sender) {
            debug!(
                "Dropping {:?} from unauthorized {}",
                frame.frame_type(),
                sender
            );
            return;
        }
        if let Some(bound) = self.transport.peer_addr(&sender).await {
            if bound != addr {
                warn!("Dropping frame claiming to be {} from {}", sender, addr);
                return;
            }
        }

        if frame.important {
            self.transport.acknowledge(&frame);
            if !self.recent.first_delivery(&sender, frame.frame_id) {
                debug!("Duplicate frame #{} from {}", frame.frame_id, sender);
                return;
            }
        }

        match frame.body {
            FrameBody::Handshake { display_name } => {
                let effects = self.dispatcher.handshake(&sender, &display_name);
                self.apply(effects).await;
            }
            FrameBody::Ping => {
                self.transport
                    .send(Frame::new(FrameBody::Ping, SERVER_ID, sender));
            }
            FrameBody::Heartbeat => {
                self.heartbeat.lock().await.heard_from(&sender);
            }
            FrameBody::Acknowledged { acked_frame_id } => {
                self.transport.handle_ack(acked_frame_id, &sender).await;
            }
            FrameBody::Rpc(rpc) => match self.dispatcher.handle_rpc(&sender, rpc) {
                Ok(effects) => self.apply(effects).await,
                Err(e) => debug!("Dropped RPC from {}: {}", sender, e),
            },
            FrameBody::Authentication(_) => {}
        }
    }

    /// Turns dispatcher effects into queued frames, in order
    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { target, rpc } => {
                    self.transport.send(Frame::rpc(rpc, SERVER_ID, target));
                }
                Effect::Disconnected { peer_id } => {
                    self.heartbeat.lock().await.untrack(&peer_id);
                    self.recent.forget(&peer_id);
                    self.transport.forget_peer(peer_id);
                }
            }
        }
    }

    async fn disconnect(&mut self, peer_id: &str, reason: &str) {
        let effects = self
            .dispatcher
            .disconnect_peer(peer_id, DisconnectType::Kick, reason);
        self.apply(effects).await;
    }

    /// Returns true when the loop should stop
    async fn handle_message(&mut self, message: ServerMessage) -> bool {
        match message {
            ServerMessage::PeerTimeout { peer_id } => {
                info!("{} timed out", peer_id);
                self.disconnect(&peer_id, LOST_CONNECTION).await;
            }
            ServerMessage::Kick { peer_id, reason } => {
                self.disconnect(&peer_id, &reason).await;
            }
            ServerMessage::Ban { peer_id, reason } => {
                self.dispatcher.peers_mut().ban(peer_id.clone(), reason.clone());
                self.disconnect(&peer_id, &reason).await;
            }
            ServerMessage::Spawn {
                prefab_index,
                reply,
            } => {
                let network_id = match self.dispatcher.spawn_entity(None, prefab_index, false) {
                    Ok((network_id, effects)) => {
                        self.apply(effects).await;
                        network_id
                    }
                    Err(e) => {
                        warn!("Server spawn failed: {}", e);
                        None
                    }
                };
                let _ = reply.send(network_id);
            }
            ServerMessage::Destroy { network_id } => {
                match self.dispatcher.destroy(None, network_id) {
                    Ok(effects) => self.apply(effects).await,
                    Err(e) => warn!("Server destroy failed: {}", e),
                }
            }
            ServerMessage::Update { rpc } => match self.dispatcher.update(None, rpc) {
                Ok(effects) => self.apply(effects).await,
                Err(e) => warn!("Server update failed: {}", e),
            },
            ServerMessage::Stop { reason } => {
                info!("Server stopping: {}", reason);
                let effects = self.dispatcher.disconnect_all(&reason);
                self.apply(effects).await;
                return true;
            }
        }
        false
    }

    /// Main session loop; returns after `stop` or when the relay never answers
    pub async fn run(mut self) -> Result<(), NetError> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let heartbeat_task = self.spawn_heartbeat(stop_rx);
        let mut proxy_retry = interval(self.config.proxy_retry_interval);

        info!("Server started successfully");

        let result = loop {
            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(TransportEvent::Received(inbound)) => {
                            self.handle_frame(inbound).await;
                        }
                        Some(TransportEvent::Unreachable(peer_id)) => {
                            info!("{} unreachable", peer_id);
                            self.disconnect(&peer_id, LOST_CONNECTION).await;
                        }
                        None => break Ok(()),
                    }
                },

                message = self.server_rx.recv() => {
                    match message {
                        Some(message) => {
                            if self.handle_message(message).await {
                                break Ok(());
                            }
                        }
                        None => break Ok(()),
                    }
                },

                _ = proxy_retry.tick(), if self.proxy_pending() => {
                    if let Err(e) = self.retry_proxy() {
                        break Err(e);
                    }
                },
            }
        };

        // Periodic tasks stop before the socket is released
        let _ = stop_tx.send(true);
        if let Err(e) = heartbeat_task.await {
            error!("Heartbeat task ended abnormally: {}", e);
        }
        self.transport.shutdown().await;
        info!("Server shut down");
        result
    }
}
