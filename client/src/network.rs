//! Client session loop
//!
//! Dials the server, authenticates with retries, announces itself with a handshake and
//! then mirrors what the server replicates. Local requests arrive through a
//! [`ClientHandle`] so the caller never touches the session state directly.

use crate::connection::{ConnectionState, Dialer};
use crate::replica::{Replica, ReplicaEvent};
use log::{debug, error, info, warn};
use shared::config::ClientConfig;
use shared::frame::{Authentication, Frame, FrameBody};
use shared::heartbeat::HeartbeatMonitor;
use shared::host::EntityHost;
use shared::reliability::RecentFrames;
use shared::rpc::{DisconnectType, PlayerInfo, RpcEnvelope, Transform, UNASSIGNED_NETWORK_ID};
use shared::transport::{Transport, TransportEvent};
use shared::{NetError, LOST_CONNECTION, SERVER_ID};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, interval_at, Instant};

/// How a session that got past authentication ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Left on request of the local caller
    Left,
    /// The server removed this client
    Kicked { reason: String },
    /// Heartbeats or acknowledgements stopped arriving
    LostConnection,
}

#[derive(Debug)]
pub enum ClientCommand {
    Spawn {
        prefab_index: i32,
        request_authority: bool,
    },
    Destroy {
        network_id: i32,
    },
    Update {
        rpc: RpcEnvelope,
    },
    Disconnect {
        reason: String,
    },
}

/// Cloneable control surface for a running client
#[derive(Debug, Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<ClientCommand>,
    state: watch::Receiver<ConnectionState>,
    ping: watch::Receiver<Option<Duration>>,
}

impl ClientHandle {
    fn post(&self, command: ClientCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    /// Asks the server to spawn an entity; the id arrives with the replicated spawn
    pub fn spawn(&self, prefab_index: i32, request_authority: bool) -> bool {
        self.post(ClientCommand::Spawn {
            prefab_index,
            request_authority,
        })
    }

    pub fn destroy(&self, network_id: i32) -> bool {
        self.post(ClientCommand::Destroy { network_id })
    }

    pub fn send_transform(&self, network_id: i32, transform: Transform) -> bool {
        self.post(ClientCommand::Update {
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
        self.post(ClientCommand::Update {
            rpc: RpcEnvelope::custom(network_id, kind, payload, important),
        })
    }

    pub fn disconnect(&self, reason: impl Into<String>) -> bool {
        self.post(ClientCommand::Disconnect {
            reason: reason.into(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Round trip of the latest answered ping
    pub fn last_ping(&self) -> Option<Duration> {
        *self.ping.borrow()
    }

    /// Waits until the session is established; false if it failed or ended first
    pub async fn established(&self) -> bool {
        let mut state = self.state.clone();
        loop {
            match *state.borrow_and_update() {
                ConnectionState::Established => return true,
                ConnectionState::Error => return false,
                _ => {}
            }
            if state.changed().await.is_err() {
                return false;
            }
        }
    }
}

/// Dialing side of a session
pub struct Client<H: EntityHost> {
    config: ClientConfig,
    transport: Transport,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    dialer: Dialer,
    replica: Replica,
    host: H,
    heartbeat: HeartbeatMonitor,
    recent: RecentFrames,
    ping_sent_at: Option<Instant>,

    // Communication channels
    command_tx: mpsc::UnboundedSender<ClientCommand>,
    command_rx: mpsc::UnboundedReceiver<ClientCommand>,
    state_tx: watch::Sender<ConnectionState>,
    ping_tx: watch::Sender<Option<Duration>>,
}

impl<H: EntityHost> Client<H> {
    /// Opens the socket towards the server; authentication starts with `run`
    pub async fn connect(config: ClientConfig, host: H) -> Result<Self, NetError> {
        let (transport, events) =
            Transport::dial(config.server_addr, config.peer_id.clone(), &config.reliability)
                .await?;
        info!("Dialing {} as {}", config.server_addr, config.peer_id);

        let mut dialer = Dialer::new(config.connect_attempts);
        dialer.open();

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(dialer.state());
        let (ping_tx, _) = watch::channel(None);

        Ok(Client {
            replica: Replica::new(config.peer_id.clone()),
            heartbeat: HeartbeatMonitor::new(&config.heartbeat),
            config,
            transport,
            events,
            dialer,
            host,
            recent: RecentFrames::default(),
            ping_sent_at: None,
            command_tx,
            command_rx,
            state_tx,
            ping_tx,
        })
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            tx: self.command_tx.clone(),
            state: self.state_tx.subscribe(),
            ping: self.ping_tx.subscribe(),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        self.transport.local_addr()
    }

    pub fn state(&self) -> ConnectionState {
        self.dialer.state()
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(self.dialer.state());
    }

    fn send_to_server(&self, body: FrameBody, important: bool) {
        let frame =
            Frame::new(body, self.config.peer_id.clone(), SERVER_ID).with_important(important);
        self.transport.send(frame);
    }

    fn send_rpc(&self, rpc: RpcEnvelope) {
        self.transport
            .send(Frame::rpc(rpc, self.config.peer_id.clone(), SERVER_ID));
    }

    fn attempt_authentication(&mut self) -> Result<(), NetError> {
        let result = self.dialer.next_attempt();
        self.publish_state();

        if result? {
            debug!("Authenticating (attempt {})", self.dialer.attempts());
            self.send_to_server(
                FrameBody::Authentication(Authentication::request(self.config.password.clone())),
                false,
            );
        }
        Ok(())
    }

    fn on_authentication(&mut self, auth: &Authentication) -> Result<(), NetError> {
        let result = self.dialer.on_response(auth);
        self.publish_state();

        if result? {
            info!("Connected to server");
            self.heartbeat.track(SERVER_ID);
            self.recent.forget(SERVER_ID);
            self.send_to_server(
                FrameBody::Handshake {
                    display_name: self.config.display_name.clone(),
                },
                true,
            );
        }
        Ok(())
    }

    /// Processes one inbound frame; returns how the session ended, if it did
    async fn handle_frame(&mut self, frame: Frame) -> Result<Option<SessionEnd>, NetError> {
        if frame.sender_id != SERVER_ID {
            debug!("Ignoring frame from {}", frame.sender_id);
            return Ok(None);
        }

        if let FrameBody::Authentication(auth) = &frame.body {
            self.on_authentication(auth)?;
            return Ok(None);
        }

        if !self.dialer.is_established() {
            debug!("Ignoring {:?} before authentication", frame.frame_type());
            return Ok(None);
        }

        if frame.important {
            self.transport.acknowledge(&frame);
            if !self.recent.first_delivery(SERVER_ID, frame.frame_id) {
                debug!("Duplicate frame #{}", frame.frame_id);
                return Ok(None);
            }
        }

        match frame.body {
            FrameBody::Heartbeat => {
                self.heartbeat.heard_from(SERVER_ID);
            }
            FrameBody::Ping => {
                if let Some(sent) = self.ping_sent_at.take() {
                    let rtt = sent.elapsed();
                    debug!("Ping {}ms", rtt.as_millis());
                    self.ping_tx.send_replace(Some(rtt));
                }
            }
            FrameBody::Acknowledged { acked_frame_id } => {
                self.transport.handle_ack(acked_frame_id, SERVER_ID).await;
            }
            FrameBody::Rpc(rpc) => {
                if let ReplicaEvent::Removed {
                    disconnect_type,
                    reason,
                } = self.replica.apply(rpc, &mut self.host)
                {
                    info!("Removed by server ({:?}): {}", disconnect_type, reason);
                    if reason == LOST_CONNECTION {
                        return Ok(Some(SessionEnd::LostConnection));
                    }
                    return Ok(Some(SessionEnd::Kicked { reason }));
                }
            }
            FrameBody::Handshake { .. } | FrameBody::Authentication(_) => {}
        }
        Ok(None)
    }

    /// Returns the end of the session when the command closes it
    fn handle_command(&mut self, command: ClientCommand) -> Option<SessionEnd> {
        if let ClientCommand::Disconnect { reason } = command {
            if self.dialer.is_established() {
                let me = PlayerInfo {
                    peer_id: self.config.peer_id.clone(),
                    display_name: self.config.display_name.clone(),
                    network_id: self
                        .replica
                        .own_network_id()
                        .unwrap_or(UNASSIGNED_NETWORK_ID),
                };
                self.send_rpc(RpcEnvelope::player_disconnected(
                    me,
                    DisconnectType::Request,
                    reason,
                ));
            }
            return Some(SessionEnd::Left);
        }

        if !self.dialer.is_established() {
            warn!("Not connected, dropping {:?}", command);
            return None;
        }

        let rpc = match command {
            ClientCommand::Spawn {
                prefab_index,
                request_authority,
            } => RpcEnvelope::spawn_request(prefab_index, request_authority),
            ClientCommand::Destroy { network_id } => RpcEnvelope::destroy(network_id),
            ClientCommand::Update { rpc } => {
                if !self.replica.has_authority(rpc.network_id) {
                    debug!("No authority over {}, update not sent", rpc.network_id);
                    return None;
                }
                rpc
            }
            ClientCommand::Disconnect { .. } => return None,
        };
        self.send_rpc(rpc);
        None
    }

    fn heartbeat_tick(&mut self) -> Option<SessionEnd> {
        let tick = self.heartbeat.tick();
        if !tick.timed_out.is_empty() {
            warn!("Server stopped answering heartbeats");
            return Some(SessionEnd::LostConnection);
        }
        if !tick.due.is_empty() {
            self.send_to_server(FrameBody::Heartbeat, false);
        }
        None
    }

    fn ping(&mut self) {
        self.ping_sent_at = Some(Instant::now());
        self.send_to_server(FrameBody::Ping, false);
    }

    /// Main session loop
    ///
    /// Fails when authentication is rejected or never answered; otherwise returns how
    /// the established session ended.
    pub async fn run(mut self) -> Result<SessionEnd, NetError> {
        let heartbeat_period = self.config.heartbeat.interval;
        let ping_period = self.config.ping_interval;
        let mut auth_retry = interval(self.config.connect_retry_interval);
        let mut heartbeat = interval_at(Instant::now() + heartbeat_period, heartbeat_period);
        let mut ping = interval_at(Instant::now() + ping_period, ping_period);

        let result = loop {
            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(TransportEvent::Received(inbound)) => {
                            match self.handle_frame(inbound.frame).await {
                                Ok(Some(end)) => break Ok(end),
                                Ok(None) => {}
                                Err(e) => break Err(e),
                            }
                        }
                        Some(TransportEvent::Unreachable(peer_id)) => {
                            warn!("{} unreachable", peer_id);
                            break Ok(SessionEnd::LostConnection);
                        }
                        None => break Ok(SessionEnd::LostConnection),
                    }
                },

                Some(command) = self.command_rx.recv() => {
                    if let Some(end) = self.handle_command(command) {
                        break Ok(end);
                    }
                },

                _ = auth_retry.tick(), if !self.dialer.is_established() => {
                    if let Err(e) = self.attempt_authentication() {
                        break Err(e);
                    }
                },

                _ = heartbeat.tick(), if self.dialer.is_established() => {
                    if let Some(end) = self.heartbeat_tick() {
                        break Ok(end);
                    }
                },

                _ = ping.tick(), if self.dialer.is_established() => {
                    self.ping();
                },
            }
        };

        match &result {
            Ok(end) => info!("Session ended: {:?}", end),
            Err(e) => error!("Session failed: {}", e),
        }

        self.dialer.close();
        self.publish_state();
        self.transport.shutdown().await;
        result
    }
}
