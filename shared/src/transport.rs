//! UDP transport: socket ownership, the receive and send loops, and the reliability sweep
//!
//! The receive loop only decodes and forwards; frames reach the session through the event
//! channel returned by [`Transport::listen`] or [`Transport::dial`], and the session loop is
//! the one that runs handlers. Outgoing frames go through an unbounded queue drained by the
//! send loop, which stamps frame ids and records important frames for retry.
//!
//! A listening transport only reaches peers the session bound with [`Transport::bind_peer`].
//! Datagrams never bind their source address on their own; a sender id is just a claim
//! until the session has admitted it.

use crate::codec;
use crate::config::ReliabilityConfig;
use crate::frame::{Frame, FrameBody};
use crate::reliability::PendingAcks;
use crate::{NetError, PeerId};
use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

const RECV_BUFFER_SIZE: usize = 2048;

/// Addresses of admitted peers, keyed by peer id
pub type AddressBook = Arc<RwLock<HashMap<PeerId, SocketAddr>>>;

#[derive(Debug)]
pub struct Inbound {
    pub frame: Frame,
    pub addr: SocketAddr,
}

/// Messages from the transport tasks to the session loop
#[derive(Debug)]
pub enum TransportEvent {
    Received(Inbound),
    /// An important frame to this peer ran out of retries
    Unreachable(PeerId),
}

#[derive(Debug)]
enum Outbound {
    Frame(Frame),
    /// Sent to this address without consulting the address book, never retried
    SendTo(Frame, SocketAddr),
    /// Resend of a frame that is already in the pending table
    Retry(Frame),
    Bind(PeerId, SocketAddr),
    Forget(PeerId),
    Close,
}

/// Where the send loop delivers frames
#[derive(Debug, Clone, Copy)]
enum Route {
    /// Everything goes to the connected remote
    Connected,
    /// Targets are looked up in the address book
    Lookup,
}

/// Cloneable, non-blocking handle onto the send queue
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl FrameSender {
    /// Queues a frame for its own `target_id`; false once the transport is gone
    pub fn send(&self, frame: Frame) -> bool {
        self.tx.send(Outbound::Frame(frame)).is_ok()
    }

    pub fn enqueue_send(&self, mut frame: Frame, target: impl Into<PeerId>) -> bool {
        frame.target_id = target.into();
        self.send(frame)
    }
}

pub struct Transport {
    socket: Arc<UdpSocket>,
    local_id: PeerId,
    addresses: AddressBook,
    pending: Arc<Mutex<PendingAcks>>,
    outbound: FrameSender,
    stop_tx: watch::Sender<bool>,
    receiver: JoinHandle<()>,
    sender: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl Transport {
    /// Binds a listening socket; peers are reached through the address book
    pub async fn listen(
        addr: SocketAddr,
        local_id: impl Into<PeerId>,
        config: &ReliabilityConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), NetError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| NetError::BindFailure {
                addr: addr.to_string(),
                source,
            })?;
        info!("Listening on {}", socket.local_addr()?);

        Ok(Self::start(socket, local_id.into(), Route::Lookup, config))
    }

    /// Binds an ephemeral socket connected to `remote`; every frame goes there
    pub async fn dial(
        remote: SocketAddr,
        local_id: impl Into<PeerId>,
        config: &ReliabilityConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), NetError> {
        let local: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| NetError::BindFailure {
                addr: local.to_string(),
                source,
            })?;
        socket.connect(remote).await?;
        info!("Dialing {} from {}", remote, socket.local_addr()?);

        Ok(Self::start(socket, local_id.into(), Route::Connected, config))
    }

    fn start(
        socket: UdpSocket,
        local_id: PeerId,
        route: Route,
        config: &ReliabilityConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let socket = Arc::new(socket);
        let addresses: AddressBook = Arc::new(RwLock::new(HashMap::new()));
        let pending = Arc::new(Mutex::new(PendingAcks::new(config)));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let outbound = FrameSender { tx: outbound_tx };

        let receiver = Self::spawn_receiver(Arc::clone(&socket), event_tx.clone());
        let sender = Self::spawn_sender(
            Arc::clone(&socket),
            route,
            Arc::clone(&addresses),
            Arc::clone(&pending),
            outbound_rx,
        );
        let sweeper = Self::spawn_sweeper(
            Arc::clone(&pending),
            outbound.clone(),
            event_tx,
            config.sweep_interval,
            stop_rx,
        );

        let transport = Transport {
            socket,
            local_id,
            addresses,
            pending,
            outbound,
            stop_tx,
            receiver,
            sender,
            sweeper,
        };
        (transport, event_rx)
    }

    /// Continuously reads datagrams and forwards decoded frames with their source address
    fn spawn_receiver(
        socket: Arc<UdpSocket>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buffer = [0u8; RECV_BUFFER_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let frame = match codec::decode(&buffer[..len]) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!("Dropping frame from {}: {}", addr, e);
                                continue;
                            }
                        };

                        trace!(
                            "Received {:?} #{} from {} ({})",
                            frame.frame_type(),
                            frame.frame_id,
                            frame.sender_id,
                            addr
                        );
                        if events
                            .send(TransportEvent::Received(Inbound { frame, addr }))
                            .is_err()
                        {
                            debug!("Session loop gone, stopping receiver");
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        })
    }

    /// Drains the send queue in order until it is closed
    fn spawn_sender(
        socket: Arc<UdpSocket>,
        route: Route,
        addresses: AddressBook,
        pending: Arc<Mutex<PendingAcks>>,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut next_frame_id: i32 = 1;

            while let Some(message) = outbound.recv().await {
                let (frame, first_send, direct) = match message {
                    Outbound::Frame(mut frame) => {
                        stamp(&mut frame, &mut next_frame_id);
                        (frame, true, None)
                    }
                    Outbound::SendTo(mut frame, addr) => {
                        stamp(&mut frame, &mut next_frame_id);
                        (frame, false, Some(addr))
                    }
                    Outbound::Retry(frame) => (frame, false, None),
                    Outbound::Bind(peer, addr) => {
                        if let Route::Lookup = route {
                            debug!("Bound {} to {}", peer, addr);
                            addresses.write().await.insert(peer, addr);
                        }
                        continue;
                    }
                    Outbound::Forget(peer) => {
                        let dropped = pending.lock().await.forget_peer(&peer);
                        addresses.write().await.remove(&peer);
                        debug!("Forgot {} ({} pending frames dropped)", peer, dropped);
                        continue;
                    }
                    Outbound::Close => break,
                };

                let bytes = match codec::encode(&frame) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!("Failed to encode frame for {}: {}", frame.target_id, e);
                        continue;
                    }
                };

                let destination = match (route, direct) {
                    (Route::Connected, _) => None,
                    (Route::Lookup, Some(addr)) => Some(addr),
                    (Route::Lookup, None) => {
                        match addresses.read().await.get(&frame.target_id).copied() {
                            Some(addr) => Some(addr),
                            None => {
                                trace!("No address for {}, skipping", frame.target_id);
                                continue;
                            }
                        }
                    }
                };

                // Tracked before the datagram leaves so a fast ack always finds its entry
                if first_send && frame.important {
                    pending
                        .lock()
                        .await
                        .track(frame.clone(), std::time::Instant::now());
                }

                let result = match destination {
                    Some(addr) => socket.send_to(&bytes, addr).await,
                    None => socket.send(&bytes).await,
                };
                if let Err(e) = result {
                    error!("Failed to send frame to {}: {}", frame.target_id, e);
                }
            }
        })
    }

    /// Periodically resends overdue important frames and reports exhausted peers
    fn spawn_sweeper(
        pending: Arc<Mutex<PendingAcks>>,
        outbound: FrameSender,
        events: mpsc::UnboundedSender<TransportEvent>,
        period: Duration,
        mut stop_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
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

                let sweep = pending.lock().await.sweep(std::time::Instant::now());

                for frame in sweep.resend {
                    debug!("Resending frame #{} to {}", frame.frame_id, frame.target_id);
                    if outbound.tx.send(Outbound::Retry(frame)).is_err() {
                        return;
                    }
                }
                for peer in sweep.unreachable {
                    warn!("{} stopped acknowledging frames", peer);
                    if events.send(TransportEvent::Unreachable(peer)).is_err() {
                        return;
                    }
                }
            }
        })
    }

    pub fn sender(&self) -> FrameSender {
        self.outbound.clone()
    }

    /// Queues a frame for its own `target_id`
    pub fn send(&self, frame: Frame) {
        if !self.outbound.send(frame) {
            error!("Failed to queue frame: send loop closed");
        }
    }

    pub fn enqueue_send(&self, frame: Frame, target: impl Into<PeerId>) {
        if !self.outbound.enqueue_send(frame, target) {
            error!("Failed to queue frame: send loop closed");
        }
    }

    /// Sends a frame straight to `addr`, for peers that are not bound yet
    ///
    /// The frame is never tracked for retry. A dialed transport ignores `addr` and sends
    /// to its connected remote.
    pub fn send_to(&self, frame: Frame, addr: SocketAddr) {
        if self.outbound.tx.send(Outbound::SendTo(frame, addr)).is_err() {
            error!("Failed to queue frame: send loop closed");
        }
    }

    /// Makes `peer` reachable at `addr`, replacing any earlier address
    ///
    /// Applied in queue order: frames queued before the bind still use the old address.
    pub fn bind_peer(&self, peer: impl Into<PeerId>, addr: SocketAddr) {
        let _ = self.outbound.tx.send(Outbound::Bind(peer.into(), addr));
    }

    /// Answers an important frame with an `Acknowledged` carrying its id
    pub fn acknowledge(&self, frame: &Frame) {
        let ack = Frame::new(
            FrameBody::Acknowledged {
                acked_frame_id: frame.frame_id,
            },
            self.local_id.clone(),
            frame.sender_id.clone(),
        );
        self.send(ack);
    }

    /// Clears the pending entry for `frame_id` if it was sent to `from`
    ///
    /// False when nothing addressed to `from` was waiting on that id.
    pub async fn handle_ack(&self, frame_id: i32, from: &str) -> bool {
        self.pending.lock().await.acknowledge(frame_id, from)
    }

    /// Drops the peer's address and pending frames once everything queued before is sent
    pub fn forget_peer(&self, peer: impl Into<PeerId>) {
        let _ = self.outbound.tx.send(Outbound::Forget(peer.into()));
    }

    pub async fn peer_addr(&self, peer: &str) -> Option<SocketAddr> {
        self.addresses.read().await.get(peer).copied()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.socket.local_addr()?)
    }

    /// Stops the sweep, flushes the send queue, then stops reading from the socket
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.sweeper.await {
            error!("Reliability sweep ended abnormally: {}", e);
        }

        let _ = self.outbound.tx.send(Outbound::Close);
        if let Err(e) = self.sender.await {
            error!("Send loop ended abnormally: {}", e);
        }

        self.receiver.abort();
        let _ = self.receiver.await;
        debug!("Transport for {} closed", self.local_id);
    }
}

fn stamp(frame: &mut Frame, next_frame_id: &mut i32) {
    if !frame.is_assigned() {
        frame.frame_id = *next_frame_id;
        *next_frame_id = next_frame_id.checked_add(1).unwrap_or(1);
    }
}
