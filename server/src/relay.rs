//! Frame relay for servers that cannot accept datagrams directly
//!
//! The relay learns `sender_id -> address` from traffic and forwards every datagram to
//! the address of its `target_id`. It reads only the base envelope; payloads are passed
//! through untouched. A server announces itself with an `Authentication` frame addressed
//! to the relay, which answers `Connected`.

use log::{debug, error, info, trace, warn};
use shared::codec;
use shared::frame::{AuthResponse, Authentication, Frame, FrameBody, FrameHeader, FrameType};
use shared::{NetError, PeerId, PROXY_ID, SERVER_ID};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

pub struct Relay {
    socket: UdpSocket,
    routes: HashMap<PeerId, SocketAddr>,
    next_frame_id: i32,
    forwarded: u64,
}

impl Relay {
    pub async fn bind(addr: SocketAddr) -> Result<Self, NetError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| NetError::BindFailure {
                addr: addr.to_string(),
                source,
            })?;
        info!("Relay listening on {}", socket.local_addr()?);

        Ok(Self {
            socket,
            routes: HashMap::new(),
            next_frame_id: 1,
            forwarded: 0,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.socket.local_addr()?)
    }

    /// Forwards frames until the task is dropped
    pub async fn run(mut self) {
        let mut buffer = [0u8; codec::MAX_FRAME_SIZE];

        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((len, addr)) => {
                    let datagram = buffer[..len].to_vec();
                    self.handle_datagram(&datagram, addr).await;
                }
                Err(e) => {
                    error!("Error receiving datagram: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    async fn handle_datagram(&mut self, datagram: &[u8], addr: SocketAddr) {
        let header = match codec::decode_header(datagram) {
            Ok(header) => header,
            Err(e) => {
                warn!("Dropping frame from {}: {}", addr, e);
                return;
            }
        };

        if header.frame_type == FrameType::Authentication {
            self.routes.insert(header.sender_id.clone(), addr);
        } else {
            self.routes.entry(header.sender_id.clone()).or_insert(addr);
        }

        if header.frame_type == FrameType::Authentication
            && header.sender_id == SERVER_ID
            && header.target_id == PROXY_ID
        {
            info!("Server registered from {}", addr);
            self.answer_server().await;
            return;
        }

        self.forward(&header, datagram).await;
    }

    async fn answer_server(&mut self) {
        let mut frame = Frame::new(
            FrameBody::Authentication(Authentication::response(AuthResponse::Connected, "")),
            PROXY_ID,
            SERVER_ID,
        );
        frame.frame_id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.checked_add(1).unwrap_or(1);

        match codec::encode(&frame) {
            Ok(bytes) => self.send_to(SERVER_ID, &bytes).await,
            Err(e) => error!("Failed to encode relay answer: {}", e),
        }
    }

    async fn forward(&mut self, header: &FrameHeader, datagram: &[u8]) {
        trace!(
            "Forwarding {:?} #{} {} -> {}",
            header.frame_type,
            header.frame_id,
            header.sender_id,
            header.target_id
        );
        self.send_to(&header.target_id, datagram).await;
    }

    async fn send_to(&mut self, target: &str, bytes: &[u8]) {
        let Some(addr) = self.routes.get(target).copied() else {
            debug!("No route to {}", target);
            return;
        };
        match self.socket.send_to(bytes, addr).await {
            Ok(_) => self.forwarded += 1,
            Err(e) => error!("Failed to send to {}: {}", target, e),
        }
    }

    pub fn route(&self, peer: &str) -> Option<SocketAddr> {
        self.routes.get(peer).copied()
    }

    /// Datagrams sent so far, relay answers included
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::config::ReliabilityConfig;
    use shared::transport::{Transport, TransportEvent};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    async fn next_frame(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Frame {
        loop {
            match timeout(Duration::from_secs(2), events.recv()).await {
                Ok(Some(TransportEvent::Received(inbound))) => return inbound.frame,
                Ok(Some(_)) => continue,
                Ok(None) => panic!("event channel closed"),
                Err(_) => panic!("timed out waiting for a frame"),
            }
        }
    }

    #[tokio::test]
    async fn test_relay_answers_server_and_forwards() {
        let relay = Relay::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let relay_addr = relay.local_addr().unwrap();
        let relay_task = tokio::spawn(relay.run());

        let config = ReliabilityConfig::default();
        let (server, mut server_events) = Transport::dial(relay_addr, SERVER_ID, &config)
            .await
            .unwrap();
        server.send(Frame::new(
            FrameBody::Authentication(Authentication::request("")),
            SERVER_ID,
            PROXY_ID,
        ));

        let answer = next_frame(&mut server_events).await;
        assert_eq!(answer.sender_id, PROXY_ID);
        match answer.body {
            FrameBody::Authentication(auth) => assert_eq!(auth.response, AuthResponse::Connected),
            other => panic!("unexpected body {:?}", other),
        }

        let (client, mut client_events) = Transport::dial(relay_addr, "alice", &config)
            .await
            .unwrap();
        client.send(Frame::new(FrameBody::Ping, "alice", SERVER_ID));
        let forwarded = next_frame(&mut server_events).await;
        assert_eq!(forwarded.sender_id, "alice");
        assert_eq!(forwarded.frame_type(), FrameType::Ping);

        server.send(Frame::new(FrameBody::Ping, SERVER_ID, "alice"));
        let back = next_frame(&mut client_events).await;
        assert_eq!(back.sender_id, SERVER_ID);

        client.shutdown().await;
        server.shutdown().await;
        relay_task.abort();
    }

    #[tokio::test]
    async fn test_unroutable_frame_dropped() {
        let mut relay = Relay::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let frame = Frame::new(FrameBody::Heartbeat, "alice", "nobody");
        let bytes = codec::encode(&frame).unwrap();
        let from: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        relay.handle_datagram(&bytes, from).await;

        assert_eq!(relay.route("alice"), Some(from));
        assert_eq!(relay.forwarded(), 0);
    }

    #[tokio::test]
    async fn test_garbage_is_ignored() {
        let mut relay = Relay::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        relay
            .handle_datagram(&[9, 9, 9], "127.0.0.1:40001".parse().unwrap())
            .await;
        assert_eq!(relay.forwarded(), 0);
    }
}
