//! Frame codec
//!
//! A frame is the base envelope `{tag: u8, frame_id: i32, sender_id, target_id,
//! important: bool}` followed by the fields of the type named by the tag. RPC payloads
//! repeat the pattern with `{network_id: i32, kind: u8, important: bool}` followed by the
//! kind's fields. Decoding reads the envelope, matches on the tag byte, then reads the
//! payload; anything left over is an error.

use crate::frame::{Authentication, Frame, FrameBody, FrameHeader, FrameType};
use crate::rpc::{
    AuthorityFlags, DisconnectType, PlayerInfo, RpcBody, RpcEnvelope, RpcKind, Transform,
    CUSTOM_RPC_BASE,
};
use crate::NetError;
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Largest datagram either side reads or writes
pub const MAX_FRAME_SIZE: usize = 2048;

#[derive(Serialize, Deserialize)]
struct WireHeader {
    tag: u8,
    frame_id: i32,
    sender_id: String,
    target_id: String,
    important: bool,
}

#[derive(Serialize, Deserialize)]
struct WireRpcHeader {
    network_id: i32,
    kind: u8,
    important: bool,
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_FRAME_SIZE as u64)
}

fn put<T: Serialize + ?Sized>(buf: &mut Vec<u8>, value: &T) -> Result<(), NetError> {
    wire_options().serialize_into(&mut *buf, value)?;
    Ok(())
}

fn take<T: DeserializeOwned>(reader: &mut &[u8]) -> Result<T, NetError> {
    Ok(wire_options().deserialize_from(reader)?)
}

/// Serializes a frame into a datagram
pub fn encode(frame: &Frame) -> Result<Vec<u8>, NetError> {
    let mut buf = Vec::with_capacity(64);
    put(
        &mut buf,
        &WireHeader {
            tag: frame.frame_type().into(),
            frame_id: frame.frame_id,
            sender_id: frame.sender_id.clone(),
            target_id: frame.target_id.clone(),
            important: frame.important,
        },
    )?;

    match &frame.body {
        FrameBody::Handshake { display_name } => put(&mut buf, display_name)?,
        FrameBody::Ping | FrameBody::Heartbeat => {}
        FrameBody::Authentication(auth) => put(&mut buf, auth)?,
        FrameBody::Rpc(rpc) => encode_rpc_into(&mut buf, rpc)?,
        FrameBody::Acknowledged { acked_frame_id } => put(&mut buf, acked_frame_id)?,
    }

    if buf.len() > MAX_FRAME_SIZE {
        return Err(NetError::MalformedFrame(format!(
            "frame of {} bytes exceeds {} byte limit",
            buf.len(),
            MAX_FRAME_SIZE
        )));
    }
    Ok(buf)
}

fn encode_rpc_into(buf: &mut Vec<u8>, rpc: &RpcEnvelope) -> Result<(), NetError> {
    if let RpcBody::Custom { kind, .. } = &rpc.body {
        if *kind < CUSTOM_RPC_BASE {
            return Err(NetError::MalformedFrame(format!(
                "custom rpc kind {} collides with a reserved kind",
                kind
            )));
        }
    }

    put(
        buf,
        &WireRpcHeader {
            network_id: rpc.network_id,
            kind: rpc.kind().into(),
            important: rpc.important,
        },
    )?;

    match &rpc.body {
        RpcBody::Spawn {
            prefab_index,
            request_authority,
        } => put(buf, &(prefab_index, request_authority)),
        RpcBody::Authorization(flags) => put(buf, flags),
        RpcBody::Destroy => Ok(()),
        RpcBody::Transform(transform) => put(buf, transform),
        RpcBody::PlayerConnected(player) => put(buf, player),
        RpcBody::PlayerDisconnected {
            player,
            disconnect_type,
            reason,
        } => put(buf, &(player, disconnect_type, reason)),
        RpcBody::Custom { payload, .. } => put(buf, payload),
    }
}

fn read_header(reader: &mut &[u8]) -> Result<FrameHeader, NetError> {
    let wire: WireHeader = take(reader)?;
    Ok(FrameHeader {
        frame_type: FrameType::try_from(wire.tag)?,
        frame_id: wire.frame_id,
        sender_id: wire.sender_id,
        target_id: wire.target_id,
        important: wire.important,
    })
}

/// Reads only the base envelope, leaving the body uninterpreted
pub fn decode_header(bytes: &[u8]) -> Result<FrameHeader, NetError> {
    let mut reader = bytes;
    read_header(&mut reader)
}

/// Parses a datagram into a typed frame
pub fn decode(bytes: &[u8]) -> Result<Frame, NetError> {
    let mut reader = bytes;
    let header = read_header(&mut reader)?;

    let body = match header.frame_type {
        FrameType::Handshake => FrameBody::Handshake {
            display_name: take(&mut reader)?,
        },
        FrameType::Ping => FrameBody::Ping,
        FrameType::Authentication => {
            FrameBody::Authentication(take::<Authentication>(&mut reader)?)
        }
        FrameType::Rpc => FrameBody::Rpc(decode_rpc_from(&mut reader)?),
        FrameType::Heartbeat => FrameBody::Heartbeat,
        FrameType::Acknowledged => FrameBody::Acknowledged {
            acked_frame_id: take(&mut reader)?,
        },
    };

    if !reader.is_empty() {
        return Err(NetError::MalformedFrame(format!(
            "{} trailing bytes after {:?} frame",
            reader.len(),
            header.frame_type
        )));
    }

    Ok(Frame {
        frame_id: header.frame_id,
        sender_id: header.sender_id,
        target_id: header.target_id,
        important: header.important,
        body,
    })
}

fn decode_rpc_from(reader: &mut &[u8]) -> Result<RpcEnvelope, NetError> {
    let wire: WireRpcHeader = take(reader)?;
    let body = match RpcKind::try_from(wire.kind)? {
        RpcKind::Spawn => {
            let (prefab_index, request_authority): (i32, bool) = take(reader)?;
            RpcBody::Spawn {
                prefab_index,
                request_authority,
            }
        }
        RpcKind::Authorization => RpcBody::Authorization(take::<AuthorityFlags>(reader)?),
        RpcKind::Destroy => RpcBody::Destroy,
        RpcKind::Transform => RpcBody::Transform(take::<Transform>(reader)?),
        RpcKind::PlayerConnected => RpcBody::PlayerConnected(take::<PlayerInfo>(reader)?),
        RpcKind::PlayerDisconnected => {
            let (player, disconnect_type, reason): (PlayerInfo, DisconnectType, String) =
                take(reader)?;
            RpcBody::PlayerDisconnected {
                player,
                disconnect_type,
                reason,
            }
        }
        RpcKind::Custom(kind) => RpcBody::Custom {
            kind,
            payload: take(reader)?,
        },
    };

    Ok(RpcEnvelope {
        network_id: wire.network_id,
        important: wire.important,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::AuthResponse;
    use crate::SERVER_ID;
    use tokio_test::assert_err;

    fn sample_frames() -> Vec<Frame> {
        let player = PlayerInfo {
            peer_id: "alice".to_string(),
            display_name: "Alice".to_string(),
            network_id: 42,
        };
        vec![
            Frame::new(
                FrameBody::Handshake {
                    display_name: "Alice".to_string(),
                },
                "alice",
                SERVER_ID,
            ),
            Frame::new(FrameBody::Ping, "alice", SERVER_ID),
            Frame::new(
                FrameBody::Authentication(Authentication::request("hunter2")),
                "alice",
                SERVER_ID,
            ),
            Frame::new(
                FrameBody::Authentication(Authentication::response(
                    AuthResponse::Banned,
                    "cheating",
                )),
                SERVER_ID,
                "alice",
            ),
            Frame::rpc(RpcEnvelope::spawn(42, 0, true), SERVER_ID, "alice"),
            Frame::rpc(
                RpcEnvelope::transform(
                    42,
                    Transform {
                        position: [1.0, 2.0, 3.0],
                        rotation: [0.0, 90.0, 0.0],
                        scale: [1.0, 1.0, 1.0],
                    },
                ),
                "alice",
                SERVER_ID,
            ),
            Frame::rpc(RpcEnvelope::player_connected(player.clone()), SERVER_ID, "bob"),
            Frame::rpc(
                RpcEnvelope::player_disconnected(player, DisconnectType::Kick, "Lost Connection"),
                SERVER_ID,
                "bob",
            ),
            Frame::rpc(RpcEnvelope::custom(42, 120, vec![9, 8, 7], true), "alice", SERVER_ID),
            Frame::new(FrameBody::Heartbeat, SERVER_ID, "alice"),
            Frame::new(FrameBody::Acknowledged { acked_frame_id: 17 }, "alice", SERVER_ID),
        ]
    }

    #[test]
    fn test_encode_decode_preserves_frames() {
        for mut frame in sample_frames() {
            frame.frame_id = 99;
            let bytes = encode(&frame).unwrap();
            let decoded = decode(&bytes).unwrap();
            assert_eq!(decoded, frame);
            // Same schema, same bytes
            assert_eq!(encode(&decoded).unwrap(), bytes);
        }
    }

    #[test]
    fn test_tag_is_first_byte() {
        let frame = Frame::new(FrameBody::Heartbeat, SERVER_ID, "alice");
        let bytes = encode(&frame).unwrap();
        assert_eq!(bytes[0], u8::from(FrameType::Heartbeat));
    }

    #[test]
    fn test_decode_header_ignores_body() {
        let frame = Frame::rpc(RpcEnvelope::destroy(5), "alice", SERVER_ID).with_important(true);
        let bytes = encode(&frame).unwrap();
        let header = decode_header(&bytes).unwrap();
        assert_eq!(header.frame_type, FrameType::Rpc);
        assert_eq!(header.sender_id, "alice");
        assert_eq!(header.target_id, SERVER_ID);
        assert!(header.important);
    }

    #[test]
    fn test_empty_input_is_malformed() {
        let error = assert_err!(decode(&[]));
        assert!(matches!(error, NetError::MalformedFrame(_)));
    }

    #[test]
    fn test_truncated_input_is_malformed() {
        let frame = Frame::rpc(RpcEnvelope::transform(1, Transform::default()), "alice", SERVER_ID);
        let bytes = encode(&frame).unwrap();
        let error = assert_err!(decode(&bytes[..bytes.len() - 3]));
        assert!(matches!(error, NetError::MalformedFrame(_)));
    }

    #[test]
    fn test_unknown_tag_is_malformed() {
        let mut bytes = encode(&Frame::new(FrameBody::Ping, "alice", SERVER_ID)).unwrap();
        bytes[0] = 0xFF;
        let error = assert_err!(decode(&bytes));
        assert!(matches!(error, NetError::MalformedFrame(_)));
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let mut bytes = encode(&Frame::new(FrameBody::Ping, "alice", SERVER_ID)).unwrap();
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(NetError::MalformedFrame(_))));
    }

    #[test]
    fn test_unknown_auth_response_is_malformed() {
        let frame = Frame::new(
            FrameBody::Authentication(Authentication::response(AuthResponse::Connected, "")),
            SERVER_ID,
            "alice",
        );
        let mut bytes = encode(&frame).unwrap();
        // Layout: header, password (u64 len + 0 bytes), response byte, message
        let header_len = encode(&Frame::new(FrameBody::Ping, SERVER_ID, "alice"))
            .unwrap()
            .len();
        bytes[header_len + 8] = 200;
        assert!(matches!(decode(&bytes), Err(NetError::MalformedFrame(_))));
    }

    #[test]
    fn test_reserved_custom_kind_is_rejected_on_encode() {
        let frame = Frame::rpc(RpcEnvelope::custom(1, 4, vec![], false), "alice", SERVER_ID);
        assert!(matches!(encode(&frame), Err(NetError::MalformedFrame(_))));
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let frame = Frame::rpc(
            RpcEnvelope::custom(1, 150, vec![0u8; MAX_FRAME_SIZE], true),
            "alice",
            SERVER_ID,
        );
        assert_err!(encode(&frame));
    }

    #[test]
    fn test_absurd_length_prefix_does_not_allocate() {
        let mut bytes = vec![u8::from(FrameType::Handshake)];
        bytes.extend_from_slice(&7i32.to_le_bytes());
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        assert_err!(decode(&bytes));
    }
}
