use super::*;
use crate::transfer::InfoHash;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

#[test]
fn test_peer_id_generate() {
    let id1 = PeerId::generate();
    let id2 = PeerId::generate();
    assert_ne!(id1.0, id2.0);
    assert_eq!(&id1.0[..8], b"-RN0001-");
    assert_eq!(id1.client_id(), Some("RN0001"));
    assert!(id1.0[8..].iter().all(|b| b.is_ascii_alphanumeric()));
}

#[test]
fn test_bitfield_set_and_test() {
    let mut bf = Bitfield::new(100);
    assert!(!bf.test(0).unwrap());

    bf.set(0).unwrap();
    assert!(bf.test(0).unwrap());

    bf.set(99).unwrap();
    assert!(bf.test(99).unwrap());
    assert_eq!(bf.count(), 2);

    assert!(matches!(bf.test(100), Err(PeerError::PieceOutOfRange(100))));
    assert!(matches!(bf.set(100), Err(PeerError::PieceOutOfRange(100))));
}

#[test]
fn test_bitfield_from_bytes_round_trip() {
    let bytes = [0b1010_0000u8, 0b0100_0000];
    let bf = Bitfield::from_bytes(&bytes, 16).unwrap();
    assert!(bf.test(0).unwrap());
    assert!(!bf.test(1).unwrap());
    assert!(bf.test(2).unwrap());
    assert!(bf.test(9).unwrap());
    assert_eq!(bf.as_bytes(), &bytes);
    assert_eq!(bf.hex(), "a040");
}

#[test]
fn test_bitfield_rejects_wrong_length() {
    assert!(matches!(
        Bitfield::from_bytes(&[0x00], 16),
        Err(PeerError::InvalidBitfield(_))
    ));
    assert!(matches!(
        Bitfield::from_bytes(&[0x00, 0x00, 0x00], 16),
        Err(PeerError::InvalidBitfield(_))
    ));
}

#[test]
fn test_bitfield_rejects_pad_bits() {
    // 10 pieces leave 6 pad bits in the second byte.
    let ok = Bitfield::from_bytes(&[0xFF, 0b1100_0000], 10).unwrap();
    assert_eq!(ok.count(), 10);

    assert!(matches!(
        Bitfield::from_bytes(&[0xFF, 0b1100_0001], 10),
        Err(PeerError::InvalidBitfield(_))
    ));
}

#[test]
fn test_handshake_encode_decode() {
    let info_hash = InfoHash::from_bytes([1u8; 20]);
    let peer_id = PeerId::from_bytes([2u8; 20]);

    let handshake = Handshake::new(info_hash, peer_id);
    let encoded = handshake.encode();
    assert_eq!(encoded.len(), 68);
    assert_eq!(encoded[0], 19);
    assert_eq!(&encoded[1..20], b"BitTorrent protocol");
    assert_eq!(&encoded[20..28], &[0u8; 8]);

    let decoded = Handshake::decode(&encoded).unwrap();
    assert_eq!(decoded.info_hash, info_hash);
    assert_eq!(decoded.peer_id, peer_id);
}

#[test]
fn test_handshake_rejects_bad_protocol() {
    let mut encoded = Handshake::new(InfoHash::from_bytes([1u8; 20]), PeerId::generate())
        .encode()
        .to_vec();
    encoded[5] ^= 0xFF;
    assert!(matches!(
        Handshake::decode(&encoded),
        Err(PeerError::BadProtocol)
    ));

    encoded[5] ^= 0xFF;
    encoded[0] = 18;
    assert!(matches!(
        Handshake::decode(&encoded),
        Err(PeerError::BadProtocol)
    ));
}

#[test]
fn test_message_encode_decode() {
    let messages = vec![
        Message::KeepAlive,
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have { piece: 42 },
        Message::Bitfield(Bytes::from_static(&[0xA0, 0x40])),
        Message::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        },
        Message::Cancel {
            index: 1,
            begin: 0,
            length: 16384,
        },
        Message::Port(6881),
    ];

    for msg in messages {
        let encoded = msg.encode();
        let decoded = Message::decode(encoded).unwrap();

        match (&msg, &decoded) {
            (Message::KeepAlive, Message::KeepAlive) => {}
            (Message::Choke, Message::Choke) => {}
            (Message::Unchoke, Message::Unchoke) => {}
            (Message::Interested, Message::Interested) => {}
            (Message::NotInterested, Message::NotInterested) => {}
            (Message::Have { piece: p1 }, Message::Have { piece: p2 }) => {
                assert_eq!(p1, p2);
            }
            (Message::Bitfield(b1), Message::Bitfield(b2)) => {
                assert_eq!(b1, b2);
            }
            (
                Message::Request {
                    index: i1,
                    begin: b1,
                    length: l1,
                },
                Message::Request {
                    index: i2,
                    begin: b2,
                    length: l2,
                },
            ) => {
                assert_eq!((i1, b1, l1), (i2, b2, l2));
            }
            (
                Message::Cancel {
                    index: i1,
                    begin: b1,
                    length: l1,
                },
                Message::Cancel {
                    index: i2,
                    begin: b2,
                    length: l2,
                },
            ) => {
                assert_eq!((i1, b1, l1), (i2, b2, l2));
            }
            (Message::Port(p1), Message::Port(p2)) => {
                assert_eq!(p1, p2);
            }
            _ => panic!("message mismatch"),
        }
    }
}

#[test]
fn test_piece_message_round_trip() {
    let data = Bytes::from(vec![0x5A; 16384]);
    let msg = Message::Piece {
        index: 3,
        begin: 16384,
        data: data.clone(),
    };

    let encoded = msg.encode();
    assert_eq!(encoded.len(), 4 + 9 + 16384);

    match Message::decode(encoded).unwrap() {
        Message::Piece {
            index,
            begin,
            data: decoded,
        } => {
            assert_eq!(index, 3);
            assert_eq!(begin, 16384);
            assert_eq!(decoded, data);
        }
        other => panic!("expected piece message, got {:?}", other),
    }
}

#[test]
fn test_decode_rejects_inconsistent_bodies() {
    // have with a 2-byte body
    let frame = Bytes::from_static(&[0, 0, 0, 3, 4, 0, 0]);
    assert!(matches!(
        Message::decode(frame),
        Err(PeerError::ProtocolViolation(_))
    ));

    // request with an 8-byte body
    let mut bad_request = vec![0, 0, 0, 9, 6];
    bad_request.extend_from_slice(&[0u8; 8]);
    assert!(matches!(
        Message::decode(Bytes::from(bad_request)),
        Err(PeerError::ProtocolViolation(_))
    ));

    // piece with a 4-byte body
    let frame = Bytes::from_static(&[0, 0, 0, 5, 7, 0, 0, 0, 0]);
    assert!(matches!(
        Message::decode(frame),
        Err(PeerError::ProtocolViolation(_))
    ));

    // choke with a stray body byte
    let frame = Bytes::from_static(&[0, 0, 0, 2, 0, 0]);
    assert!(matches!(
        Message::decode(frame),
        Err(PeerError::ProtocolViolation(_))
    ));
}

#[test]
fn test_decode_unknown_message_id() {
    let frame = Bytes::from_static(&[0, 0, 0, 1, 20]);
    assert!(matches!(
        Message::decode(frame),
        Err(PeerError::UnknownMessageId(20))
    ));
}

#[tokio::test]
async fn test_frame_reader_reads_stream() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let mut reader = FrameReader::new(server, 18 * 1024);

    let mut client = client;
    client.write_all(&Message::KeepAlive.encode()).await.unwrap();
    client
        .write_all(&Message::Have { piece: 7 }.encode())
        .await
        .unwrap();
    client.write_all(&Message::Unchoke.encode()).await.unwrap();
    client.shutdown().await.unwrap();

    assert!(matches!(
        reader.read_frame().await.unwrap(),
        Some(Message::KeepAlive)
    ));
    assert!(matches!(
        reader.read_frame().await.unwrap(),
        Some(Message::Have { piece: 7 })
    ));
    assert!(matches!(
        reader.read_frame().await.unwrap(),
        Some(Message::Unchoke)
    ));
    // Clean close at a frame boundary.
    assert!(reader.read_frame().await.unwrap().is_none());
}

#[tokio::test]
async fn test_frame_reader_rejects_oversized_length() {
    let (client, server) = tokio::io::duplex(1024);
    let mut reader = FrameReader::new(server, 18 * 1024);

    let mut client = client;
    client
        .write_all(&(1024u32 * 1024).to_be_bytes())
        .await
        .unwrap();

    assert!(matches!(
        reader.read_frame().await,
        Err(PeerError::FrameTooLarge(_))
    ));
}

#[tokio::test]
async fn test_frame_reader_eof_mid_frame() {
    let (client, server) = tokio::io::duplex(1024);
    let mut reader = FrameReader::new(server, 18 * 1024);

    let mut client = client;
    // Declare 5 payload bytes but deliver only 2.
    client.write_all(&[0, 0, 0, 5, 4, 0]).await.unwrap();
    client.shutdown().await.unwrap();

    assert!(matches!(
        reader.read_frame().await,
        Err(PeerError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_streaming_handshake_event_order() {
    let info_hash = InfoHash::from_bytes([7u8; 20]);
    let peer_id = PeerId::from_bytes(*b"-XX0000-BBBBBBBBBBBB");
    let encoded = Handshake::new(info_hash, peer_id).encode();

    let (mut client, server) = tokio::io::duplex(256);
    let (events_tx, mut events_rx) = mpsc::channel(2);
    let task = tokio::spawn(handshake::read_streaming(server, events_tx));

    // Only the prefix: the info hash event must arrive without the peer ID.
    client.write_all(&encoded[..48]).await.unwrap();
    match events_rx.recv().await.unwrap() {
        HandshakeEvent::InfoHash(ih) => assert_eq!(ih, info_hash),
        other => panic!("expected info hash event, got {:?}", other),
    }

    client.write_all(&encoded[48..]).await.unwrap();
    match events_rx.recv().await.unwrap() {
        HandshakeEvent::PeerId(id) => assert_eq!(id, peer_id),
        other => panic!("expected peer id event, got {:?}", other),
    }

    // The reader hands its half back.
    task.await.unwrap();
}

#[tokio::test]
async fn test_streaming_handshake_reports_failures() {
    let (mut client, server) = tokio::io::duplex(256);
    let (events_tx, mut events_rx) = mpsc::channel(2);
    tokio::spawn(handshake::read_streaming(server, events_tx));

    // 40 bytes of a valid handshake, then close.
    let encoded = Handshake::new(InfoHash::from_bytes([1u8; 20]), PeerId::generate()).encode();
    client.write_all(&encoded[..40]).await.unwrap();
    client.shutdown().await.unwrap();
    drop(client);

    match events_rx.recv().await.unwrap() {
        HandshakeEvent::Failed(PeerError::ConnectionClosed) => {}
        other => panic!("expected failure event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_streaming_handshake_rejects_bad_protocol() {
    let (mut client, server) = tokio::io::duplex(256);
    let (events_tx, mut events_rx) = mpsc::channel(2);
    tokio::spawn(handshake::read_streaming(server, events_tx));

    let mut encoded = Handshake::new(InfoHash::from_bytes([1u8; 20]), PeerId::generate())
        .encode()
        .to_vec();
    encoded[3] ^= 0xFF;
    client.write_all(&encoded).await.unwrap();

    match events_rx.recv().await.unwrap() {
        HandshakeEvent::Failed(PeerError::BadProtocol) => {}
        other => panic!("expected bad protocol event, got {:?}", other),
    }
}

#[test]
fn test_choking_state_default() {
    let state = ChokingState::default();
    assert!(state.am_choking);
    assert!(!state.am_interested);
    assert!(state.peer_choking);
    assert!(!state.peer_interested);
}

#[test]
fn test_interest_latch_fires_once() {
    let state = PeerState::new();

    let (first, _) = state.latch_interest();
    assert!(first);
    assert!(state.flags().am_interested);

    let (second, _) = state.latch_interest();
    assert!(!second);
}

#[test]
fn test_unchoke_handle_released_synchronously() {
    let state = PeerState::new();
    let handle = state.unchoke_handle();
    assert!(!handle.is_released());

    state.on_unchoke();
    // Released before any further frame could be dispatched.
    assert!(handle.is_released());
    assert!(!state.flags().peer_choking);
}

#[test]
fn test_unchoke_handle_ready_when_not_choking() {
    let state = PeerState::new();
    state.on_unchoke();

    // New askers while unchoked are released immediately.
    assert!(state.unchoke_handle().is_released());

    // A re-choke parks the next asker on a fresh gate.
    state.on_choke();
    let parked = state.unchoke_handle();
    assert!(!parked.is_released());
    state.on_unchoke();
    assert!(parked.is_released());
}

#[tokio::test]
async fn test_unchoke_releases_waiters() {
    let state = std::sync::Arc::new(PeerState::new());
    let handle = state.unchoke_handle();

    let waiter = tokio::spawn(async move { handle.released().await });
    // Let the waiter park.
    tokio::task::yield_now().await;

    state.on_unchoke();
    waiter.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_close_releases_waiters_with_error() {
    let state = std::sync::Arc::new(PeerState::new());
    let handle = state.unchoke_handle();

    let waiter = tokio::spawn(async move { handle.released().await });
    tokio::task::yield_now().await;

    state.close();
    assert!(matches!(
        waiter.await.unwrap(),
        Err(PeerError::ConnectionClosed)
    ));

    // Handles taken after close fail immediately.
    assert!(matches!(
        state.unchoke_handle().released().await,
        Err(PeerError::ConnectionClosed)
    ));
}

#[test]
fn test_may_request_gating() {
    let state = PeerState::new();
    assert!(!state.may_request());

    state.latch_interest();
    assert!(!state.may_request());

    state.on_unchoke();
    assert!(state.may_request());

    // "Observed at least one unchoke": a re-choke does not revoke it.
    state.on_choke();
    assert!(state.may_request());
}
