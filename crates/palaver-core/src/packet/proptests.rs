//! Property suites for the codec.

use bytes::Bytes;
use proptest::prelude::*;

use super::*;

fn arb_session_flags() -> impl Strategy<Value = SessionFlags> {
    (any::<u8>(), 0u8..16, any::<bool>()).prop_map(|(priority, qos, session_id_acquire)| {
        SessionFlags {
            priority,
            qos,
            session_id_acquire,
        }
    })
}

fn arb_meta() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..256)
}

fn arb_error() -> impl Strategy<Value = String> {
    // peers put human-readable reasons here
    "[ -~]{0,64}"
}

fn arb_app_type() -> impl Strategy<Value = PacketType> {
    prop_oneof![
        Just(PacketType::Message),
        Just(PacketType::MessageAck),
        Just(PacketType::Request),
        Just(PacketType::Response),
        Just(PacketType::Register),
        Just(PacketType::RegisterAck),
        Just(PacketType::Stream),
    ]
}

prop_compose! {
    fn arb_packet()(
        selector in 0u8..8,
        pid in 1u64..u64::MAX,
        other_id in any::<u64>(),
        client_id in any::<u64>(),
        flags in arb_session_flags(),
        meta in arb_meta(),
        error in arb_error(),
        app_typ in arb_app_type(),
        data in proptest::collection::vec(any::<u8>(), 0..512),
    ) -> Packet {
        let sess_data = SessionData { meta: meta.clone(), error: error.clone() };
        match selector {
            0 => Packet::Conn(ConnPacket {
                header: PacketHeader::new(PacketType::Conn, pid),
                client_id,
                data: ConnData { meta, error },
            }),
            1 => Packet::ConnAck(ConnAckPacket {
                header: PacketHeader::new(PacketType::ConnAck, pid),
                client_id,
                data: ConnData { meta, error },
            }),
            2 => Packet::Heartbeat(HeartbeatPacket {
                header: PacketHeader::new(PacketType::Heartbeat, pid),
            }),
            3 => Packet::Session(SessionPacket {
                header: PacketHeader::new(PacketType::Session, pid),
                flags,
                negotiate_id: pid,
                data: sess_data,
            }),
            4 => Packet::SessionAck(SessionAckPacket {
                header: PacketHeader::new(PacketType::SessionAck, pid),
                negotiate_id: pid,
                session_id: other_id,
                data: sess_data,
            }),
            5 => Packet::Dismiss(DismissPacket {
                header: PacketHeader::new(PacketType::Dismiss, pid),
                session_id: other_id,
                data: sess_data,
            }),
            6 => Packet::DismissAck(DismissAckPacket {
                header: PacketHeader::new(PacketType::DismissAck, pid),
                session_id: other_id,
                data: sess_data,
            }),
            _ => Packet::Application(AppPacket {
                header: PacketHeader::new(app_typ, pid),
                session_id: other_id,
                data: Bytes::from(data),
            }),
        }
    }
}

proptest! {
    #[test]
    fn encode_decode_is_identity_on_the_wire(pkt in arb_packet()) {
        let bytes = pkt.encode().unwrap();
        let decoded = Packet::decode_buf(&bytes).unwrap();
        prop_assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn length_field_matches_payload(pkt in arb_packet()) {
        let bytes = pkt.encode().unwrap();
        let declared = u32::from_be_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]);
        prop_assert_eq!(declared as usize, bytes.len() - HEADER_LEN);
    }

    #[test]
    fn any_truncation_starves_the_decoder(pkt in arb_packet(), k in 1usize..64) {
        let bytes = pkt.encode().unwrap();
        let k = k.min(bytes.len());
        let truncated = &bytes[..bytes.len() - k];
        let result = match PacketHeader::decode(truncated) {
            Ok(header) => Packet::decode(header, &truncated[HEADER_LEN..]),
            Err(e) => Err(e),
        };
        prop_assert!(matches!(result, Err(Error::IncompletePacket)));
    }

    #[test]
    fn decoded_fields_survive_the_roundtrip(pkt in arb_packet()) {
        let bytes = pkt.encode().unwrap();
        let decoded = Packet::decode_buf(&bytes).unwrap();
        prop_assert_eq!(decoded.typ(), pkt.typ());
        prop_assert_eq!(decoded.packet_id(), pkt.packet_id());
        prop_assert_eq!(decoded.header().payload_len as usize, bytes.len() - HEADER_LEN);
    }
}
