use std::collections::HashSet;

use etherparse::PacketBuilder;
use proptest::prelude::*;

use tun_relay::packet::{IpAddress, Packet, TransportHeader};
use tun_relay::session::{seq_ge, seq_gt};
use tun_relay::{SessionKey, SessionProtocol};

fn protocol() -> impl Strategy<Value = SessionProtocol> {
    prop_oneof![Just(SessionProtocol::Tcp), Just(SessionProtocol::Udp)]
}

fn address() -> impl Strategy<Value = IpAddress> {
    prop_oneof![
        any::<[u8; 4]>().prop_map(IpAddress::V4),
        any::<[u8; 16]>().prop_map(IpAddress::V6),
    ]
}

fn key() -> impl Strategy<Value = SessionKey> {
    (protocol(), address(), any::<u16>(), address(), any::<u16>())
        .prop_map(|(p, dst, dport, src, sport)| SessionKey::new(p, dst, dport, src, sport))
}

proptest! {
    #[test]
    fn foreign_tcp_packets_survive_parse_and_write(
        sport in any::<u16>(),
        dport in any::<u16>(),
        seq in any::<u32>(),
        ack in proptest::option::of(any::<u32>()),
        syn in any::<bool>(),
        fin in any::<bool>(),
        payload in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let mut builder = PacketBuilder::ipv4([10, 0, 0, 2], [198, 51, 100, 9], 64)
            .tcp(sport, dport, seq, 1024);
        if let Some(ack) = ack {
            builder = builder.ack(ack);
        }
        if syn {
            builder = builder.syn();
        }
        if fin {
            builder = builder.fin();
        }
        let mut original = Vec::new();
        builder.write(&mut original, &payload).unwrap();

        let packet = Packet::parse(&original).unwrap();
        let TransportHeader::Tcp(tcp) = &packet.transport else {
            panic!("expected TCP");
        };
        prop_assert_eq!(tcp.sequence_number, seq);
        prop_assert_eq!(tcp.is_ack(), ack.is_some());
        prop_assert_eq!(tcp.is_syn(), syn);
        prop_assert_eq!(packet.payload(), payload.as_slice());

        let mut rewritten = packet.ip.to_bytes();
        tcp.write(&mut rewritten);
        rewritten.extend_from_slice(packet.payload());
        prop_assert_eq!(rewritten, original);
    }

    #[test]
    fn keys_are_equal_only_when_every_part_is(a in key(), b in key()) {
        let same = a.protocol == b.protocol
            && a.destination == b.destination
            && a.destination_port == b.destination_port
            && a.source == b.source
            && a.source_port == b.source_port;
        prop_assert_eq!(a == b, same);
        prop_assert_eq!(a.to_string() == b.to_string(), same);

        let set: HashSet<SessionKey> = [a, b].into_iter().collect();
        prop_assert_eq!(set.len(), if same { 1 } else { 2 });
    }

    #[test]
    fn protocol_is_part_of_the_key(dst in address(), dport in any::<u16>(), src in address(), sport in any::<u16>()) {
        let tcp = SessionKey::new(SessionProtocol::Tcp, dst, dport, src, sport);
        let udp = SessionKey::new(SessionProtocol::Udp, dst, dport, src, sport);
        prop_assert_ne!(tcp, udp);
    }

    #[test]
    fn sequence_order_is_serial(a in any::<u32>(), d in 1u32..0x8000_0000) {
        prop_assert!(seq_gt(a.wrapping_add(d), a));
        prop_assert!(!seq_gt(a, a.wrapping_add(d)));
        prop_assert!(seq_ge(a, a));
    }
}
