//! Property-based tests for tether
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Address Properties
// ============================================================================

mod address_properties {
    use super::*;
    use tether_core::{Address, AddressType};

    fn peer_type() -> impl Strategy<Value = AddressType> {
        prop_oneof![
            Just(AddressType::Controller),
            Just(AddressType::Instance),
            Just(AddressType::Host),
            Just(AddressType::Control),
        ]
    }

    fn address() -> impl Strategy<Value = Address> {
        prop_oneof![
            (peer_type(), any::<u32>()).prop_map(|(kind, id)| Address::new(kind, id)),
            (peer_type(), any::<u32>(), any::<u32>())
                .prop_map(|(kind, id, rid)| Address::new(kind, id).with_request_id(rid)),
            peer_type().prop_map(Address::broadcast),
        ]
    }

    proptest! {
        /// Wire form is `[type, id]` or `[type, id, requestId]` and parses back
        #[test]
        fn wire_form(address in address()) {
            let value = serde_json::to_value(address).unwrap();
            let array = value.as_array().unwrap();
            let expected_len = if address.request_id().is_some() { 3 } else { 2 };
            prop_assert_eq!(array.len(), expected_len);
            prop_assert_eq!(array[0].as_u64(), Some(u64::from(address.kind().as_u32())));

            let parsed: Address = serde_json::from_value(value).unwrap();
            prop_assert_eq!(parsed, address);
        }

        /// A broadcast reaches every peer of its target type and nothing else
        #[test]
        fn broadcast_matching(target in peer_type(), kind in peer_type(), id in any::<u32>()) {
            let peer = Address::new(kind, id);
            prop_assert_eq!(Address::broadcast(target).addressed_to(&peer), kind == target);
        }

        /// Concrete addresses only match themselves
        #[test]
        fn concrete_matching(kind in peer_type(), a in any::<u32>(), b in any::<u32>()) {
            let dst = Address::new(kind, a);
            prop_assert_eq!(dst.addressed_to(&Address::new(kind, b)), a == b);
        }

        /// Request ids never change where a message is delivered
        #[test]
        fn request_id_is_routing_neutral(address in address(), rid in any::<u32>()) {
            prop_assert_eq!(
                address.with_request_id(rid).without_request_id(),
                address.without_request_id()
            );
        }

        /// Arbitrary JSON never panics the address parser
        #[test]
        fn parse_never_panics(items in prop::collection::vec(any::<i64>(), 0..5)) {
            let _ = serde_json::from_value::<Address>(serde_json::json!(items));
        }
    }
}

// ============================================================================
// Envelope Properties
// ============================================================================

mod envelope_properties {
    use super::*;
    use tether_core::{Address, Envelope, Frame, Message, NamedBody};

    proptest! {
        /// Arbitrary text never panics the frame parser
        #[test]
        fn frame_parse_never_panics(text in ".{0,256}") {
            if let Ok(frame) = Frame::parse(&text) {
                let _ = Message::from_frame(&frame);
            }
        }

        /// Unknown top-level fields are rejected
        #[test]
        fn extra_fields_rejected(field in "[a-z]{1,8}") {
            prop_assume!(!["seq", "type", "data"].contains(&field.as_str()));
            let text = format!(r#"{{"seq": 1, "type": "event", "data": {{}}, "{field}": 0}}"#);
            prop_assert!(Frame::parse(&text).is_err());
        }

        /// Requests keep name, payload and addresses through the wire
        #[test]
        fn request_survives_wire(
            seq in 1u64..u64::from(u32::MAX),
            name in "[a-z_]{1,24}",
            rid in any::<u32>(),
            n in any::<i64>(),
        ) {
            let envelope = Envelope::Request(NamedBody {
                src: Address::control(1).with_request_id(rid),
                dst: Address::controller(),
                name: name.clone(),
                data: serde_json::json!({ "n": n }),
            });
            let text = envelope.to_frame(Some(seq)).unwrap().to_text().unwrap();
            let message = Message::from_frame(&Frame::parse(&text).unwrap()).unwrap();
            prop_assert_eq!(message.seq, seq);
            prop_assert_eq!(message.name(), Some(name.as_str()));
            prop_assert_eq!(message.envelope, envelope);
        }
    }
}

// ============================================================================
// Replay Buffer Properties
// ============================================================================

mod replay_properties {
    use super::*;
    use tether_link::SendBuffer;

    fn ascending_seqs() -> impl Strategy<Value = Vec<u64>> {
        prop::collection::btree_set(1u64..10_000, 0..64).prop_map(|set| set.into_iter().collect())
    }

    proptest! {
        /// Acknowledging `k` removes exactly the prefix with seq <= k
        #[test]
        fn drop_through_trims_prefix(seqs in ascending_seqs(), ack in 0u64..10_001) {
            let mut buffer = SendBuffer::new();
            for seq in &seqs {
                buffer.push(*seq, format!("frame {seq}"));
            }

            let removed = buffer.drop_through(ack);
            let expected: Vec<u64> = seqs.iter().copied().filter(|seq| *seq > ack).collect();
            prop_assert_eq!(removed, seqs.len() - expected.len());
            prop_assert_eq!(buffer.seqs(), expected);
        }

        /// Acknowledging 0 or the last seq are the two extremes
        #[test]
        fn drop_through_extremes(seqs in ascending_seqs()) {
            let mut buffer = SendBuffer::new();
            for seq in &seqs {
                buffer.push(*seq, String::new());
            }
            prop_assert_eq!(buffer.drop_through(0), 0);
            prop_assert_eq!(buffer.len(), seqs.len());

            if let Some(last) = seqs.last() {
                buffer.drop_through(*last);
                prop_assert!(buffer.is_empty());
            }
        }
    }
}

// ============================================================================
// Sequence Properties
// ============================================================================

mod sequence_properties {
    use super::*;
    use std::sync::Arc;
    use tether_core::{
        Address, ConnectorConfig, Envelope, NamedBody, RegisterControl, Registration, ServerConfig,
    };
    use tether_link::{Accepted, ClientConnector, Connector, ServerEndpoint, TokenAuthenticator};
    use tether_transport::memory;

    #[derive(Debug, Clone)]
    enum Op {
        Send,
        Drop,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![4 => Just(Op::Send), 1 => Just(Op::Drop)]
    }

    fn event() -> Envelope {
        Envelope::Event(NamedBody {
            src: Address::control(1),
            dst: Address::controller(),
            name: "tick".to_string(),
            data: serde_json::json!({}),
        })
    }

    async fn run(ops: Vec<Op>) -> Vec<u64> {
        let (dialer, mut acceptor) = memory::listener();
        let endpoint = Arc::new(
            ServerEndpoint::new(ServerConfig::default(), TokenAuthenticator::new("t")).unwrap(),
        );
        tokio::spawn(async move {
            let mut sessions = Vec::new();
            while let Some(connection) = acceptor.accept().await {
                if let Ok(Accepted::New { connector, .. }) = endpoint.accept(connection).await {
                    sessions.push(connector);
                }
            }
        });

        let registration = Registration::Control(RegisterControl {
            token: "t".to_string(),
            agent: "proptest".to_string(),
            version: "0.3.0".to_string(),
        });
        let config = ConnectorConfig {
            reconnect_delay_secs: 0.01,
            ..Default::default()
        };
        let connector = ClientConnector::new(dialer, registration, config).unwrap();
        connector.connect().await.unwrap();

        let mut seqs = Vec::new();
        for op in ops {
            match op {
                Op::Send => seqs.push(connector.send(event()).await.unwrap()),
                Op::Drop => connector.abort_socket().await,
            }
        }
        connector.close(1000, "done").await;
        seqs
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// Successive sends get strictly increasing seqs across drops
        #[test]
        fn seqs_strictly_increase(ops in prop::collection::vec(op(), 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let seqs = runtime.block_on(run(ops));
            prop_assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]));
            if let Some(first) = seqs.first() {
                prop_assert_eq!(*first, 1);
            }
        }
    }
}

// ============================================================================
// Backoff Properties
// ============================================================================

mod backoff_properties {
    use super::*;
    use std::time::{Duration, Instant};
    use tether_core::Backoff;

    fn backoff() -> Backoff {
        Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            Duration::from_secs(120),
        )
    }

    proptest! {
        /// No delay ever exceeds the maximum, whatever the call spacing
        #[test]
        fn delay_bounded(gaps in prop::collection::vec(0u64..30_000, 1..100)) {
            let mut b = backoff();
            let mut now = Instant::now();
            for gap in gaps {
                now += Duration::from_millis(gap);
                prop_assert!(b.delay_at(now) <= Duration::from_secs(60));
            }
        }

        /// A quiet gap longer than the reset window starts over at 2 x base
        #[test]
        fn quiet_gap_resets(calls in 1usize..20, quiet in 121u64..10_000) {
            let mut b = backoff();
            let start = Instant::now();
            for i in 0..calls {
                b.delay_at(start + Duration::from_secs(i as u64));
            }
            let later = start + Duration::from_secs(calls as u64 + quiet);
            prop_assert!(b.delay_at(later) <= Duration::from_secs(2));
        }
    }
}
