//! End-to-end tests of the reliability layer between two endpoints

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::{Duration, Instant};

use blocknet::config::ReliabilityConfig;
use blocknet::error::ProtocolError;
use blocknet::reliability::datagram::Reliability;
use blocknet::reliability::ReliabilityLayer;
use bytes::Bytes;
use proptest::prelude::*;

fn config() -> ReliabilityConfig {
    ReliabilityConfig {
        mtu: 200,
        ..ReliabilityConfig::default()
    }
}

fn drain(layer: &mut ReliabilityLayer) -> Vec<Bytes> {
    std::iter::from_fn(|| layer.poll_transmit()).collect()
}

fn pattern(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

// Property: a fragmented payload is rebuilt exactly once no matter how its
// datagrams are reordered or duplicated
proptest! {
    #[test]
    fn prop_fragments_survive_permutation_and_duplicates(
        len in 200usize..4000,
        dupes in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
        seed in any::<u64>(),
    ) {
        let now = Instant::now();
        let mut sender = ReliabilityLayer::new(&config());
        let mut receiver = ReliabilityLayer::new(&config());

        let payload = pattern(len);
        sender.send(payload.clone(), Reliability::ReliableOrdered, 0).unwrap();
        sender.flush(now);
        let mut datagrams = drain(&mut sender);
        prop_assert!(datagrams.len() > 1);

        for index in &dupes {
            let copy = index.get(&datagrams).clone();
            datagrams.push(copy);
        }
        // deterministic shuffle driven by the seed
        let mut state = seed | 1;
        for i in (1..datagrams.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            datagrams.swap(i, (state % (i as u64 + 1)) as usize);
        }

        let mut delivered = Vec::new();
        for datagram in datagrams {
            let received = receiver.handle_datagram(datagram, now).unwrap();
            prop_assert!(received.errors.is_empty());
            delivered.extend(received.payloads);
        }
        prop_assert_eq!(delivered, vec![payload]);
    }
}

#[test]
fn test_channels_order_independently() {
    let now = Instant::now();
    let mut sender = ReliabilityLayer::new(&config());
    let mut receiver = ReliabilityLayer::new(&config());

    for (channel, tag) in [(1u8, "a1"), (2, "b1"), (1, "a2"), (2, "b2"), (1, "a3")] {
        sender
            .send(Bytes::from(tag), Reliability::ReliableOrdered, channel)
            .unwrap();
        sender.flush(now);
    }

    let mut delivered = Vec::new();
    for datagram in drain(&mut sender).into_iter().rev() {
        delivered.extend(receiver.handle_datagram(datagram, now).unwrap().payloads);
    }

    let channel = |prefix: &str| -> Vec<Bytes> {
        delivered
            .iter()
            .filter(|p| p.starts_with(prefix.as_bytes()))
            .cloned()
            .collect()
    };
    assert_eq!(channel("a"), vec![Bytes::from("a1"), Bytes::from("a2"), Bytes::from("a3")]);
    assert_eq!(channel("b"), vec![Bytes::from("b1"), Bytes::from("b2")]);
}

#[test]
fn test_nak_recovers_lost_datagram() {
    let now = Instant::now();
    let mut sender = ReliabilityLayer::new(&config());
    let mut receiver = ReliabilityLayer::new(&config());

    for i in 0..5u8 {
        sender
            .send(Bytes::from(vec![i]), Reliability::ReliableOrdered, 0)
            .unwrap();
        sender.flush(now);
    }
    let mut datagrams = drain(&mut sender);
    datagrams.remove(1);

    let mut delivered = Vec::new();
    for datagram in datagrams {
        delivered.extend(receiver.handle_datagram(datagram, now).unwrap().payloads);
    }
    // everything after the gap waits for it
    assert_eq!(delivered, vec![Bytes::from(vec![0u8])]);

    receiver.tick(now).unwrap();
    for control in drain(&mut receiver) {
        sender.handle_datagram(control, now).unwrap();
    }
    assert_eq!(sender.in_flight(), 1);

    for resent in drain(&mut sender) {
        delivered.extend(receiver.handle_datagram(resent, now).unwrap().payloads);
    }
    let expected: Vec<Bytes> = (0..5u8).map(|i| Bytes::from(vec![i])).collect();
    assert_eq!(delivered, expected);
}

#[test]
fn test_retransmission_is_bounded() {
    let cfg = ReliabilityConfig {
        max_retransmissions: 4,
        ..config()
    };
    let start = Instant::now();
    let mut sender = ReliabilityLayer::new(&cfg);
    sender
        .send(Bytes::from_static(b"hello"), Reliability::Reliable, 0)
        .unwrap();
    sender.flush(start);
    drain(&mut sender);

    let mut now = start;
    let mut resends = 0;
    let err = loop {
        now += cfg.max_rto;
        match sender.tick(now) {
            Ok(()) => resends += drain(&mut sender).len(),
            Err(e) => break e,
        }
        assert!(resends <= 4, "resent more often than allowed");
    };

    assert_eq!(resends, 4);
    assert!(matches!(err, ProtocolError::RetransmissionExceeded(0)));
    assert_eq!(sender.in_flight(), 0);
}

#[test]
fn test_duplicate_acks_are_harmless() {
    let now = Instant::now();
    let mut sender = ReliabilityLayer::new(&config());
    let mut receiver = ReliabilityLayer::new(&config());

    sender
        .send(Bytes::from_static(b"once"), Reliability::Reliable, 0)
        .unwrap();
    sender.flush(now);
    for datagram in drain(&mut sender) {
        receiver.handle_datagram(datagram, now).unwrap();
    }
    receiver.tick(now).unwrap();
    let acks = drain(&mut receiver);
    assert_eq!(acks.len(), 1);

    let later = now + Duration::from_millis(30);
    for _ in 0..3 {
        sender.handle_datagram(acks[0].clone(), later).unwrap();
    }
    assert_eq!(sender.in_flight(), 0);
    assert_eq!(sender.take_stats().acks_received, 3);
    sender.tick(later + Duration::from_secs(10)).unwrap();
    assert!(drain(&mut sender).is_empty());
}

#[test]
fn test_duplicate_datagram_is_acked_again_but_not_delivered() {
    let now = Instant::now();
    let mut sender = ReliabilityLayer::new(&config());
    let mut receiver = ReliabilityLayer::new(&config());

    sender
        .send(Bytes::from_static(b"x"), Reliability::Reliable, 0)
        .unwrap();
    sender.flush(now);
    let datagram = drain(&mut sender).remove(0);

    assert_eq!(receiver.handle_datagram(datagram.clone(), now).unwrap().payloads.len(), 1);
    receiver.tick(now).unwrap();
    drain(&mut receiver);

    assert!(receiver.handle_datagram(datagram, now).unwrap().payloads.is_empty());
    receiver.tick(now).unwrap();
    assert_eq!(drain(&mut receiver).len(), 1);
}

#[test]
fn test_lossy_link_delivers_every_split_payload() {
    let cfg = ReliabilityConfig::default();
    let mut now = Instant::now();
    let mut sender = ReliabilityLayer::new(&cfg);
    let mut receiver = ReliabilityLayer::new(&cfg);

    let payloads: Vec<Bytes> = (0..100u32)
        .map(|i| Bytes::from(vec![(i % 251) as u8; 3000]))
        .collect();
    let mut datagrams = Vec::new();
    for payload in &payloads {
        sender
            .send(payload.clone(), Reliability::ReliableOrdered, 0)
            .unwrap();
        sender.flush(now);
        let split = drain(&mut sender);
        assert_eq!(split.len(), 3);
        datagrams.push(split);
    }

    // the first fragment of the first 70 splits is lost, leaving more
    // incomplete splits than the receiver can hold at once
    let mut delivered = Vec::new();
    let mut errors = 0;
    for (i, split) in datagrams.into_iter().enumerate() {
        for (index, datagram) in split.into_iter().enumerate() {
            if i < 70 && index == 0 {
                continue;
            }
            let received = receiver.handle_datagram(datagram, now).unwrap();
            errors += received.errors.len();
            delivered.extend(received.payloads);
        }
    }
    assert!(receiver.take_stats().deferred > 0);

    for _ in 0..40 {
        now += Duration::from_millis(500);
        sender.tick(now).unwrap();
        for datagram in drain(&mut sender) {
            let received = receiver.handle_datagram(datagram, now).unwrap();
            errors += received.errors.len();
            delivered.extend(received.payloads);
        }
        receiver.tick(now).unwrap();
        for control in drain(&mut receiver) {
            sender.handle_datagram(control, now).unwrap();
        }
    }

    assert_eq!(errors, 0);
    assert_eq!(delivered.len(), payloads.len());
    assert_eq!(delivered, payloads);
    assert_eq!(sender.in_flight(), 0);
}

#[test]
fn test_ack_after_resends_clears_entry_once() {
    let cfg = ReliabilityConfig {
        max_retransmissions: 4,
        ..config()
    };
    let start = Instant::now();
    let mut sender = ReliabilityLayer::new(&cfg);
    let mut receiver = ReliabilityLayer::new(&cfg);
    sender
        .send(Bytes::from_static(b"late"), Reliability::Reliable, 0)
        .unwrap();
    sender.flush(start);
    let mut copies = drain(&mut sender);

    // two resends, below the ceiling of four
    let mut now = start;
    for _ in 0..2 {
        now += cfg.max_rto;
        sender.tick(now).unwrap();
        copies.extend(drain(&mut sender));
    }
    assert_eq!(copies.len(), 3);
    assert_eq!(sender.in_flight(), 1);

    let mut delivered = Vec::new();
    for copy in copies {
        delivered.extend(receiver.handle_datagram(copy, now).unwrap().payloads);
    }
    assert_eq!(delivered, vec![Bytes::from_static(b"late")]);
    receiver.tick(now).unwrap();
    let acks = drain(&mut receiver);
    assert_eq!(acks.len(), 1);

    sender.handle_datagram(acks[0].clone(), now).unwrap();
    assert_eq!(sender.in_flight(), 0);
    sender.handle_datagram(acks[0].clone(), now).unwrap();
    assert_eq!(sender.in_flight(), 0);

    // nothing left to resend, and no ceiling error later on
    for _ in 0..6 {
        now += cfg.max_rto;
        sender.tick(now).unwrap();
        assert!(drain(&mut sender).is_empty());
    }
}
