use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

use super::{AuthProvider, Error, Session, SessionEvent};
use crate::packet::EncAck;
use crate::wire;

fn establish() -> (Session, Session) {
    let mut alice = Session::new();
    let mut bob = Session::new();

    let init = alice.build_encinit().unwrap();
    bob.on_encinit(&init).unwrap();
    let ack = bob.build_encack().unwrap();
    alice.on_encack(&ack).unwrap();

    let init = bob.build_encinit().unwrap();
    alice.on_encinit(&init).unwrap();
    let ack = alice.build_encack().unwrap();
    bob.on_encack(&ack).unwrap();

    (alice, bob)
}

fn drain(session: &mut Session) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Some(event) = session.next_event() {
        events.push(event);
    }
    events
}

fn handshake_count(events: &[SessionEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, SessionEvent::Handshake))
        .count()
}

#[test]
fn mutual_handshake_converges() {
    let (mut alice, mut bob) = establish();

    assert!(alice.is_established());
    assert!(bob.is_established());
    assert_eq!(handshake_count(&drain(&mut alice)), 1);
    assert_eq!(handshake_count(&drain(&mut bob)), 1);

    assert_eq!(alice.input.session_id(), bob.output.session_id());
    assert_eq!(alice.output.session_id(), bob.input.session_id());
    assert_eq!(alice.input.session_id(), alice.output.session_id());
    assert!(alice.session_id().is_some());

    assert_eq!(alice.input.cipher_keys(), bob.output.cipher_keys());
    assert_eq!(alice.output.cipher_keys(), bob.input.cipher_keys());
}

#[test]
fn ping_round_trip() {
    let (mut alice, mut bob) = establish();
    drain(&mut alice);
    drain(&mut bob);

    let body = 1u64.to_le_bytes();
    let frame = alice.pack("ping", &body).unwrap();
    bob.feed(&frame);

    let events = drain(&mut bob);
    assert_eq!(events.len(), 1);
    match &events[0] {
        SessionEvent::Packet { command, body: got } => {
            assert_eq!(command, "ping");
            assert_eq!(&got[..], &body[..]);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[test]
fn empty_body_round_trip() {
    let (mut alice, mut bob) = establish();
    drain(&mut bob);

    let frame = alice.pack("verack", &[]).unwrap();
    bob.feed(&frame);

    let events = drain(&mut bob);
    match &events[0] {
        SessionEvent::Packet { command, body } => {
            assert_eq!(command, "verack");
            assert!(body.is_empty());
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[test]
fn sequence_advances_per_frame() {
    let (mut alice, mut bob) = establish();
    drain(&mut bob);

    for index in 0..5u8 {
        let frame = alice.pack("inv", &[index]).unwrap();
        bob.feed(&frame);
    }

    assert_eq!(alice.output.seq(), 5);
    assert_eq!(bob.input.seq(), 5);

    let packets = drain(&mut bob)
        .iter()
        .filter(|event| matches!(event, SessionEvent::Packet { .. }))
        .count();
    assert_eq!(packets, 5);
}

#[test]
fn frames_survive_fragmented_delivery() {
    let (mut alice, mut bob) = establish();
    drain(&mut bob);

    let frame = alice.pack("addr", &[0xaa; 37]).unwrap();
    for piece in frame.chunks(3) {
        bob.feed(piece);
    }

    let events = drain(&mut bob);
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], SessionEvent::Packet { command, .. } if command == "addr"));
}

#[test]
fn one_frame_can_carry_multiple_packets() {
    let (mut alice, mut bob) = establish();
    drain(&mut bob);

    // two command/body packets batched into a single frame
    let size = wire::varstring_size("ping") + 5 + wire::varstring_size("pong") + 5;
    let mut payload = vec![0u8; size];
    let mut offset = wire::write_varstring(&mut payload[..], "ping");
    LittleEndian::write_u32(&mut payload[offset..offset + 4], 1);
    offset += 4;
    payload[offset] = 0x01;
    offset += 1;
    offset += wire::write_varstring(&mut payload[offset..], "pong");
    LittleEndian::write_u32(&mut payload[offset..offset + 4], 1);
    offset += 4;
    payload[offset] = 0x02;

    let mut frame = vec![0u8; 4 + size + 16];
    LittleEndian::write_u32(&mut frame[..4], size as u32);
    frame[4..4 + size].copy_from_slice(&payload);
    alice.output.encrypt_size(&mut frame[..4]).unwrap();
    alice.output.encrypt(&mut frame[4..4 + size]).unwrap();
    let tag = alice.output.finalize().unwrap();
    frame[4 + size..].copy_from_slice(&tag);
    alice.output.sequence().unwrap();

    bob.feed(&frame);
    let events = drain(&mut bob);
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], SessionEvent::Packet { command, body }
        if command == "ping" && body == &[0x01]));
    assert!(matches!(&events[1], SessionEvent::Packet { command, body }
        if command == "pong" && body == &[0x02]));
}

#[test]
fn rekey_round_trip() {
    let (mut alice, mut bob) = establish();
    drain(&mut bob);

    let signal = alice.build_rekey().unwrap();
    bob.on_encack(&signal).unwrap();
    alice.rekey_output().unwrap();

    let frame = alice.pack("ping", &[1]).unwrap();
    bob.feed(&frame);

    let events = drain(&mut bob);
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], SessionEvent::Packet { command, .. } if command == "ping"));
}

#[test]
fn one_sided_rekey_desynchronizes() {
    let (mut alice, mut bob) = establish();
    drain(&mut bob);

    let signal = alice.build_rekey().unwrap();
    bob.on_encack(&signal).unwrap();

    // alice kept her old output keys, the next frame cannot decode:
    // the garbled size prefix or the tag check reports the mismatch
    let frame = alice.pack("ping", &[1]).unwrap();
    bob.feed(&frame);

    let events = drain(&mut bob);
    assert_eq!(events.len(), 1);
    match &events[0] {
        SessionEvent::Error(err) => {
            let text = err.to_string();
            assert!(
                text.starts_with("Bad packet size: ") || text.starts_with("Bad tag: "),
                "{}",
                text
            );
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[test]
fn rekey_signal_requires_handshake() {
    let mut session = Session::new();
    assert!(matches!(
        session.on_encack(&EncAck::rekey()),
        Err(Error::UnsolicitedRekey)
    ));
}

struct FixedKeys;

impl AuthProvider for FixedKeys {
    fn authenticated(&self) -> bool {
        true
    }

    fn rekey_input(&mut self) -> ([u8; 32], [u8; 32]) {
        ([0x11; 32], [0x22; 32])
    }

    fn rekey_output(&mut self) -> ([u8; 32], [u8; 32]) {
        ([0x11; 32], [0x22; 32])
    }
}

#[test]
fn auth_provider_supplies_rekey_material() {
    let (mut alice, mut bob) = establish();
    drain(&mut bob);
    alice.set_auth(Box::new(FixedKeys));
    bob.set_auth(Box::new(FixedKeys));

    let signal = alice.build_rekey().unwrap();
    bob.on_encack(&signal).unwrap();
    alice.rekey_output().unwrap();
    assert_eq!(bob.input.cipher_keys().unwrap().0, [0x11; 32]);

    let frame = alice.pack("ping", &[9]).unwrap();
    bob.feed(&frame);
    let events = drain(&mut bob);
    assert!(matches!(&events[0], SessionEvent::Packet { command, .. } if command == "ping"));
}

#[test]
fn undersized_frame_is_rejected() {
    let (mut alice, mut bob) = establish();
    drain(&mut bob);

    let mut size = [5u8, 0, 0, 0];
    alice.output.encrypt_size(&mut size).unwrap();
    bob.feed(&size);

    let events = drain(&mut bob);
    assert_eq!(events.len(), 1);
    match &events[0] {
        SessionEvent::Error(err) => assert_eq!(err.to_string(), "Bad packet size: 5."),
        other => panic!("unexpected event: {:?}", other),
    }

    // the parser is poisoned, further input is ignored
    bob.feed(&[0u8; 64]);
    assert!(drain(&mut bob).is_empty());
}

#[test]
fn tampered_tag_halts_the_parser() {
    let (mut alice, mut bob) = establish();
    drain(&mut bob);

    let mut frame = alice.pack("ping", &[1, 2, 3]).unwrap();
    let last = frame.len() - 1;
    frame[last] ^= 0x01;
    bob.feed(&frame);

    let events = drain(&mut bob);
    assert_eq!(events.len(), 1);
    match &events[0] {
        SessionEvent::Error(err) => {
            let text = err.to_string();
            assert!(text.starts_with("Bad tag: ") && text.ends_with('.'), "{}", text);
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(bob.input.seq(), 1);

    // a subsequent valid frame is not decoded
    let good = alice.pack("ping", &[4]).unwrap();
    bob.feed(&good);
    assert!(drain(&mut bob).is_empty());
}

#[test]
fn oversized_command_is_refused() {
    let (mut alice, _) = establish();
    assert!(matches!(
        alice.pack("whatchamacallit", &[]),
        Err(Error::BadCommand)
    ));
    assert!(matches!(alice.pack("", &[]), Err(Error::BadCommand)));
}

#[test]
fn duplicate_encinit_is_refused() {
    let mut alice = Session::new();
    let mut bob = Session::new();

    let init = alice.build_encinit().unwrap();
    assert!(matches!(
        alice.build_encinit(),
        Err(Error::InitAlreadySent)
    ));

    bob.on_encinit(&init).unwrap();
    assert!(matches!(
        bob.on_encinit(&init),
        Err(Error::InitAlreadyReceived)
    ));
}

#[test]
fn cipher_mismatch_is_refused() {
    let mut alice = Session::new();
    let mut bob = Session::new();

    let init = alice.build_encinit().unwrap();
    let tampered = crate::packet::EncInit::new(init.public_key(), 1);
    assert!(matches!(
        bob.on_encinit(&tampered),
        Err(Error::CipherMismatch { expected: 0, received: 1 })
    ));
}

#[test]
fn encack_requires_sent_encinit() {
    let mut fresh = Session::new();
    let ack = EncAck::new(fresh.build_encinit().unwrap().public_key());

    let mut lonely = Session::new();
    assert!(matches!(lonely.on_encack(&ack), Err(Error::AckUnsolicited)));
}

#[test]
fn duplicate_encack_is_refused() {
    let (mut alice, mut bob) = establish();
    assert!(matches!(
        alice.build_encack(),
        Err(Error::AckAlreadySent)
    ));
    let replay = EncAck::new(bob.output.public_key().serialize());
    assert!(matches!(
        alice.on_encack(&replay),
        Err(Error::AckAlreadyReceived)
    ));
}

#[tokio::test]
async fn handshake_wait_times_out() {
    let mut session = Session::new();
    let wait = session.wait(Duration::from_millis(50));
    match wait.await {
        Err(Error::HandshakeTimeout) => {}
        other => panic!("expected timeout, got {:?}", other),
    }

    // the session refuses further handshake progress
    let mut other = Session::new();
    let init = other.build_encinit().unwrap();
    assert!(matches!(
        session.on_encinit(&init),
        Err(Error::SessionCompleted)
    ));
}

#[tokio::test]
async fn destroy_rejects_pending_wait() {
    let mut session = Session::new();
    let wait = session.wait(Duration::from_secs(5));
    session.destroy();
    assert!(matches!(wait.await, Err(Error::SessionDestroyed)));
}

#[tokio::test]
async fn wait_resolves_on_completion() {
    let mut alice = Session::new();
    let mut bob = Session::new();
    let wait = alice.wait(Duration::from_secs(5));

    let init = alice.build_encinit().unwrap();
    bob.on_encinit(&init).unwrap();
    let ack = bob.build_encack().unwrap();
    alice.on_encack(&ack).unwrap();
    let init = bob.build_encinit().unwrap();
    alice.on_encinit(&init).unwrap();
    let ack = alice.build_encack().unwrap();
    bob.on_encack(&ack).unwrap();

    wait.await.unwrap();
    assert!(alice.is_established());
}

#[tokio::test]
async fn wait_after_completion_resolves_immediately() {
    let (mut alice, _) = establish();
    alice.wait(Duration::from_secs(5)).await.unwrap();
}
