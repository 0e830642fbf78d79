//! Peek / claim / discard semantics against buffered messages.

use std::sync::Arc;

use braid::iov::LocalIovState;
use braid::mem::MemRegion;
use braid::opflags;
use braid::test_util::SimPair;
use braid::{CqEvent, FabricAddr, RecvDesc, SendPayload};

fn send_tagged(pair: &SimPair, data: Vec<u8>, tag: u64) {
    pair.a
        .tx
        .post_send(
            &pair.ab,
            SendPayload::Inline(data),
            Some(tag),
            None,
            0,
            0,
        )
        .unwrap();
    pair.pump();
}

fn desc(buf: &Arc<MemRegion>, len: u64, tag: u64, flags: u64, ctx: u64) -> RecvDesc {
    RecvDesc {
        iov: LocalIovState::single(buf.clone(), 0, len),
        addr: FabricAddr::ANY,
        tag,
        ignore: 0,
        flags,
        context: ctx,
    }
}

#[test]
fn test_peek_then_claim_then_recv() {
    let pair = SimPair::with_defaults();
    let payload: Vec<u8> = (0..48u8).collect();
    send_tagged(&pair, payload.clone(), 0xBEEF);

    // Plain peek: metadata record, entry stays buffered.
    let claimed = pair.b.rx.peek_recv(
        FabricAddr::ANY,
        0xBEEF,
        0,
        opflags::TAGGED | opflags::PEEK | opflags::COMPLETION,
        1,
    );
    assert!(claimed.is_none());
    match pair.b.recv_cq.read().expect("peek record") {
        CqEvent::Ok(rec) => {
            assert_eq!(rec.len, 48);
            assert_eq!(rec.tag, 0xBEEF);
            assert_eq!(rec.context, 1);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(pair.b.rx.inner.lock().unwrap().buffered.len(), 1);

    // Claiming peek: same record, entry pinned on the work list.
    let claimed = pair
        .b
        .rx
        .peek_recv(
            FabricAddr::ANY,
            0xBEEF,
            0,
            opflags::TAGGED | opflags::PEEK | opflags::CLAIM | opflags::COMPLETION,
            2,
        )
        .expect("claim token");
    match pair.b.recv_cq.read().expect("claim record") {
        CqEvent::Ok(rec) => assert_eq!(rec.len, 48),
        other => panic!("unexpected {other:?}"),
    }
    {
        let inner = pair.b.rx.inner.lock().unwrap();
        assert_eq!(inner.buffered.len(), 0);
        assert_eq!(inner.work.len(), 1);
    }

    // Redeeming the claim delivers the data.
    let buf = MemRegion::new(64);
    pair.b
        .rx
        .claim_recv(
            claimed,
            desc(&buf, 64, 0xBEEF, opflags::TAGGED | opflags::COMPLETION, 3),
        )
        .unwrap();
    pair.pump();

    match pair.b.recv_cq.read().expect("recv record") {
        CqEvent::Ok(rec) => {
            assert_eq!(rec.len, 48);
            assert_eq!(rec.context, 3);
        }
        other => panic!("unexpected {other:?}"),
    }
    let mut got = vec![0u8; 48];
    buf.read(0, &mut got).unwrap();
    assert_eq!(got, payload);

    let inner = pair.b.rx.inner.lock().unwrap();
    assert_eq!(inner.arena.live(), 0);
}

#[test]
fn test_claimed_entry_hidden_from_other_receives() {
    let pair = SimPair::with_defaults();
    send_tagged(&pair, vec![1; 8], 0x10);

    let _claimed = pair
        .b
        .rx
        .peek_recv(
            FabricAddr::ANY,
            0x10,
            0,
            opflags::TAGGED | opflags::PEEK | opflags::CLAIM,
            1,
        )
        .expect("claim token");
    pair.b.recv_cq.read();

    // A plain receive for the same tag must not steal the claimed entry.
    let buf = MemRegion::new(16);
    pair.b
        .rx
        .post_recv(desc(&buf, 16, 0x10, opflags::TAGGED | opflags::COMPLETION, 2))
        .unwrap();
    pair.pump();
    assert!(pair.b.recv_cq.read().is_none());
    assert_eq!(pair.b.rx.inner.lock().unwrap().posted.len(), 1);
}

#[test]
fn test_peek_discard_releases_buffered_entry() {
    let pair = SimPair::with_defaults();
    send_tagged(&pair, vec![3; 16], 0x33);

    let claimed = pair.b.rx.peek_recv(
        FabricAddr::ANY,
        0x33,
        0,
        opflags::TAGGED | opflags::PEEK | opflags::DISCARD | opflags::COMPLETION,
        9,
    );
    assert!(claimed.is_none());
    match pair.b.recv_cq.read().expect("peek record") {
        CqEvent::Ok(rec) => assert_eq!(rec.len, 16),
        other => panic!("unexpected {other:?}"),
    }
    let inner = pair.b.rx.inner.lock().unwrap();
    assert_eq!(inner.buffered.len(), 0);
    assert_eq!(inner.work.len(), 0);
    assert_eq!(inner.arena.live(), 0);
}

#[test]
fn test_discard_while_fetch_in_flight() {
    let pair = SimPair::with_defaults();
    let mr = pair.a.register(vec![8u8; 700], 0x7000);
    pair.a
        .tx
        .post_send(
            &pair.ab,
            SendPayload::Reg {
                mr,
                off: 0,
                len: 700,
            },
            Some(0x44),
            None,
            opflags::COMPLETION,
            4,
        )
        .unwrap();

    // Let the target start its eager fetch but hold the completion.
    pair.fabric.deliver_all();
    pair.progress_only();
    assert!(pair.fabric.pending_len() > 0);

    let claimed = pair.b.rx.peek_recv(
        FabricAddr::ANY,
        0x44,
        0,
        opflags::TAGGED | opflags::PEEK | opflags::DISCARD,
        1,
    );
    assert!(claimed.is_none());
    // Parked for discard until the fetch drains.
    assert_eq!(pair.b.rx.inner.lock().unwrap().work.len(), 1);

    pair.pump();
    let inner = pair.b.rx.inner.lock().unwrap();
    assert_eq!(inner.work.len(), 0);
    assert_eq!(inner.arena.live(), 0);
    drop(inner);

    // The sender is still acknowledged.
    assert_eq!(pair.a.send_cntr.value(), 1);
}

#[test]
fn test_claim_with_discard_drops_message() {
    let pair = SimPair::with_defaults();
    send_tagged(&pair, vec![6; 24], 0x66);

    let claimed = pair
        .b
        .rx
        .peek_recv(
            FabricAddr::ANY,
            0x66,
            0,
            opflags::TAGGED | opflags::PEEK | opflags::CLAIM,
            1,
        )
        .expect("claim token");
    pair.b.recv_cq.read();

    let buf = MemRegion::new(8);
    pair.b
        .rx
        .claim_recv(
            claimed,
            desc(
                &buf,
                8,
                0x66,
                opflags::TAGGED | opflags::DISCARD | opflags::COMPLETION,
                2,
            ),
        )
        .unwrap();
    pair.pump();

    // The claim context completes trivially; the message is gone.
    match pair.b.recv_cq.read().expect("claim-discard record") {
        CqEvent::Ok(rec) => assert_eq!(rec.context, 2),
        other => panic!("unexpected {other:?}"),
    }
    let inner = pair.b.rx.inner.lock().unwrap();
    assert_eq!(inner.arena.live(), 0);
}
