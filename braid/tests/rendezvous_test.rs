//! Rendezvous-path scenarios: direct fetch into the user buffer,
//! truncation, and key availability.

use std::sync::Arc;

use braid::iov::LocalIovState;
use braid::mem::MemRegion;
use braid::opflags;
use braid::test_util::SimPair;
use braid::{Config, CqEvent, FabricAddr, RecvDesc, SendPayload, status};

fn recv_desc(buf: &Arc<MemRegion>, len: u64, flags: u64, ctx: u64) -> RecvDesc {
    RecvDesc {
        iov: LocalIovState::single(buf.clone(), 0, len),
        addr: FabricAddr::ANY,
        tag: 0,
        ignore: 0,
        flags,
        context: ctx,
    }
}

fn pair_8k_eager() -> SimPair {
    SimPair::new(Config {
        max_eager_sz: 8 * 1024,
        ..Config::default()
    })
}

#[test]
fn test_large_send_into_preposted_recv() {
    let pair = pair_8k_eager();
    let data: Vec<u8> = (0..16384u32).map(|i| (i * 7) as u8).collect();
    let mr = pair.a.register(data.clone(), 0x100000);

    let buf = MemRegion::new(16384);
    pair.b
        .rx
        .post_recv(recv_desc(&buf, 16384, opflags::COMPLETION, 1))
        .unwrap();

    pair.a
        .tx
        .post_send(
            &pair.ab,
            SendPayload::Reg {
                mr,
                off: 0,
                len: 16384,
            },
            None,
            None,
            opflags::COMPLETION,
            2,
        )
        .unwrap();
    pair.pump();

    match pair.b.recv_cq.read().expect("recv completion") {
        CqEvent::Ok(rec) => {
            assert_eq!(rec.len, 16384);
            assert_eq!(rec.context, 1);
        }
        other => panic!("unexpected {other:?}"),
    }
    let mut got = vec![0u8; 16384];
    buf.read(0, &mut got).unwrap();
    assert_eq!(got, data);
    assert_eq!(pair.b.recv_cntr.value(), 1);
    assert_eq!(pair.a.send_cntr.value(), 1);
}

#[test]
fn test_rendezvous_truncation() {
    let pair = pair_8k_eager();
    let data = vec![0x77u8; 16384];
    let mr = pair.a.register(data.clone(), 0x100000);

    // A 4 KiB receive for a 16 KiB message.
    let buf = MemRegion::new(4096);
    pair.b
        .rx
        .post_recv(recv_desc(&buf, 4096, opflags::COMPLETION, 5))
        .unwrap();

    pair.a
        .tx
        .post_send(
            &pair.ab,
            SendPayload::Reg {
                mr,
                off: 0,
                len: 16384,
            },
            None,
            None,
            opflags::COMPLETION,
            6,
        )
        .unwrap();
    pair.pump();

    match pair.b.recv_cq.read().expect("recv error record") {
        CqEvent::Err(e) => {
            assert_eq!(e.err, status::TRUNCATED);
            assert_eq!(e.record.len, 16384);
            assert_eq!(e.rem, 12288);
            assert_eq!(e.record.context, 5);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(pair.b.recv_cntr.errors(), 1);
    assert_eq!(pair.b.recv_cntr.value(), 0);

    // The delivered prefix is intact.
    let mut got = vec![0u8; 4096];
    buf.read(0, &mut got).unwrap();
    assert_eq!(got, &data[..4096]);

    // The sender asked for an acknowledgement and sees the truncation.
    match pair.a.send_cq.read().expect("send error record") {
        CqEvent::Err(e) => {
            assert_eq!(e.err, status::TRUNCATED);
            assert_eq!(e.rem, 12288);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_failed_fetch_completion_surfaces_io_error() {
    let pair = pair_8k_eager();
    let data = vec![2u8; 16000];
    let mr = pair.a.register(data, 0x100000);

    let buf = MemRegion::new(16000);
    pair.b
        .rx
        .post_recv(recv_desc(&buf, 16000, opflags::COMPLETION, 7))
        .unwrap();

    // The receive-side fetch completes in error.
    pair.fabric.fail_completions(pair.b.node, 1);
    pair.a
        .tx
        .post_send(
            &pair.ab,
            SendPayload::Reg {
                mr,
                off: 0,
                len: 16000,
            },
            None,
            None,
            opflags::COMPLETION,
            8,
        )
        .unwrap();
    pair.pump();

    match pair.b.recv_cq.read().expect("recv error record") {
        CqEvent::Err(e) => {
            assert_eq!(e.err, status::IO);
            assert_eq!(e.record.context, 7);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(pair.b.recv_cntr.errors(), 1);
    // The acknowledgement carries the same failure to the sender.
    match pair.a.send_cq.read().expect("send error record") {
        CqEvent::Err(e) => assert_eq!(e.err, status::IO),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_revoked_key_fails_with_no_key() {
    let pair = pair_8k_eager();
    let data = vec![9u8; 16000];
    let mr = pair.a.register(data, 0x100000);
    let key = mr.key;

    // First transfer primes the peer's key cache.
    let buf = MemRegion::new(16000);
    pair.b
        .rx
        .post_recv(recv_desc(&buf, 16000, opflags::COMPLETION, 1))
        .unwrap();
    pair.a
        .tx
        .post_send(
            &pair.ab,
            SendPayload::Reg {
                mr: mr.clone(),
                off: 0,
                len: 16000,
            },
            None,
            None,
            0,
            2,
        )
        .unwrap();
    pair.pump();
    assert!(matches!(pair.b.recv_cq.read(), Some(CqEvent::Ok(_))));

    // Revoke, then attempt another transfer with the dead key: the
    // receiver's key request comes back NO_KEY and both sides error out.
    pair.a.tx.revoke_key(&pair.ab, key);
    pair.pump();

    let buf2 = MemRegion::new(16000);
    pair.b
        .rx
        .post_recv(recv_desc(&buf2, 16000, opflags::COMPLETION, 3))
        .unwrap();
    pair.a
        .tx
        .post_send(
            &pair.ab,
            SendPayload::Reg {
                mr,
                off: 0,
                len: 16000,
            },
            None,
            None,
            opflags::COMPLETION,
            4,
        )
        .unwrap();
    pair.pump();

    match pair.b.recv_cq.read().expect("recv error record") {
        CqEvent::Err(e) => {
            assert_eq!(e.err, status::NO_KEY);
            assert_eq!(e.record.context, 3);
        }
        other => panic!("unexpected {other:?}"),
    }
    match pair.a.send_cq.read().expect("send error record") {
        CqEvent::Err(e) => assert_eq!(e.err, status::NO_KEY),
        other => panic!("unexpected {other:?}"),
    }
}
