//! Multi-receive: several messages land in one posted buffer until the
//! remaining space drops below the watermark.


use braid::iov::LocalIovState;
use braid::mem::MemRegion;
use braid::opflags;
use braid::test_util::SimPair;
use braid::{Config, CqEvent, FabricAddr, RecvDesc, SendPayload};

#[test]
fn test_multi_recv_concatenates_until_watermark() {
    let pair = SimPair::new(Config {
        min_multi_recv: 2048,
        ..Config::default()
    });

    let buf = MemRegion::new(8192);
    pair.b
        .rx
        .post_recv(RecvDesc {
            iov: LocalIovState::single(buf.clone(), 0, 8192),
            addr: FabricAddr::ANY,
            tag: 0,
            ignore: 0,
            flags: opflags::MULTI_RECV | opflags::COMPLETION,
            context: 77,
        })
        .unwrap();

    // 3000 + 3000 + 1200: after the third message 992 bytes remain, below
    // the 2048 watermark, so the buffer is retired with that completion.
    let sizes = [3000usize, 3000, 1200];
    let mut expected = Vec::new();
    for (i, &len) in sizes.iter().enumerate() {
        let data: Vec<u8> = (0..len).map(|j| (j + i * 31) as u8).collect();
        expected.extend_from_slice(&data);
        let mr = pair.a.register(data, 0x10000 * (i as u64 + 1));
        pair.a
            .tx
            .post_send(
                &pair.ab,
                SendPayload::Reg {
                    mr,
                    off: 0,
                    len: len as u64,
                },
                None,
                None,
                0,
                i as u64,
            )
            .unwrap();
        pair.pump();
    }

    for (i, &len) in sizes.iter().enumerate() {
        match pair.b.recv_cq.read().expect("recv completion") {
            CqEvent::Ok(rec) => {
                assert_eq!(rec.len, len as u64, "message {i}");
                assert_eq!(rec.context, 77);
                let retired = rec.flags & opflags::MULTI_RECV != 0;
                assert_eq!(retired, i == sizes.len() - 1, "message {i} retirement");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(pair.b.recv_cq.read().is_none());

    // The three payloads concatenate exactly.
    let total: usize = sizes.iter().sum();
    let mut got = vec![0u8; total];
    buf.read(0, &mut got).unwrap();
    assert_eq!(got, expected);

    // The posted entry is retired; nothing left behind.
    let inner = pair.b.rx.inner.lock().unwrap();
    assert_eq!(inner.posted.len(), 0);
    assert_eq!(inner.buffered.len(), 0);
    assert_eq!(inner.work.len(), 0);
    assert_eq!(inner.arena.live(), 0);
}

#[test]
fn test_multi_recv_stays_posted_above_watermark() {
    let pair = SimPair::new(Config {
        min_multi_recv: 64,
        ..Config::default()
    });

    let buf = MemRegion::new(4096);
    pair.b
        .rx
        .post_recv(RecvDesc {
            iov: LocalIovState::single(buf.clone(), 0, 4096),
            addr: FabricAddr::ANY,
            tag: 0,
            ignore: 0,
            flags: opflags::MULTI_RECV | opflags::COMPLETION,
            context: 1,
        })
        .unwrap();

    let mr = pair.a.register(vec![5u8; 1000], 0x9000);
    pair.a
        .tx
        .post_send(
            &pair.ab,
            SendPayload::Reg {
                mr,
                off: 0,
                len: 1000,
            },
            None,
            None,
            0,
            0,
        )
        .unwrap();
    pair.pump();

    let Some(CqEvent::Ok(rec)) = pair.b.recv_cq.read() else {
        panic!("expected completion");
    };
    assert_eq!(rec.flags & opflags::MULTI_RECV, 0);

    // Plenty of space left: the receive is still posted.
    let inner = pair.b.rx.inner.lock().unwrap();
    assert_eq!(inner.posted.len(), 1);
}
