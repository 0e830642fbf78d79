//! Initiator-side RMA and remote atomics.

use braid::iov::{LocalIovState, RemoteIovState};
use braid::mem::MemRegion;
use braid::opflags;
use braid::test_util::SimPair;
use braid::{AtomicOp, AtomicWidth, CqEvent, status};
use braid::tx::FetchResult;

#[test]
fn test_rma_write_with_remote_cq_data() {
    let pair = SimPair::with_defaults();
    let target = pair.b.register(vec![0u8; 4096], 0x8000);

    let data: Vec<u8> = (0..2048u32).map(|i| (i * 3) as u8).collect();
    let local = MemRegion::from_vec(data.clone());
    pair.a
        .tx
        .post_rma(
            &pair.ab,
            true,
            LocalIovState::single(local, 0, 2048),
            RemoteIovState::single(0x8000, 2048, target.key),
            opflags::COMPLETION,
            Some(0xDEAD_BEEF),
            31,
        )
        .unwrap();
    pair.pump();

    // The data landed.
    let mut got = vec![0u8; 2048];
    target.region.read(0, &mut got).unwrap();
    assert_eq!(got, data);

    // The target's RX CQ sees the remote-write notification.
    match pair.b.recv_cq.read().expect("writedata record") {
        CqEvent::Ok(rec) => {
            assert_ne!(rec.flags & opflags::REMOTE_WRITE, 0);
            assert_ne!(rec.flags & opflags::REMOTE_CQ_DATA, 0);
            assert_ne!(rec.flags & opflags::RMA, 0);
            assert_eq!(rec.data, 0xDEAD_BEEF);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(pair.b.rem_write_cntr.value(), 1);

    // The local completion arrived after the notification went out.
    match pair.a.send_cq.read().expect("write completion") {
        CqEvent::Ok(rec) => {
            assert_eq!(rec.context, 31);
            assert_ne!(rec.flags & opflags::WRITE, 0);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(pair.a.write_cntr.value(), 1);
}

#[test]
fn test_rma_read() {
    let pair = SimPair::with_defaults();
    let data: Vec<u8> = (0..4096u32).map(|i| (i ^ 0x5a) as u8).collect();
    let target = pair.b.register(data.clone(), 0xA000);

    let local = MemRegion::new(4096);
    pair.a
        .tx
        .post_rma(
            &pair.ab,
            false,
            LocalIovState::single(local.clone(), 0, 4096),
            RemoteIovState::single(0xA000, 4096, target.key),
            opflags::COMPLETION,
            None,
            8,
        )
        .unwrap();
    pair.pump();

    let mut got = vec![0u8; 4096];
    local.read(0, &mut got).unwrap();
    assert_eq!(got, data);
    assert_eq!(pair.a.read_cntr.value(), 1);
    match pair.a.send_cq.read().expect("read completion") {
        CqEvent::Ok(rec) => assert_ne!(rec.flags & opflags::READ, 0),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_rma_write_inject() {
    let pair = SimPair::with_defaults();
    let target = pair.b.register(vec![0u8; 64], 0xB000);

    pair.a
        .tx
        .post_write_inject(
            &pair.ab,
            &[0xfe; 16],
            RemoteIovState::single(0xB000, 16, target.key),
            opflags::COMPLETION,
            None,
            2,
        )
        .unwrap();
    pair.pump();

    let mut got = [0u8; 16];
    target.region.read(0, &mut got).unwrap();
    assert_eq!(got, [0xfe; 16]);
    assert!(matches!(pair.a.send_cq.read(), Some(CqEvent::Ok(_))));
}

#[test]
fn test_rma_multi_chunk_respects_iov_boundaries() {
    let pair = SimPair::with_defaults();
    let data: Vec<u8> = (0..6000u32).map(|i| i as u8).collect();
    let target = pair.b.register(data.clone(), 0xC000);

    // Three local segments of uneven size.
    let segs: Vec<_> = [1000u64, 2500, 2500]
        .iter()
        .map(|&len| braid::iov::LocalSeg {
            region: MemRegion::new(len as usize),
            off: 0,
            len,
        })
        .collect();
    let regions: Vec<_> = segs.iter().map(|s| s.region.clone()).collect();
    pair.a
        .tx
        .post_rma(
            &pair.ab,
            false,
            LocalIovState::new(segs),
            RemoteIovState::single(0xC000, 6000, target.key),
            opflags::COMPLETION,
            None,
            1,
        )
        .unwrap();
    pair.pump();

    let mut off = 0usize;
    for (i, region) in regions.iter().enumerate() {
        let mut got = vec![0u8; region.len()];
        region.read(0, &mut got).unwrap();
        assert_eq!(got, &data[off..off + region.len()], "segment {i}");
        off += region.len();
    }
}

fn atomic_target(pair: &SimPair, initial: u64) -> std::sync::Arc<braid::mem::Mr> {
    pair.b
        .register(initial.to_ne_bytes().to_vec(), 0x5000)
}

fn run_atomic(
    pair: &SimPair,
    op: AtomicOp,
    width: AtomicWidth,
    operand: u64,
    compare: u64,
    initial: u64,
) -> (u64, Option<u64>) {
    let target = atomic_target(pair, initial);
    let result = if op.fetches() {
        Some(FetchResult::new(width))
    } else {
        None
    };
    pair.a
        .tx
        .post_atomic(
            &pair.ab,
            op,
            width,
            0x5000,
            target.key,
            operand,
            compare,
            result.clone(),
            opflags::COMPLETION,
            0,
        )
        .unwrap();
    pair.pump();

    let mut raw = [0u8; 8];
    target.region.read(0, &mut raw).unwrap();
    (u64::from_ne_bytes(raw), result.and_then(|r| r.get()))
}

#[test]
fn test_atomic_sum_returns_pre_image() {
    let pair = SimPair::with_defaults();
    let (value, pre) = run_atomic(&pair, AtomicOp::Sum, AtomicWidth::U64, 5, 0, 100);
    assert_eq!(value, 105);
    assert_eq!(pre, Some(100));
    assert!(matches!(pair.a.send_cq.read(), Some(CqEvent::Ok(_))));
}

#[test]
fn test_atomic_cswap_hit_and_miss() {
    let pair = SimPair::with_defaults();
    let (value, pre) = run_atomic(&pair, AtomicOp::Cswap, AtomicWidth::U64, 7, 100, 100);
    assert_eq!(value, 7);
    assert_eq!(pre, Some(100));

    let pair = SimPair::with_defaults();
    let (value, pre) = run_atomic(&pair, AtomicOp::Cswap, AtomicWidth::U64, 7, 42, 100);
    assert_eq!(value, 100, "mismatched compare leaves the value");
    assert_eq!(pre, Some(100));
}

#[test]
fn test_atomic_bitwise_at_u32() {
    let pair = SimPair::with_defaults();
    let (value, pre) = run_atomic(
        &pair,
        AtomicOp::Bxor,
        AtomicWidth::U32,
        0x0000_ffff,
        0,
        0x1234_5678,
    );
    assert_eq!(value, 0x1234_a987);
    assert_eq!(pre, Some(0x1234_5678));
}

#[test]
fn test_atomic_write_no_fetch() {
    let pair = SimPair::with_defaults();
    let (value, pre) = run_atomic(&pair, AtomicOp::Write, AtomicWidth::U64, 0xabcd, 0, 1);
    assert_eq!(value, 0xabcd);
    assert_eq!(pre, None);
}

#[test]
fn test_atomic_unknown_key_errors() {
    let pair = SimPair::with_defaults();
    let result = FetchResult::new(AtomicWidth::U64);
    pair.a
        .tx
        .post_atomic(
            &pair.ab,
            AtomicOp::Sum,
            AtomicWidth::U64,
            0x5000,
            braid::mem::Key {
                id: 999,
                internal: false,
            },
            1,
            0,
            Some(result.clone()),
            opflags::COMPLETION,
            0,
        )
        .unwrap();
    pair.pump();

    match pair.a.send_cq.read().expect("atomic error record") {
        CqEvent::Err(e) => assert_eq!(e.err, status::NO_KEY),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(pair.a.read_cntr.errors(), 1);
}
