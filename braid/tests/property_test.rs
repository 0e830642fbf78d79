//! Property tests: ring toggle formula, matcher algebra, and the
//! list-membership invariant under random operation interleavings.

use std::collections::HashSet;

use braid::iov::LocalIovState;
use braid::mem::MemRegion;
use braid::opflags;
use braid::ring::expected_toggle;
use braid::test_util::SimPair;
use braid::wire::MSG_VALID_TOGGLE;
use braid::{FabricAddr, RecvDesc, SendPayload};
use proptest::prelude::*;

proptest! {
    /// The consumer's expected toggle flips exactly once per revolution.
    #[test]
    fn prop_toggle_matches_revolution_parity(head in any::<u32>(), bits in 1u32..10) {
        let mask = (1u32 << bits) - 1;
        let revolution = head >> bits;
        let want = if revolution % 2 == 0 { MSG_VALID_TOGGLE } else { 0 };
        prop_assert_eq!(expected_toggle(head, mask), want);
    }

    /// Tag matching is equality under the ignore mask.
    #[test]
    fn prop_tag_ignore_algebra(etag in any::<u64>(), tag in any::<u64>(), ignore in any::<u64>()) {
        use braid::rx::{RxEntry, match_entry};
        let mut entry = RxEntry::blank(braid::ConnId(0));
        entry.addr = FabricAddr::ANY;
        entry.tag = etag;
        entry.flags = opflags::TAGGED;
        let got = match_entry(&entry, true, FabricAddr(1), tag, ignore, opflags::TAGGED);
        prop_assert_eq!(got, (etag ^ tag) & !ignore == 0);
    }
}

/// Random op applied to a pair.
#[derive(Debug, Clone)]
enum Op {
    Send { tag: u64, len: usize },
    Post { tag: u64 },
    Peek { tag: u64, discard: bool },
    Pump,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..4, 1usize..64).prop_map(|(tag, len)| Op::Send { tag, len }),
        (0u64..4).prop_map(|tag| Op::Post { tag }),
        (0u64..4, any::<bool>()).prop_map(|(tag, discard)| Op::Peek { tag, discard }),
        Just(Op::Pump),
    ]
}

fn check_partition(pair: &SimPair) {
    let inner = pair.b.rx.inner.lock().unwrap();
    let total = inner.posted.len() + inner.buffered.len() + inner.work.len();
    assert_eq!(
        total,
        inner.arena.live(),
        "every live entry on exactly one list"
    );
    let mut seen = HashSet::new();
    for &idx in inner
        .posted
        .iter()
        .chain(inner.buffered.iter())
        .chain(inner.work.iter())
    {
        assert!(seen.insert(idx), "entry {idx} on two lists");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Whatever the interleaving of sends, posts, and peeks, every live RX
    /// entry is on exactly one of the three lists.
    #[test]
    fn prop_list_membership_invariant(ops in prop::collection::vec(op_strategy(), 1..24)) {
        let pair = SimPair::with_defaults();
        for op in ops {
            match op {
                Op::Send { tag, len } => {
                    pair.a
                        .tx
                        .post_send(
                            &pair.ab,
                            SendPayload::Inline(vec![tag as u8; len]),
                            Some(tag),
                            None,
                            0,
                            0,
                        )
                        .unwrap();
                }
                Op::Post { tag } => {
                    let buf = MemRegion::new(64);
                    pair.b
                        .rx
                        .post_recv(RecvDesc {
                            iov: LocalIovState::single(buf, 0, 64),
                            addr: FabricAddr::ANY,
                            tag,
                            ignore: 0,
                            flags: opflags::TAGGED | opflags::COMPLETION,
                            context: tag,
                        })
                        .unwrap();
                }
                Op::Peek { tag, discard } => {
                    let flags = opflags::TAGGED
                        | opflags::PEEK
                        | if discard { opflags::DISCARD } else { 0 };
                    let _ = pair.b.rx.peek_recv(FabricAddr::ANY, tag, 0, flags, 0);
                }
                Op::Pump => pair.pump(),
            }
            check_partition(&pair);
        }
        pair.pump();
        check_partition(&pair);
    }
}
