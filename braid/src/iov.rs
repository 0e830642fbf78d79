//! Scatter-gather state for local and remote transfers.
//!
//! A state is a segment list plus a cursor. Remote states additionally track
//! which segments still lack a resolved peer key (`missing` bitmask); a
//! transfer cannot start until the mask is clear.

use std::sync::Arc;

use crate::mem::{MemRegion, Key, RemoteKey};

/// Local segment: a range of a registered (or registerable) region.
#[derive(Clone)]
pub struct LocalSeg {
    pub region: Arc<MemRegion>,
    pub off: u64,
    pub len: u64,
}

/// Cursor over local segments.
#[derive(Clone, Default)]
pub struct LocalIovState {
    pub segs: Vec<LocalSeg>,
    idx: usize,
    seg_off: u64,
}

impl LocalIovState {
    pub fn new(segs: Vec<LocalSeg>) -> Self {
        LocalIovState {
            segs,
            idx: 0,
            seg_off: 0,
        }
    }

    pub fn single(region: Arc<MemRegion>, off: u64, len: u64) -> Self {
        Self::new(vec![LocalSeg { region, off, len }])
    }

    /// Bytes left from the cursor to the end.
    pub fn avail(&self) -> u64 {
        let mut total = 0;
        for (i, seg) in self.segs.iter().enumerate().skip(self.idx) {
            total += seg.len - if i == self.idx { self.seg_off } else { 0 };
        }
        total
    }

    pub fn reset(&mut self) {
        self.idx = 0;
        self.seg_off = 0;
    }

    /// Current position: `(region, offset, bytes left in this segment)`.
    pub fn cur(&self) -> Option<(&Arc<MemRegion>, u64, u64)> {
        let seg = self.segs.get(self.idx)?;
        Some((&seg.region, seg.off + self.seg_off, seg.len - self.seg_off))
    }

    pub fn advance(&mut self, mut n: u64) {
        while n > 0 {
            let Some(seg) = self.segs.get(self.idx) else {
                debug_assert!(false, "iov advance past end");
                return;
            };
            let left = seg.len - self.seg_off;
            if n < left {
                self.seg_off += n;
                return;
            }
            n -= left;
            self.idx += 1;
            self.seg_off = 0;
        }
    }
}

/// Remote segment: a peer range addressed by key.
#[derive(Clone)]
pub struct RemoteSeg {
    pub vaddr: u64,
    pub len: u64,
    pub key: Key,
    pub rkey: Option<RemoteKey>,
}

/// Cursor over remote segments plus the missing-key mask.
#[derive(Clone, Default)]
pub struct RemoteIovState {
    pub segs: Vec<RemoteSeg>,
    idx: usize,
    seg_off: u64,
    /// Bit `i` set while `segs[i]` has no resolved key.
    pub missing: u32,
}

impl RemoteIovState {
    pub fn new(segs: Vec<RemoteSeg>) -> Self {
        let mut missing = 0;
        for (i, seg) in segs.iter().enumerate() {
            if seg.rkey.is_none() {
                missing |= 1 << i;
            }
        }
        RemoteIovState {
            segs,
            idx: 0,
            seg_off: 0,
            missing,
        }
    }

    pub fn single(vaddr: u64, len: u64, key: Key) -> Self {
        Self::new(vec![RemoteSeg {
            vaddr,
            len,
            key,
            rkey: None,
        }])
    }

    pub fn avail(&self) -> u64 {
        let mut total = 0;
        for (i, seg) in self.segs.iter().enumerate().skip(self.idx) {
            total += seg.len - if i == self.idx { self.seg_off } else { 0 };
        }
        total
    }

    /// Mark segment `i` resolved.
    pub fn resolve(&mut self, i: usize, rkey: RemoteKey) {
        self.segs[i].rkey = Some(rkey);
        self.missing &= !(1 << i);
    }

    /// Keys of the still-missing segments, deduplicated in order.
    pub fn missing_keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = Vec::new();
        for (i, seg) in self.segs.iter().enumerate() {
            if self.missing & (1 << i) != 0 && !keys.contains(&seg.key) {
                keys.push(seg.key);
            }
        }
        keys
    }

    pub fn cur(&self) -> Option<(&RemoteSeg, u64, u64)> {
        let seg = self.segs.get(self.idx)?;
        Some((seg, seg.vaddr + self.seg_off, seg.len - self.seg_off))
    }

    pub fn advance(&mut self, mut n: u64) {
        while n > 0 {
            let Some(seg) = self.segs.get(self.idx) else {
                debug_assert!(false, "iov advance past end");
                return;
            };
            let left = seg.len - self.seg_off;
            if n < left {
                self.seg_off += n;
                return;
            }
            n -= left;
            self.idx += 1;
            self.seg_off = 0;
        }
    }
}

/// Copy up to `max` bytes from `src` to `dst`, advancing both cursors.
/// Returns the bytes copied (bounded by either side's availability).
pub fn copy_local_to_local(dst: &mut LocalIovState, src: &mut LocalIovState, max: u64) -> u64 {
    let mut copied = 0;
    let mut scratch = [0u8; 4096];
    while copied < max {
        let Some((sreg, soff, sleft)) = src.cur() else {
            break;
        };
        let Some((dreg, doff, dleft)) = dst.cur() else {
            break;
        };
        let n = (max - copied)
            .min(sleft)
            .min(dleft)
            .min(scratch.len() as u64) as usize;
        if n == 0 {
            break;
        }
        let buf = &mut scratch[..n];
        if sreg.read(soff, buf).is_err() || dreg.write(doff, buf).is_err() {
            break;
        }
        src.advance(n as u64);
        dst.advance(n as u64);
        copied += n as u64;
    }
    copied
}

/// Copy a byte slice into `dst`, advancing it. Returns the bytes copied
/// (truncated to what fits).
pub fn copy_slice_to_local(dst: &mut LocalIovState, src: &[u8]) -> u64 {
    let mut copied = 0usize;
    while copied < src.len() {
        let Some((dreg, doff, dleft)) = dst.cur() else {
            break;
        };
        let n = (src.len() - copied).min(dleft as usize);
        if n == 0 || dreg.write(doff, &src[copied..copied + n]).is_err() {
            break;
        }
        dst.advance(n as u64);
        copied += n;
    }
    copied as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(lens: &[u64]) -> LocalIovState {
        LocalIovState::new(
            lens.iter()
                .map(|&len| LocalSeg {
                    region: MemRegion::new(len as usize),
                    off: 0,
                    len,
                })
                .collect(),
        )
    }

    #[test]
    fn test_avail_and_advance() {
        let mut st = local(&[10, 20, 30]);
        assert_eq!(st.avail(), 60);
        st.advance(15);
        assert_eq!(st.avail(), 45);
        let (_, off, left) = st.cur().unwrap();
        assert_eq!((off, left), (5, 15));
        st.advance(45);
        assert!(st.cur().is_none());
        assert_eq!(st.avail(), 0);
    }

    #[test]
    fn test_copy_slice_truncates() {
        let mut dst = local(&[4, 4]);
        let data = [7u8; 12];
        assert_eq!(copy_slice_to_local(&mut dst, &data), 8);
        let mut out = [0u8; 4];
        dst.segs[1].region.read(0, &mut out).unwrap();
        assert_eq!(out, [7; 4]);
    }

    #[test]
    fn test_copy_local_spans_segments() {
        let mut src = local(&[6, 6]);
        for seg in &src.segs {
            let fill = vec![0xaau8; seg.len as usize];
            seg.region.write(0, &fill).unwrap();
        }
        let mut dst = local(&[5, 7]);
        assert_eq!(copy_local_to_local(&mut dst, &mut src, 64), 12);
        let mut out = [0u8; 7];
        dst.segs[1].region.read(0, &mut out).unwrap();
        assert_eq!(out, [0xaa; 7]);
    }

    #[test]
    fn test_missing_mask() {
        let key_a = Key {
            id: 1,
            internal: false,
        };
        let key_b = Key {
            id: 2,
            internal: false,
        };
        let mut st = RemoteIovState::new(vec![
            RemoteSeg {
                vaddr: 0,
                len: 8,
                key: key_a,
                rkey: None,
            },
            RemoteSeg {
                vaddr: 8,
                len: 8,
                key: key_b,
                rkey: None,
            },
            RemoteSeg {
                vaddr: 16,
                len: 8,
                key: key_a,
                rkey: None,
            },
        ]);
        assert_eq!(st.missing, 0b111);
        assert_eq!(st.missing_keys(), vec![key_a, key_b]);
        st.resolve(
            0,
            RemoteKey {
                key: key_a,
                base: 0,
                len: 64,
                access: 0xff,
            },
        );
        assert_eq!(st.missing, 0b110);
    }
}
