//! Receive contexts: entry arena, matching lists, and the user-facing
//! post/peek/claim surface.
//!
//! Entries are arena-allocated and linked into exactly one of three lists
//! by index (the connection owns the context which owns the lists, so
//! back-pointers would be cyclic). The lists are:
//!
//! - `posted`: user receives awaiting a matching send
//! - `buffered`: arrived sends awaiting a matching receive or peek/claim
//! - `work`: matched or discarded entries progressing toward completion,
//!   ordered by arrival/match time (completions report in this order)

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::comp::{CompSet, opflags};
use crate::conn::{ConnId, FabricAddr};
use crate::ep::Endpoint;
use crate::error::{FabricError, StickyStatus};
use crate::iov::{LocalIovState, RemoteIovState};
use crate::mem::MemRegion;
use crate::progress::{self, PeSignal};
use crate::wire::{MAX_INLINE_MSG, MsgHdr};

pub type RxIdx = u32;

/// Receive-message lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    Idle,
    /// Payload arrived in the message slot; waiting for a match.
    Inline,
    /// Fetching into a provider eager buffer.
    Eager,
    /// Matched while the eager fetch is still in flight.
    EagerClaimed,
    /// Eager fetch done, still unmatched.
    EagerDone,
    /// Rendezvous, unmatched: nothing fetched yet.
    Rnd,
    /// Rendezvous fetch straight into the user buffer.
    RndDirect,
    /// Rendezvous fetch into a provider buffer, copied out on completion.
    RndBuf,
    /// Terminal: report in work-list order.
    Complete,
    /// Terminal: release without reporting.
    Drop,
    /// Discarded while a fetch was in flight; released when it drains.
    Discard,
}

/// Which list an entry is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListId {
    None,
    Posted,
    Buffered,
    Work,
}

/// One in-flight incoming message or posted user receive.
pub struct RxEntry {
    pub conn: ConnId,
    pub addr: FabricAddr,
    pub tag: u64,
    pub ignore: u64,
    pub flags: u64,
    pub context: u64,
    pub state: RxState,
    pub list: ListId,
    /// Waiting for remote-key responses before the fetch can start.
    pub key_wait: bool,
    pub status: StickyStatus,
    pub completions: u32,
    /// Where fetched data lands (user buffer or eager buffer).
    pub lstate: LocalIovState,
    /// The matched user buffer view, for buffered copy-out.
    pub ustate: LocalIovState,
    pub rstate: RemoteIovState,
    pub total_len: u64,
    pub rem: u64,
    pub cq_data: u64,
    pub inline_data: [u8; MAX_INLINE_MSG],
    /// Header of the originating send, kept for acknowledgements.
    pub hdr: MsgHdr,
    pub eager: Option<EagerBuf>,
}

impl RxEntry {
    pub fn blank(conn: ConnId) -> RxEntry {
        RxEntry {
            conn,
            addr: FabricAddr::ANY,
            tag: 0,
            ignore: 0,
            flags: 0,
            context: 0,
            state: RxState::Idle,
            list: ListId::None,
            key_wait: false,
            status: StickyStatus::new(),
            completions: 0,
            lstate: LocalIovState::default(),
            ustate: LocalIovState::default(),
            rstate: RemoteIovState::default(),
            total_len: 0,
            rem: 0,
            cq_data: 0,
            inline_data: [0; MAX_INLINE_MSG],
            hdr: MsgHdr::default(),
            eager: None,
        }
    }
}

/// A user receive to post.
pub struct RecvDesc {
    pub iov: LocalIovState,
    pub addr: FabricAddr,
    pub tag: u64,
    pub ignore: u64,
    pub flags: u64,
    pub context: u64,
}

/// Token for a buffered message pinned by an `FI_CLAIM` peek; redeemed by
/// [`RxCtx::claim_recv`].
pub struct Claimed {
    pub(crate) idx: RxIdx,
}

/// Match an entry against an address/tag/flags triple.
///
/// `is_buffered` selects scan direction (a buffered entry matched by a
/// posted receive, or vice versa); the rules are symmetric: addresses agree
/// (either side wildcard), tagged-ness agrees, tags agree under the ignore
/// mask, and claim state agrees.
pub fn match_entry(
    entry: &RxEntry,
    _is_buffered: bool,
    addr: FabricAddr,
    tag: u64,
    ignore: u64,
    flags: u64,
) -> bool {
    if !entry.addr.is_any() && !addr.is_any() && entry.addr != addr {
        return false;
    }
    if (entry.flags & opflags::TAGGED) != (flags & opflags::TAGGED) {
        return false;
    }
    if flags & opflags::TAGGED != 0 && (entry.tag ^ tag) & !ignore != 0 {
        return false;
    }
    // A claimed message is visible only to claim-aware requests.
    entry.flags & opflags::CLAIM == 0 || flags & opflags::CLAIM != 0
}

/// Arena of RX entries; list links are indices into this arena.
pub struct RxArena {
    entries: Vec<Option<RxEntry>>,
    free: Vec<RxIdx>,
    cap: usize,
}

impl RxArena {
    pub fn new(cap: usize) -> RxArena {
        RxArena {
            entries: Vec::new(),
            free: Vec::new(),
            cap,
        }
    }

    pub fn alloc(&mut self, entry: RxEntry) -> Option<RxIdx> {
        if let Some(idx) = self.free.pop() {
            self.entries[idx as usize] = Some(entry);
            return Some(idx);
        }
        if self.entries.len() >= self.cap {
            return None;
        }
        self.entries.push(Some(entry));
        Some((self.entries.len() - 1) as RxIdx)
    }

    /// A vacant slot here means a list or completion referenced a released
    /// entry: memory corruption, deliberately fatal.
    pub fn get(&self, idx: RxIdx) -> &RxEntry {
        self.entries[idx as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("vacant RX entry {idx}"))
    }

    pub fn get_mut(&mut self, idx: RxIdx) -> &mut RxEntry {
        self.entries[idx as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("vacant RX entry {idx}"))
    }

    /// Detach the entry, keeping the slot reserved until [`RxArena::free`].
    pub fn take(&mut self, idx: RxIdx) -> RxEntry {
        self.entries[idx as usize]
            .take()
            .unwrap_or_else(|| panic!("vacant RX entry {idx}"))
    }

    pub fn free(&mut self, idx: RxIdx) {
        debug_assert!(self.entries[idx as usize].is_none());
        self.free.push(idx);
    }

    /// Release a live entry in one step.
    pub fn release(&mut self, idx: RxIdx) {
        let entry = self.take(idx);
        debug_assert_eq!(entry.list, ListId::None);
        drop(entry);
        self.free(idx);
    }

    /// Count of live entries (diagnostics and tests).
    pub fn live(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }
}

/// Lists plus arena, guarded by the context lock.
pub struct RxInner {
    pub arena: RxArena,
    pub posted: VecDeque<RxIdx>,
    pub buffered: VecDeque<RxIdx>,
    pub work: VecDeque<RxIdx>,
}

impl RxInner {
    /// Append to a list's tail; the entry must not be on any list.
    pub fn link(&mut self, idx: RxIdx, list: ListId) {
        let entry = self.arena.get_mut(idx);
        assert_eq!(entry.list, ListId::None, "RX entry {idx} on two lists");
        entry.list = list;
        match list {
            ListId::Posted => self.posted.push_back(idx),
            ListId::Buffered => self.buffered.push_back(idx),
            ListId::Work => self.work.push_back(idx),
            ListId::None => unreachable!(),
        }
    }

    /// Remove from whichever list holds the entry.
    pub fn unlink(&mut self, idx: RxIdx) {
        let entry = self.arena.get_mut(idx);
        let list = entry.list;
        entry.list = ListId::None;
        let queue = match list {
            ListId::Posted => &mut self.posted,
            ListId::Buffered => &mut self.buffered,
            ListId::Work => &mut self.work,
            ListId::None => panic!("RX entry {idx} unlinked while free"),
        };
        let pos = queue
            .iter()
            .position(|&i| i == idx)
            .unwrap_or_else(|| panic!("RX entry {idx} missing from its list"));
        queue.remove(pos);
    }
}

struct EagerSlabShared {
    used: AtomicU64,
    cap: u64,
}

/// Accounting wrapper over provider buffers for unexpected messages.
#[derive(Clone)]
pub struct EagerSlab {
    shared: Arc<EagerSlabShared>,
}

impl EagerSlab {
    pub fn new(cap: u64) -> EagerSlab {
        EagerSlab {
            shared: Arc::new(EagerSlabShared {
                used: AtomicU64::new(0),
                cap,
            }),
        }
    }

    /// Allocate an eager buffer if it fits the aggregate budget.
    pub fn alloc(&self, len: u64) -> Option<EagerBuf> {
        let old = self.shared.used.fetch_add(len, Ordering::Relaxed);
        if old + len > self.shared.cap {
            self.shared.used.fetch_sub(len, Ordering::Relaxed);
            return None;
        }
        Some(EagerBuf {
            region: MemRegion::new(len as usize),
            len,
            shared: self.shared.clone(),
        })
    }

    #[cfg(test)]
    pub fn used(&self) -> u64 {
        self.shared.used.load(Ordering::Relaxed)
    }
}

/// A provider-owned buffer; releases its budget on drop.
pub struct EagerBuf {
    pub region: Arc<MemRegion>,
    pub len: u64,
    shared: Arc<EagerSlabShared>,
}

impl Drop for EagerBuf {
    fn drop(&mut self) {
        self.shared.used.fetch_sub(self.len, Ordering::Relaxed);
    }
}

/// Receive context.
pub struct RxCtx {
    pub id: Uuid,
    pub rx_id: u8,
    pub ep: Arc<Endpoint>,
    pub inner: Mutex<RxInner>,
    pub comp: CompSet,
    pub eager: EagerSlab,
    pub min_multi_recv: u64,
    pub max_eager_sz: u64,
    signal: Mutex<Option<Arc<PeSignal>>>,
}

/// Entry cap per context; posts beyond this fail with `NoMem`.
const RX_ARENA_CAP: usize = 4096;

impl RxCtx {
    pub fn new(ep: Arc<Endpoint>, rx_id: u8, comp: CompSet) -> Arc<RxCtx> {
        let config = ep.config.clone();
        let ctx = Arc::new(RxCtx {
            id: Uuid::new_v4(),
            rx_id,
            ep: ep.clone(),
            inner: Mutex::new(RxInner {
                arena: RxArena::new(RX_ARENA_CAP),
                posted: VecDeque::new(),
                buffered: VecDeque::new(),
                work: VecDeque::new(),
            }),
            comp,
            eager: EagerSlab::new(config.total_buffered_recv),
            min_multi_recv: config.min_multi_recv,
            max_eager_sz: config.max_eager_sz,
            signal: Mutex::new(None),
        });
        ep.bind_rx(&ctx);
        ctx
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RxInner> {
        self.inner.lock().unwrap()
    }

    pub(crate) fn set_signal(&self, signal: Option<Arc<PeSignal>>) {
        *self.signal.lock().unwrap() = signal;
    }

    pub(crate) fn signal_pe(&self) {
        if let Some(signal) = self.signal.lock().unwrap().as_ref() {
            signal.signal();
        }
    }

    /// Post a receive: match it against buffered sends or queue it.
    pub fn post_recv(self: &Arc<RxCtx>, desc: RecvDesc) -> Result<(), FabricError> {
        progress::rx_post_recv(self, desc)
    }

    /// Peek at buffered sends without consuming, with optional
    /// claim/discard semantics ([`opflags::CLAIM`] / [`opflags::DISCARD`]).
    /// A hit reports a metadata completion; a miss reports `NO_MSG`. With
    /// `CLAIM`, the returned token pins the message for [`RxCtx::claim_recv`].
    pub fn peek_recv(
        self: &Arc<RxCtx>,
        addr: FabricAddr,
        tag: u64,
        ignore: u64,
        flags: u64,
        context: u64,
    ) -> Option<Claimed> {
        progress::rx_peek_recv(self, addr, tag, ignore, flags, context)
    }

    /// Consume a previously claimed message into a user buffer (or discard
    /// it when `desc.flags` carries [`opflags::DISCARD`]).
    pub fn claim_recv(self: &Arc<RxCtx>, claimed: Claimed, desc: RecvDesc) -> Result<(), FabricError> {
        progress::rx_claim_recv(self, claimed, desc)
    }
}
