//! The progress engine.
//!
//! One engine drives all asynchronous data-plane work for its registered
//! transmit and receive contexts: it polls the transport completion queue
//! and dispatches per-entry handlers, consumes incoming descriptor rings and
//! advances the receive state machine, resolves remote keys, re-runs
//! back-pressured work from the retry list, and parks on a self-pipe when
//! nothing can progress.
//!
//! All dispatch happens on the progress thread (or the caller's thread in
//! manual mode); user entry points only mutate lists under the context lock
//! and signal the engine.

use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::affinity::apply_affinity;
use crate::comp::{CqRecord, opflags};
use crate::config::{Config, ProgressMode};
use crate::conn::{Conn, ConnId, ConnState, FabricAddr};
use crate::ep::Endpoint;
use crate::error::{FabricError, status};
use crate::iov::{LocalIovState, RemoteIovState, copy_local_to_local, copy_slice_to_local};
use crate::mem::{MR_GET, MR_PUT, MR_REMOTE_GET, MR_REMOTE_PUT, MemRegion, RemoteKey};
use crate::retry::RetryOp;
use crate::rx::{Claimed, ListId, RecvDesc, RxCtx, RxEntry, RxIdx, RxInner, RxState, match_entry};
use crate::transport::{Cqe, CqContext, MsgReq, SubmitError, rx_context, tx_context};
use crate::tx::{
    PE_KEY_WAIT, PE_PROV, PeEntry, TxCtx, TxHandler, resolve_remote_keys, send_key_data,
    send_key_request, send_status, send_writedata,
};
use crate::wire::{
    AtomicOp, AtomicPay, AtomicWidth, IndirectPay, INVALID_PE_ID, KeyDataPay, MsgHdr,
    MSG_ANY_COMPLETE, MSG_DELIVERY_COMPLETE, MSG_INLINE, MSG_REMOTE_CQ_DATA, MSG_TAGGED,
    MSG_TRANSMIT_COMPLETE, OpCode, SlotBuf, StatusPay, WriteDataPay, decode_inline_send,
    decode_key_list,
};

/// Transport completions drained per TX pass.
const TX_CQ_BATCH: usize = 16;
/// Self-pipe poll interval while parked.
const WAIT_POLL_MS: u16 = 1;

/// High bit of a correlation id marking a receive-side entry. TX entry ids
/// stay below this (engine depth is far smaller), so replies can be routed
/// to whichever side issued the request.
const RX_CORR_FLAG: u16 = 0x8000;

fn rx_corr(idx: RxIdx) -> u16 {
    debug_assert!(idx < RX_CORR_FLAG as u32);
    idx as u16 | RX_CORR_FLAG
}

// ---------------------------------------------------------------------------
// Wakeup plumbing
// ---------------------------------------------------------------------------

/// Edge-triggered, coalescing wakeup: one byte is in flight through the
/// self-pipe iff the write count leads the read count.
pub struct PeSignal {
    rd: OwnedFd,
    wr: OwnedFd,
    /// (write count, read count).
    counts: Mutex<(u64, u64)>,
    auto_mode: bool,
}

impl PeSignal {
    fn new(auto_mode: bool) -> std::io::Result<Arc<PeSignal>> {
        let (rd, wr) = nix::unistd::pipe().map_err(std::io::Error::from)?;
        nix::fcntl::fcntl(
            rd.as_fd(),
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )
        .map_err(std::io::Error::from)?;
        Ok(Arc::new(PeSignal {
            rd,
            wr,
            counts: Mutex::new((0, 0)),
            auto_mode,
        }))
    }

    /// Wake the progress thread if no wake is already pending. No-op in
    /// manual mode.
    pub fn signal(&self) {
        if !self.auto_mode {
            return;
        }
        let mut counts = self.counts.lock().unwrap();
        if counts.0 == counts.1 {
            match nix::unistd::write(self.wr.as_fd(), &[0u8]) {
                Ok(1) => counts.0 += 1,
                other => error!(?other, "Failed to signal progress engine"),
            }
        }
    }

    /// Consume exactly one pending wake byte.
    fn consume(&self) {
        let mut counts = self.counts.lock().unwrap();
        if counts.1 != counts.0 {
            let mut byte = [0u8; 1];
            match nix::unistd::read(self.rd.as_fd(), &mut byte) {
                Ok(1) => counts.1 += 1,
                other => error!(?other, "Invalid signal read"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct PeLists {
    tx: Vec<Arc<TxCtx>>,
    rx: Vec<Arc<RxCtx>>,
}

pub struct ProgressEngine {
    pub id: Uuid,
    config: Arc<Config>,
    signal: Arc<PeSignal>,
    /// Registered contexts. Held across a whole tick so contexts cannot be
    /// torn down mid-iteration.
    lists: Mutex<PeLists>,
    do_progress: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    last_wait: Mutex<Option<Instant>>,
}

impl ProgressEngine {
    /// Build an engine; in [`ProgressMode::Auto`] this spawns the dedicated
    /// progress thread.
    pub fn new(config: Arc<Config>) -> std::io::Result<Arc<ProgressEngine>> {
        let auto = config.progress_mode == ProgressMode::Auto;
        let pe = Arc::new(ProgressEngine {
            id: Uuid::new_v4(),
            config: config.clone(),
            signal: PeSignal::new(auto)?,
            lists: Mutex::new(PeLists {
                tx: Vec::new(),
                rx: Vec::new(),
            }),
            do_progress: Arc::new(AtomicBool::new(auto)),
            thread: Mutex::new(None),
            last_wait: Mutex::new(None),
        });
        if auto {
            let pe_thread = pe.clone();
            let handle = std::thread::Builder::new()
                .name("braid-pe".to_string())
                .spawn(move || pe_thread.run())?;
            *pe.thread.lock().unwrap() = Some(handle);
        }
        info!(engine = %pe.id, mode = config.progress_mode.as_str(), "Progress engine started");
        Ok(pe)
    }

    /// Idempotent wake.
    pub fn signal(&self) {
        self.signal.signal();
    }

    /// Stop the progress thread and detach contexts. In-flight entries are
    /// not cancelled; callers drain before teardown.
    pub fn finalize(&self) {
        self.do_progress.store(false, Ordering::SeqCst);
        self.signal.signal();
        if let Some(handle) = self.thread.lock().unwrap().take()
            && handle.join().is_err()
        {
            error!(engine = %self.id, "Progress thread panicked");
        }
        let mut lists = self.lists.lock().unwrap();
        for tx in lists.tx.drain(..) {
            tx.set_signal(None);
        }
        for rx in lists.rx.drain(..) {
            rx.set_signal(None);
        }
        info!(engine = %self.id, "Progress engine finalized");
    }

    pub fn add_tx_ctx(&self, ctx: &Arc<TxCtx>) {
        let mut lists = self.lists.lock().unwrap();
        if lists.tx.iter().any(|c| Arc::ptr_eq(c, ctx)) {
            return;
        }
        ctx.set_signal(Some(self.signal.clone()));
        lists.tx.push(ctx.clone());
        drop(lists);
        self.signal.signal();
        debug!(engine = %self.id, ctx = %ctx.id, "TX ctx added");
    }

    pub fn add_rx_ctx(&self, ctx: &Arc<RxCtx>) {
        let mut lists = self.lists.lock().unwrap();
        if lists.rx.iter().any(|c| Arc::ptr_eq(c, ctx)) {
            return;
        }
        ctx.set_signal(Some(self.signal.clone()));
        lists.rx.push(ctx.clone());
        drop(lists);
        self.signal.signal();
        debug!(engine = %self.id, ctx = %ctx.id, "RX ctx added");
    }

    pub fn remove_tx_ctx(&self, ctx: &Arc<TxCtx>) {
        let mut lists = self.lists.lock().unwrap();
        lists.tx.retain(|c| !Arc::ptr_eq(c, ctx));
        ctx.set_signal(None);
    }

    pub fn remove_rx_ctx(&self, ctx: &Arc<RxCtx>) {
        let mut lists = self.lists.lock().unwrap();
        lists.rx.retain(|c| !Arc::ptr_eq(c, ctx));
        ctx.set_signal(None);
    }

    /// One TX pass: drain transport completions, dispatch handlers, re-run
    /// the retry list. Public for manual progress mode.
    pub fn progress_tx_ctx(&self, ctx: &TxCtx) -> Result<(), FabricError> {
        progress_tx(ctx)
    }

    /// One RX pass: consume every ready descriptor on every READY
    /// connection. Public for manual progress mode.
    pub fn progress_rx_ctx(&self, ctx: &RxCtx) -> Result<(), FabricError> {
        progress_rx(ctx)
    }

    fn run(self: Arc<Self>) {
        debug!(engine = %self.id, "Progress thread running");
        if let Some(spec) = &self.config.pe_affinity {
            apply_affinity(spec);
        }
        while self.do_progress.load(Ordering::SeqCst) {
            let lists = self.lists.lock().unwrap();
            if self.wait_ok(&lists) {
                drop(lists);
                self.wait();
                continue;
            }
            for tx in &lists.tx {
                if let Err(e) = progress_tx(tx) {
                    warn!(engine = %self.id, ctx = %tx.id, error = %e, "TX ctx aborted this pass");
                }
            }
            for rx in &lists.rx {
                if let Err(e) = progress_rx(rx) {
                    warn!(engine = %self.id, ctx = %rx.id, error = %e, "RX ctx aborted this pass");
                }
            }
        }
        debug!(engine = %self.id, "Progress thread terminated");
    }

    /// Sleeping is allowed only when no retry work is queued, every TX
    /// engine is fully idle, and no RX context has posted or buffered
    /// entries that could progress. Debounced to once per waittime window.
    fn wait_ok(&self, lists: &PeLists) -> bool {
        if let Some(last) = *self.last_wait.lock().unwrap()
            && last.elapsed() < Duration::from_millis(self.config.pe_waittime_ms)
        {
            return false;
        }
        for tx in &lists.tx {
            if !tx.ep.retry.is_empty() || !tx.ep.tx.all_free() {
                return false;
            }
        }
        for rx in &lists.rx {
            let inner = rx.lock();
            if !inner.posted.is_empty() || !inner.buffered.is_empty() {
                return false;
            }
        }
        true
    }

    fn wait(&self) {
        let mut fds = [PollFd::new(self.signal.rd.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(WAIT_POLL_MS)) {
            Err(e) => error!(engine = %self.id, error = %e, "poll failed"),
            Ok(n) if n > 0 => self.signal.consume(),
            Ok(_) => {}
        }
        *self.last_wait.lock().unwrap() = Some(Instant::now());
    }
}

// ---------------------------------------------------------------------------
// TX progress: completion dispatch, RMA driver, retry drain
// ---------------------------------------------------------------------------

fn progress_tx(ctx: &TxCtx) -> Result<(), FabricError> {
    let ep = &ctx.ep;
    let cqes = ep.tx.queue.poll_cq(TX_CQ_BATCH);
    for cqe in &cqes {
        match CqContext::decode(cqe.context) {
            CqContext::Ignore => {
                if cqe.status < 0 {
                    error!(status = cqe.status, "Control I/O failed");
                    return Err(FabricError::Io);
                }
            }
            CqContext::Tx(idx) => tx_entry_event(ep, idx, Some(cqe)),
            CqContext::Rx(idx) => rx_get_event(ep, idx, cqe),
        }
    }
    drain_retries(ep);
    Ok(())
}

/// Dispatch one completion (or synthesized event, `cqe == None`) to the
/// entry's stored handler.
pub(crate) fn tx_entry_event(ep: &Endpoint, idx: u16, cqe: Option<&Cqe>) {
    let mut entry = ep.tx.take(idx);
    if let Some(cqe) = cqe
        && cqe.status < 0
    {
        entry.status.update(status::IO);
    }
    debug_assert!(entry.completions > 0, "TX entry {idx} event with no completions");
    entry.completions -= 1;

    match entry.handler {
        TxHandler::Msg => {
            if entry.completions > 0 {
                ep.tx.put_back(idx, entry);
                return;
            }
            if entry.pe_flags & PE_PROV == 0 {
                report_tx_complete(ep, &entry);
            } else if let Some(user_idx) = entry.user_entry {
                // Control message that deferred a user completion (e.g.
                // WRITEDATA after an RMA write): report and free the user
                // entry now that the notification is on the wire.
                let user = ep.tx.take(user_idx);
                report_tx_complete(ep, &user);
                ep.tx.release(user_idx, user);
            }
            ep.tx.release(idx, entry);
        }
        TxHandler::Rma => {
            if let Some(cqe) = cqe
                && entry.completions == 0
                && entry.flags & (opflags::INJECT | opflags::READ)
                    == (opflags::INJECT | opflags::READ)
            {
                // Immediate read: the data rides in the CQE.
                copy_slice_to_local(&mut entry.lstate, &cqe.result[..cqe.result_len]);
            }
            tx_rma_drive(ep, idx, entry);
        }
        TxHandler::Atomic => {
            if entry.completions > 0 {
                ep.tx.put_back(idx, entry);
                return;
            }
            // The STATUS reply parked the pre-image in `rem`.
            if let Some(result) = &entry.result {
                result.set(entry.rem);
            }
            if entry.flags & opflags::REMOTE_CQ_DATA != 0
                && let Some(conn) = ep.conn(entry.conn)
                && send_writedata(ep, &conn, idx, entry.flags, entry.cq_data).is_ok()
            {
                ep.tx.put_back(idx, entry);
                return;
            }
            report_tx_complete(ep, &entry);
            ep.tx.release(idx, entry);
        }
    }
}

pub(crate) fn report_tx_complete(ep: &Endpoint, entry: &PeEntry) {
    let record = CqRecord {
        context: entry.context,
        flags: entry.flags & !(opflags::REMOTE_READ | opflags::REMOTE_WRITE),
        len: 0,
        data: 0,
        tag: 0,
        addr: entry.addr,
    };
    ep.tx_comp.report_complete(record, entry.status.get(), entry.rem);
}

/// Validate every resolved remote segment against the requested access.
pub(crate) fn check_remote_access(rstate: &RemoteIovState, access: u8) -> i32 {
    for seg in &rstate.segs {
        let Some(rkey) = &seg.rkey else {
            return status::NO_KEY;
        };
        if let Err(s) = rkey.check_access(seg.vaddr, seg.len, access) {
            return s;
        }
    }
    status::OK
}

/// Re-enter the RMA driver for an installed entry.
pub(crate) fn tx_rma_tick(ep: &Endpoint, idx: u16) {
    let entry = ep.tx.take(idx);
    tx_rma_drive(ep, idx, entry);
}

/// The RMA driver: issue up to the per-tick op/byte budget, then either
/// park the entry (work outstanding), queue a retry (back-pressure), emit
/// WRITEDATA, or report terminal completion.
fn tx_rma_drive(ep: &Endpoint, idx: u16, mut entry: PeEntry) {
    let Some(conn) = ep.conn(entry.conn) else {
        panic!("TX entry {idx} references unknown connection");
    };
    let write = entry.flags & opflags::WRITE != 0;

    if !entry.status.is_err() && entry.pe_flags & PE_KEY_WAIT != 0 {
        if entry.completions > 0 {
            ep.tx.put_back(idx, entry);
            return;
        }
        entry.pe_flags &= !PE_KEY_WAIT;
        resolve_remote_keys(&conn, &mut entry.rstate);
        let access = if write { MR_REMOTE_PUT } else { MR_REMOTE_GET };
        entry.status.update(check_remote_access(&entry.rstate, access));
    }

    if !entry.status.is_err() {
        if entry.completions >= ep.config.max_io_ops {
            ep.tx.put_back(idx, entry);
            return;
        }
        if entry.flags & opflags::INJECT != 0 {
            if entry.rem > 0
                && let Some((seg, vaddr, _)) = entry.rstate.cur()
            {
                let res = if write {
                    ep.tx.queue.submit_put_imm(
                        conn.route,
                        vaddr,
                        seg.key,
                        &entry.inline_data[..entry.inline_len],
                        tx_context(idx),
                    )
                } else {
                    ep.tx.queue.submit_get_imm(
                        conn.route,
                        vaddr,
                        seg.key,
                        entry.rem,
                        tx_context(idx),
                    )
                };
                match res {
                    Ok(()) => {
                        entry.completions += 1;
                        entry.rem = 0;
                        ep.tx.put_back(idx, entry);
                        return;
                    }
                    Err(SubmitError::Again) => {
                        ep.tx.put_back(idx, entry);
                        ep.retry.push(RetryOp::TxRma { idx });
                        return;
                    }
                    Err(SubmitError::Fatal(s)) => entry.status.update(s),
                }
            }
        } else {
            let mut budget = entry.rem.min(ep.config.max_io_bytes);
            let mut issued = 0u32;
            while budget > 0 && entry.completions < ep.config.max_io_ops {
                let Some((lreg, loff, lleft)) = entry
                    .lstate
                    .cur()
                    .map(|(r, o, l)| (r.clone(), o, l))
                else {
                    break;
                };
                let Some((seg_key, vaddr, rleft)) =
                    entry.rstate.cur().map(|(s, v, l)| (s.key, v, l))
                else {
                    break;
                };
                let n = budget.min(lleft).min(rleft);
                if n == 0 {
                    break;
                }
                let req = crate::transport::XferReq {
                    route: conn.route,
                    vaddr,
                    key: seg_key,
                    local: crate::iov::LocalSeg {
                        region: lreg,
                        off: loff,
                        len: n,
                    },
                    len: n,
                    context: tx_context(idx),
                };
                let res = if write {
                    ep.tx.queue.submit_put(req)
                } else {
                    ep.tx.queue.submit_get(req)
                };
                match res {
                    Ok(()) => {
                        entry.lstate.advance(n);
                        entry.rstate.advance(n);
                        entry.rem -= n;
                        budget -= n;
                        entry.completions += 1;
                        issued += 1;
                    }
                    Err(SubmitError::Again) => {
                        if issued == 0 {
                            ep.tx.put_back(idx, entry);
                            ep.retry.push(RetryOp::TxRma { idx });
                            return;
                        }
                        break;
                    }
                    Err(SubmitError::Fatal(s)) => {
                        entry.status.update(s);
                        break;
                    }
                }
            }
        }
    }

    if entry.completions > 0 {
        ep.tx.put_back(idx, entry);
        return;
    }
    if entry.flags & (opflags::REMOTE_READ | opflags::REMOTE_WRITE | opflags::REMOTE_CQ_DATA) != 0
        && send_writedata(ep, &conn, idx, entry.flags, entry.cq_data).is_ok()
    {
        // Local completion is deferred until the notification completes.
        ep.tx.put_back(idx, entry);
        return;
    }
    report_tx_complete(ep, &entry);
    ep.tx.release(idx, entry);
}

fn drain_retries(ep: &Endpoint) {
    if ep.retry.is_empty() {
        return;
    }
    let ops = ep.retry.splice();
    for op in ops {
        match op {
            RetryOp::MsgSaved { entry, slot } => retry_msg_saved(ep, entry, slot),
            RetryOp::MsgRing { idx } => retry_msg_ring(ep, idx),
            RetryOp::TxRma { idx } => tx_rma_tick(ep, idx),
            RetryOp::RxGet { idx } => {
                if let Some(rx) = ep.rx_ctx() {
                    rx_get(ep, &rx, idx, true);
                }
            }
        }
    }
}

/// Retry a ring write after the message's slot could not be submitted. A
/// hard failure here is protocol corruption and aborts.
fn retry_submit(ep: &Endpoint, conn: &Conn, idx: u16, slot: SlotBuf) {
    match ep.tx.queue.submit_msg(MsgReq {
        route: conn.route,
        slot,
        context: tx_context(idx),
    }) {
        Ok(()) => {}
        Err(SubmitError::Again) => ep.retry.push(RetryOp::MsgRing { idx }),
        Err(SubmitError::Fatal(s)) => panic!("retry ring write failed: {s}"),
    }
}

fn retry_msg_saved(ep: &Endpoint, mut entry: Box<PeEntry>, slot: Box<SlotBuf>) {
    let idx = match ep.tx.reserve(entry.pe_flags & PE_PROV != 0) {
        Ok(idx) => idx,
        Err(_) => {
            ep.retry.push(RetryOp::MsgSaved { entry, slot });
            return;
        }
    };
    let Some(conn) = ep.conn(entry.conn) else {
        panic!("retry for unknown connection");
    };
    entry.completions = 1;
    entry.saved_slot = Some(slot.clone());
    ep.tx.install(idx, *entry);
    retry_submit(ep, &conn, idx, *slot);
}

fn retry_msg_ring(ep: &Endpoint, idx: u16) {
    let entry = ep.tx.take(idx);
    let slot = **entry
        .saved_slot
        .as_ref()
        .expect("ring retry without saved slot");
    let Some(conn) = ep.conn(entry.conn) else {
        panic!("retry for unknown connection");
    };
    ep.tx.put_back(idx, entry);
    retry_submit(ep, &conn, idx, slot);
}

// ---------------------------------------------------------------------------
// RX progress: ring reader and opcode dispatch
// ---------------------------------------------------------------------------

fn progress_rx(ctx: &RxCtx) -> Result<(), FabricError> {
    let ep = &ctx.ep;
    for conn in ep.conns.snapshot() {
        if conn.state() != ConnState::Ready {
            continue;
        }
        loop {
            let Some(slot) = conn.ring.lock().unwrap().peek() else {
                break;
            };
            let hdr = MsgHdr::decode(&slot);
            let res = match hdr.opcode() {
                Ok(op) => dispatch_rx_msg(ep, ctx, &conn, op, hdr, &slot),
                Err(e) => {
                    error!(conn = conn.id.0, op = hdr.op, "Illegal opcode");
                    Err(e)
                }
            };
            // Release the slot before acting on errors so credit still
            // flows back to the sender.
            conn.ring.lock().unwrap().release();
            res?;
        }
    }
    Ok(())
}

fn dispatch_rx_msg(
    ep: &Endpoint,
    rx: &RxCtx,
    conn: &Arc<Conn>,
    op: OpCode,
    hdr: MsgHdr,
    slot: &SlotBuf,
) -> Result<(), FabricError> {
    match op {
        OpCode::Send => rx_handle_send(ep, rx, conn, hdr, slot),
        OpCode::Atomic => rx_handle_atomic(ep, conn, hdr, slot),
        OpCode::Status => rx_handle_status(ep, hdr, slot),
        OpCode::WriteData => rx_handle_writedata(rx, conn, hdr, slot),
        OpCode::KeyRequest => rx_handle_key_request(ep, conn, hdr, slot),
        OpCode::KeyExport | OpCode::KeyResponse => rx_handle_key_import(ep, rx, conn, hdr, slot),
        OpCode::KeyRevoke => rx_handle_key_revoke(conn, hdr, slot),
    }
}

fn rx_handle_status(ep: &Endpoint, hdr: MsgHdr, slot: &SlotBuf) -> Result<(), FabricError> {
    let pay = StatusPay::decode(slot);
    if hdr.pe_entry_id == INVALID_PE_ID {
        warn!("STATUS with no entry to correlate");
        return Ok(());
    }
    if hdr.pe_entry_id & RX_CORR_FLAG != 0 {
        // Terminal status for a receive-side key request.
        let Some(rx) = ep.rx_ctx() else {
            return Ok(());
        };
        let idx = (hdr.pe_entry_id & !RX_CORR_FLAG) as RxIdx;
        {
            let mut inner = rx.lock();
            let entry = inner.arena.get_mut(idx);
            entry.status.update(pay.status);
            entry.key_wait = false;
        }
        rx_get(ep, &rx, idx, false);
        return Ok(());
    }
    let idx = hdr.pe_entry_id;
    let mut entry = ep.tx.take(idx);
    entry.status.update(pay.status);
    entry.rem = pay.rem;
    ep.tx.put_back(idx, entry);
    tx_entry_event(ep, idx, None);
    Ok(())
}

fn rx_handle_writedata(
    rx: &RxCtx,
    conn: &Conn,
    _hdr: MsgHdr,
    slot: &SlotBuf,
) -> Result<(), FabricError> {
    let pay = WriteDataPay::decode(slot);
    let mut flags = pay.flags
        & (opflags::REMOTE_READ
            | opflags::REMOTE_WRITE
            | opflags::REMOTE_CQ_DATA
            | opflags::RMA
            | opflags::ATOMIC);
    if flags & (opflags::REMOTE_WRITE | opflags::REMOTE_CQ_DATA) == opflags::REMOTE_CQ_DATA {
        flags |= opflags::REMOTE_WRITE;
    }
    let record = CqRecord {
        context: 0,
        flags,
        len: 0,
        data: pay.cq_data,
        tag: 0,
        addr: conn.peer,
    };
    rx.comp.report_complete(record, 0, 0);
    Ok(())
}

/// Execute an atomic natively at the requested width on a validated region
/// offset, returning the pre-image.
fn atomic_execute(
    region: &MemRegion,
    off: u64,
    op: AtomicOp,
    width: AtomicWidth,
    operand: u64,
    compare: u64,
) -> u64 {
    use std::sync::atomic::Ordering::SeqCst;
    use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, AtomicU64};

    let ptr = region.raw_at(off);
    macro_rules! run {
        ($atomic:ident, $ty:ty) => {{
            // SAFETY: bounds and natural alignment validated by the caller.
            let a = unsafe { $atomic::from_ptr(ptr as *mut $ty) };
            let o = operand as $ty;
            let c = compare as $ty;
            (match op {
                AtomicOp::Read => a.load(SeqCst),
                AtomicOp::Write => {
                    a.store(o, SeqCst);
                    0
                }
                AtomicOp::Band => a.fetch_and(o, SeqCst),
                AtomicOp::Bor => a.fetch_or(o, SeqCst),
                AtomicOp::Bxor => a.fetch_xor(o, SeqCst),
                AtomicOp::Cswap => match a.compare_exchange(c, o, SeqCst, SeqCst) {
                    Ok(prev) | Err(prev) => prev,
                },
                AtomicOp::Sum => a.fetch_add(o, SeqCst),
            }) as u64
        }};
    }
    match width {
        AtomicWidth::U8 => run!(AtomicU8, u8),
        AtomicWidth::U16 => run!(AtomicU16, u16),
        AtomicWidth::U32 => run!(AtomicU32, u32),
        AtomicWidth::U64 => run!(AtomicU64, u64),
    }
}

fn rx_handle_atomic(
    ep: &Endpoint,
    conn: &Conn,
    hdr: MsgHdr,
    slot: &SlotBuf,
) -> Result<(), FabricError> {
    let mut st = status::NO_KEY;
    let mut rem = 0u64;
    match AtomicPay::decode(slot) {
        Ok(pay) => {
            if let Some(mr) = ep.mrs.find(pay.key) {
                match mr.check_access(pay.vaddr, pay.width.bytes(), MR_GET | MR_PUT) {
                    Ok(off) if off % pay.width.bytes() == 0 => {
                        rem = atomic_execute(
                            &mr.region,
                            off,
                            pay.op,
                            pay.width,
                            pay.operand,
                            pay.compare,
                        );
                        st = status::OK;
                    }
                    Ok(_) => st = status::IO,
                    Err(s) => st = s,
                }
            }
        }
        Err(_) => st = status::NOT_IMPLEMENTED,
    }
    if hdr.flags & MSG_DELIVERY_COMPLETE != 0 {
        send_status(ep, conn, hdr, st, rem);
    }
    Ok(())
}

fn rx_handle_key_request(
    ep: &Endpoint,
    conn: &Conn,
    hdr: MsgHdr,
    slot: &SlotBuf,
) -> Result<(), FabricError> {
    for key in decode_key_list(slot, &hdr) {
        match ep.mrs.find(key) {
            Some(mr) => send_key_data(ep, conn, OpCode::KeyResponse, hdr.pe_entry_id, &mr),
            None => send_status(ep, conn, hdr, status::NO_KEY, 0),
        }
    }
    Ok(())
}

fn rx_handle_key_import(
    ep: &Endpoint,
    rx: &RxCtx,
    conn: &Arc<Conn>,
    hdr: MsgHdr,
    slot: &SlotBuf,
) -> Result<(), FabricError> {
    let pay = KeyDataPay::decode(slot);
    conn.keys.insert(RemoteKey {
        key: pay.key,
        base: pay.base,
        len: pay.len,
        access: pay.access,
    });
    debug!(conn = conn.id.0, key = pay.key.id, "Installed remote key");
    // A response to a TX entry's request re-drives that entry; receive-side
    // fetches parked on this key are re-driven by the scan.
    if hdr.pe_entry_id != INVALID_PE_ID && hdr.pe_entry_id & RX_CORR_FLAG == 0 {
        tx_entry_event(ep, hdr.pe_entry_id, None);
    }
    rekey_rx_scan(ep, rx, conn);
    Ok(())
}

fn rx_handle_key_revoke(conn: &Conn, hdr: MsgHdr, slot: &SlotBuf) -> Result<(), FabricError> {
    for key in decode_key_list(slot, &hdr) {
        if !conn.keys.revoke(key) {
            debug!(conn = conn.id.0, key = key.id, "Revoke for unknown key");
        }
    }
    Ok(())
}

/// Re-drive key-waiting receive entries whose remote keys are now cached.
fn rekey_rx_scan(ep: &Endpoint, rx: &RxCtx, conn: &Arc<Conn>) {
    let mut ready = Vec::new();
    {
        let mut inner = rx.lock();
        let idxs: Vec<RxIdx> = inner
            .work
            .iter()
            .chain(inner.buffered.iter())
            .copied()
            .collect();
        for idx in idxs {
            let entry = inner.arena.get_mut(idx);
            if !entry.key_wait || entry.conn != conn.id {
                continue;
            }
            resolve_remote_keys(conn, &mut entry.rstate);
            if entry.rstate.missing == 0 {
                entry.key_wait = false;
                ready.push(idx);
            }
        }
    }
    for idx in ready {
        rx_get(ep, rx, idx, false);
    }
}

// ---------------------------------------------------------------------------
// RX state machine
// ---------------------------------------------------------------------------

fn rx_basic_init(
    entry: &mut RxEntry,
    conn: &Conn,
    hdr: MsgHdr,
    msg_len: u64,
    tag: u64,
    cq_data: u64,
    flags: u64,
) {
    entry.conn = conn.id;
    entry.addr = conn.peer;
    entry.completions = 0;
    entry.rem = msg_len;
    entry.total_len = msg_len;
    entry.cq_data = cq_data;
    entry.tag = tag;
    entry.hdr = hdr;
    entry.flags |= flags;
}

/// Classify an unexpected (or multi-recv shadow) arrival. Returns true when
/// the entry should try the eager path.
fn rx_buffered_init(
    entry: &mut RxEntry,
    hdr: MsgHdr,
    inline: Option<&[u8]>,
    pay: Option<&IndirectPay>,
    has_user: bool,
    max_eager_sz: u64,
) -> bool {
    if hdr.flags & MSG_INLINE != 0 {
        let data = inline.expect("inline send without payload");
        entry.inline_data[..data.len()].copy_from_slice(data);
        entry.state = RxState::Inline;
        return false;
    }
    let pay = pay.expect("indirect send without payload");
    entry.rstate = RemoteIovState::single(pay.vaddr, pay.len, pay.key);
    if has_user || entry.total_len > max_eager_sz {
        entry.state = RxState::Rnd;
        return false;
    }
    entry.state = RxState::Eager;
    true
}

fn rx_handle_send(
    ep: &Endpoint,
    rx: &RxCtx,
    conn: &Arc<Conn>,
    hdr: MsgHdr,
    slot: &SlotBuf,
) -> Result<(), FabricError> {
    let mut flags = opflags::RECV;
    let (msg_len, tag, cq_data, inline, pay);
    if hdr.flags & MSG_INLINE != 0 {
        let (data, t, c) = decode_inline_send(slot, &hdr);
        msg_len = data.len() as u64;
        tag = t;
        cq_data = c;
        inline = Some(data);
        pay = None;
    } else {
        let p = IndirectPay::decode(slot);
        msg_len = p.len;
        tag = p.tag;
        cq_data = p.cq_data;
        inline = None;
        pay = Some(p);
    }
    if hdr.flags & MSG_TAGGED != 0 {
        flags |= opflags::TAGGED;
    }
    if hdr.flags & MSG_REMOTE_CQ_DATA != 0 {
        flags |= opflags::REMOTE_CQ_DATA;
    }

    let mut inner = rx.lock();

    let mut matched = None;
    for &idx in &inner.posted {
        let entry = inner.arena.get(idx);
        if match_entry(entry, false, conn.peer, tag, entry.ignore, flags) {
            matched = Some(idx);
            break;
        }
    }

    let Some(pidx) = matched else {
        // Unexpected arrival: buffer it.
        let Some(bidx) = inner.arena.alloc(RxEntry::blank(conn.id)) else {
            error!(ctx = %rx.id, "RX entry allocation failed");
            return Err(FabricError::NoMem);
        };
        {
            let entry = inner.arena.get_mut(bidx);
            rx_basic_init(entry, conn, hdr, msg_len, tag, cq_data, flags);
        }
        inner.link(bidx, ListId::Buffered);
        let go_eager = rx_buffered_init(
            inner.arena.get_mut(bidx),
            hdr,
            inline,
            pay.as_ref(),
            false,
            rx.max_eager_sz,
        );
        if !go_eager {
            return Ok(());
        }
        match rx.eager.alloc(msg_len) {
            Some(buf) => {
                let entry = inner.arena.get_mut(bidx);
                entry.lstate = LocalIovState::single(buf.region.clone(), 0, msg_len);
                entry.eager = Some(buf);
                drop(inner);
                rx_get(ep, rx, bidx, false);
            }
            None => {
                // Eager allocation failed, fall back to rendezvous.
                inner.arena.get_mut(bidx).state = RxState::Rnd;
            }
        }
        return Ok(());
    };

    if inner.arena.get(pidx).flags & opflags::MULTI_RECV != 0 {
        // A shadow entry owns this message's slice of the multi-recv
        // buffer; the posted entry stays live until below-watermark.
        let Some(bidx) = inner.arena.alloc(RxEntry::blank(conn.id)) else {
            error!(ctx = %rx.id, "RX entry allocation failed");
            return Err(FabricError::NoMem);
        };
        {
            let entry = inner.arena.get_mut(bidx);
            rx_basic_init(entry, conn, hdr, msg_len, tag, cq_data, flags);
        }
        inner.link(bidx, ListId::Work);
        rx_buffered_init(
            inner.arena.get_mut(bidx),
            hdr,
            inline,
            pay.as_ref(),
            true,
            rx.max_eager_sz,
        );
        rx_user_claim(ep, rx, inner, bidx, pidx, true);
        return Ok(());
    }

    // A single posted receive: the message lands straight in it.
    inner.unlink(pidx);
    inner.link(pidx, ListId::Work);
    {
        let entry = inner.arena.get_mut(pidx);
        rx_basic_init(entry, conn, hdr, msg_len, tag, cq_data, flags);
    }
    if let Some(data) = inline {
        let entry = inner.arena.get_mut(pidx);
        let copied = copy_slice_to_local(&mut entry.lstate, data);
        entry.rem = msg_len - copied;
        rx_complete(ep, rx, pidx, 0, Some(inner));
        return Ok(());
    }
    let pay = pay.expect("indirect send without payload");
    {
        let entry = inner.arena.get_mut(pidx);
        entry.rstate = RemoteIovState::single(pay.vaddr, pay.len, pay.key);
        entry.state = RxState::RndDirect;
    }
    drop(inner);
    rx_get(ep, rx, pidx, false);
    Ok(())
}

/// Bind a buffered message to a user receive. The buffered entry is already
/// on the work list; the caller passes the lock in (`user_linked` says
/// whether the user entry is already on the posted list).
fn rx_user_claim(
    ep: &Endpoint,
    rx: &RxCtx,
    mut inner: MutexGuard<'_, RxInner>,
    bidx: RxIdx,
    uidx: RxIdx,
    user_linked: bool,
) {
    let (uflags, ucontext, ulstate) = {
        let user = inner.arena.get(uidx);
        (user.flags, user.context, user.lstate.clone())
    };
    let (state, msg_len) = {
        let entry = inner.arena.get_mut(bidx);
        if entry.state == RxState::Eager {
            entry.state = RxState::EagerClaimed;
        }
        entry.flags |= uflags & opflags::COMPLETION;
        entry.context = ucontext;
        entry.ustate = ulstate;
        let avail = entry.ustate.avail();
        (entry.state, entry.total_len.min(avail))
    };

    if uflags & opflags::MULTI_RECV != 0 {
        let avail = inner.arena.get(uidx).lstate.avail();
        inner.arena.get_mut(uidx).lstate.advance(msg_len);
        if avail - msg_len < rx.min_multi_recv {
            // Below the watermark: retire the posted buffer with this
            // message's completion.
            inner.arena.get_mut(bidx).flags |= opflags::MULTI_RECV;
            if user_linked {
                inner.unlink(uidx);
            }
            inner.link(uidx, ListId::Work);
            inner.arena.get_mut(uidx).state = RxState::Drop;
        } else if !user_linked {
            inner.link(uidx, ListId::Posted);
        }
    } else {
        if user_linked {
            inner.unlink(uidx);
        }
        inner.link(uidx, ListId::Work);
        inner.arena.get_mut(uidx).state = RxState::Drop;
    }

    match state {
        RxState::Rnd => {
            {
                let entry = inner.arena.get_mut(bidx);
                entry.state = RxState::RndDirect;
                entry.lstate = entry.ustate.clone();
            }
            drop(inner);
            rx_get(ep, rx, bidx, false);
        }
        RxState::EagerClaimed => {
            // Fetch still in flight; completion copies out.
            drop(inner);
        }
        RxState::EagerDone => {
            {
                let entry = inner.arena.get_mut(bidx);
                entry.lstate.reset();
                let mut lstate = std::mem::take(&mut entry.lstate);
                let mut ustate = std::mem::take(&mut entry.ustate);
                let copied = copy_local_to_local(&mut ustate, &mut lstate, msg_len);
                entry.lstate = lstate;
                entry.ustate = ustate;
                entry.rem = entry.total_len - copied;
            }
            rx_complete(ep, rx, bidx, 0, Some(inner));
        }
        RxState::Inline => {
            {
                let entry = inner.arena.get_mut(bidx);
                let mut ustate = std::mem::take(&mut entry.ustate);
                let copied =
                    copy_slice_to_local(&mut ustate, &entry.inline_data[..entry.total_len as usize]);
                entry.ustate = ustate;
                entry.rem = entry.total_len - copied;
            }
            rx_complete(ep, rx, bidx, 0, Some(inner));
        }
        other => panic!("buffered RX entry {bidx} claimed in bad state {other:?}"),
    }
}

pub(crate) fn rx_post_recv(rx: &Arc<RxCtx>, desc: RecvDesc) -> Result<(), FabricError> {
    let ep = rx.ep.clone();
    let flags = desc.flags | opflags::RECV;
    let mut inner = rx.lock();
    let mut user = RxEntry::blank(ConnId(u32::MAX));
    user.addr = desc.addr;
    user.tag = desc.tag;
    user.ignore = desc.ignore;
    user.flags = flags;
    user.context = desc.context;
    user.lstate = desc.iov;
    let Some(uidx) = inner.arena.alloc(user) else {
        return Err(FabricError::NoMem);
    };

    let mut found = None;
    for &bidx in &inner.buffered {
        if match_entry(
            inner.arena.get(bidx),
            true,
            desc.addr,
            desc.tag,
            desc.ignore,
            flags,
        ) {
            found = Some(bidx);
            break;
        }
    }
    match found {
        Some(bidx) => {
            inner.unlink(bidx);
            inner.link(bidx, ListId::Work);
            rx_user_claim(&ep, rx, inner, bidx, uidx, false);
        }
        None => {
            inner.link(uidx, ListId::Posted);
            drop(inner);
        }
    }
    rx.signal_pe();
    Ok(())
}

pub(crate) fn rx_peek_recv(
    rx: &Arc<RxCtx>,
    addr: FabricAddr,
    tag: u64,
    ignore: u64,
    flags: u64,
    context: u64,
) -> Option<Claimed> {
    let ep = rx.ep.clone();
    let flags = flags | opflags::RECV;
    let mut inner = rx.lock();

    let mut found = None;
    for &bidx in &inner.buffered {
        if match_entry(inner.arena.get(bidx), true, addr, tag, ignore, flags) {
            found = Some(bidx);
            break;
        }
    }
    let Some(bidx) = found else {
        drop(inner);
        let record = CqRecord {
            context,
            flags,
            len: 0,
            data: 0,
            tag,
            addr,
        };
        rx.comp.report_complete(record, status::NO_MSG, 0);
        return None;
    };

    let record = {
        let entry = inner.arena.get(bidx);
        CqRecord {
            context,
            flags: entry.flags | (flags & opflags::COMPLETION),
            len: entry.total_len,
            data: entry.cq_data,
            tag: entry.tag,
            addr: entry.addr,
        }
    };
    let mut claimed = None;
    if flags & opflags::DISCARD != 0 {
        rx_discard_recv(&ep, rx, inner, bidx);
    } else if flags & opflags::CLAIM != 0 {
        inner.arena.get_mut(bidx).flags |= opflags::CLAIM;
        inner.unlink(bidx);
        inner.link(bidx, ListId::Work);
        claimed = Some(Claimed { idx: bidx });
        drop(inner);
    } else {
        drop(inner);
    }
    rx.comp.report_complete(record, 0, 0);
    claimed
}

pub(crate) fn rx_claim_recv(
    rx: &Arc<RxCtx>,
    claimed: Claimed,
    desc: RecvDesc,
) -> Result<(), FabricError> {
    let ep = rx.ep.clone();
    if desc.flags & opflags::DISCARD != 0 {
        let record = CqRecord {
            context: desc.context,
            flags: desc.flags | opflags::RECV,
            len: 0,
            data: 0,
            tag: desc.tag,
            addr: desc.addr,
        };
        rx.comp.report_complete(record, 0, 0);
        let inner = rx.lock();
        rx_discard_recv(&ep, rx, inner, claimed.idx);
        return Ok(());
    }
    let mut inner = rx.lock();
    let mut user = RxEntry::blank(ConnId(u32::MAX));
    user.addr = desc.addr;
    user.tag = desc.tag;
    user.ignore = desc.ignore;
    user.flags = desc.flags | opflags::RECV;
    user.context = desc.context;
    user.lstate = desc.iov;
    let Some(uidx) = inner.arena.alloc(user) else {
        return Err(FabricError::NoMem);
    };
    rx_user_claim(&ep, rx, inner, claimed.idx, uidx, false);
    Ok(())
}

/// Drop a buffered message. An entry whose fetch is still in flight is
/// parked in `Discard` until its completions drain; otherwise it is freed
/// now (acknowledging the sender if it asked).
fn rx_discard_recv(ep: &Endpoint, rx: &RxCtx, mut inner: MutexGuard<'_, RxInner>, idx: RxIdx) {
    inner.unlink(idx);
    let state = inner.arena.get(idx).state;
    if state == RxState::Eager || state == RxState::EagerClaimed {
        let entry = inner.arena.get_mut(idx);
        entry.state = RxState::Discard;
        inner.link(idx, ListId::Work);
        drop(inner);
        return;
    }
    let (hdr, conn_id) = {
        let entry = inner.arena.get(idx);
        (entry.hdr, entry.conn)
    };
    inner.arena.release(idx);
    drop(inner);
    if hdr.flags & MSG_ANY_COMPLETE != 0
        && let Some(conn) = ep.conn(conn_id)
    {
        send_status(ep, &conn, hdr, 0, 0);
    }
}

/// One transport completion for a receive-side fetch.
fn rx_get_event(ep: &Endpoint, idx: RxIdx, cqe: &Cqe) {
    let Some(rx) = ep.rx_ctx() else {
        error!("RX fetch completion with no receive context");
        return;
    };
    {
        let mut inner = rx.lock();
        let entry = inner.arena.get_mut(idx);
        if cqe.status < 0 {
            entry.status.update(status::IO);
        }
        debug_assert!(entry.completions > 0, "RX entry {idx} event with no completions");
        entry.completions -= 1;
    }
    rx_get(ep, &rx, idx, false);
}

/// Advance one receive entry's fetch: resolve keys on the first tick, issue
/// up to the per-tick op/byte budget, and on fully-drained completions run
/// the terminal transition for the entry's state.
pub(crate) fn rx_get(ep: &Endpoint, rx: &RxCtx, idx: RxIdx, retry: bool) {
    let mut inner = rx.lock();

    let state = inner.arena.get(idx).state;
    let failed = inner.arena.get(idx).status.is_err();
    if !failed {
        match state {
            RxState::Eager | RxState::EagerClaimed | RxState::RndDirect | RxState::RndBuf => {
                let entry = inner.arena.get_mut(idx);
                if entry.total_len == entry.rem && !retry {
                    // First tick: resolve and validate the remote side.
                    let Some(conn) = ep.conn(entry.conn) else {
                        panic!("RX entry {idx} references unknown connection");
                    };
                    resolve_remote_keys(&conn, &mut entry.rstate);
                    if entry.rstate.missing != 0 {
                        let first_wait = !entry.key_wait;
                        entry.key_wait = true;
                        let keys = entry.rstate.missing_keys();
                        drop(inner);
                        if first_wait {
                            send_key_request(ep, &conn, rx_corr(idx), &keys);
                        }
                        return;
                    }
                    entry.key_wait = false;
                    let rc = check_remote_access(&entry.rstate, MR_REMOTE_GET);
                    if rc < 0 {
                        entry.status.update(rc);
                    }
                }
            }
            RxState::Discard => {
                if inner.arena.get(idx).completions > 0 {
                    return;
                }
                rx_discard_recv(ep, rx, inner, idx);
                return;
            }
            other => panic!("RX entry {idx} fetched in bad state {other:?}"),
        }
    }

    // Issue phase: plan chunks from cloned cursors, submit unlocked, then
    // commit. Only the progress path mutates cursors, so this is safe
    // against concurrent claims (which touch flags/context/ustate only).
    if !inner.arena.get(idx).status.is_err() {
        let (conn_id, mut lstate, mut rstate, rem, completions) = {
            let entry = inner.arena.get(idx);
            (
                entry.conn,
                entry.lstate.clone(),
                entry.rstate.clone(),
                entry.rem,
                entry.completions,
            )
        };
        if completions >= ep.config.max_io_ops {
            return;
        }
        let conn = ep.conn(conn_id).expect("RX entry on unknown connection");
        drop(inner);

        let mut budget = rem.min(ep.config.max_io_bytes);
        let mut issued = 0u32;
        let mut moved = 0u64;
        let mut fail = status::OK;
        while budget > 0 && completions + issued < ep.config.max_io_ops {
            let Some((lreg, loff, lleft)) = lstate.cur().map(|(r, o, l)| (r.clone(), o, l)) else {
                break;
            };
            let Some((key, vaddr, rleft)) = rstate.cur().map(|(s, v, l)| (s.key, v, l)) else {
                break;
            };
            let n = budget.min(lleft).min(rleft);
            if n == 0 {
                break;
            }
            let req = crate::transport::XferReq {
                route: conn.route,
                vaddr,
                key,
                local: crate::iov::LocalSeg {
                    region: lreg,
                    off: loff,
                    len: n,
                },
                len: n,
                context: rx_context(idx),
            };
            match ep.tx.queue.submit_get(req) {
                Ok(()) => {
                    lstate.advance(n);
                    rstate.advance(n);
                    moved += n;
                    budget -= n;
                    issued += 1;
                }
                Err(SubmitError::Again) => {
                    if issued == 0 {
                        ep.retry.push(RetryOp::RxGet { idx });
                        return;
                    }
                    break;
                }
                Err(SubmitError::Fatal(s)) => {
                    fail = s;
                    break;
                }
            }
        }

        inner = rx.lock();
        {
            let entry = inner.arena.get_mut(idx);
            entry.lstate = lstate;
            entry.rstate = rstate;
            entry.rem -= moved;
            entry.completions += issued;
            if fail < 0 {
                entry.status.update(fail);
            }
        }
        if issued > 0 {
            return;
        }
    }

    // Complete phase.
    if inner.arena.get(idx).completions > 0 {
        return;
    }
    let state = inner.arena.get(idx).state;
    match state {
        RxState::RndDirect => {
            rx_complete(ep, rx, idx, 0, Some(inner));
        }
        RxState::Eager | RxState::EagerClaimed | RxState::Discard => {
            // Races with peek/claim/discard decide the terminal shape.
            if inner.arena.get(idx).state == RxState::Discard {
                rx_discard_recv(ep, rx, inner, idx);
                return;
            }
            let (hdr, st, rem, conn_id, now_done) = {
                let entry = inner.arena.get_mut(idx);
                if entry.state == RxState::Eager {
                    entry.state = RxState::EagerDone;
                }
                let hdr = entry.hdr;
                // The transmit-complete acknowledgement fires once, here;
                // any delivery-complete acknowledgement fires at report.
                entry.hdr.flags &= !MSG_TRANSMIT_COMPLETE;
                (
                    hdr,
                    entry.status.get(),
                    entry.rem,
                    entry.conn,
                    entry.state == RxState::EagerDone,
                )
            };
            drop(inner);
            if hdr.flags & MSG_TRANSMIT_COMPLETE != 0
                && let Some(conn) = ep.conn(conn_id)
            {
                send_status(ep, &conn, hdr, st, rem);
            }
            if now_done {
                return;
            }
            // Claimed while fetching: copy out and complete.
            let mut inner = rx.lock();
            {
                let entry = inner.arena.get_mut(idx);
                entry.lstate.reset();
                let fetched = entry.total_len - entry.rem;
                let mut lstate = std::mem::take(&mut entry.lstate);
                let mut ustate = std::mem::take(&mut entry.ustate);
                let copied = copy_local_to_local(&mut ustate, &mut lstate, fetched);
                entry.lstate = lstate;
                entry.ustate = ustate;
                entry.rem = entry.total_len - copied;
            }
            rx_complete(ep, rx, idx, 0, Some(inner));
        }
        RxState::RndBuf => {
            {
                let entry = inner.arena.get_mut(idx);
                entry.lstate.reset();
                let fetched = entry.total_len - entry.rem;
                let mut lstate = std::mem::take(&mut entry.lstate);
                let mut ustate = std::mem::take(&mut entry.ustate);
                let copied = copy_local_to_local(&mut ustate, &mut lstate, fetched);
                entry.lstate = lstate;
                entry.ustate = ustate;
                entry.rem = entry.total_len - copied;
            }
            rx_complete(ep, rx, idx, 0, Some(inner));
        }
        other => {
            error!(idx, state = ?other, "RX entry completed in bad state");
        }
    }
}

/// Mark an entry terminal and drain the completed prefix of the work list
/// in order. Reporting happens with the lock dropped; storage is released
/// after the reports.
pub(crate) fn rx_complete(
    ep: &Endpoint,
    rx: &RxCtx,
    idx: RxIdx,
    st: i32,
    inner: Option<MutexGuard<'_, RxInner>>,
) {
    let mut inner = inner.unwrap_or_else(|| rx.lock());
    {
        let entry = inner.arena.get_mut(idx);
        let mut st = st;
        if st >= 0 && entry.rem > 0 {
            st = status::TRUNCATED;
        }
        entry.status.update(st);
        entry.state = RxState::Complete;
        debug_assert_eq!(entry.list, ListId::Work);
    }

    let mut dcomplete: Vec<(RxIdx, RxEntry)> = Vec::new();
    let mut ddrop: Vec<(RxIdx, RxEntry)> = Vec::new();
    while let Some(&head) = inner.work.front() {
        match inner.arena.get(head).state {
            RxState::Complete => {
                inner.unlink(head);
                dcomplete.push((head, inner.arena.take(head)));
            }
            RxState::Drop => {
                inner.unlink(head);
                ddrop.push((head, inner.arena.take(head)));
            }
            _ => break,
        }
    }
    if dcomplete.is_empty() && ddrop.is_empty() {
        return;
    }
    drop(inner);

    for (_, entry) in &dcomplete {
        let st = entry.status.get();
        let record = CqRecord {
            context: entry.context,
            flags: entry.flags,
            len: entry.total_len,
            data: entry.cq_data,
            tag: entry.tag,
            addr: entry.addr,
        };
        rx.comp.report_complete(record, st, entry.rem);
        if entry.hdr.flags & MSG_ANY_COMPLETE != 0
            && let Some(conn) = ep.conn(entry.conn)
        {
            send_status(ep, &conn, entry.hdr, st, entry.rem);
        }
    }

    // Free storage after reporting to keep the report path short.
    let mut inner = rx.lock();
    for (head, entry) in dcomplete {
        drop(entry);
        inner.arena.free(head);
    }
    for (head, entry) in ddrop {
        drop(entry);
        inner.arena.free(head);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::Key;

    /// Sequential model of one atomic step: (new value, pre-image).
    fn model(op: AtomicOp, width: AtomicWidth, cur: u64, operand: u64, compare: u64) -> (u64, u64) {
        let m = |v| width.mask(v);
        match op {
            AtomicOp::Read => (cur, cur),
            AtomicOp::Write => (m(operand), 0),
            AtomicOp::Band => (m(cur & operand), cur),
            AtomicOp::Bor => (m(cur | operand), cur),
            AtomicOp::Bxor => (m(cur ^ operand), cur),
            AtomicOp::Cswap => {
                if cur == m(compare) {
                    (m(operand), cur)
                } else {
                    (cur, cur)
                }
            }
            AtomicOp::Sum => (m(cur.wrapping_add(operand)), cur),
        }
    }

    #[test]
    fn test_atomic_matrix_matches_sequential_model() {
        let ops = [
            AtomicOp::Read,
            AtomicOp::Write,
            AtomicOp::Band,
            AtomicOp::Bor,
            AtomicOp::Bxor,
            AtomicOp::Cswap,
            AtomicOp::Sum,
        ];
        let widths = [
            AtomicWidth::U8,
            AtomicWidth::U16,
            AtomicWidth::U32,
            AtomicWidth::U64,
        ];
        let initial = 0x1122_3344_5566_7788u64;
        let operand = 0x0f0f_0f0f_0f0f_0f0fu64;
        for op in ops {
            for width in widths {
                for compare in [width.mask(initial), 0x42] {
                    let region = MemRegion::new(16);
                    region.write(8, &width.mask(initial).to_ne_bytes()).unwrap();

                    let pre = atomic_execute(&region, 8, op, width, operand, compare);
                    let mut raw = [0u8; 8];
                    region.read(8, &mut raw).unwrap();
                    let after = width.mask(u64::from_ne_bytes(raw));

                    let (want_after, want_pre) =
                        model(op, width, width.mask(initial), width.mask(operand), compare);
                    assert_eq!(after, want_after, "{op:?} {width:?} value");
                    if op.fetches() {
                        assert_eq!(width.mask(pre), width.mask(want_pre), "{op:?} {width:?} pre");
                    }
                }
            }
        }
    }

    #[test]
    fn test_check_remote_access() {
        let key = Key {
            id: 1,
            internal: false,
        };
        let mut rstate = RemoteIovState::single(0x1000, 64, key);
        assert_eq!(check_remote_access(&rstate, MR_REMOTE_GET), status::NO_KEY);

        rstate.resolve(
            0,
            RemoteKey {
                key,
                base: 0x1000,
                len: 64,
                access: MR_REMOTE_GET,
            },
        );
        assert_eq!(check_remote_access(&rstate, MR_REMOTE_GET), status::OK);
        assert_eq!(check_remote_access(&rstate, MR_REMOTE_PUT), status::NO_KEY);

        let mut out_of_window = RemoteIovState::single(0x1000, 128, key);
        out_of_window.resolve(
            0,
            RemoteKey {
                key,
                base: 0x1000,
                len: 64,
                access: MR_REMOTE_GET,
            },
        );
        assert_eq!(
            check_remote_access(&out_of_window, MR_REMOTE_GET),
            status::NO_KEY
        );
    }
}
