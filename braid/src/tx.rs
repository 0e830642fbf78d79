//! TX engine: entries for outstanding local operations and the paths that
//! emit wire messages and post RMA/atomic work.
//!
//! Every in-flight local operation owns a [`PeEntry`] slot. The entry counts
//! outstanding transport completions; its stored handler variant is
//! dispatched by the progress loop for every completion (or synthesized
//! event) until the count reaches zero and the terminal report fires.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;
use uuid::Uuid;

use crate::comp::opflags;
use crate::conn::{Conn, ConnId, FabricAddr};
use crate::ep::Endpoint;
use crate::error::{FabricError, StickyStatus};
use crate::iov::{LocalIovState, RemoteIovState};
use crate::mem::Mr;
use crate::progress;
use crate::retry::RetryOp;
use crate::transport::{MsgReq, RdmaQueue, SubmitError, tx_context};
use crate::wire::{
    AtomicOp, AtomicPay, AtomicWidth, INJECT_MAX, IndirectPay, KeyDataPay, MAX_INLINE_MSG, MsgHdr,
    MSG_DELIVERY_COMPLETE, MSG_INLINE, MSG_TRANSMIT_COMPLETE, OpCode, RING_SLOT_LEN, SlotBuf,
    StatusPay, WriteDataPay, encode_inline_send, encode_key_list, INVALID_PE_ID,
};

// Entry-internal flags, separate from the user-visible opflags.
/// Provider-internal entry (control message).
pub const PE_PROV: u8 = 0x01;
/// On reserve back-pressure, save the message and retry instead of failing.
pub const PE_RETRY: u8 = 0x02;
/// Blocked waiting for remote-key responses.
pub const PE_KEY_WAIT: u8 = 0x04;

/// Handler variant dispatched for each completion an entry receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxHandler {
    /// Plain message emission (SEND, STATUS, WRITEDATA, key traffic).
    Msg,
    /// Multi-chunk RMA transfer driver.
    Rma,
    /// Remote atomic awaiting its STATUS-borne pre-image.
    Atomic,
}

/// Caller-visible destination for an atomic pre-image, materialized by
/// result width on terminal completion.
pub struct FetchResult {
    width: AtomicWidth,
    cell: Mutex<Option<u64>>,
}

impl FetchResult {
    pub fn new(width: AtomicWidth) -> Arc<FetchResult> {
        Arc::new(FetchResult {
            width,
            cell: Mutex::new(None),
        })
    }

    pub(crate) fn set(&self, raw: u64) {
        *self.cell.lock().unwrap() = Some(self.width.mask(raw));
    }

    pub fn get(&self) -> Option<u64> {
        *self.cell.lock().unwrap()
    }
}

/// One outstanding local operation.
pub struct PeEntry {
    pub handler: TxHandler,
    pub conn: ConnId,
    pub addr: FabricAddr,
    pub context: u64,
    pub flags: u64,
    pub pe_flags: u8,
    pub status: StickyStatus,
    /// Outstanding transport completions (plus expected STATUS replies and
    /// pending key responses).
    pub completions: u32,
    pub lstate: LocalIovState,
    pub rstate: RemoteIovState,
    /// Bytes not yet transferred; doubles as the atomic pre-image once the
    /// STATUS reply lands.
    pub rem: u64,
    pub cq_data: u64,
    pub inline_data: [u8; INJECT_MAX],
    pub inline_len: usize,
    pub result: Option<Arc<FetchResult>>,
    /// Message bytes kept for ring-write retry.
    pub saved_slot: Option<Box<SlotBuf>>,
    /// For provider entries: user entry whose completion is deferred until
    /// this control message completes.
    pub user_entry: Option<u16>,
}

impl PeEntry {
    pub fn new(handler: TxHandler, conn: &Conn, context: u64, flags: u64, pe_flags: u8) -> PeEntry {
        PeEntry {
            handler,
            conn: conn.id,
            addr: conn.peer,
            context,
            flags,
            pe_flags,
            status: StickyStatus::new(),
            completions: 0,
            lstate: LocalIovState::default(),
            rstate: RemoteIovState::default(),
            rem: 0,
            cq_data: 0,
            inline_data: [0; INJECT_MAX],
            inline_len: 0,
            result: None,
            saved_slot: None,
            user_entry: None,
        }
    }
}

struct TxSlots {
    entries: Vec<Option<PeEntry>>,
    ufree: Vec<u16>,
    pfree: Vec<u16>,
}

/// Entry array shared by every connection of an endpoint.
///
/// Free slots are split into a user pool and a provider reserve so control
/// messages (status replies, key traffic) cannot be starved by user posts.
/// The counts shadow the stacks so the sleep check reads them without the
/// lock.
pub struct TxEngine {
    depth: u16,
    slots: Mutex<TxSlots>,
    ufree_count: AtomicU32,
    pfree_count: AtomicU32,
    pub queue: Arc<dyn RdmaQueue>,
}

impl TxEngine {
    pub fn new(queue: Arc<dyn RdmaQueue>, depth: u16) -> TxEngine {
        assert!(depth.is_power_of_two() && depth >= 4);
        let prov = (depth / 4).max(2);
        let pfree: Vec<u16> = (0..prov).collect();
        let ufree: Vec<u16> = (prov..depth).collect();
        let mut entries = Vec::new();
        entries.resize_with(depth as usize, || None);
        TxEngine {
            depth,
            ufree_count: AtomicU32::new(ufree.len() as u32),
            pfree_count: AtomicU32::new(pfree.len() as u32),
            slots: Mutex::new(TxSlots {
                entries,
                ufree,
                pfree,
            }),
            queue,
        }
    }

    pub fn depth(&self) -> u16 {
        self.depth
    }

    /// Pop a free slot from the user or provider pool.
    pub fn reserve(&self, prov: bool) -> Result<u16, FabricError> {
        let mut slots = self.slots.lock().unwrap();
        let (stack, count) = if prov {
            (&mut slots.pfree, &self.pfree_count)
        } else {
            (&mut slots.ufree, &self.ufree_count)
        };
        let idx = stack.pop().ok_or(FabricError::Again)?;
        count.fetch_sub(1, Ordering::Relaxed);
        Ok(idx)
    }

    pub fn install(&self, idx: u16, entry: PeEntry) {
        let prev = self.slots.lock().unwrap().entries[idx as usize].replace(entry);
        assert!(prev.is_none(), "TX entry {idx} installed twice");
    }

    /// Take the entry out for handler dispatch. A vacant slot here means a
    /// completion arrived for a released entry: protocol corruption.
    pub fn take(&self, idx: u16) -> PeEntry {
        self.slots.lock().unwrap().entries[idx as usize]
            .take()
            .unwrap_or_else(|| panic!("completion for vacant TX entry {idx}"))
    }

    pub fn put_back(&self, idx: u16, entry: PeEntry) {
        let prev = self.slots.lock().unwrap().entries[idx as usize].replace(entry);
        assert!(prev.is_none(), "TX entry {idx} put back over live entry");
    }

    /// Free the slot. The entry is freed exactly once: its slot was taken
    /// and is vacant.
    pub fn release(&self, idx: u16, entry: PeEntry) {
        let mut slots = self.slots.lock().unwrap();
        assert!(
            slots.entries[idx as usize].is_none(),
            "TX entry {idx} released while installed"
        );
        if entry.pe_flags & PE_PROV != 0 {
            slots.pfree.push(idx);
            self.pfree_count.fetch_add(1, Ordering::Relaxed);
        } else {
            slots.ufree.push(idx);
            self.ufree_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// True when no entry is outstanding; the sleep check refuses to park
    /// the progress thread while anything is in flight.
    pub fn all_free(&self) -> bool {
        self.ufree_count.load(Ordering::Relaxed) + self.pfree_count.load(Ordering::Relaxed)
            == self.depth as u32
    }
}

/// Submit an installed entry's message, routing back-pressure to the retry
/// list and fatal errors to the entry status.
pub(crate) fn submit_entry_msg(ep: &Endpoint, conn: &Conn, idx: u16, slot: SlotBuf) {
    match ep.tx.queue.submit_msg(MsgReq {
        route: conn.route,
        slot,
        context: tx_context(idx),
    }) {
        Ok(()) => {}
        Err(SubmitError::Again) => {
            debug!(conn = conn.id.0, idx, "Ring write back-pressure, queued for retry");
            ep.retry.push(RetryOp::MsgRing { idx });
        }
        Err(SubmitError::Fatal(s)) => {
            let mut entry = ep.tx.take(idx);
            entry.status.update(s);
            ep.tx.put_back(idx, entry);
            // Synthesize the completion that will never arrive.
            progress::tx_entry_event(ep, idx, None);
        }
    }
}

/// Reserve a user entry and emit the message built by `build` (which
/// receives the reserved index for header correlation).
pub(crate) fn emit_user_msg(
    ep: &Endpoint,
    conn: &Conn,
    mut entry: PeEntry,
    build: impl FnOnce(u16, &mut SlotBuf),
) -> Result<u16, FabricError> {
    let idx = ep.tx.reserve(false)?;
    let mut slot = [0u8; RING_SLOT_LEN];
    build(idx, &mut slot);
    entry.completions += 1;
    entry.saved_slot = Some(Box::new(slot));
    ep.tx.install(idx, entry);
    submit_entry_msg(ep, conn, idx, slot);
    Ok(idx)
}

/// Emit a provider control message on its own entry. With [`PE_RETRY`] set,
/// reserve back-pressure saves the message for the retry pass instead of
/// failing.
pub(crate) fn emit_prov_msg(
    ep: &Endpoint,
    conn: &Conn,
    mut entry: PeEntry,
    slot: SlotBuf,
) -> Result<(), FabricError> {
    debug_assert!(entry.pe_flags & PE_PROV != 0);
    let idx = match ep.tx.reserve(true) {
        Ok(idx) => idx,
        Err(FabricError::Again) if entry.pe_flags & PE_RETRY != 0 => {
            ep.retry.push(RetryOp::MsgSaved {
                entry: Box::new(entry),
                slot: Box::new(slot),
            });
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    entry.completions = 1;
    entry.saved_slot = Some(Box::new(slot));
    ep.tx.install(idx, entry);
    submit_entry_msg(ep, conn, idx, slot);
    Ok(())
}

fn prov_entry(conn: &Conn) -> PeEntry {
    PeEntry::new(
        TxHandler::Msg,
        conn,
        0,
        opflags::SEND | opflags::NO_COMPLETION,
        PE_PROV | PE_RETRY,
    )
}

/// STATUS reply for a target-side operation, echoing the original header's
/// entry id so the initiator can correlate.
pub(crate) fn send_status(ep: &Endpoint, conn: &Conn, ohdr: MsgHdr, st: i32, rem: u64) {
    let mut slot = [0u8; RING_SLOT_LEN];
    let mut hdr = MsgHdr::new(OpCode::Status, 0, conn.peer_rx_id, ohdr.pe_entry_id);
    hdr.inline_len = StatusPay { status: st, rem }.encode_into(&mut slot);
    hdr.encode_into(&mut slot);
    if let Err(e) = emit_prov_msg(ep, conn, prov_entry(conn), slot) {
        debug!(conn = conn.id.0, error = %e, "Failed to send status reply");
    }
}

/// Request the peer's registrations for `keys`; responses re-drive the
/// requesting entry (`pe_entry_id`) as they install.
pub(crate) fn send_key_request(ep: &Endpoint, conn: &Conn, pe_entry_id: u16, keys: &[crate::mem::Key]) {
    let mut slot = [0u8; RING_SLOT_LEN];
    let mut hdr = MsgHdr::new(OpCode::KeyRequest, 0, conn.peer_rx_id, pe_entry_id);
    hdr.inline_len = encode_key_list(&mut slot, keys);
    hdr.encode_into(&mut slot);
    if let Err(e) = emit_prov_msg(ep, conn, prov_entry(conn), slot) {
        debug!(conn = conn.id.0, error = %e, "Failed to send key request");
    }
}

/// Export a local registration to the peer. `op` distinguishes proactive
/// export from a response to a KEY_REQUEST (handled identically on receive).
pub(crate) fn send_key_data(ep: &Endpoint, conn: &Conn, op: OpCode, pe_entry_id: u16, mr: &Mr) {
    let mut slot = [0u8; RING_SLOT_LEN];
    let mut hdr = MsgHdr::new(op, 0, conn.peer_rx_id, pe_entry_id);
    hdr.inline_len = KeyDataPay {
        key: mr.key,
        base: mr.base,
        len: mr.len,
        access: mr.access,
    }
    .encode_into(&mut slot);
    hdr.encode_into(&mut slot);
    if let Err(e) = emit_prov_msg(ep, conn, prov_entry(conn), slot) {
        debug!(conn = conn.id.0, error = %e, "Failed to export key");
    }
}

/// Tell the peer a set of previously exported keys is gone.
pub(crate) fn send_key_revoke(ep: &Endpoint, conn: &Conn, keys: &[crate::mem::Key]) {
    let mut slot = [0u8; RING_SLOT_LEN];
    let mut hdr = MsgHdr::new(OpCode::KeyRevoke, 0, conn.peer_rx_id, INVALID_PE_ID);
    hdr.inline_len = encode_key_list(&mut slot, keys);
    hdr.encode_into(&mut slot);
    if let Err(e) = emit_prov_msg(ep, conn, prov_entry(conn), slot) {
        debug!(conn = conn.id.0, error = %e, "Failed to send key revoke");
    }
}

/// WRITEDATA notification carrying the user entry's flags and cq_data. The
/// user completion rides on the provider entry and is reported only after
/// this message's transport completion.
pub(crate) fn send_writedata(
    ep: &Endpoint,
    conn: &Conn,
    user_idx: u16,
    flags: u64,
    cq_data: u64,
) -> Result<(), FabricError> {
    let mut slot = [0u8; RING_SLOT_LEN];
    let mut hdr = MsgHdr::new(OpCode::WriteData, 0, conn.peer_rx_id, INVALID_PE_ID);
    hdr.inline_len = WriteDataPay { flags, cq_data }.encode_into(&mut slot);
    hdr.encode_into(&mut slot);
    let mut entry = prov_entry(conn);
    entry.user_entry = Some(user_idx);
    emit_prov_msg(ep, conn, entry, slot)
}

/// Payload of a user send.
pub enum SendPayload {
    /// Carried in the message slot; at most [`MAX_INLINE_MSG`] bytes.
    Inline(Vec<u8>),
    /// Fetched by the receiver from a registered region.
    Reg { mr: Arc<Mr>, off: u64, len: u64 },
}

/// Transmit context: the progress unit owning an endpoint's send side.
pub struct TxCtx {
    pub id: Uuid,
    pub ep: Arc<Endpoint>,
    signal: Mutex<Option<Arc<crate::progress::PeSignal>>>,
}

impl TxCtx {
    pub fn new(ep: Arc<Endpoint>) -> Arc<TxCtx> {
        Arc::new(TxCtx {
            id: Uuid::new_v4(),
            ep,
            signal: Mutex::new(None),
        })
    }

    pub(crate) fn set_signal(&self, signal: Option<Arc<crate::progress::PeSignal>>) {
        *self.signal.lock().unwrap() = signal;
    }

    fn signal_pe(&self) {
        if let Some(signal) = self.signal.lock().unwrap().as_ref() {
            signal.signal();
        }
    }

    /// Post a message send. Inline payloads complete on transport
    /// completion; registered payloads complete on the receiver's
    /// transmit-complete acknowledgement.
    pub fn post_send(
        &self,
        conn: &Conn,
        payload: SendPayload,
        tag: Option<u64>,
        cq_data: Option<u64>,
        flags: u64,
        context: u64,
    ) -> Result<(), FabricError> {
        let ep = &self.ep;
        let mut entry = PeEntry::new(
            TxHandler::Msg,
            conn,
            context,
            opflags::SEND | flags,
            0,
        );
        if tag.is_some() {
            entry.flags |= opflags::TAGGED;
        }

        match payload {
            SendPayload::Inline(data) => {
                if data.len() > MAX_INLINE_MSG {
                    return Err(FabricError::NoMem);
                }
                emit_user_msg(ep, conn, entry, |idx, slot| {
                    let mut hdr = MsgHdr::new(OpCode::Send, MSG_INLINE, conn.peer_rx_id, idx);
                    encode_inline_send(slot, &mut hdr, &data, tag, cq_data);
                })?;
            }
            SendPayload::Reg { mr, off, len } => {
                if off + len > mr.len {
                    return Err(FabricError::NoKey);
                }
                // Export the key ahead of the send so the receiver's fetch
                // normally finds it cached.
                if conn.export_once(mr.key) {
                    send_key_data(ep, conn, OpCode::KeyExport, INVALID_PE_ID, &mr);
                }
                // One completion for the message, one for the
                // transmit-complete status from the receiver.
                entry.completions = 1;
                emit_user_msg(ep, conn, entry, |idx, slot| {
                    let mut hdr =
                        MsgHdr::new(OpCode::Send, MSG_TRANSMIT_COMPLETE, conn.peer_rx_id, idx);
                    if tag.is_some() {
                        hdr.flags |= crate::wire::MSG_TAGGED;
                    }
                    if cq_data.is_some() {
                        hdr.flags |= crate::wire::MSG_REMOTE_CQ_DATA;
                    }
                    hdr.inline_len = IndirectPay {
                        vaddr: mr.base + off,
                        len,
                        key: mr.key,
                        tag: tag.unwrap_or(0),
                        cq_data: cq_data.unwrap_or(0),
                    }
                    .encode_into(slot);
                    hdr.encode_into(slot);
                })?;
            }
        }
        self.signal_pe();
        Ok(())
    }

    /// Post an RMA read or write. Missing remote keys are requested from the
    /// peer and the transfer starts once the responses install.
    pub fn post_rma(
        &self,
        conn: &Conn,
        write: bool,
        lstate: LocalIovState,
        rstate: RemoteIovState,
        flags: u64,
        cq_data: Option<u64>,
        context: u64,
    ) -> Result<(), FabricError> {
        let ep = &self.ep;
        let dir = if write { opflags::WRITE } else { opflags::READ };
        let mut entry = PeEntry::new(TxHandler::Rma, conn, context, opflags::RMA | dir | flags, 0);
        entry.rem = lstate.avail().min(rstate.avail());
        if let Some(data) = cq_data {
            entry.flags |= opflags::REMOTE_CQ_DATA;
            entry.cq_data = data;
        }
        entry.lstate = lstate;
        entry.rstate = rstate;
        if entry.flags & opflags::INJECT != 0 && !write && entry.rem > INJECT_MAX as u64 {
            return Err(FabricError::NoMem);
        }

        let idx = ep.tx.reserve(false)?;
        resolve_remote_keys(conn, &mut entry.rstate);
        let missing = entry.rstate.missing_keys();
        if !missing.is_empty() {
            entry.pe_flags |= PE_KEY_WAIT;
            entry.completions += missing.len() as u32;
            ep.tx.install(idx, entry);
            send_key_request(ep, conn, idx, &missing);
        } else {
            let access = if write {
                crate::mem::MR_REMOTE_PUT
            } else {
                crate::mem::MR_REMOTE_GET
            };
            entry
                .status
                .update(progress::check_remote_access(&entry.rstate, access));
            ep.tx.install(idx, entry);
            progress::tx_rma_tick(ep, idx);
        }
        self.signal_pe();
        Ok(())
    }

    /// Post an RMA write whose payload travels immediate.
    pub fn post_write_inject(
        &self,
        conn: &Conn,
        data: &[u8],
        rstate: RemoteIovState,
        flags: u64,
        cq_data: Option<u64>,
        context: u64,
    ) -> Result<(), FabricError> {
        if data.len() > INJECT_MAX {
            return Err(FabricError::NoMem);
        }
        let ep = &self.ep;
        let mut entry = PeEntry::new(
            TxHandler::Rma,
            conn,
            context,
            opflags::RMA | opflags::WRITE | opflags::INJECT | flags,
            0,
        );
        entry.inline_data[..data.len()].copy_from_slice(data);
        entry.inline_len = data.len();
        entry.rem = data.len() as u64;
        if let Some(d) = cq_data {
            entry.flags |= opflags::REMOTE_CQ_DATA;
            entry.cq_data = d;
        }
        entry.rstate = rstate;

        let idx = ep.tx.reserve(false)?;
        resolve_remote_keys(conn, &mut entry.rstate);
        let missing = entry.rstate.missing_keys();
        if !missing.is_empty() {
            entry.pe_flags |= PE_KEY_WAIT;
            entry.completions += missing.len() as u32;
            ep.tx.install(idx, entry);
            send_key_request(ep, conn, idx, &missing);
        } else {
            entry.status.update(progress::check_remote_access(
                &entry.rstate,
                crate::mem::MR_REMOTE_PUT,
            ));
            ep.tx.install(idx, entry);
            progress::tx_rma_tick(ep, idx);
        }
        self.signal_pe();
        Ok(())
    }

    /// Post a remote atomic. The pre-image (for fetching ops) lands in
    /// `result` on terminal completion.
    #[allow(clippy::too_many_arguments)]
    pub fn post_atomic(
        &self,
        conn: &Conn,
        op: AtomicOp,
        width: AtomicWidth,
        vaddr: u64,
        key: crate::mem::Key,
        operand: u64,
        compare: u64,
        result: Option<Arc<FetchResult>>,
        flags: u64,
        context: u64,
    ) -> Result<(), FabricError> {
        let ep = &self.ep;
        let dir = if op.fetches() {
            opflags::READ
        } else {
            opflags::WRITE
        };
        let mut entry = PeEntry::new(
            TxHandler::Atomic,
            conn,
            context,
            opflags::ATOMIC | dir | flags,
            0,
        );
        entry.result = result;
        // One completion for the request message, one for the STATUS reply
        // carrying the result.
        entry.completions = 1;
        emit_user_msg(ep, conn, entry, |idx, slot| {
            let mut hdr = MsgHdr::new(OpCode::Atomic, MSG_DELIVERY_COMPLETE, conn.peer_rx_id, idx);
            hdr.inline_len = AtomicPay {
                op,
                width,
                vaddr,
                key,
                operand,
                compare,
            }
            .encode_into(slot);
            hdr.encode_into(slot);
        })?;
        self.signal_pe();
        Ok(())
    }

    /// Unregister a local region and tell the peer its key is gone. Peer
    /// operations already bound to the key keep their resolved access;
    /// anything resolving afterwards fails with `NO_KEY`.
    pub fn revoke_key(&self, conn: &Conn, key: crate::mem::Key) {
        self.ep.mrs.unregister(key);
        send_key_revoke(&self.ep, conn, &[key]);
        self.signal_pe();
    }
}

/// Resolve what the connection's key cache already holds.
pub(crate) fn resolve_remote_keys(conn: &Conn, rstate: &mut RemoteIovState) {
    for i in 0..rstate.segs.len() {
        if rstate.missing & (1 << i) != 0
            && let Some(rkey) = conn.keys.get(rstate.segs[i].key)
        {
            rstate.resolve(i, rkey);
        }
    }
}
