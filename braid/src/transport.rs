//! Interface to the underlying RDMA queue driver.
//!
//! The engine consumes the driver through [`RdmaQueue`]: one-sided GET/PUT
//! (scatter or immediate), slot delivery into a peer's descriptor ring, and
//! a completion queue polled by the TX progress pass. Remote atomics ride
//! `ATOMIC` wire messages, executed natively on the target, so the driver
//! carries no atomic verb.

use crate::iov::LocalSeg;
use crate::mem::Key;
use crate::wire::{INJECT_MAX, SlotBuf};

/// Opaque transport route to one peer, assigned at connection setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteId(pub u64);

/// Completion context for control I/O that needs no handler. Errors on such
/// completions indicate transport corruption and are fatal to the pass.
pub const CTX_IGNORE: u64 = u64::MAX;

const CTX_TAG_SHIFT: u32 = 48;
const CTX_TAG_TX: u64 = 1;
const CTX_TAG_RX: u64 = 2;

/// Context token addressing a TX engine entry.
pub fn tx_context(idx: u16) -> u64 {
    (CTX_TAG_TX << CTX_TAG_SHIFT) | idx as u64
}

/// Context token addressing an RX entry (receive-side fetch).
pub fn rx_context(idx: u32) -> u64 {
    (CTX_TAG_RX << CTX_TAG_SHIFT) | idx as u64
}

/// Decoded completion context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqContext {
    Ignore,
    Tx(u16),
    Rx(u32),
}

impl CqContext {
    pub fn decode(raw: u64) -> CqContext {
        if raw == CTX_IGNORE {
            return CqContext::Ignore;
        }
        match raw >> CTX_TAG_SHIFT {
            CTX_TAG_TX => CqContext::Tx(raw as u16),
            CTX_TAG_RX => CqContext::Rx(raw as u32),
            _ => CqContext::Ignore,
        }
    }
}

/// Transport completion entry.
#[derive(Debug, Clone, Copy)]
pub struct Cqe {
    pub context: u64,
    /// Zero on success, negative wire status otherwise.
    pub status: i32,
    /// Immediate result for [`RdmaQueue::submit_get_imm`].
    pub result: [u8; INJECT_MAX],
    pub result_len: usize,
}

impl Cqe {
    pub fn ok(context: u64) -> Cqe {
        Cqe {
            context,
            status: 0,
            result: [0; INJECT_MAX],
            result_len: 0,
        }
    }

    pub fn error(context: u64, status: i32) -> Cqe {
        Cqe {
            status,
            ..Cqe::ok(context)
        }
    }
}

/// One-sided transfer request between a local segment and a peer range.
pub struct XferReq {
    pub route: RouteId,
    pub vaddr: u64,
    pub key: Key,
    pub local: LocalSeg,
    pub len: u64,
    pub context: u64,
}

/// A descriptor-ring slot bound for a peer.
pub struct MsgReq {
    pub route: RouteId,
    pub slot: SlotBuf,
    pub context: u64,
}

/// Submit failure. `Again` is transient back-pressure and always retried;
/// anything else completes the operation with that status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    Again,
    Fatal(i32),
}

/// The RDMA queue driver.
///
/// Every accepted submission eventually produces exactly one [`Cqe`]
/// carrying the request's context.
pub trait RdmaQueue: Send + Sync {
    /// Read `len` bytes from the peer range into the local segment.
    fn submit_get(&self, req: XferReq) -> Result<(), SubmitError>;

    /// Write `len` bytes from the local segment to the peer range.
    fn submit_put(&self, req: XferReq) -> Result<(), SubmitError>;

    /// Read up to [`INJECT_MAX`] bytes; the result rides in the CQE.
    fn submit_get_imm(
        &self,
        route: RouteId,
        vaddr: u64,
        key: Key,
        len: u64,
        context: u64,
    ) -> Result<(), SubmitError>;

    /// Write an immediate payload of up to [`INJECT_MAX`] bytes.
    fn submit_put_imm(
        &self,
        route: RouteId,
        vaddr: u64,
        key: Key,
        data: &[u8],
        context: u64,
    ) -> Result<(), SubmitError>;

    /// Deliver a slot into the peer's descriptor ring.
    fn submit_msg(&self, req: MsgReq) -> Result<(), SubmitError>;

    /// Drain up to `max` completions.
    fn poll_cq(&self, max: usize) -> Vec<Cqe>;
}
