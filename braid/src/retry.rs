//! Deferred operations that hit transient back-pressure.
//!
//! Per-endpoint FIFO under a short lock. The TX progress pass splices the
//! whole list out under the lock and re-runs each handler with the lock
//! released; handlers must succeed, re-enqueue, or abort.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::tx::PeEntry;
use crate::wire::SlotBuf;

/// One deferred operation.
pub enum RetryOp {
    /// Ring write whose TX slot could not be reserved; carries its own copy
    /// of the slot and the pre-built entry.
    MsgSaved {
        entry: Box<PeEntry>,
        slot: Box<SlotBuf>,
    },
    /// Ring write whose slot is still owned by TX entry `idx`.
    MsgRing { idx: u16 },
    /// RMA driver continuation for TX entry `idx`.
    TxRma { idx: u16 },
    /// Receive-side fetch continuation.
    RxGet { idx: u32 },
}

pub struct RetryQueue {
    inner: Mutex<VecDeque<RetryOp>>,
}

impl RetryQueue {
    pub fn new() -> RetryQueue {
        RetryQueue {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, op: RetryOp) {
        self.inner.lock().unwrap().push_back(op);
    }

    /// Take the whole list; callers run the entries unlocked.
    pub fn splice(&self) -> VecDeque<RetryOp> {
        std::mem::take(&mut *self.inner.lock().unwrap())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

impl Default for RetryQueue {
    fn default() -> Self {
        Self::new()
    }
}
