//! User-visible completion objects and the reporter that feeds them.
//!
//! The progress engine never hands results to users directly; it maps each
//! internal terminal state onto a completion-queue record, a counter tick,
//! or (when a queue overflows) an event-queue error.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::error;

use crate::conn::FabricAddr;
use crate::error::status;

/// Operation flags carried on entries and surfaced in CQ records.
pub mod opflags {
    pub const SEND: u64 = 1 << 0;
    pub const RECV: u64 = 1 << 1;
    pub const READ: u64 = 1 << 2;
    pub const WRITE: u64 = 1 << 3;
    pub const REMOTE_READ: u64 = 1 << 4;
    pub const REMOTE_WRITE: u64 = 1 << 5;
    pub const RMA: u64 = 1 << 6;
    pub const ATOMIC: u64 = 1 << 7;
    pub const TAGGED: u64 = 1 << 8;
    pub const REMOTE_CQ_DATA: u64 = 1 << 9;
    pub const MULTI_RECV: u64 = 1 << 10;
    /// Emit a CQ record even on selective-completion queues.
    pub const COMPLETION: u64 = 1 << 11;
    /// Suppress the CQ record entirely (counters still tick).
    pub const NO_COMPLETION: u64 = 1 << 12;
    pub const INJECT: u64 = 1 << 13;
    pub const PEEK: u64 = 1 << 14;
    pub const CLAIM: u64 = 1 << 15;
    pub const DISCARD: u64 = 1 << 16;

    /// Direction bits used to route a completion to its queue and counter.
    pub const DIRECTION_MASK: u64 = SEND | RECV | READ | WRITE | REMOTE_READ | REMOTE_WRITE;
}

/// One successful completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqRecord {
    pub context: u64,
    pub flags: u64,
    pub len: u64,
    pub data: u64,
    pub tag: u64,
    pub addr: FabricAddr,
}

/// One failed completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqErrorRecord {
    pub record: CqRecord,
    /// Negative wire status.
    pub err: i32,
    /// Undelivered bytes.
    pub rem: u64,
}

/// Entry read from a completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqEvent {
    Ok(CqRecord),
    Err(CqErrorRecord),
}

/// Bounded completion queue.
pub struct CompQueue {
    inner: Mutex<VecDeque<CqEvent>>,
    capacity: usize,
}

impl CompQueue {
    pub fn new(capacity: usize) -> Arc<CompQueue> {
        Arc::new(CompQueue {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        })
    }

    fn push(&self, ev: CqEvent) -> Result<(), ()> {
        let mut q = self.inner.lock().unwrap();
        if q.len() >= self.capacity {
            return Err(());
        }
        q.push_back(ev);
        Ok(())
    }

    pub fn read(&self) -> Option<CqEvent> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Completion counter with an error lane.
#[derive(Default)]
pub struct Counter {
    count: AtomicU64,
    errors: AtomicU64,
}

impl Counter {
    pub fn new() -> Arc<Counter> {
        Arc::new(Counter::default())
    }

    pub fn inc(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_err(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Asynchronous error event, reported on behalf of an overflowing CQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EqEntry {
    pub err: i32,
    pub context: u64,
}

#[derive(Default)]
pub struct EventQueue {
    inner: Mutex<VecDeque<EqEntry>>,
}

impl EventQueue {
    pub fn new() -> Arc<EventQueue> {
        Arc::new(EventQueue::default())
    }

    pub fn report_error(&self, entry: EqEntry) {
        self.inner.lock().unwrap().push_back(entry);
    }

    pub fn read(&self) -> Option<EqEntry> {
        self.inner.lock().unwrap().pop_front()
    }
}

/// The completion objects bound to one context.
///
/// `*_cq_event` marks a queue as selective: records are emitted only for
/// entries carrying [`opflags::COMPLETION`].
#[derive(Default, Clone)]
pub struct CompSet {
    pub send_cq: Option<Arc<CompQueue>>,
    pub send_cq_event: bool,
    pub recv_cq: Option<Arc<CompQueue>>,
    pub recv_cq_event: bool,
    pub send_cntr: Option<Arc<Counter>>,
    pub recv_cntr: Option<Arc<Counter>>,
    pub read_cntr: Option<Arc<Counter>>,
    pub write_cntr: Option<Arc<Counter>>,
    pub rem_read_cntr: Option<Arc<Counter>>,
    pub rem_write_cntr: Option<Arc<Counter>>,
    pub eq: Option<Arc<EventQueue>>,
}

impl CompSet {
    /// Route one internal result to the user-visible objects.
    ///
    /// `err` is the entry's final status; `rem` the undelivered byte count.
    /// A record with multiple (or zero) direction bits indicates a corrupted
    /// entry and aborts: the lists this state came from are trusted.
    pub fn report_complete(&self, record: CqRecord, err: i32, rem: u64) {
        if record.flags & opflags::NO_COMPLETION != 0 {
            return;
        }

        let (cq, event, cntr) = match record.flags & opflags::DIRECTION_MASK {
            f if f == opflags::SEND => {
                (self.send_cq.clone(), self.send_cq_event, self.send_cntr.clone())
            }
            f if f == opflags::RECV => {
                (self.recv_cq.clone(), self.recv_cq_event, self.recv_cntr.clone())
            }
            f if f == opflags::READ => {
                (self.send_cq.clone(), self.send_cq_event, self.read_cntr.clone())
            }
            f if f == opflags::WRITE => {
                (self.send_cq.clone(), self.send_cq_event, self.write_cntr.clone())
            }
            f if f == opflags::REMOTE_READ => (None, false, self.rem_read_cntr.clone()),
            f if f == opflags::REMOTE_WRITE => {
                (self.recv_cq.clone(), false, self.rem_write_cntr.clone())
            }
            other => panic!("completion with invalid direction flags {other:#x}"),
        };

        if err < 0 {
            if let Some(cntr) = &cntr {
                cntr.add_err();
            }
            if let Some(cq) = &cq
                && cq.push(CqEvent::Err(CqErrorRecord { record, err, rem })).is_err()
            {
                error!(context = record.context, "CQ overflow on error report");
                if let Some(eq) = &self.eq {
                    eq.report_error(EqEntry {
                        err: status::NO_SPACE,
                        context: record.context,
                    });
                }
            }
            return;
        }

        if let Some(cntr) = &cntr {
            cntr.inc();
        }
        if let Some(cq) = &cq
            && (!event || record.flags & opflags::COMPLETION != 0)
            && cq.push(CqEvent::Ok(record)).is_err()
        {
            error!(context = record.context, "CQ overflow");
            if let Some(eq) = &self.eq {
                eq.report_error(EqEntry {
                    err: status::NO_SPACE,
                    context: record.context,
                });
            }
        }
    }
}
