//! RDMA-capable messaging provider core: progress engine, receive-message
//! state machine, RMA/atomic drivers, and key brokerage.

pub mod affinity;
pub mod comp;
pub mod config;
pub mod conn;
pub mod ep;
pub mod error;
pub mod iov;
pub mod mem;
pub mod progress;
pub mod retry;
pub mod ring;
pub mod rx;
pub mod test_util;
pub mod transport;
pub mod tx;
pub mod wire;

pub use comp::{CompQueue, CompSet, Counter, CqEvent, CqRecord, EventQueue, opflags};
pub use config::{Config, ProgressMode};
pub use conn::{Conn, ConnId, ConnState, FabricAddr};
pub use ep::Endpoint;
pub use error::{FabricError, status};
pub use progress::ProgressEngine;
pub use rx::{Claimed, RecvDesc, RxCtx};
pub use tx::{FetchResult, SendPayload, TxCtx};
pub use wire::{AtomicOp, AtomicWidth};
