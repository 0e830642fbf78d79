//! In-process simulated fabric for tests.
//!
//! [`SimFabric`] wires endpoints together through an [`RdmaQueue`]
//! implementation whose transfers are held in a pending list until the test
//! delivers them. Tests control delivery order (to exercise completion
//! ordering), inject submit back-pressure (to exercise the retry list), and
//! fail completions (to exercise sticky status).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::comp::{CompQueue, CompSet, Counter, EventQueue};
use crate::config::Config;
use crate::conn::{Conn, ConnState, FabricAddr};
use crate::ep::Endpoint;
use crate::error::status;
use crate::iov::LocalSeg;
use crate::mem::{Key, MemRegion, Mr, MrTable, MR_ALL};
use crate::progress::ProgressEngine;
use crate::rx::RxCtx;
use crate::transport::{Cqe, MsgReq, RdmaQueue, RouteId, SubmitError, XferReq};
use crate::tx::TxCtx;
use crate::wire::INJECT_MAX;

enum PendingOp {
    /// The slot is already in the peer ring; only the completion is pending.
    MsgCqe { node: usize, context: u64 },
    Get {
        node: usize,
        route: RouteId,
        vaddr: u64,
        key: Key,
        local: LocalSeg,
        len: u64,
        context: u64,
    },
    Put {
        node: usize,
        route: RouteId,
        vaddr: u64,
        key: Key,
        local: LocalSeg,
        len: u64,
        context: u64,
    },
    GetImm {
        node: usize,
        route: RouteId,
        vaddr: u64,
        key: Key,
        len: u64,
        context: u64,
    },
    PutImm {
        node: usize,
        route: RouteId,
        vaddr: u64,
        key: Key,
        data: [u8; INJECT_MAX],
        len: usize,
        context: u64,
    },
    /// Injected failure: completes with an I/O error, no transfer.
    FailCqe { node: usize, context: u64 },
}

struct RouteEntry {
    target_node: usize,
    target_conn: Arc<Conn>,
}

#[derive(Default)]
struct SimLimits {
    /// Submits to reject with `Again` before accepting more.
    reject_submits: usize,
    /// Transfer ops to complete with an I/O error.
    fail_completions: usize,
}

struct SimInner {
    mrs: Mutex<Vec<Arc<MrTable>>>,
    routes: Mutex<Vec<Option<RouteEntry>>>,
    pending: Mutex<VecDeque<PendingOp>>,
    cqs: Mutex<Vec<VecDeque<Cqe>>>,
    limits: Mutex<Vec<SimLimits>>,
}

/// Install a log subscriber for test debugging (`RUST_LOG=debug`).
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The wiring between simulated nodes.
#[derive(Clone)]
pub struct SimFabric {
    inner: Arc<SimInner>,
}

impl SimFabric {
    pub fn new() -> SimFabric {
        SimFabric {
            inner: Arc::new(SimInner {
                mrs: Mutex::new(Vec::new()),
                routes: Mutex::new(Vec::new()),
                pending: Mutex::new(VecDeque::new()),
                cqs: Mutex::new(Vec::new()),
                limits: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a node; returns its id and transport queue.
    pub fn add_node(&self, mrs: Arc<MrTable>) -> (usize, Arc<dyn RdmaQueue>) {
        let mut tables = self.inner.mrs.lock().unwrap();
        let node = tables.len();
        tables.push(mrs);
        self.inner.cqs.lock().unwrap().push(VecDeque::new());
        self.inner.limits.lock().unwrap().push(SimLimits::default());
        (
            node,
            Arc::new(SimQueue {
                inner: self.inner.clone(),
                node,
            }),
        )
    }

    /// Reserve a route id; bind it once the peer connection exists.
    pub fn reserve_route(&self) -> RouteId {
        let mut routes = self.inner.routes.lock().unwrap();
        routes.push(None);
        RouteId(routes.len() as u64 - 1)
    }

    /// Point a reserved route at the connection object (on `target_node`)
    /// whose ring receives this route's messages.
    pub fn bind_route(&self, route: RouteId, target_node: usize, target_conn: Arc<Conn>) {
        self.inner.routes.lock().unwrap()[route.0 as usize] = Some(RouteEntry {
            target_node,
            target_conn,
        });
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    /// Deliver the op at `pos` in the pending list (0 = oldest).
    pub fn deliver_one(&self, pos: usize) {
        let op = self.inner.pending.lock().unwrap().remove(pos);
        if let Some(op) = op {
            self.inner.execute(op);
        }
    }

    /// Deliver everything currently pending, oldest first.
    pub fn deliver_all(&self) {
        loop {
            let Some(op) = self.inner.pending.lock().unwrap().pop_front() else {
                break;
            };
            self.inner.execute(op);
        }
    }

    /// Reject the next `n` submits from `node` with back-pressure.
    pub fn reject_submits(&self, node: usize, n: usize) {
        self.inner.limits.lock().unwrap()[node].reject_submits = n;
    }

    /// Fail the next `n` transfer completions submitted by `node`.
    pub fn fail_completions(&self, node: usize, n: usize) {
        self.inner.limits.lock().unwrap()[node].fail_completions = n;
    }
}

impl Default for SimFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl SimInner {
    fn take_reject(&self, node: usize) -> bool {
        let mut limits = self.limits.lock().unwrap();
        if limits[node].reject_submits > 0 {
            limits[node].reject_submits -= 1;
            return true;
        }
        false
    }

    fn take_fail(&self, node: usize) -> bool {
        let mut limits = self.limits.lock().unwrap();
        if limits[node].fail_completions > 0 {
            limits[node].fail_completions -= 1;
            return true;
        }
        false
    }

    fn push_cqe(&self, node: usize, cqe: Cqe) {
        self.cqs.lock().unwrap()[node].push_back(cqe);
    }

    fn remote_region(
        &self,
        route: RouteId,
        key: Key,
        vaddr: u64,
        len: u64,
        access: u8,
    ) -> Result<(Arc<Mr>, u64), i32> {
        let target = {
            let routes = self.routes.lock().unwrap();
            routes[route.0 as usize].as_ref().expect("unbound route").target_node
        };
        let mrs = self.mrs.lock().unwrap()[target].clone();
        let mr = mrs.find(key).ok_or(status::NO_KEY)?;
        let off = mr.check_access(vaddr, len, access)?;
        Ok((mr, off))
    }

    fn execute(&self, op: PendingOp) {
        match op {
            PendingOp::MsgCqe { node, context } => self.push_cqe(node, Cqe::ok(context)),
            PendingOp::FailCqe { node, context } => {
                self.push_cqe(node, Cqe::error(context, status::IO))
            }
            PendingOp::Get {
                node,
                route,
                vaddr,
                key,
                local,
                len,
                context,
            } => {
                let cqe = match self.remote_region(route, key, vaddr, len, crate::mem::MR_REMOTE_GET)
                {
                    Ok((mr, off)) => {
                        let mut buf = vec![0u8; len as usize];
                        let res = mr
                            .region
                            .read(off, &mut buf)
                            .and_then(|_| local.region.write(local.off, &buf));
                        match res {
                            Ok(()) => Cqe::ok(context),
                            Err(_) => Cqe::error(context, status::IO),
                        }
                    }
                    Err(s) => Cqe::error(context, s),
                };
                self.push_cqe(node, cqe);
            }
            PendingOp::Put {
                node,
                route,
                vaddr,
                key,
                local,
                len,
                context,
            } => {
                let cqe = match self.remote_region(route, key, vaddr, len, crate::mem::MR_REMOTE_PUT)
                {
                    Ok((mr, off)) => {
                        let mut buf = vec![0u8; len as usize];
                        let res = local
                            .region
                            .read(local.off, &mut buf)
                            .and_then(|_| mr.region.write(off, &buf));
                        match res {
                            Ok(()) => Cqe::ok(context),
                            Err(_) => Cqe::error(context, status::IO),
                        }
                    }
                    Err(s) => Cqe::error(context, s),
                };
                self.push_cqe(node, cqe);
            }
            PendingOp::GetImm {
                node,
                route,
                vaddr,
                key,
                len,
                context,
            } => {
                let cqe = match self.remote_region(route, key, vaddr, len, crate::mem::MR_REMOTE_GET)
                {
                    Ok((mr, off)) => {
                        let mut cqe = Cqe::ok(context);
                        match mr.region.read(off, &mut cqe.result[..len as usize]) {
                            Ok(()) => {
                                cqe.result_len = len as usize;
                                cqe
                            }
                            Err(_) => Cqe::error(context, status::IO),
                        }
                    }
                    Err(s) => Cqe::error(context, s),
                };
                self.push_cqe(node, cqe);
            }
            PendingOp::PutImm {
                node,
                route,
                vaddr,
                key,
                data,
                len,
                context,
            } => {
                let cqe = match self.remote_region(route, key, vaddr, len as u64, crate::mem::MR_REMOTE_PUT)
                {
                    Ok((mr, off)) => match mr.region.write(off, &data[..len]) {
                        Ok(()) => Cqe::ok(context),
                        Err(_) => Cqe::error(context, status::IO),
                    },
                    Err(s) => Cqe::error(context, s),
                };
                self.push_cqe(node, cqe);
            }
        }
    }
}

struct SimQueue {
    inner: Arc<SimInner>,
    node: usize,
}

impl RdmaQueue for SimQueue {
    fn submit_get(&self, req: XferReq) -> Result<(), SubmitError> {
        if self.inner.take_reject(self.node) {
            return Err(SubmitError::Again);
        }
        let op = if self.inner.take_fail(self.node) {
            PendingOp::FailCqe {
                node: self.node,
                context: req.context,
            }
        } else {
            PendingOp::Get {
                node: self.node,
                route: req.route,
                vaddr: req.vaddr,
                key: req.key,
                local: req.local,
                len: req.len,
                context: req.context,
            }
        };
        self.inner.pending.lock().unwrap().push_back(op);
        Ok(())
    }

    fn submit_put(&self, req: XferReq) -> Result<(), SubmitError> {
        if self.inner.take_reject(self.node) {
            return Err(SubmitError::Again);
        }
        let op = if self.inner.take_fail(self.node) {
            PendingOp::FailCqe {
                node: self.node,
                context: req.context,
            }
        } else {
            PendingOp::Put {
                node: self.node,
                route: req.route,
                vaddr: req.vaddr,
                key: req.key,
                local: req.local,
                len: req.len,
                context: req.context,
            }
        };
        self.inner.pending.lock().unwrap().push_back(op);
        Ok(())
    }

    fn submit_get_imm(
        &self,
        route: RouteId,
        vaddr: u64,
        key: Key,
        len: u64,
        context: u64,
    ) -> Result<(), SubmitError> {
        if self.inner.take_reject(self.node) {
            return Err(SubmitError::Again);
        }
        self.inner
            .pending
            .lock()
            .unwrap()
            .push_back(PendingOp::GetImm {
                node: self.node,
                route,
                vaddr,
                key,
                len,
                context,
            });
        Ok(())
    }

    fn submit_put_imm(
        &self,
        route: RouteId,
        vaddr: u64,
        key: Key,
        data: &[u8],
        context: u64,
    ) -> Result<(), SubmitError> {
        if self.inner.take_reject(self.node) {
            return Err(SubmitError::Again);
        }
        let mut buf = [0u8; INJECT_MAX];
        buf[..data.len()].copy_from_slice(data);
        self.inner
            .pending
            .lock()
            .unwrap()
            .push_back(PendingOp::PutImm {
                node: self.node,
                route,
                vaddr,
                key,
                data: buf,
                len: data.len(),
                context,
            });
        Ok(())
    }

    fn submit_msg(&self, req: MsgReq) -> Result<(), SubmitError> {
        if self.inner.take_reject(self.node) {
            return Err(SubmitError::Again);
        }
        let conn = {
            let routes = self.inner.routes.lock().unwrap();
            routes[req.route.0 as usize]
                .as_ref()
                .expect("unbound route")
                .target_conn
                .clone()
        };
        // Ring-full back-pressure surfaces at submit time.
        conn.ring
            .lock()
            .unwrap()
            .push(req.slot)
            .map_err(|_| SubmitError::Again)?;
        self.inner
            .pending
            .lock()
            .unwrap()
            .push_back(PendingOp::MsgCqe {
                node: self.node,
                context: req.context,
            });
        Ok(())
    }

    fn poll_cq(&self, max: usize) -> Vec<Cqe> {
        let mut cqs = self.inner.cqs.lock().unwrap();
        let q = &mut cqs[self.node];
        let n = max.min(q.len());
        q.drain(..n).collect()
    }
}

/// One simulated endpoint with its contexts and completion objects.
pub struct SimNode {
    pub node: usize,
    pub ep: Arc<Endpoint>,
    pub tx: Arc<TxCtx>,
    pub rx: Arc<RxCtx>,
    pub mrs: Arc<MrTable>,
    pub send_cq: Arc<CompQueue>,
    pub recv_cq: Arc<CompQueue>,
    pub send_cntr: Arc<Counter>,
    pub recv_cntr: Arc<Counter>,
    pub write_cntr: Arc<Counter>,
    pub read_cntr: Arc<Counter>,
    pub rem_write_cntr: Arc<Counter>,
    pub eq: Arc<EventQueue>,
}

impl SimNode {
    fn new(fabric: &SimFabric, config: Arc<Config>) -> SimNode {
        let mrs = MrTable::new();
        let (node, queue) = fabric.add_node(mrs.clone());
        let send_cq = CompQueue::new(64);
        let recv_cq = CompQueue::new(64);
        let send_cntr = Counter::new();
        let recv_cntr = Counter::new();
        let write_cntr = Counter::new();
        let read_cntr = Counter::new();
        let rem_write_cntr = Counter::new();
        let eq = EventQueue::new();
        let tx_comp = CompSet {
            send_cq: Some(send_cq.clone()),
            send_cntr: Some(send_cntr.clone()),
            write_cntr: Some(write_cntr.clone()),
            read_cntr: Some(read_cntr.clone()),
            eq: Some(eq.clone()),
            ..Default::default()
        };
        let rx_comp = CompSet {
            recv_cq: Some(recv_cq.clone()),
            recv_cntr: Some(recv_cntr.clone()),
            rem_write_cntr: Some(rem_write_cntr.clone()),
            eq: Some(eq.clone()),
            ..Default::default()
        };
        let ep = Endpoint::new(config, queue, mrs.clone(), tx_comp);
        let tx = TxCtx::new(ep.clone());
        let rx = RxCtx::new(ep.clone(), 0, rx_comp);
        SimNode {
            node,
            ep,
            tx,
            rx,
            mrs,
            send_cq,
            recv_cq,
            send_cntr,
            recv_cntr,
            write_cntr,
            read_cntr,
            rem_write_cntr,
            eq,
        }
    }

    /// Register a user region at `base` with full access.
    pub fn register(&self, data: Vec<u8>, base: u64) -> Arc<Mr> {
        self.mrs.register(MemRegion::from_vec(data), base, MR_ALL, false)
    }
}

/// Two endpoints wired both ways, plus a manual-mode engine driving them.
pub struct SimPair {
    pub fabric: SimFabric,
    pub pe: Arc<ProgressEngine>,
    pub a: SimNode,
    pub b: SimNode,
    /// A's connection to B and B's connection to A.
    pub ab: Arc<Conn>,
    pub ba: Arc<Conn>,
}

impl SimPair {
    /// Manual-mode pair: tests drive progress explicitly.
    pub fn new(mut config: Config) -> SimPair {
        config.progress_mode = crate::config::ProgressMode::Manual;
        SimPair::build(config)
    }

    /// Auto-mode pair: the engine's own thread drives progress; tests only
    /// deliver fabric ops.
    pub fn new_auto(mut config: Config) -> SimPair {
        config.progress_mode = crate::config::ProgressMode::Auto;
        SimPair::build(config)
    }

    fn build(config: Config) -> SimPair {
        let config = Arc::new(config);
        let fabric = SimFabric::new();
        let a = SimNode::new(&fabric, config.clone());
        let b = SimNode::new(&fabric, config.clone());

        // Each side's connection routes into the ring of the peer's
        // connection back to it.
        let route_ab = fabric.reserve_route();
        let route_ba = fabric.reserve_route();
        let ab = a.ep.add_conn(FabricAddr(2), route_ab, 0);
        let ba = b.ep.add_conn(FabricAddr(1), route_ba, 0);
        fabric.bind_route(route_ab, b.node, ba.clone());
        fabric.bind_route(route_ba, a.node, ab.clone());
        ab.set_state(ConnState::Ready);
        ba.set_state(ConnState::Ready);

        let pe = ProgressEngine::new(config).expect("engine");
        pe.add_tx_ctx(&a.tx);
        pe.add_tx_ctx(&b.tx);
        pe.add_rx_ctx(&a.rx);
        pe.add_rx_ctx(&b.rx);

        SimPair {
            fabric,
            pe,
            a,
            b,
            ab,
            ba,
        }
    }

    pub fn with_defaults() -> SimPair {
        SimPair::new(Config::default())
    }

    /// Drive both nodes until the fabric quiesces (bounded rounds).
    pub fn pump(&self) {
        for _ in 0..32 {
            self.fabric.deliver_all();
            let _ = self.pe.progress_tx_ctx(&self.a.tx);
            let _ = self.pe.progress_tx_ctx(&self.b.tx);
            let _ = self.pe.progress_rx_ctx(&self.a.rx);
            let _ = self.pe.progress_rx_ctx(&self.b.rx);
            if self.fabric.pending_len() == 0 {
                // One settling round for work the RX pass just created.
                let _ = self.pe.progress_tx_ctx(&self.a.tx);
                let _ = self.pe.progress_tx_ctx(&self.b.tx);
                let _ = self.pe.progress_rx_ctx(&self.a.rx);
                let _ = self.pe.progress_rx_ctx(&self.b.rx);
                if self.fabric.pending_len() == 0 {
                    break;
                }
            }
        }
    }

    /// Progress without delivering pending transfers (for ordering tests).
    pub fn progress_only(&self) {
        let _ = self.pe.progress_tx_ctx(&self.a.tx);
        let _ = self.pe.progress_tx_ctx(&self.b.tx);
        let _ = self.pe.progress_rx_ctx(&self.a.rx);
        let _ = self.pe.progress_rx_ctx(&self.b.rx);
    }
}

