//! Endpoint: the shared state one pair of TX/RX contexts operates on.

use std::sync::{Arc, RwLock, Weak};

use uuid::Uuid;

use crate::comp::CompSet;
use crate::config::Config;
use crate::conn::{Conn, ConnId, ConnMap, FabricAddr};
use crate::mem::MrTable;
use crate::retry::RetryQueue;
use crate::rx::RxCtx;
use crate::transport::{RdmaQueue, RouteId};
use crate::tx::TxEngine;

pub struct Endpoint {
    pub id: Uuid,
    pub config: Arc<Config>,
    pub conns: ConnMap,
    pub tx: TxEngine,
    pub retry: RetryQueue,
    pub mrs: Arc<MrTable>,
    /// Completion objects for locally initiated operations.
    pub tx_comp: CompSet,
    /// Back-reference to the receive context bound to this endpoint, set by
    /// [`RxCtx::new`]. Weak: the context owns the endpoint, not vice versa.
    rx: RwLock<Weak<RxCtx>>,
}

impl Endpoint {
    pub fn new(
        config: Arc<Config>,
        queue: Arc<dyn RdmaQueue>,
        mrs: Arc<MrTable>,
        tx_comp: CompSet,
    ) -> Arc<Endpoint> {
        let tx_depth = config.tx_depth;
        Arc::new(Endpoint {
            id: Uuid::new_v4(),
            config,
            conns: ConnMap::new(),
            tx: TxEngine::new(queue, tx_depth),
            retry: RetryQueue::new(),
            mrs,
            tx_comp,
            rx: RwLock::new(Weak::new()),
        })
    }

    pub fn add_conn(&self, peer: FabricAddr, route: RouteId, peer_rx_id: u8) -> Arc<Conn> {
        self.conns
            .add(peer, route, peer_rx_id, self.config.rx_ring_entries)
    }

    pub fn conn(&self, id: ConnId) -> Option<Arc<Conn>> {
        self.conns.get(id)
    }

    pub(crate) fn bind_rx(&self, ctx: &Arc<RxCtx>) {
        *self.rx.write().unwrap() = Arc::downgrade(ctx);
    }

    pub fn rx_ctx(&self) -> Option<Arc<RxCtx>> {
        self.rx.read().unwrap().upgrade()
    }
}
