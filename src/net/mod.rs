//! The simulated network surface handed to workloads.
//!
//! [`SimNetworkProvider`] is the connect/listen entry point; streams and
//! listeners resolve against the owning [`SimWorld`](crate::SimWorld)
//! through weak handles, so dropping the world invalidates them cleanly.

pub mod clog;
pub mod conn;

pub use clog::ClogMode;
pub use conn::{ConnCounters, SimTcpStream};

use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tracing::info;

use crate::error::{SimError, SimResult};
use crate::registry::ProcessId;
use crate::rng::sim_random01;
use crate::sim::queue::{Event, TaskPriority};
use crate::sim::world::{SimWorld, WeakSimWorld};
use crate::types::NetworkAddress;

/// Factory for simulated connections and listeners.
#[derive(Debug, Clone)]
pub struct SimNetworkProvider {
    sim: WeakSimWorld,
}

impl SimNetworkProvider {
    pub(crate) fn new(sim: WeakSimWorld) -> Self {
        Self { sim }
    }

    pub(crate) fn sim(&self) -> &WeakSimWorld {
        &self.sim
    }

    /// Connect to `addr` from the current process.
    ///
    /// Addresses that are not yet registered are polled every
    /// `0.1 * random01()` seconds until a process binds them — connecting to
    /// a process that does not exist yet is legal and just waits. If the
    /// destination dies during the handshake, half the time the connect
    /// hangs instead of erroring, like a SYN lost to a dead host.
    pub async fn connect(&self, addr: NetworkAddress) -> SimResult<SimTcpStream> {
        assert!(!addr.is_tls(), "simulated transport does not support TLS");
        let sim = self.sim.upgrade()?;
        loop {
            if sim.process_by_address(addr).is_some() {
                break;
            }
            sim.sleep(0.1 * sim_random01()).await?;
        }
        let callee = sim
            .process_by_address(addr)
            .expect("address registered in the loop above");
        let caller = sim.current_process();

        let my_side = {
            let mut inner = sim.inner.borrow_mut();
            let pair = inner.create_connection_pair(caller, callee, addr);
            // The callee's listener learns of the connection after the
            // callee-side handshake latency, independent of our fate.
            inner.schedule(
                Event::ListenerDeliver { conn: pair.1 },
                callee,
                0.5 * sim_random01(),
                TaskPriority::DEFAULT_DELAY,
            );
            pair.0
        };

        sim.sleep(0.5 * sim_random01()).await?;
        let peer_gone = sim.inner.borrow().conn_peer_gone(my_side);
        if peer_gone && sim_random01() < 0.5 {
            std::future::pending::<()>().await;
        }
        sim.inner
            .borrow_mut()
            .net
            .conns
            .get_mut(&my_side)
            .expect("our side outlives the handshake")
            .opened = true;
        Ok(SimTcpStream::new(self.sim.clone(), my_side))
    }

    /// Return the listener for `addr`, which must belong to the current
    /// process.
    pub fn listen(&self, addr: NetworkAddress) -> SimResult<SimTcpListener> {
        assert!(!addr.is_tls(), "simulated transport does not support TLS");
        let sim = self.sim.upgrade()?;
        let process = sim.current_process();
        assert_eq!(
            sim.process_address(process),
            addr,
            "listen address must be the current process's own address"
        );
        Ok(SimTcpListener {
            sim: self.sim.clone(),
            process,
        })
    }
}

/// Accepts incoming simulated connections for one process.
#[derive(Debug)]
pub struct SimTcpListener {
    sim: WeakSimWorld,
    process: ProcessId,
}

impl SimTcpListener {
    /// Accept the next incoming connection.
    pub fn accept(&self) -> AcceptFuture<'_> {
        AcceptFuture { listener: self }
    }
}

/// Future returned by [`SimTcpListener::accept`].
#[derive(Debug)]
pub struct AcceptFuture<'a> {
    listener: &'a SimTcpListener,
}

impl Future for AcceptFuture<'_> {
    type Output = SimResult<(SimTcpStream, NetworkAddress)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let listener = self.listener;
        let Ok(sim) = listener.sim.upgrade() else {
            return Poll::Ready(Err(SimError::BrokenPromise));
        };
        let mut inner = sim.inner.borrow_mut();
        let next = inner
            .registry
            .process_mut(listener.process)
            .listener
            .pending
            .pop_front();
        match next {
            Some(conn_id) => {
                let conn = inner
                    .net
                    .conns
                    .get_mut(&conn_id)
                    .expect("pending connection exists until accepted");
                conn.opened = true;
                let peer = conn.peer_address;
                Poll::Ready(Ok((
                    SimTcpStream::new(listener.sim.clone(), conn_id),
                    peer,
                )))
            }
            None => {
                inner
                    .wakers
                    .accept_wakers
                    .insert(listener.process, cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl SimWorld {
    /// Create a network provider bound to this world.
    pub fn network_provider(&self) -> SimNetworkProvider {
        SimNetworkProvider::new(self.downgrade())
    }

    /// Clog one or both directions of an interface for `seconds`.
    /// `ClogMode::Default` randomizes: 30% send, 30% receive, 40% all.
    pub fn clog_interface(&self, ip: Ipv4Addr, seconds: f64, mode: ClogMode) {
        let mut inner = self.inner.borrow_mut();
        let mode = match mode {
            ClogMode::Default => {
                let a = sim_random01();
                if a < 0.3 {
                    ClogMode::Send
                } else if a < 0.6 {
                    ClogMode::Receive
                } else {
                    ClogMode::All
                }
            }
            other => other,
        };
        info!(%ip, seconds, ?mode, "clog interface");
        let now = inner.time;
        if matches!(mode, ClogMode::Send | ClogMode::All) {
            inner.net.clogging.clog_send_for(ip, now, seconds);
        }
        if matches!(mode, ClogMode::Receive | ClogMode::All) {
            inner.net.clogging.clog_recv_for(ip, now, seconds);
        }
    }

    /// Clog deliveries from `from` to `to` for `seconds`.
    pub fn clog_pair(&self, from: Ipv4Addr, to: Ipv4Addr, seconds: f64) {
        let mut inner = self.inner.borrow_mut();
        let now = inner.time;
        info!(%from, %to, seconds, "clog pair");
        inner.net.clogging.clog_pair_for(from, to, now, seconds);
    }
}
