//! Simulated point-to-point connections.
//!
//! A connection is a pair of sides, one per endpoint. Each side owns the
//! state of its *inbound* stream: a receive byte queue plus the monotonic
//! counters `written`, `sent`, `received`, `read` (invariant: `read ≤
//! received ≤ sent ≤ written`). Writes land bytes in the destination side's
//! queue and bump `written`; a sender step models TCP send completion
//! (`sent = written` after a small delay); a receiver step delivers a
//! prefix after the latency-and-clog model, advancing `received`.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{error, trace, warn};

use crate::error::SimError;
use crate::net::clog::Clogging;
use crate::registry::ProcessId;
use crate::rng::{sim_random01, sim_random_range};
use crate::sim::queue::{Event, TaskPriority};
use crate::sim::wakers::WakerRegistry;
use crate::sim::world::{SimInner, WeakSimWorld};
use crate::types::{NetworkAddress, UID};

/// Virtual seconds between a peer closing and the leak check firing.
const LEAK_CHECK_DELAY: f64 = 20.0;

/// Snapshot of one side's inbound stream counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnCounters {
    /// Bytes the peer has pushed toward this side.
    pub written: u64,
    /// Bytes modeled as handed to TCP.
    pub sent: u64,
    /// Bytes delivered and readable at this side.
    pub received: u64,
    /// Bytes the application has consumed.
    pub read: u64,
}

#[derive(Debug)]
pub(crate) struct ConnState {
    pub(crate) process: ProcessId,
    /// The side at the other end, until one of us closes.
    pub(crate) peer: Option<u64>,
    /// Process writing into this side; fixed at creation so deliveries keep
    /// flowing after the peer handle closes.
    pub(crate) peer_process: ProcessId,
    pub(crate) peer_address: NetworkAddress,
    /// Bytes in `[read, written)`; the readable prefix ends at `received`.
    pub(crate) recv_buf: VecDeque<u8>,
    pub(crate) read: u64,
    pub(crate) received: u64,
    pub(crate) sent: u64,
    pub(crate) written: u64,
    /// Capacity of this side's inbound buffer; the peer's writes block when
    /// `written - received` reaches it.
    pub(crate) send_buf_size: u64,
    pub(crate) sent_scheduled: bool,
    pub(crate) deliver_scheduled: bool,
    pub(crate) opened: bool,
    pub(crate) dbgid: UID,
}

impl ConnState {
    pub(crate) fn counters(&self) -> ConnCounters {
        ConnCounters {
            written: self.written,
            sent: self.sent,
            received: self.received,
            read: self.read,
        }
    }

    fn capacity(&self) -> u64 {
        self.send_buf_size.saturating_sub(self.written - self.received)
    }
}

/// Network-wide state: the connection arena and the congestion model.
#[derive(Debug, Default)]
pub(crate) struct NetState {
    pub(crate) conns: HashMap<u64, ConnState>,
    pub(crate) next_conn_id: u64,
    pub(crate) clogging: Clogging,
}

impl SimInner {
    /// Allocate both sides of a connection between `caller` and `callee`.
    ///
    /// Installs each direction's permanent pair latency on first use and
    /// draws each side's inbound buffer capacity from it. The callee sees a
    /// synthesized ephemeral peer address, as a real server would.
    pub(crate) fn create_connection_pair(
        &mut self,
        caller: ProcessId,
        callee: ProcessId,
        to_addr: NetworkAddress,
    ) -> (u64, u64) {
        let caller_ip = self.registry.process(caller).address.ip;
        let callee_ip = self.registry.process(callee).address.ip;
        let max_clog = self.config.network.max_clogging_latency;

        let caller_side = self.next_conn_id();
        let callee_side = self.next_conn_id();

        // Caller's inbound stream flows callee -> caller.
        let caller_latency = self.net.clogging.set_pair_latency_if_not_set(
            callee_ip,
            caller_ip,
            max_clog * sim_random01(),
        );
        let caller_buf = send_buf_size(caller_latency);

        // Callee's inbound stream flows caller -> callee.
        let callee_latency = self.net.clogging.set_pair_latency_if_not_set(
            caller_ip,
            callee_ip,
            max_clog * sim_random01(),
        );
        let callee_buf = send_buf_size(callee_latency);

        let ephemeral = ephemeral_peer_address(caller_ip);

        self.net.conns.insert(
            caller_side,
            ConnState {
                process: caller,
                peer: Some(callee_side),
                peer_process: callee,
                peer_address: to_addr,
                recv_buf: VecDeque::new(),
                read: 0,
                received: 0,
                sent: 0,
                written: 0,
                send_buf_size: caller_buf,
                sent_scheduled: false,
                deliver_scheduled: false,
                opened: false,
                dbgid: UID::random(),
            },
        );
        self.net.conns.insert(
            callee_side,
            ConnState {
                process: callee,
                peer: Some(caller_side),
                peer_process: caller,
                peer_address: ephemeral,
                recv_buf: VecDeque::new(),
                read: 0,
                received: 0,
                sent: 0,
                written: 0,
                send_buf_size: callee_buf,
                sent_scheduled: false,
                deliver_scheduled: false,
                opened: false,
                dbgid: UID::random(),
            },
        );

        trace!(
            caller_side,
            callee_side,
            caller_buf,
            callee_buf,
            "connection pair created"
        );
        (caller_side, callee_side)
    }

    fn next_conn_id(&mut self) -> u64 {
        let id = self.net.next_conn_id;
        self.net.next_conn_id += 1;
        id
    }

    /// Roll the per-I/O random close. Any single roll may close one or both
    /// directions, and is only synchronously visible 30% of the time.
    pub(crate) fn roll_random_close(&mut self, id: u64) -> Result<(), SimError> {
        if !self.enable_connection_failures {
            return Ok(());
        }
        if sim_random01() >= self.config.network.connection_failure_probability {
            return Ok(());
        }
        let a = sim_random01();
        let b = sim_random01();
        if let Some(conn) = self.net.conns.get(&id) {
            warn!(
                dbgid = %conn.dbgid,
                send_closed = a > 0.33,
                recv_closed = a < 0.66,
                explicit = b < 0.3,
                "simulated connection failure"
            );
        }
        if a < 0.66 {
            let peer = self.net.conns.get(&id).and_then(|c| c.peer);
            if let Some(peer_id) = peer {
                self.close_conn_internal(peer_id);
            }
        }
        if a > 0.33 {
            self.close_conn_internal(id);
        }
        if b < 0.3 {
            return Err(SimError::ConnectionFailed);
        }
        Ok(())
    }

    /// One-way close: forget our reference to the peer and start the peer's
    /// leak timer. The peer may keep writing; its bytes go nowhere once the
    /// closed side is dropped by its holder.
    pub(crate) fn close_conn_internal(&mut self, id: u64) {
        let Some(conn) = self.net.conns.get_mut(&id) else {
            return;
        };
        if let Some(peer_id) = conn.peer.take() {
            if let Some(peer) = self.net.conns.get(&peer_id) {
                let target = peer.process;
                self.schedule(
                    Event::ConnLeakCheck { conn: peer_id },
                    target,
                    LEAK_CHECK_DELAY,
                    TaskPriority::DEFAULT_DELAY,
                );
            }
        }
    }

    /// Caller-side close: sever the pair and drop this side entirely.
    pub(crate) fn close_conn_by_caller(&mut self, id: u64) {
        self.close_conn_internal(id);
        self.net.conns.remove(&id);
        // Anyone blocked on this side is not coming back.
        if let Some(waker) = self.wakers.read_wakers.remove(&id) {
            waker.wake();
        }
        WakerRegistry::wake_all(&mut self.wakers.write_wakers, id);
    }

    pub(crate) fn conn_peer_gone(&self, id: u64) -> bool {
        match self.net.conns.get(&id) {
            Some(conn) => match conn.peer {
                Some(peer_id) => self
                    .net
                    .conns
                    .get(&peer_id)
                    .map(|p| self.registry.process(p.process).failed)
                    .unwrap_or(true),
                None => true,
            },
            None => true,
        }
    }

    /// Sender step: model TCP send completion for a side's inbound stream.
    pub(crate) fn handle_conn_sent(&mut self, id: u64) {
        let Some(conn) = self.net.conns.get_mut(&id) else {
            return;
        };
        conn.sent = conn.written;
        conn.sent_scheduled = false;
        self.maybe_schedule_delivery(id);
    }

    /// Kick off one delivery hop if bytes are in flight and none is pending.
    pub(crate) fn maybe_schedule_delivery(&mut self, id: u64) {
        let Some(conn) = self.net.conns.get(&id) else {
            return;
        };
        if conn.deliver_scheduled || conn.sent == conn.received {
            return;
        }
        // Either the whole sent prefix or a partial packet.
        let pos = if sim_random01() < 0.5 {
            conn.sent
        } else {
            sim_random_range(conn.received..conn.sent) + 1
        };
        let writer = conn.peer_process;
        let writer_ip = self.registry.process(writer).address.ip;
        let reader_ip = self.registry.process(conn.process).address.ip;
        let send_delay = self
            .net
            .clogging
            .send_delay(&self.config.network, writer_ip, reader_ip);
        if let Some(conn) = self.net.conns.get_mut(&id) {
            conn.deliver_scheduled = true;
        }
        self.schedule(
            Event::ConnDeliverHop { conn: id, pos },
            writer,
            send_delay,
            TaskPriority::DEFAULT_DELAY,
        );
    }

    /// Outbound half done (on the writer's context); schedule the inbound
    /// half on the reader's context with the full congestion model.
    pub(crate) fn handle_conn_deliver_hop(&mut self, id: u64, pos: u64) {
        let Some(conn) = self.net.conns.get(&id) else {
            return;
        };
        let reader = conn.process;
        let writer_ip = self.registry.process(conn.peer_process).address.ip;
        let reader_ip = self.registry.process(reader).address.ip;
        let recv_delay = self.net.clogging.recv_delay(
            &self.config.network,
            self.speed_up_simulation,
            self.time,
            writer_ip,
            reader_ip,
        );
        self.schedule(
            Event::ConnDeliver { conn: id, pos },
            reader,
            recv_delay,
            TaskPriority::DEFAULT_DELAY,
        );
    }

    /// Inbound half done: the prefix up to `pos` is now readable.
    pub(crate) fn handle_conn_deliver(&mut self, id: u64, pos: u64) {
        let Some(conn) = self.net.conns.get_mut(&id) else {
            return;
        };
        conn.received = conn.received.max(pos);
        conn.deliver_scheduled = false;
        debug_assert!(conn.received <= conn.sent);
        if let Some(waker) = self.wakers.read_wakers.remove(&id) {
            waker.wake();
        }
        // Delivery freed inbound buffer capacity for the writer.
        WakerRegistry::wake_all(&mut self.wakers.write_wakers, id);
        self.maybe_schedule_delivery(id);
    }

    /// The peer closed 20 seconds ago; still holding this side is a leak.
    pub(crate) fn handle_conn_leak_check(&mut self, id: u64) {
        if let Some(conn) = self.net.conns.get(&id) {
            error!(
                dbgid = %conn.dbgid,
                peer = %conn.peer_address,
                opened = conn.opened,
                "leaked connection: {}",
                SimError::ConnectionLeaked
            );
        }
    }

    /// Hand a half-open connection to the target process's listener, unless
    /// the peer vanished mid-handshake (half the time the connection then
    /// silently disappears).
    pub(crate) fn handle_listener_deliver(&mut self, id: u64) {
        if self.conn_peer_gone(id) && sim_random01() < 0.5 {
            self.net.conns.remove(&id);
            return;
        }
        let Some(conn) = self.net.conns.get(&id) else {
            return;
        };
        let process = conn.process;
        trace!(conn = id, dbgid = %conn.dbgid, "incoming connection");
        self.registry
            .process_mut(process)
            .listener
            .pending
            .push_back(id);
        if let Some(waker) = self.wakers.accept_wakers.remove(&process) {
            waker.wake();
        }
    }
}

fn send_buf_size(latency: f64) -> u64 {
    let drawn = sim_random_range(0u64..5_000_000);
    let floor = (25e6 * (latency + 0.002)) as u64;
    drawn.max(floor)
}

fn ephemeral_peer_address(ip: std::net::Ipv4Addr) -> NetworkAddress {
    let octets = ip.octets();
    let offset = sim_random_range(0u32..256) as u8;
    let ephemeral_ip = std::net::Ipv4Addr::new(
        octets[0],
        octets[1],
        octets[2],
        octets[3].wrapping_add(offset),
    );
    let port = sim_random_range(40_000u16..60_000);
    NetworkAddress::new(ephemeral_ip, port)
}

/// One endpoint of a simulated TCP connection.
///
/// Reads and writes go through the latency-and-drop model and may observe
/// random closes while connection failures are enabled. Dropping the stream
/// closes this side.
#[derive(Debug)]
pub struct SimTcpStream {
    sim: WeakSimWorld,
    id: u64,
}

impl SimTcpStream {
    pub(crate) fn new(sim: WeakSimWorld, id: u64) -> Self {
        Self { sim, id }
    }

    /// The address of the other end. For accepted connections this is a
    /// synthesized ephemeral address that may not be connectable.
    pub fn peer_address(&self) -> Option<NetworkAddress> {
        let sim = self.sim.upgrade().ok()?;
        let inner = sim.inner.borrow();
        inner.net.conns.get(&self.id).map(|c| c.peer_address)
    }

    /// Counters of this side's inbound stream.
    pub fn counters(&self) -> ConnCounters {
        self.sim
            .upgrade()
            .ok()
            .and_then(|sim| {
                let inner = sim.inner.borrow();
                inner.net.conns.get(&self.id).map(|c| c.counters())
            })
            .unwrap_or_default()
    }

    /// Counters of the stream this side writes into (the peer's inbound).
    pub fn outbound_counters(&self) -> ConnCounters {
        self.sim
            .upgrade()
            .ok()
            .and_then(|sim| {
                let inner = sim.inner.borrow();
                let peer = inner.net.conns.get(&self.id)?.peer?;
                inner.net.conns.get(&peer).map(|c| c.counters())
            })
            .unwrap_or_default()
    }

    /// Resolves when a write could make progress: the peer has buffer
    /// capacity, or the peer is gone.
    pub async fn writable(&self) -> Result<(), SimError> {
        std::future::poll_fn(|cx| {
            let Ok(sim) = self.sim.upgrade() else {
                return Poll::Ready(Err(SimError::BrokenPromise));
            };
            let mut inner = sim.inner.borrow_mut();
            let Some(peer_id) = inner.net.conns.get(&self.id).and_then(|c| c.peer) else {
                return Poll::Ready(Ok(()));
            };
            let capacity = inner.net.conns.get(&peer_id).map(|p| p.capacity());
            match capacity {
                Some(0) => {
                    inner
                        .wakers
                        .write_wakers
                        .entry(peer_id)
                        .or_default()
                        .push(cx.waker().clone());
                    Poll::Pending
                }
                _ => Poll::Ready(Ok(())),
            }
        })
        .await
    }

}

impl AsyncRead for SimTcpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let Ok(sim) = self.sim.upgrade() else {
            return Poll::Ready(Err(SimError::BrokenPromise.into()));
        };
        let mut inner = sim.inner.borrow_mut();
        if let Err(e) = inner.roll_random_close(self.id) {
            return Poll::Ready(Err(e.into()));
        }
        let Some(conn) = inner.net.conns.get_mut(&self.id) else {
            return Poll::Ready(Err(SimError::ConnectionFailed.into()));
        };
        let available = (conn.received - conn.read) as usize;
        if available == 0 {
            // No delivered bytes; on a dead pair this waits forever, exactly
            // like a half-open socket. Callers race their own timeouts.
            inner
                .wakers
                .read_wakers
                .insert(self.id, cx.waker().clone());
            return Poll::Pending;
        }
        let n = available.min(buf.remaining());
        for _ in 0..n {
            let byte = conn
                .recv_buf
                .pop_front()
                .expect("receive queue holds at least the readable prefix");
            buf.put_slice(&[byte]);
        }
        conn.read += n as u64;
        debug_assert!(conn.read <= conn.received);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for SimTcpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let Ok(sim) = self.sim.upgrade() else {
            return Poll::Ready(Err(SimError::BrokenPromise.into()));
        };
        let mut inner = sim.inner.borrow_mut();
        if let Err(e) = inner.roll_random_close(self.id) {
            return Poll::Ready(Err(e.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut n = buf.len();
        if crate::buggify!() {
            // Short write: TCP is free to accept any prefix.
            n = n.min(sim_random_range(0..1000) + 1);
        }

        let Some(writer) = inner.net.conns.get(&self.id).map(|c| c.process) else {
            return Poll::Ready(Err(SimError::ConnectionFailed.into()));
        };
        let Some(peer_id) = inner.net.conns.get(&self.id).and_then(|c| c.peer) else {
            // Peer closed; bytes vanish but the write "succeeds".
            return Poll::Ready(Ok(n));
        };
        let Some(peer) = inner.net.conns.get_mut(&peer_id) else {
            return Poll::Ready(Ok(n));
        };

        let capacity = peer.capacity() as usize;
        if capacity == 0 {
            inner
                .wakers
                .write_wakers
                .entry(peer_id)
                .or_default()
                .push(cx.waker().clone());
            return Poll::Pending;
        }
        let n = n.min(capacity);
        peer.recv_buf.extend(&buf[..n]);
        peer.written += n as u64;
        let schedule_sender = !peer.sent_scheduled;
        if schedule_sender {
            peer.sent_scheduled = true;
        }
        if schedule_sender {
            inner.schedule(
                Event::ConnSent { conn: peer_id },
                writer,
                0.002 * sim_random01(),
                TaskPriority::DEFAULT_DELAY,
            );
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Drop for SimTcpStream {
    fn drop(&mut self) {
        if let Ok(sim) = self.sim.upgrade() {
            sim.inner.borrow_mut().close_conn_by_caller(self.id);
        }
    }
}

