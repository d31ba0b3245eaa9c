//! In-process simulated network.
//!
//! Every [`VirtualSocketServer`] owns an independent network: its own address
//! bindings, ephemeral port allocator and delivery schedule. Nothing is
//! process global, so several virtual networks can run side by side in one
//! test binary.
//!
//! Deliveries (connection requests, stream data, datagrams, disconnects) are
//! kept in a schedule ordered by due time and then by the order they were
//! produced. `wait(_, true)` dispatches everything that is due, raising the
//! socket signals on the calling thread.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::Waker;
use std::time::{Duration, Instant};

use super::SocketServer;
use crate::config::NetworkConfig;
use crate::error::SocketError;
use crate::event::{saturating_deadline, Event, Timeout};
use crate::rng::SeededRng;
use crate::socket::{AddressFamily, AsyncSocket, ConnState, SocketSignals, SocketType};

/// Largest datagram the virtual network carries.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Socket server backed by a simulated network.
pub struct VirtualSocketServer {
    net: Rc<Network>,
    event: Arc<Event>,
}

impl VirtualSocketServer {
    pub fn new() -> Self {
        Self::with_config(NetworkConfig::default())
    }

    pub fn with_config(config: NetworkConfig) -> Self {
        let net = Network {
            bindings: RefCell::new(HashMap::new()),
            next_port: Cell::new(config.first_port()),
            queue: RefCell::new(BinaryHeap::new()),
            next_seq: Cell::new(0),
            delay: Cell::new(config.delay()),
            rng: RefCell::new(SeededRng::new(config.rng_seed())),
            config,
        };
        VirtualSocketServer {
            net: Rc::new(net),
            event: Arc::new(Event::new()),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.net.config
    }

    /// Change the one-way latency for deliveries scheduled from now on.
    pub fn set_delay(&self, delay: Duration) {
        self.net.delay.set(delay);
    }

    /// Number of deliveries not yet dispatched.
    pub fn pending_events(&self) -> usize {
        self.net.queue.borrow().len()
    }

    /// Create a virtual socket. Infallible counterpart of
    /// [`SocketServer::create_socket`].
    pub fn create_virtual_socket(&self, family: AddressFamily, kind: SocketType) -> VirtualSocket {
        VirtualSocket {
            core: Rc::new(SocketCore {
                kind,
                family,
                net: Rc::downgrade(&self.net),
                signals: SocketSignals::default(),
                inner: RefCell::new(SocketInner::default()),
            }),
        }
    }

    /// Dispatch deliveries until nothing is scheduled, sleeping through
    /// simulated latency. Returns the number of deliveries dispatched.
    pub fn process_all(&self) -> usize {
        let mut total = 0;
        loop {
            total += self.net.process_due();
            match self.net.next_due() {
                None => return total,
                Some(due) => {
                    let now = Instant::now();
                    if due > now {
                        std::thread::sleep(due - now);
                    }
                }
            }
        }
    }
}

impl Default for VirtualSocketServer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for VirtualSocketServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualSocketServer")
            .field("bindings", &self.net.bindings.borrow().len())
            .field("pending", &self.net.queue.borrow().len())
            .finish()
    }
}

impl SocketServer for VirtualSocketServer {
    fn create_socket(
        &self,
        family: AddressFamily,
        kind: SocketType,
    ) -> Result<Box<dyn AsyncSocket>, SocketError> {
        Ok(Box::new(self.create_virtual_socket(family, kind)))
    }

    fn wait(&self, timeout: Timeout, process_io: bool) -> bool {
        let mut timeout = timeout;

        if process_io {
            if self.net.process_due() > 0 {
                return true;
            }
            if let Some(due) = self.net.next_due() {
                timeout = timeout.min(due.saturating_duration_since(Instant::now()));
            }
        }

        self.event.wait(timeout);
        true
    }

    fn wake_up(&self) {
        self.event.set();
    }

    fn waker(&self) -> Waker {
        Waker::from(self.event.clone())
    }
}

struct Network {
    config: NetworkConfig,
    bindings: RefCell<HashMap<(SocketType, SocketAddr), Weak<SocketCore>>>,
    next_port: Cell<u16>,
    queue: RefCell<BinaryHeap<Scheduled>>,
    next_seq: Cell<u64>,
    delay: Cell<Duration>,
    rng: RefCell<SeededRng>,
}

enum Delivery {
    Connect {
        to: SocketAddr,
        from: SocketAddr,
        client: Weak<SocketCore>,
        epoch: u64,
    },
    Accepted {
        client: Weak<SocketCore>,
        server: Weak<SocketCore>,
        epoch: u64,
    },
    Refused {
        client: Weak<SocketCore>,
        epoch: u64,
    },
    Data {
        to: Weak<SocketCore>,
        bytes: Vec<u8>,
        epoch: u64,
    },
    Datagram {
        to: SocketAddr,
        from: SocketAddr,
        bytes: Vec<u8>,
    },
    Disconnect {
        to: Weak<SocketCore>,
        epoch: u64,
    },
    Writable {
        to: Weak<SocketCore>,
        epoch: u64,
    },
}

struct Scheduled {
    due: Instant,
    seq: u64,
    delivery: Delivery,
}

// BinaryHeap is a max-heap; invert so the earliest (due, seq) pops first.
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scheduled {}

impl Network {
    fn schedule(&self, delivery: Delivery) {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        let due = saturating_deadline(Instant::now(), self.delay.get());
        self.queue.borrow_mut().push(Scheduled { due, seq, delivery });
    }

    fn next_due(&self) -> Option<Instant> {
        self.queue.borrow().peek().map(|s| s.due)
    }

    /// Dispatch deliveries that were due and scheduled when called.
    fn process_due(&self) -> usize {
        let now = Instant::now();
        let limit = self.next_seq.get();
        let mut n = 0;

        loop {
            let next = {
                let mut queue = self.queue.borrow_mut();
                let ready = queue
                    .peek()
                    .map_or(false, |s| s.due <= now && s.seq < limit);
                if ready {
                    queue.pop()
                } else {
                    None
                }
            };
            let Some(scheduled) = next else {
                break;
            };
            self.dispatch(scheduled.delivery);
            n += 1;
        }

        n
    }

    fn dispatch(&self, delivery: Delivery) {
        match delivery {
            Delivery::Connect {
                to,
                from,
                client,
                epoch,
            } => self.on_connect(to, from, client, epoch),
            Delivery::Accepted {
                client,
                server,
                epoch,
            } => self.on_accepted(client, server, epoch),
            Delivery::Refused { client, epoch } => {
                if let Some(client) = live(&client, epoch) {
                    refuse(client);
                }
            }
            Delivery::Data { to, bytes, epoch } => self.on_data(to, bytes, epoch),
            Delivery::Datagram { to, from, bytes } => self.on_datagram(to, from, bytes),
            Delivery::Disconnect { to, epoch } => {
                if let Some(to) = live(&to, epoch) {
                    on_disconnect(to);
                }
            }
            Delivery::Writable { to, epoch } => {
                if let Some(to) = live(&to, epoch) {
                    if to.inner.borrow().state == ConnState::Connected {
                        let socket = VirtualSocket { core: to };
                        socket.core.signals.write.emit(&socket, ());
                    }
                }
            }
        }
    }

    fn on_connect(&self, to: SocketAddr, from: SocketAddr, client: Weak<SocketCore>, epoch: u64) {
        let Some(client) = live(&client, epoch) else {
            return;
        };
        if client.inner.borrow().state != ConnState::Connecting {
            return;
        }

        let listener = self
            .resolve(SocketType::Stream, to)
            .filter(|l| l.inner.borrow().listening);

        let Some(listener) = listener else {
            debug!("No listener at {}, refusing {}", to, from);
            refuse(client);
            return;
        };

        {
            let mut inner = listener.inner.borrow_mut();
            if inner.pending.len() >= inner.backlog {
                drop(inner);
                warn!("Backlog full at {}, refusing {}", to, from);
                refuse(client);
                return;
            }
            inner.pending.push_back(Pending {
                from,
                client: Rc::downgrade(&client),
                epoch,
            });
        }

        trace!("Connection request {} -> {}", from, to);
        let socket = VirtualSocket { core: listener };
        socket.core.signals.read.emit(&socket, ());
    }

    fn on_accepted(&self, client: Weak<SocketCore>, server: Weak<SocketCore>, epoch: u64) {
        let client = live(&client, epoch)
            .filter(|c| c.inner.borrow().state == ConnState::Connecting);

        let Some(client) = client else {
            // The client gave up before the accept reached it.
            if let Some(server) = server.upgrade() {
                let epoch = server.inner.borrow().epoch;
                self.schedule(Delivery::Disconnect {
                    to: Rc::downgrade(&server),
                    epoch,
                });
            }
            return;
        };

        client.inner.borrow_mut().state = ConnState::Connected;
        debug!("Connected {:?}", client.inner.borrow().local);

        let socket = VirtualSocket { core: client };
        socket.core.signals.connect.emit(&socket, ());
        if socket.core.inner.borrow().state == ConnState::Connected {
            socket.core.signals.write.emit(&socket, ());
        }
    }

    fn on_data(&self, to: Weak<SocketCore>, bytes: Vec<u8>, epoch: u64) {
        let Some(to) = to.upgrade() else {
            return;
        };
        {
            let mut inner = to.inner.borrow_mut();
            inner.in_flight = inner.in_flight.saturating_sub(bytes.len());
            if inner.epoch != epoch || inner.state != ConnState::Connected {
                trace!("Dropping {} bytes for closed socket", bytes.len());
                return;
            }
            inner.stream_buf.extend(bytes);
        }
        let socket = VirtualSocket { core: to };
        socket.core.signals.read.emit(&socket, ());
    }

    fn on_datagram(&self, to: SocketAddr, from: SocketAddr, bytes: Vec<u8>) {
        let Some(core) = self.resolve(SocketType::Datagram, to) else {
            trace!("No socket at {}, dropping datagram from {}", to, from);
            return;
        };
        core.inner.borrow_mut().datagrams.push_back((from, bytes));
        let socket = VirtualSocket { core };
        socket.core.signals.read.emit(&socket, ());
    }

    /// Find the socket bound to `addr`, falling back to a wildcard binding
    /// on the same port.
    fn resolve(&self, kind: SocketType, addr: SocketAddr) -> Option<Rc<SocketCore>> {
        let bindings = self.bindings.borrow();
        let any = SocketAddr::new(AddressFamily::of(&addr).any().ip(), addr.port());
        bindings
            .get(&(kind, addr))
            .and_then(Weak::upgrade)
            .or_else(|| bindings.get(&(kind, any)).and_then(Weak::upgrade))
    }

    fn is_taken(&self, kind: SocketType, addr: SocketAddr) -> bool {
        let bindings = self.bindings.borrow();
        let any = SocketAddr::new(AddressFamily::of(&addr).any().ip(), addr.port());
        let alive = |k: SocketAddr| {
            bindings
                .get(&(kind, k))
                .map_or(false, |w| w.strong_count() > 0)
        };
        alive(addr) || alive(any)
    }

    fn allocate_port(&self, kind: SocketType, addr: SocketAddr) -> Option<SocketAddr> {
        let first = self.config.first_port();
        for _ in 0..=u16::MAX {
            let port = self.next_port.get();
            self.next_port
                .set(if port == u16::MAX { first } else { port + 1 });
            let candidate = SocketAddr::new(addr.ip(), port);
            if !self.is_taken(kind, candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

fn live(core: &Weak<SocketCore>, epoch: u64) -> Option<Rc<SocketCore>> {
    core.upgrade().filter(|c| c.inner.borrow().epoch == epoch)
}

fn refuse(client: Rc<SocketCore>) {
    {
        let mut inner = client.inner.borrow_mut();
        if inner.state != ConnState::Connecting {
            return;
        }
        inner.state = ConnState::Closed;
        inner.remote = None;
        inner.last_error = Some(SocketError::ConnectionRefused);
    }
    let socket = VirtualSocket { core: client };
    socket
        .core
        .signals
        .close
        .emit(&socket, Some(SocketError::ConnectionRefused));
}

fn on_disconnect(to: Rc<SocketCore>) {
    {
        let mut inner = to.inner.borrow_mut();
        if inner.state == ConnState::Closed {
            return;
        }
        inner.state = ConnState::Closed;
        inner.peer_closed = true;
        inner.peer = Weak::new();
    }
    debug!("Peer closed {:?}", to.inner.borrow().local);
    let socket = VirtualSocket { core: to };
    socket.core.signals.close.emit(&socket, None);
}

struct Pending {
    from: SocketAddr,
    client: Weak<SocketCore>,
    epoch: u64,
}

#[derive(Default)]
struct SocketInner {
    state: ConnState,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    registered: bool,
    listening: bool,
    backlog: usize,
    pending: VecDeque<Pending>,
    peer: Weak<SocketCore>,
    stream_buf: VecDeque<u8>,
    datagrams: VecDeque<(SocketAddr, Vec<u8>)>,
    in_flight: usize,
    peer_closed: bool,
    write_blocked: bool,
    last_error: Option<SocketError>,
    /// Bumped on every close so deliveries for an earlier connection are dropped.
    epoch: u64,
}

struct SocketCore {
    kind: SocketType,
    family: AddressFamily,
    net: Weak<Network>,
    signals: SocketSignals,
    inner: RefCell<SocketInner>,
}

impl SocketCore {
    /// Tear down bindings and connections. Safe to call repeatedly.
    fn shutdown(&self) {
        let net = self.net.upgrade();
        let mut inner = self.inner.borrow_mut();

        if inner.registered {
            if let (Some(net), Some(local)) = (&net, inner.local) {
                let mut bindings = net.bindings.borrow_mut();
                let ours = bindings
                    .get(&(self.kind, local))
                    .map_or(false, |w| std::ptr::eq(w.as_ptr(), self));
                if ours {
                    bindings.remove(&(self.kind, local));
                }
            }
            inner.registered = false;
        }

        let pending: Vec<Pending> = inner.pending.drain(..).collect();
        let peer = std::mem::take(&mut inner.peer);
        let was_open = inner.state != ConnState::Closed;

        inner.state = ConnState::Closed;
        inner.listening = false;
        inner.local = None;
        inner.remote = None;
        inner.stream_buf.clear();
        inner.datagrams.clear();
        inner.peer_closed = false;
        inner.write_blocked = false;
        inner.epoch += 1;
        drop(inner);

        let Some(net) = net else {
            return;
        };

        for p in pending {
            net.schedule(Delivery::Refused {
                client: p.client,
                epoch: p.epoch,
            });
        }

        if was_open {
            if let Some(peer) = peer.upgrade() {
                let epoch = peer.inner.borrow().epoch;
                net.schedule(Delivery::Disconnect {
                    to: Rc::downgrade(&peer),
                    epoch,
                });
            }
        }
    }
}

impl Drop for SocketCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A socket on a [`VirtualSocketServer`] network.
///
/// Dropping the socket closes it.
pub struct VirtualSocket {
    core: Rc<SocketCore>,
}

impl VirtualSocket {
    fn fail<T>(&self, err: SocketError) -> Result<T, SocketError> {
        self.core.inner.borrow_mut().last_error = Some(err);
        Err(err)
    }

    fn network(&self) -> Result<Rc<Network>, SocketError> {
        match self.core.net.upgrade() {
            Some(net) => Ok(net),
            None => self.fail(SocketError::NetworkDown),
        }
    }

    /// Bind to an ephemeral port of the socket's family if not yet bound.
    fn ensure_bound(&self) -> Result<SocketAddr, SocketError> {
        if let Some(local) = self.core.inner.borrow().local {
            return Ok(local);
        }
        self.bind(self.core.family.any())?;
        self.local_address().ok_or(SocketError::InvalidState)
    }

    fn send_datagram(&self, buf: &[u8], to: SocketAddr) -> Result<usize, SocketError> {
        if AddressFamily::of(&to) != self.core.family {
            return self.fail(SocketError::AddressNotAvailable);
        }
        if buf.len() > MAX_DATAGRAM {
            return self.fail(SocketError::InvalidState);
        }
        let net = self.network()?;
        let from = self.ensure_bound()?;

        let lost = net
            .rng
            .borrow_mut()
            .chance(net.config.drop_probability());
        if lost {
            trace!("Lost datagram {} -> {} ({} bytes)", from, to, buf.len());
            return Ok(buf.len());
        }

        net.schedule(Delivery::Datagram {
            to,
            from,
            bytes: buf.to_vec(),
        });
        Ok(buf.len())
    }

    fn send_stream(&self, buf: &[u8]) -> Result<usize, SocketError> {
        let net = self.network()?;
        let (state, peer) = {
            let inner = self.core.inner.borrow();
            (inner.state, inner.peer.upgrade())
        };
        if state != ConnState::Connected {
            return self.fail(SocketError::NotConnected);
        }
        let Some(peer) = peer else {
            return self.fail(SocketError::ConnectionReset);
        };
        if buf.is_empty() {
            return Ok(0);
        }

        let (n, epoch) = {
            let mut p = peer.inner.borrow_mut();
            let used = p.stream_buf.len() + p.in_flight;
            let n = net.config.recv_buffer().saturating_sub(used).min(buf.len());
            p.in_flight += n;
            (n, p.epoch)
        };

        // A short write also owes the sender a write signal.
        if n < buf.len() {
            self.core.inner.borrow_mut().write_blocked = true;
        }
        if n == 0 {
            return self.fail(SocketError::WouldBlock);
        }

        net.schedule(Delivery::Data {
            to: Rc::downgrade(&peer),
            bytes: buf[..n].to_vec(),
            epoch,
        });
        Ok(n)
    }

    /// Tell a blocked sender that receive buffer space was freed.
    fn release_sender(&self) {
        let Some(net) = self.core.net.upgrade() else {
            return;
        };
        let Some(peer) = self.core.inner.borrow().peer.upgrade() else {
            return;
        };
        let epoch = {
            let mut p = peer.inner.borrow_mut();
            if !p.write_blocked {
                return;
            }
            p.write_blocked = false;
            p.epoch
        };
        net.schedule(Delivery::Writable {
            to: Rc::downgrade(&peer),
            epoch,
        });
    }
}

impl fmt::Debug for VirtualSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.core.inner.borrow();
        f.debug_struct("VirtualSocket")
            .field("kind", &self.core.kind)
            .field("state", &inner.state)
            .field("local", &inner.local)
            .field("remote", &inner.remote)
            .finish()
    }
}

impl AsyncSocket for VirtualSocket {
    fn bind(&self, addr: SocketAddr) -> Result<(), SocketError> {
        if AddressFamily::of(&addr) != self.core.family {
            return self.fail(SocketError::AddressNotAvailable);
        }
        {
            let inner = self.core.inner.borrow();
            if inner.local.is_some() || inner.state != ConnState::Closed {
                drop(inner);
                return self.fail(SocketError::InvalidState);
            }
        }
        let net = self.network()?;
        let kind = self.core.kind;

        let addr = if addr.port() == 0 {
            match net.allocate_port(kind, addr) {
                Some(a) => a,
                None => return self.fail(SocketError::AddressInUse),
            }
        } else if net.is_taken(kind, addr) {
            return self.fail(SocketError::AddressInUse);
        } else {
            addr
        };

        net.bindings
            .borrow_mut()
            .insert((kind, addr), Rc::downgrade(&self.core));

        let mut inner = self.core.inner.borrow_mut();
        inner.local = Some(addr);
        inner.registered = true;
        trace!("Bound {:?} socket to {}", kind, addr);
        Ok(())
    }

    fn connect(&self, addr: SocketAddr) -> Result<(), SocketError> {
        if AddressFamily::of(&addr) != self.core.family {
            return self.fail(SocketError::AddressNotAvailable);
        }
        let state = self.core.inner.borrow().state;
        match state {
            ConnState::Connected => return self.fail(SocketError::AlreadyConnected),
            ConnState::Connecting => return self.fail(SocketError::InvalidState),
            ConnState::Closed => {}
        }
        let net = self.network()?;
        let from = self.ensure_bound()?;

        let mut inner = self.core.inner.borrow_mut();
        inner.remote = Some(addr);

        match self.core.kind {
            SocketType::Datagram => {
                inner.state = ConnState::Connected;
            }
            SocketType::Stream => {
                inner.state = ConnState::Connecting;
                let epoch = inner.epoch;
                drop(inner);
                net.schedule(Delivery::Connect {
                    to: addr,
                    from,
                    client: Rc::downgrade(&self.core),
                    epoch,
                });
            }
        }

        trace!("Connecting {} -> {}", from, addr);
        Ok(())
    }

    fn listen(&self, backlog: usize) -> Result<(), SocketError> {
        if self.core.kind != SocketType::Stream {
            return self.fail(SocketError::Unsupported);
        }
        let mut inner = self.core.inner.borrow_mut();
        if inner.local.is_none() || inner.state != ConnState::Closed {
            drop(inner);
            return self.fail(SocketError::InvalidState);
        }
        inner.listening = true;
        inner.backlog = backlog.max(1);
        inner.state = ConnState::Connecting;
        Ok(())
    }

    fn accept(&self) -> Result<(Box<dyn AsyncSocket>, SocketAddr), SocketError> {
        let net = self.network()?;
        if !self.core.inner.borrow().listening {
            return self.fail(SocketError::InvalidState);
        }

        loop {
            let next = self.core.inner.borrow_mut().pending.pop_front();
            let Some(pending) = next else {
                return self.fail(SocketError::NoPendingConnection);
            };

            // Skip clients that went away while queued.
            let Some(client) = live(&pending.client, pending.epoch) else {
                continue;
            };
            if client.inner.borrow().state != ConnState::Connecting {
                continue;
            }

            let local = self.core.inner.borrow().local;
            let server = Rc::new(SocketCore {
                kind: SocketType::Stream,
                family: self.core.family,
                net: self.core.net.clone(),
                signals: SocketSignals::default(),
                inner: RefCell::new(SocketInner {
                    state: ConnState::Connected,
                    local,
                    remote: Some(pending.from),
                    peer: Rc::downgrade(&client),
                    ..SocketInner::default()
                }),
            });

            client.inner.borrow_mut().peer = Rc::downgrade(&server);
            net.schedule(Delivery::Accepted {
                client: Rc::downgrade(&client),
                server: Rc::downgrade(&server),
                epoch: pending.epoch,
            });

            debug!("Accepted {} on {:?}", pending.from, local);
            return Ok((Box::new(VirtualSocket { core: server }), pending.from));
        }
    }

    fn send(&self, buf: &[u8]) -> Result<usize, SocketError> {
        match self.core.kind {
            SocketType::Stream => self.send_stream(buf),
            SocketType::Datagram => {
                let remote = self.core.inner.borrow().remote;
                match remote {
                    Some(to) => self.send_datagram(buf, to),
                    None => self.fail(SocketError::NotConnected),
                }
            }
        }
    }

    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, SocketError> {
        match self.core.kind {
            SocketType::Stream => self.send_stream(buf),
            SocketType::Datagram => self.send_datagram(buf, addr),
        }
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        self.recv_from(buf).map(|(n, _)| n)
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        let mut inner = self.core.inner.borrow_mut();

        match self.core.kind {
            SocketType::Datagram => {
                let Some((from, data)) = inner.datagrams.pop_front() else {
                    drop(inner);
                    return self.fail(SocketError::WouldBlock);
                };
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok((n, from))
            }
            SocketType::Stream => {
                let from = inner.remote.unwrap_or_else(|| self.core.family.any());
                if inner.stream_buf.is_empty() {
                    let (state, peer_closed) = (inner.state, inner.peer_closed);
                    drop(inner);
                    return if peer_closed {
                        Ok((0, from))
                    } else if state != ConnState::Connected {
                        self.fail(SocketError::NotConnected)
                    } else {
                        self.fail(SocketError::WouldBlock)
                    };
                }
                let n = inner.stream_buf.len().min(buf.len());
                for (dst, src) in buf.iter_mut().zip(inner.stream_buf.drain(..n)) {
                    *dst = src;
                }
                drop(inner);
                self.release_sender();
                Ok((n, from))
            }
        }
    }

    fn close(&self) -> Result<(), SocketError> {
        self.core.shutdown();
        Ok(())
    }

    fn state(&self) -> ConnState {
        self.core.inner.borrow().state
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.core.inner.borrow().local
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.core.inner.borrow().remote
    }

    fn socket_type(&self) -> SocketType {
        self.core.kind
    }

    fn last_error(&self) -> Option<SocketError> {
        self.core.inner.borrow().last_error
    }

    fn signals(&self) -> &SocketSignals {
        &self.core.signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn stream_pair(ss: &VirtualSocketServer) -> (VirtualSocket, Box<dyn AsyncSocket>, VirtualSocket) {
        let listener = ss.create_virtual_socket(AddressFamily::V4, SocketType::Stream);
        listener.bind(AddressFamily::V4.any()).unwrap();
        listener.listen(4).unwrap();

        let client = ss.create_virtual_socket(AddressFamily::V4, SocketType::Stream);
        client.connect(listener.local_address().unwrap()).unwrap();
        assert_eq!(client.state(), ConnState::Connecting);

        ss.process_all();
        let (server, from) = listener.accept().unwrap();
        assert_eq!(Some(from), client.local_address());

        ss.process_all();
        assert_eq!(client.state(), ConnState::Connected);
        (listener, server, client)
    }

    #[test]
    fn ephemeral_ports_are_distinct() {
        let ss = VirtualSocketServer::new();
        let a = ss.create_virtual_socket(AddressFamily::V4, SocketType::Stream);
        let b = ss.create_virtual_socket(AddressFamily::V4, SocketType::Stream);
        a.bind(AddressFamily::V4.any()).unwrap();
        b.bind(AddressFamily::V4.any()).unwrap();

        let pa = a.local_address().unwrap().port();
        let pb = b.local_address().unwrap().port();
        assert_ne!(pa, 0);
        assert_ne!(pa, pb);
    }

    #[test]
    fn bind_conflict() {
        let ss = VirtualSocketServer::new();
        let a = ss.create_virtual_socket(AddressFamily::V4, SocketType::Datagram);
        a.bind("0.0.0.0:5000".parse().unwrap()).unwrap();

        let b = ss.create_virtual_socket(AddressFamily::V4, SocketType::Datagram);
        assert_eq!(
            b.bind("127.0.0.1:5000".parse().unwrap()),
            Err(SocketError::AddressInUse)
        );
        assert_eq!(b.last_error(), Some(SocketError::AddressInUse));

        // Stream and datagram namespaces are separate.
        let c = ss.create_virtual_socket(AddressFamily::V4, SocketType::Stream);
        c.bind("0.0.0.0:5000".parse().unwrap()).unwrap();

        // Closing releases the port.
        a.close().unwrap();
        b.bind("127.0.0.1:5000".parse().unwrap()).unwrap();
    }

    #[test]
    fn independent_networks() {
        let ss1 = VirtualSocketServer::new();
        let ss2 = VirtualSocketServer::new();
        let a = ss1.create_virtual_socket(AddressFamily::V4, SocketType::Stream);
        let b = ss2.create_virtual_socket(AddressFamily::V4, SocketType::Stream);
        a.bind("0.0.0.0:7000".parse().unwrap()).unwrap();
        b.bind("0.0.0.0:7000".parse().unwrap()).unwrap();
    }

    #[test]
    fn accept_without_pending() {
        let ss = VirtualSocketServer::new();
        let listener = ss.create_virtual_socket(AddressFamily::V4, SocketType::Stream);
        listener.bind(AddressFamily::V4.any()).unwrap();
        listener.listen(1).unwrap();

        assert!(matches!(
            listener.accept(),
            Err(SocketError::NoPendingConnection)
        ));
    }

    #[test]
    fn stream_transfer_and_close() {
        let ss = VirtualSocketServer::new();
        let (_listener, server, client) = stream_pair(&ss);

        let closed = Rc::new(RefCell::new(None));
        let c = closed.clone();
        server
            .signals()
            .close
            .connect(move |_, err| *c.borrow_mut() = Some(err));

        assert_eq!(client.send(b"hello").unwrap(), 5);
        client.close().unwrap();
        client.close().unwrap();
        ss.process_all();

        // Data sent before the close is still readable.
        let mut buf = [0u8; 16];
        assert_eq!(server.recv(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(server.recv(&mut buf).unwrap(), 0);
        assert_eq!(server.state(), ConnState::Closed);
        assert_eq!(*closed.borrow(), Some(None));
    }

    #[test]
    fn connection_refused() {
        let ss = VirtualSocketServer::new();
        let client = ss.create_virtual_socket(AddressFamily::V4, SocketType::Stream);

        let err = Rc::new(RefCell::new(None));
        let e = err.clone();
        client
            .signals()
            .close
            .connect(move |_, error| *e.borrow_mut() = error);

        client.connect("127.0.0.1:9".parse().unwrap()).unwrap();
        ss.process_all();

        assert_eq!(client.state(), ConnState::Closed);
        assert_eq!(*err.borrow(), Some(SocketError::ConnectionRefused));
    }

    #[test]
    fn read_signal_on_data() {
        let ss = VirtualSocketServer::new();
        let (_listener, server, client) = stream_pair(&ss);

        let received = Rc::new(RefCell::new(Vec::new()));
        let r = received.clone();
        server.signals().read.connect(move |s, ()| {
            let mut buf = [0u8; 64];
            while let Ok(n) = s.recv(&mut buf) {
                if n == 0 {
                    break;
                }
                r.borrow_mut().extend_from_slice(&buf[..n]);
            }
        });

        client.send(b"abc").unwrap();
        client.send(b"def").unwrap();
        ss.process_all();

        assert_eq!(*received.borrow(), b"abcdef");
    }

    #[test]
    fn back_pressure_raises_write() {
        let config = NetworkConfig::builder().recv_buffer(8).build();
        let ss = VirtualSocketServer::with_config(config);
        let (_listener, server, client) = stream_pair(&ss);

        let writable = Rc::new(Cell::new(0));
        let w = writable.clone();
        client
            .signals()
            .write
            .connect(move |_, ()| w.set(w.get() + 1));

        assert_eq!(client.send(b"0123456789").unwrap(), 8);
        assert_eq!(client.send(b"89"), Err(SocketError::WouldBlock));
        ss.process_all();

        let mut buf = [0u8; 4];
        assert_eq!(server.recv(&mut buf).unwrap(), 4);
        ss.process_all();
        assert_eq!(writable.get(), 1);
        assert_eq!(client.send(b"89").unwrap(), 2);
    }

    #[test]
    fn short_write_raises_write() {
        let config = NetworkConfig::builder().recv_buffer(8).build();
        let ss = VirtualSocketServer::with_config(config);
        let (_listener, server, client) = stream_pair(&ss);

        let writable = Rc::new(Cell::new(0));
        let w = writable.clone();
        client
            .signals()
            .write
            .connect(move |_, ()| w.set(w.get() + 1));

        // Never sees WouldBlock, yet the rest is still owed a signal.
        assert_eq!(client.send(b"0123456789").unwrap(), 8);
        ss.process_all();

        let mut buf = [0u8; 8];
        assert_eq!(server.recv(&mut buf).unwrap(), 8);
        ss.process_all();
        assert_eq!(writable.get(), 1);
        assert_eq!(client.send(b"89").unwrap(), 2);

        // A complete write owes nothing.
        assert_eq!(server.recv(&mut buf), Err(SocketError::WouldBlock));
        ss.process_all();
        assert_eq!(server.recv(&mut buf).unwrap(), 2);
        ss.process_all();
        assert_eq!(writable.get(), 1);
    }

    #[test]
    fn datagram_exchange() {
        let ss = VirtualSocketServer::new();
        let a = ss.create_virtual_socket(AddressFamily::V4, SocketType::Datagram);
        let b = ss.create_virtual_socket(AddressFamily::V4, SocketType::Datagram);
        a.bind(AddressFamily::V4.any()).unwrap();
        b.bind(AddressFamily::V4.any()).unwrap();

        a.connect(b.local_address().unwrap()).unwrap();
        assert_eq!(a.state(), ConnState::Connected);
        a.send(b"one").unwrap();
        a.send(b"two").unwrap();
        ss.process_all();

        let mut buf = [0u8; 8];
        let (n, from) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"one");
        assert_eq!(Some(from), a.local_address());
        assert_eq!(b.recv(&mut buf).unwrap(), 3);
        assert_eq!(b.recv(&mut buf), Err(SocketError::WouldBlock));
    }

    #[test]
    fn seeded_loss_drops_everything_at_one() {
        let config = NetworkConfig::builder()
            .drop_probability(1.0)
            .rng_seed(7)
            .build();
        let ss = VirtualSocketServer::with_config(config);
        let a = ss.create_virtual_socket(AddressFamily::V4, SocketType::Datagram);
        let b = ss.create_virtual_socket(AddressFamily::V4, SocketType::Datagram);
        b.bind(AddressFamily::V4.any()).unwrap();

        assert_eq!(a.send_to(b"x", b.local_address().unwrap()).unwrap(), 1);
        assert_eq!(ss.pending_events(), 0);
    }

    #[test]
    fn wait_without_io_ignores_network() {
        let ss = VirtualSocketServer::new();
        let a = ss.create_virtual_socket(AddressFamily::V4, SocketType::Datagram);
        let b = ss.create_virtual_socket(AddressFamily::V4, SocketType::Datagram);
        b.bind(AddressFamily::V4.any()).unwrap();
        a.send_to(b"x", b.local_address().unwrap()).unwrap();

        ss.wait(Timeout::millis(10), false);
        assert_eq!(ss.pending_events(), 1);

        ss.wait(Timeout::millis(10), true);
        assert_eq!(ss.pending_events(), 0);
    }

    #[test]
    fn dropping_socket_closes_peer() {
        let ss = VirtualSocketServer::new();
        let (_listener, server, client) = stream_pair(&ss);
        drop(client);
        ss.process_all();
        assert_eq!(server.state(), ConnState::Closed);
    }

    #[test]
    fn delay_postpones_delivery() {
        let ss = VirtualSocketServer::new();
        ss.set_delay(Duration::from_millis(30));
        let a = ss.create_virtual_socket(AddressFamily::V4, SocketType::Datagram);
        let b = ss.create_virtual_socket(AddressFamily::V4, SocketType::Datagram);
        b.bind(AddressFamily::V4.any()).unwrap();
        a.send_to(b"x", b.local_address().unwrap()).unwrap();

        let start = Instant::now();
        ss.process_all();
        assert!(start.elapsed() >= Duration::from_millis(25));
        let mut buf = [0u8; 1];
        assert_eq!(b.recv(&mut buf).unwrap(), 1);
    }

    #[test]
    fn unbounded_delay_saturates() {
        let ss = VirtualSocketServer::new();
        ss.set_delay(Duration::MAX);
        let a = ss.create_virtual_socket(AddressFamily::V4, SocketType::Datagram);
        let b = ss.create_virtual_socket(AddressFamily::V4, SocketType::Datagram);
        b.bind(AddressFamily::V4.any()).unwrap();
        a.send_to(b"x", b.local_address().unwrap()).unwrap();

        assert_eq!(ss.pending_events(), 1);
        let mut buf = [0u8; 1];
        assert_eq!(b.recv(&mut buf), Err(SocketError::WouldBlock));
    }
}
