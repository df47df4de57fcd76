//! Per-peer connection state machine.
//!
//! A stream connection accumulates bytes into a receive buffer and
//! greedily slices complete frames out of it; outbound messages sit in a
//! FIFO of `(shared buffer, offset)` pairs and `OUT` readiness is only
//! monitored while that queue is non-empty. Ancillary descriptors are
//! sent with the first byte of a frame and, on receipt, attach to the
//! next frame that completes.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::mem;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};

use crate::addr::Addr;
use crate::buffer::Buffer;
use crate::codec::Value;
use crate::ctx::CtxInner;
use crate::event_loop::{EventLoop, IoEvents};
use crate::message::{Header, Msg, HEADER_SIZE, MAX_MSG_SIZE};
use crate::sys::{self, PeerCred};
use crate::{Error, Result};

/// Connection lifecycle. Accepted connections start `Connected`; client
/// connections pass through `Connecting` while the nonblocking connect
/// is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Closing,
    Closed,
}

struct RxState {
    data: Vec<u8>,
    /// Received ancillary descriptors awaiting their frame.
    fds: Vec<OwnedFd>,
}

struct TxEntry {
    buf: Rc<Buffer>,
    off: usize,
}

/// One peer of a context. Handed out as `Rc<Conn>` in event callbacks;
/// all methods must be called from the owning loop's thread.
pub struct Conn {
    me: Weak<Conn>,
    fd: OwnedFd,
    dgram: bool,
    unix: bool,
    state: Cell<ConnState>,
    local: RefCell<Option<Addr>>,
    peer: RefCell<Option<Addr>>,
    cred: Cell<Option<PeerCred>>,
    rx: RefCell<RxState>,
    txq: RefCell<VecDeque<TxEntry>>,
    watching_out: Cell<bool>,
    evloop: Rc<EventLoop>,
    ctx: Weak<CtxInner>,
}

impl Conn {
    fn build(
        ctx: &Rc<CtxInner>,
        fd: OwnedFd,
        dgram: bool,
        unix: bool,
        state: ConnState,
    ) -> Rc<Conn> {
        let evloop = ctx.event_loop();
        Rc::new_cyclic(|me| Conn {
            me: me.clone(),
            fd,
            dgram,
            unix,
            state: Cell::new(state),
            local: RefCell::new(None),
            peer: RefCell::new(None),
            cred: Cell::new(None),
            rx: RefCell::new(RxState { data: Vec::new(), fds: Vec::new() }),
            txq: RefCell::new(VecDeque::new()),
            watching_out: Cell::new(false),
            evloop,
            ctx: Rc::downgrade(ctx),
        })
    }

    fn register(conn: &Rc<Conn>, events: IoEvents) -> Result<()> {
        let weak = conn.me.clone();
        conn.evloop.add(conn.fd.as_raw_fd(), events, move |_, revents| {
            if let Some(c) = weak.upgrade() {
                c.on_io(revents);
            }
        })
    }

    /// Server side: a freshly accepted stream connection.
    pub(crate) fn new_accepted(ctx: &Rc<CtxInner>, fd: OwnedFd, peer: Addr) -> Result<Rc<Conn>> {
        let unix = peer.is_unix();
        let conn = Self::build(ctx, fd, false, unix, ConnState::Connected);
        let raw = conn.fd.as_raw_fd();
        *conn.local.borrow_mut() = sys::local_addr(raw).ok();
        *conn.peer.borrow_mut() = Some(peer);
        if unix {
            conn.cred.set(sys::peer_cred(raw));
        }
        Self::register(&conn, IoEvents::IN)?;
        Ok(conn)
    }

    /// Client side. With `connected` the nonblocking connect finished
    /// synchronously; otherwise the connection watches `OUT` until the
    /// kernel reports the outcome.
    pub(crate) fn new_client(
        ctx: &Rc<CtxInner>,
        fd: OwnedFd,
        target: &Addr,
        connected: bool,
    ) -> Result<Rc<Conn>> {
        let unix = target.is_unix();
        let state = if connected { ConnState::Connected } else { ConnState::Connecting };
        let conn = Self::build(ctx, fd, false, unix, state);
        let raw = conn.fd.as_raw_fd();
        *conn.peer.borrow_mut() = Some(target.clone());
        if connected {
            *conn.local.borrow_mut() = sys::local_addr(raw).ok();
            if unix {
                conn.cred.set(sys::peer_cred(raw));
            }
            Self::register(&conn, IoEvents::IN)?;
        } else {
            Self::register(&conn, IoEvents::OUT)?;
        }
        Ok(conn)
    }

    /// Connection-less context: one pseudo-connection carrying the bound
    /// socket; `peer_addr` reflects the sender of the last datagram.
    pub(crate) fn new_dgram(ctx: &Rc<CtxInner>, fd: OwnedFd, local: Addr) -> Result<Rc<Conn>> {
        let unix = local.is_unix();
        let conn = Self::build(ctx, fd, true, unix, ConnState::Connected);
        *conn.local.borrow_mut() = Some(local);
        Self::register(&conn, IoEvents::IN)?;
        Ok(conn)
    }

    pub fn state(&self) -> ConnState {
        self.state.get()
    }

    pub fn is_unix(&self) -> bool {
        self.unix
    }

    pub fn local_addr(&self) -> Option<Addr> {
        self.local.borrow().clone()
    }

    /// Peer address: the remote end for stream connections, the sender
    /// of the most recent datagram for connection-less contexts.
    pub fn peer_addr(&self) -> Option<Addr> {
        self.peer.borrow().clone()
    }

    /// Peer credentials (`SO_PEERCRED`), unix stream sockets only.
    pub fn peer_cred(&self) -> Option<PeerCred> {
        self.cred.get()
    }

    /// Queue a finished message for this peer. Transport failures after
    /// queueing surface as a `Disconnected` event, not here.
    pub fn send_msg(&self, msg: &Msg) -> Result<()> {
        if self.dgram {
            let peer = self.peer.borrow().clone().ok_or(Error::NotConnected)?;
            return self.send_to(msg, &peer);
        }
        if self.state.get() != ConnState::Connected {
            return Err(Error::NotConnected);
        }
        let buf = Rc::clone(msg.shared_buf()?);
        if !buf.fds().is_empty() && !self.unix {
            return Err(Error::FdPassingNotSupported);
        }
        self.txq.borrow_mut().push_back(TxEntry { buf, off: 0 });
        self.flush_tx();
        Ok(())
    }

    /// Format-driven one-shot send.
    pub fn send(&self, msgid: u32, fmt: &str, args: &[Value<'_>]) -> Result<()> {
        let mut msg = Msg::new();
        msg.write(msgid, fmt, args)?;
        self.send_msg(&msg)
    }

    /// Datagram send of the whole frame in one `sendto`. An oversized
    /// frame fails with [`Error::MessageTooLarge`] rather than being
    /// truncated; a full socket buffer surfaces [`Error::WouldBlock`].
    pub(crate) fn send_to(&self, msg: &Msg, dest: &Addr) -> Result<()> {
        let buf = msg.shared_buf()?;
        if !buf.fds().is_empty() && !(self.unix && dest.is_unix()) {
            return Err(Error::FdPassingNotSupported);
        }
        let raw_fds: Vec<RawFd> = buf.fds().iter().map(|f| f.as_raw_fd()).collect();
        match sys::send_with_fds(self.fd.as_raw_fd(), buf.data(), &raw_fds, Some(dest)) {
            Ok(n) if n == buf.len() => Ok(()),
            Ok(_) => Err(Error::MessageTooLarge),
            Err(e) => match e.raw_os() {
                Some(libc::EMSGSIZE) => Err(Error::MessageTooLarge),
                Some(libc::EAGAIN) => Err(Error::WouldBlock),
                _ => Err(e),
            },
        }
    }

    /// Force the connection down. The context observes it exactly as a
    /// peer-initiated disconnect.
    pub fn disconnect(&self) -> Result<()> {
        match self.state.get() {
            ConnState::Connected | ConnState::Connecting => {}
            _ => return Err(Error::NotConnected),
        }
        let was_connected = self.state.get() == ConnState::Connected;
        self.teardown();
        if let (Some(ctx), Some(me)) = (self.ctx.upgrade(), self.me.upgrade()) {
            ctx.conn_terminated(&me, was_connected);
        }
        Ok(())
    }

    /// Unregister from the loop and drop queued output. Does not notify
    /// the context; callers decide whether an event is due.
    pub(crate) fn teardown(&self) {
        if self.state.get() == ConnState::Closed {
            return;
        }
        self.state.set(ConnState::Closing);
        let _ = self.evloop.remove(self.fd.as_raw_fd());
        self.txq.borrow_mut().clear();
        // kill the socket even if user code keeps the Rc alive
        unsafe {
            libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RDWR);
        }
        self.state.set(ConnState::Closed);
    }

    fn close_from_io(&self) {
        let was_connected = self.state.get() == ConnState::Connected;
        self.teardown();
        if let (Some(ctx), Some(me)) = (self.ctx.upgrade(), self.me.upgrade()) {
            ctx.conn_terminated(&me, was_connected);
        }
    }

    fn on_io(&self, revents: IoEvents) {
        if self.state.get() == ConnState::Connecting {
            if revents.intersects(IoEvents::OUT | IoEvents::ERR | IoEvents::HUP) {
                self.finish_connect();
            }
            return;
        }
        if revents.contains(IoEvents::OUT) {
            self.flush_tx();
        }
        if revents.intersects(IoEvents::IN | IoEvents::ERR | IoEvents::HUP) {
            if self.dgram {
                self.read_dgram();
            } else {
                self.read_stream();
            }
        }
    }

    fn finish_connect(&self) {
        let raw = self.fd.as_raw_fd();
        let err = sys::socket_error(raw).unwrap_or(libc::EIO);
        if err == 0 {
            self.state.set(ConnState::Connected);
            *self.local.borrow_mut() = sys::local_addr(raw).ok();
            if self.unix {
                self.cred.set(sys::peer_cred(raw));
            }
            let need_out = !self.txq.borrow().is_empty();
            let events =
                if need_out { IoEvents::IN | IoEvents::OUT } else { IoEvents::IN };
            let _ = self.evloop.update(raw, events);
            self.watching_out.set(need_out);
            if let (Some(ctx), Some(me)) = (self.ctx.upgrade(), self.me.upgrade()) {
                ctx.conn_established(&me);
            }
        } else {
            log::debug!(
                "connect to {:?} failed: {}",
                self.peer.borrow(),
                std::io::Error::from_raw_os_error(err)
            );
            self.teardown();
            if let (Some(ctx), Some(me)) = (self.ctx.upgrade(), self.me.upgrade()) {
                ctx.conn_terminated(&me, false);
            }
        }
    }

    /// Ask the loop to watch `OUT` exactly while there is queued output.
    fn sync_out_interest(&self) {
        if self.state.get() != ConnState::Connected {
            return;
        }
        let need = !self.txq.borrow().is_empty();
        if need != self.watching_out.get() {
            let events = if need { IoEvents::IN | IoEvents::OUT } else { IoEvents::IN };
            if self.evloop.update(self.fd.as_raw_fd(), events).is_ok() {
                self.watching_out.set(need);
            }
        }
    }

    fn flush_tx(&self) {
        if self.state.get() != ConnState::Connected {
            return;
        }
        let raw = self.fd.as_raw_fd();
        let mut failed = false;
        loop {
            let (buf, off) = {
                let q = self.txq.borrow();
                match q.front() {
                    Some(e) => (Rc::clone(&e.buf), e.off),
                    None => break,
                }
            };
            // descriptors ride along with the first byte of the frame
            let raw_fds: Vec<RawFd> = if off == 0 {
                buf.fds().iter().map(|f| f.as_raw_fd()).collect()
            } else {
                Vec::new()
            };
            match sys::send_with_fds(raw, &buf.data()[off..], &raw_fds, None) {
                Ok(0) => break,
                Ok(n) => {
                    let mut q = self.txq.borrow_mut();
                    if let Some(e) = q.front_mut() {
                        e.off += n;
                        if e.off >= e.buf.len() {
                            q.pop_front();
                        }
                    }
                }
                Err(e) => match e.raw_os() {
                    Some(libc::EAGAIN) => break,
                    Some(libc::EINTR) => continue,
                    _ => {
                        log::warn!("send on fd {raw} failed: {e}");
                        failed = true;
                        break;
                    }
                },
            }
        }
        if failed {
            self.close_from_io();
        } else {
            self.sync_out_interest();
        }
    }

    fn read_stream(&self) {
        if self.state.get() != ConnState::Connected {
            return;
        }
        let raw = self.fd.as_raw_fd();
        let mut msgs: Vec<Msg> = Vec::new();
        let mut disconnect = false;
        {
            let mut rx = self.rx.borrow_mut();
            loop {
                let mut scratch = [0u8; 4096];
                match sys::recv_with_fds(raw, &mut scratch, false) {
                    Ok(r) => {
                        rx.fds.extend(r.fds);
                        if r.n == 0 {
                            // orderly shutdown from the peer
                            disconnect = true;
                            break;
                        }
                        rx.data.extend_from_slice(&scratch[..r.n]);
                    }
                    Err(e) => match e.raw_os_error() {
                        Some(libc::EAGAIN) => break,
                        Some(libc::EINTR) => continue,
                        _ => {
                            log::warn!("recv on fd {raw} failed: {e}");
                            disconnect = true;
                            break;
                        }
                    },
                }
            }

            // drain every complete frame before yielding
            loop {
                if rx.data.len() < HEADER_SIZE {
                    break;
                }
                let hdr = match Header::parse(&rx.data[..HEADER_SIZE]) {
                    Ok(h) => h,
                    Err(_) => {
                        log::warn!("protocol error on fd {raw}: bad frame header");
                        disconnect = true;
                        break;
                    }
                };
                if hdr.size > MAX_MSG_SIZE {
                    log::warn!(
                        "oversized frame on fd {raw}: {} bytes (max {MAX_MSG_SIZE})",
                        hdr.size
                    );
                    disconnect = true;
                    break;
                }
                if rx.data.len() < hdr.size as usize {
                    break;
                }
                let frame: Vec<u8> = rx.data.drain(..hdr.size as usize).collect();
                let fds = mem::take(&mut rx.fds);
                match Msg::from_wire(Buffer::from_parts(frame, fds)) {
                    Ok(msg) => msgs.push(msg),
                    Err(_) => {
                        disconnect = true;
                        break;
                    }
                }
            }
        }

        if let (Some(ctx), Some(me)) = (self.ctx.upgrade(), self.me.upgrade()) {
            for msg in &msgs {
                ctx.deliver_msg(&me, msg);
            }
        }
        if disconnect {
            self.close_from_io();
        }
    }

    fn read_dgram(&self) {
        let raw = self.fd.as_raw_fd();
        loop {
            let mut scratch = vec![0u8; 65536];
            match sys::recv_with_fds(raw, &mut scratch, true) {
                Ok(r) => {
                    let hdr = match Header::parse(&scratch[..r.n.min(scratch.len())]) {
                        Ok(h) => h,
                        Err(_) => {
                            log::warn!("dropping malformed datagram ({} bytes)", r.n);
                            continue;
                        }
                    };
                    if hdr.size > MAX_MSG_SIZE || hdr.size as usize > r.n {
                        log::warn!("dropping truncated datagram ({} bytes)", r.n);
                        continue;
                    }
                    scratch.truncate(hdr.size as usize);
                    let msg = match Msg::from_wire(Buffer::from_parts(scratch, r.fds)) {
                        Ok(m) => m,
                        Err(_) => continue,
                    };
                    *self.peer.borrow_mut() = r.from;
                    if let (Some(ctx), Some(me)) = (self.ctx.upgrade(), self.me.upgrade()) {
                        ctx.deliver_msg(&me, &msg);
                    }
                }
                Err(e) => match e.raw_os_error() {
                    Some(libc::EAGAIN) => break,
                    Some(libc::EINTR) => continue,
                    _ => {
                        log::warn!("recvfrom on fd {raw} failed: {e}");
                        break;
                    }
                },
            }
        }
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("fd", &self.fd.as_raw_fd())
            .field("state", &self.state.get())
            .field("peer", &*self.peer.borrow())
            .finish()
    }
}
