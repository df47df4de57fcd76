//! Context: wires sockets, connections, timers and the event loop into
//! the user-facing client/server/datagram API.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::addr::Addr;
use crate::codec::Value;
use crate::conn::{Conn, ConnState};
use crate::event_loop::{EventLoop, IoEvents, Wakeup};
use crate::message::Msg;
use crate::sys;
use crate::timer::Timer;
use crate::{Error, Result};

/// Default first reconnect delay for client contexts; each failed attempt
/// doubles it, capped at 16x.
const RECONNECT_BASE: Duration = Duration::from_secs(2);

/// What happened on a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A peer is connected (server: one event per accepted client).
    Connected,
    /// A peer went away, orderly or not.
    Disconnected,
    /// A message arrived; the handler also receives it.
    Msg,
}

impl Event {
    pub fn as_str(self) -> &'static str {
        match self {
            Event::Connected => "CONNECTED",
            Event::Disconnected => "DISCONNECTED",
            Event::Msg => "MSG",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Handler = Box<dyn FnMut(&Context, Event, &Rc<Conn>, Option<&Msg>)>;

enum Role {
    Idle,
    Server {
        listen_fd: OwnedFd,
        local: Addr,
        conns: Vec<Rc<Conn>>,
    },
    Client {
        target: Addr,
        conn: Option<Rc<Conn>>,
        timer: Timer,
        attempts: u32,
    },
    Dgram {
        local: Addr,
        conn: Rc<Conn>,
    },
}

enum SendTarget {
    Broadcast(Vec<Rc<Conn>>),
    One(Rc<Conn>),
    None,
}

pub(crate) struct CtxInner {
    me: Weak<CtxInner>,
    evloop: Rc<EventLoop>,
    handler: RefCell<Handler>,
    /// Events raised while the handler is already running (e.g. `stop`
    /// called from a callback); drained when it returns.
    pending: RefCell<VecDeque<(Event, Rc<Conn>)>>,
    role: RefCell<Role>,
    reconnect_base: Cell<Duration>,
}

/// A messaging endpoint: server (`listen`), auto-reconnecting client
/// (`connect`) or connection-less datagram endpoint (`bind`).
///
/// All events are delivered through the handler given at construction,
/// from the thread driving [`wait_and_process`](Context::wait_and_process)
/// (or [`process_fd`](Context::process_fd) when composed into a host
/// loop). Dropping the context tears everything down silently; call
/// [`stop`](Context::stop) first for `Disconnected` notifications.
pub struct Context {
    inner: Rc<CtxInner>,
}

impl Context {
    /// Create a context driving its own [`EventLoop`].
    pub fn new<F>(handler: F) -> Result<Context>
    where
        F: FnMut(&Context, Event, &Rc<Conn>, Option<&Msg>) + 'static,
    {
        Self::with_loop(handler, EventLoop::new()?)
    }

    /// Create a context on an existing loop, sharing it with other
    /// contexts and timers.
    pub fn with_loop<F>(handler: F, evloop: Rc<EventLoop>) -> Result<Context>
    where
        F: FnMut(&Context, Event, &Rc<Conn>, Option<&Msg>) + 'static,
    {
        Ok(Context {
            inner: Rc::new_cyclic(|me| CtxInner {
                me: me.clone(),
                evloop,
                handler: RefCell::new(Box::new(handler)),
                pending: RefCell::new(VecDeque::new()),
                role: RefCell::new(Role::Idle),
                reconnect_base: Cell::new(RECONNECT_BASE),
            }),
        })
    }

    pub fn event_loop(&self) -> Rc<EventLoop> {
        self.inner.evloop.clone()
    }

    /// First retry delay for client reconnection (doubles per failure).
    pub fn set_reconnect_delay(&self, base: Duration) {
        self.inner.reconnect_base.set(base.max(Duration::from_millis(1)));
    }

    /// Start a server listening on `addr`.
    pub fn listen(&self, addr: &Addr) -> Result<()> {
        self.inner.check_idle()?;
        let sock = sys::socket(addr, false)?;
        let raw = sock.as_raw_fd();
        if !addr.is_unix() {
            sys::set_reuseaddr(raw)?;
        }
        sys::bind(raw, addr)?;
        sys::listen(raw, 128)?;
        let local = sys::local_addr(raw).unwrap_or_else(|_| addr.clone());
        let weak = Rc::downgrade(&self.inner);
        self.inner.evloop.add(raw, IoEvents::IN, move |fd, _| {
            if let Some(inner) = weak.upgrade() {
                inner.on_accept_ready(fd);
            }
        })?;
        *self.inner.role.borrow_mut() =
            Role::Server { listen_fd: sock, local, conns: Vec::new() };
        Ok(())
    }

    /// Start a client towards `addr`. Succeeds even while the peer is
    /// unreachable: the context retries on an internal timer until it
    /// connects, and reconnects after any disconnection, until
    /// [`stop`](Context::stop).
    pub fn connect(&self, addr: &Addr) -> Result<()> {
        self.inner.check_idle()?;
        let weak = Rc::downgrade(&self.inner);
        let timer = Timer::new(&self.inner.evloop, move || {
            if let Some(inner) = weak.upgrade() {
                inner.reconnect_tick();
            }
        })?;
        *self.inner.role.borrow_mut() =
            Role::Client { target: addr.clone(), conn: None, timer, attempts: 0 };
        self.inner.start_connect();
        Ok(())
    }

    /// Bind a connection-less datagram endpoint on `addr`.
    pub fn bind(&self, addr: &Addr) -> Result<()> {
        self.inner.check_idle()?;
        let sock = sys::socket(addr, true)?;
        let raw = sock.as_raw_fd();
        if !addr.is_unix() {
            sys::set_reuseaddr(raw)?;
        }
        sys::bind(raw, addr)?;
        let local = sys::local_addr(raw).unwrap_or_else(|_| addr.clone());
        let conn = Conn::new_dgram(&self.inner, sock, local.clone())?;
        *self.inner.role.borrow_mut() = Role::Dgram { local, conn };
        Ok(())
    }

    /// Disconnect every peer (with `Disconnected` notifications), close
    /// the sockets and return to the idle state. The context can be
    /// started again afterwards.
    pub fn stop(&self) -> Result<()> {
        let to_notify = self.inner.shutdown_role();
        for conn in &to_notify {
            self.inner.notify(Event::Disconnected, conn, None);
        }
        Ok(())
    }

    /// Send a finished message. Servers broadcast to every connected
    /// client, best-effort: per-connection failures are logged, not
    /// returned. Clients fail with [`Error::NotConnected`] while the link
    /// is down.
    pub fn send_msg(&self, msg: &Msg) -> Result<()> {
        msg.shared_buf()?;
        let target = {
            let role = self.inner.role.borrow();
            match &*role {
                Role::Server { conns, .. } => SendTarget::Broadcast(
                    conns
                        .iter()
                        .filter(|c| c.state() == ConnState::Connected)
                        .cloned()
                        .collect(),
                ),
                Role::Client { conn: Some(c), .. } if c.state() == ConnState::Connected => {
                    SendTarget::One(c.clone())
                }
                _ => SendTarget::None,
            }
        };
        match target {
            SendTarget::Broadcast(conns) => {
                for conn in conns {
                    if let Err(e) = conn.send_msg(msg) {
                        log::warn!("broadcast to {:?} failed: {e}", conn.peer_addr());
                    }
                }
                Ok(())
            }
            SendTarget::One(conn) => conn.send_msg(msg),
            SendTarget::None => Err(Error::NotConnected),
        }
    }

    /// Format-driven one-shot send; see [`send_msg`](Context::send_msg).
    pub fn send(&self, msgid: u32, fmt: &str, args: &[Value<'_>]) -> Result<()> {
        let mut msg = Msg::new();
        msg.write(msgid, fmt, args)?;
        self.send_msg(&msg)
    }

    /// Datagram send to an explicit destination.
    pub fn send_msg_to(&self, msg: &Msg, dest: &Addr) -> Result<()> {
        let conn = match &*self.inner.role.borrow() {
            Role::Dgram { conn, .. } => conn.clone(),
            _ => return Err(Error::InvalidArgument),
        };
        conn.send_to(msg, dest)
    }

    /// Connections of a server context (a client has at most one, see
    /// [`connection`](Context::connection)).
    pub fn connections(&self) -> Vec<Rc<Conn>> {
        match &*self.inner.role.borrow() {
            Role::Server { conns, .. } => conns.clone(),
            Role::Client { conn: Some(c), .. } => vec![c.clone()],
            Role::Dgram { conn, .. } => vec![conn.clone()],
            _ => Vec::new(),
        }
    }

    /// The client's connection to the server, while one is established.
    pub fn connection(&self) -> Option<Rc<Conn>> {
        match &*self.inner.role.borrow() {
            Role::Client { conn, .. } => conn.clone(),
            Role::Dgram { conn, .. } => Some(conn.clone()),
            _ => None,
        }
    }

    /// Bound or listening address, useful after binding port 0.
    pub fn local_addr(&self) -> Option<Addr> {
        match &*self.inner.role.borrow() {
            Role::Server { local, .. } | Role::Dgram { local, .. } => Some(local.clone()),
            Role::Client { conn: Some(c), .. } => c.local_addr(),
            _ => None,
        }
    }

    /// See [`EventLoop::get_fd`].
    pub fn get_fd(&self) -> Result<RawFd> {
        self.inner.evloop.get_fd()
    }

    /// See [`EventLoop::process_fd`].
    pub fn process_fd(&self) -> Result<()> {
        self.inner.evloop.process_fd()
    }

    /// See [`EventLoop::wait_and_process`].
    pub fn wait_and_process(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.evloop.wait_and_process(timeout)
    }

    /// See [`EventLoop::wakeup`]; thread- and signal-safe.
    pub fn wakeup(&self) {
        self.inner.evloop.wakeup();
    }

    /// See [`EventLoop::wake_handle`].
    pub fn wake_handle(&self) -> Wakeup {
        self.inner.evloop.wake_handle()
    }
}

impl CtxInner {
    pub(crate) fn event_loop(&self) -> Rc<EventLoop> {
        self.evloop.clone()
    }

    fn check_idle(&self) -> Result<()> {
        if matches!(&*self.role.borrow(), Role::Idle) {
            Ok(())
        } else {
            Err(Error::Busy)
        }
    }

    /// Deliver an event to the user handler, or queue it when the
    /// handler is already on the stack.
    pub(crate) fn notify(&self, event: Event, conn: &Rc<Conn>, msg: Option<&Msg>) {
        let Some(inner) = self.me.upgrade() else { return };
        match self.handler.try_borrow_mut() {
            Ok(mut handler) => {
                let ctx = Context { inner };
                handler(&ctx, event, conn, msg);
                drop(handler);
                self.drain_pending();
            }
            Err(_) => {
                if event == Event::Msg {
                    // only stop/disconnect paths can reenter; a nested
                    // message would mean recursive wait_and_process
                    log::warn!("dropping nested message event");
                    return;
                }
                self.pending.borrow_mut().push_back((event, conn.clone()));
            }
        }
    }

    fn drain_pending(&self) {
        loop {
            let next = self.pending.borrow_mut().pop_front();
            match next {
                Some((event, conn)) => self.notify(event, &conn, None),
                None => break,
            }
        }
    }

    pub(crate) fn deliver_msg(&self, conn: &Rc<Conn>, msg: &Msg) {
        self.notify(Event::Msg, conn, Some(msg));
    }

    pub(crate) fn conn_established(&self, conn: &Rc<Conn>) {
        {
            let mut role = self.role.borrow_mut();
            if let Role::Client { attempts, .. } = &mut *role {
                *attempts = 0;
            }
        }
        self.notify(Event::Connected, conn, None);
    }

    pub(crate) fn conn_terminated(&self, conn: &Rc<Conn>, was_connected: bool) {
        let reconnect = {
            let mut role = self.role.borrow_mut();
            match &mut *role {
                Role::Server { conns, .. } => {
                    conns.retain(|c| !Rc::ptr_eq(c, conn));
                    false
                }
                Role::Client { conn: slot, .. } => {
                    if slot.as_ref().map_or(false, |c| Rc::ptr_eq(c, conn)) {
                        *slot = None;
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            }
        };
        if was_connected {
            self.notify(Event::Disconnected, conn, None);
        }
        if reconnect {
            self.schedule_reconnect();
        }
    }

    fn on_accept_ready(&self, listen_fd: RawFd) {
        let Some(me) = self.me.upgrade() else { return };
        loop {
            match sys::accept(listen_fd) {
                Ok(Some((fd, peer))) => match Conn::new_accepted(&me, fd, peer) {
                    Ok(conn) => {
                        {
                            let mut role = self.role.borrow_mut();
                            if let Role::Server { conns, .. } = &mut *role {
                                conns.push(conn.clone());
                            }
                        }
                        self.notify(Event::Connected, &conn, None);
                    }
                    Err(e) => log::warn!("failed to set up accepted connection: {e}"),
                },
                Ok(None) => break,
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn reconnect_tick(&self) {
        let retry = matches!(&*self.role.borrow(), Role::Client { conn: None, .. });
        if retry {
            self.start_connect();
        }
    }

    fn start_connect(&self) {
        let Some(me) = self.me.upgrade() else { return };
        let target = match &*self.role.borrow() {
            Role::Client { target, .. } => target.clone(),
            _ => return,
        };
        let sock = match sys::socket(&target, false) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("client socket creation failed: {e}");
                self.schedule_reconnect();
                return;
            }
        };
        let raw = sock.as_raw_fd();
        let outcome = match sys::connect(raw, &target) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("connect to {target} rejected: {e}");
                self.schedule_reconnect();
                return;
            }
        };
        match outcome {
            Ok(()) => match Conn::new_client(&me, sock, &target, true) {
                Ok(conn) => {
                    self.store_client_conn(&conn);
                    self.conn_established(&conn);
                }
                Err(e) => {
                    log::warn!("client connection setup failed: {e}");
                    self.schedule_reconnect();
                }
            },
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                match Conn::new_client(&me, sock, &target, false) {
                    Ok(conn) => self.store_client_conn(&conn),
                    Err(e) => {
                        log::warn!("client connection setup failed: {e}");
                        self.schedule_reconnect();
                    }
                }
            }
            Err(e) => {
                log::debug!("connect to {target} failed: {e}");
                self.schedule_reconnect();
            }
        }
    }

    fn store_client_conn(&self, conn: &Rc<Conn>) {
        let mut role = self.role.borrow_mut();
        if let Role::Client { conn: slot, .. } = &mut *role {
            *slot = Some(conn.clone());
        }
    }

    fn schedule_reconnect(&self) {
        let base = self.reconnect_base.get();
        let mut role = self.role.borrow_mut();
        if let Role::Client { timer, attempts, conn, .. } = &mut *role {
            if conn.is_some() {
                return;
            }
            let delay = base.saturating_mul(1 << (*attempts).min(4));
            *attempts += 1;
            log::debug!("reconnect attempt {attempts} in {delay:?}");
            let _ = timer.set(delay);
        }
    }

    /// Tear the active role down and return the connections owed a
    /// `Disconnected` notification.
    fn shutdown_role(&self) -> Vec<Rc<Conn>> {
        let old = mem::replace(&mut *self.role.borrow_mut(), Role::Idle);
        let mut to_notify = Vec::new();
        match old {
            Role::Idle => {}
            Role::Server { listen_fd, conns, .. } => {
                let _ = self.evloop.remove(listen_fd.as_raw_fd());
                drop(listen_fd);
                for conn in conns {
                    let was = conn.state() == ConnState::Connected;
                    conn.teardown();
                    if was {
                        to_notify.push(conn);
                    }
                }
            }
            Role::Client { conn, timer, .. } => {
                let _ = timer.clear();
                drop(timer);
                if let Some(conn) = conn {
                    let was = conn.state() == ConnState::Connected;
                    conn.teardown();
                    if was {
                        to_notify.push(conn);
                    }
                }
            }
            Role::Dgram { conn, .. } => {
                conn.teardown();
            }
        }
        to_notify
    }
}

impl Drop for CtxInner {
    fn drop(&mut self) {
        // no observer remains; tear down without synthesizing events
        let _ = self.shutdown_role();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn null_handler() -> impl FnMut(&Context, Event, &Rc<Conn>, Option<&Msg>) + 'static {
        |_, _, _, _| {}
    }

    #[test]
    fn event_names() {
        assert_eq!(Event::Connected.as_str(), "CONNECTED");
        assert_eq!(Event::Disconnected.as_str(), "DISCONNECTED");
        assert_eq!(Event::Msg.to_string(), "MSG");
    }

    #[test]
    fn send_requires_a_finished_message() {
        let ctx = Context::new(null_handler()).unwrap();
        let msg = Msg::new();
        assert!(matches!(ctx.send_msg(&msg), Err(Error::InvalidArgument)));
    }

    #[test]
    fn client_send_without_connection() {
        let ctx = Context::new(null_handler()).unwrap();
        // port reserved then released: nothing listens there
        let addr = {
            let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let port = sock.local_addr().unwrap().port();
            format!("inet:127.0.0.1:{port}").parse::<Addr>().unwrap()
        };
        ctx.connect(&addr).unwrap();
        let mut msg = Msg::new();
        msg.write(1, "%u", &[Value::U32(1)]).unwrap();
        assert!(matches!(ctx.send_msg(&msg), Err(Error::NotConnected)));
        ctx.stop().unwrap();
    }

    #[test]
    fn single_role_per_context() {
        let ctx = Context::new(null_handler()).unwrap();
        let addr: Addr = "inet:127.0.0.1:0".parse().unwrap();
        ctx.listen(&addr).unwrap();
        assert!(matches!(ctx.listen(&addr), Err(Error::Busy)));
        assert!(matches!(ctx.connect(&addr), Err(Error::Busy)));
        assert!(matches!(ctx.bind(&addr), Err(Error::Busy)));
        ctx.stop().unwrap();
        // reusable after stop
        ctx.listen(&addr).unwrap();
        ctx.stop().unwrap();
    }

    #[test]
    fn listen_allocates_a_port() {
        let ctx = Context::new(null_handler()).unwrap();
        ctx.listen(&"inet:127.0.0.1:0".parse().unwrap()).unwrap();
        match ctx.local_addr().unwrap() {
            Addr::Inet(sa) => assert_ne!(sa.port(), 0),
            other => panic!("unexpected local addr {other:?}"),
        }
        ctx.stop().unwrap();
    }

    #[test]
    fn dgram_send_msg_is_rejected_without_destination() {
        let ctx = Context::new(null_handler()).unwrap();
        ctx.bind(&"inet:127.0.0.1:0".parse().unwrap()).unwrap();
        let mut msg = Msg::new();
        msg.write(1, "", &[]).unwrap();
        assert!(matches!(ctx.send_msg(&msg), Err(Error::NotConnected)));
        ctx.stop().unwrap();
    }
}
