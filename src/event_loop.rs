//! Readiness reactor over file descriptors.
//!
//! A [`EventLoop`] multiplexes registered descriptors and timers on one
//! thread. The backend is chosen once at creation: epoll on Linux (whose
//! descriptor can be composed into a host loop through
//! [`get_fd`](EventLoop::get_fd)), a portable `poll` reactor elsewhere.
//! The loop is wakeable from other threads and signal handlers through a
//! dedicated channel (eventfd or self-pipe).

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::sys;
use crate::{Error, Result};

bitflags! {
    /// Readiness events for a registered descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IoEvents: u32 {
        const IN = 0x001;
        const OUT = 0x004;
        const ERR = 0x008;
        const HUP = 0x010;
    }
}

type IoCallback = Rc<RefCell<dyn FnMut(RawFd, IoEvents)>>;
type TimerCallback = Rc<RefCell<dyn FnMut()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegKind {
    /// Ordinary descriptor: sockets, pipes, anything the user adds.
    Io,
    /// timerfd registrations; dispatched after Io within one pass.
    Timer,
    /// The loop's own wakeup channel.
    Wakeup,
}

struct Reg {
    events: IoEvents,
    kind: RegKind,
    /// Bumped on every (re-)registration of the same fd number so a
    /// remove-then-add during dispatch does not receive stale readiness.
    gen: u64,
    cb: IoCallback,
}

struct BatchItem {
    fd: RawFd,
    revents: IoEvents,
    gen: u64,
    kind: RegKind,
}

/// The reactor. Single-threaded by design: every callback runs on the
/// thread that drives [`wait_and_process`](EventLoop::wait_and_process).
/// Only [`wakeup`](EventLoop::wakeup) and [`Wakeup`] handles may be used
/// from elsewhere.
pub struct EventLoop {
    backend: Backend,
    regs: RefCell<HashMap<RawFd, Reg>>,
    next_gen: Cell<u64>,
    wake_rx: OwnedFd,
    wake_tx: Arc<OwnedFd>,
    timers: RefCell<TimerHeap>,
}

impl EventLoop {
    /// Create a loop with the platform's preferred backend.
    pub fn new() -> Result<Rc<EventLoop>> {
        Self::build(Backend::default_for_platform()?)
    }

    /// Create a loop on the portable `poll` backend, regardless of
    /// platform. [`get_fd`](EventLoop::get_fd) is unavailable on it; use
    /// this for identical behavior everywhere or to sidestep epoll.
    pub fn new_poll() -> Result<Rc<EventLoop>> {
        Self::build(Backend::Poll(PollBackend::new()))
    }

    fn build(backend: Backend) -> Result<Rc<EventLoop>> {
        let (wake_rx, wake_tx) = sys::wake_pair()?;
        let lp = Rc::new(EventLoop {
            backend,
            regs: RefCell::new(HashMap::new()),
            next_gen: Cell::new(1),
            wake_rx,
            wake_tx: Arc::new(wake_tx),
            timers: RefCell::new(TimerHeap::new()),
        });
        let cb: IoCallback = Rc::new(RefCell::new(|fd: RawFd, _: IoEvents| sys::drain(fd)));
        let wake_fd = lp.wake_rx.as_raw_fd();
        lp.add_with_kind(wake_fd, IoEvents::IN, RegKind::Wakeup, cb)?;
        Ok(lp)
    }

    /// Register `fd` and monitor it for `events`.
    pub fn add<F>(&self, fd: RawFd, events: IoEvents, cb: F) -> Result<()>
    where
        F: FnMut(RawFd, IoEvents) + 'static,
    {
        self.add_with_kind(fd, events, RegKind::Io, Rc::new(RefCell::new(cb)))
    }

    pub(crate) fn add_timer_fd<F>(&self, fd: RawFd, cb: F) -> Result<()>
    where
        F: FnMut(RawFd, IoEvents) + 'static,
    {
        self.add_with_kind(fd, IoEvents::IN, RegKind::Timer, Rc::new(RefCell::new(cb)))
    }

    fn add_with_kind(
        &self,
        fd: RawFd,
        events: IoEvents,
        kind: RegKind,
        cb: IoCallback,
    ) -> Result<()> {
        if fd < 0 {
            return Err(Error::InvalidArgument);
        }
        let mut regs = self.regs.borrow_mut();
        if regs.contains_key(&fd) {
            return Err(Error::AlreadyRegistered);
        }
        self.backend.register(fd, events)?;
        let gen = self.next_gen.get();
        self.next_gen.set(gen + 1);
        regs.insert(fd, Reg { events, kind, gen, cb });
        Ok(())
    }

    /// Change the monitored event set of a registered fd.
    pub fn update(&self, fd: RawFd, events: IoEvents) -> Result<()> {
        let mut regs = self.regs.borrow_mut();
        let reg = regs.get_mut(&fd).ok_or(Error::NotFound)?;
        self.backend.modify(fd, events)?;
        reg.events = events;
        Ok(())
    }

    /// Unregister a fd. Effective immediately, including for the
    /// remainder of a dispatch batch in progress.
    pub fn remove(&self, fd: RawFd) -> Result<()> {
        let mut regs = self.regs.borrow_mut();
        regs.remove(&fd).ok_or(Error::NotFound)?;
        if let Err(e) = self.backend.unregister(fd) {
            // fd may already be closed; registration is gone either way
            log::debug!("backend unregister of fd {fd} failed: {e}");
        }
        Ok(())
    }

    pub fn has_fd(&self, fd: RawFd) -> bool {
        self.regs.borrow().contains_key(&fd)
    }

    /// Backend descriptor for composition into a host event loop. Only
    /// the epoll backend has one; `poll` returns
    /// [`Error::NotSupported`] (ENOSYS) and the host must drive
    /// [`wait_and_process`](EventLoop::wait_and_process) itself.
    pub fn get_fd(&self) -> Result<RawFd> {
        self.backend.as_raw().ok_or(Error::NotSupported)
    }

    /// Block until at least one fd event, timer expiry or wakeup, then
    /// dispatch callbacks serially: fd callbacks first, then timers.
    /// `None` waits forever. Returns [`Error::TimedOut`] when nothing
    /// fired within `timeout`.
    pub fn wait_and_process(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let now = Instant::now();
            let user_wait = deadline.map(|d| d.saturating_duration_since(now));
            let heap_next = self.timers.borrow_mut().next_deadline();
            let heap_wait = heap_next.map(|at| at.saturating_duration_since(now));
            let eff = match (user_wait, heap_wait) {
                (Some(t), Some(h)) => Some(t.min(h)),
                (Some(t), None) => Some(t),
                (None, Some(h)) => Some(h),
                (None, None) => None,
            };

            let ready = self.backend.wait(eff)?;
            let batch: Vec<BatchItem> = {
                let regs = self.regs.borrow();
                ready
                    .iter()
                    .filter_map(|&(fd, revents)| {
                        regs.get(&fd).map(|r| BatchItem { fd, revents, gen: r.gen, kind: r.kind })
                    })
                    .collect()
            };

            let mut dispatched = 0usize;
            for item in batch.iter().filter(|i| i.kind != RegKind::Timer) {
                if self.dispatch_one(item) {
                    dispatched += 1;
                }
            }
            for item in batch.iter().filter(|i| i.kind == RegKind::Timer) {
                if self.dispatch_one(item) {
                    dispatched += 1;
                }
            }
            dispatched += self.fire_heap_timers();

            if dispatched > 0 {
                return Ok(());
            }
            // Spurious early return from the kernel wait: keep waiting
            // until the caller's deadline actually elapses.
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(Error::TimedOut);
                }
            }
        }
    }

    /// Dispatch whatever is ready right now without blocking; the
    /// companion of [`get_fd`](EventLoop::get_fd) for host-loop
    /// composition.
    pub fn process_fd(&self) -> Result<()> {
        self.wait_and_process(Some(Duration::ZERO))
    }

    fn dispatch_one(&self, item: &BatchItem) -> bool {
        let cb = {
            let regs = self.regs.borrow();
            match regs.get(&item.fd) {
                // removed (or removed and re-added) during this batch
                Some(reg) if reg.gen == item.gen => reg.cb.clone(),
                _ => return false,
            }
        };
        let result = match cb.try_borrow_mut() {
            Ok(mut f) => {
                f(item.fd, item.revents);
                true
            }
            Err(_) => {
                log::warn!("skipping reentrant dispatch on fd {}", item.fd);
                false
            }
        };
        result
    }

    fn fire_heap_timers(&self) -> usize {
        let mut fired = 0;
        loop {
            let now = Instant::now();
            let cb = self.timers.borrow_mut().pop_due(now);
            match cb {
                Some(cb) => {
                    if let Ok(mut f) = cb.try_borrow_mut() {
                        f();
                    }
                    fired += 1;
                }
                None => return fired,
            }
        }
    }

    /// Break a concurrent [`wait_and_process`](EventLoop::wait_and_process)
    /// out of its wait. Safe from any thread and from signal handlers;
    /// any number of pending wakeups coalesce into a single drain.
    pub fn wakeup(&self) {
        sys::wake_signal(self.wake_tx.as_raw_fd());
    }

    /// A `Send + Sync` handle for waking this loop from other threads.
    pub fn wake_handle(&self) -> Wakeup {
        Wakeup { fd: self.wake_tx.clone() }
    }

    // Deadline-heap timer plumbing, used by `Timer` on platforms (or
    // configurations) without timerfd.

    pub(crate) fn heap_timer_register(&self, cb: TimerCallback) -> u64 {
        self.timers.borrow_mut().register(cb)
    }

    pub(crate) fn heap_timer_set(&self, id: u64, delay: Duration, period: Option<Duration>) {
        self.timers.borrow_mut().set(id, delay, period);
    }

    pub(crate) fn heap_timer_clear(&self, id: u64) {
        self.timers.borrow_mut().clear(id);
    }

    pub(crate) fn heap_timer_unregister(&self, id: u64) {
        self.timers.borrow_mut().unregister(id);
    }
}

/// Cross-thread wakeup handle; see [`EventLoop::wake_handle`]. The write
/// side of the wakeup channel is a single `write(2)`, which is
/// async-signal-safe.
#[derive(Clone)]
pub struct Wakeup {
    fd: Arc<OwnedFd>,
}

impl Wakeup {
    pub fn wakeup(&self) {
        sys::wake_signal(self.fd.as_raw_fd());
    }
}

// ---------------------------------------------------------------------
// Timer heap

struct HeapSlot {
    gen: u64,
    period: Option<Duration>,
    cb: TimerCallback,
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    at: Instant,
    id: u64,
    gen: u64,
}

struct TimerHeap {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    slots: HashMap<u64, HeapSlot>,
    next_id: u64,
}

impl TimerHeap {
    fn new() -> TimerHeap {
        TimerHeap { heap: BinaryHeap::new(), slots: HashMap::new(), next_id: 1 }
    }

    fn register(&mut self, cb: TimerCallback) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.slots.insert(id, HeapSlot { gen: 0, period: None, cb });
        id
    }

    fn unregister(&mut self, id: u64) {
        self.slots.remove(&id);
    }

    /// Arm (or re-arm, replacing the previous schedule).
    fn set(&mut self, id: u64, delay: Duration, period: Option<Duration>) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.gen += 1;
            slot.period = period;
            self.heap.push(Reverse(HeapEntry {
                at: Instant::now() + delay,
                id,
                gen: slot.gen,
            }));
        }
    }

    /// Disarm; stale heap entries are dropped lazily.
    fn clear(&mut self, id: u64) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.gen += 1;
            slot.period = None;
        }
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        loop {
            let (at, id, gen) = {
                let entry = &self.heap.peek()?.0;
                (entry.at, entry.id, entry.gen)
            };
            match self.slots.get(&id) {
                Some(slot) if slot.gen == gen => return Some(at),
                _ => {
                    self.heap.pop();
                }
            }
        }
    }

    fn pop_due(&mut self, now: Instant) -> Option<TimerCallback> {
        loop {
            {
                let entry = &self.heap.peek()?.0;
                if entry.at > now {
                    return None;
                }
            }
            let Some(Reverse(entry)) = self.heap.pop() else { return None };
            let Some(slot) = self.slots.get_mut(&entry.id) else { continue };
            if slot.gen != entry.gen {
                continue;
            }
            if let Some(period) = slot.period {
                self.heap.push(Reverse(HeapEntry {
                    at: now + period,
                    id: entry.id,
                    gen: entry.gen,
                }));
            } else {
                slot.gen += 1;
            }
            return Some(slot.cb.clone());
        }
    }
}

// ---------------------------------------------------------------------
// Backends

enum Backend {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll(Epoll),
    Poll(PollBackend),
}

impl Backend {
    fn default_for_platform() -> Result<Backend> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            Ok(Backend::Epoll(Epoll::new()?))
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            Ok(Backend::Poll(PollBackend::new()))
        }
    }

    fn register(&self, fd: RawFd, events: IoEvents) -> Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll(e) => e.ctl(libc::EPOLL_CTL_ADD, fd, events),
            Backend::Poll(p) => p.register(fd, events),
        }
    }

    fn modify(&self, fd: RawFd, events: IoEvents) -> Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll(e) => e.ctl(libc::EPOLL_CTL_MOD, fd, events),
            Backend::Poll(p) => p.modify(fd, events),
        }
    }

    fn unregister(&self, fd: RawFd) -> Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll(e) => e.ctl(libc::EPOLL_CTL_DEL, fd, IoEvents::empty()),
            Backend::Poll(p) => p.unregister(fd),
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<Vec<(RawFd, IoEvents)>> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll(e) => e.wait(timeout),
            Backend::Poll(p) => p.wait(timeout),
        }
    }

    fn as_raw(&self) -> Option<RawFd> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll(e) => Some(e.fd.as_raw_fd()),
            Backend::Poll(_) => None,
        }
    }
}

/// Wait timeout in milliseconds, rounded up so a timer never fires early.
fn timeout_to_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if Duration::from_millis(ms as u64) < d {
                ms += 1;
            }
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
struct Epoll {
    fd: OwnedFd,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Epoll {
    fn new() -> Result<Epoll> {
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Epoll { fd: unsafe { std::os::unix::io::FromRawFd::from_raw_fd(raw) } })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: IoEvents) -> Result<()> {
        let mut ev = libc::epoll_event { events: to_epoll(events), u64: fd as u64 };
        let ret = unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<Vec<(RawFd, IoEvents)>> {
        let mut evs = [libc::epoll_event { events: 0, u64: 0 }; 64];
        let ms = timeout_to_ms(timeout);
        loop {
            let n = unsafe {
                libc::epoll_wait(self.fd.as_raw_fd(), evs.as_mut_ptr(), evs.len() as libc::c_int, ms)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err.into());
            }
            let mut out = Vec::with_capacity(n as usize);
            for e in evs.iter().take(n as usize) {
                let ev = *e;
                out.push((ev.u64 as RawFd, from_epoll(ev.events)));
            }
            return Ok(out);
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn to_epoll(events: IoEvents) -> u32 {
    let mut e = 0u32;
    if events.contains(IoEvents::IN) {
        e |= libc::EPOLLIN as u32;
    }
    if events.contains(IoEvents::OUT) {
        e |= libc::EPOLLOUT as u32;
    }
    e
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn from_epoll(e: u32) -> IoEvents {
    let mut ev = IoEvents::empty();
    if e & libc::EPOLLIN as u32 != 0 {
        ev |= IoEvents::IN;
    }
    if e & libc::EPOLLOUT as u32 != 0 {
        ev |= IoEvents::OUT;
    }
    if e & libc::EPOLLERR as u32 != 0 {
        ev |= IoEvents::ERR;
    }
    if e & libc::EPOLLHUP as u32 != 0 {
        ev |= IoEvents::HUP;
    }
    ev
}

struct PollBackend {
    fds: RefCell<HashMap<RawFd, IoEvents>>,
}

impl PollBackend {
    fn new() -> PollBackend {
        PollBackend { fds: RefCell::new(HashMap::new()) }
    }

    fn register(&self, fd: RawFd, events: IoEvents) -> Result<()> {
        self.fds.borrow_mut().insert(fd, events);
        Ok(())
    }

    fn modify(&self, fd: RawFd, events: IoEvents) -> Result<()> {
        self.fds.borrow_mut().insert(fd, events);
        Ok(())
    }

    fn unregister(&self, fd: RawFd) -> Result<()> {
        self.fds.borrow_mut().remove(&fd);
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<Vec<(RawFd, IoEvents)>> {
        let mut pfds: Vec<libc::pollfd> = self
            .fds
            .borrow()
            .iter()
            .map(|(&fd, &ev)| libc::pollfd { fd, events: to_poll(ev), revents: 0 })
            .collect();
        let ms = timeout_to_ms(timeout);
        loop {
            let n = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, ms) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err.into());
            }
            return Ok(pfds
                .iter()
                .filter(|p| p.revents != 0)
                .map(|p| (p.fd, from_poll(p.revents)))
                .collect());
        }
    }
}

fn to_poll(events: IoEvents) -> libc::c_short {
    let mut e = 0 as libc::c_short;
    if events.contains(IoEvents::IN) {
        e |= libc::POLLIN;
    }
    if events.contains(IoEvents::OUT) {
        e |= libc::POLLOUT;
    }
    e
}

fn from_poll(revents: libc::c_short) -> IoEvents {
    let mut ev = IoEvents::empty();
    if revents & libc::POLLIN != 0 {
        ev |= IoEvents::IN;
    }
    if revents & libc::POLLOUT != 0 {
        ev |= IoEvents::OUT;
    }
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        ev |= IoEvents::ERR;
    }
    if revents & libc::POLLHUP != 0 {
        ev |= IoEvents::HUP;
    }
    ev
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::os::unix::net::UnixStream;

    fn readable_pair() -> (UnixStream, UnixStream) {
        UnixStream::pair().unwrap()
    }

    #[test]
    fn registration_contracts() {
        let lp = EventLoop::new().unwrap();
        let (a, _b) = readable_pair();
        let fd = a.as_raw_fd();
        lp.add(fd, IoEvents::IN, |_, _| {}).unwrap();
        assert!(lp.has_fd(fd));
        assert!(matches!(
            lp.add(fd, IoEvents::IN, |_, _| {}),
            Err(Error::AlreadyRegistered)
        ));
        lp.update(fd, IoEvents::IN | IoEvents::OUT).unwrap();
        lp.remove(fd).unwrap();
        assert!(!lp.has_fd(fd));
        assert!(matches!(lp.update(fd, IoEvents::IN), Err(Error::NotFound)));
        assert!(matches!(lp.remove(fd), Err(Error::NotFound)));
    }

    #[test]
    fn dispatches_readable_fd() {
        let lp = EventLoop::new().unwrap();
        let (a, mut b) = readable_pair();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        lp.add(a.as_raw_fd(), IoEvents::IN, move |_, ev| {
            assert!(ev.contains(IoEvents::IN));
            h.set(h.get() + 1);
        })
        .unwrap();

        assert!(matches!(
            lp.wait_and_process(Some(Duration::from_millis(20))),
            Err(Error::TimedOut)
        ));
        b.write_all(b"x").unwrap();
        lp.wait_and_process(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn remove_during_dispatch_is_honored() {
        let lp = EventLoop::new().unwrap();
        let (a, mut ax) = readable_pair();
        let (b, mut bx) = readable_pair();
        let fired = Rc::new(Cell::new(0));

        let lp2 = lp.clone();
        let f = fired.clone();
        let other = b.as_raw_fd();
        lp.add(a.as_raw_fd(), IoEvents::IN, move |_, _| {
            f.set(f.get() + 1);
            let _ = lp2.remove(other);
        })
        .unwrap();
        let lp3 = lp.clone();
        let f = fired.clone();
        let other = a.as_raw_fd();
        lp.add(b.as_raw_fd(), IoEvents::IN, move |_, _| {
            f.set(f.get() + 1);
            let _ = lp3.remove(other);
        })
        .unwrap();

        ax.write_all(b"x").unwrap();
        bx.write_all(b"x").unwrap();
        lp.wait_and_process(Some(Duration::from_secs(2))).unwrap();
        // whichever ran first removed the other mid-batch
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn wakeup_unblocks_a_waiting_loop() {
        let lp = EventLoop::new().unwrap();
        let wake = lp.wake_handle();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            wake.wakeup();
        });
        // woken, not timed out
        lp.wait_and_process(Some(Duration::from_secs(5))).unwrap();
        t.join().unwrap();
    }

    #[test]
    fn flooded_wakeups_coalesce_into_one_pass() {
        let lp = EventLoop::new().unwrap();
        for _ in 0..50 {
            lp.wakeup();
        }
        lp.wait_and_process(Some(Duration::from_secs(2))).unwrap();
        // all 50 wakeups were drained by the single pass
        assert!(matches!(
            lp.wait_and_process(Some(Duration::from_millis(30))),
            Err(Error::TimedOut)
        ));
    }

    #[test]
    fn wakeup_in_loop_counts_as_event() {
        let lp = EventLoop::new().unwrap();
        lp.wakeup();
        lp.wait_and_process(Some(Duration::from_millis(100))).unwrap();
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn epoll_backend_exposes_fd() {
        let lp = EventLoop::new().unwrap();
        assert!(lp.get_fd().unwrap() >= 0);
    }

    #[test]
    fn poll_backend_works_without_fd() {
        let lp = EventLoop::new_poll().unwrap();
        assert!(matches!(lp.get_fd(), Err(Error::NotSupported)));

        let (a, mut b) = readable_pair();
        let hit = Rc::new(Cell::new(false));
        let h = hit.clone();
        lp.add(a.as_raw_fd(), IoEvents::IN, move |_, _| h.set(true)).unwrap();
        b.write_all(b"y").unwrap();
        lp.wait_and_process(Some(Duration::from_secs(2))).unwrap();
        assert!(hit.get());
    }

    #[test]
    fn heap_timers_fire_in_order() {
        let lp = EventLoop::new().unwrap();
        let fired = Rc::new(RefCell::new(Vec::new()));

        let f = fired.clone();
        let a = lp.heap_timer_register(Rc::new(RefCell::new(move || f.borrow_mut().push("a"))));
        let f = fired.clone();
        let b = lp.heap_timer_register(Rc::new(RefCell::new(move || f.borrow_mut().push("b"))));

        lp.heap_timer_set(b, Duration::from_millis(60), None);
        lp.heap_timer_set(a, Duration::from_millis(20), None);

        lp.wait_and_process(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(*fired.borrow(), vec!["a"]);
        lp.wait_and_process(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(*fired.borrow(), vec!["a", "b"]);

        lp.heap_timer_unregister(a);
        lp.heap_timer_unregister(b);
    }

    #[test]
    fn heap_timer_clear_disarms() {
        let lp = EventLoop::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let id = lp.heap_timer_register(Rc::new(RefCell::new(move || h.set(h.get() + 1))));
        lp.heap_timer_set(id, Duration::from_millis(20), None);
        lp.heap_timer_clear(id);
        assert!(matches!(
            lp.wait_and_process(Some(Duration::from_millis(80))),
            Err(Error::TimedOut)
        ));
        assert_eq!(hits.get(), 0);
        lp.heap_timer_unregister(id);
    }
}
