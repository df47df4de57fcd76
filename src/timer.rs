//! One-shot and periodic timers bound to an event loop.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::event_loop::EventLoop;
use crate::Result;

#[cfg(any(target_os = "linux", target_os = "android"))]
use std::os::unix::io::{AsRawFd, OwnedFd};

#[cfg(any(target_os = "linux", target_os = "android"))]
use crate::sys;

enum TimerKind {
    /// timerfd registered with the loop; expiry arrives as readiness.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Fd(OwnedFd),
    /// Entry in the loop's monotonic deadline heap.
    Heap(u64),
}

struct TimerInner {
    evloop: Rc<EventLoop>,
    kind: TimerKind,
}

/// A timer whose callback fires on the owning loop's thread.
///
/// `set` arms one-shot, `set_periodic` repeats, `clear` disarms;
/// re-arming replaces the previous schedule. Dropping the timer disarms
/// and unregisters it.
pub struct Timer {
    inner: Rc<TimerInner>,
}

impl Timer {
    /// Create a disarmed timer on `evloop`. Uses timerfd where the
    /// platform has it, the loop's deadline heap otherwise (or when
    /// timerfd creation fails, e.g. under descriptor exhaustion).
    pub fn new<F>(evloop: &Rc<EventLoop>, cb: F) -> Result<Timer>
    where
        F: FnMut() + 'static,
    {
        let cb: Rc<RefCell<dyn FnMut()>> = Rc::new(RefCell::new(cb));
        #[cfg(any(target_os = "linux", target_os = "android"))]
        match Self::new_timerfd(evloop, cb.clone()) {
            Ok(timer) => return Ok(timer),
            Err(e) => log::debug!("timerfd unavailable ({e}); falling back to deadline heap"),
        }
        Self::new_heap(evloop, cb)
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn new_timerfd(evloop: &Rc<EventLoop>, cb: Rc<RefCell<dyn FnMut()>>) -> Result<Timer> {
        let fd = sys::timerfd_create()?;
        evloop.add_timer_fd(fd.as_raw_fd(), move |fd, _| {
            // consume the expiration count before notifying
            sys::drain(fd);
            if let Ok(mut f) = cb.try_borrow_mut() {
                f();
            }
        })?;
        Ok(Timer {
            inner: Rc::new(TimerInner { evloop: evloop.clone(), kind: TimerKind::Fd(fd) }),
        })
    }

    /// Heap-backed construction, the portable path.
    fn new_heap(evloop: &Rc<EventLoop>, cb: Rc<RefCell<dyn FnMut()>>) -> Result<Timer> {
        let id = evloop.heap_timer_register(cb);
        Ok(Timer {
            inner: Rc::new(TimerInner { evloop: evloop.clone(), kind: TimerKind::Heap(id) }),
        })
    }

    /// Arm for a single expiry after `delay`.
    pub fn set(&self, delay: Duration) -> Result<()> {
        self.arm(delay, None)
    }

    /// Arm for a first expiry after `delay`, then every `period`.
    pub fn set_periodic(&self, delay: Duration, period: Duration) -> Result<()> {
        self.arm(delay, Some(period))
    }

    fn arm(&self, delay: Duration, period: Option<Duration>) -> Result<()> {
        match &self.inner.kind {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            TimerKind::Fd(fd) => sys::timerfd_settime(fd.as_raw_fd(), delay, period),
            TimerKind::Heap(id) => {
                self.inner.evloop.heap_timer_set(*id, delay, period);
                Ok(())
            }
        }
    }

    /// Disarm without unregistering; the timer can be armed again.
    pub fn clear(&self) -> Result<()> {
        match &self.inner.kind {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            TimerKind::Fd(fd) => sys::timerfd_disarm(fd.as_raw_fd()),
            TimerKind::Heap(id) => {
                self.inner.evloop.heap_timer_clear(*id);
                Ok(())
            }
        }
    }
}

impl Drop for TimerInner {
    fn drop(&mut self) {
        match &self.kind {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            TimerKind::Fd(fd) => {
                let _ = self.evloop.remove(fd.as_raw_fd());
            }
            TimerKind::Heap(id) => self.evloop.heap_timer_unregister(*id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::cell::Cell;
    use std::time::Instant;

    fn hit_counter() -> (Rc<Cell<u32>>, impl FnMut() + 'static) {
        let hits = Rc::new(Cell::new(0u32));
        let h = hits.clone();
        (hits, move || h.set(h.get() + 1))
    }

    #[test]
    fn oneshot_fires_once() {
        let lp = EventLoop::new().unwrap();
        let (hits, cb) = hit_counter();
        let timer = Timer::new(&lp, cb).unwrap();
        timer.set(Duration::from_millis(20)).unwrap();

        lp.wait_and_process(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(hits.get(), 1);
        assert!(matches!(
            lp.wait_and_process(Some(Duration::from_millis(80))),
            Err(Error::TimedOut)
        ));
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn periodic_fires_repeatedly_until_cleared() {
        let lp = EventLoop::new().unwrap();
        let (hits, cb) = hit_counter();
        let timer = Timer::new(&lp, cb).unwrap();
        timer
            .set_periodic(Duration::from_millis(10), Duration::from_millis(10))
            .unwrap();

        let start = Instant::now();
        while hits.get() < 3 && start.elapsed() < Duration::from_secs(2) {
            let _ = lp.wait_and_process(Some(Duration::from_millis(50)));
        }
        assert!(hits.get() >= 3);

        timer.clear().unwrap();
        let settled = hits.get();
        assert!(matches!(
            lp.wait_and_process(Some(Duration::from_millis(60))),
            Err(Error::TimedOut)
        ));
        assert_eq!(hits.get(), settled);
    }

    #[test]
    fn rearm_replaces_schedule() {
        let lp = EventLoop::new().unwrap();
        let (hits, cb) = hit_counter();
        let timer = Timer::new(&lp, cb).unwrap();
        timer.set(Duration::from_millis(10)).unwrap();
        timer.set(Duration::from_millis(120)).unwrap();

        // the first schedule was replaced, nothing at 10ms
        assert!(matches!(
            lp.wait_and_process(Some(Duration::from_millis(50))),
            Err(Error::TimedOut)
        ));
        assert_eq!(hits.get(), 0);
        lp.wait_and_process(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn drop_unregisters() {
        let lp = EventLoop::new().unwrap();
        let (hits, cb) = hit_counter();
        let timer = Timer::new(&lp, cb).unwrap();
        timer.set(Duration::from_millis(10)).unwrap();
        drop(timer);
        assert!(matches!(
            lp.wait_and_process(Some(Duration::from_millis(60))),
            Err(Error::TimedOut)
        ));
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn heap_backed_timer_matches_fd_behavior() {
        let lp = EventLoop::new().unwrap();
        let hits = Rc::new(Cell::new(0u32));
        let h = hits.clone();
        let timer =
            Timer::new_heap(&lp, Rc::new(RefCell::new(move || h.set(h.get() + 1)))).unwrap();
        timer
            .set_periodic(Duration::from_millis(10), Duration::from_millis(10))
            .unwrap();
        let start = Instant::now();
        while hits.get() < 2 && start.elapsed() < Duration::from_secs(2) {
            let _ = lp.wait_and_process(Some(Duration::from_millis(50)));
        }
        assert!(hits.get() >= 2);
        timer.clear().unwrap();
    }
}
