//! Shared helpers for the end-to-end tests.
#![allow(dead_code)] // not every test binary uses every helper

use std::time::{Duration, Instant};

use pomp::Context;

/// Drive the given contexts until `done` reports true or `limit`
/// elapses. Contexts sharing one loop are simply pumped through it more
/// often, which is harmless.
pub fn pump_until(ctxs: &[&Context], limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    loop {
        if done() {
            return true;
        }
        if start.elapsed() >= limit {
            return done();
        }
        for ctx in ctxs {
            let _ = ctx.wait_and_process(Some(Duration::from_millis(10)));
        }
    }
}

/// Keep pumping for `extra` so late events can still arrive (used to
/// assert that something does *not* happen again).
pub fn pump_for(ctxs: &[&Context], extra: Duration) {
    let _ = pump_until(ctxs, extra, || false);
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
