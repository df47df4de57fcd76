//! Printf-oriented message protocol.
//!
//! A lightweight message-passing library for local and networked IPC.
//! Applications exchange typed, self-describing messages over stream or
//! datagram sockets: each message carries a 32-bit identifier and a
//! TLV-encoded payload driven by a compact printf-style format string,
//! giving write-and-read symmetry:
//!
//! ```no_run
//! use pomp::{Addr, Context, Event, Value};
//!
//! # fn main() -> pomp::Result<()> {
//! let addr: Addr = "unix:/tmp/demo.sock".parse()?;
//!
//! let server = Context::new(|_ctx, event, _conn, msg| {
//!     if event == Event::Msg {
//!         let msg = msg.unwrap();
//!         println!("{}", msg.dump().unwrap());
//!     }
//! })?;
//! server.listen(&addr)?;
//!
//! let client = Context::new(|ctx, event, _conn, _msg| {
//!     if event == Event::Connected {
//!         ctx.send(42, "%s %u", &[Value::Str("hello"), Value::U32(7)]).unwrap();
//!     }
//! })?;
//! client.connect(&addr)?;
//!
//! loop {
//!     server.wait_and_process(Some(std::time::Duration::from_millis(100))).ok();
//!     client.wait_and_process(Some(std::time::Duration::from_millis(100))).ok();
//! }
//! # }
//! ```
//!
//! File descriptors can be embedded in messages sent over unix local
//! sockets; they travel as `SCM_RIGHTS` ancillary data and come back out
//! of the decoder as borrows into the received message.
//!
//! Everything runs cooperatively on the thread driving the event loop;
//! only [`EventLoop::wakeup`]/[`Wakeup`] (and their [`Context`]
//! counterparts) may be used from other threads or signal handlers.

mod addr;
mod buffer;
pub mod changelog;
mod codec;
mod conn;
mod ctx;
mod error;
mod event_loop;
mod format;
mod message;
mod sys;
mod timer;

pub use addr::{Addr, UnixAddr};
pub use buffer::Buffer;
pub use codec::{Decoder, Encoder, Tag, Value};
pub use conn::{Conn, ConnState};
pub use ctx::{Context, Event};
pub use error::{Error, Result};
pub use event_loop::{EventLoop, IoEvents, Wakeup};
pub use message::{Msg, HEADER_SIZE, MAGIC, MAX_MSG_SIZE};
pub use sys::PeerCred;
pub use timer::Timer;
