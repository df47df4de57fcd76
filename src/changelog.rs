//! Project changelog


/// Release 0.1.0
///
/// Initial release: TLV wire codec with printf-style format strings,
/// stream (tcp / unix, with automatic client reconnection) and datagram
/// contexts, file descriptor passing over unix sockets, and an
/// epoll/poll reactor with timers and a signal-safe wakeup channel.
pub mod r0_1_0 {
}
