//! A hierarchical allocator and an event-driven, buffered I/O core built on
//! top of it.
//!
//! - [Hierarchical allocation](alloc): parent/child lifetimes, cascading
//!   free, destructors.
//! - [Growable byte buffers](buffer): page-granular, front-shrinkable.
//! - [Datagrams with ancillary data](message): payload, control (`SCM_RIGHTS`
//!   and friends), and peer address.
//! - [Readiness-set watch dispatch](watch): a `select(2)`-shaped event
//!   registry.
//! - [Composite I/O channels](channel): non-blocking reader/close/error
//!   callbacks over either a byte stream or a message queue.
//! - [The runtime handle](runtime) tying all of the above together.
//! - [Error handling](error).
//!
//! Nothing here is thread-safe; one [`runtime::Runtime`] drives one
//! cooperative event loop on one thread.

pub mod alloc;
pub mod buffer;
pub mod channel;
pub mod error;
pub mod message;
pub mod runtime;
pub mod sys;
pub mod watch;

pub use alloc::{AllocTree, NodeId};
pub use channel::Mode;
pub use error::{Error, Result};
pub use message::Message;
pub use runtime::{Limits, Runtime};
pub use watch::Events;

/// Write formatted data to a channel's outgoing stream buffer, the
/// `printf(ch, fmt, ...)` primitive.
#[macro_export]
macro_rules! channel_printf {
    ($rt:expr, $channel:expr, $($args:tt)+) => {
        $rt.printf($channel, ::std::format_args!($($args)+))
    };
}
