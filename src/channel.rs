//! The composite per-fd object: one [`crate::watch::Watch`] plus either
//! contiguous stream buffers or message queues, driving user callbacks as
//! data arrives or the peer goes away. See [`crate::runtime::Runtime`] for
//! the factory and dispatch logic that operates on these.

use std::cell::Cell;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::alloc::NodeId;
use crate::buffer::Buffer;
use crate::error::Error;
use crate::runtime::Runtime;

/// Whether a channel moves contiguous bytes or discrete datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Stream,
    Message,
}

pub type ReaderFn = Box<dyn FnMut(&Runtime, NodeId)>;
pub type CloseFn = Box<dyn FnMut(&Runtime, NodeId)>;
pub type ErrorFn = Box<dyn FnMut(&Runtime, NodeId, Error)>;

/// Channel state, stored as the payload of its own [`NodeId`] in the
/// owning [`crate::alloc::AllocTree`].
pub(crate) struct ChannelState {
    pub(crate) fd: RawFd,
    pub(crate) mode: Mode,
    pub(crate) watch: Option<NodeId>,
    pub(crate) reader: Option<ReaderFn>,
    pub(crate) close_handler: Option<CloseFn>,
    pub(crate) error_handler: Option<ErrorFn>,
    pub(crate) shutdown: bool,
    pub(crate) closed: bool,
    /// Set for the duration of `Runtime::dispatch_channel`; re-entrant
    /// `close()` calls flip this instead of freeing immediately, since the
    /// channel's own callback is still executing on the stack. The safe
    /// substitute for a raw pointer into the dispatcher's stack frame.
    pub(crate) deferred_close: Option<Rc<Cell<bool>>>,
    pub(crate) send_buf: Buffer,
    pub(crate) recv_buf: Buffer,
    pub(crate) send_q: VecDeque<NodeId>,
    pub(crate) recv_q: VecDeque<NodeId>,
}

impl ChannelState {
    pub(crate) fn new(fd: RawFd, mode: Mode) -> Self {
        Self {
            fd,
            mode,
            watch: None,
            reader: None,
            close_handler: None,
            error_handler: None,
            shutdown: false,
            closed: false,
            deferred_close: None,
            send_buf: Buffer::new(),
            recv_buf: Buffer::new(),
            send_q: VecDeque::new(),
            recv_q: VecDeque::new(),
        }
    }

    pub(crate) fn is_drained(&self) -> bool {
        match self.mode {
            Mode::Stream => self.send_buf.is_empty() && self.recv_buf.is_empty(),
            Mode::Message => self.send_q.is_empty() && self.recv_q.is_empty(),
        }
    }

    pub(crate) fn wants_write(&self) -> bool {
        match self.mode {
            Mode::Stream => !self.send_buf.is_empty(),
            Mode::Message => !self.send_q.is_empty(),
        }
    }
}
