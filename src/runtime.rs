//! The explicit handle bundling a node arena and a watch registry.
//!
//! `Runtime` replaces the process-wide statics the original relied on: it
//! is the single owner of an [`AllocTree`] and a [`WatchRegistry`], wrapped
//! in an `Rc` so that a channel's internal watch callback can dispatch back
//! into the very runtime that installed it (the same self-referential
//! pattern the teacher crate's own single-threaded channel uses internally).

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::alloc::{AllocTree, NodeId};
use crate::buffer::PAGE_SIZE;
use crate::channel::{ChannelState, CloseFn, ErrorFn, Mode, ReaderFn};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::watch::{Events, WatchRegistry};

/// Tunables the original hardcoded. Kept as an explicit, constructor-passed
/// knob rather than a config file, matching a library's scope.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Chunk size used for each non-blocking stream read and for growing
    /// `recv_buf`.
    pub read_chunk: usize,
    /// Payload capacity reserved for each `Message::recv` call in message
    /// mode.
    pub datagram_capacity: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            read_chunk: PAGE_SIZE,
            datagram_capacity: PAGE_SIZE,
        }
    }
}

/// Owns the allocation forest and the watch registry for one cooperative
/// event loop. `!Sync`, `!Send` by construction (`RefCell`-based) — the
/// whole core is single-threaded by contract.
pub struct Runtime {
    tree: RefCell<AllocTree>,
    registry: RefCell<WatchRegistry>,
    limits: Limits,
}

impl Runtime {
    pub fn new() -> Rc<Self> {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Rc<Self> {
        Rc::new(Self {
            tree: RefCell::new(AllocTree::new()),
            registry: RefCell::new(WatchRegistry::new()),
            limits,
        })
    }

    // ---- AllocTree pass-throughs -----------------------------------

    pub fn alloc<T: std::any::Any>(
        &self,
        parent: Option<NodeId>,
        value: T,
        name: impl Into<String>,
    ) -> Result<NodeId> {
        self.tree.borrow_mut().alloc(parent, value, name)
    }

    pub fn get<T: std::any::Any>(&self, node: NodeId) -> Option<T>
    where
        T: Clone,
    {
        self.tree.borrow().get::<T>(node).cloned()
    }

    pub fn free(&self, node: NodeId) -> i32 {
        self.tree.borrow_mut().free(node)
    }

    pub fn reparent(&self, node: NodeId, new_parent: Option<NodeId>) {
        self.tree.borrow_mut().reparent(node, new_parent);
    }

    pub fn set_name(&self, node: NodeId, name: impl Into<String>) {
        self.tree.borrow_mut().set_name(node, name);
    }

    pub fn return_unused(&self, large: bool) {
        self.tree.borrow_mut().return_unused(large);
    }

    // ---- Channel factory --------------------------------------------

    /// Wrap `fd` in a channel: set it non-blocking, ensure `SIGPIPE` is
    /// ignored process-wide, and register an internal read/write watch
    /// that drives the supplied callbacks.
    pub fn reopen(
        self: &Rc<Self>,
        parent: Option<NodeId>,
        fd: RawFd,
        mode: Mode,
        reader: Option<ReaderFn>,
        close_handler: Option<CloseFn>,
        error_handler: Option<ErrorFn>,
    ) -> Result<NodeId> {
        crate::sys::ensure_sigpipe_ignored();
        crate::sys::set_nonblock(fd)?;
        crate::sys::set_cloexec(fd)?;

        let channel_id = {
            let mut tree = self.tree.borrow_mut();
            let mut state = ChannelState::new(fd, mode);
            state.reader = reader;
            state.close_handler = close_handler;
            state.error_handler = error_handler;
            let id = tree.alloc(parent, state, format!("Channel(fd={fd})"))?;
            tree.set_destructor(id, |payload| {
                if let Some(state) = payload.downcast_mut::<ChannelState>() {
                    if !state.closed {
                        crate::sys::close(state.fd);
                        state.closed = true;
                    }
                }
                0
            });
            id
        };

        let rt = self.clone();
        let watch_id = {
            let mut tree = self.tree.borrow_mut();
            let mut registry = self.registry.borrow_mut();
            registry.add_watch(
                &mut tree,
                Some(channel_id),
                fd,
                Events::READ,
                move |_fd, events| rt.dispatch_channel(channel_id, events),
            )?
        };

        {
            let mut tree = self.tree.borrow_mut();
            if let Some(state) = tree.get_mut::<ChannelState>(channel_id) {
                state.watch = Some(watch_id);
            }
        }

        Ok(channel_id)
    }

    /// Union every live watch's events into the three readiness sets for
    /// the host's own `select(2)` call.
    pub fn select_fds(
        &self,
        nfds: &mut i32,
        rd: &mut libc::fd_set,
        wr: &mut libc::fd_set,
        ex: &mut libc::fd_set,
    ) {
        let tree = self.tree.borrow();
        self.registry.borrow().select_fds(&tree, nfds, rd, wr, ex);
    }

    /// Dispatch against the readiness sets the host obtained from `select`.
    pub fn handle_fds(&self, rd: &libc::fd_set, wr: &libc::fd_set, ex: &libc::fd_set) {
        let mut tree = self.tree.borrow_mut();
        self.registry.borrow_mut().handle_fds(&mut tree, rd, wr, ex);
    }

    // ---- Stream I/O ----------------------------------------------------

    /// Append `src` to the channel's outgoing buffer; flushed on the next
    /// WRITE-ready dispatch.
    pub fn write(&self, channel: NodeId, src: &[u8]) -> Result<()> {
        {
            let mut tree = self.tree.borrow_mut();
            let state = tree
                .get_mut::<ChannelState>(channel)
                .ok_or(Error::BadFd)?;
            state.send_buf.push(src)?;
        }
        let mut tree = self.tree.borrow_mut();
        Self::sync_watch_events(&mut tree, channel);
        Ok(())
    }

    /// Formatted write, the `printf(ch, fmt, ...)` primitive.
    pub fn printf(&self, channel: NodeId, args: std::fmt::Arguments<'_>) -> Result<()> {
        self.write(channel, std::fmt::format(args).as_bytes())
    }

    /// Pop up to `n` bytes already buffered from the channel's incoming
    /// stream, as a newly allocated NUL-terminated block under `parent`.
    pub fn read(&self, parent: Option<NodeId>, channel: NodeId, n: usize) -> Result<NodeId> {
        let bytes = {
            let mut tree = self.tree.borrow_mut();
            let state = tree
                .get_mut::<ChannelState>(channel)
                .ok_or(Error::BadFd)?;
            state.recv_buf.pop(n)
        };
        self.tree.borrow_mut().alloc_bytes(parent, "read", bytes)
    }

    /// Pop one line (up to and excluding the first byte in `delims` or a
    /// NUL), consuming that terminator from the buffer. `None` if no
    /// terminator is present yet.
    pub fn read_line(
        &self,
        parent: Option<NodeId>,
        channel: NodeId,
        delims: &[u8],
    ) -> Result<Option<NodeId>> {
        let bytes = {
            let mut tree = self.tree.borrow_mut();
            let state = tree
                .get_mut::<ChannelState>(channel)
                .ok_or(Error::BadFd)?;
            let Some(pos) = state.recv_buf.find_terminator(delims) else {
                return Ok(None);
            };
            let line = state.recv_buf.pop(pos);
            state.recv_buf.shrink(1); // consume the terminator itself
            line
        };
        Ok(Some(self.tree.borrow_mut().alloc_bytes(parent, "line", bytes)?))
    }

    // ---- Message I/O ----------------------------------------------------

    /// Reparent `msg` under `channel` and enqueue it for sending.
    pub fn send_message(&self, channel: NodeId, msg: NodeId) -> Result<()> {
        {
            let mut tree = self.tree.borrow_mut();
            tree.reparent(msg, Some(channel));
            let state = tree
                .get_mut::<ChannelState>(channel)
                .ok_or(Error::BadFd)?;
            state.send_q.push_back(msg);
        }
        let mut tree = self.tree.borrow_mut();
        Self::sync_watch_events(&mut tree, channel);
        Ok(())
    }

    /// Pop the head of the channel's incoming message queue, reparenting
    /// it under `parent`. `None` if no message is queued yet.
    pub fn read_message(&self, parent: Option<NodeId>, channel: NodeId) -> Option<NodeId> {
        let mut tree = self.tree.borrow_mut();
        let msg_id = {
            let state = tree.get_mut::<ChannelState>(channel)?;
            state.recv_q.pop_front()?
        };
        tree.reparent(msg_id, parent);
        Some(msg_id)
    }

    // ---- Lifecycle -------------------------------------------------------

    /// Mark the channel for shutdown: freed immediately if already
    /// drained, otherwise once the last buffered byte/message is flushed.
    /// Like [`Runtime::close`], an immediate free is deferred if called
    /// re-entrantly from within the channel's own dispatch.
    pub fn shutdown(&self, channel: NodeId) {
        let should_free = {
            let mut tree = self.tree.borrow_mut();
            let Some(state) = tree.get_mut::<ChannelState>(channel) else {
                return;
            };
            state.shutdown = true;
            state.is_drained()
        };
        if should_free {
            self.free_or_defer(channel);
        }
    }

    /// Close the channel. If called re-entrantly from within the
    /// channel's own dispatch, defers the free until dispatch returns.
    pub fn close(&self, channel: NodeId) {
        self.free_or_defer(channel);
    }

    /// Free `channel` now, unless its dispatch is currently executing on
    /// the stack (the deferral slot is set), in which case flip the flag
    /// and let `dispatch_channel` perform the free once it returns.
    fn free_or_defer(&self, channel: NodeId) {
        let deferred = {
            let tree = self.tree.borrow();
            tree.get::<ChannelState>(channel)
                .and_then(|s| s.deferred_close.clone())
        };
        match deferred {
            Some(flag) => flag.set(true),
            None => {
                self.tree.borrow_mut().free(channel);
            }
        }
    }

    // ---- internal dispatch -------------------------------------------

    fn sync_watch_events(tree: &mut AllocTree, channel: NodeId) {
        let Some(state) = tree.get::<ChannelState>(channel) else {
            return;
        };
        let watch_id = state.watch;
        let want_write = state.wants_write();
        let Some(watch_id) = watch_id else { return };
        if let Some(watch) = tree.get_mut::<crate::watch::Watch>(watch_id) {
            let mut events = Events::READ;
            if want_write {
                events |= Events::WRITE;
            }
            watch.set_events(events);
        }
    }

    fn flush_channel(&self, channel: NodeId) -> Result<()> {
        let (mode, fd) = {
            let tree = self.tree.borrow();
            let state = tree.get::<ChannelState>(channel).ok_or(Error::BadFd)?;
            (state.mode, state.fd)
        };
        match mode {
            Mode::Stream => {
                let chunk = {
                    let tree = self.tree.borrow();
                    let state = tree.get::<ChannelState>(channel).ok_or(Error::BadFd)?;
                    if state.send_buf.is_empty() {
                        return Ok(());
                    }
                    state.send_buf.as_slice().to_vec()
                };
                let n = crate::sys::write(fd, &chunk)?;
                let mut tree = self.tree.borrow_mut();
                if let Some(state) = tree.get_mut::<ChannelState>(channel) {
                    state.send_buf.shrink(n);
                }
                Ok(())
            }
            Mode::Message => {
                let msg_id = {
                    let tree = self.tree.borrow();
                    let state = tree.get::<ChannelState>(channel).ok_or(Error::BadFd)?;
                    match state.send_q.front().copied() {
                        Some(id) => id,
                        None => return Ok(()),
                    }
                };
                {
                    let tree = self.tree.borrow();
                    let msg = tree.get::<Message>(msg_id).ok_or(Error::BadFd)?;
                    msg.send(fd)?;
                }
                let mut tree = self.tree.borrow_mut();
                if let Some(state) = tree.get_mut::<ChannelState>(channel) {
                    state.send_q.pop_front();
                }
                tree.free(msg_id);
                Ok(())
            }
        }
    }

    fn fill_channel(&self, channel: NodeId) -> Result<(bool, bool)> {
        let (mode, fd) = {
            let tree = self.tree.borrow();
            let state = tree.get::<ChannelState>(channel).ok_or(Error::BadFd)?;
            (state.mode, state.fd)
        };
        let mut activity = false;
        match mode {
            Mode::Stream => loop {
                let mut chunk = vec![0u8; self.limits.read_chunk];
                match crate::sys::read(fd, &mut chunk) {
                    Ok(0) => return Ok((activity, true)),
                    Ok(n) => {
                        activity = true;
                        chunk.truncate(n);
                        let mut tree = self.tree.borrow_mut();
                        if let Some(state) = tree.get_mut::<ChannelState>(channel) {
                            state.recv_buf.push(&chunk)?;
                        }
                    }
                    Err(e) if e.is_would_block() => return Ok((activity, false)),
                    Err(e) => return Err(e),
                }
            },
            Mode::Message => loop {
                match Message::recv(fd, self.limits.datagram_capacity) {
                    Ok((msg, n)) => {
                        activity = true;
                        if n == 0 {
                            return Ok((activity, true));
                        }
                        let mut tree = self.tree.borrow_mut();
                        let msg_id = tree.alloc(Some(channel), msg, "Message")?;
                        if let Some(state) = tree.get_mut::<ChannelState>(channel) {
                            state.recv_q.push_back(msg_id);
                        }
                    }
                    Err(e) if e.is_would_block() => return Ok((activity, false)),
                    Err(e) => return Err(e),
                }
            },
        }
    }

    fn invoke_reader(&self, channel: NodeId) {
        let mut reader = {
            let mut tree = self.tree.borrow_mut();
            tree.get_mut::<ChannelState>(channel)
                .and_then(|s| s.reader.take())
        };
        if let Some(cb) = &mut reader {
            cb(self, channel);
        }
        let mut tree = self.tree.borrow_mut();
        if let Some(state) = tree.get_mut::<ChannelState>(channel) {
            state.reader = reader;
        }
    }

    fn invoke_close_handler(&self, channel: NodeId) {
        let mut handler = {
            let mut tree = self.tree.borrow_mut();
            tree.get_mut::<ChannelState>(channel)
                .and_then(|s| s.close_handler.take())
        };
        if let Some(cb) = &mut handler {
            cb(self, channel);
        }
        let mut tree = self.tree.borrow_mut();
        if let Some(state) = tree.get_mut::<ChannelState>(channel) {
            state.close_handler = handler;
        }
    }

    fn invoke_error_handler(&self, channel: NodeId, err: Error) {
        let mut handler = {
            let mut tree = self.tree.borrow_mut();
            tree.get_mut::<ChannelState>(channel)
                .and_then(|s| s.error_handler.take())
        };
        if let Some(cb) = &mut handler {
            cb(self, channel, err);
        }
        let mut tree = self.tree.borrow_mut();
        if let Some(state) = tree.get_mut::<ChannelState>(channel) {
            state.error_handler = handler;
        }
    }

    fn has_close_handler(&self, channel: NodeId) -> bool {
        self.tree
            .borrow()
            .get::<ChannelState>(channel)
            .map(|s| s.close_handler.is_some())
            .unwrap_or(false)
    }

    fn has_error_handler(&self, channel: NodeId) -> bool {
        self.tree
            .borrow()
            .get::<ChannelState>(channel)
            .map(|s| s.error_handler.is_some())
            .unwrap_or(false)
    }

    fn finish_deferred_close(&self, channel: NodeId) {
        let mut tree = self.tree.borrow_mut();
        if let Some(state) = tree.get_mut::<ChannelState>(channel) {
            state.deferred_close = None;
        }
        tree.free(channel);
    }

    /// The internal watcher callback: called by the watch registry when
    /// the channel's fd is ready for the returned `events`. Mirrors the
    /// original's dispatch ordering: flush outgoing data, fill incoming
    /// buffers, then invoke user callbacks (reader, then close-or-free,
    /// then error-or-free), honoring re-entrant close requests throughout.
    pub(crate) fn dispatch_channel(self: &Rc<Self>, channel: NodeId, events: Events) {
        let deferred_close = Rc::new(std::cell::Cell::new(false));
        {
            let mut tree = self.tree.borrow_mut();
            let Some(state) = tree.get_mut::<ChannelState>(channel) else {
                return;
            };
            state.deferred_close = Some(deferred_close.clone());
        }

        let mut write_error = None;
        let mut read_error = None;

        if events.contains(Events::WRITE) {
            if let Err(e) = self.flush_channel(channel) {
                if !e.is_would_block() {
                    write_error = Some(e);
                }
            }
        }

        let mut read_activity = false;
        let mut remote_eof = false;
        if events.contains(Events::READ) || events.contains(Events::EXCEPT) {
            match self.fill_channel(channel) {
                Ok((activity, eof)) => {
                    read_activity = activity;
                    remote_eof = eof;
                }
                Err(e) => {
                    if !e.is_would_block() {
                        read_error = Some(e);
                    }
                }
            }
        }

        {
            let mut tree = self.tree.borrow_mut();
            Self::sync_watch_events(&mut tree, channel);
        }

        if read_activity || remote_eof {
            self.invoke_reader(channel);
            if deferred_close.get() {
                self.finish_deferred_close(channel);
                return;
            }
        }

        if remote_eof {
            if self.has_close_handler(channel) {
                self.invoke_close_handler(channel);
                if deferred_close.get() {
                    self.finish_deferred_close(channel);
                    return;
                }
            } else {
                self.finish_deferred_close(channel);
                return;
            }
        }

        if let Some(err) = write_error.or(read_error) {
            if self.has_error_handler(channel) {
                self.invoke_error_handler(channel, err);
                if deferred_close.get() {
                    self.finish_deferred_close(channel);
                    return;
                }
            } else {
                log::error!("channel fd={} error with no handler: {err}", {
                    self.tree
                        .borrow()
                        .get::<ChannelState>(channel)
                        .map(|s| s.fd)
                        .unwrap_or(-1)
                });
                crate::error::raise(err);
                self.finish_deferred_close(channel);
                return;
            }
        }

        let should_free = {
            let tree = self.tree.borrow();
            tree.get::<ChannelState>(channel)
                .map(|s| s.shutdown && s.is_drained())
                .unwrap_or(false)
        };
        if should_free {
            self.finish_deferred_close(channel);
            return;
        }

        let mut tree = self.tree.borrow_mut();
        if let Some(state) = tree.get_mut::<ChannelState>(channel) {
            state.deferred_close = None;
        }
    }
}
