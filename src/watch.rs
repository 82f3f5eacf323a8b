//! File-descriptor watch registration and readiness-set dispatch.
//!
//! A [`WatchRegistry`] is a flat, insertion-ordered list of [`Watch`] node
//! ids. Each tick the host calls [`WatchRegistry::select_fds`] to build the
//! `select(2)`-style readiness sets, performs the actual wait itself, then
//! calls [`WatchRegistry::handle_fds`] to dispatch. Watches freed between
//! those two calls are simply absent from the tree by the time dispatch
//! looks them up — a stale [`crate::alloc::NodeId`] skips silently instead
//! of needing a separate liveness check.

use std::os::unix::io::RawFd;

use bitflags::bitflags;

use crate::alloc::{AllocTree, NodeId};
use crate::error::Result;

bitflags! {
    /// Readiness bits, mirroring `select(2)`'s three fd sets.
    pub struct Events: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXCEPT = 0b100;
    }
}

type Callback = Box<dyn FnMut(RawFd, Events)>;

/// A single `(fd, event-mask, callback)` registration.
pub struct Watch {
    fd: RawFd,
    events: Events,
    callback: Option<Callback>,
}

impl Watch {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> Events {
        self.events
    }

    pub fn set_events(&mut self, events: Events) {
        self.events = events;
    }
}

/// Insertion-ordered set of live watches.
#[derive(Default)]
pub struct WatchRegistry {
    watches: Vec<NodeId>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new watch as a child of `parent` (or a root).
    pub fn add_watch<F>(
        &mut self,
        tree: &mut AllocTree,
        parent: Option<NodeId>,
        fd: RawFd,
        events: Events,
        callback: F,
    ) -> Result<NodeId>
    where
        F: FnMut(RawFd, Events) + 'static,
    {
        let watch = Watch {
            fd,
            events,
            callback: Some(Box::new(callback)),
        };
        let id = tree.alloc(parent, watch, format!("Watch(fd={fd})"))?;
        self.watches.push(id);
        Ok(id)
    }

    /// Union every live watch's requested events into `rd`/`wr`/`ex`,
    /// raising `*nfds` as needed.
    pub fn select_fds(
        &self,
        tree: &AllocTree,
        nfds: &mut i32,
        rd: &mut libc::fd_set,
        wr: &mut libc::fd_set,
        ex: &mut libc::fd_set,
    ) {
        for &id in &self.watches {
            let Some(watch) = tree.get::<Watch>(id) else {
                continue;
            };
            if watch.events.contains(Events::READ) {
                unsafe { libc::FD_SET(watch.fd, rd) };
            }
            if watch.events.contains(Events::WRITE) {
                unsafe { libc::FD_SET(watch.fd, wr) };
            }
            if watch.events.contains(Events::EXCEPT) {
                unsafe { libc::FD_SET(watch.fd, ex) };
            }
            *nfds = (*nfds).max(watch.fd + 1);
        }
    }

    /// Dispatch against a readiness snapshot, in registration order. Also
    /// lazily drops ids for watches freed since the last call.
    pub fn handle_fds(
        &mut self,
        tree: &mut AllocTree,
        rd: &libc::fd_set,
        wr: &libc::fd_set,
        ex: &libc::fd_set,
    ) {
        let snapshot = self.watches.clone();
        for id in snapshot {
            let Some(watch) = tree.get::<Watch>(id) else {
                continue;
            };
            let fd = watch.fd;
            let mut matched = Events::empty();
            if watch.events.contains(Events::READ) && unsafe { libc::FD_ISSET(fd, rd) } {
                matched |= Events::READ;
            }
            if watch.events.contains(Events::WRITE) && unsafe { libc::FD_ISSET(fd, wr) } {
                matched |= Events::WRITE;
            }
            if watch.events.contains(Events::EXCEPT) && unsafe { libc::FD_ISSET(fd, ex) } {
                matched |= Events::EXCEPT;
            }
            if matched.is_empty() {
                continue;
            }

            // Take the callback out before invoking it: the callback may
            // re-enter this registry (e.g. free its own watch), which would
            // otherwise alias the `&mut` borrow `get_mut` would need to hold.
            let Some(mut callback) = tree.get_mut::<Watch>(id).and_then(|w| w.callback.take())
            else {
                continue;
            };
            callback(fd, matched);
            if let Some(w) = tree.get_mut::<Watch>(id) {
                w.callback = Some(callback);
            }
        }
        self.watches.retain(|id| tree.get::<Watch>(*id).is_some());
    }
}
