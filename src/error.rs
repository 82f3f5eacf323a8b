//! Error handling utils.
//!
//! Most of this crate's API returns `Result<T, Error>` directly. The
//! asynchronous dispatch path (inside [`crate::runtime::Runtime::dispatch_channel`])
//! has no caller to return to, so it raises into a process-wide "last error"
//! slot instead and hands control to the channel's `error_handler`. This
//! mirrors the call-convention split an `errno`-style API makes between
//! synchronous calls (return the error) and callback-driven ones (stash it
//! for retrieval).
//!
//! You don't have to clear the last error before calling into the crate
//! again; [`raise`] always overwrites whatever was there.

use std::cell::RefCell;
use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All error cases produced by this crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A [`Vec::try_reserve`]-style allocation failure, either in the
    /// node arena or in a [`crate::buffer::Buffer`].
    #[error("out of memory")]
    OutOfMemory,

    /// A datagram did not fit the receive buffer (`MSG_TRUNC`).
    #[error("message truncated")]
    Truncated,

    /// Operation attempted on a file descriptor that is no longer open.
    #[error("bad file descriptor")]
    BadFd,

    /// Any other OS-level error, passed through unchanged.
    #[error("io error: {0}")]
    IoSystem(#[from] io::Error),
}

impl Error {
    /// True for the two non-fatal conditions that stop a read/write batch
    /// without being surfaced to user code.
    pub(crate) fn is_would_block(&self) -> bool {
        matches!(self, Error::IoSystem(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<Error>> = RefCell::new(None);
}

/// Stash `err` as the process' (thread's) last error, overwriting any
/// previous value. Used by asynchronous paths that have no direct caller
/// to return a `Result` to.
pub fn raise(err: Error) {
    log::debug!("raising error: {err}");
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(err));
}

/// Take the last raised error, if any, clearing the slot.
pub fn get() -> Option<Error> {
    LAST_ERROR.with(|slot| slot.borrow_mut().take())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_then_get_round_trips_and_clears() {
        assert!(get().is_none());
        raise(Error::Truncated);
        assert!(matches!(get(), Some(Error::Truncated)));
        assert!(get().is_none());
    }

    #[test]
    fn would_block_recognizes_eagain() {
        let err = Error::IoSystem(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(err.is_would_block());
        assert!(!Error::Truncated.is_would_block());
    }
}
