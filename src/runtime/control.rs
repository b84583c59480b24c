//! State shared between the event loop thread and its handles.
//!
//! This is the only part of the server another thread may touch: a stop
//! flag, a waker that interrupts the readiness wait, and a read-only mirror
//! of the registry size.

use mio::{Registry, Token, Waker};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Token reserved for the cross-thread waker.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX - 1);

pub(crate) struct Control {
    running: AtomicBool,
    members: AtomicUsize,
    waker: Waker,
}

impl Control {
    pub(crate) fn new(registry: &Registry) -> io::Result<Self> {
        Ok(Self {
            running: AtomicBool::new(true),
            members: AtomicUsize::new(0),
            waker: Waker::new(registry, WAKER_TOKEN)?,
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Clear the running flag and wake the loop.
    ///
    /// Returns `true` only for the call that actually stopped the server.
    pub(crate) fn request_stop(&self) -> bool {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        if was_running {
            // The loop also notices within one poll timeout
            let _ = self.waker.wake();
        }
        was_running
    }

    pub(crate) fn members(&self) -> usize {
        self.members.load(Ordering::Acquire)
    }

    pub(crate) fn set_members(&self, count: usize) {
        self.members.store(count, Ordering::Release);
    }
}
