//! Cancellation token and cancellable sleep.
//!
//! Every background thread in the daemon is parked on either a socket read
//! with a short timeout or a [`CancelToken::sleep`]. Cancelling a token wakes
//! all sleepers immediately and propagates to child tokens, so shutdown is
//! bounded by the longest socket timeout rather than the longest sleep.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

struct Inner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        {
            let _guard = self.lock.lock();
            self.cond.notify_all();
        }

        // Propagate to live children, dropping dead entries as we go.
        let children = {
            let mut list = self.children.lock();
            list.retain(|w| w.strong_count() > 0);
            list.clone()
        };
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
    }
}

/// Cooperative cancellation token.
///
/// Clones share the same cancellation state. [`CancelToken::child`] creates a
/// linked token that is cancelled when the parent is, but can also be
/// cancelled independently (used to stop one subsystem without tearing down
/// the daemon).
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                lock: Mutex::new(()),
                cond: Condvar::new(),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a child token. Cancelling the parent cancels the child;
    /// cancelling the child leaves the parent running.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        if self.is_cancelled() {
            child.cancel();
        } else {
            let mut children = self.inner.children.lock();
            children.retain(|w| w.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        child
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Return `Err(Cancelled)` if the token has fired, for use at the top of
    /// loop bodies.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `d`, waking early with `Err(Cancelled)` if the token fires.
    ///
    /// A non-positive duration returns immediately (after a cancellation
    /// check), which lets callers sleep on computed remainders directly.
    pub fn sleep(&self, d: Duration) -> Result<()> {
        self.check()?;
        if d.is_zero() {
            return Ok(());
        }

        let deadline = Instant::now() + d;
        let mut guard = self.inner.lock.lock();
        loop {
            if self.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if self.inner.cond.wait_until(&mut guard, deadline).timed_out() {
                // Deadline reached; one final cancellation check so that a
                // cancel racing the timeout is not lost.
                return self.check();
            }
        }
    }

    /// Block until the token is cancelled.
    pub fn wait(&self) {
        let mut guard = self.inner.lock.lock();
        while !self.is_cancelled() {
            self.inner.cond.wait(&mut guard);
        }
    }
}

/// Run `f` immediately and then every `period` until the token is cancelled
/// or `f` returns an error.
pub fn run_every<F>(token: &CancelToken, period: Duration, mut f: F) -> Result<()>
where
    F: FnMut() -> Result<()>,
{
    loop {
        token.check()?;
        f()?;
        token.sleep(period)?;
    }
}
