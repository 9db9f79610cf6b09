//! Blocking waits with an uninterruptible and a signal-interruptible flavour.
//!
//! A [`WaitQueue`] carries a wake sequence number. Waiters sample it, test
//! their condition without holding the queue lock, and only sleep while the
//! sequence is unchanged, so a wake between the test and the sleep is never
//! lost and conditions are free to take other locks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use crate::error::IwError;
use crate::task::TaskContext;

struct WaitInner {
    seq: Mutex<u64>,
    cv: Condvar,
}

impl WaitInner {
    fn wake(&self) {
        let mut seq = self.seq.lock();
        *seq = seq.wrapping_add(1);
        self.cv.notify_all();
    }
}

#[derive(Clone)]
pub struct WaitQueue {
    inner: Arc<WaitInner>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WaitInner {
                seq: Mutex::new(0),
                cv: Condvar::new(),
            }),
        }
    }

    /// Wakes every waiter so it re-tests its condition.
    pub fn wake_all(&self) {
        self.inner.wake();
    }

    /// Sleeps until `cond` returns true. Signals are ignored.
    pub fn wait<F: FnMut() -> bool>(&self, mut cond: F) {
        loop {
            let seen = *self.inner.seq.lock();
            if cond() {
                return;
            }
            let mut seq = self.inner.seq.lock();
            while *seq == seen {
                self.inner.cv.wait(&mut seq);
            }
        }
    }

    /// Sleeps until `cond` returns true or `signal` is raised.
    ///
    /// The condition is tested first, so a satisfied condition wins over a
    /// pending signal.
    pub fn wait_interruptible<F: FnMut() -> bool>(
        &self,
        signal: &Signal,
        mut cond: F,
    ) -> Result<(), IwError> {
        loop {
            let seen = *self.inner.seq.lock();
            if cond() {
                return Ok(());
            }
            if signal.is_pending() {
                return Err(IwError::Interrupted);
            }
            signal.arm(&self.inner);
            {
                let mut seq = self.inner.seq.lock();
                while *seq == seen && !signal.is_pending() {
                    self.inner.cv.wait(&mut seq);
                }
            }
            signal.disarm();
        }
    }

    /// Kernel tasks wait uninterruptibly, user tasks interruptibly.
    pub fn wait_for<F: FnMut() -> bool>(&self, task: &TaskContext, cond: F) -> Result<(), IwError> {
        if task.is_kernel() {
            self.wait(cond);
            Ok(())
        } else {
            self.wait_interruptible(task.signal(), cond)
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitQueue")
            .field("seq", &*self.inner.seq.lock())
            .finish()
    }
}

struct SignalInner {
    pending: AtomicBool,
    armed: Mutex<Option<Weak<WaitInner>>>,
}

/// Pending-signal flag of one task.
///
/// Raising it wakes whatever queue the task is currently sleeping on.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

impl Signal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                pending: AtomicBool::new(false),
                armed: Mutex::new(None),
            }),
        }
    }

    pub fn raise(&self) {
        self.inner.pending.store(true, Ordering::SeqCst);
        let armed = self.inner.armed.lock().as_ref().and_then(Weak::upgrade);
        if let Some(queue) = armed {
            queue.wake();
        }
    }

    pub fn clear(&self) {
        self.inner.pending.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.inner.pending.load(Ordering::SeqCst)
    }

    fn arm(&self, queue: &Arc<WaitInner>) {
        *self.inner.armed.lock() = Some(Arc::downgrade(queue));
    }

    fn disarm(&self) {
        *self.inner.armed.lock() = None;
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("pending", &self.is_pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wake_after_condition_change() {
        let wq = WaitQueue::new();
        let flag = Arc::new(AtomicU32::new(0));
        let waiter = {
            let wq = wq.clone();
            let flag = flag.clone();
            thread::spawn(move || wq.wait(|| flag.load(Ordering::SeqCst) == 1))
        };
        thread::sleep(Duration::from_millis(20));
        flag.store(1, Ordering::SeqCst);
        wq.wake_all();
        waiter.join().unwrap();
    }

    #[test]
    fn signal_interrupts_wait() {
        let wq = WaitQueue::new();
        let signal = Signal::new();
        let waiter = {
            let wq = wq.clone();
            let signal = signal.clone();
            thread::spawn(move || wq.wait_interruptible(&signal, || false))
        };
        thread::sleep(Duration::from_millis(20));
        signal.raise();
        assert_eq!(waiter.join().unwrap(), Err(IwError::Interrupted));
    }

    #[test]
    fn satisfied_condition_beats_pending_signal() {
        let wq = WaitQueue::new();
        let signal = Signal::new();
        signal.raise();
        assert_eq!(wq.wait_interruptible(&signal, || true), Ok(()));
        assert_eq!(
            wq.wait_interruptible(&signal, || false),
            Err(IwError::Interrupted)
        );
        signal.clear();
        assert!(!signal.is_pending());
    }
}
