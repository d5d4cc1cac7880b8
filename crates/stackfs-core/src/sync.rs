//! Fair FIFO binary lock with asynchronous acquisition.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;

struct LockState {
    locked: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// A binary lock whose waiters are resumed in strict FIFO order.
///
/// Unlike a standard async mutex there is no guard: release is an explicit
/// [`FairMutex::unlock`], which lets a wrapper release the lock inside a
/// completion path. Exactly one waiter resumes per unlock, at its task's
/// next poll rather than inline.
pub struct FairMutex {
    state: Mutex<LockState>,
}

impl Default for FairMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl FairMutex {
    /// Create a new unlocked mutex.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                locked: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Acquire the lock, waiting behind any earlier waiters.
    pub async fn lock(&self) {
        let rx = {
            let mut state = self.state.lock();
            if !state.locked {
                state.locked = true;
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };
        // The sender side is dropped only if the mutex itself is dropped
        // while we wait, which cannot happen while we borrow it.
        let _ = rx.await;
    }

    /// Release the lock, handing it to the head waiter if any.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is not locked; that is a programming error in
    /// the caller, not a recoverable condition.
    pub fn unlock(&self) {
        let mut state = self.state.lock();
        assert!(state.locked, "unlock of an unlocked FairMutex");
        loop {
            match state.waiters.pop_front() {
                // A waiter whose receiver was dropped abandoned the queue;
                // skip it and hand the lock to the next one.
                Some(tx) => {
                    if tx.send(()).is_ok() {
                        return;
                    }
                }
                None => {
                    state.locked = false;
                    return;
                }
            }
        }
    }

    /// Non-blocking query of the lock state.
    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }
}
