//! FIFO queues of threads parked on the cache-wide mutex.
//!
//! Every waiter gets its own [`Condvar`], so a wake-up is delivered to exactly the
//! thread it was meant for. Waiters are enqueued and woken only while the cache
//! mutex is held, which rules out lost wake-ups. A woken thread gets no resource
//! handed to it: it re-runs whatever check made it wait.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, MutexGuard};

/// Single parked thread.
pub(crate) struct Waiter {
    cond: Condvar,
    /// Written and read only with the cache mutex held.
    woken: AtomicBool,
}

impl Waiter {
    fn new() -> Self {
        Self {
            cond: Condvar::new(),
            woken: AtomicBool::new(false),
        }
    }

    /// Blocks until the waiter is woken. `guard` is released while parked and
    /// re-acquired before returning.
    pub(crate) fn park<T>(&self, guard: &mut MutexGuard<'_, T>) {
        while !self.is_woken() {
            self.cond.wait(guard);
        }
    }

    pub(crate) fn is_woken(&self) -> bool {
        self.woken.load(Ordering::Relaxed)
    }

    fn wake(&self) {
        self.woken.store(true, Ordering::Relaxed);
        self.cond.notify_one();
    }
}

/// Queue of [`Waiter`]s, woken in arrival order.
#[derive(Default)]
pub(crate) struct WaitQueue {
    waiters: VecDeque<Arc<Waiter>>,
}

impl WaitQueue {
    /// Appends new waiter at the end of the queue. The caller must park on it
    /// before releasing the mutex protecting this queue.
    pub(crate) fn enqueue(&mut self) -> Arc<Waiter> {
        let waiter = Arc::new(Waiter::new());
        self.waiters.push_back(waiter.clone());
        waiter
    }

    /// Wakes every waiter, oldest first. Returns the number of woken threads.
    pub(crate) fn wake_all(&mut self) -> usize {
        let count = self.waiters.len();
        for waiter in self.waiters.drain(..) {
            waiter.wake();
        }
        count
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wake_all_drains_queue() {
        let mut queue = WaitQueue::default();
        let first = queue.enqueue();
        let second = queue.enqueue();
        assert_eq!(queue.len(), 2);
        assert!(!first.is_woken());

        assert_eq!(queue.wake_all(), 2);
        assert!(first.is_woken());
        assert!(second.is_woken());
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.wake_all(), 0);
    }

    #[test]
    fn parked_thread_resumes_after_wake() {
        let state = Arc::new(Mutex::new(WaitQueue::default()));

        let waiter_state = state.clone();
        let handle = thread::spawn(move || {
            let mut guard = waiter_state.lock();
            let waiter = guard.enqueue();
            waiter.park(&mut guard);
            guard.len()
        });

        // wait until the thread is parked
        loop {
            if state.lock().len() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        state.lock().wake_all();

        assert_eq!(handle.join().unwrap(), 0);
    }
}
