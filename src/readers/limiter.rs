use std::sync::{Condvar, Mutex};

/// Counted slot semaphore bounding the number of in-flight decode tasks.
///
/// The reader thread acquires a slot before submitting a task and each task
/// releases its slot when it finishes, so the reader blocks as soon as every
/// worker is busy. This is the sole back-pressure mechanism: bounding the
/// in-flight count also bounds the memory held in undecoded blob payloads.
pub(crate) struct TaskLimiter {
    capacity: usize,
    permits: Mutex<usize>,
    available: Condvar,
}

impl TaskLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            permits: Mutex::new(capacity),
            available: Condvar::new(),
        }
    }

    /// Takes one slot, blocking while none is free.
    pub fn acquire(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.available.wait(permits).unwrap();
        }
        *permits -= 1;
    }

    /// Returns one slot.
    pub fn release(&self) {
        let mut permits = self.permits.lock().unwrap();
        *permits += 1;
        self.available.notify_all();
    }

    /// Blocks until every slot is back, i.e. no task is in flight.
    pub fn wait_idle(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits < self.capacity {
            permits = self.available.wait(permits).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn release_returns_the_acquired_slot() {
        let limiter = TaskLimiter::new(1);
        limiter.acquire();
        limiter.release();
        // A second acquire succeeds only if the slot really came back.
        limiter.acquire();
        limiter.release();
        limiter.wait_idle();
    }

    #[test]
    fn acquire_blocks_until_a_slot_is_released() {
        let limiter = Arc::new(TaskLimiter::new(1));
        limiter.acquire();

        let releaser = {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                limiter.release();
            })
        };

        // Blocks until the other thread gives the slot back.
        limiter.acquire();
        limiter.release();
        releaser.join().unwrap();
    }

    #[test]
    fn wait_idle_blocks_until_all_slots_return() {
        let limiter = Arc::new(TaskLimiter::new(2));
        limiter.acquire();
        limiter.acquire();

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(20));
                    limiter.release();
                })
            })
            .collect();

        limiter.wait_idle();
        for worker in workers {
            worker.join().unwrap();
        }
    }
}
