use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::deque::{Injector, Steal};
use crossbeam::utils::Backoff;
use scoped_threadpool::Pool;

/// Lock-free multi-producer multi-consumer job queue with idle-worker
/// signalling.
///
/// Jobs are independent: ordering between dependent steps is encoded in the
/// sort steps' substep counters, never in queue order. Workers pop and run
/// jobs until the queue is empty and every worker reports idle; since only a
/// running job can enqueue, that state is stable and `drain` returns.
pub struct JobQueue<J> {
    injector: Injector<J>,
    idle: AtomicUsize,
}

impl<J: Send> JobQueue<J> {
    pub fn new() -> Self {
        JobQueue {
            injector: Injector::new(),
            idle: AtomicUsize::new(0),
        }
    }

    /// Push a job. Callable from within running jobs.
    #[inline]
    pub fn enqueue(&self, job: J) {
        self.injector.push(job);
    }

    /// Snapshot: is some worker currently blocked in the pop path without
    /// work? Used by the work-sharing hook of sequential jobs.
    #[inline]
    pub fn has_idle(&self) -> bool {
        self.idle.load(Ordering::Relaxed) > 0
    }

    /// Run jobs on `threads` workers until the queue drains and all workers
    /// are idle. `run` executes one job; `pin` runs once per worker before
    /// its loop, the hook NUMA-aware embedders use to tie workers to a
    /// locality group.
    pub fn drain<R, P>(&self, threads: usize, run: R, pin: P)
    where
        J: Send,
        R: Fn(J) + Sync,
        P: Fn() + Sync,
    {
        assert!(threads >= 1);
        self.idle.store(0, Ordering::SeqCst);

        let mut pool = Pool::new(threads as u32);
        pool.scoped(|scope| {
            for _ in 0..threads {
                scope.execute(|| {
                    pin();
                    self.work(threads, &run);
                });
            }
        });
    }

    fn work<R: Fn(J)>(&self, threads: usize, run: &R) {
        loop {
            match self.injector.steal() {
                Steal::Success(job) => run(job),
                Steal::Retry => {}
                Steal::Empty => {
                    self.idle.fetch_add(1, Ordering::SeqCst);
                    let backoff = Backoff::new();
                    loop {
                        if !self.injector.is_empty() {
                            break;
                        }
                        if self.idle.load(Ordering::SeqCst) == threads {
                            // quiescent: nobody is running, nobody can
                            // enqueue. Leave the idle count raised so the
                            // other workers observe the same state.
                            return;
                        }
                        backoff.snooze();
                    }
                    self.idle.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn drains_simple_jobs() {
        let queue = JobQueue::new();
        let sum = AtomicUsize::new(0);
        for i in 1..=100usize {
            queue.enqueue(i);
        }
        queue.drain(
            4,
            |job| {
                sum.fetch_add(job, Ordering::Relaxed);
            },
            || {},
        );
        assert_eq!(sum.load(Ordering::Relaxed), 5050);
    }

    #[test]
    fn jobs_may_enqueue_jobs() {
        // each job of weight w enqueues two of weight w - 1: 2^w - 1 runs.
        let queue = JobQueue::new();
        let runs = AtomicUsize::new(0);
        queue.enqueue(10usize);
        queue.drain(
            4,
            |w| {
                runs.fetch_add(1, Ordering::Relaxed);
                if w > 1 {
                    queue.enqueue(w - 1);
                    queue.enqueue(w - 1);
                }
            },
            || {},
        );
        assert_eq!(runs.load(Ordering::Relaxed), (1 << 10) - 1);
    }

    #[test]
    fn single_worker_drains() {
        let queue = JobQueue::new();
        let runs = AtomicUsize::new(0);
        for _ in 0..10 {
            queue.enqueue(());
        }
        queue.drain(
            1,
            |_| {
                runs.fetch_add(1, Ordering::Relaxed);
            },
            || {},
        );
        assert_eq!(runs.load(Ordering::Relaxed), 10);
        assert!(queue.has_idle());
    }

    #[test]
    fn pin_runs_once_per_worker() {
        let queue: JobQueue<()> = JobQueue::new();
        let pins = AtomicUsize::new(0);
        queue.drain(
            3,
            |_| {},
            || {
                pins.fetch_add(1, Ordering::Relaxed);
            },
        );
        assert_eq!(pins.load(Ordering::Relaxed), 3);
    }
}
