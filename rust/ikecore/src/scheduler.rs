//! Job scheduler: a FIFO work queue plus a timer-ordered delay queue,
//! backed by a fixed pool of OS threads. A `BinaryHeap<Reverse<_>>` delay
//! queue is promoted into the FIFO by one dedicated timer thread, keeping
//! "run now" and "run later" on separate, simple data structures.
//!
//! Cancellation is cooperative and lazy: `schedule_in`/`schedule_at`
//! return a [`JobHandle`] sharing an `AtomicBool` with the queued job.
//! The timer thread checks that flag only when the job comes due and is
//! popped off the heap — a cancelled job is simply dropped there, never
//! interrupted mid-run.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

pub type JobFn = Box<dyn FnOnce() + Send + 'static>;

/// High-water mark on the FIFO queue length past which `queue` logs a
/// back-pressure warning instead of silently growing unbounded.
const FIFO_WARN_THRESHOLD: usize = 4096;

/// Handle to a job queued with `schedule_in`/`schedule_at`. Cancelling
/// after the job has already been promoted to the FIFO (or has already
/// run) has no effect.
#[derive(Clone)]
pub struct JobHandle {
    cancelled: Arc<AtomicBool>,
}

impl JobHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct ScheduledJob {
    due: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    job: JobFn,
}

impl PartialEq for ScheduledJob {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for ScheduledJob {}
impl PartialOrd for ScheduledJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

struct DelayQueue {
    heap: Mutex<BinaryHeap<Reverse<ScheduledJob>>>,
    woken: Condvar,
}

/// A running scheduler instance: one FIFO of immediately-runnable jobs
/// consumed by a worker pool, and one delay queue of time-triggered jobs
/// promoted into the FIFO by a dedicated timer thread as they come due.
pub struct Scheduler {
    fifo_tx: Option<Sender<JobFn>>,
    delay: Arc<DelayQueue>,
    shutdown: Arc<AtomicBool>,
    next_seq: AtomicU64,
    workers: Vec<std::thread::JoinHandle<()>>,
    timer: Option<std::thread::JoinHandle<()>>,
}

impl Scheduler {
    pub fn start(worker_count: usize, fifo_capacity: usize) -> Self {
        let (fifo_tx, fifo_rx): (Sender<JobFn>, Receiver<JobFn>) = bounded(fifo_capacity);
        let delay = Arc::new(DelayQueue {
            heap: Mutex::new(BinaryHeap::new()),
            woken: Condvar::new(),
        });
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let rx = fifo_rx.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("ikecore-worker-{id}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("spawning worker thread"),
            );
        }

        let timer_delay = Arc::clone(&delay);
        let timer_shutdown = Arc::clone(&shutdown);
        let timer_tx = fifo_tx.clone();
        let timer = std::thread::Builder::new()
            .name("ikecore-scheduler-timer".into())
            .spawn(move || loop {
                if timer_shutdown.load(Ordering::Acquire) {
                    return;
                }
                let mut heap = timer_delay.heap.lock();
                let now = Instant::now();
                while let Some(Reverse(top)) = heap.peek() {
                    if top.due > now {
                        break;
                    }
                    let Reverse(due_job) = heap.pop().unwrap();
                    if due_job.cancelled.load(Ordering::Acquire) {
                        debug!("discarding cancelled scheduled job at pop");
                        continue;
                    }
                    if timer_tx.send(due_job.job).is_err() {
                        return;
                    }
                }
                let wait = heap
                    .peek()
                    .map(|Reverse(j)| j.due.saturating_duration_since(now))
                    .unwrap_or(Duration::from_millis(250));
                timer_delay.woken.wait_for(&mut heap, wait);
            })
            .expect("spawning timer thread");

        Scheduler {
            fifo_tx: Some(fifo_tx),
            delay,
            shutdown,
            next_seq: AtomicU64::new(0),
            workers,
            timer: Some(timer),
        }
    }

    /// Enqueue a job for immediate execution by the next free worker.
    pub fn queue(&self, job: JobFn) {
        let Some(fifo_tx) = &self.fifo_tx else {
            debug!("dropping job enqueued after scheduler shutdown");
            return;
        };
        if fifo_tx.len() >= FIFO_WARN_THRESHOLD {
            warn!(depth = fifo_tx.len(), "scheduler FIFO over back-pressure threshold");
        }
        if fifo_tx.send(job).is_err() {
            debug!("dropping job enqueued after scheduler shutdown");
        }
    }

    /// Schedule a job to run no earlier than `delay` from now.
    pub fn schedule_in(&self, delay: Duration, job: JobFn) -> JobHandle {
        self.schedule_at(Instant::now() + delay, job)
    }

    pub fn schedule_at(&self, due: Instant, job: JobFn) -> JobHandle {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = JobHandle { cancelled: Arc::clone(&cancelled) };
        let mut heap = self.delay.heap.lock();
        heap.push(Reverse(ScheduledJob { due, seq, cancelled, job }));
        self.delay.woken.notify_one();
        handle
    }

    pub fn queued_len(&self) -> usize {
        self.fifo_tx.as_ref().map(|tx| tx.len()).unwrap_or(0)
    }

    pub fn delayed_len(&self) -> usize {
        self.delay.heap.lock().len()
    }

    /// Stop accepting new work, close the FIFO so workers drain and
    /// exit, and join every thread. Consuming `self` also runs `Drop`,
    /// which is a no-op once this has already happened.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.delay.woken.notify_all();
        // Dropping the sender closes the FIFO, which is what lets
        // worker threads blocked in `rx.recv()` return and exit.
        self.fifo_tx.take();
        if let Some(t) = self.timer.take() {
            let _ = t.join();
        }
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn immediate_job_runs() {
        let scheduler = Scheduler::start(2, 16);
        let (tx, rx) = mpsc::channel();
        scheduler.queue(Box::new(move || {
            tx.send(42).unwrap();
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 42);
    }

    #[test]
    fn delayed_job_does_not_run_before_due_time() {
        let scheduler = Scheduler::start(1, 16);
        let (tx, rx) = mpsc::channel();
        scheduler.schedule_in(Duration::from_millis(150), Box::new(move || {
            tx.send(Instant::now()).unwrap();
        }));
        let start = Instant::now();
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn cancelled_job_is_discarded_at_pop() {
        let scheduler = Scheduler::start(1, 16);
        let (tx, rx) = mpsc::channel();
        let handle = scheduler.schedule_in(
            Duration::from_millis(30),
            Box::new(move || {
                tx.send(()).unwrap();
            }),
        );
        handle.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn delayed_jobs_fire_in_due_order() {
        let scheduler = Scheduler::start(1, 16);
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        scheduler.schedule_in(Duration::from_millis(100), Box::new(move || tx2.send(2).unwrap()));
        scheduler.schedule_in(Duration::from_millis(20), Box::new(move || tx.send(1).unwrap()));

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
    }
}
