//! The actor runtime: mailboxes and timers.
//!
//! A [`Mailbox`] serializes jobs onto one worker thread. External callers
//! enqueue closures; responses to outbound messages arrive as transport
//! callbacks, which are *asynchronized*: wrapped so their bodies run on
//! the owning worker's thread. [`Timer`]s fire deferred callbacks the
//! same way.

use parking_lot::{Condvar, Mutex};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::trace;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A handle to a worker's serial job queue.
///
/// Cloning the handle shares the queue; the worker thread exits when the
/// last handle is dropped and the queue drains.
#[derive(Clone)]
pub struct Mailbox {
    name: Arc<str>,
    tx: Sender<Job>,
}

impl Mailbox {
    /// Spawns a worker thread draining this mailbox.
    #[must_use]
    pub fn spawn(name: &str) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let thread_name = format!("eddydb-{name}");
        thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            })
            .expect("failed to spawn worker thread");
        Self {
            name: Arc::from(name),
            tx,
        }
    }

    /// The worker's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues a job to run on the worker thread.
    ///
    /// Jobs run in enqueue order. Enqueueing after the worker stopped is
    /// a no-op.
    pub fn enqueue(&self, job: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(job)).is_err() {
            trace!(worker = %self.name, "job dropped: mailbox stopped");
        }
    }

    /// Wraps a callback so that each invocation re-enqueues its body onto
    /// this mailbox. Use this for transport callbacks that may fire on
    /// foreign threads.
    pub fn asynchronize<A: Send + 'static>(
        &self,
        callback: impl Fn(A) + Send + Sync + 'static,
    ) -> Arc<dyn Fn(A) + Send + Sync> {
        let mailbox = self.clone();
        let callback = Arc::new(callback);
        Arc::new(move |arg: A| {
            let callback = Arc::clone(&callback);
            mailbox.enqueue(move || callback(arg));
        })
    }

    /// Like [`asynchronize`](Self::asynchronize) for one-shot callbacks.
    pub fn asynchronize_once<A: Send + 'static>(
        &self,
        callback: impl FnOnce(A) + Send + 'static,
    ) -> impl FnOnce(A) + Send + 'static {
        let mailbox = self.clone();
        move |arg: A| {
            mailbox.enqueue(move || callback(arg));
        }
    }

    /// Runs a job on the worker thread after `delay`.
    pub fn enqueue_after(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        let mailbox = self.clone();
        let job = Mutex::new(Some(Box::new(job) as Job));
        let timer = Timer::new(move || {
            if let Some(job) = job.lock().take() {
                mailbox.enqueue(job);
            }
        });
        timer.fire_after(delay);
        timer.detach();
    }
}

struct TimerState {
    deadline: Option<Instant>,
    shutdown: bool,
    /// A detached timer's thread exits once nothing is scheduled.
    detached: bool,
}

struct TimerInner {
    state: Mutex<TimerState>,
    condvar: Condvar,
}

/// A deferred-callback timer.
///
/// The callback runs on the timer's own service thread; wrap it with
/// [`Mailbox::asynchronize`] (or capture a mailbox) to hop to a worker.
/// Re-arming an already armed timer moves its deadline. Timers armed for
/// the same instant each fire; coalescing never drops a callback.
pub struct Timer {
    inner: Arc<TimerInner>,
    detached: bool,
}

impl Timer {
    /// Creates a timer with a callback. The timer is unarmed until
    /// [`fire_at`](Self::fire_at) or [`fire_after`](Self::fire_after).
    #[must_use]
    pub fn new(callback: impl Fn() + Send + Sync + 'static) -> Self {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                deadline: None,
                shutdown: false,
                detached: false,
            }),
            condvar: Condvar::new(),
        });
        let service = Arc::clone(&inner);
        thread::Builder::new()
            .name("eddydb-timer".to_owned())
            .spawn(move || Self::run(&service, &callback))
            .expect("failed to spawn timer thread");
        Self {
            inner,
            detached: false,
        }
    }

    fn run(inner: &TimerInner, callback: &(impl Fn() + Send + Sync)) {
        let mut state = inner.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            match state.deadline {
                None => {
                    if state.detached {
                        return;
                    }
                    inner.condvar.wait(&mut state);
                }
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        state.deadline = None;
                        drop(state);
                        callback();
                        state = inner.state.lock();
                    } else {
                        let _ = inner.condvar.wait_until(&mut state, deadline);
                    }
                }
            }
        }
    }

    /// Arms (or re-arms) the timer to fire at `deadline`.
    pub fn fire_at(&self, deadline: Instant) {
        let mut state = self.inner.state.lock();
        state.deadline = Some(deadline);
        self.inner.condvar.notify_one();
    }

    /// Arms (or re-arms) the timer to fire after `delay`.
    pub fn fire_after(&self, delay: Duration) {
        self.fire_at(Instant::now() + delay);
    }

    /// Disarms the timer without destroying it.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        state.deadline = None;
        self.inner.condvar.notify_one();
    }

    /// True if the timer is currently armed.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.inner.state.lock().deadline.is_some()
    }

    /// Lets the timer outlive this handle for its pending fire.
    fn detach(mut self) {
        self.detached = true;
        let mut state = self.inner.state.lock();
        state.detached = true;
        self.inner.condvar.notify_one();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if !self.detached {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            state.deadline = None;
            self.inner.condvar.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn mailbox_runs_jobs_in_enqueue_order() {
        let mailbox = Mailbox::spawn("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let log = Arc::clone(&log);
            mailbox.enqueue(move || log.lock().push(i));
        }
        let (tx, rx) = mpsc::channel();
        mailbox.enqueue(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*log.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn asynchronize_hops_to_the_worker_thread() {
        let mailbox = Mailbox::spawn("hop");
        let (tx, rx) = mpsc::channel();
        let callback = mailbox.asynchronize(move |value: u32| {
            let name = thread::current().name().map(str::to_owned);
            tx.send((value, name)).unwrap();
        });
        // Invoke from a foreign thread, as a transport would.
        thread::spawn(move || callback(7)).join().unwrap();
        let (value, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(value, 7);
        assert_eq!(name.as_deref(), Some("eddydb-hop"));
    }

    #[test]
    fn two_timers_at_the_same_instant_both_fire() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c1 = Arc::clone(&counter);
        let c2 = Arc::clone(&counter);
        let t1 = Timer::new(move || {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let t2 = Timer::new(move || {
            c2.fetch_add(1, Ordering::SeqCst);
        });

        let at = Instant::now() + Duration::from_millis(300);
        t1.fire_at(at);
        t2.fire_at(at);

        thread::sleep(Duration::from_millis(600));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rearming_moves_the_deadline() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let timer = Timer::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        timer.fire_after(Duration::from_millis(50));
        timer.fire_after(Duration::from_millis(250));
        thread::sleep(Duration::from_millis(120));
        assert_eq!(counter.load(Ordering::SeqCst), 0, "old deadline must not fire");
        thread::sleep(Duration::from_millis(300));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_disarms() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let timer = Timer::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        timer.fire_after(Duration::from_millis(50));
        timer.cancel();
        assert!(!timer.is_armed());
        thread::sleep(Duration::from_millis(150));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn enqueue_after_runs_on_the_mailbox() {
        let mailbox = Mailbox::spawn("delayed");
        let (tx, rx) = mpsc::channel();
        mailbox.enqueue_after(Duration::from_millis(50), move || {
            tx.send(thread::current().name().map(str::to_owned)).unwrap();
        });
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("eddydb-delayed"));
    }
}
