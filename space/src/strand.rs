//! The scheduling substrate: a pool of worker threads draining strands.
//! A strand serializes the tasks posted to it, giving cooperative
//! single-threaded semantics within one strand and parallelism across
//! strands. Delayed tasks carry an optional generation so a cancelled
//! timer that still fires becomes a no-op.

use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::trace;
use parsec_shared::Generation;
use smol::channel::{self, Receiver, Sender};

type Task = Box<dyn FnOnce() + Send + 'static>;

// How many tasks one worker runs from a strand before handing it back to
// the pool, so a chatty strand cannot starve the others.
const STRAND_BATCH: usize = 16;

struct StrandCore {
    label: String,
    queue: Mutex<VecDeque<Task>>,
    scheduled: AtomicBool,
}

/// A handle to one strand. Cloneable; all clones feed the same FIFO.
#[derive(Clone)]
pub struct Strand {
    core: Arc<StrandCore>,
    injector: Sender<Arc<StrandCore>>,
}

impl Strand {
    /// Post a task; it will run after every task posted before it on this
    /// strand, and never concurrently with any of them.
    pub fn post<F: FnOnce() + Send + 'static>(&self, task: F) {
        self.post_boxed(Box::new(task));
    }

    /// Post a task guarded by a generation snapshot: if the generation has
    /// been cancelled by the time the task runs, nothing happens.
    pub fn post_cancellable<F: FnOnce() + Send + 'static>(&self, generation: Generation, task: F) {
        self.post(move || {
            if generation.is_current() {
                task();
            }
        });
    }

    fn post_boxed(&self, task: Task) {
        {
            let mut queue = self.core.queue.lock().expect("strand queue poisoned");
            queue.push_back(task);
        }
        self.wake();
    }

    fn wake(&self) {
        if !self.core.scheduled.swap(true, Ordering::AcqRel) {
            // pool shut down: tasks posted afterwards are dropped
            let _ = self.injector.send_blocking(self.core.clone());
        }
    }

    pub fn label(&self) -> &str {
        &self.core.label
    }
}

struct DelayedTask {
    deadline: Instant,
    strand: Strand,
    generation: Option<Generation>,
    task: Option<Task>,
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for DelayedTask {}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // min-heap on deadline
        other.deadline.cmp(&self.deadline)
    }
}

struct TimerShared {
    heap: Mutex<BinaryHeap<DelayedTask>>,
    wakeup: Condvar,
    shutdown: AtomicBool,
}

/// Fixed worker threads running a shared queue of runnable strands, plus a
/// timer thread feeding delayed posts back into their strands.
pub struct WorkPool {
    injector: Sender<Arc<StrandCore>>,
    workers: Vec<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    timer_shared: Arc<TimerShared>,
}

impl WorkPool {
    pub fn new(worker_count: usize) -> Self {
        let (injector, feed) = channel::unbounded::<Arc<StrandCore>>();

        let mut workers = Vec::with_capacity(worker_count.max(1));
        for index in 0..worker_count.max(1) {
            let feed: Receiver<Arc<StrandCore>> = feed.clone();
            let reinject = injector.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("parsec-worker-{}", index))
                    .spawn(move || worker_loop(feed, reinject))
                    .expect("failed to spawn worker thread"),
            );
        }

        let timer_shared = Arc::new(TimerShared {
            heap: Mutex::new(BinaryHeap::new()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let timer = {
            let shared = timer_shared.clone();
            std::thread::Builder::new()
                .name("parsec-timer".to_string())
                .spawn(move || timer_loop(shared))
                .expect("failed to spawn timer thread")
        };

        Self {
            injector,
            workers,
            timer: Some(timer),
            timer_shared,
        }
    }

    pub fn strand(&self, label: &str) -> Strand {
        Strand {
            core: Arc::new(StrandCore {
                label: label.to_string(),
                queue: Mutex::new(VecDeque::new()),
                scheduled: AtomicBool::new(false),
            }),
            injector: self.injector.clone(),
        }
    }

    /// Run a task on `strand` after `delay`, unless `generation` (if any)
    /// has been cancelled by then.
    pub fn post_delayed<F: FnOnce() + Send + 'static>(
        &self,
        strand: &Strand,
        delay: Duration,
        generation: Option<Generation>,
        task: F,
    ) {
        let entry = DelayedTask {
            deadline: Instant::now() + delay,
            strand: strand.clone(),
            generation,
            task: Some(Box::new(task)),
        };
        let mut heap = self.timer_shared.heap.lock().expect("timer heap poisoned");
        heap.push(entry);
        self.timer_shared.wakeup.notify_one();
    }

    /// Stop accepting work and join every thread. Queued tasks finish;
    /// pending delayed tasks are dropped.
    pub fn shutdown(mut self) {
        self.timer_shared.shutdown.store(true, Ordering::Release);
        self.timer_shared.wakeup.notify_one();
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
        self.injector.close();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(feed: Receiver<Arc<StrandCore>>, reinject: Sender<Arc<StrandCore>>) {
    while let Ok(core) = feed.recv_blocking() {
        run_strand_batch(&core);

        // hand the strand back if more work arrived, otherwise release it
        let more = {
            let queue = core.queue.lock().expect("strand queue poisoned");
            !queue.is_empty()
        };
        if more {
            let _ = reinject.send_blocking(core);
        } else {
            core.scheduled.store(false, Ordering::Release);
            // a post may have slipped in between the emptiness check and the
            // release; reclaim the schedule if so
            let raced = {
                let queue = core.queue.lock().expect("strand queue poisoned");
                !queue.is_empty()
            };
            if raced && !core.scheduled.swap(true, Ordering::AcqRel) {
                let _ = reinject.send_blocking(core);
            }
        }
    }
}

fn run_strand_batch(core: &Arc<StrandCore>) {
    for _ in 0..STRAND_BATCH {
        let task = {
            let mut queue = core.queue.lock().expect("strand queue poisoned");
            queue.pop_front()
        };
        match task {
            Some(task) => {
                trace!("strand {} running task", core.label);
                task();
            }
            None => break,
        }
    }
}

fn timer_loop(shared: Arc<TimerShared>) {
    let mut heap = shared.heap.lock().expect("timer heap poisoned");
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        let now = Instant::now();
        // fire everything due
        while let Some(front) = heap.peek() {
            if front.deadline > now {
                break;
            }
            let mut entry = heap.pop().expect("peeked entry");
            let task = entry.task.take().expect("task taken once");
            match entry.generation {
                Some(generation) => entry.strand.post_cancellable(generation, task),
                None => entry.strand.post_boxed(task),
            }
        }

        let wait = heap
            .peek()
            .map(|front| front.deadline.saturating_duration_since(now))
            .unwrap_or(Duration::from_millis(100));
        let (guard, _) = shared
            .wakeup
            .wait_timeout(heap, wait)
            .expect("timer heap poisoned");
        heap = guard;
    }
}
