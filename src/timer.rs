//! One-shot timer service
//!
//! Every autonomous action in the bridge (effect ticks, the proxy scan timeout) is driven by
//! one-shot timers. The service owns a single dispatch thread; arming a timer pushes an entry
//! onto a deadline-ordered heap and the thread sleeps until the earliest deadline, then hands
//! the entry's message to the handler installed at construction. The handler runs on the
//! dispatch thread, which is the bridge's "timer task": it must not block for long, and it may
//! arm further timers through the [`TimerHandle`] it is given.
//!
//! Cancellation is lazy. [`TimerHandle::cancel`] marks the entry and the dispatch thread
//! drops it on pop, so a cancel that races the fire can still lose; users guard against that
//! with their own `running` flags (the effect scheduler does exactly this).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Identifier of one armed timer, used for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u64);

struct Entry<T> {
    deadline: Instant,
    id: u64,
    message: T,
}

// BinaryHeap is a max-heap; order entries by reversed deadline so the earliest pops first
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline).then(other.id.cmp(&self.id))
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl<T> Eq for Entry<T> {}

struct State<T> {
    heap: BinaryHeap<Entry<T>>,
    cancelled: HashSet<u64>,
    next_id: u64,
    shutdown: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    wakeup: Condvar,
}

/// Cloneable scheduling endpoint of a [`TimerService`]
pub struct TimerHandle<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TimerHandle<T> {
    fn clone(&self) -> Self {
        TimerHandle {
            inner: self.inner.clone(),
        }
    }
}

impl<T> TimerHandle<T> {
    /// Arm a one-shot timer
    pub fn schedule(&self, delay: Duration, message: T) -> TimerId {
        let mut state = lock(&self.inner.state);

        let id = state.next_id;

        state.next_id += 1;

        state.heap.push(Entry {
            deadline: Instant::now() + delay,
            id,
            message,
        });

        drop(state);

        self.inner.wakeup.notify_one();

        TimerId(id)
    }

    /// Cancel an armed timer
    ///
    /// A timer that already fired (or was already cancelled) is silently ignored.
    pub fn cancel(&self, id: TimerId) {
        let mut state = lock(&self.inner.state);

        if state.heap.iter().any(|entry| entry.id == id.0) {
            state.cancelled.insert(id.0);
        }
    }
}

/// The timer dispatch task
///
/// Dropping the service shuts the dispatch thread down; timers still pending at that point
/// never fire.
pub struct TimerService<T> {
    inner: Arc<Inner<T>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl<T: Send + 'static> TimerService<T> {
    /// Start the dispatch thread with the given fire handler
    pub fn new<F>(mut handler: F) -> Self
    where
        F: FnMut(&TimerHandle<T>, T) + Send + 'static,
    {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                cancelled: HashSet::new(),
                next_id: 0,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });

        let thread_inner = inner.clone();

        let thread = thread::Builder::new()
            .name("timer-dispatch".into())
            .spawn(move || {
                let handle = TimerHandle {
                    inner: thread_inner.clone(),
                };

                let mut state = lock(&thread_inner.state);

                loop {
                    if state.shutdown {
                        break;
                    }

                    let now = Instant::now();

                    match state.heap.peek().map(|entry| entry.deadline) {
                        Some(deadline) if deadline <= now => {
                            let entry = state.heap.pop().expect("peeked entry vanished");

                            if state.cancelled.remove(&entry.id) {
                                continue;
                            }

                            // fire without holding the lock, the handler may re-arm
                            drop(state);

                            handler(&handle, entry.message);

                            state = lock(&thread_inner.state);
                        }

                        Some(deadline) => {
                            let timeout = deadline - now;

                            state = thread_inner
                                .wakeup
                                .wait_timeout(state, timeout)
                                .unwrap_or_else(|e| e.into_inner())
                                .0;
                        }

                        None => {
                            state = thread_inner
                                .wakeup
                                .wait(state)
                                .unwrap_or_else(|e| e.into_inner());
                        }
                    }
                }
            })
            .expect("failed to spawn the timer dispatch thread");

        TimerService {
            inner,
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> TimerHandle<T> {
        TimerHandle {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Drop for TimerService<T> {
    fn drop(&mut self) {
        lock(&self.inner.state).shutdown = true;

        self.inner.wakeup.notify_one();

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// A panicked holder leaves the state consistent enough to continue; recover instead of
// poisoning every later fire.
fn lock<'a, T>(mutex: &'a Mutex<State<T>>) -> std::sync::MutexGuard<'a, State<T>> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
