use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

/// A fixed set of worker threads executing one published function per
/// dispatch, barrier-synchronized: [`start_and_block`](Self::start_and_block)
/// returns only after every worker ran the function exactly once.
///
/// The group itself is not re-entrant; guard shared instances with a mutex
/// when dispatching from multiple threads.
pub struct ThreadGroup {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
}

struct Inner {
    state: Mutex<State>,
    dispatch: Condvar,
    done: Condvar,
}

struct State {
    job: Option<Job>,
    generation: u64,
    remaining: usize,
    shutdown: bool,
}

/// Wide pointer to the borrowed job. Sent to workers only while
/// `start_and_block` is parked on the `done` condvar, which bounds every use
/// to the lifetime of the borrow.
struct Job(&'static (dyn Fn(usize) + Sync));

unsafe impl Send for Job {}

fn lock(mutex: &Mutex<State>) -> MutexGuard<'_, State> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ThreadGroup {
    pub fn new(number_of_threads: usize) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                job: None,
                generation: 0,
                remaining: 0,
                shutdown: false,
            }),
            dispatch: Condvar::new(),
            done: Condvar::new(),
        });
        let workers = (0..number_of_threads.max(1))
            .map(|thread_index| {
                let inner = Arc::clone(&inner);
                std::thread::spawn(move || worker_loop(inner, thread_index))
            })
            .collect();
        Self { inner, workers }
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Run `job` once on every worker, passing each its thread index, and
    /// block until all of them signalled completion.
    pub fn start_and_block(&self, job: &(dyn Fn(usize) + Sync)) {
        // Safety: the erased lifetime never escapes this call. Workers only
        // touch the pointer between the dispatch below and the last
        // `remaining` decrement, and this function does not return before
        // `remaining` reaches zero.
        let job: &'static (dyn Fn(usize) + Sync) = unsafe { std::mem::transmute(job) };
        let mut state = lock(&self.inner.state);
        debug_assert!(state.job.is_none(), "thread group is not re-entrant");
        state.job = Some(Job(job));
        state.generation = state.generation.wrapping_add(1);
        state.remaining = self.workers.len();
        self.inner.dispatch.notify_all();
        while state.job.is_some() {
            state = self
                .inner
                .done
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

fn worker_loop(inner: Arc<Inner>, thread_index: usize) {
    let mut seen_generation = 0u64;
    loop {
        let job = {
            let mut state = lock(&inner.state);
            loop {
                if state.shutdown {
                    return;
                }
                if state.generation != seen_generation && state.job.is_some() {
                    break;
                }
                state = inner
                    .dispatch
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            seen_generation = state.generation;
            state
                .job
                .as_ref()
                .expect("dispatch signalled with no job")
                .0
        };
        job(thread_index);
        let mut state = lock(&inner.state);
        state.remaining -= 1;
        if 0 == state.remaining {
            state.job = None;
            inner.done.notify_all();
        }
    }
}

impl Drop for ThreadGroup {
    fn drop(&mut self) {
        {
            let mut state = lock(&self.inner.state);
            state.shutdown = true;
            self.inner.dispatch.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
