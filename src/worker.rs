//! Single-thread task worker.
//!
//! Tasks are callbacks pushed from any thread; the worker runs them to
//! completion in push order. A callback that returns `true` is re-armed
//! at the tail of the list, which is how streaming loops keep running
//! without hogging the queue.

use std::thread;

use parking_lot::{
    Condvar,
    Mutex,
};

/// A worker task. Returning `true` re-arms the task at the tail.
pub type Task = Box<dyn FnMut() -> bool + Send>;

struct State {
    tasks: std::collections::VecDeque<Task>,
    halting: bool,
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
}

pub struct Worker {
    shared: std::sync::Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Worker {
    pub fn spawn(name: &str) -> Self {
        let shared = std::sync::Arc::new(Shared {
            state: Mutex::new(State {
                tasks: std::collections::VecDeque::new(),
                halting: false,
            }),
            wakeup: Condvar::new(),
        });

        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn({
                let shared = shared.clone();
                move || worker_thread(&shared)
            })
            .expect("failed to spawn worker thread");

        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Append a task and wake the worker. Pushing after `halt` is a
    /// no-op.
    pub fn push(&self, task: Task) {
        let mut state = self.shared.state.lock();
        if state.halting {
            return;
        }
        state.tasks.push_back(task);
        self.shared.wakeup.notify_one();
    }

    pub fn push_fn(&self, task: impl FnMut() -> bool + Send + 'static) {
        self.push(Box::new(task));
    }

    /// Request exit, drain remaining tasks and join. Idempotent and safe
    /// from any thread.
    pub fn halt(&self) {
        {
            let mut state = self.shared.state.lock();
            state.halting = true;
            self.shared.wakeup.notify_one();
        }

        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.halt();
    }
}

fn worker_thread(shared: &Shared) {
    loop {
        let mut task = {
            let mut state = shared.state.lock();
            loop {
                if let Some(task) = state.tasks.pop_front() {
                    break task;
                }
                if state.halting {
                    return;
                }
                shared.wakeup.wait(&mut state);
            }
        };

        let rearm = task();

        let mut state = shared.state.lock();
        // re-armed tasks are dropped during the halt drain
        if rearm && !state.halting {
            state.tasks.push_back(task);
        }
    }
}
