//! Thread-safe tagged message FIFO.
//!
//! Readers wait on a condition variable guarded by a mutex; every write
//! signals once. Messages from a single writer are delivered in write
//! order; no order is guaranteed across concurrent writers.

use std::{
    collections::VecDeque,
    time::{
        Duration,
        Instant,
    },
};

use parking_lot::{
    Condvar,
    Mutex,
};

use crate::message::{
    Message,
    MessageKind,
};

#[derive(Debug, Default)]
pub struct MessageQueue {
    state: Mutex<VecDeque<Message>>,
    readable: Condvar,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message. Never blocks.
    pub fn write(&self, message: Message) {
        let mut queue = self.state.lock();
        queue.push_back(message);
        self.readable.notify_one();
    }

    /// Block until a message is available.
    pub fn read(&self) -> Message {
        let mut queue = self.state.lock();
        loop {
            if let Some(message) = queue.pop_front() {
                return message;
            }
            self.readable.wait(&mut queue);
        }
    }

    /// Block up to `timeout` for a message.
    pub fn read_timeout(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.state.lock();
        loop {
            if let Some(message) = queue.pop_front() {
                return Some(message);
            }
            if self.readable.wait_until(&mut queue, deadline).timed_out() {
                return queue.pop_front();
            }
        }
    }

    /// Non-blocking check.
    pub fn poll(&self) -> Option<Message> {
        self.state.lock().pop_front()
    }

    /// Wait up to `timeout` for a message whose tag belongs to `kinds`.
    /// Messages with other tags stay queued for later readers.
    pub fn wait_for(&self, kinds: &[MessageKind], timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.state.lock();
        loop {
            if let Some(index) = queue.iter().position(|message| kinds.contains(&message.kind()))
            {
                return queue.remove(index);
            }
            if self.readable.wait_until(&mut queue, deadline).timed_out() {
                return None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }

    /// Drop every queued message.
    pub fn finalize(&self) {
        self.state.lock().clear();
    }
}
