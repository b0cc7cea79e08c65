use super::message::MqMsg;
use crate::error::{MqError, MqResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Inner {
    messages: VecDeque<MqMsg>,
    /// Recycled buffers, so steady-state receives do not allocate.
    free: Vec<MqMsg>,
    enabled: bool,
}

/// Bounded receive queue filled by the loop thread.
///
/// The same lock/condition pair guards the "enabled" flag that
/// `wait_enable` blocks on: it is raised when the transport reaches RUNNING
/// and dropped when it is CLOSED, which also cancels blocked receivers.
#[derive(Debug)]
pub struct ReceiveQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
    capacity: usize,
    max_msg_size: usize,
}

impl ReceiveQueue {
    pub fn new(capacity: usize, max_msg_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                messages: VecDeque::with_capacity(capacity),
                free: Vec::new(),
                enabled: false,
            }),
            cond: Condvar::new(),
            capacity,
            max_msg_size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queued messages.
    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `msg` into the queue and wakes one receiver.
    pub fn enqueue(&self, msg: &MqMsg) -> MqResult<()> {
        if msg.size() > self.max_msg_size {
            return Err(MqError::MessageTooLarge {
                size: msg.size(),
                limit: self.max_msg_size,
            });
        }

        let mut inner = self.inner.lock();
        if inner.messages.len() >= self.capacity {
            return Err(MqError::NotReady);
        }
        let mut entry = inner.free.pop().unwrap_or_default();
        entry.copy_from(msg);
        inner.messages.push_back(entry);
        drop(inner);

        self.cond.notify_one();
        Ok(())
    }

    /// Moves the oldest message into `msg`; `NotReady` when empty.
    pub fn dequeue(&self, msg: &mut MqMsg) -> MqResult<()> {
        let mut inner = self.inner.lock();
        Self::pop_into(&mut inner, msg)
    }

    /// Blocks until a message arrives, the queue is disabled (`Canceled`)
    /// or `timeout` expires (`Timeout`). `None` waits without limit.
    pub fn wait_dequeue(&self, msg: &mut MqMsg, timeout: Option<Duration>) -> MqResult<()> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut inner = self.inner.lock();
        loop {
            if Self::pop_into(&mut inner, msg).is_ok() {
                return Ok(());
            }
            if !inner.enabled {
                return Err(MqError::Canceled);
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut inner, deadline).timed_out() {
                        return Self::pop_into(&mut inner, msg).map_err(|_| MqError::Timeout);
                    }
                }
                None => self.cond.wait(&mut inner),
            }
        }
    }

    /// Raises or drops the enabled flag and wakes every waiter.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.lock().enabled = enabled;
        self.cond.notify_all();
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Blocks until the flag is raised or `timeout` expires.
    pub fn wait_enabled(&self, timeout: Option<Duration>) -> MqResult<()> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut inner = self.inner.lock();
        while !inner.enabled {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut inner, deadline).timed_out() && !inner.enabled {
                        return Err(MqError::Timeout);
                    }
                }
                None => self.cond.wait(&mut inner),
            }
        }
        Ok(())
    }

    fn pop_into(inner: &mut Inner, msg: &mut MqMsg) -> MqResult<()> {
        let mut entry = inner.messages.pop_front().ok_or(MqError::NotReady)?;
        std::mem::swap(msg, &mut entry);
        entry.clear();
        inner.free.push(entry);
        Ok(())
    }
}
