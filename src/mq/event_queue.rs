//! Backpressure layer between producer threads and the loop thread.
//!
//! ```text
//!  producer thread                    loop thread
//!  ---------------                    -----------
//!  ready.pop() -> slot index
//!  fill slot message (predicate)
//!  signal(index) ~~~~~~~~~~~~~~~~~~~> on_msg(index)
//!                                       Ready -> ready.push(index)
//!                                       Delay -> kept until restore(index)
//! ```
//!
//! Slots are allocated once. A slot is either in the ready queue or in
//! flight, never both, so `ready_len() + in_flight_len() == size()`.

use super::message::{MqEvent, MqMsg};
use super::MqMachineState;
use crate::error::{MqError, MqResult};
use crossbeam::queue::ArrayQueue;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::error;

/// What the loop thread does with a slot after `on_msg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterAction {
    /// Fully handled, return the slot to the ready queue.
    Ready,
    /// Still needed (queued for a writer or waiting for a connection).
    Delay,
}

/// Receiving end of the slot signals, owned by the loop.
pub type SlotSignals = mpsc::UnboundedReceiver<usize>;

/// Pre-allocated message buffer paired with its in-flight marker.
#[derive(Debug)]
struct AsyncMsg {
    msg: Mutex<MqMsg>,
    in_flight: AtomicBool,
}

/// Fixed pool of message slots with a lock-free ready queue.
#[derive(Debug)]
pub struct MqEventQueue {
    ready: ArrayQueue<usize>,
    slots: Box<[AsyncMsg]>,
    signal: mpsc::UnboundedSender<usize>,
}

impl MqEventQueue {
    /// Allocates `size` slots whose buffers reserve `msg_capacity` bytes.
    pub fn new(size: usize, msg_capacity: usize) -> MqResult<(Self, SlotSignals)> {
        if size == 0 {
            return Err(MqError::IllegalArgs("send queue size must be non-zero".into()));
        }

        let ready = ArrayQueue::new(size);
        let slots: Box<[AsyncMsg]> = (0..size)
            .map(|_| AsyncMsg {
                msg: Mutex::new(MqMsg::with_capacity(msg_capacity)),
                in_flight: AtomicBool::new(false),
            })
            .collect();
        for index in 0..size {
            if ready.push(index).is_err() {
                return Err(MqError::BadAlloc("ready queue overflow".into()));
            }
        }

        let (signal, signals) = mpsc::unbounded_channel();
        Ok((
            Self {
                ready,
                slots,
                signal,
            },
            signals,
        ))
    }

    /// Total number of slots.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently free. Inaccurate while producers are active.
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Slots currently checked out. Inaccurate while producers are active.
    pub fn in_flight_len(&self) -> usize {
        self.size() - self.ready_len()
    }

    /// Checks out a slot, lets `predicate` fill it and signals the loop.
    ///
    /// Fails with `NotReady` when every slot is in flight and with `Canceled`
    /// when the predicate declines. A slot is never lost on failure.
    pub fn enqueue<F>(&self, predicate: F) -> MqResult<()>
    where
        F: FnOnce(&mut MqMsg) -> bool,
    {
        let index = self.ready.pop().ok_or(MqError::NotReady)?;
        let slot = &self.slots[index];
        slot.in_flight.store(true, Ordering::Release);

        let accepted = {
            let mut msg = slot.msg.lock();
            msg.clear();
            predicate(&mut msg)
        };
        if !accepted {
            self.release(index);
            return Err(MqError::Canceled);
        }

        if self.signal.send(index).is_err() {
            self.release(index);
            return Err(MqError::IllegalState(MqMachineState::Closed));
        }
        Ok(())
    }

    /// Copies `msg` into a slot.
    pub fn enqueue_msg(&self, msg: &MqMsg) -> MqResult<()> {
        self.enqueue(|slot| {
            slot.copy_from(msg);
            true
        })
    }

    /// Queues a close request behind the already queued messages.
    pub fn enqueue_close(&self) -> MqResult<()> {
        self.enqueue_event(MqEvent::Close)
    }

    /// Queues a write-side shutdown behind the already queued messages.
    pub fn enqueue_shutdown(&self) -> MqResult<()> {
        self.enqueue_event(MqEvent::Shutdown)
    }

    fn enqueue_event(&self, event: MqEvent) -> MqResult<()> {
        self.enqueue(|slot| {
            slot.event = event;
            true
        })
    }

    /// Message of slot `index`. Loop side only.
    pub fn slot(&self, index: usize) -> MutexGuard<'_, MqMsg> {
        self.slots[index].msg.lock()
    }

    /// Returns an in-flight slot to the ready queue.
    ///
    /// With `verify`, restoring a slot that is not in flight is rejected
    /// instead of corrupting the pool.
    pub fn restore(&self, index: usize, verify: bool) -> MqResult<()> {
        let slot = self
            .slots
            .get(index)
            .ok_or_else(|| MqError::IllegalArgs(format!("unknown slot {}", index)))?;
        if verify && !slot.in_flight.load(Ordering::Acquire) {
            return Err(MqError::IllegalArgs(format!("slot {} is not in flight", index)));
        }
        self.release(index);
        Ok(())
    }

    /// Returns every in-flight slot. Only valid once no producer, signal or
    /// writer can still reference a slot.
    pub fn reclaim_in_flight(&self) -> usize {
        let mut reclaimed = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.in_flight.load(Ordering::Acquire) {
                self.release(index);
                reclaimed += 1;
            }
        }
        reclaimed
    }

    fn release(&self, index: usize) {
        let slot = &self.slots[index];
        if !slot.in_flight.swap(false, Ordering::AcqRel) {
            error!("Slot {} released twice", index);
            return;
        }
        if self.ready.push(index).is_err() {
            error!("Ready queue overflow while releasing slot {}", index);
        }
    }
}
