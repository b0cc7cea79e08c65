//! State shared between a node's public handle and its loop thread.

use super::event_queue::{MqEventQueue, SlotSignals};
use super::message::{MqEvent, MqId, MqMsg};
use super::params::MqParams;
use super::receive_queue::ReceiveQueue;
use super::{AtomicMachineState, MqInternal, MqMachineState};
use crate::error::{MqError, MqResult};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Decrements a producer counter when dropped.
struct ProducerGuard<'a>(&'a AtomicUsize);

impl<'a> ProducerGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ProducerGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Transport-agnostic core of a node.
///
/// Producers increment `sending`/`exiting` before looking at the machine
/// state, and the loop thread changes the state before waiting for those
/// counters to reach zero. Either the producer observes the new state or the
/// loop observes the producer, so no send slips past CLOSING and no exit
/// request slips past CLOSED.
pub struct MqBase {
    params: MqParams,
    internal: Arc<dyn MqInternal>,
    state: AtomicMachineState,
    sending: AtomicUsize,
    exiting: AtomicUsize,
    events: MqEventQueue,
    receives: ReceiveQueue,
    terminator: Notify,
    terminating: AtomicBool,
    /// Raised once RUNNING was reached; never cleared.
    activated: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl MqBase {
    /// Allocates the slot pool and receive queue. The returned signals belong
    /// to whichever transport runs the loop.
    pub fn new(
        params: MqParams,
        internal: Arc<dyn MqInternal>,
    ) -> MqResult<(Arc<Self>, SlotSignals)> {
        let (events, signals) = MqEventQueue::new(params.send_queue_size, params.packer_size)?;
        let receives = ReceiveQueue::new(params.recv_queue_size, params.recv_msg_size);
        let base = Arc::new(Self {
            params,
            internal,
            state: AtomicMachineState::new(MqMachineState::Initializing),
            sending: AtomicUsize::new(0),
            exiting: AtomicUsize::new(0),
            events,
            receives,
            terminator: Notify::new(),
            terminating: AtomicBool::new(false),
            activated: AtomicBool::new(false),
            local_addr: Mutex::new(None),
        });
        Ok((base, signals))
    }

    pub fn params(&self) -> &MqParams {
        &self.params
    }

    pub fn internal(&self) -> &dyn MqInternal {
        self.internal.as_ref()
    }

    pub fn events(&self) -> &MqEventQueue {
        &self.events
    }

    pub fn receives(&self) -> &ReceiveQueue {
        &self.receives
    }

    pub fn state(&self) -> MqMachineState {
        self.state.load()
    }

    /// True once the transport reached RUNNING, even if it closed since.
    pub fn was_activated(&self) -> bool {
        self.activated.load(Ordering::SeqCst)
    }

    /// Address a bound TCP transport listens on.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub(crate) fn set_local_addr(&self, addr: SocketAddr) {
        *self.local_addr.lock() = Some(addr);
    }

    // ---------------
    // Producer side.
    // ---------------

    /// Enqueues a copy of `msg`.
    pub fn send(&self, msg: &MqMsg) -> MqResult<()> {
        self.check_send_size(msg.size())?;
        self.send_with(|slot| {
            slot.copy_from(msg);
            true
        })
    }

    /// Enqueues a message built in place by `predicate`.
    pub fn send_with<F>(&self, predicate: F) -> MqResult<()>
    where
        F: FnOnce(&mut MqMsg) -> bool,
    {
        let _guard = ProducerGuard::enter(&self.sending);
        let state = self.state();
        if state != MqMachineState::Running {
            return Err(MqError::IllegalState(state));
        }

        let limit = self.params.send_msg_size;
        let mut too_large = None;
        let result = self.events.enqueue(|slot| {
            if !predicate(slot) {
                return false;
            }
            if slot.size() > limit {
                too_large = Some(slot.size());
                return false;
            }
            true
        });
        match (result, too_large) {
            (Err(MqError::Canceled), Some(size)) => Err(MqError::MessageTooLarge { size, limit }),
            (result, _) => result,
        }
    }

    /// Copies `data` into a slot addressed to `id`.
    pub fn send_bytes(&self, event: MqEvent, id: MqId, data: &[u8]) -> MqResult<()> {
        self.check_send_size(data.len())?;
        self.send_with(|slot| {
            slot.event = event;
            slot.id = id;
            slot.data.extend_from_slice(data);
            true
        })
    }

    /// Queues a close message behind the pending sends.
    pub fn send_close(&self) -> MqResult<()> {
        self.send_control(MqEvent::Close)
    }

    /// Queues a write-side shutdown behind the pending sends.
    pub fn send_shutdown(&self) -> MqResult<()> {
        self.send_control(MqEvent::Shutdown)
    }

    fn send_control(&self, event: MqEvent) -> MqResult<()> {
        let _guard = ProducerGuard::enter(&self.sending);
        let state = self.state();
        if state != MqMachineState::Running {
            return Err(MqError::IllegalState(state));
        }
        match event {
            MqEvent::Shutdown => self.events.enqueue_shutdown(),
            _ => self.events.enqueue_close(),
        }
    }

    fn check_send_size(&self, size: usize) -> MqResult<()> {
        if size > self.params.send_msg_size {
            return Err(MqError::MessageTooLarge {
                size,
                limit: self.params.send_msg_size,
            });
        }
        Ok(())
    }

    pub fn recv(&self, msg: &mut MqMsg) -> MqResult<()> {
        self.receives.dequeue(msg)
    }

    pub fn wait_recv(&self, msg: &mut MqMsg, timeout: Option<Duration>) -> MqResult<()> {
        self.receives.wait_dequeue(msg, timeout)
    }

    /// Blocks until the transport is RUNNING.
    pub fn wait_enable(&self, timeout: Option<Duration>) -> MqResult<()> {
        self.receives.wait_enabled(timeout)
    }

    /// Requests the close sequence. Safe from any thread; only the first
    /// request has an effect.
    pub fn exit(&self) -> MqResult<()> {
        let _guard = ProducerGuard::enter(&self.exiting);
        let state = self.state();
        if state.is_terminal() {
            return Err(MqError::IllegalState(state));
        }
        if self.terminating.swap(true, Ordering::SeqCst) {
            return Err(MqError::Closing);
        }
        self.terminator.notify_one();
        Ok(())
    }

    // ---------------
    // Loop side.
    // ---------------

    /// Resolves once `exit()` was called.
    pub(crate) async fn terminated(&self) {
        self.terminator.notified().await
    }

    /// INITIALIZING → RUNNING, raising the wait-enable flag.
    pub(crate) fn set_running(&self) {
        match self
            .state
            .transition(MqMachineState::Initializing, MqMachineState::Running)
        {
            Ok(()) => {
                self.activated.store(true, Ordering::SeqCst);
                self.receives.set_enabled(true);
                info!("MQ {} transport is running", self.params.mq_type);
            }
            Err(state) => warn!("MQ transport cannot start from state {}", state),
        }
    }

    /// Enters CLOSING and waits until no producer is inside `send()`.
    /// Returns `false` when the transport is already closing or closed.
    pub(crate) fn begin_closing(&self) -> bool {
        let state = self.state();
        if matches!(state, MqMachineState::Closing) || state.is_terminal() {
            return false;
        }
        self.state.store(MqMachineState::Closing);
        info!("MQ {} transport is closing", self.params.mq_type);
        spin_until_zero(&self.sending);
        true
    }

    /// Final step of the close sequence: returns every outstanding slot,
    /// enters CLOSED, cancels blocked receivers and notifies the owner.
    pub(crate) fn finish_closed(&self, signals: &mut SlotSignals) {
        signals.close();
        while let Ok(index) = signals.try_recv() {
            self.restore(index);
        }
        let reclaimed = self.events.reclaim_in_flight();
        if reclaimed > 0 {
            debug!("Reclaimed {} in-flight slots while closing", reclaimed);
        }

        self.state.store(MqMachineState::Closed);
        self.receives.set_enabled(false);
        spin_until_zero(&self.exiting);
        info!("MQ {} transport is closed", self.params.mq_type);
        self.internal.on_close();
    }

    /// Terminal failure before or outside the close sequence.
    pub(crate) fn fail(&self, signals: &mut SlotSignals) {
        signals.close();
        while let Ok(index) = signals.try_recv() {
            self.restore(index);
        }
        self.events.reclaim_in_flight();
        self.state.store(MqMachineState::Error);
        self.receives.set_enabled(false);
        spin_until_zero(&self.exiting);
    }

    /// Marks the machine as failed without touching the slot pool. Used when
    /// the loop itself could not run.
    pub(crate) fn mark_error(&self) {
        if !self.state().is_terminal() {
            self.state.store(MqMachineState::Error);
        }
        self.receives.set_enabled(false);
    }

    /// Returns a slot to the ready queue, logging verification failures.
    pub(crate) fn restore(&self, index: usize) {
        if let Err(e) = self
            .events
            .restore(index, self.params.verify_restore_message)
        {
            error!("Failed to restore slot {}: {}", index, e);
        }
    }

    /// Delivers an inbound message to `on_recv`, or to the receive queue when
    /// the callback does not consume it.
    pub(crate) fn deliver(&self, msg: &MqMsg) {
        if self.internal.on_recv(msg) {
            if self.params.verbose {
                debug!("Received message consumed by callback");
            }
            return;
        }

        match self.receives.enqueue(msg) {
            Ok(()) => {
                if self.params.verbose {
                    debug!(
                        "Received message queued ({} waiting)",
                        self.receives.len()
                    );
                }
            }
            Err(MqError::NotReady) => warn!(
                "Receive queue is full ({}), dropping message from {}",
                self.receives.capacity(),
                msg.id
            ),
            Err(e) => error!("Failed to queue received message: {}", e),
        }
    }
}

fn spin_until_zero(counter: &AtomicUsize) {
    while counter.load(Ordering::SeqCst) > 0 {
        std::thread::yield_now();
    }
}
