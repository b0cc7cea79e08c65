use anyhow::Result;
use mq_node::{
    Callbacks, MqError, MqInternal, MqMachineState, MqMode, MqMsg, MqNode, MqParams,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Messages come back out of a LOCAL node in send order.
#[test]
fn local_queue_preserves_order() -> Result<()> {
    let node = MqNode::bind("local://ordered?send_queue_size=8")?;

    let producer = thread::scope(|scope| {
        scope
            .spawn(|| -> Result<()> {
                for i in 0..500u32 {
                    loop {
                        match node.send_bytes(&i.to_le_bytes()) {
                            Ok(()) => break,
                            Err(MqError::NotReady) => thread::yield_now(),
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
                Ok(())
            })
            .join()
    });
    assert!(matches!(producer, Ok(Ok(()))));

    let mut msg = MqMsg::default();
    for i in 0..500u32 {
        node.wait_recv(&mut msg, Some(RECV_TIMEOUT))?;
        assert_eq!(msg.data, i.to_le_bytes());
    }
    Ok(())
}

/// Exactly one of many concurrent exit requests starts the close sequence.
#[test]
fn local_exit_is_idempotent_across_threads() -> Result<()> {
    let mut node = MqNode::bind("local://exit")?;

    let accepted = AtomicUsize::new(0);
    thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| match node.exit() {
                Ok(()) => {
                    accepted.fetch_add(1, Ordering::SeqCst);
                }
                Err(MqError::Closing) | Err(MqError::IllegalState(_)) => {}
                Err(e) => panic!("unexpected exit error: {}", e),
            });
        }
    });

    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    node.join()?;
    assert_eq!(node.state(), MqMachineState::Closed);
    assert!(matches!(
        node.exit(),
        Err(MqError::IllegalState(MqMachineState::Closed))
    ));
    Ok(())
}

/// A stalled receive callback holds every slot, so `send` reports NotReady
/// instead of growing the queue.
#[test]
fn local_send_backpressure() -> Result<()> {
    let gate = Arc::new((Mutex::new(false), Condvar::new()));
    let callbacks = Callbacks::default().with_recv_cb({
        let gate = gate.clone();
        move |_msg| {
            let (open, cond) = &*gate;
            let mut open = open.lock().unwrap();
            while !*open {
                open = cond.wait(open).unwrap();
            }
            false
        }
    });
    let params = MqParams {
        send_queue_size: 4,
        ..MqParams::local("backpressure")
    };
    let node = MqNode::new(params, MqMode::Bind, callbacks)?;

    for i in 0..4u8 {
        node.send_bytes(&[i])?;
    }
    assert!(matches!(node.send_bytes(&[4]), Err(MqError::NotReady)));
    assert_eq!(node.active_send_size(), 4);

    {
        let (open, cond) = &*gate;
        *open.lock().unwrap() = true;
        cond.notify_all();
    }

    let mut msg = MqMsg::default();
    for i in 0..4u8 {
        node.wait_recv(&mut msg, Some(RECV_TIMEOUT))?;
        assert_eq!(msg.data, vec![i]);
    }
    assert_eq!(node.active_recv_size(), 0);
    node.send_bytes(&[5])?;
    Ok(())
}

/// Messages consumed by the write callback never reach the receive side.
#[test]
fn local_write_callback_consumes_messages() -> Result<()> {
    let callbacks = Callbacks::default().with_write_cb(|msg| msg.data.starts_with(b"drop"));
    let node = MqNode::new(MqParams::local("filter"), MqMode::Bind, callbacks)?;

    node.send_bytes(b"drop me")?;
    node.send_bytes(b"keep me")?;

    let mut msg = MqMsg::default();
    node.wait_recv(&mut msg, Some(RECV_TIMEOUT))?;
    assert_eq!(msg.data, b"keep me");
    assert!(matches!(
        node.wait_recv(&mut msg, Some(Duration::from_millis(50))),
        Err(MqError::Timeout)
    ));
    Ok(())
}

#[derive(Default)]
struct CloseCounter {
    closed: AtomicUsize,
}

impl MqInternal for CloseCounter {
    fn on_close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// The close notification fires once, and blocked receivers are released.
#[test]
fn local_close_notifies_once_and_cancels_receivers() -> Result<()> {
    let counter = Arc::new(CloseCounter::default());
    let mut node = MqNode::with_handler(MqParams::local("closing"), MqMode::Bind, counter.clone())?;

    let blocked = thread::scope(|scope| {
        let waiter = scope.spawn(|| {
            let mut msg = MqMsg::default();
            node.wait_recv(&mut msg, None)
        });
        thread::sleep(Duration::from_millis(20));
        node.send_close().map(|_| waiter.join())
    })?;
    assert!(matches!(blocked, Ok(Err(MqError::Canceled))));

    node.join()?;
    assert_eq!(counter.closed.load(Ordering::SeqCst), 1);
    assert!(matches!(
        node.wait_enable(Some(Duration::from_millis(10))),
        Err(MqError::Timeout)
    ));
    drop(node);
    assert_eq!(counter.closed.load(Ordering::SeqCst), 1);
    Ok(())
}
