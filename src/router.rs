//! Demultiplexes the transport event stream into per-(UUID, kind) slots.
//!
//! Write acknowledgements, read results and value-change notifications can
//! share a UUID but never mix. Write/read slots are single-use: a value that
//! arrives before anyone waits for it is retained and resolves the next
//! waiter immediately; consumption removes it. The latest unobserved
//! notification per UUID is retained the same way, so an awaiter that
//! subscribes after the peer already answered still sees the payload.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};
use tracing::trace;
use uuid::Uuid;

use crate::transport::LinkEvent;

#[derive(Default)]
struct Slots {
    write_waiters: HashMap<Uuid, oneshot::Sender<Vec<u8>>>,
    write_retained: HashMap<Uuid, Vec<u8>>,
    read_waiters: HashMap<Uuid, oneshot::Sender<Option<Vec<u8>>>>,
    read_retained: HashMap<Uuid, Option<Vec<u8>>>,
    change_waiters: HashMap<Uuid, oneshot::Sender<Vec<u8>>>,
    change_observers: HashMap<Uuid, mpsc::UnboundedSender<Vec<u8>>>,
    change_retained: HashMap<Uuid, Vec<u8>>,
    down: bool,
}

#[derive(Default)]
pub(crate) struct NotificationRouter {
    slots: Mutex<Slots>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the write-ack slot for `uuid`. The returned receiver resolves
    /// with the echoed payload, or errors once the link goes down.
    pub fn expect_write(&self, uuid: Uuid) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots.lock().unwrap();
        if slots.down {
            return rx;
        }
        if let Some(value) = slots.write_retained.remove(&uuid) {
            let _ = tx.send(value);
        } else {
            let prev = slots.write_waiters.insert(uuid, tx);
            debug_assert!(prev.is_none(), "second write expectation for {uuid}");
        }
        rx
    }

    pub fn clear_write(&self, uuid: Uuid) {
        let mut slots = self.slots.lock().unwrap();
        slots.write_waiters.remove(&uuid);
        slots.write_retained.remove(&uuid);
    }

    pub fn expect_read(&self, uuid: Uuid) -> oneshot::Receiver<Option<Vec<u8>>> {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots.lock().unwrap();
        if slots.down {
            return rx;
        }
        if let Some(value) = slots.read_retained.remove(&uuid) {
            let _ = tx.send(value);
        } else {
            let prev = slots.read_waiters.insert(uuid, tx);
            debug_assert!(prev.is_none(), "second read expectation for {uuid}");
        }
        rx
    }

    pub fn clear_read(&self, uuid: Uuid) {
        let mut slots = self.slots.lock().unwrap();
        slots.read_waiters.remove(&uuid);
        slots.read_retained.remove(&uuid);
    }

    /// Take the next value-change notification for `uuid`, either the
    /// retained one or the next to arrive.
    pub fn next_change(&self, uuid: Uuid) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots.lock().unwrap();
        if slots.down {
            return rx;
        }
        if let Some(value) = slots.change_retained.remove(&uuid) {
            let _ = tx.send(value);
        } else {
            let prev = slots.change_waiters.insert(uuid, tx);
            debug_assert!(prev.is_none(), "second notification wait for {uuid}");
        }
        rx
    }

    pub fn clear_change(&self, uuid: Uuid) {
        self.slots.lock().unwrap().change_waiters.remove(&uuid);
    }

    /// Register the live observer for `uuid`, replacing any previous one.
    /// A retained notification is flushed into the new stream first.
    pub fn observe(&self, uuid: Uuid) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut slots = self.slots.lock().unwrap();
        if slots.down {
            return rx;
        }
        if let Some(value) = slots.change_retained.remove(&uuid) {
            let _ = tx.send(value);
        }
        slots.change_observers.insert(uuid, tx);
        rx
    }

    pub fn dispatch(&self, event: LinkEvent) {
        let mut slots = self.slots.lock().unwrap();
        if slots.down {
            return;
        }
        match event {
            LinkEvent::WriteAck { uuid, value } => {
                trace!(%uuid, len = value.len(), "write ack");
                match slots.write_waiters.remove(&uuid) {
                    Some(waiter) => {
                        let _ = waiter.send(value);
                    }
                    None => {
                        slots.write_retained.insert(uuid, value);
                    }
                }
            }
            LinkEvent::ReadResult { uuid, value } => {
                trace!(%uuid, "read result");
                match slots.read_waiters.remove(&uuid) {
                    Some(waiter) => {
                        let _ = waiter.send(value);
                    }
                    None => {
                        slots.read_retained.insert(uuid, value);
                    }
                }
            }
            LinkEvent::ValueChanged { uuid, value } => {
                trace!(%uuid, len = value.len(), "value changed");
                if let Some(waiter) = slots.change_waiters.remove(&uuid) {
                    let _ = waiter.send(value);
                } else {
                    match slots.change_observers.get(&uuid) {
                        Some(observer) => {
                            if let Err(mpsc::error::SendError(value)) = observer.send(value) {
                                slots.change_observers.remove(&uuid);
                                slots.change_retained.insert(uuid, value);
                            }
                        }
                        None => {
                            slots.change_retained.insert(uuid, value);
                        }
                    }
                }
            }
            LinkEvent::Disconnected => {
                drop(slots);
                self.fail_all();
            }
        }
    }

    /// Drop every waiter and observer and refuse new ones. Pending
    /// receivers resolve with an error, live streams end.
    pub fn fail_all(&self) {
        let mut slots = self.slots.lock().unwrap();
        slots.down = true;
        slots.write_waiters.clear();
        slots.write_retained.clear();
        slots.read_waiters.clear();
        slots.read_retained.clear();
        slots.change_waiters.clear();
        slots.change_observers.clear();
        slots.change_retained.clear();
    }

    pub fn is_down(&self) -> bool {
        self.slots.lock().unwrap().down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID_A: Uuid = Uuid::from_u128(0xa);
    const UUID_B: Uuid = Uuid::from_u128(0xb);

    #[tokio::test]
    async fn write_ack_resolves_waiter() {
        let router = NotificationRouter::new();
        let rx = router.expect_write(UUID_A);
        router.dispatch(LinkEvent::WriteAck {
            uuid: UUID_A,
            value: vec![1, 2],
        });
        assert_eq!(rx.await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn early_ack_is_retained_and_consumed_once() {
        let router = NotificationRouter::new();
        router.dispatch(LinkEvent::WriteAck {
            uuid: UUID_A,
            value: vec![7],
        });
        assert_eq!(router.expect_write(UUID_A).await.unwrap(), vec![7]);

        // The slot was consumed; a second expectation pends.
        let mut rx = router.expect_write(UUID_A);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ack_kinds_do_not_mix() {
        let router = NotificationRouter::new();
        router.dispatch(LinkEvent::WriteAck {
            uuid: UUID_A,
            value: vec![1],
        });
        let mut read = router.expect_read(UUID_A);
        assert!(read.try_recv().is_err());
    }

    #[tokio::test]
    async fn retained_notification_flushes_to_late_observer() {
        let router = NotificationRouter::new();
        router.dispatch(LinkEvent::ValueChanged {
            uuid: UUID_B,
            value: vec![0x11, 0x01],
        });
        let mut stream = router.observe(UUID_B);
        assert_eq!(stream.recv().await.unwrap(), vec![0x11, 0x01]);
    }

    #[tokio::test]
    async fn live_observer_receives_in_order() {
        let router = NotificationRouter::new();
        let mut stream = router.observe(UUID_B);
        for v in [vec![1], vec![2], vec![3]] {
            router.dispatch(LinkEvent::ValueChanged {
                uuid: UUID_B,
                value: v,
            });
        }
        assert_eq!(stream.recv().await.unwrap(), vec![1]);
        assert_eq!(stream.recv().await.unwrap(), vec![2]);
        assert_eq!(stream.recv().await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn resubscribing_replaces_the_observer() {
        let router = NotificationRouter::new();
        let mut first = router.observe(UUID_B);
        let mut second = router.observe(UUID_B);
        router.dispatch(LinkEvent::ValueChanged {
            uuid: UUID_B,
            value: vec![9],
        });
        assert!(first.recv().await.is_none());
        assert_eq!(second.recv().await.unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn fail_all_errors_waiters_and_ends_streams() {
        let router = NotificationRouter::new();
        let write = router.expect_write(UUID_A);
        let mut stream = router.observe(UUID_B);

        router.fail_all();

        assert!(write.await.is_err());
        assert!(stream.recv().await.is_none());
        assert!(router.expect_write(UUID_A).await.is_err());
    }
}
