//! Connection object for one wearable: owns the transport, serializes
//! compound actions, and exposes the primitive GATT operations.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OnceCell, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::LinkError;
use crate::router::NotificationRouter;
use crate::transport::{
    CCCD_UUID, CharacteristicRef, ENABLE_NOTIFICATIONS_VALUE, GattTransport, LinkEvent,
};

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(5_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Link-level tuning. The per-primitive timeout bounds every single wait
/// (write ack, read result, one notification); it is never cumulative.
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    pub operation_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

/// Predicate for [`LinkOps::await_notification`].
#[derive(Debug, Clone)]
pub enum NotificationMatcher {
    Exact(Vec<u8>),
    FirstByte(u8),
}

impl NotificationMatcher {
    fn matches(&self, payload: &[u8]) -> bool {
        match self {
            NotificationMatcher::Exact(expected) => payload == expected,
            NotificationMatcher::FirstByte(byte) => payload.first() == Some(byte),
        }
    }
}

/// Live sequence of raw notification payloads for one characteristic.
/// Ends when the link drops or another observer takes over the UUID.
pub struct NotificationStream {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl NotificationStream {
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// Caches the service-discovery result for the lifetime of the connection.
/// Discovery runs at most once; later lookups are pure map reads.
struct CharacteristicRegistry {
    characteristics: OnceCell<Vec<CharacteristicRef>>,
}

impl CharacteristicRegistry {
    fn new() -> Self {
        Self {
            characteristics: OnceCell::new(),
        }
    }

    async fn ensure_discovered<T: GattTransport>(
        &self,
        transport: &T,
        budget: Duration,
    ) -> Result<&[CharacteristicRef], LinkError> {
        let chars = self
            .characteristics
            .get_or_try_init(|| async {
                debug!("running service discovery");
                timeout(budget, transport.discover_services())
                    .await
                    .map_err(|_| LinkError::Timeout)?
                    .map_err(LinkError::Backend)
            })
            .await?;
        Ok(chars)
    }

    async fn lookup<T: GattTransport>(
        &self,
        transport: &T,
        budget: Duration,
        uuid: Uuid,
    ) -> Result<Option<CharacteristicRef>, LinkError> {
        let chars = self.ensure_discovered(transport, budget).await?;
        Ok(chars.iter().find(|c| c.uuid() == uuid).copied())
    }
}

/// One physical connection to a device.
///
/// All characteristic traffic goes through [`GattLink::perform`], which
/// holds the operation mutex for the whole block: compound actions from
/// concurrent tasks never interleave on the wire. `perform` is
/// non-reentrant; nesting it on the same link deadlocks.
pub struct GattLink<T: GattTransport> {
    transport: Arc<T>,
    router: Arc<NotificationRouter>,
    registry: Arc<CharacteristicRegistry>,
    state: Arc<watch::Sender<ConnectionState>>,
    serializer: Mutex<()>,
    config: LinkConfig,
    dispatcher: tokio::task::JoinHandle<()>,
}

impl<T: GattTransport> GattLink<T> {
    pub fn new(transport: T, config: LinkConfig) -> Self {
        let events = transport
            .take_events()
            .expect("transport event channel already taken");
        let router = Arc::new(NotificationRouter::new());
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let state = Arc::new(state);
        let dispatcher = tokio::spawn(dispatch_events(events, router.clone(), state.clone()));
        Self {
            transport: Arc::new(transport),
            router,
            registry: Arc::new(CharacteristicRegistry::new()),
            state,
            serializer: Mutex::new(()),
            config,
            dispatcher,
        }
    }

    /// Bring the link up: physical connection, then service discovery.
    /// The state only reads `Connected` once discovery succeeded.
    ///
    /// A link is single-shot; once torn down it cannot be reused.
    pub async fn connect(&self) -> Result<(), LinkError> {
        if *self.state.borrow() != ConnectionState::Disconnected || self.router.is_down() {
            return Err(LinkError::Backend(anyhow::anyhow!(
                "link already used; open a new link to reconnect"
            )));
        }
        self.state.send_replace(ConnectionState::Connecting);
        info!("connecting");
        if let Err(e) = self.transport.connect().await {
            self.state.send_replace(ConnectionState::Disconnected);
            return Err(LinkError::Backend(e));
        }
        match self
            .registry
            .ensure_discovered(self.transport.as_ref(), self.config.operation_timeout)
            .await
        {
            Ok(chars) => info!(characteristics = chars.len(), "service discovery complete"),
            Err(e) => {
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        }
        if self.router.is_down() {
            self.state.send_replace(ConnectionState::Disconnected);
            return Err(LinkError::Disconnected);
        }
        self.state.send_replace(ConnectionState::Connected);
        Ok(())
    }

    /// Tear the link down. Every suspended operation fails with
    /// [`LinkError::Disconnected`]; an in-flight upload is abandoned.
    pub async fn disconnect(&self) {
        info!("disconnecting");
        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "transport disconnect failed");
        }
        self.router.fail_all();
        self.state.send_replace(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Run a compound action under the operation mutex. The closure gets a
    /// capability handle limited to primitive GATT operations; the mutex is
    /// held until the returned future resolves and released on every exit
    /// path, including cancellation.
    pub async fn perform<F, Fut, R>(&self, actions: F) -> Result<R, LinkError>
    where
        F: FnOnce(LinkOps<T>) -> Fut,
        Fut: Future<Output = Result<R, LinkError>>,
    {
        let _guard = self.serializer.lock().await;
        actions(self.ops()).await
    }

    fn ops(&self) -> LinkOps<T> {
        LinkOps {
            transport: self.transport.clone(),
            router: self.router.clone(),
            registry: self.registry.clone(),
            state: self.state.subscribe(),
            config: self.config,
        }
    }
}

impl<T: GattTransport> Drop for GattLink<T> {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch_events(
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    router: Arc<NotificationRouter>,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    while let Some(event) = events.recv().await {
        if matches!(event, LinkEvent::Disconnected) {
            warn!("link lost");
            router.fail_all();
            state.send_replace(ConnectionState::Disconnected);
            continue;
        }
        router.dispatch(event);
    }
}

/// Primitive GATT operations, valid inside one `perform` block.
///
/// Every operation fails fast with [`LinkError::Disconnected`] when the
/// link is not connected, and with [`LinkError::Timeout`] when the peer
/// does not answer within the configured budget.
pub struct LinkOps<T: GattTransport> {
    transport: Arc<T>,
    router: Arc<NotificationRouter>,
    registry: Arc<CharacteristicRegistry>,
    state: watch::Receiver<ConnectionState>,
    config: LinkConfig,
}

impl<T: GattTransport> LinkOps<T> {
    fn ensure_connected(&self) -> Result<(), LinkError> {
        if *self.state.borrow() == ConnectionState::Connected {
            Ok(())
        } else {
            Err(LinkError::Disconnected)
        }
    }

    /// Resolve a characteristic by UUID from the cached discovery result.
    pub async fn find_characteristic(
        &self,
        uuid: Uuid,
    ) -> Result<Option<CharacteristicRef>, LinkError> {
        self.ensure_connected()?;
        self.registry
            .lookup(self.transport.as_ref(), self.config.operation_timeout, uuid)
            .await
    }

    /// Like [`Self::find_characteristic`], but an absent UUID is an error.
    pub async fn require_characteristic(
        &self,
        uuid: Uuid,
    ) -> Result<CharacteristicRef, LinkError> {
        self.find_characteristic(uuid)
            .await?
            .ok_or(LinkError::MissingCharacteristic(uuid))
    }

    pub async fn read(&self, char: &CharacteristicRef) -> Result<Option<Vec<u8>>, LinkError> {
        self.ensure_connected()?;
        debug!(uuid = %char.uuid(), "characteristic read");
        let slot = self.router.expect_read(char.uuid());
        if let Err(e) = self.transport.issue_read(char).await {
            self.router.clear_read(char.uuid());
            return Err(LinkError::Backend(e));
        }
        match timeout(self.config.operation_timeout, slot).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(LinkError::Disconnected),
            Err(_) => {
                self.router.clear_read(char.uuid());
                Err(LinkError::Timeout)
            }
        }
    }

    /// Write and wait for the acknowledgement. The echoed payload must
    /// equal the bytes sent; anything else means a stale or corrupted
    /// acknowledgement and fails the operation.
    pub async fn write(&self, char: &CharacteristicRef, bytes: &[u8]) -> Result<(), LinkError> {
        self.ensure_connected()?;
        debug!(uuid = %char.uuid(), len = bytes.len(), "characteristic write");
        let echoed = self
            .acknowledged_write(char.uuid(), || self.transport.issue_write(char, bytes))
            .await?;
        if echoed != bytes {
            return Err(LinkError::WriteVerificationFailed {
                uuid: char.uuid(),
                sent: bytes.to_vec(),
                echoed,
            });
        }
        Ok(())
    }

    /// Turn on notifications via the CCCD. The descriptor ack is keyed by
    /// the shared CCCD UUID and echo-verified like any other write.
    pub async fn enable_notifications(&self, char: &CharacteristicRef) -> Result<(), LinkError> {
        self.ensure_connected()?;
        debug!(uuid = %char.uuid(), "enabling notifications");
        let echoed = self
            .acknowledged_write(CCCD_UUID, || self.transport.enable_notifications(char))
            .await?;
        if echoed != ENABLE_NOTIFICATIONS_VALUE {
            return Err(LinkError::WriteVerificationFailed {
                uuid: CCCD_UUID,
                sent: ENABLE_NOTIFICATIONS_VALUE.to_vec(),
                echoed,
            });
        }
        Ok(())
    }

    async fn acknowledged_write<I, Fut>(
        &self,
        ack_uuid: Uuid,
        issue: I,
    ) -> Result<Vec<u8>, LinkError>
    where
        I: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let slot = self.router.expect_write(ack_uuid);
        if let Err(e) = issue().await {
            self.router.clear_write(ack_uuid);
            return Err(LinkError::Backend(e));
        }
        match timeout(self.config.operation_timeout, slot).await {
            Ok(Ok(echoed)) => Ok(echoed),
            Ok(Err(_)) => Err(LinkError::Disconnected),
            Err(_) => {
                self.router.clear_write(ack_uuid);
                Err(LinkError::Timeout)
            }
        }
    }

    /// Subscribe to raw notification payloads for one characteristic.
    /// One logical consumer per UUID: a new subscription replaces the
    /// previous one.
    pub fn observe(&self, char: &CharacteristicRef) -> NotificationStream {
        NotificationStream {
            rx: self.router.observe(char.uuid()),
        }
    }

    /// Consume the next notification matching the predicate, discarding
    /// non-matching payloads, within one timeout budget. Returns the
    /// matched payload.
    pub async fn await_notification(
        &self,
        char: &CharacteristicRef,
        matcher: NotificationMatcher,
    ) -> Result<Vec<u8>, LinkError> {
        self.ensure_connected()?;
        let uuid = char.uuid();
        let wait = async {
            loop {
                let value = self
                    .router
                    .next_change(uuid)
                    .await
                    .map_err(|_| LinkError::Disconnected)?;
                if matcher.matches(&value) {
                    return Ok(value);
                }
                debug!(%uuid, payload = ?value, "discarding non-matching notification");
            }
        };
        match timeout(self.config.operation_timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                self.router.clear_change(uuid);
                Err(LinkError::Timeout)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    use super::*;
    use crate::transport::mock::{MockHandle, MockTransport};

    pub(crate) async fn connected_link(
        characteristics: &[Uuid],
    ) -> (GattLink<MockTransport>, MockHandle) {
        let (transport, handle) = MockTransport::new(characteristics);
        let link = GattLink::new(transport, LinkConfig::default());
        link.connect().await.expect("mock connect");
        (link, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::testkit::connected_link;
    use crate::transport::mock::MockTransport;

    const CHAR_A: Uuid = Uuid::from_u128(0x2a19);
    const CHAR_B: Uuid = Uuid::from_u128(0x2a37);

    #[tokio::test]
    async fn connect_reaches_connected_after_discovery() {
        let (link, handle) = connected_link(&[CHAR_A]).await;
        assert_eq!(*link.state().borrow(), ConnectionState::Connected);
        assert_eq!(handle.discovery_calls(), 1);
    }

    #[tokio::test]
    async fn find_characteristic_is_cached() {
        let (link, handle) = connected_link(&[CHAR_A, CHAR_B]).await;
        let (first, second) = link
            .perform(|ops| async move {
                let first = ops.find_characteristic(CHAR_A).await?.unwrap();
                let second = ops.find_characteristic(CHAR_A).await?.unwrap();
                Ok((first, second))
            })
            .await
            .unwrap();
        assert_eq!(first, second);
        // One discovery at connect time, none for the lookups.
        assert_eq!(handle.discovery_calls(), 1);
    }

    #[tokio::test]
    async fn missing_characteristic_is_an_error() {
        let (link, _handle) = connected_link(&[CHAR_A]).await;
        let err = link
            .perform(|ops| async move { ops.require_characteristic(CHAR_B).await })
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::MissingCharacteristic(uuid) if uuid == CHAR_B));
    }

    #[tokio::test]
    async fn write_succeeds_on_matching_echo() {
        let (link, handle) = connected_link(&[CHAR_A]).await;
        link.perform(|ops| async move {
            let ch = ops.require_characteristic(CHAR_A).await?;
            ops.write(&ch, &[0x01, 0x04]).await
        })
        .await
        .unwrap();
        assert_eq!(handle.writes_to(CHAR_A), vec![vec![0x01, 0x04]]);
    }

    #[tokio::test]
    async fn write_fails_on_echo_mismatch() {
        let (link, handle) = connected_link(&[CHAR_A]).await;
        handle.ack_with(CHAR_A, &[0x01], &[0xff]);
        let err = link
            .perform(|ops| async move {
                let ch = ops.require_characteristic(CHAR_A).await?;
                ops.write(&ch, &[0x01]).await
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::WriteVerificationFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_write_times_out_at_the_budget() {
        let (link, handle) = connected_link(&[CHAR_A]).await;
        handle.drop_ack(CHAR_A, &[0x03]);
        let started = tokio::time::Instant::now();
        let err = link
            .perform(|ops| async move {
                let ch = ops.require_characteristic(CHAR_A).await?;
                ops.write(&ch, &[0x03]).await
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Timeout));
        assert_eq!(started.elapsed(), DEFAULT_OPERATION_TIMEOUT);
    }

    #[tokio::test]
    async fn read_returns_the_device_value() {
        let (link, handle) = connected_link(&[CHAR_A]).await;
        handle.set_read_value(CHAR_A, &[0x55]);
        let value = link
            .perform(|ops| async move {
                let ch = ops.require_characteristic(CHAR_A).await?;
                ops.read(&ch).await
            })
            .await
            .unwrap();
        assert_eq!(value, Some(vec![0x55]));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_read_times_out() {
        let (link, handle) = connected_link(&[CHAR_A]).await;
        handle.silence_reads(CHAR_A);
        let err = link
            .perform(|ops| async move {
                let ch = ops.require_characteristic(CHAR_A).await?;
                ops.read(&ch).await
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Timeout));
    }

    #[tokio::test]
    async fn enable_notifications_acks_through_the_descriptor() {
        let (link, handle) = connected_link(&[CHAR_A]).await;
        link.perform(|ops| async move {
            let ch = ops.require_characteristic(CHAR_A).await?;
            ops.enable_notifications(&ch).await
        })
        .await
        .unwrap();
        assert_eq!(
            handle.writes_to(CCCD_UUID),
            vec![ENABLE_NOTIFICATIONS_VALUE.to_vec()]
        );
    }

    #[tokio::test]
    async fn await_notification_discards_non_matching() {
        let (link, handle) = connected_link(&[CHAR_A]).await;
        let task = tokio::spawn(async move {
            link.perform(|ops| async move {
                let ch = ops.require_characteristic(CHAR_A).await?;
                ops.await_notification(&ch, NotificationMatcher::Exact(vec![0x10, 0x01, 0x01]))
                    .await
            })
            .await
        });
        tokio::task::yield_now().await;
        handle.push(LinkEvent::ValueChanged {
            uuid: CHAR_A,
            value: vec![0x11, 0x00],
        });
        tokio::task::yield_now().await;
        handle.push(LinkEvent::ValueChanged {
            uuid: CHAR_A,
            value: vec![0x10, 0x01, 0x01],
        });
        let matched = task.await.unwrap().unwrap();
        assert_eq!(matched, vec![0x10, 0x01, 0x01]);
    }

    #[tokio::test]
    async fn disconnect_fails_a_suspended_operation() {
        let (link, handle) = connected_link(&[CHAR_A]).await;
        handle.drop_ack(CHAR_A, &[0x02]);
        let link = Arc::new(link);
        let task = {
            let link = link.clone();
            tokio::spawn(async move {
                link.perform(|ops| async move {
                    let ch = ops.require_characteristic(CHAR_A).await?;
                    ops.write(&ch, &[0x02]).await
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        handle.push(LinkEvent::Disconnected);
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, LinkError::Disconnected));
        let mut state = link.state();
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn operations_fail_fast_when_not_connected() {
        let (transport, _handle) = MockTransport::new(&[CHAR_A]);
        let link = GattLink::new(transport, LinkConfig::default());
        let err = link
            .perform(|ops| async move {
                let ch = ops.find_characteristic(CHAR_A).await?;
                Ok(ch)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Disconnected));
    }

    #[tokio::test]
    async fn perform_blocks_are_mutually_exclusive() {
        let (link, _handle) = connected_link(&[CHAR_A]).await;
        let link = Arc::new(link);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let first = {
            let link = link.clone();
            let order = order.clone();
            tokio::spawn(async move {
                link.perform(|_ops| async move {
                    order.lock().unwrap().push("a-start");
                    tokio::task::yield_now().await;
                    tokio::task::yield_now().await;
                    order.lock().unwrap().push("a-end");
                    Ok(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        let second = {
            let link = link.clone();
            let order = order.clone();
            tokio::spawn(async move {
                link.perform(|_ops| async move {
                    order.lock().unwrap().push("b-start");
                    order.lock().unwrap().push("b-end");
                    Ok(())
                })
                .await
            })
        };

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["a-start", "a-end", "b-start", "b-end"]
        );
    }

    #[tokio::test]
    async fn observe_ends_when_the_link_drops() {
        let (link, handle) = connected_link(&[CHAR_A]).await;
        let mut stream = link
            .perform(|ops| async move {
                let ch = ops.require_characteristic(CHAR_A).await?;
                ops.enable_notifications(&ch).await?;
                Ok(ops.observe(&ch))
            })
            .await
            .unwrap();
        handle.push(LinkEvent::ValueChanged {
            uuid: CHAR_A,
            value: vec![42],
        });
        assert_eq!(stream.next().await, Some(vec![42]));
        handle.push(LinkEvent::Disconnected);
        assert_eq!(stream.next().await, None);
    }
}
