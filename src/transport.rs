use anyhow::Result;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Client Characteristic Configuration descriptor. Acknowledgements for
/// notification-setup writes are keyed by this UUID on the event channel.
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD payload that turns notifications on.
pub const ENABLE_NOTIFICATIONS_VALUE: [u8; 2] = [0x01, 0x00];

/// Handle to a characteristic resolved by service discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicRef {
    pub(crate) service: Uuid,
    pub(crate) uuid: Uuid,
}

impl CharacteristicRef {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn service(&self) -> Uuid {
        self.service
    }
}

/// Completions and pushes coming up from the BLE stack.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A characteristic or descriptor write completed; `value` is the
    /// payload the peer acknowledged.
    WriteAck { uuid: Uuid, value: Vec<u8> },
    /// A characteristic read completed, possibly without a value.
    ReadResult { uuid: Uuid, value: Option<Vec<u8>> },
    /// Unsolicited value-change notification.
    ValueChanged { uuid: Uuid, value: Vec<u8> },
    /// The physical link dropped.
    Disconnected,
}

/// GATT client backend.
///
/// Requests are issued without blocking on their outcome; completions,
/// notifications and link loss arrive as [`LinkEvent`]s on the channel
/// handed out by `take_events`, in delivery order.
pub trait GattTransport: Send + Sync + 'static {
    /// Take the event receiver. Yields `Some` exactly once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>>;

    /// Establish the physical connection.
    async fn connect(&self) -> Result<()>;

    /// Tear the connection down.
    async fn disconnect(&self) -> Result<()>;

    /// Run service discovery and list every characteristic found.
    async fn discover_services(&self) -> Result<Vec<CharacteristicRef>>;

    /// Issue a characteristic read; the result arrives as [`LinkEvent::ReadResult`].
    async fn issue_read(&self, char: &CharacteristicRef) -> Result<()>;

    /// Issue a characteristic write; the echoed acknowledgement arrives as
    /// [`LinkEvent::WriteAck`] keyed by the characteristic UUID.
    async fn issue_write(&self, char: &CharacteristicRef, bytes: &[u8]) -> Result<()>;

    /// Ask the peer to start notifying; the descriptor acknowledgement
    /// arrives as [`LinkEvent::WriteAck`] keyed by [`CCCD_UUID`].
    async fn enable_notifications(&self, char: &CharacteristicRef) -> Result<()>;
}
