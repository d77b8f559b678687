use thiserror::Error;
use uuid::Uuid;

/// Failures surfaced by link primitives and the DFU engine.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no response within the operation timeout")]
    Timeout,

    #[error("write echo mismatch on {uuid}: sent {sent:02x?}, acknowledged {echoed:02x?}")]
    WriteVerificationFailed {
        uuid: Uuid,
        sent: Vec<u8>,
        echoed: Vec<u8>,
    },

    #[error("link disconnected")]
    Disconnected,

    #[error("characteristic {0} not present on the device")]
    MissingCharacteristic(Uuid),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}
