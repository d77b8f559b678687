//! BLE link layer and legacy DFU engine for PineTime-class wearables.
//!
//! One [`GattLink`] owns one physical connection. Compound actions run
//! through [`GattLink::perform`], which serializes them on the wire; the
//! DFU engine in [`dfu`] and the device actions in [`actions`] are all
//! such actions.

pub mod actions;
pub mod dfu;
pub mod error;
pub mod link;
pub mod package;
mod router;
pub mod transport;
pub mod transport_btleplug;

pub use error::LinkError;
pub use link::{
    ConnectionState, GattLink, LinkConfig, LinkOps, NotificationMatcher, NotificationStream,
};
pub use transport::{CharacteristicRef, GattTransport, LinkEvent};
