//! btleplug-backed [`GattTransport`].
//!
//! btleplug resolves reads and writes as futures, so completions are
//! re-emitted here as [`LinkEvent`]s: the ack for a confirmed write echoes
//! the request payload, a subscribe call stands in for the CCCD descriptor
//! write, and the shared notification stream feeds `ValueChanged`.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::transport::{
    CCCD_UUID, CharacteristicRef, ENABLE_NOTIFICATIONS_VALUE, GattTransport, LinkEvent,
};

const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(30);

/// What to look for in advertisements: a MAC address if the identifier
/// parses as one, the advertised name otherwise.
enum Target {
    Address(BDAddr),
    Name(String),
}

impl Target {
    fn parse(identifier: &str) -> Self {
        match BDAddr::from_str(identifier) {
            Ok(addr) => Target::Address(addr),
            Err(_) => Target::Name(identifier.to_string()),
        }
    }

    fn matches(&self, properties: &PeripheralProperties) -> bool {
        match self {
            Target::Address(addr) => properties.address == *addr,
            Target::Name(name) => properties.local_name.as_deref() == Some(name.as_str()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Address(addr) => write!(f, "{addr}"),
            Target::Name(name) => f.write_str(name),
        }
    }
}

pub struct BtleplugTransport {
    adapter: Adapter,
    peripheral: Peripheral,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
}

impl BtleplugTransport {
    /// Scan until the target advertises, by MAC address or by name.
    pub async fn resolve(identifier: &str) -> Result<Self> {
        Self::resolve_with_timeout(identifier, DEFAULT_SCAN_TIMEOUT).await
    }

    pub async fn resolve_with_timeout(identifier: &str, scan_timeout: Duration) -> Result<Self> {
        let target = Target::parse(identifier);
        if cfg!(target_os = "macos") && matches!(target, Target::Address(_)) {
            anyhow::bail!("macOS hides MAC addresses; scan by advertised name instead");
        }

        let manager = btleplug::platform::Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(anyhow!("no usable Bluetooth adapter"))?;

        info!(%target, "scanning");
        let peripheral = scan_for(&adapter, &target, scan_timeout).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            adapter,
            peripheral,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    fn characteristic(&self, uuid: uuid::Uuid) -> Result<Characteristic> {
        for char in self.peripheral.characteristics() {
            if uuid == char.uuid {
                return Ok(char);
            }
        }
        Err(anyhow!("characteristic not found"))
    }
}

/// Watch advertisements until one matches the target. Covers devices that
/// fill in their name only on a later `DeviceUpdated` event. The scan is
/// always stopped, matched or not.
async fn scan_for(adapter: &Adapter, target: &Target, budget: Duration) -> Result<Peripheral> {
    adapter.start_scan(ScanFilter::default()).await?;
    let found = timeout(budget, async {
        let mut events = adapter.events().await?;
        while let Some(event) = events.next().await {
            let id = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                _ => continue,
            };
            let peripheral = adapter.peripheral(&id).await?;
            let Some(properties) = peripheral.properties().await? else {
                continue;
            };
            debug!(
                address = %properties.address,
                name = ?properties.local_name,
                rssi = ?properties.rssi,
                "advertisement"
            );
            if target.matches(&properties) {
                return Ok(peripheral);
            }
        }
        Err(anyhow!("advertisement stream ended mid-scan"))
    })
    .await;
    adapter.stop_scan().await?;
    match found {
        Ok(result) => result,
        Err(_) => Err(anyhow!(
            "`{target}` did not advertise within {}s",
            budget.as_secs()
        )),
    }
}

impl GattTransport for BtleplugTransport {
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    async fn connect(&self) -> Result<()> {
        self.peripheral
            .connect()
            .await
            .context("Failed to establish a connection")?;

        let mut notifications = self.peripheral.notifications().await?;
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let event = LinkEvent::ValueChanged {
                    uuid: notification.uuid,
                    value: notification.value,
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        });

        let mut events = self.adapter.events().await?;
        let id = self.peripheral.id();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(peripheral_id) = event {
                    if peripheral_id == id {
                        debug!("peripheral disconnected");
                        let _ = tx.send(LinkEvent::Disconnected);
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        let _ = self.events_tx.send(LinkEvent::Disconnected);
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<CharacteristicRef>> {
        self.peripheral
            .discover_services()
            .await
            .context("Service discovery failed")?;
        Ok(self
            .peripheral
            .characteristics()
            .into_iter()
            .map(|c| CharacteristicRef {
                service: c.service_uuid,
                uuid: c.uuid,
            })
            .collect())
    }

    async fn issue_read(&self, char: &CharacteristicRef) -> Result<()> {
        let c = self.characteristic(char.uuid())?;
        let value = self.peripheral.read(&c).await?;
        let _ = self.events_tx.send(LinkEvent::ReadResult {
            uuid: char.uuid(),
            value: Some(value),
        });
        Ok(())
    }

    async fn issue_write(&self, char: &CharacteristicRef, bytes: &[u8]) -> Result<()> {
        let c = self.characteristic(char.uuid())?;
        self.peripheral
            .write(&c, bytes, WriteType::WithResponse)
            .await?;
        // The platform confirmed the write; the ack echoes the request.
        let _ = self.events_tx.send(LinkEvent::WriteAck {
            uuid: char.uuid(),
            value: bytes.to_vec(),
        });
        Ok(())
    }

    async fn enable_notifications(&self, char: &CharacteristicRef) -> Result<()> {
        let c = self.characteristic(char.uuid())?;
        self.peripheral.subscribe(&c).await?;
        let _ = self.events_tx.send(LinkEvent::WriteAck {
            uuid: CCCD_UUID,
            value: ENABLE_NOTIFICATIONS_VALUE.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_parse_into_address_or_name() {
        assert!(matches!(
            Target::parse("E7:12:9C:55:A0:BB"),
            Target::Address(_)
        ));
        assert!(matches!(Target::parse("InfiniTime"), Target::Name(_)));
    }

    #[test]
    fn name_targets_match_exact_advertised_names() {
        let target = Target::parse("InfiniTime");
        let mut properties = PeripheralProperties::default();
        assert!(!target.matches(&properties));
        properties.local_name = Some("InfiniTime".to_string());
        assert!(target.matches(&properties));
        properties.local_name = Some("InfiniTime 2".to_string());
        assert!(!target.matches(&properties));
    }

    #[test]
    fn address_targets_ignore_names() {
        let target = Target::parse("E7:12:9C:55:A0:BB");
        let mut properties = PeripheralProperties::default();
        properties.local_name = Some("E7:12:9C:55:A0:BB".to_string());
        assert!(!target.matches(&properties));
        properties.address = BDAddr::from_str("E7:12:9C:55:A0:BB").unwrap();
        assert!(target.matches(&properties));
    }
}
