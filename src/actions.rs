//! Simple device actions: time sync, telemetry subscriptions, firmware
//! version, and notification relay. Each one is a thin serialized consumer
//! of the link primitives.

use chrono::{Datelike, NaiveDateTime, Timelike};
use num_enum::IntoPrimitive;
use tracing::debug;
use uuid::Uuid;

use crate::error::LinkError;
use crate::link::{GattLink, NotificationStream};
use crate::transport::GattTransport;

/// Write the given local timestamp to the Current Time characteristic.
pub async fn sync_time<T: GattTransport>(
    link: &GattLink<T>,
    now: NaiveDateTime,
) -> Result<(), LinkError> {
    let payload = encode_time(&now);
    debug!(timestamp = %now, "syncing time");
    link.perform(move |ops| async move {
        let time_char = ops.require_characteristic(uuids::CURRENT_TIME).await?;
        ops.write(&time_char, &payload).await
    })
    .await
}

/// Current Time payload: year LE, month, day, hour, minute, second,
/// ISO weekday, fractional-second in 1/256 units, and a trailing
/// update-reason byte.
fn encode_time(t: &NaiveDateTime) -> [u8; 10] {
    let year = t.year() as u16;
    let micros = t.nanosecond() / 1_000;
    let fraction = ((f64::from(micros) / 1e6 * 256.0).round() as u32) as u8;
    [
        (year & 0xff) as u8,
        (year >> 8) as u8,
        t.month() as u8,
        t.day() as u8,
        t.hour() as u8,
        t.minute() as u8,
        t.second() as u8,
        t.weekday().number_from_monday() as u8,
        fraction,
        0x01,
    ]
}

/// An initial characteristic read plus the live notification stream.
/// The stream stays usable after the setup block released the link for
/// other actions.
pub struct TelemetrySubscription {
    pub initial: Option<Vec<u8>>,
    pub updates: NotificationStream,
}

async fn subscribe_telemetry<T: GattTransport>(
    link: &GattLink<T>,
    uuid: Uuid,
) -> Result<TelemetrySubscription, LinkError> {
    link.perform(move |ops| async move {
        let ch = ops.require_characteristic(uuid).await?;
        ops.enable_notifications(&ch).await?;
        let updates = ops.observe(&ch);
        let initial = ops.read(&ch).await?;
        Ok(TelemetrySubscription { initial, updates })
    })
    .await
}

pub async fn battery_level<T: GattTransport>(
    link: &GattLink<T>,
) -> Result<TelemetrySubscription, LinkError> {
    subscribe_telemetry(link, uuids::BATTERY_LEVEL).await
}

/// Battery payloads carry the charge percentage in the first byte.
pub fn parse_battery_level(payload: &[u8]) -> u8 {
    payload.first().copied().unwrap_or(0)
}

pub async fn heart_rate<T: GattTransport>(
    link: &GattLink<T>,
) -> Result<TelemetrySubscription, LinkError> {
    subscribe_telemetry(link, uuids::HEART_RATE).await
}

/// Heart-rate payloads carry the measurement in the first two bytes,
/// big-endian.
pub fn parse_heart_rate(payload: &[u8]) -> u16 {
    match payload {
        [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
        _ => 0,
    }
}

pub async fn step_count<T: GattTransport>(
    link: &GattLink<T>,
) -> Result<TelemetrySubscription, LinkError> {
    subscribe_telemetry(link, uuids::STEP_COUNT).await
}

pub fn parse_step_count(payload: &[u8]) -> u32 {
    payload.first().copied().unwrap_or(0).into()
}

/// Read the firmware revision string.
pub async fn firmware_version<T: GattTransport>(
    link: &GattLink<T>,
) -> Result<Option<String>, LinkError> {
    link.perform(|ops| async move {
        let ch = ops.require_characteristic(uuids::FIRMWARE_REVISION).await?;
        Ok(ops
            .read(&ch)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    })
    .await
}

/// New Alert category codes understood by the watch.
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive)]
#[repr(u8)]
pub enum AlertCategory {
    Simple = 0x00,
    Email = 0x01,
    News = 0x02,
    Call = 0x03,
    MissedCall = 0x04,
    Sms = 0x05,
    Voicemail = 0x06,
    Schedule = 0x07,
    HighPriority = 0x08,
    InstantMessage = 0x09,
    All = 0xFF,
}

/// Push one notification to the watch via the New Alert characteristic.
pub async fn send_alert<T: GattTransport>(
    link: &GattLink<T>,
    category: AlertCategory,
    title: &str,
    body: &str,
) -> Result<(), LinkError> {
    let payload = encode_alert(category, title, body);
    link.perform(move |ops| async move {
        let alert_char = ops.require_characteristic(uuids::NEW_ALERT).await?;
        ops.write(&alert_char, &payload).await
    })
    .await
}

const ALERT_CONTENT_SEPARATOR: u8 = 0x00;

fn encode_alert(category: AlertCategory, title: &str, body: &str) -> Vec<u8> {
    let mut payload = vec![category.into(), 0x01, ALERT_CONTENT_SEPARATOR];
    payload.extend_from_slice(title.as_bytes());
    payload.push(ALERT_CONTENT_SEPARATOR);
    payload.extend_from_slice(body.as_bytes());
    payload
}

mod uuids {
    use uuid::Uuid;
    /// Current Time Characteristic
    pub const CURRENT_TIME: Uuid = Uuid::from_u128(0x00002a2b_0000_1000_8000_00805f9b34fb);
    /// Battery Level Characteristic
    pub const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);
    /// Heart Rate Measurement Characteristic
    pub const HEART_RATE: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);
    /// Vendor motion/step-count Characteristic
    pub const STEP_COUNT: Uuid = Uuid::from_u128(0x00030001_78fc_48fe_8e23_433b3a1942d0);
    /// Firmware Revision String Characteristic
    pub const FIRMWARE_REVISION: Uuid = Uuid::from_u128(0x00002a26_0000_1000_8000_00805f9b34fb);
    /// New Alert Characteristic
    pub const NEW_ALERT: Uuid = Uuid::from_u128(0x00002a46_0000_1000_8000_00805f9b34fb);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::testkit::connected_link;
    use crate::transport::LinkEvent;
    use chrono::NaiveDate;

    #[test]
    fn time_payload_layout() {
        let t = NaiveDate::from_ymd_opt(2022, 3, 5)
            .unwrap()
            .and_hms_micro_opt(14, 30, 45, 500_000)
            .unwrap();
        assert_eq!(
            encode_time(&t),
            // 2022 = 0x07e6, Saturday = 6, 0.5 s = 128/256
            [0xe6, 0x07, 3, 5, 14, 30, 45, 6, 128, 0x01]
        );
    }

    #[test]
    fn alert_payload_layout() {
        assert_eq!(
            encode_alert(AlertCategory::Sms, "Hi", "Yo"),
            vec![0x05, 0x01, 0x00, b'H', b'i', 0x00, b'Y', b'o']
        );
    }

    #[test]
    fn telemetry_parsers_tolerate_short_payloads() {
        assert_eq!(parse_battery_level(&[85]), 85);
        assert_eq!(parse_battery_level(&[]), 0);
        assert_eq!(parse_heart_rate(&[0x00, 0x48]), 72);
        assert_eq!(parse_heart_rate(&[0x48]), 0);
        assert_eq!(parse_step_count(&[42, 0, 0, 0]), 42);
    }

    #[tokio::test]
    async fn firmware_version_reads_utf8() {
        let (link, handle) = connected_link(&[uuids::FIRMWARE_REVISION]).await;
        handle.set_read_value(uuids::FIRMWARE_REVISION, b"1.11.0");
        assert_eq!(
            firmware_version(&link).await.unwrap(),
            Some("1.11.0".to_string())
        );
    }

    #[tokio::test]
    async fn battery_subscription_reads_then_streams() {
        let (link, handle) = connected_link(&[uuids::BATTERY_LEVEL]).await;
        handle.set_read_value(uuids::BATTERY_LEVEL, &[80]);

        let mut sub = battery_level(&link).await.unwrap();
        assert_eq!(sub.initial.as_deref().map(parse_battery_level), Some(80));

        handle.push(LinkEvent::ValueChanged {
            uuid: uuids::BATTERY_LEVEL,
            value: vec![79],
        });
        let update = sub.updates.next().await.unwrap();
        assert_eq!(parse_battery_level(&update), 79);
    }

    #[tokio::test]
    async fn alert_writes_through_the_new_alert_characteristic() {
        let (link, handle) = connected_link(&[uuids::NEW_ALERT]).await;
        send_alert(&link, AlertCategory::Call, "Mom", "Incoming")
            .await
            .unwrap();
        assert_eq!(
            handle.writes_to(uuids::NEW_ALERT),
            vec![encode_alert(AlertCategory::Call, "Mom", "Incoming")]
        );
    }
}
