//! Legacy (unauthenticated) nRF DFU upload, as spoken by PineTime-class
//! bootloaders.
//!
//! The exchange is linear: one control-point command per phase, each either
//! acknowledged at the GATT level or answered with a `0x10` response
//! notification, then the image streamed in 20-byte packet writes with a
//! `0x11` packet-receipt notification expected every `ack_interval`
//! segments.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::link::{GattLink, LinkOps, NotificationMatcher};
use crate::package::FirmwarePackage;
use crate::transport::{CharacteristicRef, GattTransport};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Image segment carried by one packet write.
const SEGMENT_SIZE: usize = 20;

/// Control-point opcodes of the legacy DFU protocol.
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive)]
#[repr(u8)]
enum OpCode {
    StartDfu = 0x01,
    InitDfuParams = 0x02,
    ReceiveFirmwareImage = 0x03,
    ValidateFirmware = 0x04,
    ActivateAndReset = 0x05,
    ReceiptNotifSet = 0x08,
    Response = 0x10,
    PacketReceipt = 0x11,
}

/// StartDfu argument selecting the application image.
const IMAGE_APPLICATION: u8 = 0x04;
/// InitDfuParams arguments.
const INIT_PACKET_START: u8 = 0x00;
const INIT_PACKET_COMPLETE: u8 = 0x01;

/// Status byte of a `0x10` response notification.
#[derive(Error, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
enum ResponseCode {
    #[error("success (not an error)")]
    Success = 0x01,
    #[error("invalid state")]
    InvalidState = 0x02,
    #[error("not supported")]
    NotSupported = 0x03,
    #[error("data size exceeds limit")]
    DataSizeExceedsLimit = 0x04,
    #[error("CRC error")]
    CrcError = 0x05,
    #[error("operation failed")]
    OperationFailed = 0x06,
}

/// Engine tuning. The receipt interval is device-firmware dependent (10 and
/// 100 are both seen in the wild), so it stays configurable.
#[derive(Debug, Clone, Copy)]
pub struct DfuConfig {
    /// Packet-receipt-notification cadence, in segments. Must fit in one
    /// byte on the wire.
    pub ack_interval: u32,
}

impl Default for DfuConfig {
    fn default() -> Self {
        Self { ack_interval: 100 }
    }
}

/// Upload progress, one event per phase entry and per segment sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DfuPhase {
    Start,
    InitPacket,
    SizeNegotiation,
    SizeAck,
    SelectFirmwareObject,
    SendInitData,
    SendInitAck,
    ConfigureAckInterval,
    Ready,
    Transfer { bytes_sent: u64, total_bytes: u64 },
    AwaitTransferValidation,
    ActivateCommand,
    AwaitActivateAck,
    Finalizing,
    Done,
    Failed(String),
}

impl DfuPhase {
    pub fn description(&self) -> &'static str {
        match self {
            DfuPhase::Start => "Starting firmware update",
            DfuPhase::InitPacket => "Initializing update",
            DfuPhase::SizeNegotiation => "Sending firmware size",
            DfuPhase::SizeAck => "Awaiting size confirmation",
            DfuPhase::SelectFirmwareObject => "Preparing init packet",
            DfuPhase::SendInitData => "Sending init packet",
            DfuPhase::SendInitAck => "Awaiting init packet confirmation",
            DfuPhase::ConfigureAckInterval => "Negotiating receipt interval",
            DfuPhase::Ready => "Preparing to send firmware",
            DfuPhase::Transfer { .. } => "Sending firmware",
            DfuPhase::AwaitTransferValidation => "Awaiting image validation",
            DfuPhase::ActivateCommand => "Validating image",
            DfuPhase::AwaitActivateAck => "Awaiting validation confirmation",
            DfuPhase::Finalizing => "Activating new firmware",
            DfuPhase::Done => "Firmware update complete",
            DfuPhase::Failed(_) => "Firmware update failed",
        }
    }
}

/// Bookkeeping for one upload attempt.
struct DfuSession {
    phase: DfuPhase,
    bytes_sent: u64,
    total_bytes: u64,
    ack_interval: u32,
    ack_countdown: u32,
}

/// Drives one upload attempt over an already-connected link. A failed
/// attempt is not resumable; retrying starts over from the first phase.
pub struct DfuUploadEngine<'a, T: GattTransport> {
    ops: &'a LinkOps<T>,
    progress: mpsc::UnboundedSender<DfuPhase>,
    session: DfuSession,
}

impl<'a, T: GattTransport> DfuUploadEngine<'a, T> {
    pub fn new(
        ops: &'a LinkOps<T>,
        config: DfuConfig,
        progress: mpsc::UnboundedSender<DfuPhase>,
    ) -> Self {
        Self {
            ops,
            progress,
            session: DfuSession {
                phase: DfuPhase::Start,
                bytes_sent: 0,
                total_bytes: 0,
                ack_interval: config.ack_interval,
                ack_countdown: config.ack_interval,
            },
        }
    }

    pub async fn run(mut self, package: &FirmwarePackage) -> Result<(), LinkError> {
        match self.upload(package).await {
            Ok(()) => {
                self.emit(DfuPhase::Done);
                Ok(())
            }
            Err(e) => {
                warn!(phase = self.session.phase.description(), error = %e, "upload failed");
                self.emit(DfuPhase::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn upload(&mut self, package: &FirmwarePackage) -> Result<(), LinkError> {
        if package.image_data.is_empty() {
            return Err(LinkError::ProtocolViolation("empty firmware image".into()));
        }
        if !(1..=255).contains(&self.session.ack_interval) {
            return Err(LinkError::ProtocolViolation(format!(
                "receipt interval {} does not fit in one byte",
                self.session.ack_interval
            )));
        }

        let ctrl = self.ops.require_characteristic(uuids::CONTROL_POINT).await?;
        let packet = self.ops.require_characteristic(uuids::PACKET).await?;
        self.session.total_bytes = package.image_data.len() as u64;

        self.emit(DfuPhase::Start);
        self.ops.enable_notifications(&ctrl).await?;

        self.emit(DfuPhase::InitPacket);
        self.ops
            .write(&ctrl, &[OpCode::StartDfu.into(), IMAGE_APPLICATION])
            .await?;

        self.emit(DfuPhase::SizeNegotiation);
        self.ops
            .write(&packet, &size_request(package.image_data.len() as u32))
            .await?;
        self.emit(DfuPhase::SizeAck);
        self.await_response(&ctrl, OpCode::StartDfu).await?;

        self.emit(DfuPhase::SelectFirmwareObject);
        self.ops
            .write(&ctrl, &[OpCode::InitDfuParams.into(), INIT_PACKET_START])
            .await?;

        self.emit(DfuPhase::SendInitData);
        self.ops.write(&packet, &package.init_data).await?;
        self.ops
            .write(&ctrl, &[OpCode::InitDfuParams.into(), INIT_PACKET_COMPLETE])
            .await?;
        self.emit(DfuPhase::SendInitAck);
        self.await_response(&ctrl, OpCode::InitDfuParams).await?;

        self.emit(DfuPhase::ConfigureAckInterval);
        self.ops
            .write(
                &ctrl,
                &[OpCode::ReceiptNotifSet.into(), self.session.ack_interval as u8],
            )
            .await?;

        self.emit(DfuPhase::Ready);
        self.ops
            .write(&ctrl, &[OpCode::ReceiveFirmwareImage.into()])
            .await?;

        self.transfer(&ctrl, &packet, &package.image_data).await?;

        self.emit(DfuPhase::AwaitTransferValidation);
        self.await_response(&ctrl, OpCode::ReceiveFirmwareImage).await?;

        self.emit(DfuPhase::ActivateCommand);
        self.ops
            .write(&ctrl, &[OpCode::ValidateFirmware.into()])
            .await?;
        self.emit(DfuPhase::AwaitActivateAck);
        self.await_response(&ctrl, OpCode::ValidateFirmware).await?;

        self.emit(DfuPhase::Finalizing);
        // The device reboots into the new image right away and usually
        // never acknowledges this one.
        if let Err(e) = self
            .ops
            .write(&ctrl, &[OpCode::ActivateAndReset.into()])
            .await
        {
            warn!(error = %e, "activate-and-reset not acknowledged");
        }
        Ok(())
    }

    /// Stream the image in fixed-size segments, pausing for a packet
    /// receipt at every `ack_interval` boundary. The final segment may be
    /// short and ends the transfer without a receipt wait.
    async fn transfer(
        &mut self,
        ctrl: &CharacteristicRef,
        packet: &CharacteristicRef,
        image: &[u8],
    ) -> Result<(), LinkError> {
        self.session.ack_countdown = self.session.ack_interval;
        for segment in image.chunks(SEGMENT_SIZE) {
            self.ops.write(packet, segment).await?;
            self.session.bytes_sent += segment.len() as u64;
            debug_assert!(self.session.bytes_sent <= self.session.total_bytes);
            self.emit(DfuPhase::Transfer {
                bytes_sent: self.session.bytes_sent,
                total_bytes: self.session.total_bytes,
            });
            if self.session.bytes_sent == self.session.total_bytes {
                break;
            }
            self.session.ack_countdown -= 1;
            if self.session.ack_countdown == 0 {
                self.session.ack_countdown = self.session.ack_interval;
                let receipt = self
                    .ops
                    .await_notification(
                        ctrl,
                        NotificationMatcher::FirstByte(OpCode::PacketReceipt.into()),
                    )
                    .await?;
                debug!(payload = ?receipt, "packet receipt");
            }
        }
        assert_eq!(
            self.session.bytes_sent, self.session.total_bytes,
            "segment accounting out of step"
        );
        Ok(())
    }

    async fn await_response(
        &self,
        ctrl: &CharacteristicRef,
        request: OpCode,
    ) -> Result<(), LinkError> {
        let frame = self
            .ops
            .await_notification(ctrl, NotificationMatcher::FirstByte(OpCode::Response.into()))
            .await?;
        verify_response(request, &frame)
    }

    fn emit(&mut self, phase: DfuPhase) {
        match &phase {
            DfuPhase::Transfer {
                bytes_sent,
                total_bytes,
            } => debug!(bytes_sent, total_bytes, "transfer progress"),
            other => info!(phase = other.description(), "dfu phase"),
        }
        self.session.phase = phase.clone();
        let _ = self.progress.send(phase);
    }
}

/// Run a whole upload as one serialized compound action against the link.
pub async fn run_upload<T: GattTransport>(
    link: &GattLink<T>,
    package: &FirmwarePackage,
    config: DfuConfig,
    progress: mpsc::UnboundedSender<DfuPhase>,
) -> Result<(), LinkError> {
    link.perform(move |ops| async move {
        DfuUploadEngine::new(&ops, config, progress)
            .run(package)
            .await
    })
    .await
}

/// Size-negotiation payload: 8 zero bytes, then the image size as a
/// little-endian u32.
fn size_request(image_len: u32) -> [u8; 12] {
    let mut payload = [0u8; 12];
    payload[8..].copy_from_slice(&image_len.to_le_bytes());
    payload
}

fn verify_response(request: OpCode, frame: &[u8]) -> Result<(), LinkError> {
    if frame.len() < 3 || frame[0] != u8::from(OpCode::Response) {
        return Err(LinkError::ProtocolViolation(format!(
            "malformed response {frame:02x?}"
        )));
    }
    if frame[1] != u8::from(request) {
        return Err(LinkError::ProtocolViolation(format!(
            "response for unexpected request ({frame:02x?}, awaiting {request:?})"
        )));
    }
    match ResponseCode::try_from(frame[2]) {
        Ok(ResponseCode::Success) => Ok(()),
        Ok(code) => Err(LinkError::ProtocolViolation(format!(
            "{request:?} rejected: {code}"
        ))),
        Err(_) => Err(LinkError::ProtocolViolation(format!(
            "unknown response status {:#04x}",
            frame[2]
        ))),
    }
}

/// Legacy DFU service & characteristic UUIDs.
#[allow(dead_code)]
mod uuids {
    use uuid::Uuid;
    /// DFU Service
    pub const SERVICE: Uuid = Uuid::from_u128(0x00001530_1212_efde_1523_785feabcd123);
    /// Control Point Characteristic
    pub const CONTROL_POINT: Uuid = Uuid::from_u128(0x00001531_1212_efde_1523_785feabcd123);
    /// Packet Characteristic
    pub const PACKET: Uuid = Uuid::from_u128(0x00001532_1212_efde_1523_785feabcd123);
}
