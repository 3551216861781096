//! Device identity metadata: type, name, firmware identifiers.
//!
//! These are the decoded shapes of the `DeviceTypeAndName` (0x0005) and
//! `DeviceInformation` (0x0003) feature responses.

use std::hash::{DefaultHasher, Hash, Hasher};

use num_enum::FromPrimitive;

use crate::frame::Frame;

/// The device type byte reported by the `DeviceTypeAndName` feature.
///
/// Values outside the known table surface as [`Self::Other`] rather than
/// being guessed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, FromPrimitive)]
#[repr(u8)]
pub enum DeviceType {
    Keyboard = 0,
    Numpad = 2,
    Mouse = 3,
    Touchpad = 4,
    Trackball = 5,
    Presenter = 6,
    Headset = 8,
    #[num_enum(default)]
    Other = 0xff,
}

impl DeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Keyboard => "keyboard",
            Self::Numpad => "numpad",
            Self::Mouse => "mouse",
            Self::Touchpad => "touchpad",
            Self::Trackball => "trackball",
            Self::Presenter => "presenter",
            Self::Headset => "headset",
            Self::Other => "other",
        }
    }
}

/// The identity block of the `DeviceInformation` feature.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FirmwareInfo {
    pub unit_id: [u8; 4],
    pub model_id: [u8; 5],
    pub serial_supported: bool,
}

impl FirmwareInfo {
    /// Decodes a firmware-info response: unit ID at params 1..5, model ID
    /// at params 7..12, serial capability bit in param 14.
    pub fn parse(frame: &Frame) -> Self {
        let mut unit_id = [0u8; 4];
        let mut model_id = [0u8; 5];
        for (i, byte) in unit_id.iter_mut().enumerate() {
            *byte = frame.param(1 + i);
        }
        for (i, byte) in model_id.iter_mut().enumerate() {
            *byte = frame.param(7 + i);
        }

        Self {
            unit_id,
            model_id,
            serial_supported: frame.param(14) & 1 != 0,
        }
    }

    pub fn unit_id_hex(&self) -> String {
        hex(&self.unit_id)
    }

    pub fn model_id_hex(&self) -> String {
        hex(&self.model_id)
    }

    /// The `unitId-modelId` identifier used when no serial is available.
    pub fn identifier(&self) -> String {
        format!("{}-{}", self.unit_id_hex(), self.model_id_hex())
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Decodes an ASCII metadata payload, trimming trailing NUL padding.
pub fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}

/// Decodes the serial-number response payload (12 ASCII bytes). Returns
/// [`None`] when the device sent an empty serial.
pub fn decode_serial(frame: &Frame) -> Option<String> {
    let serial = decode_text(&frame.params()[..frame.params().len().min(12)]);
    (!serial.is_empty()).then_some(serial)
}

/// The last-resort identifier: a stable hex hash of the device name.
pub fn hashed_identifier(device_name: &str) -> String {
    let mut hasher = DefaultHasher::new();
    device_name.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
