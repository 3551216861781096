//! Battery capabilities and their wire decodings.
//!
//! A device exposes at most one of three battery features; a fixed priority
//! picks which one the daemon binds. Each variant knows how to query the
//! device and how to parse the unsolicited events it broadcasts.

use std::collections::HashMap;

use num_enum::TryFromPrimitive;

use crate::{
    backoff::BackoffProfile,
    cancel::CancelToken,
    correlator::Correlator,
    frame::Frame,
    nibble::U4,
};

pub mod status;
pub mod unified;
pub mod voltage;

pub use status::BatteryStatusFeature;
pub use unified::UnifiedBatteryFeature;
pub use voltage::BatteryVoltageFeature;

/// The `BatteryStatus` feature ID.
pub const FEATURE_BATTERY_STATUS: u16 = 0x1000;

/// The `BatteryVoltage` feature ID.
pub const FEATURE_BATTERY_VOLTAGE: u16 = 0x1001;

/// The `UnifiedBattery` feature ID.
pub const FEATURE_UNIFIED_BATTERY: u16 = 0x1004;

/// The binding priority: earlier entries win when a device exposes several
/// battery features.
const SELECTION_PRIORITY: [u16; 3] = [
    FEATURE_BATTERY_STATUS,
    FEATURE_BATTERY_VOLTAGE,
    FEATURE_UNIFIED_BATTERY,
];

/// The charging state reported to the telemetry consumer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PowerStatus {
    Discharging,
    Charging,
    Full,
    NotCharging,
    Unknown,
}

impl PowerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discharging => "discharging",
            Self::Charging => "charging",
            Self::Full => "full",
            Self::NotCharging => "not_charging",
            Self::Unknown => "unknown",
        }
    }
}

/// One battery measurement. `-1` marks unknown values for both the
/// percentage and the voltage.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BatteryReading {
    /// Charge in percent, `0..=100`, or `-1` when unknown/offline.
    pub percentage: i16,

    pub status: PowerStatus,

    /// Battery voltage in millivolts, or `-1` when the feature does not
    /// report it.
    pub millivolts: i32,
}

impl BatteryReading {
    /// The reading published when a device goes offline.
    pub fn offline() -> Self {
        Self {
            percentage: -1,
            status: PowerStatus::Unknown,
            millivolts: -1,
        }
    }
}

/// The raw status values of the unified battery status byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, TryFromPrimitive)]
#[repr(u8)]
enum UnifiedStatus {
    Discharging = 0,
    Charging = 1,
    ChargingSlow = 2,
    Full = 3,
    ChargingError = 4,
}

/// Decodes the status byte shared by the 0x1000 and 0x1004 features.
///
/// The charging-error value is coalesced into plain charging; everything
/// outside the known table reads as not charging.
pub fn decode_unified_status(raw: u8) -> PowerStatus {
    match UnifiedStatus::try_from(raw) {
        Ok(UnifiedStatus::Discharging) => PowerStatus::Discharging,
        Ok(UnifiedStatus::Charging)
        | Ok(UnifiedStatus::ChargingSlow)
        | Ok(UnifiedStatus::ChargingError) => PowerStatus::Charging,
        Ok(UnifiedStatus::Full) => PowerStatus::Full,
        Err(_) => PowerStatus::NotCharging,
    }
}

/// Decodes the 0x1001 voltage-feature flags byte. Bit 7 marks external
/// power; without it the device is discharging.
pub fn decode_voltage_status(flags: u8) -> PowerStatus {
    if flags & 0x80 == 0 {
        return PowerStatus::Discharging;
    }

    match flags & 0x07 {
        0 => PowerStatus::Charging,
        1 => PowerStatus::Full,
        2 => PowerStatus::NotCharging,
        _ => PowerStatus::Unknown,
    }
}

/// Checks a battery level-flags byte: exactly one of the four level bits
/// (critical/low/good/full) may be set. `0x00` and `0x0f` show up in
/// corrupt frames during device wake and fail this check.
pub fn is_valid_level_flags(flags: u8) -> bool {
    (flags & 0x0f).count_ones() == 1
}

/// The battery capability bound to a device slot.
///
/// A tagged variant rather than a trait object: there are exactly three
/// implementations and the daemon matches on them in a few places.
#[derive(Clone, Debug)]
pub enum BatteryCapability {
    Status(BatteryStatusFeature),
    Voltage(BatteryVoltageFeature),
    Unified(UnifiedBatteryFeature),
}

impl BatteryCapability {
    /// Picks the capability for a device from its enumerated feature map,
    /// by fixed priority. Returns [`None`] when the device exposes no
    /// battery feature.
    pub fn select(
        device_index: u8,
        software_id: U4,
        feature_map: &HashMap<u16, u8>,
    ) -> Option<Self> {
        for feature_id in SELECTION_PRIORITY {
            let Some(&feature_index) = feature_map.get(&feature_id) else {
                continue;
            };

            return Some(match feature_id {
                FEATURE_BATTERY_STATUS => Self::Status(BatteryStatusFeature::new(
                    device_index,
                    feature_index,
                    software_id,
                )),
                FEATURE_BATTERY_VOLTAGE => Self::Voltage(BatteryVoltageFeature::new(
                    device_index,
                    feature_index,
                    software_id,
                )),
                _ => Self::Unified(UnifiedBatteryFeature::new(
                    device_index,
                    feature_index,
                    software_id,
                )),
            });
        }

        None
    }

    pub fn feature_id(&self) -> u16 {
        match self {
            Self::Status(_) => FEATURE_BATTERY_STATUS,
            Self::Voltage(_) => FEATURE_BATTERY_VOLTAGE,
            Self::Unified(_) => FEATURE_UNIFIED_BATTERY,
        }
    }

    pub fn feature_name(&self) -> &'static str {
        match self {
            Self::Status(_) => "BatteryStatus",
            Self::Voltage(_) => "BatteryVoltage",
            Self::Unified(_) => "UnifiedBattery",
        }
    }

    /// The feature-table index the capability was bound to.
    pub fn feature_index(&self) -> u8 {
        match self {
            Self::Status(feature) => feature.feature_index(),
            Self::Voltage(feature) => feature.feature_index(),
            Self::Unified(feature) => feature.feature_index(),
        }
    }

    /// One-time setup after binding. Only the unified variant has work to
    /// do (its capability probe); failures are non-fatal.
    pub async fn bind(&mut self, correlator: &Correlator, cancel: &CancelToken) {
        if let Self::Unified(feature) = self {
            feature.probe_capabilities(correlator, cancel).await;
        }
    }

    /// Queries the device for a fresh reading.
    pub async fn query(
        &self,
        correlator: &Correlator,
        profile: &BackoffProfile,
        cancel: &CancelToken,
    ) -> Option<BatteryReading> {
        match self {
            Self::Status(feature) => feature.query(correlator, profile, cancel).await,
            Self::Voltage(feature) => feature.query(correlator, profile, cancel).await,
            Self::Unified(feature) => feature.query(correlator, profile, cancel).await,
        }
    }

    /// Parses an unsolicited battery event frame. Returns [`None`] for
    /// malformed or corrupt payloads.
    pub fn parse_event(&self, frame: &Frame) -> Option<BatteryReading> {
        match self {
            Self::Status(feature) => feature.parse_payload(frame),
            Self::Voltage(feature) => feature.parse_payload(frame),
            Self::Unified(feature) => feature.parse_payload(frame),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unified_status_table() {
        assert_eq!(decode_unified_status(0), PowerStatus::Discharging);
        assert_eq!(decode_unified_status(1), PowerStatus::Charging);
        assert_eq!(decode_unified_status(2), PowerStatus::Charging);
        assert_eq!(decode_unified_status(3), PowerStatus::Full);
        assert_eq!(decode_unified_status(4), PowerStatus::Charging);
        assert_eq!(decode_unified_status(5), PowerStatus::NotCharging);
        assert_eq!(decode_unified_status(0xff), PowerStatus::NotCharging);
    }

    #[test]
    fn voltage_status_table() {
        assert_eq!(decode_voltage_status(0x00), PowerStatus::Discharging);
        assert_eq!(decode_voltage_status(0x7f), PowerStatus::Discharging);
        assert_eq!(decode_voltage_status(0x80), PowerStatus::Charging);
        assert_eq!(decode_voltage_status(0x81), PowerStatus::Full);
        assert_eq!(decode_voltage_status(0x82), PowerStatus::NotCharging);
        assert_eq!(decode_voltage_status(0x83), PowerStatus::Unknown);
        assert_eq!(decode_voltage_status(0x87), PowerStatus::Unknown);
    }

    #[test]
    fn level_flags_require_exactly_one_bit() {
        for value in 0..=255u8 {
            let expected = matches!(value & 0x0f, 0x01 | 0x02 | 0x04 | 0x08);
            assert_eq!(is_valid_level_flags(value), expected, "value {value:#04x}");
        }

        assert!(!is_valid_level_flags(0x00));
        assert!(!is_valid_level_flags(0x0f));
    }

    #[test]
    fn selection_follows_fixed_priority() {
        let sw = U4::from_lo(0x0a);
        let mut map = HashMap::new();
        map.insert(FEATURE_UNIFIED_BATTERY, 0x09);
        map.insert(FEATURE_BATTERY_VOLTAGE, 0x08);

        let capability = BatteryCapability::select(1, sw, &map).unwrap();
        assert_eq!(capability.feature_id(), FEATURE_BATTERY_VOLTAGE);
        assert_eq!(capability.feature_index(), 0x08);

        map.insert(FEATURE_BATTERY_STATUS, 0x07);
        let capability = BatteryCapability::select(1, sw, &map).unwrap();
        assert_eq!(capability.feature_id(), FEATURE_BATTERY_STATUS);
        assert_eq!(capability.feature_index(), 0x07);

        assert!(BatteryCapability::select(1, sw, &HashMap::new()).is_none());
    }
}
