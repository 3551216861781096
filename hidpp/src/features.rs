//! Well-known HID++ 2.0 feature IDs and their names.
//!
//! The daemon only drives a handful of features, but logging the names of
//! everything a device enumerates makes diagnostic logs considerably more
//! useful.

use std::collections::HashMap;

use lazy_static::lazy_static;

/// The `Root` feature, present at index 0 on every device.
pub const FEATURE_ROOT: u16 = 0x0000;

/// The `FeatureSet` feature, required for feature enumeration.
pub const FEATURE_SET: u16 = 0x0001;

/// The `DeviceInformation` feature (firmware identity, serial number).
pub const FEATURE_DEVICE_INFO: u16 = 0x0003;

/// The `DeviceTypeAndName` feature.
pub const FEATURE_DEVICE_NAME: u16 = 0x0005;

lazy_static! {
    static ref FEATURE_NAMES: HashMap<u16, &'static str> = HashMap::from([
        (0x0000, "Root"),
        (0x0001, "FeatureSet"),
        (0x0002, "FeatureInfo"),
        (0x0003, "DeviceInformation"),
        (0x0004, "UnitId"),
        (0x0005, "DeviceTypeAndName"),
        (0x0007, "DeviceFriendlyName"),
        (0x0008, "KeepAlive"),
        (0x0020, "ConfigChange"),
        (0x0021, "UniqueRandomId"),
        (0x0080, "WirelessSignalStrength"),
        (0x1000, "BatteryStatus"),
        (0x1001, "BatteryVoltage"),
        (0x1004, "UnifiedBattery"),
        (0x1010, "ChargingControl"),
        (0x1802, "DeviceReset"),
        (0x1805, "OobState"),
        (0x1806, "ConfigDeviceProps"),
        (0x1814, "ChangeHost"),
        (0x1815, "HostsInfo"),
        (0x1982, "Backlight2"),
        (0x1a00, "PresenterControl"),
        (0x1b04, "ReprogControls5"),
        (0x1d4b, "WirelessDeviceStatus"),
        (0x1df0, "RemainingPairings"),
        (0x1f20, "AdcMeasurement"),
        (0x2100, "VerticalScrolling"),
        (0x2110, "SmartShiftWheel"),
        (0x2121, "HiResWheel"),
        (0x2150, "Thumbwheel"),
        (0x2201, "AdjustableDpi"),
        (0x40a2, "FnInversionWithDefaultState"),
        (0x4220, "LockKeyState"),
        (0x4521, "DisableKeys"),
        (0x6501, "Gestures2"),
        (0x8060, "AdjustableReportRate"),
        (0x8070, "ColorLedEffects"),
        (0x8100, "OnboardProfiles"),
        (0x8300, "Sidetone"),
        (0x8310, "Equalizer"),
    ]);
}

/// Looks up the name of a feature ID, for log output.
pub fn feature_name(feature_id: u16) -> Option<&'static str> {
    FEATURE_NAMES.get(&feature_id).copied()
}
