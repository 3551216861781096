//! The outbound consumer interface.
//!
//! The daemon publishes three message kinds to an opaque sink; the shipped
//! implementation writes JSON lines to stdout, which is what the tray-side
//! consumer reads. Binary layout is the host's business, only the semantics
//! are fixed here.

use async_trait::async_trait;
use serde::Serialize;

/// Emitted once per transition to Online, after the device's metadata is
/// known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInit {
    pub identifier: String,
    pub device_name: String,
    pub has_battery: bool,
    pub device_type: &'static str,
    /// `NATIVE.<deviceType>.<identifier>`.
    pub device_signature: String,
}

/// Emitted on each published battery reading. A percentage of `-1` conveys
/// offline/unknown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryUpdate {
    pub identifier: String,
    pub battery_percentage: i16,
    pub power_supply_status: &'static str,
    pub battery_millivolts: i32,
    /// Seconds since the Unix epoch.
    pub update_time: u64,
    pub mileage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_wired_mode: Option<bool>,
}

/// Emitted when the host explicitly removes a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRemove {
    pub identifier: String,
    pub reason: String,
}

/// The event sink consuming the daemon's telemetry.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn device_init(&self, message: DeviceInit);
    async fn battery_update(&self, message: BatteryUpdate);
    async fn device_remove(&self, message: DeviceRemove);
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Envelope<'a> {
    Init(&'a DeviceInit),
    Update(&'a BatteryUpdate),
    Remove(&'a DeviceRemove),
}

/// Writes one JSON object per line to stdout.
#[derive(Debug, Default)]
pub struct JsonLineSink;

impl JsonLineSink {
    fn emit(&self, envelope: Envelope<'_>) {
        match serde_json::to_string(&envelope) {
            Ok(line) => println!("{line}"),
            Err(err) => tracing::error!(%err, "failed to serialize telemetry message"),
        }
    }
}

#[async_trait]
impl TelemetrySink for JsonLineSink {
    async fn device_init(&self, message: DeviceInit) {
        self.emit(Envelope::Init(&message));
    }

    async fn battery_update(&self, message: BatteryUpdate) {
        self.emit(Envelope::Update(&message));
    }

    async fn device_remove(&self, message: DeviceRemove) {
        self.emit(Envelope::Remove(&message));
    }
}

/// A sink remembering everything it was handed. Test support.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub inits: std::sync::Mutex<Vec<DeviceInit>>,
    pub updates: std::sync::Mutex<Vec<BatteryUpdate>>,
    pub removes: std::sync::Mutex<Vec<DeviceRemove>>,
}

#[async_trait]
impl TelemetrySink for RecordingSink {
    async fn device_init(&self, message: DeviceInit) {
        self.inits.lock().unwrap().push(message);
    }

    async fn battery_update(&self, message: BatteryUpdate) {
        self.updates.lock().unwrap().push(message);
    }

    async fn device_remove(&self, message: DeviceRemove) {
        self.removes.lock().unwrap().push(message);
    }
}
