//! The `BatteryVoltage` feature (ID `0x1001`).
//!
//! Reports the raw battery voltage instead of a percentage; the charge
//! level is estimated from a discharge curve.

use super::{BatteryReading, decode_voltage_status};
use crate::{
    backoff::BackoffProfile,
    cancel::CancelToken,
    command::commands,
    correlator::Correlator,
    frame::Frame,
    nibble::U4,
};

/// A 3.7 V Li-Po discharge curve, voltage thresholds descending. The first
/// entry at or below the measured voltage provides the percentage.
const DISCHARGE_CURVE: &[(u16, i16)] = &[
    (4186, 100),
    (4156, 95),
    (4143, 90),
    (4133, 85),
    (4122, 80),
    (4113, 75),
    (4103, 70),
    (4094, 65),
    (4083, 60),
    (4072, 55),
    (4061, 50),
    (4051, 45),
    (4041, 40),
    (4026, 35),
    (4006, 30),
    (3986, 25),
    (3974, 20),
    (3958, 15),
    (3925, 10),
    (3839, 5),
    (3500, 0),
];

/// Estimates the charge percentage for a measured voltage.
pub fn percentage_from_millivolts(millivolts: u16) -> i16 {
    for &(threshold, percentage) in DISCHARGE_CURVE {
        if millivolts >= threshold {
            return percentage;
        }
    }

    0
}

/// Implements the `BatteryVoltage` / `0x1001` feature.
#[derive(Clone, Copy, Debug)]
pub struct BatteryVoltageFeature {
    device_index: u8,
    feature_index: u8,
    software_id: U4,
}

impl BatteryVoltageFeature {
    pub fn new(device_index: u8, feature_index: u8, software_id: U4) -> Self {
        Self {
            device_index,
            feature_index,
            software_id,
        }
    }

    pub fn feature_index(&self) -> u8 {
        self.feature_index
    }

    /// Queries the current battery voltage.
    pub async fn query(
        &self,
        correlator: &Correlator,
        profile: &BackoffProfile,
        cancel: &CancelToken,
    ) -> Option<BatteryReading> {
        let request =
            commands::get_battery_status(self.device_index, self.software_id, self.feature_index);
        let device_index = self.device_index;

        let response = correlator
            .send_with_backoff(
                &request,
                move |frame| frame.matches(&request) && frame.device_index() == device_index,
                profile,
                cancel,
                Some(Frame::is_error),
            )
            .await?;

        self.parse_payload(&response)
    }

    /// Parses a query response or event payload: big-endian millivolts in
    /// the first two parameter bytes, a flags byte after them.
    pub fn parse_payload(&self, frame: &Frame) -> Option<BatteryReading> {
        let millivolts = frame.param16(0);
        if millivolts == 0 {
            return None;
        }

        Some(BatteryReading {
            percentage: percentage_from_millivolts(millivolts),
            status: decode_voltage_status(frame.param(2)),
            millivolts: millivolts as i32,
        })
    }
}
