//! The `BatteryStatus` feature (ID `0x1000`).
//!
//! The oldest of the three battery features: a charge percentage, a level
//! byte and a status byte, no voltage.

use tracing::warn;

use super::{BatteryReading, decode_unified_status};
use crate::{
    backoff::BackoffProfile,
    cancel::CancelToken,
    command::commands,
    correlator::Correlator,
    frame::Frame,
    nibble::U4,
};

/// Implements the `BatteryStatus` / `0x1000` feature.
#[derive(Clone, Copy, Debug)]
pub struct BatteryStatusFeature {
    device_index: u8,
    feature_index: u8,
    software_id: U4,
}

impl BatteryStatusFeature {
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

    /// Queries the current battery level and status.
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

    /// Parses a query response or event payload: percentage, level byte,
    /// status byte.
    ///
    /// Waking devices emit frames whose level byte reads `0x00` or `0x0f`;
    /// those are corrupt and discarded. Other multi-bit level values occur
    /// during level transitions and are accepted.
    pub fn parse_payload(&self, frame: &Frame) -> Option<BatteryReading> {
        let level = frame.param(1);
        if level == 0x00 || level == 0x0f {
            warn!(
                device_index = self.device_index,
                level, "discarding corrupt battery level frame"
            );
            return None;
        }

        Some(BatteryReading {
            percentage: frame.param(0).min(100) as i16,
            status: decode_unified_status(frame.param(2)),
            millivolts: -1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery::PowerStatus;

    fn feature() -> BatteryStatusFeature {
        BatteryStatusFeature::new(0x01, 0x0a, U4::from_lo(0x0a))
    }

    #[test]
    fn parses_percentage_and_status() {
        // 0x55 = 85 percent, status byte 0x02 decodes as charging.
        let frame = Frame::from_raw(&[0x10, 0x01, 0x0a, 0x0a, 0x55, 0x03, 0x02]).unwrap();

        assert_eq!(
            feature().parse_payload(&frame),
            Some(BatteryReading {
                percentage: 85,
                status: PowerStatus::Charging,
                millivolts: -1,
            })
        );
    }

    #[test]
    fn discards_wake_corruption() {
        let corrupt_high = Frame::from_raw(&[0x10, 0x01, 0x0a, 0x0a, 0x55, 0x0f, 0x02]).unwrap();
        let corrupt_zero = Frame::from_raw(&[0x10, 0x01, 0x0a, 0x0a, 0x55, 0x00, 0x02]).unwrap();

        assert_eq!(feature().parse_payload(&corrupt_high), None);
        assert_eq!(feature().parse_payload(&corrupt_zero), None);
    }

    #[test]
    fn clamps_overrange_percentage() {
        let frame = Frame::from_raw(&[0x10, 0x01, 0x0a, 0x0a, 0xfe, 0x04, 0x00]).unwrap();

        let reading = feature().parse_payload(&frame).unwrap();
        assert_eq!(reading.percentage, 100);
        assert_eq!(reading.status, PowerStatus::Discharging);
    }
}
