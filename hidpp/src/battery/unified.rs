//! The `UnifiedBattery` feature (ID `0x1004`).
//!
//! The modern battery feature. The payload matches `BatteryStatus`, but the
//! feature answers noticeably slower on some devices, so queries run with
//! an extended timeout, and a capability probe at bind time tells whether
//! the device reports percentages at all.

use std::time::Duration;

use tracing::{debug, warn};

use super::{BatteryReading, decode_unified_status, is_valid_level_flags};
use crate::{
    backoff::BackoffProfile,
    cancel::CancelToken,
    command::commands,
    correlator::Correlator,
    frame::Frame,
    nibble::U4,
};

/// The per-attempt timeout for unified battery queries.
const EXTENDED_TIMEOUT: Duration = Duration::from_secs(5);

/// The capability block reported by the feature's probe function.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct UnifiedCapabilities {
    /// Bitmask of the level flags the device reports
    /// (critical/low/good/full).
    pub supported_levels: u8,

    /// Whether the battery is rechargeable.
    pub rechargeable: bool,

    /// Whether the device reports a charge percentage.
    pub percentage: bool,
}

impl From<[u8; 2]> for UnifiedCapabilities {
    fn from(value: [u8; 2]) -> Self {
        Self {
            supported_levels: value[0] & 0x0f,
            rechargeable: value[1] & (1 << 0) != 0,
            percentage: value[1] & (1 << 1) != 0,
        }
    }
}

/// Implements the `UnifiedBattery` / `0x1004` feature.
#[derive(Clone, Copy, Debug)]
pub struct UnifiedBatteryFeature {
    device_index: u8,
    feature_index: u8,
    software_id: U4,
    capabilities: Option<UnifiedCapabilities>,
}

impl UnifiedBatteryFeature {
    pub fn new(device_index: u8, feature_index: u8, software_id: U4) -> Self {
        Self {
            device_index,
            feature_index,
            software_id,
            capabilities: None,
        }
    }

    pub fn feature_index(&self) -> u8 {
        self.feature_index
    }

    pub fn capabilities(&self) -> Option<UnifiedCapabilities> {
        self.capabilities
    }

    /// Fetches the capability block once, at bind time. Best-effort: a
    /// probe failure leaves the capabilities unknown and queries behave as
    /// if percentages were supported.
    pub async fn probe_capabilities(&mut self, correlator: &Correlator, cancel: &CancelToken) {
        let request = commands::get_battery_capability(
            self.device_index,
            self.software_id,
            self.feature_index,
        );
        let device_index = self.device_index;

        let response = correlator
            .send_and_wait(
                &request,
                move |frame| frame.matches(&request) && frame.device_index() == device_index,
                EXTENDED_TIMEOUT,
                Some(Frame::is_error),
            )
            .await;

        if cancel.is_cancelled() {
            return;
        }

        match response {
            Some(frame) => {
                let capabilities = UnifiedCapabilities::from([frame.param(0), frame.param(1)]);
                debug!(device_index, ?capabilities, "unified battery capabilities");
                self.capabilities = Some(capabilities);
            },
            None => debug!(device_index, "unified battery capability probe failed"),
        }
    }

    /// Queries the current battery state with the extended timeout.
    pub async fn query(
        &self,
        correlator: &Correlator,
        profile: &BackoffProfile,
        cancel: &CancelToken,
    ) -> Option<BatteryReading> {
        let request =
            commands::get_battery_status(self.device_index, self.software_id, self.feature_index);
        let device_index = self.device_index;
        let slow_profile = BackoffProfile::new(
            profile.name,
            profile.initial_delay,
            profile.max_delay,
            EXTENDED_TIMEOUT,
            EXTENDED_TIMEOUT,
            profile.multiplier,
            profile.max_attempts,
        );

        let response = correlator
            .send_with_backoff(
                &request,
                move |frame| frame.matches(&request) && frame.device_index() == device_index,
                &slow_profile,
                cancel,
                Some(Frame::is_error),
            )
            .await?;

        self.parse_payload(&response)
    }

    /// Parses a query response or event payload. The level byte is a
    /// one-bit bitmask here, so the strict flag validation applies.
    pub fn parse_payload(&self, frame: &Frame) -> Option<BatteryReading> {
        let level = frame.param(1);
        if !is_valid_level_flags(level) {
            warn!(
                device_index = self.device_index,
                level, "discarding corrupt battery level frame"
            );
            return None;
        }

        let percentage = if self.capabilities.is_none_or(|caps| caps.percentage) {
            frame.param(0).min(100) as i16
        } else {
            -1
        };

        Some(BatteryReading {
            percentage,
            status: decode_unified_status(frame.param(2)),
            millivolts: -1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery::PowerStatus;

    fn feature() -> UnifiedBatteryFeature {
        UnifiedBatteryFeature::new(0x01, 0x0c, U4::from_lo(0x0a))
    }

    #[test]
    fn parses_single_bit_levels_only() {
        let good = Frame::from_raw(&[0x10, 0x01, 0x0c, 0x0a, 0x3c, 0x04, 0x00]).unwrap();
        let reading = feature().parse_payload(&good).unwrap();
        assert_eq!(reading.percentage, 60);
        assert_eq!(reading.status, PowerStatus::Discharging);
        assert_eq!(reading.millivolts, -1);

        for corrupt_level in [0x00u8, 0x03, 0x0f] {
            let frame =
                Frame::from_raw(&[0x10, 0x01, 0x0c, 0x0a, 0x3c, corrupt_level, 0x00]).unwrap();
            assert_eq!(feature().parse_payload(&frame), None);
        }
    }

    #[test]
    fn percentage_suppressed_without_capability() {
        let mut feature = feature();
        feature.capabilities = Some(UnifiedCapabilities {
            supported_levels: 0x0f,
            rechargeable: true,
            percentage: false,
        });

        let frame = Frame::from_raw(&[0x10, 0x01, 0x0c, 0x0a, 0x3c, 0x04, 0x01]).unwrap();
        let reading = feature.parse_payload(&frame).unwrap();
        assert_eq!(reading.percentage, -1);
        assert_eq!(reading.status, PowerStatus::Charging);
    }

    #[test]
    fn capability_block_decoding() {
        let caps = UnifiedCapabilities::from([0x0d, 0x03]);
        assert_eq!(caps.supported_levels, 0x0d);
        assert!(caps.rechargeable);
        assert!(caps.percentage);

        let caps = UnifiedCapabilities::from([0x02, 0x00]);
        assert!(!caps.rechargeable);
        assert!(!caps.percentage);
    }
}
