//! The raw HID++ frame representation and its typed accessors.
//!
//! HID++ messages travel in two fixed-size HID reports: a 7-byte SHORT
//! report and a 20-byte LONG report. Both share the same header layout
//! (report ID, device index, feature index, packed function/software
//! nibbles) followed by parameter bytes.

use crate::nibble::U4;

/// The ID of the HID report that is used to transmit short HID++ messages.
pub const SHORT_REPORT_ID: u8 = 0x10;

/// The length of short HID++ message reports (including report ID).
pub const SHORT_FRAME_LENGTH: usize = 7;

/// The ID of the HID report that is used to transmit long HID++ messages.
pub const LONG_REPORT_ID: u8 = 0x11;

/// The length of long HID++ message reports (including report ID).
pub const LONG_FRAME_LENGTH: usize = 20;

/// The report IDs reserved for the DJ protocol spoken by some receivers.
/// These are recognized so readers can skip them, but never processed.
pub const DJ_REPORT_IDS: [u8; 2] = [0x20, 0x21];

/// The device index addressing the receiver itself, and by convention a
/// directly connected (non-receiver) peripheral.
pub const RECEIVER_DEVICE_INDEX: u8 = 0xff;

/// The feature-index byte marking an error response.
pub const ERROR_FEATURE_INDEX: u8 = 0x8f;

/// The feature-index byte marking a receiver-emitted device announcement.
pub const ANNOUNCEMENT_FEATURE_INDEX: u8 = 0x41;

/// The bit in an announcement's first parameter byte that is set when the
/// device link went down. A clear bit means the device came online.
const ANNOUNCEMENT_OFF_BIT: u8 = 0x40;

/// Represents a single HID++ frame, short or long, including its report ID.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Frame {
    /// A short frame: 7 bytes, 3 parameter bytes.
    Short([u8; SHORT_FRAME_LENGTH]),

    /// A long frame: 20 bytes, 16 parameter bytes.
    Long([u8; LONG_FRAME_LENGTH]),
}

impl Frame {
    /// Tries to read a HID++ frame from raw report data.
    ///
    /// Returns [`None`] for DJ reports, unknown report IDs and size
    /// mismatches.
    pub fn from_raw(data: &[u8]) -> Option<Self> {
        match data.first()? {
            &SHORT_REPORT_ID if data.len() == SHORT_FRAME_LENGTH => {
                Some(Self::Short(data.try_into().unwrap()))
            },
            &LONG_REPORT_ID if data.len() == LONG_FRAME_LENGTH => {
                Some(Self::Long(data.try_into().unwrap()))
            },
            _ => None,
        }
    }

    /// Checks whether a report ID belongs to the DJ protocol.
    pub fn is_dj_report_id(id: u8) -> bool {
        DJ_REPORT_IDS.contains(&id)
    }

    /// Provides the raw bytes of the frame, report ID included.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Short(data) => data,
            Self::Long(data) => data,
        }
    }

    /// The report ID (byte 0).
    pub fn report_id(&self) -> u8 {
        self.as_bytes()[0]
    }

    /// The index of the device involved in the communication (byte 1).
    pub fn device_index(&self) -> u8 {
        self.as_bytes()[1]
    }

    /// The index of the feature the message belongs to (byte 2).
    ///
    /// This is not the same as the feature ID, but the index returned from a
    /// feature enumeration request. HID++ 1.0 messages carry their sub ID in
    /// the same position.
    pub fn feature_index(&self) -> u8 {
        self.as_bytes()[2]
    }

    /// The ID of the function involved in the communication (high nibble of
    /// byte 3).
    pub fn function_id(&self) -> U4 {
        U4::from_hi(self.as_bytes()[3])
    }

    /// The ID of the software communicating with the device (low nibble of
    /// byte 3).
    pub fn software_id(&self) -> U4 {
        U4::from_lo(self.as_bytes()[3])
    }

    /// The parameter bytes following the header.
    pub fn params(&self) -> &[u8] {
        &self.as_bytes()[4..]
    }

    /// A single parameter byte. Out-of-range indices read as zero, which
    /// matches extending a short payload with zeroes.
    pub fn param(&self, index: usize) -> u8 {
        self.params().get(index).copied().unwrap_or(0)
    }

    /// A big-endian 16-bit value starting at the given parameter index.
    ///
    /// All multi-byte response parameters are big-endian on the wire.
    pub fn param16(&self, index: usize) -> u16 {
        u16::from_be_bytes([self.param(index), self.param(index + 1)])
    }

    /// Checks whether this frame is an error response.
    pub fn is_error(&self) -> bool {
        self.feature_index() == ERROR_FEATURE_INDEX
    }

    /// The error code of an error response.
    pub fn error_code(&self) -> u8 {
        self.param(0)
    }

    /// Checks whether this frame is a receiver-emitted device announcement.
    pub fn is_announcement(&self) -> bool {
        self.feature_index() == ANNOUNCEMENT_FEATURE_INDEX
    }

    /// Checks whether this frame is an unsolicited broadcast from a device.
    ///
    /// Devices emit events with both the function ID and the software ID set
    /// to zero; software ID zero is reserved for exactly this purpose and
    /// never used in requests.
    pub fn is_broadcast(&self) -> bool {
        self.as_bytes()[3] == 0x00
    }

    /// Checks whether this frame is a battery event for the given feature
    /// index.
    pub fn is_battery_event(&self, battery_feature_index: u8) -> bool {
        self.feature_index() == battery_feature_index && self.is_broadcast()
    }

    /// Checks whether this frame answers the given request frame.
    ///
    /// A response echoes the feature index and the software ID of the
    /// request. The function ID is deliberately not compared: some firmware
    /// revisions respond to root-feature calls with a zeroed function
    /// nibble.
    pub fn matches(&self, request: &Frame) -> bool {
        self.feature_index() == request.feature_index()
            && self.software_id() == request.software_id()
    }

    /// Tries to decode this frame as a device announcement.
    pub fn announcement(&self) -> Option<Announcement> {
        if !self.is_announcement() {
            return None;
        }

        Some(Announcement {
            slot: self.device_index(),
            online: self.param(0) & ANNOUNCEMENT_OFF_BIT == 0,
        })
    }
}

/// A decoded receiver announcement about a device link transition.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Announcement {
    /// The receiver slot the announcement concerns.
    pub slot: u8,

    /// Whether the device link came up (`true`) or went down (`false`).
    pub online: bool,
}
