//! Outbound HID++ command construction.
//!
//! HID++ 2.0 requests are built through [`CommandBuilder`]; the most common
//! ones have pre-packaged constructors in [`commands`]. HID++ 1.0 register
//! access frames, used to drive receivers, live in [`registers`].

use crate::{
    frame::{Frame, RECEIVER_DEVICE_INDEX, SHORT_REPORT_ID},
    nibble::U4,
};

/// A fluent builder for HID++ 2.0 request frames.
///
/// Requests are always sent as short frames; responses may come back short
/// or long. Function and software IDs are [`U4`] values, so values outside
/// the nibble range are rejected at [`U4::new`] before they ever reach the
/// builder.
#[derive(Clone, Copy, Debug)]
pub struct CommandBuilder {
    device_index: u8,
    feature_index: u8,
    function_and_sw: u8,
    params: [u8; 3],
}

impl CommandBuilder {
    /// Starts building a command addressed to the given device index.
    pub fn for_device(device_index: u8) -> Self {
        Self {
            device_index,
            feature_index: 0x00,
            function_and_sw: 0x00,
            params: [0x00; 3],
        }
    }

    /// Sets the feature index the command targets.
    pub fn feature_index(mut self, feature_index: u8) -> Self {
        self.feature_index = feature_index;
        self
    }

    /// Sets the function and software ID nibbles packed into byte 3.
    pub fn function(mut self, function: U4, software_id: U4) -> Self {
        self.function_and_sw = U4::combine(function, software_id);
        self
    }

    /// Sets the three parameter bytes.
    pub fn params(mut self, params: [u8; 3]) -> Self {
        self.params = params;
        self
    }

    /// Builds the short request frame.
    pub fn build(self) -> Frame {
        Frame::Short([
            SHORT_REPORT_ID,
            self.device_index,
            self.feature_index,
            self.function_and_sw,
            self.params[0],
            self.params[1],
            self.params[2],
        ])
    }
}

/// Pre-packaged HID++ 2.0 commands.
pub mod commands {
    use super::CommandBuilder;
    use crate::{frame::Frame, nibble::U4};

    /// The root feature occupies index 0 on every device.
    pub const ROOT_FEATURE_INDEX: u8 = 0x00;

    const ROOT_FN_GET_FEATURE_INDEX: u8 = 0x0;
    const ROOT_FN_PING: u8 = 0x1;

    const FEATURE_SET_FN_COUNT: u8 = 0x0;
    const FEATURE_SET_FN_ENUMERATE: u8 = 0x1;

    const NAME_FN_LENGTH: u8 = 0x0;
    const NAME_FN_CHUNK: u8 = 0x1;
    const NAME_FN_DEVICE_TYPE: u8 = 0x2;

    const INFO_FN_FIRMWARE: u8 = 0x0;
    const INFO_FN_SERIAL: u8 = 0x2;

    const BATTERY_FN_STATUS: u8 = 0x0;
    const BATTERY_FN_CAPABILITY: u8 = 0x1;

    fn fn_id(raw: u8) -> U4 {
        // All function IDs in this module are compile-time nibbles.
        U4::new(raw).unwrap()
    }

    /// Pings a device through the root feature, echoing `data` on success.
    pub fn ping(device_index: u8, software_id: U4, data: u8) -> Frame {
        CommandBuilder::for_device(device_index)
            .feature_index(ROOT_FEATURE_INDEX)
            .function(fn_id(ROOT_FN_PING), software_id)
            .params([0x00, 0x00, data])
            .build()
    }

    /// Looks up the feature-table index of a feature ID through the root
    /// feature.
    ///
    /// The feature ID travels little-endian in parameter bytes 1..3. This is
    /// the one place the protocol deviates from its otherwise big-endian
    /// parameter encoding.
    pub fn get_feature_index(device_index: u8, software_id: U4, feature_id: u16) -> Frame {
        let [hi, lo] = feature_id.to_be_bytes();

        CommandBuilder::for_device(device_index)
            .feature_index(ROOT_FEATURE_INDEX)
            .function(fn_id(ROOT_FN_GET_FEATURE_INDEX), software_id)
            .params([0x00, lo, hi])
            .build()
    }

    /// Asks the FeatureSet feature for the number of features it holds.
    pub fn get_feature_count(device_index: u8, software_id: U4, feature_set_index: u8) -> Frame {
        CommandBuilder::for_device(device_index)
            .feature_index(feature_set_index)
            .function(fn_id(FEATURE_SET_FN_COUNT), software_id)
            .params([0x00; 3])
            .build()
    }

    /// Asks the FeatureSet feature for the feature ID stored at a table
    /// position.
    pub fn enumerate_feature(
        device_index: u8,
        software_id: U4,
        feature_set_index: u8,
        position: u8,
    ) -> Frame {
        CommandBuilder::for_device(device_index)
            .feature_index(feature_set_index)
            .function(fn_id(FEATURE_SET_FN_ENUMERATE), software_id)
            .params([position, 0x00, 0x00])
            .build()
    }

    /// Asks the DeviceTypeAndName feature for the name length.
    pub fn get_device_name_length(device_index: u8, software_id: U4, name_index: u8) -> Frame {
        CommandBuilder::for_device(device_index)
            .feature_index(name_index)
            .function(fn_id(NAME_FN_LENGTH), software_id)
            .params([0x00; 3])
            .build()
    }

    /// Asks the DeviceTypeAndName feature for a 3-byte name chunk starting
    /// at the given offset.
    pub fn get_device_name_chunk(
        device_index: u8,
        software_id: U4,
        name_index: u8,
        offset: u8,
    ) -> Frame {
        CommandBuilder::for_device(device_index)
            .feature_index(name_index)
            .function(fn_id(NAME_FN_CHUNK), software_id)
            .params([offset, 0x00, 0x00])
            .build()
    }

    /// Asks the DeviceTypeAndName feature for the device type byte.
    pub fn get_device_type(device_index: u8, software_id: U4, name_index: u8) -> Frame {
        CommandBuilder::for_device(device_index)
            .feature_index(name_index)
            .function(fn_id(NAME_FN_DEVICE_TYPE), software_id)
            .params([0x00; 3])
            .build()
    }

    /// Asks the DeviceInformation feature for the firmware/identity block.
    pub fn get_firmware_info(device_index: u8, software_id: U4, info_index: u8) -> Frame {
        CommandBuilder::for_device(device_index)
            .feature_index(info_index)
            .function(fn_id(INFO_FN_FIRMWARE), software_id)
            .params([0x00; 3])
            .build()
    }

    /// Asks the DeviceInformation feature for the serial number.
    pub fn get_serial_number(device_index: u8, software_id: U4, info_index: u8) -> Frame {
        CommandBuilder::for_device(device_index)
            .feature_index(info_index)
            .function(fn_id(INFO_FN_SERIAL), software_id)
            .params([0x00; 3])
            .build()
    }

    /// Queries the bound battery feature for its current reading.
    pub fn get_battery_status(device_index: u8, software_id: U4, battery_index: u8) -> Frame {
        CommandBuilder::for_device(device_index)
            .feature_index(battery_index)
            .function(fn_id(BATTERY_FN_STATUS), software_id)
            .params([0x00; 3])
            .build()
    }

    /// Probes the bound battery feature for its capability block.
    pub fn get_battery_capability(device_index: u8, software_id: U4, battery_index: u8) -> Frame {
        CommandBuilder::for_device(device_index)
            .feature_index(battery_index)
            .function(fn_id(BATTERY_FN_CAPABILITY), software_id)
            .params([0x00; 3])
            .build()
    }
}

/// Pre-packaged HID++ 1.0 register access frames.
///
/// Version 1.0 addresses receivers with get/set register opcodes carried in
/// the sub-ID byte, where version 2.0 carries a feature index.
pub mod registers {
    use super::*;

    /// The sub ID used to set a 3-byte register value.
    pub const SUB_ID_SET_REGISTER: u8 = 0x80;

    /// The sub ID used to retrieve a 3-byte register value.
    pub const SUB_ID_GET_REGISTER: u8 = 0x81;

    /// The notification-flags register.
    pub const REGISTER_NOTIFICATIONS: u8 = 0x00;

    /// The connection-state register, holding the paired device count and
    /// the arrival trigger.
    pub const REGISTER_CONNECTION_STATE: u8 = 0x02;

    fn register_frame(device_index: u8, sub_id: u8, register: u8, params: [u8; 3]) -> Frame {
        Frame::Short([
            SHORT_REPORT_ID,
            device_index,
            sub_id,
            register,
            params[0],
            params[1],
            params[2],
        ])
    }

    /// Reads the connection-state register of the receiver. The response
    /// carries the paired device count in its second payload byte.
    pub fn query_device_count() -> Frame {
        register_frame(
            RECEIVER_DEVICE_INDEX,
            SUB_ID_GET_REGISTER,
            REGISTER_CONNECTION_STATE,
            [0x00; 3],
        )
    }

    /// Asks the receiver to emit an announcement for every connected device.
    pub fn force_device_announce() -> Frame {
        register_frame(
            RECEIVER_DEVICE_INDEX,
            SUB_ID_SET_REGISTER,
            REGISTER_CONNECTION_STATE,
            [0x02, 0x00, 0x00],
        )
    }

    /// Enables battery status notifications for a device slot.
    pub fn enable_battery_reports(slot: u8) -> Frame {
        register_frame(
            slot,
            SUB_ID_SET_REGISTER,
            REGISTER_NOTIFICATIONS,
            [0x10, 0x00, 0x00],
        )
    }

    /// Enables wireless notifications on the receiver itself, so device
    /// arrivals and departures are reported.
    pub fn enable_all_reports() -> Frame {
        register_frame(
            RECEIVER_DEVICE_INDEX,
            SUB_ID_SET_REGISTER,
            REGISTER_NOTIFICATIONS,
            [0x00, 0x01, 0x00],
        )
    }
}
