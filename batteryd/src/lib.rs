//! A daemon publishing battery telemetry for Logitech HID++ peripherals.
//!
//! Devices are reached directly or through a Unifying/BOLT/Lightspeed
//! receiver over two raw HID report streams supplied by the host. The
//! daemon detects the receiver, initializes every present device, polls
//! its battery and forwards deduplicated readings to an out-of-process
//! consumer.
//!
//! The protocol machinery lives in the [`hidpp`] crate; this crate adds
//! the device lifecycle, the receiver coordinator, the publisher and the
//! host glue (configuration, hidraw endpoints, the stdout telemetry sink).

pub mod config;
pub mod coordinator;
#[cfg(target_os = "linux")]
pub mod hidraw;
pub mod lifecycle;
pub mod publish;
pub mod telemetry;
