//! An implementation of the HID++ protocol used by Logitech devices,
//! focused on the machinery a battery telemetry daemon needs.
//!
//! Logitech's wireless peripherals (mice, keyboards, headsets etc.) speak
//! HID++, a vendor protocol layered on standard [HID](https://en.wikipedia.org/wiki/Human_interface_device)
//! reports. Version 1.0 addresses receivers through get/set registers;
//! version 2.0 addresses the peripherals themselves through typed
//! "features" discovered by enumeration. Both travel in the same two
//! fixed-size reports: a 7-byte SHORT and a 20-byte LONG frame.
//!
//! The [Solaar](https://github.com/pwr-Solaar/Solaar) project and
//! Logitech's published HID++ documentation were invaluable while getting
//! the byte-level details right.
//!
//! # Crate layout
//!
//! - [`frame`] and [`command`] implement the codec: typed accessors over
//!   raw frames, the fluent request builder and the pre-packaged commands.
//! - [`transport`] owns the two blocking reader threads over the raw HID
//!   endpoints supplied by the host.
//! - [`router`] classifies every inbound frame: receiver announcement,
//!   device event, or candidate response.
//! - [`correlator`] serializes requests and binds each to the single
//!   response matching a caller-supplied predicate.
//! - [`backoff`] drives every retryable exchange from named profiles.
//! - [`battery`] implements the three battery features a device may expose.
//!
//! HID++ carries no request IDs, so the correlator keeps exactly one
//! request in flight and everything above it retries through [`backoff`]
//! profiles. That combination is what the rest of the daemon builds on:
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use hidpp::{
//!     cancel::CancelToken,
//!     correlator::{Correlator, ping20},
//!     nibble::U4,
//!     router::{response_queue, spawn_router},
//!     transport::Transport,
//! };
//! # use std::io;
//! # struct MyEndpoint;
//! # impl hidpp::transport::RawHidEndpoint for MyEndpoint {
//! #     fn write(&self, _: &[u8]) -> io::Result<()> { Ok(()) }
//! #     fn read(&self, _: &mut [u8], _: i32) -> hidpp::transport::ReadOutcome {
//! #         hidpp::transport::ReadOutcome::TimedOut
//! #     }
//! #     fn close(&self) {}
//! # }
//! # struct Handler;
//! # #[hidpp::async_trait]
//! # impl hidpp::router::FrameHandler for Handler {
//! #     async fn on_announcement(&self, _: hidpp::frame::Announcement) {}
//! #     async fn on_device_event(&self, _: &hidpp::frame::Frame) -> bool { false }
//! # }
//!
//! # async fn example(short: Arc<MyEndpoint>, long: Arc<MyEndpoint>) {
//! let transport = Transport::start(short, long);
//! let (responses, response_rx) = response_queue();
//! spawn_router(
//!     transport.frames(),
//!     Arc::new(Handler),
//!     responses,
//!     CancelToken::new(),
//! );
//!
//! let correlator = Correlator::new(Arc::clone(&transport), response_rx);
//! if ping20(&correlator, 0x01, U4::from_lo(0x0a), Duration::from_secs(1)).await {
//!     println!("device in slot 1 is awake");
//! }
//! # }
//! ```

pub use async_trait::async_trait;

pub mod backoff;
pub mod battery;
pub mod cancel;
pub mod command;
pub mod correlator;
pub mod features;
pub mod frame;
pub mod metadata;
pub mod nibble;
pub mod router;
pub mod transport;
