//! Receiver detection and daemon bring-up.
//!
//! The coordinator owns the transport, the router, the correlator and the
//! device manager. Its job is the first minute of life: decide whether the
//! endpoints lead to a receiver or a direct device, enable receiver
//! notifications, and get every present device initialized.

use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use async_trait::async_trait;
use hidpp::{
    cancel::CancelToken,
    command::registers,
    correlator::{Correlator, ping20},
    frame::{Announcement, Frame},
    router::{FrameHandler, response_queue, spawn_router},
    transport::{RawHidEndpoint, Transport},
};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    config::EffectiveConfig,
    lifecycle::{DIRECT_DEVICE_INDEX, DeviceManager},
    publish::Publisher,
    telemetry::TelemetrySink,
};

/// Settling time for the reader threads before the first exchange.
const READER_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// The timeout on the receiver-detection register read.
const DETECT_TIMEOUT: Duration = Duration::from_millis(500);

/// How long the coordinator waits for announcements after forcing them.
const ANNOUNCEMENT_WINDOW: Duration = Duration::from_secs(2);

/// The receiver slot range.
const SLOT_RANGE: std::ops::RangeInclusive<u8> = 1..=6;

pub struct Coordinator {
    transport: Arc<Transport>,
    correlator: Arc<Correlator>,
    manager: Arc<DeviceManager>,
    config: Arc<EffectiveConfig>,
    shutdown: CancelToken,
    router_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Coordinator {
    /// Wires the full pipeline over a freshly bound endpoint pair: reader
    /// threads, router task, correlator and device manager.
    pub fn new(
        short: Arc<dyn RawHidEndpoint>,
        long: Arc<dyn RawHidEndpoint>,
        config: Arc<EffectiveConfig>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Arc<Self> {
        let shutdown = CancelToken::new();
        let transport = Transport::start(short, long);
        let (responses, response_rx) = response_queue();
        let correlator = Arc::new(Correlator::new(Arc::clone(&transport), response_rx));
        let publisher = Arc::new(Publisher::new(Arc::clone(&sink)));
        let manager = Arc::new(DeviceManager::new(
            Arc::clone(&correlator),
            publisher,
            sink,
            Arc::clone(&config),
            shutdown.clone(),
        ));

        let coordinator = Arc::new(Self {
            transport: Arc::clone(&transport),
            correlator,
            manager,
            config,
            shutdown: shutdown.clone(),
            router_task: StdMutex::new(None),
        });

        let router = spawn_router(
            transport.frames(),
            Arc::clone(&coordinator) as Arc<dyn FrameHandler>,
            responses,
            shutdown,
        );
        *coordinator.router_task.lock().unwrap() = Some(router);

        coordinator
    }

    pub fn manager(&self) -> &Arc<DeviceManager> {
        &self.manager
    }

    /// Brings the attached hardware up: mode detection, then receiver
    /// enumeration or direct-device initialization. Returns once bring-up
    /// is underway; device initializations continue in the background.
    pub async fn run(&self) {
        sleep(READER_SETTLE_DELAY).await;

        match self.detect_receiver().await {
            Some(device_count) => {
                info!(device_count, "receiver detected");
                self.manager.set_receiver_mode(true);
                self.bring_up_receiver(device_count).await;
            },
            None => {
                info!("no receiver answered, assuming direct device");
                Arc::clone(&self.manager).bring_up(DIRECT_DEVICE_INDEX);
            },
        }
    }

    /// Sends the HID++ 1.0 device-count register read. A well-formed
    /// response means a receiver is on the other end; anything else (error
    /// or silence) means a direct device.
    async fn detect_receiver(&self) -> Option<u8> {
        let request = registers::query_device_count();
        let response = self
            .correlator
            .send_and_wait(
                &request,
                |frame| {
                    frame.feature_index() == registers::SUB_ID_GET_REGISTER
                        && frame.as_bytes()[3] == registers::REGISTER_CONNECTION_STATE
                },
                DETECT_TIMEOUT,
                Some(Frame::is_error),
            )
            .await?;

        Some(response.param(1))
    }

    async fn bring_up_receiver(&self, device_count: u8) {
        // Wireless notifications first; without them no announcements
        // arrive. Failures are logged but not fatal, the slot probe below
        // still finds devices.
        let request = registers::enable_all_reports();
        let enabled = self
            .correlator
            .send_with_backoff(
                &request,
                |frame| frame.feature_index() == registers::SUB_ID_SET_REGISTER,
                &self.config.profiles.receiver_init,
                &self.shutdown,
                Some(Frame::is_error),
            )
            .await
            .is_some();
        if !enabled {
            warn!("could not enable receiver notifications");
        }

        if device_count > 0 {
            debug!("forcing device announcements");
            let request = registers::force_device_announce();
            let _ = self
                .correlator
                .send_and_wait(
                    &request,
                    |frame| frame.feature_index() == registers::SUB_ID_SET_REGISTER,
                    self.config.profiles.receiver_init.initial_timeout,
                    Some(Frame::is_error),
                )
                .await;
        }

        tokio::select! {
            _ = self.shutdown.cancelled() => return,
            _ = sleep(ANNOUNCEMENT_WINDOW) => {},
        }

        // Quiet receivers exist; probe the slots directly when nothing
        // announced itself.
        if self.manager.slot_count() == 0 {
            info!("no announcements received, probing slots");
            for slot in SLOT_RANGE {
                if self.shutdown.is_cancelled() {
                    break;
                }

                if ping20(
                    &self.correlator,
                    slot,
                    self.config.software_id,
                    self.config.profiles.init.initial_timeout,
                )
                .await
                {
                    debug!(slot, "slot answered ping probe");
                    Arc::clone(&self.manager).bring_up(slot);
                }
            }
        }
    }

    /// Tears the daemon down: cancels every task, disposes the slots and
    /// closes the transport.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.shutdown.cancel();
        self.manager.dispose_all().await;
        self.transport.shutdown();

        let router = self.router_task.lock().unwrap().take();
        if let Some(router) = router {
            let _ = router.await;
        }
    }
}

#[async_trait]
impl FrameHandler for Coordinator {
    async fn on_announcement(&self, announcement: Announcement) {
        debug!(
            slot = announcement.slot,
            online = announcement.online,
            "announcement"
        );

        if announcement.online {
            // Duplicate ONs for live slots are filtered inside the
            // manager's initialization path.
            Arc::clone(&self.manager).bring_up(announcement.slot);
        } else {
            self.manager.set_offline(announcement.slot).await;
        }
    }

    async fn on_device_event(&self, frame: &Frame) -> bool {
        self.manager.handle_battery_event(frame).await
    }
}
