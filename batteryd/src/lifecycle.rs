//! Per-slot device lifecycle: initialization, polling, events.
//!
//! Each receiver slot (or the single direct device) runs through the state
//! machine Created → Initializing → Online → Offline, with Disposed as the
//! terminal state. Initializations are serialized by a manager-wide lock so
//! two arriving devices never interleave their enumeration on the
//! single-lane correlator.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant, SystemTime},
};

use hidpp::{
    battery::{BatteryCapability, BatteryReading},
    cancel::CancelToken,
    command::{commands, registers},
    correlator::{Correlator, ping20},
    features::{FEATURE_DEVICE_INFO, FEATURE_DEVICE_NAME, FEATURE_SET, feature_name},
    frame::Frame,
    metadata::{DeviceType, FirmwareInfo, decode_serial, decode_text, hashed_identifier},
};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::{
    config::EffectiveConfig,
    publish::{Publisher, UpdateSource},
    telemetry::{DeviceInit, DeviceRemove, TelemetrySink},
};

/// The device index used for a directly connected peripheral.
pub const DIRECT_DEVICE_INDEX: u8 = 0xff;

/// Settling time before a freshly announced device is interrogated.
const INIT_STABILIZATION_DELAY: Duration = Duration::from_secs(1);

/// Minimum spacing between processed battery events per slot.
const EVENT_THROTTLE: Duration = Duration::from_millis(500);

/// The ping probe: up to this many pings, looking for a streak of
/// consecutive echoes.
const PING_PROBE_ATTEMPTS: u32 = 10;
const PING_PROBE_STREAK: u32 = 3;

/// How long disposal waits for the polling tasks to wind down.
const POLL_JOIN_BUDGET: Duration = Duration::from_secs(10);

/// The lifecycle states of a device slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum SlotState {
    Created,
    Initializing,
    Online,
    Offline,
    Disposed,
}

impl SlotState {
    /// The legal transition table. Disposed is terminal; Online never jumps
    /// back to Initializing without passing through Offline.
    fn can_transition(self, to: SlotState) -> bool {
        use SlotState::*;

        match (self, to) {
            (Disposed, _) => false,
            (_, Disposed) => true,
            (Created, Initializing) => true,
            (Initializing, Online) => true,
            (Initializing, Offline) => true,
            (Online, Offline) => true,
            (Offline, Initializing) => true,
            _ => false,
        }
    }
}

/// The mutable state of a slot, guarded by the slot's async mutex.
#[derive(Debug)]
pub struct SlotInfo {
    pub state: SlotState,
    pub identifier: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub feature_map: HashMap<u16, u8>,
    pub battery: Option<BatteryCapability>,
    pub battery_feature_index: Option<u8>,
    pub last_update: Instant,
    pub device_on_time: Instant,
    pub consecutive_poll_failures: u32,
    pub force_next_update: bool,
    last_event: Option<Instant>,
}

impl SlotInfo {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            state: SlotState::Created,
            identifier: String::new(),
            device_name: String::new(),
            device_type: DeviceType::Other,
            feature_map: HashMap::new(),
            battery: None,
            battery_feature_index: None,
            last_update: now,
            device_on_time: now,
            consecutive_poll_failures: 0,
            force_next_update: false,
            last_event: None,
        }
    }

    /// Applies a state transition if the table allows it.
    fn transition(&mut self, slot_index: u8, to: SlotState) -> bool {
        if !self.state.can_transition(to) {
            warn!(
                slot = slot_index,
                from = ?self.state,
                ?to,
                "illegal slot state transition ignored"
            );
            return false;
        }

        debug!(slot = slot_index, from = ?self.state, ?to, "slot state transition");
        self.state = to;
        true
    }
}

/// One receiver slot or the direct device.
pub struct Slot {
    pub index: u8,
    pub info: tokio::sync::Mutex<SlotInfo>,
    poll_cancel: StdMutex<Option<CancelToken>>,
}

impl Slot {
    fn new(index: u8) -> Self {
        Self {
            index,
            info: tokio::sync::Mutex::new(SlotInfo::new()),
            poll_cancel: StdMutex::new(None),
        }
    }

    /// Installs a fresh poll cancellation token, cancelling any previous
    /// polling loop.
    fn arm_polling(&self) -> CancelToken {
        let token = CancelToken::new();
        if let Some(previous) = self.poll_cancel.lock().unwrap().replace(token.clone()) {
            previous.cancel();
        }
        token
    }

    /// Stops the slot's polling loop, if any.
    pub fn cancel_polling(&self) {
        if let Some(token) = self.poll_cancel.lock().unwrap().take() {
            token.cancel();
        }
    }
}

/// Why an initialization attempt gave up on a slot.
#[derive(Debug, Error)]
enum InitAbort {
    #[error("device did not answer the ping probe")]
    PingFailed,

    #[error("FeatureSet feature could not be resolved")]
    FeatureSetMissing,

    #[error("feature enumeration returned no features")]
    NoFeatures,

    #[error("device name feature (0x0005) is not supported")]
    NameMissing,

    #[error("device name could not be read")]
    NameUnavailable,

    #[error("device {0:?} is disabled by configuration")]
    Filtered(String),
}

/// Owns every slot and drives their lifecycles.
pub struct DeviceManager {
    slots: StdMutex<HashMap<u8, Arc<Slot>>>,
    init_gate: tokio::sync::Mutex<()>,
    correlator: Arc<Correlator>,
    publisher: Arc<Publisher>,
    sink: Arc<dyn TelemetrySink>,
    config: Arc<EffectiveConfig>,
    receiver_mode: AtomicBool,
    shutdown: CancelToken,
    poll_tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl DeviceManager {
    pub fn new(
        correlator: Arc<Correlator>,
        publisher: Arc<Publisher>,
        sink: Arc<dyn TelemetrySink>,
        config: Arc<EffectiveConfig>,
        shutdown: CancelToken,
    ) -> Self {
        Self {
            slots: StdMutex::new(HashMap::new()),
            init_gate: tokio::sync::Mutex::new(()),
            correlator,
            publisher,
            sink,
            config,
            receiver_mode: AtomicBool::new(false),
            shutdown,
            poll_tasks: StdMutex::new(Vec::new()),
        }
    }

    /// Marks the transport as receiver-backed, which enables the HID++ 1.0
    /// per-slot register writes during initialization.
    pub fn set_receiver_mode(&self, receiver_mode: bool) {
        self.receiver_mode.store(receiver_mode, Ordering::SeqCst);
    }

    pub fn known_slot(&self, index: u8) -> Option<Arc<Slot>> {
        self.slots.lock().unwrap().get(&index).cloned()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    fn ensure_slot(&self, index: u8) -> Arc<Slot> {
        Arc::clone(
            self.slots
                .lock()
                .unwrap()
                .entry(index)
                .or_insert_with(|| Arc::new(Slot::new(index))),
        )
    }

    /// Reacts to an ON announcement (or synthetic direct-device bring-up):
    /// creates the slot if needed and spawns its initialization.
    ///
    /// The actual work runs as a fire-and-forget task so announcement
    /// handling never blocks the router.
    pub fn bring_up(self: Arc<Self>, index: u8) {
        let slot = self.ensure_slot(index);

        tokio::spawn(async move {
            self.initialize(slot).await;
        });
    }

    /// Reacts to an OFF announcement. Unknown slots are phantom events and
    /// ignored.
    pub async fn set_offline(&self, index: u8) {
        let Some(slot) = self.known_slot(index) else {
            debug!(slot = index, "ignoring OFF announcement for unknown slot");
            return;
        };

        let mut info = slot.info.lock().await;
        if info.state != SlotState::Online {
            debug!(slot = index, state = ?info.state, "ignoring OFF announcement");
            return;
        }

        info.transition(index, SlotState::Offline);
        // Identifier and metadata are retained for the next ON.
        info.force_next_update = true;
        let identifier = info.identifier.clone();
        let device_name = info.device_name.clone();
        let has_battery = info.battery.is_some();
        drop(info);

        slot.cancel_polling();
        info!(slot = index, device_name, "device offline");

        if has_battery && self.config.notify_offline {
            self.publisher
                .publish(
                    &identifier,
                    &device_name,
                    BatteryReading::offline(),
                    SystemTime::now(),
                    UpdateSource::Poll,
                    false,
                )
                .await;
        }
    }

    /// Runs one initialization attempt for a slot, serialized against all
    /// other initializations.
    async fn initialize(self: Arc<Self>, slot: Arc<Slot>) {
        // Let the link settle before the first exchange; announcements
        // arrive noticeably before the device answers.
        tokio::select! {
            _ = self.shutdown.cancelled() => return,
            _ = sleep(INIT_STABILIZATION_DELAY) => {},
        }

        let _gate = self.init_gate.lock().await;
        if self.shutdown.is_cancelled() {
            return;
        }

        {
            let mut info = slot.info.lock().await;
            match info.state {
                SlotState::Created | SlotState::Offline => {
                    info.transition(slot.index, SlotState::Initializing);
                },
                // Duplicate ON for a live or already-initializing slot.
                other => {
                    trace!(slot = slot.index, state = ?other, "skipping redundant bring-up");
                    return;
                },
            }
        }

        match self.run_init_sequence(&slot).await {
            Ok(has_battery) => {
                if has_battery {
                    self.update_battery(&slot).await;
                    Arc::clone(&self).spawn_poll_loop(slot);
                }
            },
            Err(abort) => {
                warn!(slot = slot.index, %abort, "initialization aborted");
                slot.info
                    .lock()
                    .await
                    .transition(slot.index, SlotState::Offline);
            },
        }
    }

    /// The init sequence proper. Returns whether the device has a battery
    /// (and therefore wants polling).
    async fn run_init_sequence(&self, slot: &Arc<Slot>) -> Result<bool, InitAbort> {
        let index = slot.index;
        let sw = self.config.software_id;
        let profiles = &self.config.profiles;

        // 1. Ping probe: the device must echo a streak of pings before any
        //    metadata is requested.
        let mut streak = 0;
        for attempt in 1..=PING_PROBE_ATTEMPTS {
            if self.shutdown.is_cancelled() {
                return Err(InitAbort::PingFailed);
            }

            if ping20(&self.correlator, index, sw, profiles.init.timeout_for(attempt)).await {
                streak += 1;
                if streak >= PING_PROBE_STREAK {
                    break;
                }
            } else {
                streak = 0;
                sleep(profiles.ping.delay_for(attempt)).await;
            }
        }
        if streak < PING_PROBE_STREAK {
            return Err(InitAbort::PingFailed);
        }

        // 2. Resolve the FeatureSet index through the root feature.
        let request = commands::get_feature_index(index, sw, FEATURE_SET);
        let response = self
            .correlator
            .send_with_backoff(
                &request,
                move |frame| frame.matches(&request) && frame.device_index() == index,
                &profiles.metadata,
                &self.shutdown,
                Some(Frame::is_error),
            )
            .await
            .ok_or(InitAbort::FeatureSetMissing)?;
        let feature_set_index = response.param(0);
        if feature_set_index == 0 {
            return Err(InitAbort::FeatureSetMissing);
        }

        // 3. Feature count.
        let request = commands::get_feature_count(index, sw, feature_set_index);
        let count = self
            .correlator
            .send_with_backoff(
                &request,
                move |frame| frame.matches(&request) && frame.device_index() == index,
                &profiles.feature_enum,
                &self.shutdown,
                Some(Frame::is_error),
            )
            .await
            .ok_or(InitAbort::NoFeatures)?
            .param(0);

        // 4. Enumerate the feature table. A sustained timeout ends the walk
        //    early with whatever was collected so far.
        let mut feature_map = HashMap::new();
        for position in 0..=count {
            let request = commands::enumerate_feature(index, sw, feature_set_index, position);
            let Some(response) = self
                .correlator
                .send_with_backoff(
                    &request,
                    move |frame| frame.matches(&request) && frame.device_index() == index,
                    &profiles.feature_enum,
                    &self.shutdown,
                    Some(Frame::is_error),
                )
                .await
            else {
                warn!(
                    slot = index,
                    position, "feature enumeration timed out, stopping early"
                );
                break;
            };

            let feature_id = response.param16(0);
            if feature_id == 0 {
                continue;
            }

            trace!(
                slot = index,
                feature_id = %format_args!("{feature_id:#06x}"),
                name = feature_name(feature_id).unwrap_or("?"),
                feature_index = position,
                "enumerated feature"
            );
            feature_map.insert(feature_id, position);
        }
        if feature_map.is_empty() {
            return Err(InitAbort::NoFeatures);
        }

        // 5. Device name, then the disallow list.
        let name_index = *feature_map
            .get(&FEATURE_DEVICE_NAME)
            .ok_or(InitAbort::NameMissing)?;
        let device_name = self
            .read_device_name(index, name_index)
            .await
            .ok_or(InitAbort::NameUnavailable)?;
        if self.config.is_disabled_device(&device_name) {
            return Err(InitAbort::Filtered(device_name));
        }

        // 6. Device type.
        let request = commands::get_device_type(index, sw, name_index);
        let device_type = self
            .correlator
            .send_with_backoff(
                &request,
                move |frame| frame.matches(&request) && frame.device_index() == index,
                &profiles.metadata,
                &self.shutdown,
                Some(Frame::is_error),
            )
            .await
            .map(|response| DeviceType::from(response.param(0)))
            .unwrap_or(DeviceType::Other);

        // 7. Stable identifier: serial, then unitId-modelId, then a hash of
        //    the name.
        let identifier = self
            .resolve_identifier(index, &feature_map)
            .await
            .unwrap_or_else(|| hashed_identifier(&device_name));

        // 8. Battery capability, by fixed priority.
        let mut battery = BatteryCapability::select(index, sw, &feature_map);
        if let Some(capability) = battery.as_mut() {
            capability.bind(&self.correlator, &self.shutdown).await;
            info!(
                slot = index,
                feature = capability.feature_name(),
                feature_index = capability.feature_index(),
                "battery capability bound"
            );
        } else {
            info!(slot = index, device_name, "device exposes no battery feature");
        }

        // 9. Ask the receiver to forward battery broadcasts for this slot.
        //    Best effort; devices answer events either way on most firmware.
        if battery.is_some() && self.receiver_mode.load(Ordering::SeqCst) {
            let request = registers::enable_battery_reports(index);
            let enabled = self
                .correlator
                .send_and_wait(
                    &request,
                    move |frame| {
                        frame.device_index() == index
                            && frame.feature_index() == registers::SUB_ID_SET_REGISTER
                    },
                    profiles.receiver_init.initial_timeout,
                    Some(Frame::is_error),
                )
                .await
                .is_some();
            if !enabled {
                debug!(slot = index, "could not enable battery reports");
            }
        }

        // 10. Commit, announce, go online.
        let has_battery = battery.is_some();
        {
            let mut info = slot.info.lock().await;
            info.identifier = identifier.clone();
            info.device_name = device_name.clone();
            info.device_type = device_type;
            info.battery_feature_index = battery.as_ref().map(|b| b.feature_index());
            info.battery = battery;
            info.feature_map = feature_map;
            info.transition(index, SlotState::Online);
            info.device_on_time = Instant::now();
            info.last_update = Instant::now();
            info.consecutive_poll_failures = 0;
            info.force_next_update = true;
            info.last_event = None;
        }

        info!(
            slot = index,
            device_name,
            identifier,
            device_type = device_type.as_str(),
            has_battery,
            "device online"
        );
        self.sink
            .device_init(DeviceInit {
                identifier: identifier.clone(),
                device_name: device_name.clone(),
                has_battery,
                device_type: device_type.as_str(),
                device_signature: format!("NATIVE.{}.{}", device_type.as_str(), identifier),
            })
            .await;

        Ok(has_battery)
    }

    /// Reads the device name as a length followed by 3-byte chunks.
    async fn read_device_name(&self, index: u8, name_index: u8) -> Option<String> {
        let sw = self.config.software_id;
        let profiles = &self.config.profiles;

        let request = commands::get_device_name_length(index, sw, name_index);
        let length = self
            .correlator
            .send_with_backoff(
                &request,
                move |frame| frame.matches(&request) && frame.device_index() == index,
                &profiles.metadata,
                &self.shutdown,
                Some(Frame::is_error),
            )
            .await?
            .param(0) as usize;
        if length == 0 {
            return None;
        }

        let mut raw = Vec::with_capacity(length + 2);
        while raw.len() < length {
            let request =
                commands::get_device_name_chunk(index, sw, name_index, raw.len() as u8);
            let response = self
                .correlator
                .send_with_backoff(
                    &request,
                    move |frame| frame.matches(&request) && frame.device_index() == index,
                    &profiles.metadata,
                    &self.shutdown,
                    Some(Frame::is_error),
                )
                .await?;
            raw.extend_from_slice(&response.params()[..3]);
        }
        raw.truncate(length);

        let name = decode_text(&raw);
        (!name.is_empty()).then_some(name)
    }

    /// Resolves the firmware identity block and, when supported, the serial
    /// number.
    async fn resolve_identifier(
        &self,
        index: u8,
        feature_map: &HashMap<u16, u8>,
    ) -> Option<String> {
        let info_index = *feature_map.get(&FEATURE_DEVICE_INFO)?;
        let sw = self.config.software_id;
        let profiles = &self.config.profiles;

        let request = commands::get_firmware_info(index, sw, info_index);
        let response = self
            .correlator
            .send_with_backoff(
                &request,
                move |frame| frame.matches(&request) && frame.device_index() == index,
                &profiles.metadata,
                &self.shutdown,
                Some(Frame::is_error),
            )
            .await?;
        let firmware = FirmwareInfo::parse(&response);

        if firmware.serial_supported {
            let request = commands::get_serial_number(index, sw, info_index);
            let serial = self
                .correlator
                .send_with_backoff(
                    &request,
                    move |frame| frame.matches(&request) && frame.device_index() == index,
                    &profiles.metadata,
                    &self.shutdown,
                    Some(Frame::is_error),
                )
                .await
                .as_ref()
                .and_then(decode_serial);
            if let Some(serial) = serial {
                return Some(serial);
            }
        }

        Some(firmware.identifier())
    }

    /// Queries the slot's battery once and publishes the result. Returns
    /// whether the query succeeded.
    async fn update_battery(&self, slot: &Arc<Slot>) -> bool {
        let (capability, identifier, device_name) = {
            let info = slot.info.lock().await;
            let Some(capability) = info.battery.clone() else {
                return false;
            };
            (capability, info.identifier.clone(), info.device_name.clone())
        };

        let reading = capability
            .query(&self.correlator, &self.config.profiles.battery, &self.shutdown)
            .await;

        match reading {
            Some(reading) => {
                let force = {
                    let mut info = slot.info.lock().await;
                    info.last_update = Instant::now();
                    info.consecutive_poll_failures = 0;
                    std::mem::take(&mut info.force_next_update)
                };

                self.publisher
                    .publish(
                        &identifier,
                        &device_name,
                        reading,
                        SystemTime::now(),
                        UpdateSource::Poll,
                        force,
                    )
                    .await;
                true
            },
            None => {
                let mut info = slot.info.lock().await;
                info.consecutive_poll_failures += 1;
                debug!(
                    slot = slot.index,
                    failures = info.consecutive_poll_failures,
                    "battery poll failed"
                );
                false
            },
        }
    }

    /// Starts the slot's polling loop.
    fn spawn_poll_loop(self: Arc<Self>, slot: Arc<Slot>) {
        let token = slot.arm_polling();
        let manager = Arc::clone(&self);

        let handle = tokio::spawn(async move {
            loop {
                let due = {
                    let info = slot.info.lock().await;
                    info.last_update + manager.config.poll_period
                };
                let wait = due.saturating_duration_since(Instant::now());

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = manager.shutdown.cancelled() => break,
                    _ = sleep(wait) => {},
                }

                if !manager.update_battery(&slot).await {
                    // Loop-starvation guard: grow the pause with the
                    // failure count.
                    let failures = slot.info.lock().await.consecutive_poll_failures;
                    let pause = manager.config.profiles.battery.delay_for(failures + 1)
                        + manager.config.retry_time;
                    if !pause.is_zero() {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = manager.shutdown.cancelled() => break,
                            _ = sleep(pause) => {},
                        }
                    }
                }
            }

            trace!(slot = slot.index, "polling loop exited");
        });

        self.poll_tasks.lock().unwrap().push(handle);
    }

    /// Offers an unsolicited frame to its slot. Returns whether the frame
    /// was consumed as a battery event.
    pub async fn handle_battery_event(&self, frame: &Frame) -> bool {
        let Some(slot) = self.known_slot(frame.device_index()) else {
            return false;
        };

        let mut info = slot.info.lock().await;
        let Some(battery_feature_index) = info.battery_feature_index else {
            return false;
        };
        if !frame.is_battery_event(battery_feature_index) {
            return false;
        }

        let now = Instant::now();
        if info
            .last_event
            .is_some_and(|last| now.duration_since(last) < EVENT_THROTTLE)
        {
            trace!(slot = slot.index, "throttling battery event");
            return true;
        }

        let Some(capability) = info.battery.clone() else {
            return false;
        };
        let Some(reading) = capability.parse_event(frame) else {
            // Malformed payloads fall through to the correlator queue.
            return false;
        };
        info.last_event = Some(now);

        // Inside the post-ON window events are consumed but their values
        // are not trusted yet; polling keeps running.
        if now.duration_since(info.device_on_time) < self.config.battery_event_delay {
            debug!(slot = slot.index, "suppressing battery event in post-ON window");
            return true;
        }

        info.last_update = now;
        let force = std::mem::take(&mut info.force_next_update);
        let identifier = info.identifier.clone();
        let device_name = info.device_name.clone();
        drop(info);

        if !self.config.keep_polling_with_events {
            slot.cancel_polling();
        }

        self.publisher
            .publish(
                &identifier,
                &device_name,
                reading,
                SystemTime::now(),
                UpdateSource::Event,
                force,
            )
            .await;

        true
    }

    /// Host-facing removal: tears the slot down and notifies the sink.
    pub async fn remove_slot(&self, index: u8, reason: &str) {
        let Some(slot) = self.slots.lock().unwrap().remove(&index) else {
            return;
        };

        slot.cancel_polling();
        let mut info = slot.info.lock().await;
        info.transition(index, SlotState::Disposed);
        let identifier = info.identifier.clone();
        drop(info);

        if !identifier.is_empty() {
            self.publisher.forget(&identifier).await;
            self.sink
                .device_remove(DeviceRemove {
                    identifier,
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    /// Shuts every slot down: polling is cancelled, poll tasks are joined
    /// within a budget, all slots end up Disposed.
    pub async fn dispose_all(&self) {
        let slots: Vec<Arc<Slot>> = self.slots.lock().unwrap().values().cloned().collect();
        for slot in &slots {
            slot.cancel_polling();
        }

        let handles = std::mem::take(&mut *self.poll_tasks.lock().unwrap());
        let deadline = tokio::time::Instant::now() + POLL_JOIN_BUDGET;
        for handle in handles {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!("polling task did not terminate within the disposal budget");
            }
        }

        for slot in slots {
            let mut info = slot.info.lock().await;
            if info.state != SlotState::Disposed {
                info.transition(slot.index, SlotState::Disposed);
            }
        }
    }
}
