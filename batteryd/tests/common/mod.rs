//! Test doubles: in-memory HID endpoints scripted to behave like a
//! receiver with paired devices.

use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

use hidpp::transport::{RawHidEndpoint, ReadOutcome};

const SHORT_LEN: usize = 7;
const LONG_LEN: usize = 20;

type Responder = dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync;

/// A pair of in-memory endpoints sharing one hub, mirroring how a hidraw
/// node carries both report streams.
pub struct ScriptedHub {
    state: Mutex<HubState>,
    available: Condvar,
    responder: Mutex<Option<Box<Responder>>>,
}

#[derive(Default)]
struct HubState {
    short_queue: VecDeque<Vec<u8>>,
    long_queue: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    closed: bool,
}

impl ScriptedHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState::default()),
            available: Condvar::new(),
            responder: Mutex::new(None),
        })
    }

    pub fn set_responder(
        &self,
        responder: impl Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static,
    ) {
        *self.responder.lock().unwrap() = Some(Box::new(responder));
    }

    /// Injects an unsolicited inbound report (event or announcement).
    pub fn push_inbound(&self, report: &[u8]) {
        let mut state = self.state.lock().unwrap();
        Self::enqueue(&mut state, report.to_vec());
        drop(state);
        self.available.notify_all();
    }

    #[allow(dead_code)]
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().written.clone()
    }

    pub fn endpoints(hub: &Arc<Self>) -> (Arc<ScriptedEndpoint>, Arc<ScriptedEndpoint>) {
        (
            Arc::new(ScriptedEndpoint {
                hub: Arc::clone(hub),
                frame_size: SHORT_LEN,
            }),
            Arc::new(ScriptedEndpoint {
                hub: Arc::clone(hub),
                frame_size: LONG_LEN,
            }),
        )
    }

    fn enqueue(state: &mut HubState, report: Vec<u8>) {
        if report.len() == SHORT_LEN {
            state.short_queue.push_back(report);
        } else {
            state.long_queue.push_back(report);
        }
    }
}

pub struct ScriptedEndpoint {
    hub: Arc<ScriptedHub>,
    frame_size: usize,
}

impl RawHidEndpoint for ScriptedEndpoint {
    fn write(&self, report: &[u8]) -> io::Result<()> {
        let responses = self
            .hub
            .responder
            .lock()
            .unwrap()
            .as_ref()
            .map(|responder| responder(report))
            .unwrap_or_default();

        let mut state = self.hub.state.lock().unwrap();
        state.written.push(report.to_vec());
        for response in responses {
            ScriptedHub::enqueue(&mut state, response);
        }
        drop(state);
        self.hub.available.notify_all();

        Ok(())
    }

    fn read(&self, buf: &mut [u8], timeout_ms: i32) -> ReadOutcome {
        let timeout = Duration::from_millis(timeout_ms.max(0) as u64);
        let mut state = self.hub.state.lock().unwrap();

        loop {
            if state.closed {
                return ReadOutcome::Closed;
            }

            let queue = if self.frame_size == SHORT_LEN {
                &mut state.short_queue
            } else {
                &mut state.long_queue
            };

            if let Some(report) = queue.pop_front() {
                buf[..report.len()].copy_from_slice(&report);
                return ReadOutcome::Data(report.len());
            }

            let (next, wait) = self.hub.available.wait_timeout(state, timeout).unwrap();
            state = next;
            if wait.timed_out() {
                return ReadOutcome::TimedOut;
            }
        }
    }

    fn close(&self) {
        self.hub.state.lock().unwrap().closed = true;
        self.hub.available.notify_all();
    }
}

fn short(bytes: [u8; 7]) -> Vec<u8> {
    bytes.to_vec()
}

fn long(device_index: u8, feature_index: u8, fn_and_sw: u8, params: &[u8]) -> Vec<u8> {
    let mut report = vec![0u8; LONG_LEN];
    report[0] = 0x11;
    report[1] = device_index;
    report[2] = feature_index;
    report[3] = fn_and_sw;
    report[4..4 + params.len()].copy_from_slice(params);
    report
}

/// The scripted receiver: one paired mouse in slot 1.
///
/// Feature table: 0=Root, 1=FeatureSet, 2=DeviceInformation,
/// 3=DeviceTypeAndName, 4=BatteryStatus, 5=WirelessDeviceStatus.
pub fn receiver_with_one_device(request: &[u8]) -> Vec<Vec<u8>> {
    let device_index = request[1];
    let sub = request[2];
    let byte3 = request[3];

    // HID++ 1.0 receiver registers.
    if device_index == 0xff {
        return match (sub, byte3) {
            // Device count: one paired device.
            (0x81, 0x02) => vec![short([0x10, 0xff, 0x81, 0x02, 0x00, 0x01, 0x00])],
            // Enable notifications: plain echo.
            (0x80, 0x00) => vec![short([0x10, 0xff, 0x80, 0x00, 0x00, 0x00, 0x00])],
            // Arrival trigger: echo, then the slot-1 ON announcement.
            (0x80, 0x02) => vec![
                short([0x10, 0xff, 0x80, 0x02, 0x00, 0x00, 0x00]),
                short([0x10, 0x01, 0x41, 0x04, 0x00, 0x00, 0x00]),
            ],
            _ => Vec::new(),
        };
    }

    if device_index != 0x01 {
        return Vec::new();
    }

    // Per-slot notification register write.
    if sub == 0x80 {
        return vec![short([0x10, 0x01, 0x80, 0x00, 0x10, 0x00, 0x00])];
    }

    let function = byte3 >> 4;
    let sw = byte3 & 0x0f;
    let name = b"MX Mouse";

    match (sub, function) {
        // Root: feature index lookup (FeatureSet lives at index 1).
        (0x00, 0x0) => vec![short([0x10, 0x01, 0x00, sw, 0x01, 0x00, 0x00])],
        // Root: ping echo.
        (0x00, 0x1) => vec![short([0x10, 0x01, 0x00, sw, 0x00, 0x00, request[6]])],
        // FeatureSet: count (5 features beyond the root).
        (0x01, 0x0) => vec![short([0x10, 0x01, 0x01, sw, 0x05, 0x00, 0x00])],
        // FeatureSet: enumerate, feature ID big-endian.
        (0x01, 0x1) => {
            let id: u16 = match request[4] {
                1 => 0x0001,
                2 => 0x0003,
                3 => 0x0005,
                4 => 0x1000,
                5 => 0x1d4b,
                _ => 0x0000,
            };
            vec![short([
                0x10,
                0x01,
                0x01,
                sw,
                (id >> 8) as u8,
                id as u8,
                0x00,
            ])]
        },
        // DeviceInformation: firmware block (unit ID, model ID, serial bit).
        (0x02, 0x0) => {
            let mut params = [0u8; 16];
            params[1..5].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd]);
            params[7..12].copy_from_slice(&[0x01, 0x02, 0x03, 0x04, 0x05]);
            params[14] = 0x01;
            vec![long(0x01, 0x02, sw, &params)]
        },
        // DeviceInformation: serial number.
        (0x02, 0x2) => vec![long(0x01, 0x02, sw, b"SN12345678AB")],
        // DeviceTypeAndName: name length.
        (0x03, 0x0) => vec![short([0x10, 0x01, 0x03, sw, name.len() as u8, 0x00, 0x00])],
        // DeviceTypeAndName: 3-byte name chunk.
        (0x03, 0x1) => {
            let offset = request[4] as usize;
            let mut chunk = [0u8; 3];
            for (i, byte) in chunk.iter_mut().enumerate() {
                *byte = name.get(offset + i).copied().unwrap_or(0);
            }
            vec![short([
                0x10, 0x01, 0x03, sw, chunk[0], chunk[1], chunk[2],
            ])]
        },
        // DeviceTypeAndName: device type (3 = mouse).
        (0x03, 0x2) => vec![short([0x10, 0x01, 0x03, sw, 0x03, 0x00, 0x00])],
        // BatteryStatus: 85 percent, charging.
        (0x04, 0x0) => vec![short([0x10, 0x01, 0x04, sw, 0x55, 0x03, 0x02])],
        _ => Vec::new(),
    }
}

/// Polls a condition until it holds or the budget runs out.
pub async fn wait_for(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let end = tokio::time::Instant::now() + deadline;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= end {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
