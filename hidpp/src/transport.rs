//! The byte-level HID transport adapter and its reader threads.
//!
//! The daemon consumes two platform HID handles, one per report stream
//! (7-byte SHORT, 20-byte LONG). Each handle gets a dedicated OS thread
//! performing blocking reads with a short timeout; decoded frames cross
//! into the async world through a flume channel consumed by the router.

use std::{
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, trace, warn};

use crate::frame::{Frame, LONG_FRAME_LENGTH, SHORT_FRAME_LENGTH};

/// The blocking-read timeout used by the reader threads. Short enough for a
/// tripped stop flag to be observed promptly.
pub const READ_TIMEOUT_MS: i32 = 100;

/// How long shutdown waits for each reader thread to exit.
const READER_EXIT_BUDGET: Duration = Duration::from_secs(5);

/// The outcome of a single endpoint read.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReadOutcome {
    /// A report of the given size was read into the buffer.
    Data(usize),

    /// The timeout elapsed without a report.
    TimedOut,

    /// The handle is gone. The reader terminates on this.
    Closed,
}

/// A platform HID handle for one report stream.
///
/// Implementations are provided by the surrounding host; the daemon only
/// consumes this capability. `read` blocks up to `timeout_ms` milliseconds.
pub trait RawHidEndpoint: Send + Sync + 'static {
    /// Writes one complete report.
    fn write(&self, report: &[u8]) -> io::Result<()>;

    /// Reads one complete report into `buf`, waiting at most `timeout_ms`.
    fn read(&self, buf: &mut [u8], timeout_ms: i32) -> ReadOutcome;

    /// Releases the underlying handle. Must be idempotent.
    fn close(&self);
}

/// Owns the two endpoints and their reader threads.
pub struct Transport {
    short: Arc<dyn RawHidEndpoint>,
    long: Arc<dyn RawHidEndpoint>,
    stop: Arc<AtomicBool>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    frames: flume::Receiver<Frame>,
    disposed: AtomicBool,
}

impl Transport {
    /// Starts the reader threads over a freshly bound endpoint pair.
    pub fn start(short: Arc<dyn RawHidEndpoint>, long: Arc<dyn RawHidEndpoint>) -> Arc<Self> {
        let (frame_tx, frame_rx) = flume::unbounded();
        let stop = Arc::new(AtomicBool::new(false));

        let readers = vec![
            spawn_reader(
                "hidpp-short",
                Arc::clone(&short),
                SHORT_FRAME_LENGTH,
                frame_tx.clone(),
                Arc::clone(&stop),
            ),
            spawn_reader(
                "hidpp-long",
                Arc::clone(&long),
                LONG_FRAME_LENGTH,
                frame_tx,
                Arc::clone(&stop),
            ),
        ];

        Arc::new(Self {
            short,
            long,
            stop,
            readers: Mutex::new(readers),
            frames: frame_rx,
            disposed: AtomicBool::new(false),
        })
    }

    /// Writes a frame to the endpoint matching its report size.
    pub fn write(&self, frame: &Frame) -> io::Result<()> {
        match frame {
            Frame::Short(_) => self.short.write(frame.as_bytes()),
            Frame::Long(_) => self.long.write(frame.as_bytes()),
        }
    }

    /// The inbound frame stream fed by both readers.
    pub fn frames(&self) -> flume::Receiver<Frame> {
        self.frames.clone()
    }

    /// Stops the readers and closes both endpoints.
    ///
    /// Idempotent; later calls are no-ops. Readers get up to 5 seconds to
    /// exit before being abandoned with a warning.
    pub fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.stop.store(true, Ordering::SeqCst);

        let handles = std::mem::take(&mut *self.readers.lock().unwrap());
        let deadline = Instant::now() + READER_EXIT_BUDGET;
        for handle in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }

            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!(thread = ?handle.thread().name(), "reader did not exit in time");
            }
        }

        self.short.close();
        self.long.close();
        debug!("transport disposed");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_reader(
    name: &'static str,
    endpoint: Arc<dyn RawHidEndpoint>,
    frame_size: usize,
    frames: flume::Sender<Frame>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut buf = vec![0u8; frame_size];

            loop {
                if stop.load(Ordering::SeqCst) {
                    break;
                }

                match endpoint.read(&mut buf, READ_TIMEOUT_MS) {
                    ReadOutcome::TimedOut => continue,
                    ReadOutcome::Closed => {
                        warn!(reader = name, "endpoint closed, reader terminating");
                        break;
                    },
                    ReadOutcome::Data(len) => {
                        let Some(frame) = Frame::from_raw(&buf[..len]) else {
                            if len > 0 && Frame::is_dj_report_id(buf[0]) {
                                trace!(reader = name, "skipping DJ report");
                            } else {
                                debug!(reader = name, len, "dropping unparseable report");
                            }
                            continue;
                        };

                        if frames.send(frame).is_err() {
                            // The async side is gone; nothing left to do.
                            break;
                        }
                    },
                }
            }
        })
        .expect("reader thread spawn failed")
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        collections::VecDeque,
        sync::{Condvar, Mutex},
        time::Duration,
    };

    use super::*;
    use crate::frame::{LONG_FRAME_LENGTH, SHORT_FRAME_LENGTH};

    type Responder = dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync;

    /// A pair of in-memory endpoints sharing one hub. Written requests can
    /// be answered by a scripted responder whose replies are routed to the
    /// endpoint matching their report length.
    pub struct MockHub {
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

    impl MockHub {
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

        /// Injects an unsolicited inbound report.
        pub fn push_inbound(&self, report: &[u8]) {
            let mut state = self.state.lock().unwrap();
            Self::enqueue(&mut state, report.to_vec());
            drop(state);
            self.available.notify_all();
        }

        pub fn written(&self) -> Vec<Vec<u8>> {
            self.state.lock().unwrap().written.clone()
        }

        pub fn close(&self) {
            self.state.lock().unwrap().closed = true;
            self.available.notify_all();
        }

        pub fn endpoints(hub: &Arc<Self>) -> (Arc<MockEndpoint>, Arc<MockEndpoint>) {
            (
                Arc::new(MockEndpoint {
                    hub: Arc::clone(hub),
                    frame_size: SHORT_FRAME_LENGTH,
                }),
                Arc::new(MockEndpoint {
                    hub: Arc::clone(hub),
                    frame_size: LONG_FRAME_LENGTH,
                }),
            )
        }

        fn enqueue(state: &mut HubState, report: Vec<u8>) {
            if report.len() == SHORT_FRAME_LENGTH {
                state.short_queue.push_back(report);
            } else {
                state.long_queue.push_back(report);
            }
        }

        fn record_write(&self, report: &[u8]) {
            let responses = self
                .responder
                .lock()
                .unwrap()
                .as_ref()
                .map(|responder| responder(report))
                .unwrap_or_default();

            let mut state = self.state.lock().unwrap();
            state.written.push(report.to_vec());
            for response in responses {
                Self::enqueue(&mut state, response);
            }
            drop(state);
            self.available.notify_all();
        }
    }

    pub struct MockEndpoint {
        hub: Arc<MockHub>,
        frame_size: usize,
    }

    impl RawHidEndpoint for MockEndpoint {
        fn write(&self, report: &[u8]) -> io::Result<()> {
            self.hub.record_write(report);
            Ok(())
        }

        fn read(&self, buf: &mut [u8], timeout_ms: i32) -> ReadOutcome {
            let deadline = Duration::from_millis(timeout_ms.max(0) as u64);
            let mut state = self.hub.state.lock().unwrap();

            loop {
                if state.closed {
                    return ReadOutcome::Closed;
                }

                let queue = if self.frame_size == SHORT_FRAME_LENGTH {
                    &mut state.short_queue
                } else {
                    &mut state.long_queue
                };

                if let Some(report) = queue.pop_front() {
                    buf[..report.len()].copy_from_slice(&report);
                    return ReadOutcome::Data(report.len());
                }

                let (next, timeout) = self
                    .hub
                    .available
                    .wait_timeout(state, deadline)
                    .unwrap();
                state = next;
                if timeout.timed_out() {
                    return ReadOutcome::TimedOut;
                }
            }
        }

        fn close(&self) {
            self.hub.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{testing::MockHub, *};

    #[tokio::test]
    async fn readers_forward_parsed_frames() {
        let hub = MockHub::new();
        let (short, long) = MockHub::endpoints(&hub);
        let transport = Transport::start(short, long);
        let frames = transport.frames();

        hub.push_inbound(&[0x10, 0x01, 0x00, 0x1a, 0x00, 0x00, 0x55]);
        let mut long_report = [0u8; 20];
        long_report[0] = 0x11;
        long_report[1] = 0x02;
        hub.push_inbound(&long_report);

        let first = frames.recv_async().await.unwrap();
        let second = frames.recv_async().await.unwrap();
        let mut devices = [first.device_index(), second.device_index()];
        devices.sort_unstable();

        assert_eq!(devices, [0x01, 0x02]);
        transport.shutdown();
    }

    #[tokio::test]
    async fn writes_route_by_frame_size() {
        let hub = MockHub::new();
        let (short, long) = MockHub::endpoints(&hub);
        let transport = Transport::start(short, long);

        let frame = Frame::from_raw(&[0x10, 0x01, 0x00, 0x1a, 0, 0, 0x55]).unwrap();
        transport.write(&frame).unwrap();

        assert_eq!(hub.written().len(), 1);
        assert_eq!(hub.written()[0].len(), 7);
        transport.shutdown();
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let hub = MockHub::new();
        let (short, long) = MockHub::endpoints(&hub);
        let transport = Transport::start(short, long);

        transport.shutdown();
        transport.shutdown();
    }
}
