//! Linux hidraw host adapter.
//!
//! hidraw delivers every input report of a node on every open file
//! descriptor, while the daemon core wants one endpoint per report stream.
//! The adapter therefore opens the node once per stream and filters inbound
//! reports by report ID and size; writes pass through untouched.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    os::fd::AsFd,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use hidpp::{
    frame::{LONG_FRAME_LENGTH, LONG_REPORT_ID, SHORT_FRAME_LENGTH, SHORT_REPORT_ID},
    transport::{RawHidEndpoint, ReadOutcome},
};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::debug;

/// Larger than any HID++ report; oversized foreign reports are read whole
/// and discarded.
const SCRATCH_SIZE: usize = 64;

/// One report stream over a hidraw node.
pub struct HidrawEndpoint {
    file: File,
    report_id: u8,
    frame_size: usize,
    closed: AtomicBool,
}

impl HidrawEndpoint {
    fn open(path: &Path, report_id: u8, frame_size: usize) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self {
            file,
            report_id,
            frame_size,
            closed: AtomicBool::new(false),
        })
    }
}

/// Opens the SHORT and LONG endpoints over one hidraw node.
pub fn open_endpoints(path: &Path) -> io::Result<(Arc<HidrawEndpoint>, Arc<HidrawEndpoint>)> {
    let short = HidrawEndpoint::open(path, SHORT_REPORT_ID, SHORT_FRAME_LENGTH)?;
    let long = HidrawEndpoint::open(path, LONG_REPORT_ID, LONG_FRAME_LENGTH)?;
    debug!(path = %path.display(), "hidraw endpoints opened");

    Ok((Arc::new(short), Arc::new(long)))
}

impl RawHidEndpoint for HidrawEndpoint {
    fn write(&self, report: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "endpoint closed"));
        }

        (&self.file).write_all(report)
    }

    fn read(&self, buf: &mut [u8], timeout_ms: i32) -> ReadOutcome {
        if self.closed.load(Ordering::SeqCst) {
            return ReadOutcome::Closed;
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms.max(0) as u64);
        let mut scratch = [0u8; SCRATCH_SIZE];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return ReadOutcome::TimedOut;
            }

            let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
            let timeout =
                PollTimeout::from(remaining.as_millis().min(u16::MAX as u128) as u16);
            match poll(&mut fds, timeout) {
                Ok(0) => return ReadOutcome::TimedOut,
                Ok(_) => {
                    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                    if revents.intersects(
                        PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL,
                    ) {
                        return ReadOutcome::Closed;
                    }

                    match (&self.file).read(&mut scratch) {
                        Ok(0) => return ReadOutcome::Closed,
                        Ok(len) => {
                            if len == self.frame_size && scratch[0] == self.report_id {
                                buf[..len].copy_from_slice(&scratch[..len]);
                                return ReadOutcome::Data(len);
                            }
                            // A report for the other stream; keep waiting
                            // within this read's budget.
                        },
                        Err(err)
                            if matches!(
                                err.kind(),
                                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                            ) => {},
                        Err(_) => return ReadOutcome::Closed,
                    }
                },
                Err(nix::errno::Errno::EINTR) => {},
                Err(_) => return ReadOutcome::Closed,
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
