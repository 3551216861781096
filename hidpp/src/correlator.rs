//! The command/response correlator.
//!
//! HID++ frames carry no request ID, so the only way to bind a response to
//! its request is to keep a single request in flight at a time and match
//! inbound frames against a caller-supplied predicate. A process-wide
//! binary lock provides that serialization; its short acquisition timeout
//! keeps unrelated callers from queueing behind an unresponsive device.

use std::{sync::Arc, time::Duration};

use tracing::{debug, trace};

use crate::{
    backoff::BackoffProfile,
    cancel::CancelToken,
    command::commands,
    frame::Frame,
    nibble::U4,
    transport::Transport,
};

/// How long a caller may wait for the serialization lock before giving up.
pub const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(100);

/// An early-exit predicate; a matching frame aborts the wait immediately.
/// Checked before the response matcher, so a frame satisfying both counts
/// as an early exit.
pub type EarlyExit = fn(&Frame) -> bool;

/// Serializes outbound requests and binds each to its single response.
pub struct Correlator {
    transport: Arc<Transport>,
    gate: tokio::sync::Mutex<()>,
    responses: flume::Receiver<Frame>,
}

impl Correlator {
    /// Creates a correlator over the transport and the router's response
    /// queue. The correlator is the queue's only reader.
    pub fn new(transport: Arc<Transport>, responses: flume::Receiver<Frame>) -> Self {
        Self {
            transport,
            gate: tokio::sync::Mutex::new(()),
            responses,
        }
    }

    /// Sends a frame and waits for the response selected by `matcher`.
    ///
    /// Returns [`None`] when the serialization lock cannot be acquired
    /// within [`LOCK_ACQUIRE_TIMEOUT`], when the deadline expires, when the
    /// write fails, or when `early_exit` matches an inbound frame first.
    /// Unrelated inbound frames are discarded and the wait continues.
    pub async fn send_and_wait(
        &self,
        frame: &Frame,
        matcher: impl Fn(&Frame) -> bool,
        timeout: Duration,
        early_exit: Option<EarlyExit>,
    ) -> Option<Frame> {
        let _guard = tokio::time::timeout(LOCK_ACQUIRE_TIMEOUT, self.gate.lock())
            .await
            .ok()?;

        // Whatever is queued now belongs to an abandoned wait.
        while self.responses.try_recv().is_ok() {}

        if let Err(err) = self.transport.write(frame) {
            debug!(%err, "request write failed");
            return None;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let received =
                tokio::time::timeout_at(deadline, self.responses.recv_async()).await;
            let Ok(Ok(candidate)) = received else {
                return None;
            };

            if early_exit.is_some_and(|exit| exit(&candidate)) {
                debug!(
                    feature_index = candidate.feature_index(),
                    "early exit on inbound frame"
                );
                return None;
            }

            if matcher(&candidate) {
                return Some(candidate);
            }

            trace!(
                feature_index = candidate.feature_index(),
                "discarding unrelated frame"
            );
        }
    }

    /// Re-executes [`Self::send_and_wait`] per backoff attempt, sleeping
    /// each attempt's delay and using its timeout, until the first response
    /// or profile exhaustion.
    pub async fn send_with_backoff(
        &self,
        frame: &Frame,
        matcher: impl Fn(&Frame) -> bool,
        profile: &BackoffProfile,
        cancel: &CancelToken,
        early_exit: Option<EarlyExit>,
    ) -> Option<Frame> {
        profile
            .run(cancel, |attempt| {
                if attempt.number > 1 {
                    trace!(
                        profile = profile.name,
                        attempt = attempt.number,
                        "retrying request"
                    );
                }

                self.send_and_wait(frame, &matcher, attempt.timeout, early_exit)
            })
            .await
    }
}

/// Pings a device and verifies the echoed payload byte.
///
/// The payload is randomized so stale echoes from earlier probes cannot
/// satisfy the check.
pub async fn ping20(
    correlator: &Correlator,
    device_index: u8,
    software_id: U4,
    timeout: Duration,
) -> bool {
    let data: u8 = rand::random();
    let request = commands::ping(device_index, software_id, data);

    let response = correlator
        .send_and_wait(
            &request,
            |frame| frame.matches(&request) && frame.device_index() == device_index,
            timeout,
            Some(Frame::is_error),
        )
        .await;

    response.is_some_and(|frame| frame.param(2) == data)
}
