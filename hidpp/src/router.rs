//! Inbound frame classification and routing.
//!
//! Every frame read by the transport lands here and is classified in strict
//! order: receiver announcements first, then device-specific unsolicited
//! events, and whatever remains is offered to the correlator as a potential
//! response.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::{
    cancel::CancelToken,
    frame::{Announcement, Frame},
};

/// The capacity of the correlator response queue. When full, the oldest
/// queued frame is dropped to make room.
pub const RESPONSE_QUEUE_CAPACITY: usize = 5;

/// The per-device dispatch surface the router classifies into.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Called for every receiver announcement, regardless of whether the
    /// slot is known.
    async fn on_announcement(&self, announcement: Announcement);

    /// Offers a non-announcement frame to its device slot. Returns whether
    /// the frame was consumed; unconsumed frames flow to the correlator.
    async fn on_device_event(&self, frame: &Frame) -> bool;
}

/// The writing side of the bounded correlator response queue.
#[derive(Clone)]
pub struct ResponseSender {
    tx: flume::Sender<Frame>,
    rx: flume::Receiver<Frame>,
}

impl ResponseSender {
    /// Enqueues a frame, evicting the oldest entry when the queue is full.
    pub fn push(&self, frame: Frame) {
        if let Err(flume::TrySendError::Full(frame)) = self.tx.try_send(frame) {
            let _ = self.rx.try_recv();
            let _ = self.tx.try_send(frame);
            trace!("response queue full, dropped oldest frame");
        }
    }
}

/// Creates the bounded response queue shared by the router (writer) and the
/// correlator (single reader).
pub fn response_queue() -> (ResponseSender, flume::Receiver<Frame>) {
    let (tx, rx) = flume::bounded(RESPONSE_QUEUE_CAPACITY);
    (
        ResponseSender {
            tx,
            rx: rx.clone(),
        },
        rx,
    )
}

/// Spawns the router task over the transport's frame stream.
///
/// The task ends when the stream closes (transport shutdown) or the token
/// is cancelled.
pub fn spawn_router(
    frames: flume::Receiver<Frame>,
    handler: Arc<dyn FrameHandler>,
    responses: ResponseSender,
    cancel: CancelToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                received = frames.recv_async() => match received {
                    Ok(frame) => frame,
                    Err(_) => break,
                },
            };

            if let Some(announcement) = frame.announcement() {
                handler.on_announcement(announcement).await;
                continue;
            }

            if handler.on_device_event(&frame).await {
                continue;
            }

            responses.push(frame);
        }

        trace!("router task exited");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingHandler {
        announcements: Mutex<Vec<Announcement>>,
        handled_features: Vec<u8>,
        events: Mutex<Vec<Frame>>,
    }

    #[async_trait]
    impl FrameHandler for RecordingHandler {
        async fn on_announcement(&self, announcement: Announcement) {
            self.announcements.lock().unwrap().push(announcement);
        }

        async fn on_device_event(&self, frame: &Frame) -> bool {
            if self.handled_features.contains(&frame.feature_index()) {
                self.events.lock().unwrap().push(*frame);
                return true;
            }

            false
        }
    }

    fn frame(feature_index: u8) -> Frame {
        Frame::from_raw(&[0x10, 0x01, feature_index, 0x0a, 0, 0, 0]).unwrap()
    }

    #[tokio::test]
    async fn announcements_win_over_everything() {
        let (frame_tx, frame_rx) = flume::unbounded();
        let handler = Arc::new(RecordingHandler {
            // Even a handler claiming feature 0x41 never sees announcements.
            handled_features: vec![0x41],
            ..Default::default()
        });
        let (responses, _response_rx) = response_queue();
        let task = spawn_router(
            frame_rx,
            Arc::clone(&handler) as Arc<dyn FrameHandler>,
            responses,
            CancelToken::new(),
        );

        frame_tx
            .send(Frame::from_raw(&[0x10, 0x03, 0x41, 0x00, 0x40, 0, 0]).unwrap())
            .unwrap();
        drop(frame_tx);
        task.await.unwrap();

        assert_eq!(
            handler.announcements.lock().unwrap().as_slice(),
            &[Announcement {
                slot: 0x03,
                online: false
            }]
        );
        assert!(handler.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unhandled_frames_reach_the_response_queue() {
        let (frame_tx, frame_rx) = flume::unbounded();
        let handler = Arc::new(RecordingHandler {
            handled_features: vec![0x06],
            ..Default::default()
        });
        let (responses, response_rx) = response_queue();
        let task = spawn_router(
            frame_rx,
            Arc::clone(&handler) as Arc<dyn FrameHandler>,
            responses,
            CancelToken::new(),
        );

        frame_tx.send(frame(0x06)).unwrap();
        frame_tx.send(frame(0x08)).unwrap();
        drop(frame_tx);
        task.await.unwrap();

        assert_eq!(handler.events.lock().unwrap().len(), 1);
        assert_eq!(response_rx.try_recv().unwrap().feature_index(), 0x08);
        assert!(response_rx.try_recv().is_err());
    }

    #[test]
    fn response_queue_drops_oldest_when_full() {
        let (responses, rx) = response_queue();

        for feature_index in 0..7u8 {
            responses.push(frame(feature_index));
        }

        let queued: Vec<u8> = rx.drain().map(|f| f.feature_index()).collect();
        assert_eq!(queued, vec![2, 3, 4, 5, 6]);
    }
}
