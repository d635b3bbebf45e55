//! Client heartbeat scheduling.
//!
//! One scheduler runs per open socket. It only writes; detecting a dead
//! connection is the receive loop's job, so send failures are logged and
//! otherwise ignored.

use crate::error::ClientError;
use async_trait::async_trait;
use bytes::Bytes;
use livedm_protocol::{Frame, Operation};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Body of every client heartbeat.
pub const HEARTBEAT_BODY: &[u8] = b"{}";

/// Write side of a socket as seen by the scheduler.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Returns whether the socket is gone.
    fn is_closed(&self) -> bool;

    async fn send_frame(&self, frame: Bytes) -> Result<(), ClientError>;
}

/// Encodes the heartbeat frame sent by the client.
pub fn heartbeat_frame() -> Result<Bytes, ClientError> {
    Ok(Frame::encode(HEARTBEAT_BODY, Operation::Heartbeat)?)
}

/// Handle to a running heartbeat timer. Dropping it stops the timer.
#[derive(Debug)]
pub struct HeartbeatScheduler {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl HeartbeatScheduler {
    /// Starts sending heartbeats to `sink` every `period`, first tick one
    /// period from now. The timer ends when `cancel` fires, when the
    /// scheduler is dropped, or at the first tick that finds the
    /// socket closed.
    pub fn start(
        sink: Arc<dyn FrameSink>,
        period: Duration,
        cancel: CancellationToken,
        room_id: u64,
    ) -> Result<Self, ClientError> {
        let frame = heartbeat_frame()?;
        let task = tokio::spawn(run(sink, frame, period, cancel.clone(), room_id));
        Ok(Self { cancel, task })
    }

}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

async fn run(
    sink: Arc<dyn FrameSink>,
    frame: Bytes,
    period: Duration,
    cancel: CancellationToken,
    room_id: u64,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if sink.is_closed() {
            return;
        }

        // The next tick is already scheduled by the interval, so a slow
        // send never delays it.
        let sink = sink.clone();
        let frame = frame.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                result = sink.send_frame(frame) => match result {
                    Ok(()) => debug!(room_id, "Sent heartbeat"),
                    Err(e) => warn!(room_id, "Failed to send heartbeat: {}", e),
                },
            }
        });
    }
}
