//! Periodic re-publishing of `hs` and `join-req` while a peer waits for
//! its room key.
//!
//! The first copy goes out when the session starts; this task repeats it
//! every interval until it is cancelled. Cancellation happens on
//! admission, on rejection, or when the session or node shuts down (the
//! token is a child of the session token).

use std::sync::Arc;
use std::time::Duration;

use murmur_transport::Transport;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A running rebroadcast loop.
pub struct Rebroadcast {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Rebroadcast {
    /// Start re-publishing `frames` to `topic` every `period`.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        topic: String,
        frames: Vec<Vec<u8>>,
        period: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let token = parent.child_token();
        let cancel = token.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        debug!(topic = %topic, "rebroadcasting handshake and join request");
                        for frame in &frames {
                            if let Err(e) = transport.publish(&topic, frame.clone()).await {
                                warn!(topic = %topic, error = %e, "rebroadcast publish failed");
                            }
                        }
                    }
                }
            }
            debug!(topic = %topic, "rebroadcast stopped");
        });
        Self { token, task }
    }

    /// Stop re-publishing. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the loop has been told to stop.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel and wait for the loop to exit.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "rebroadcast task ended abnormally");
        }
    }
}
