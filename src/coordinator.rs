use crate::device::{Device, Snapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, warn};

pub const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_secs(30);

/// Drives the periodic full-state poll and fans the snapshots out.
///
/// A single task owns the schedule, so there is never more than one refresh
/// in flight: an on-demand request while a refresh is pending simply folds
/// into the next loop iteration. A failed refresh keeps the previous snapshot
/// current for subscribers; transient read failures never tear anything down.
pub struct Coordinator {
    snapshots: broadcast::Sender<Arc<Snapshot>>,
    refresh_now: Arc<Notify>,
    #[allow(unused)] // exists for its drop handler
    poll_task: AbortOnDropHandle<()>,
}

impl Coordinator {
    pub fn spawn(device: Arc<Device>, period: Duration) -> Coordinator {
        let (snapshots, _) = broadcast::channel(16);
        let refresh_now = Arc::new(Notify::new());
        let poll_task = tokio::spawn(poll_loop(
            device,
            period,
            snapshots.clone(),
            Arc::clone(&refresh_now),
        ));
        Coordinator {
            snapshots,
            refresh_now,
            poll_task: AbortOnDropHandle::new(poll_task),
        }
    }

    /// Register an observer. Every successful refresh delivers one snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Snapshot>> {
        self.snapshots.subscribe()
    }

    /// Ask for a refresh ahead of schedule, e.g. right after a mutation.
    ///
    /// Multiple requests (and a request racing the periodic tick) collapse
    /// into a single refresh.
    pub fn request_refresh(&self) {
        self.refresh_now.notify_one();
    }
}

async fn poll_loop(
    device: Arc<Device>,
    period: Duration,
    snapshots: broadcast::Sender<Arc<Snapshot>>,
    refresh_now: Arc<Notify>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = refresh_now.notified() => {
                // An early refresh replaces the upcoming scheduled one.
                interval.reset();
            }
        }
        match device.refresh_all().await {
            Ok(snapshot) => {
                debug!(message = "publishing refreshed snapshot");
                // Nobody listening is fine; the device cache is current
                // either way.
                let _ = snapshots.send(Arc::new(snapshot));
            }
            Err(error) => {
                warn!(
                    message = "refresh failed, subscribers keep the previous snapshot",
                    error = &error as &dyn std::error::Error,
                );
            }
        }
    }
}
