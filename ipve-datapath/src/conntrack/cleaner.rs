//! Connection tracking cleanup task.
//!
//! Periodically removes expired entries from every partition. The datapath
//! itself never expires entries; lookups refresh lifetimes and this sweep
//! is the only thing that ends an idle flow.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tracing::{debug, info};

use super::CtMaps;

/// Default cleanup interval in seconds
pub const CLEANUP_INTERVAL_SECS: u64 = 30;

/// Connection tracking cleanup task handle.
pub struct ConnTrackCleaner {
    task: tokio::task::JoinHandle<()>,
}

impl ConnTrackCleaner {
    /// Start a new connection tracking cleanup task.
    pub fn start(ct: Arc<CtMaps>, interval: Duration) -> Self {
        let task = tokio::spawn(async move {
            cleanup_loop(ct, interval).await;
        });

        info!(interval_secs = interval.as_secs(), "Connection tracking cleanup task started");

        Self { task }
    }

    /// Stop the cleanup task.
    pub fn stop(self) {
        self.task.abort();
        info!("Connection tracking cleanup task stopped");
    }
}

/// Main cleanup loop.
async fn cleanup_loop(ct: Arc<CtMaps>, interval: Duration) {
    let mut interval = time::interval(interval);

    loop {
        interval.tick().await;

        let removed = ct.gc();
        if removed > 0 {
            debug!(removed, remaining = ct.len(), "Expired connection tracking entries removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::{CtConfig, CtObservation, CtState};
    use crate::context::Direction;
    use crate::test_util::ManualClock;
    use crate::tuple::CtTuple;
    use ipve_common::IPPROTO_UDP;
    use std::net::Ipv6Addr;

    #[tokio::test(start_paused = true)]
    async fn test_cleaner_sweeps_expired_entries() {
        let clock = Arc::new(ManualClock::new(0));
        let ct = Arc::new(CtMaps::with_clock(CtConfig::default(), clock.clone()));
        let t = CtTuple::new(
            "f00d::1".parse::<Ipv6Addr>().unwrap(),
            "f00d::2".parse().unwrap(),
            IPPROTO_UDP,
            Direction::Egress,
        );
        ct.create(&t, &CtState::default(), &CtObservation::default());

        let cleaner = ConnTrackCleaner::start(ct.clone(), Duration::from_secs(1));
        clock.advance(3600);
        time::sleep(Duration::from_secs(2)).await;

        assert!(ct.is_empty());
        cleaner.stop();
    }
}
