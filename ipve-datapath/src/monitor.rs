//! Drop and trace notifications, and the forwarding metrics map.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use ipve_common::*;
use tracing::{debug, info};

use crate::context::Direction;
use crate::error::DropReason;

/// Where a trace event was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObsPoint {
    ToLxc,
    ToProxy,
    ToHost,
    ToStack,
    FromLxc,
}

impl ObsPoint {
    pub const fn code(self) -> u8 {
        match self {
            ObsPoint::ToLxc => TRACE_TO_LXC,
            ObsPoint::ToProxy => TRACE_TO_PROXY,
            ObsPoint::ToHost => TRACE_TO_HOST,
            ObsPoint::ToStack => TRACE_TO_STACK,
            ObsPoint::FromLxc => TRACE_FROM_LXC,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropNotify {
    pub src_label: u32,
    pub dst_label: u32,
    /// Endpoint the event originates from, 0 if none.
    pub source: u16,
    pub ifindex: u32,
    pub reason: DropReason,
    /// Disposition handed back to the caller.
    pub exit_code: i32,
    pub direction: Direction,
    pub len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceNotify {
    pub obs_point: ObsPoint,
    pub src_label: u32,
    pub dst_label: u32,
    pub ifindex: u32,
    /// Connection tracking status code of the packet.
    pub reason: u8,
    /// Number of packet bytes worth capturing, 0 for none.
    pub cap_len: u32,
    pub len: u32,
}

/// Receiver of datapath events.
pub trait Monitor: Send + Sync {
    fn drop_notify(&self, event: &DropNotify);
    fn trace_notify(&self, event: &TraceNotify);
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMonitor;

impl Monitor for LogMonitor {
    fn drop_notify(&self, event: &DropNotify) {
        info!(
            src_label = event.src_label,
            dst_label = event.dst_label,
            source = event.source,
            ifindex = event.ifindex,
            code = event.reason.code(),
            dir = ?event.direction,
            len = event.len,
            "packet dropped: {}",
            event.reason
        );
    }

    fn trace_notify(&self, event: &TraceNotify) {
        debug!(
            obs_point = ?event.obs_point,
            src_label = event.src_label,
            dst_label = event.dst_label,
            ifindex = event.ifindex,
            reason = event.reason,
            cap_len = event.cap_len,
            len = event.len,
            "packet trace"
        );
    }
}

/// Packet and byte counters per (reason, direction).
#[derive(Debug, Default)]
pub struct MetricsMap {
    map: Mutex<HashMap<MetricsKey, MetricsValue>>,
}

impl MetricsMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, reason: u8, dir: Direction, bytes: u64) {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        let value = map.entry(MetricsKey::new(reason, dir.metric_dir())).or_default();
        value.count += 1;
        value.bytes += bytes;
    }

    pub fn forwarded(&self, dir: Direction, bytes: u64) {
        self.update(REASON_FORWARDED, dir, bytes);
    }

    pub fn dropped(&self, reason: DropReason, dir: Direction, bytes: u64) {
        self.update(reason.metrics_reason(), dir, bytes);
    }

    pub fn get(&self, reason: u8, dir: Direction) -> MetricsValue {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&MetricsKey::new(reason, dir.metric_dir()))
            .copied()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<(MetricsKey, MetricsValue)> {
        let map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = map.iter().map(|(k, v)| (*k, *v)).collect();
        out.sort_by_key(|(k, _)| (k.dir, k.reason));
        out
    }
}
