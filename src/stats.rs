//! Stats sink boundary: `stats_handle`, lock/release, `stats_set_flags`,
//! `stats_set_args`, `stats_listener_to_xml`. The actual stats/XML
//! rendering backend is out of scope; this module defines the narrow
//! interface the cache scan and admin listing push through.

use crate::listener::Listener;

/// Sink for FH-level stats pushed during `scan()`: refreshed every 5
/// seconds, latched via `prev_count`.
pub trait StatsSink: Send + Sync {
    fn set_listeners(&self, handle_name: &str, count: i64, peak: i64);
    fn set_outgoing_kbitrate(&self, handle_name: &str, kbps: i64);
    fn clear(&self, handle_name: &str);
}

/// No-op sink for engines that don't wire up real statistics (and for
/// tests that only care about cache/sender behavior).
#[derive(Debug, Default)]
pub struct NullStats;

impl StatsSink for NullStats {
    fn set_listeners(&self, _handle_name: &str, _count: i64, _peak: i64) {}
    fn set_outgoing_kbitrate(&self, _handle_name: &str, _kbps: i64) {}
    fn clear(&self, _handle_name: &str) {}
}

/// Minimal representation of a listener for `stats_listener_to_xml`.
/// The actual XML/XSLT rendering pipeline is out of scope;
/// the admin module only needs a serializable summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSummary {
    pub id: u64,
    pub mount: String,
}

pub fn listener_summary(listener: &Listener, mount: &str) -> ListenerSummary {
    ListenerSummary {
        id: listener.id.0,
        mount: mount.to_string(),
    }
}
