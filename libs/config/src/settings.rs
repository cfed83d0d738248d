//! A settings block: raw option values plus the three lease durations.
//! Every scope level owns one (global and network additionally own
//! registered/unregistered overlays).

use std::time::Duration;

use proto::Options;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub options: Options,
    /// Zero means "not set here, ask the parent scope".
    pub default_lease_time: Duration,
    pub max_lease_time: Duration,
    pub free_lease_after: Duration,
}
