//! Priority bands, ordered lowest-runs-first.
//!
//! Declaration order is derive-significant: `#[derive(Ord)]` compares by
//! discriminant, so `Wakeup < Highest < ... < Lowest < Never` falls out of
//! listing the variants in that order, matching the required ordering in
//! spec §6.

/// A handler's scheduling band. Lower runs earlier; `Never` is routable but
/// is never scheduled directly by the executor (it backs ephemeral
/// `wait_until` terminals, which are woken explicitly by `_check_wait`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Wakeup,
    Highest,
    High,
    Normal,
    Low,
    Lowest,
    Never,
}

impl Priority {
    /// All schedulable bands in ascending (earliest-first) order, excluding
    /// `Never`.
    pub fn scheduled_bands() -> [Priority; 6] {
        [
            Priority::Wakeup,
            Priority::Highest,
            Priority::High,
            Priority::Normal,
            Priority::Low,
            Priority::Lowest,
        ]
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}
