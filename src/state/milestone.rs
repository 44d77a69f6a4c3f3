//! Node-count milestone detection
//!
//! Counts can jump past a boundary within one session, so a milestone is
//! reported when a boundary lies between the previous and current counts,
//! not when the current count happens to be a multiple.

/// Returns the highest boundary `k * interval` with `previous < k * interval <= current`
///
/// # Arguments
///
/// * `previous` - Node count at the end of the previous session
/// * `current` - Node count now
/// * `interval` - Boundary spacing; `0` disables milestones
pub fn check_milestone(previous: u64, current: u64, interval: u64) -> Option<u64> {
    if interval == 0 || current <= previous {
        return None;
    }

    let boundary = (current / interval) * interval;
    if boundary > previous && boundary > 0 {
        Some(boundary)
    } else {
        None
    }
}

/// Whether any boundary was crossed between `previous` and `current`
pub fn crossed_milestone(previous: u64, current: u64, interval: u64) -> bool {
    check_milestone(previous, current, interval).is_some()
}
