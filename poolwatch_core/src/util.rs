//! Small polling helpers.

use std::time::{Duration, Instant};

/// Poll `cond` until it holds or `timeout` expires. Sleeps `poll_interval`
/// between checks. Returns whether the condition was met.
pub fn wait_until(
    mut cond: impl FnMut() -> bool,
    timeout: Duration,
    poll_interval: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(poll_interval);
    }
}

