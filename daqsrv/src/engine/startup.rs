//! Smart-startup regime selection. Engine bring-up is bounded by a caller
//! budget; depending on how much time is available per device, devices are
//! initialized sequentially, screened with a parallel health check, or (in
//! an emergency) mostly deferred to background initialization.

use std::time::Duration;

/// Reserved for core bring-up (queue, timers) before any device work.
pub const STARTUP_RESERVE: Duration = Duration::from_secs(2);
/// Per-device budget of the parallel health check.
pub const HEALTH_CHECK_BUDGET: Duration = Duration::from_secs(2);
/// Devices probed per health-check wave.
pub const HEALTH_CHECK_BATCH: usize = 5;
/// Concurrency of parallel foreground initialization.
pub const INIT_CONCURRENCY: usize = 5;
/// Devices initialized in the foreground in emergency mode.
pub const EMERGENCY_FOREGROUND: usize = 2;
/// Background initialization retries at this interval, indefinitely.
pub const BACKGROUND_RETRY: Duration = Duration::from_secs(300);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartupMode {
    /// Enough time for everyone: initialize sequentially, in two batches.
    Sequential,
    /// Health-check in waves, bring the healthy up in parallel, defer the
    /// rest.
    Parallel,
    /// Almost no time: bring up a couple of critical devices, defer the
    /// rest.
    Emergency,
}

pub fn select_mode(device_count: usize, available: Duration) -> StartupMode {
    if device_count == 0 {
        return StartupMode::Sequential;
    }
    if available < Duration::from_millis(1000) {
        return StartupMode::Emergency;
    }
    if available / device_count as u32 >= Duration::from_millis(1000) {
        StartupMode::Sequential
    } else {
        StartupMode::Parallel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plenty_of_time_runs_sequentially() {
        assert_eq!(
            select_mode(5, Duration::from_secs(28)),
            StartupMode::Sequential
        );
        assert_eq!(
            select_mode(28, Duration::from_secs(28)),
            StartupMode::Sequential
        );
    }

    #[test]
    fn tight_budget_health_checks_in_parallel() {
        assert_eq!(
            select_mode(40, Duration::from_secs(28)),
            StartupMode::Parallel
        );
    }

    #[test]
    fn sub_second_budget_is_an_emergency() {
        assert_eq!(
            select_mode(3, Duration::from_millis(900)),
            StartupMode::Emergency
        );
        assert_eq!(select_mode(3, Duration::ZERO), StartupMode::Emergency);
    }

    #[test]
    fn no_devices_is_trivially_sequential() {
        assert_eq!(select_mode(0, Duration::ZERO), StartupMode::Sequential);
    }
}
