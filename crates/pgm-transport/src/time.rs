//! # Monotonic Time Source
//!
//! Process-wide microsecond clock shared by every transport in the process.
//!
//! The dispatch loops refresh a cached "now" once per pass with
//! [`update_now`] and then compare deadlines against the cheap [`now`]
//! read, rather than querying the OS per comparison. The cached value is
//! clamped to be non-decreasing for the lifetime of the process, across
//! [`shutdown`]/[`init`] cycles included.
//!
//! Backend selection is by environment:
//!
//! - `PGM_TIMER` ∈ {`tsc`, `hpet`, `rtc`} → calibrated hardware counter
//!   (via `quanta`); anything else (`gtod`, `clock_gettime`, unset) →
//!   `std::time::Instant`.
//! - `PGM_SLEEP` ∈ {`tsc`, `rtc`, `spin`} → spin on the clock for
//!   sub-millisecond precision; anything else → `std::thread::sleep`.
//!
//! The core only requires monotonicity and microsecond resolution.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use once_cell::sync::Lazy;
use quanta::Clock;

/// PGM time: microseconds on the process-wide monotonic clock.
pub type PgmTime = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerBackend {
    /// Calibrated hardware counter.
    Hardware,
    /// OS monotonic clock.
    Os,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SleepBackend {
    /// Block in the scheduler.
    Sleep,
    /// Spin on the clock.
    Spin,
}

struct TimeState {
    timer: TimerBackend,
    sleep: SleepBackend,
    hw_epoch: quanta::Instant,
    os_epoch: Instant,
    wall_epoch: SystemTime,
}

static HW_CLOCK: Lazy<Clock> = Lazy::new(Clock::new);
static STATE: Mutex<Option<TimeState>> = Mutex::new(None);
/// Cached monotonic now; only ever moves forward.
static CACHED_NOW: AtomicU64 = AtomicU64::new(0);

fn timer_from_env() -> TimerBackend {
    match std::env::var("PGM_TIMER") {
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "tsc" | "hpet" | "rtc" => TimerBackend::Hardware,
            _ => TimerBackend::Os,
        },
        Err(_) => TimerBackend::Os,
    }
}

fn sleep_from_env() -> SleepBackend {
    match std::env::var("PGM_SLEEP") {
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "tsc" | "rtc" | "spin" => SleepBackend::Spin,
            _ => SleepBackend::Sleep,
        },
        Err(_) => SleepBackend::Sleep,
    }
}

/// Initialise the time source. Returns `true` on first initialisation,
/// `false` when already initialised (no side effect). Safe to call from
/// multiple threads; initialisation is serialised.
pub fn init() -> bool {
    let mut state = STATE.lock().unwrap_or_else(|e| e.into_inner());
    if state.is_some() {
        return false;
    }
    let timer = timer_from_env();
    let sleep = sleep_from_env();
    *state = Some(TimeState {
        timer,
        sleep,
        hw_epoch: HW_CLOCK.now(),
        os_epoch: Instant::now(),
        wall_epoch: SystemTime::now(),
    });
    tracing::debug!(?timer, ?sleep, "time source initialised");
    true
}

/// Tear down the time source. Returns `true` on the call that shuts down,
/// `false` when already shut down. A later [`init`] succeeds again; the
/// monotonic guarantee of [`now`] carries across the cycle.
pub fn shutdown() -> bool {
    let mut state = STATE.lock().unwrap_or_else(|e| e.into_inner());
    state.take().is_some()
}

/// Whether the time source is currently initialised.
pub fn supported() -> bool {
    STATE.lock().unwrap_or_else(|e| e.into_inner()).is_some()
}

/// Cached monotonic now in microseconds. Cheap; refreshed by [`update_now`].
#[inline]
pub fn now() -> PgmTime {
    CACHED_NOW.load(Ordering::Acquire)
}

/// Refresh the cached now from the selected backend and return it.
/// Non-decreasing across calls.
pub fn update_now() -> PgmTime {
    let raw = {
        let state = STATE.lock().unwrap_or_else(|e| e.into_inner());
        match state.as_ref() {
            Some(s) => match s.timer {
                TimerBackend::Hardware => {
                    HW_CLOCK.now().duration_since(s.hw_epoch).as_micros() as u64
                }
                TimerBackend::Os => s.os_epoch.elapsed().as_micros() as u64,
            },
            // Uninitialised: hold the cached value steady.
            None => return now(),
        }
    };
    CACHED_NOW.fetch_max(raw, Ordering::AcqRel);
    now()
}

/// Sleep for at least `usec` microseconds and return the refreshed now.
pub fn sleep(usec: u64) -> PgmTime {
    let backend = {
        let state = STATE.lock().unwrap_or_else(|e| e.into_inner());
        state.as_ref().map(|s| s.sleep).unwrap_or(SleepBackend::Sleep)
    };
    match backend {
        SleepBackend::Sleep => std::thread::sleep(Duration::from_micros(usec)),
        SleepBackend::Spin => {
            let until = update_now().saturating_add(usec);
            while update_now() < until {
                std::hint::spin_loop();
            }
        }
    }
    update_now()
}

/// Map a PGM timestamp to wall-clock time for human-facing output.
/// Falls back to the Unix epoch offset when the source is not initialised.
pub fn since_epoch(time: PgmTime) -> SystemTime {
    let state = STATE.lock().unwrap_or_else(|e| e.into_inner());
    let base = state
        .as_ref()
        .map(|s| s.wall_epoch)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    base + Duration::from_micros(time)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The source is process-global and other test modules initialise it
    // too, so these tests only ever bring it up — init/shutdown lifecycle
    // ordering is covered by `tests/time_lifecycle.rs`, which runs in its
    // own process.

    #[test]
    fn update_now_is_monotonic() {
        init();
        let mut last = update_now();
        for _ in 0..1000 {
            let t = update_now();
            assert!(t >= last);
            last = t;
        }
    }

    #[test]
    fn cached_now_tracks_update() {
        init();
        let refreshed = update_now();
        assert!(now() >= refreshed);
    }

    #[test]
    fn sleep_elapses_at_least_requested() {
        init();
        let start = update_now();
        let end = sleep(2_000);
        assert!(end >= start + 2_000, "slept only {}µs", end - start);
    }

    #[test]
    fn since_epoch_offsets_linearly() {
        init();
        let t0 = since_epoch(0);
        let t1 = since_epoch(1_000_000);
        assert_eq!(t1.duration_since(t0).unwrap(), Duration::from_secs(1));
    }
}
