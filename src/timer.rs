//! The timer source, plus the UTC calendar conversion crash reports and
//! report file names need. Everything here is a plain `clock_gettime`, so it
//! is safe to call while handling a fault.

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

fn clock(id: libc::clockid_t) -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out-pointer; the clocks we ask for always exist
    unsafe { libc::clock_gettime(id, &mut ts) };
    ts
}

pub fn initialize_timer_system() {
    if !INITIALIZED.swap(true, Ordering::AcqRel) {
        log::trace!(target: "kdiag::timer", "timer initialized");
    }
}

pub fn shutdown_timer_system() {
    INITIALIZED.store(false, Ordering::Release);
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Monotonic seconds since some fixed point in the past (usually boot)
pub fn seconds() -> f64 {
    let ts = clock(libc::CLOCK_MONOTONIC);
    ts.tv_sec as f64 + ts.tv_nsec as f64 * 1e-9
}

/// Wall-clock `(seconds, microseconds)` since the Unix epoch
pub fn realtime_now() -> (i64, u32) {
    let ts = clock(libc::CLOCK_REALTIME);
    (ts.tv_sec as i64, (ts.tv_nsec / 1000) as u32)
}

/// A UTC calendar time
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UtcTime {
    pub year: i64,
    /// 1-12
    pub month: u32,
    /// 1-31
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl UtcTime {
    pub fn from_unix(secs: i64) -> Self {
        let days = secs.div_euclid(86_400);
        let rem = secs.rem_euclid(86_400) as u32;

        // days since 1970-01-01 to a proleptic Gregorian date, counting in
        // 400-year eras that start on March 1st
        let z = days + 719_468;
        let era = z.div_euclid(146_097);
        let doe = z.rem_euclid(146_097);
        let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
        let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
        let year = yoe + era * 400 + i64::from(month <= 2);

        Self {
            year,
            month,
            day,
            hour: rem / 3600,
            minute: rem / 60 % 60,
            second: rem % 60,
        }
    }

    /// `YYYY-MM-DD_HH-MM-SS`, safe to put in a file name
    pub fn write_file_stamp(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(
            out,
            "{:04}-{:02}-{:02}_{:02}-{:02}-{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

impl fmt::Display for UtcTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}
