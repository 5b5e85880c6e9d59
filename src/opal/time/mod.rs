//! RTC "Real-Time Clock" control utilities, and the sleep tick counter.
//!
//! Provides a way to read the current UTC time from the RTC chip. File timestamps are stamped
//! from it on every mutating filesystem operation.

use crate::io::{inb, io_delay, outb, IOPort};
use core::sync::atomic::{AtomicU32, Ordering};

const CMOS_ADDRESS: IOPort = IOPort::new(0x70);
const CMOS_DATA: IOPort = IOPort::new(0x71);

/// A calendar date and wall-clock time, as read from the RTC.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DateTime {
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub day: u8,
    pub month: u8,
    pub year: u16,
}

impl core::fmt::Display for DateTime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!(
            "{}/{}/{} {}:{:02}:{:02}",
            self.month, self.day, self.year, self.hours, self.minutes, self.seconds
        ))
    }
}

/// Reads a registry from the CMOS chip.
///
/// Waits a small delay between write and read.
#[inline]
fn cmos_read(registry: u8) -> u8 {
    outb(CMOS_ADDRESS, registry);
    io_delay();

    inb(CMOS_DATA)
}

/// Checks if the RTC value is being updated (rolls over).
///
/// Bit 7 of Status register A indicates if an update is ongoing (if set).
#[inline]
fn rtc_update_in_progress() -> bool {
    cmos_read(0x0a) & (1 << 7) != 0
}

#[inline]
fn cmos_rtc_read() -> [u8; 6] {
    let seconds = cmos_read(0x00);
    let minutes = cmos_read(0x02);
    let hours = cmos_read(0x04);
    let month_day = cmos_read(0x07);
    let month = cmos_read(0x08);
    let year = cmos_read(0x09);

    [seconds, minutes, hours, month_day, month, year]
}

/// Reads the RTC registers to retrieve the current UTC time, and returns it as a [`DateTime`].
///
/// This should only return consistent values, as it avoids reading during RTC updates.
pub fn now() -> DateTime {
    while rtc_update_in_progress() {}

    let mut last_time = [0u8; 6];
    let mut time = cmos_rtc_read();

    // Read the time twice until the values match.
    while last_time != time {
        last_time = time;
        while rtc_update_in_progress() {}
        time = cmos_rtc_read();
    }

    // If bit 2 of status register B is clear, the registers hold BCD values.
    if (cmos_read(0x0b) & 0x4) == 0 {
        for value in &mut time {
            *value = (*value >> 4) * 10 + (*value & 0x0f);
        }
    }

    // If bit 1 of status register B is clear, the hour is in 12h format, and bit 0x80 of the
    // hours register flags PM.
    if (cmos_read(0x0b) & 0x2) == 0 && (time[2] & 0x80) != 0 {
        time[2] = ((time[2] & 0x7f) + 12) % 24;
    }

    DateTime {
        seconds: time[0],
        minutes: time[1],
        hours: time[2],
        day: time[3],
        month: time[4],
        year: 2000 + u16::from(time[5]),
    }
}

static CLOCK_SOURCE: conquer_once::spin::OnceCell<fn() -> DateTime> =
    conquer_once::spin::OnceCell::uninit();

/// Installs the wall-clock source used for file timestamps.
///
/// The kernel registers [`now`] here once the platform is up; without a registration,
/// timestamps read as all zeroes.
pub fn register_clock(source: fn() -> DateTime) {
    CLOCK_SOURCE.init_once(|| source);
}

/// Current wall-clock time from the registered source.
pub fn current_datetime() -> DateTime {
    CLOCK_SOURCE.get().map_or_else(DateTime::default, |source| source())
}

/// Remaining milliseconds of the currently sleeping task.
///
/// Armed by the `sleep` syscall, drained one unit per timer interrupt.
static SLEEP_TICKS: AtomicU32 = AtomicU32::new(0);

/// Arms the sleep countdown.
pub(crate) fn arm_sleep(milliseconds: u32) {
    SLEEP_TICKS.store(milliseconds, Ordering::Relaxed);
}

/// Remaining milliseconds before the current sleep expires.
pub(crate) fn sleep_remaining() -> u32 {
    SLEEP_TICKS.load(Ordering::Relaxed)
}

/// Timer interrupt entry point.
///
/// The PIT handler (outside of the core) calls this once per millisecond tick.
pub fn timer_tick() {
    let remaining = SLEEP_TICKS.load(Ordering::Relaxed);
    if remaining > 0 {
        SLEEP_TICKS.store(remaining - 1, Ordering::Relaxed);
    }
}
