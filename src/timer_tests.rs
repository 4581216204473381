//! In-kernel tests for the timers and the wall clock

use alloc::vec::Vec;

use crate::console;
use crate::timer::{self, DateTime};

pub fn run_all() -> bool {
    console::print("\n========== Timer Tests ==========\n");

    let mut all_pass = true;
    let mut failed_tests: Vec<&str> = Vec::new();

    macro_rules! run_test {
        ($test_fn:expr, $name:expr) => {
            if !$test_fn() {
                all_pass = false;
                failed_tests.push($name);
            }
        };
    }

    run_test!(test_monotonic_non_decreasing, "monotonic_non_decreasing");
    run_test!(test_epoch_datetime, "epoch_datetime");
    run_test!(test_known_dates, "known_dates");
    run_test!(test_leap_day, "leap_day");
    run_test!(test_datetime_roundtrip, "datetime_roundtrip");
    run_test!(test_format_parse_roundtrip, "format_parse_roundtrip");
    run_test!(test_wall_unsynced_reads_zero, "wall_unsynced_reads_zero");
    run_test!(test_manual_set_then_sync, "manual_set_then_sync");
    run_test!(test_freq_ppm_clamp, "freq_ppm_clamp");
    run_test!(test_slew_is_gradual, "slew_is_gradual");
    run_test!(test_timezone_offset, "timezone_offset");

    console::print("\n=================================\n");
    if all_pass {
        console::print("Timer Tests: ALL PASSED\n");
    } else {
        crate::safe_print!(64, "Timer Tests: {} FAILED\n", failed_tests.len());
        for name in &failed_tests {
            crate::safe_print!(48, "  - {}\n", name);
        }
    }
    console::print("=================================\n\n");

    all_pass
}

fn test_monotonic_non_decreasing() -> bool {
    let a = timer::now_msec();
    let b = timer::now_msec();
    timer::delay_us(100);
    let c = timer::now_msec();
    b >= a && c >= b
}

fn test_epoch_datetime() -> bool {
    let dt = timer::unix_ms_to_datetime(0, false);
    dt == DateTime {
        year: 1970,
        month: 1,
        day: 1,
        hour: 0,
        minute: 0,
        second: 0,
    }
}

fn test_known_dates() -> bool {
    // 1970-01-02 00:00:00
    let next_day = timer::unix_ms_to_datetime(86_400_000, false);
    if (next_day.year, next_day.month, next_day.day) != (1970, 1, 2) {
        return false;
    }
    // 2000-01-01 00:00:00 = 946684800s
    let y2k = timer::unix_ms_to_datetime(946_684_800_000, false);
    (y2k.year, y2k.month, y2k.day, y2k.hour) == (2000, 1, 1, 0)
}

fn test_leap_day() -> bool {
    // 2024-02-29 12:00:00 = 1709208000s
    let dt = timer::unix_ms_to_datetime(1_709_208_000_000, false);
    if (dt.year, dt.month, dt.day, dt.hour) != (2024, 2, 29, 12) {
        return false;
    }
    timer::datetime_to_unix_ms(&dt, false) == 1_709_208_000_000
}

fn test_datetime_roundtrip() -> bool {
    // Whole-second stamps across five decades, plus a far-future one
    let stamps: [u64; 5] = [
        1_000,
        86_399_000,
        1_234_567_890_000,
        4_102_444_800_000,      // 2100-01-01
        200_000_000_000_000,    // year 8305
    ];
    stamps.iter().all(|&t| {
        let dt = timer::unix_ms_to_datetime(t, false);
        timer::datetime_to_unix_ms(&dt, false) == t
    })
}

fn test_format_parse_roundtrip() -> bool {
    let dt = DateTime {
        year: 2026,
        month: 8,
        day: 1,
        hour: 23,
        minute: 59,
        second: 7,
    };
    let s = timer::datetime_to_string(&dt);
    if s.len() != 19 {
        return false;
    }
    timer::datetime_from_string(&s) == Some(dt)
}

fn test_wall_unsynced_reads_zero() -> bool {
    // Boot tests run before any RTC or SNTP sync has happened
    !timer::is_synchronised() && timer::unix_time_ms() == 0
}

fn test_manual_set_then_sync() -> bool {
    // Manual setting feeds the raw projection but not the synced clock
    if timer::set_manual_unix_time_ms(1_700_000_000_000).is_err() {
        return false;
    }
    if timer::unix_time_ms() != 0 {
        return false;
    }
    let wall = timer::wall_time_us();
    if !(1_699_999_000_000_000..1_700_010_000_000_000).contains(&wall) {
        return false;
    }
    // A step sync flips the synced flag and manual setting is refused after
    timer::sync_set_unix_us(1_700_000_100_000_000);
    timer::is_synchronised()
        && timer::unix_time_ms() >= 1_700_000_100_000
        && timer::set_manual_unix_time_ms(0).is_err()
}

fn test_freq_ppm_clamp() -> bool {
    timer::sync_set_freq_ppm(1000);
    let high = timer::sync_get_freq_ppm();
    timer::sync_set_freq_ppm(-1000);
    let low = timer::sync_get_freq_ppm();
    timer::sync_set_freq_ppm(0);
    high == 500 && low == -500
}

fn test_slew_is_gradual() -> bool {
    timer::sync_set_unix_us(2_000_000_000_000_000);
    let before = timer::unix_time_us();
    timer::sync_slew_us(10_000_000);
    timer::delay_us(2_000);
    let after = timer::unix_time_us();
    // Ten queued seconds must not appear at once; at 500ppm over ~2ms the
    // applied share is microscopic
    after >= before && after - before < 1_000_000
}

fn test_timezone_offset() -> bool {
    timer::set_timezone_minutes(60);
    let utc = timer::unix_time_ms();
    let local = timer::local_time_ms();
    timer::set_timezone_minutes(0);
    if utc == 0 {
        return false;
    }
    let delta = local as i64 - utc as i64;
    (3_600_000 - 50..=3_600_000 + 50).contains(&delta)
}
