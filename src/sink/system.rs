//! System utilisation read from `/proc`.
//!
//! Missing files (non-Linux hosts, containers without procfs) leave the
//! corresponding field empty.

use serde::Serialize;
use std::fs;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SystemStats {
    /// One-minute load average.
    pub load_avg: Option<f64>,
    pub mem_percent: Option<f64>,
    pub swap_percent: Option<f64>,
}

impl SystemStats {
    pub fn sample() -> Self {
        let load_avg = fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|text| parse_loadavg(&text));
        let (mem_percent, swap_percent) = fs::read_to_string("/proc/meminfo")
            .ok()
            .map(|text| parse_meminfo(&text))
            .unwrap_or((None, None));
        Self {
            load_avg,
            mem_percent,
            swap_percent,
        }
    }
}

fn parse_loadavg(text: &str) -> Option<f64> {
    text.split_whitespace().next()?.parse().ok()
}

fn meminfo_kb(text: &str, key: &str) -> Option<f64> {
    text.lines()
        .find_map(|line| line.strip_prefix(key)?.strip_prefix(':'))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

fn used_percent(total: Option<f64>, free: Option<f64>) -> Option<f64> {
    let total = total?;
    if total <= 0.0 {
        return None;
    }
    let used = total - free?;
    Some(((used / total) * 1000.0).round() / 10.0)
}

fn parse_meminfo(text: &str) -> (Option<f64>, Option<f64>) {
    let mem = used_percent(
        meminfo_kb(text, "MemTotal"),
        meminfo_kb(text, "MemAvailable"),
    );
    let swap = used_percent(meminfo_kb(text, "SwapTotal"), meminfo_kb(text, "SwapFree"));
    (mem, swap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proc_snapshots() {
        assert_eq!(parse_loadavg("0.52 0.58 0.59 1/467 12345\n"), Some(0.52));

        let meminfo = "MemTotal:        8000000 kB\n\
                       MemFree:          500000 kB\n\
                       MemAvailable:    2000000 kB\n\
                       SwapTotal:       1000000 kB\n\
                       SwapFree:         750000 kB\n";
        assert_eq!(parse_meminfo(meminfo), (Some(75.0), Some(25.0)));
    }

    #[test]
    fn zero_swap_is_reported_as_unknown() {
        let meminfo = "MemTotal: 100 kB\nMemAvailable: 50 kB\nSwapTotal: 0 kB\nSwapFree: 0 kB\n";
        assert_eq!(parse_meminfo(meminfo), (Some(50.0), None));
    }
}
