//! Phase State Machine
//!
//! Derives a RestoreSession's phase from the host outcomes in its status, and
//! sums host durations for the succeeded session.

use std::time::Duration;

use crate::crd::{HostRestorePhase, HostRestoreStats, RestoreSessionPhase, RestoreSessionStatus};
use crate::error::{Error, Result};

/// Phase the status is in, with the error of the host that decided it.
///
/// Outcomes are only judged once every expected host reported. A failed host
/// takes precedence over an unknown one; within a kind the first in report
/// order wins.
pub fn compute_phase(status: &RestoreSessionStatus) -> (RestoreSessionPhase, Option<String>) {
    let total = match (status.total_hosts, status.phase) {
        (None, _) | (_, None) | (_, Some(RestoreSessionPhase::Pending)) => {
            return (RestoreSessionPhase::Pending, None)
        }
        (Some(total), Some(_)) => total,
    };

    if i32::try_from(status.stats.len()).ok() != Some(total) {
        return (RestoreSessionPhase::Running, None);
    }

    if let Some(host) = first_with(&status.stats, HostRestorePhase::Failed) {
        return (
            RestoreSessionPhase::Failed,
            Some(format!(
                "restore failed for host: {}. Reason: {}",
                host.hostname,
                host.error.as_deref().unwrap_or_default()
            )),
        );
    }

    if let Some(host) = first_with(&status.stats, HostRestorePhase::Unknown) {
        return (
            RestoreSessionPhase::Unknown,
            Some(format!(
                "restore phase is 'Unknown' for host: {}. Reason: {}",
                host.hostname,
                host.error.as_deref().unwrap_or_default()
            )),
        );
    }

    if status.stats.iter().all(|s| s.phase == HostRestorePhase::Succeeded) {
        (RestoreSessionPhase::Succeeded, None)
    } else {
        (RestoreSessionPhase::Running, None)
    }
}

fn first_with(stats: &[HostRestoreStats], phase: HostRestorePhase) -> Option<&HostRestoreStats> {
    stats.iter().find(|s| s.phase == phase)
}

/// Sum of every host duration, formatted like the host durations.
///
/// A missing or malformed host duration fails the whole sum.
pub fn session_duration(stats: &[HostRestoreStats]) -> Result<String> {
    let mut total = Duration::ZERO;
    for host in stats {
        let raw = host.duration.as_deref().ok_or_else(|| {
            Error::Duration(format!("host {} reported no duration", host.hostname))
        })?;
        total = total.checked_add(parse_duration(raw)?).ok_or_else(|| {
            Error::Duration(format!("session duration overflows at host {}", host.hostname))
        })?;
    }
    Ok(format_duration(total))
}

/// Parse a duration such as `1h2m3.5s`, `300ms` or `1.5h`
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = || Error::Duration(format!("invalid duration {:?}", input));
    let overflow = || Error::Duration(format!("duration {:?} overflows", input));

    let s = input.trim().strip_prefix('+').unwrap_or(input.trim());
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() || s.starts_with('-') {
        return Err(invalid());
    }

    let mut nanos: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let (number, tail) = rest.split_at(num_len);
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);

        let scale: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            _ => return Err(invalid()),
        };

        let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        nanos = whole
            .checked_mul(scale)
            .and_then(|n| nanos.checked_add(n))
            .ok_or_else(overflow)?;

        if !frac.is_empty() {
            let digits: u128 = frac.parse().map_err(|_| invalid())?;
            let denom = 10u128
                .checked_pow(u32::try_from(frac.len()).map_err(|_| invalid())?)
                .ok_or_else(invalid)?;
            let part = digits.checked_mul(scale).ok_or_else(overflow)? / denom;
            nanos = nanos.checked_add(part).ok_or_else(overflow)?;
        }
        rest = tail;
    }

    let secs = u64::try_from(nanos / 1_000_000_000).map_err(|_| overflow())?;
    // remainder is below one second
    let sub = (nanos % 1_000_000_000) as u32;
    Ok(Duration::new(secs, sub))
}

/// Format a duration as `1h2m3.5s`, `1m0s`, `300ms` or `0s`
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{}ns", nanos);
    }
    if nanos < 1_000_000 {
        return format!("{}µs", fraction(nanos / 1_000, nanos % 1_000, 3));
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", fraction(nanos / 1_000_000, nanos % 1_000_000, 6));
    }

    let total_secs = d.as_secs();
    let hours = total_secs / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = fraction(u128::from(total_secs % 60), u128::from(d.subsec_nanos()), 9);
    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

fn fraction(whole: u128, frac: u128, width: usize) -> String {
    if frac == 0 {
        return whole.to_string();
    }
    let digits = format!("{:0width$}", frac, width = width);
    format!("{}.{}", whole, digits.trim_end_matches('0'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(name: &str, phase: HostRestorePhase, error: Option<&str>) -> HostRestoreStats {
        HostRestoreStats {
            hostname: name.to_string(),
            phase,
            duration: Some("1m".to_string()),
            error: error.map(String::from),
        }
    }

    fn status(total: Option<i32>, stats: Vec<HostRestoreStats>) -> RestoreSessionStatus {
        RestoreSessionStatus {
            phase: Some(RestoreSessionPhase::Running),
            total_hosts: total,
            stats,
            ..Default::default()
        }
    }

    #[test]
    fn pending_until_hosts_counted() {
        assert_eq!(compute_phase(&status(None, vec![])).0, RestoreSessionPhase::Pending);
        assert_eq!(
            compute_phase(&RestoreSessionStatus::default()).0,
            RestoreSessionPhase::Pending
        );
        let mut pending = status(Some(1), vec![]);
        pending.phase = Some(RestoreSessionPhase::Pending);
        assert_eq!(compute_phase(&pending).0, RestoreSessionPhase::Pending);
    }

    #[test]
    fn running_until_every_host_reported() {
        let s = status(
            Some(3),
            vec![
                host("host-0", HostRestorePhase::Succeeded, None),
                host("host-1", HostRestorePhase::Failed, Some("disk full")),
            ],
        );
        assert_eq!(compute_phase(&s), (RestoreSessionPhase::Running, None));
    }

    #[test]
    fn failed_beats_unknown_regardless_of_order() {
        let s = status(
            Some(3),
            vec![
                host("host-0", HostRestorePhase::Unknown, Some("lost contact")),
                host("host-1", HostRestorePhase::Failed, Some("disk full")),
                host("host-2", HostRestorePhase::Failed, Some("permission denied")),
            ],
        );
        let (phase, err) = compute_phase(&s);
        assert_eq!(phase, RestoreSessionPhase::Failed);
        assert_eq!(
            err.as_deref(),
            Some("restore failed for host: host-1. Reason: disk full")
        );
    }

    #[test]
    fn unknown_when_no_failure() {
        let s = status(
            Some(2),
            vec![
                host("host-0", HostRestorePhase::Succeeded, None),
                host("host-1", HostRestorePhase::Unknown, Some("lost contact")),
            ],
        );
        let (phase, err) = compute_phase(&s);
        assert_eq!(phase, RestoreSessionPhase::Unknown);
        assert!(err.unwrap().contains("host-1"));
    }

    #[test]
    fn succeeded_only_when_all_succeeded() {
        let done = status(
            Some(2),
            vec![
                host("host-0", HostRestorePhase::Succeeded, None),
                host("host-1", HostRestorePhase::Succeeded, None),
            ],
        );
        assert_eq!(compute_phase(&done), (RestoreSessionPhase::Succeeded, None));

        let still_running = status(
            Some(2),
            vec![
                host("host-0", HostRestorePhase::Succeeded, None),
                host("host-1", HostRestorePhase::Running, None),
            ],
        );
        assert_eq!(compute_phase(&still_running).0, RestoreSessionPhase::Running);
    }

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_duration("1h2m3s").unwrap(), Duration::from_secs(3_723));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1_500));
        assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
        assert_eq!(parse_duration("2us").unwrap(), Duration::from_micros(2));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5_400));
    }

    #[test]
    fn rejects_malformed_durations() {
        for bad in ["", "abc", "10", "5x", "-1s", "1h2"] {
            assert!(parse_duration(bad).is_err(), "{:?}", bad);
        }
    }

    #[test]
    fn oversized_durations_are_errors() {
        for huge in [
            "99999999999999999999999999999999h",
            "340282366920938463463374607431768211455ns",
            "1.9999999999999999999999999999999999999h",
            "5124095576030432h",
        ] {
            assert!(
                matches!(parse_duration(huge), Err(Error::Duration(_))),
                "{:?}",
                huge
            );
        }
    }

    #[test]
    fn formats_like_host_durations() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_secs(3_723)), "1h2m3s");
        assert_eq!(format_duration(Duration::from_secs(60)), "1m0s");
        assert_eq!(format_duration(Duration::from_millis(1_500)), "1.5s");
        assert_eq!(format_duration(Duration::from_millis(300)), "300ms");
        assert_eq!(format_duration(Duration::from_nanos(1_500)), "1.5µs");
    }

    #[test]
    fn session_duration_sums_hosts() {
        let mut stats = vec![
            host("host-0", HostRestorePhase::Succeeded, None),
            host("host-1", HostRestorePhase::Succeeded, None),
        ];
        stats[1].duration = Some("30.5s".to_string());
        assert_eq!(session_duration(&stats).unwrap(), "1m30.5s");
    }

    #[test]
    fn one_bad_host_duration_fails_the_sum() {
        let mut stats = vec![
            host("host-0", HostRestorePhase::Succeeded, None),
            host("host-1", HostRestorePhase::Succeeded, None),
        ];
        stats[1].duration = Some("soon".to_string());
        assert!(matches!(session_duration(&stats), Err(Error::Duration(_))));

        stats[1].duration = None;
        assert!(matches!(session_duration(&stats), Err(Error::Duration(_))));
    }

    #[test]
    fn session_duration_sum_overflow_fails() {
        let mut stats = vec![
            host("host-0", HostRestorePhase::Succeeded, None),
            host("host-1", HostRestorePhase::Succeeded, None),
        ];
        stats[0].duration = Some("5000000000000000h".to_string());
        stats[1].duration = Some("5000000000000000h".to_string());
        assert!(matches!(session_duration(&stats), Err(Error::Duration(_))));
    }
}
