use std::time::Duration;

/// Human-readable elapsed time for log lines, e.g. `1m 4s`, `2s 150ms`, `850µs`.
pub fn format_duration(duration: Duration) -> String {
    let total_ms = duration.as_millis();
    let secs = duration.as_secs();
    let minutes = secs / 60;
    let seconds = secs % 60;
    let ms = total_ms % 1000;

    match (minutes, secs) {
        (m, _) if m > 0 => format!("{}m {}s", m, seconds),
        (0, s) if s > 0 => format!("{}s {}ms", s, ms),
        _ if total_ms > 0 => format!("{}ms", total_ms),
        _ => format!("{}µs", duration.as_micros()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_micros(850)), "850µs");
        assert_eq!(format_duration(Duration::from_millis(42)), "42ms");
        assert_eq!(format_duration(Duration::from_millis(2150)), "2s 150ms");
        assert_eq!(format_duration(Duration::from_secs(64)), "1m 4s");
    }
}
