//! Number formatting helpers for report output.

/// Requests-per-second figure: plain decimals up to ten thousand, then
/// scaled to `k` or `M`.
pub fn format_rate(value: f64) -> String {
    if value < 10_000.0 {
        format!("{value:.2}")
    } else if value < 1_000_000.0 {
        format!("{:.1}k", value / 1_000.0)
    } else {
        format!("{:.2}M", value / 1_000_000.0)
    }
}

/// Latency in microseconds: whole microseconds below a millisecond, two
/// decimals once scaled to milliseconds or seconds.
pub fn format_latency_us(us: f64) -> String {
    if us < 1_000.0 {
        format!("{us:.0}us")
    } else if us < 1_000_000.0 {
        format!("{:.2}ms", us / 1_000.0)
    } else {
        format!("{:.2}s", us / 1_000_000.0)
    }
}

/// Byte volume with decimal (SI) units and two decimals past the first
/// scale step.
pub fn format_bytes(bytes: f64) -> String {
    let v = bytes.max(0.0);
    if v < 1_000.0 {
        format!("{v:.0}B")
    } else if v < 1_000_000.0 {
        format!("{:.2}kB", v / 1_000.0)
    } else if v < 1_000_000_000.0 {
        format!("{:.2}MB", v / 1_000_000.0)
    } else {
        format!("{:.2}GB", v / 1_000_000_000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_rate() {
        assert_eq!(format_rate(0.0), "0.00");
        assert_eq!(format_rate(42.5), "42.50");
        assert_eq!(format_rate(9_999.0), "9999.00");
        assert_eq!(format_rate(10_000.0), "10.0k");
        assert_eq!(format_rate(250_300.0), "250.3k");
        assert_eq!(format_rate(2_500_000.0), "2.50M");
    }

    #[test]
    fn test_format_latency() {
        assert_eq!(format_latency_us(0.0), "0us");
        assert_eq!(format_latency_us(742.4), "742us");
        assert_eq!(format_latency_us(1_000.0), "1.00ms");
        assert_eq!(format_latency_us(85_300.0), "85.30ms");
        assert_eq!(format_latency_us(999_000.0), "999.00ms");
        assert_eq!(format_latency_us(2_400_000.0), "2.40s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0.0), "0B");
        assert_eq!(format_bytes(999.0), "999B");
        assert_eq!(format_bytes(1_000.0), "1.00kB");
        assert_eq!(format_bytes(34_560.0), "34.56kB");
        assert_eq!(format_bytes(1_500_000.0), "1.50MB");
        assert_eq!(format_bytes(3_200_000_000.0), "3.20GB");
        assert_eq!(format_bytes(-5.0), "0B");
    }
}
