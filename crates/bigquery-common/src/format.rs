//! Human-readable byte and row-count formatting for response messages.

const BYTE_UNITS: [&str; 6] = ["Bytes", "KiB", "MiB", "GiB", "TiB", "PiB"];
const ROW_UNITS: [&str; 5] = ["", "k", "m", "b", "t"];

/// Format a byte count with binary unit suffixes, one decimal place.
///
/// `None` stays `None`, and zero is rendered without a unit, matching how the
/// count is surfaced when the remote service reports nothing processed.
pub fn format_bytes(num_bytes: Option<i64>) -> Option<String> {
    let num_bytes = num_bytes?;
    if num_bytes == 0 {
        return Some("0".to_string());
    }

    let mut value = num_bytes as f64;
    for unit in BYTE_UNITS {
        if value.abs() < 1024.0 {
            return Some(format!("{value:3.1} {unit}"));
        }
        value /= 1024.0;
    }
    value *= 1024.0;
    Some(format!("{value:3.1} {}", BYTE_UNITS[BYTE_UNITS.len() - 1]))
}

/// Format a row count with decimal unit suffixes, one decimal place,
/// trimmed of padding.
pub fn format_rows_number(rows_number: i64) -> String {
    let mut value = rows_number as f64;
    for unit in ROW_UNITS {
        if value.abs() < 1000.0 {
            return format!("{value:3.1}{unit}").trim().to_string();
        }
        value /= 1000.0;
    }
    value *= 1000.0;
    format!("{value:3.1}{}", ROW_UNITS[ROW_UNITS.len() - 1])
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes_boundaries() {
        assert_eq!(format_bytes(None), None);
        assert_eq!(format_bytes(Some(0)).unwrap(), "0");
        assert_eq!(format_bytes(Some(1023)).unwrap(), "1023.0 Bytes");
        assert_eq!(format_bytes(Some(1024)).unwrap(), "1.0 KiB");
        assert_eq!(format_bytes(Some(1048576)).unwrap(), "1.0 MiB");
        assert_eq!(format_bytes(Some(2048)).unwrap(), "2.0 KiB");
    }

    #[test]
    fn test_format_bytes_negative() {
        assert_eq!(format_bytes(Some(-2048)).unwrap(), "-2.0 KiB");
    }

    #[test]
    fn test_format_rows_number() {
        assert_eq!(format_rows_number(999), "999.0");
        assert_eq!(format_rows_number(1000), "1.0k");
        assert_eq!(format_rows_number(1_000_000), "1.0m");
        assert_eq!(format_rows_number(1_000_000_000), "1.0b");
        assert_eq!(format_rows_number(5), "5.0");
    }
}
