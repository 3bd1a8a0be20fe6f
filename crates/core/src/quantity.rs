//! Kubernetes resource quantity parsing (memory/storage sizes).

use crate::{Error, Result};

/// Parse a quantity such as `16Gi`, `512M`, `1.5Gi`, `16e9` or `16000000000` into bytes.
/// Negative or malformed values are contract violations (`InvalidSpec`).
pub fn parse_bytes(q: &str) -> Result<u64> {
    let s = q.trim();
    if s.is_empty() {
        return Err(Error::invalid_spec("empty quantity"));
    }
    if s.starts_with('-') {
        return Err(Error::invalid_spec(format!("negative quantity: {}", q)));
    }
    let split = s.find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+')).unwrap_or(s.len());
    let (num, suffix) = s.split_at(split);
    let multiplier: f64 = match suffix {
        "" => 1.0,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        "k" | "K" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        other => match other.strip_prefix(['e', 'E']).and_then(|exp| exp.parse::<i32>().ok()) {
            Some(exp) => 10f64.powi(exp),
            None => return Err(Error::invalid_spec(format!("unsupported quantity suffix in {}", q))),
        },
    };
    let value: f64 = num.parse().map_err(|_| Error::invalid_spec(format!("malformed quantity: {}", q)))?;
    let bytes = (value * multiplier).ceil();
    if !bytes.is_finite() || bytes > u64::MAX as f64 {
        return Err(Error::invalid_spec(format!("quantity out of range: {}", q)));
    }
    Ok(bytes as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binary_decimal_and_plain() {
        assert_eq!(parse_bytes("16000000000").unwrap(), 16_000_000_000);
        assert_eq!(parse_bytes("16G").unwrap(), 16_000_000_000);
        assert_eq!(parse_bytes("1Gi").unwrap(), 1 << 30);
        assert_eq!(parse_bytes("1.5Gi").unwrap(), 3 << 29);
        assert_eq!(parse_bytes("128Mi").unwrap(), 128 << 20);
        assert_eq!(parse_bytes("16e9").unwrap(), 16_000_000_000);
    }

    #[test]
    fn rejects_negative_and_garbage() {
        assert!(matches!(parse_bytes("-1Gi"), Err(Error::InvalidSpec(_))));
        assert!(matches!(parse_bytes(""), Err(Error::InvalidSpec(_))));
        assert!(matches!(parse_bytes("12Qx"), Err(Error::InvalidSpec(_))));
        assert!(matches!(parse_bytes("Gi"), Err(Error::InvalidSpec(_))));
    }
}
