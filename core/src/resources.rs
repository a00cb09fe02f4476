//! Resource limit strings.
//!
//! Memory and CPU limits are stored on the container record exactly as the
//! user wrote them and converted to cgroup values here.

use crate::error::{CtrError, Result};

/// Parse a memory string such as `"128m"` or `"1.5g"` into bytes.
///
/// Suffixes `k`, `m` and `g` (case-insensitive, optional trailing `b`) are
/// powers of 1024. Fractional values are allowed. The empty string means
/// "no limit" and parses to 0.
pub fn parse_memory_string(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        return Ok(0);
    }

    let unit_part = s.strip_suffix('b').filter(|rest| !rest.is_empty()).unwrap_or(&s);
    let (num, mult) = if let Some(n) = unit_part.strip_suffix('g') {
        (n, 1024u64 * 1024 * 1024)
    } else if let Some(n) = unit_part.strip_suffix('m') {
        (n, 1024u64 * 1024)
    } else if let Some(n) = unit_part.strip_suffix('k') {
        (n, 1024u64)
    } else {
        (unit_part, 1u64)
    };

    let value: f64 = num
        .trim()
        .parse()
        .map_err(|_| CtrError::Validation(format!("invalid memory format: {}", s)))?;
    if !value.is_finite() || value < 0.0 {
        return Err(CtrError::Validation(format!("invalid memory format: {}", s)));
    }

    Ok((value * mult as f64) as u64)
}

/// Convert a CPU count such as `"1.5"` to `cpu.shares` (1024 per CPU).
///
/// Returns `None` for the empty string. The kernel minimum of 2 shares is
/// enforced.
pub fn cpus_to_shares(s: &str) -> Result<Option<u64>> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }

    let cpus: f64 = s
        .parse()
        .map_err(|_| CtrError::Validation(format!("invalid cpus value: {}", s)))?;
    if !cpus.is_finite() || cpus <= 0.0 {
        return Err(CtrError::Validation(format!(
            "cpus must be a positive number: {}",
            s
        )));
    }

    Ok(Some(((cpus * 1024.0).round() as u64).max(2)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_units() {
        assert_eq!(parse_memory_string("128m").unwrap(), 134_217_728);
        assert_eq!(parse_memory_string("1g").unwrap(), 1_073_741_824);
        assert_eq!(parse_memory_string("64k").unwrap(), 65_536);
        assert_eq!(parse_memory_string("4096").unwrap(), 4096);
    }

    #[test]
    fn test_parse_memory_empty_is_zero() {
        assert_eq!(parse_memory_string("").unwrap(), 0);
        assert_eq!(parse_memory_string("   ").unwrap(), 0);
    }

    #[test]
    fn test_parse_memory_case_and_suffix_b() {
        assert_eq!(parse_memory_string("512M").unwrap(), 536_870_912);
        assert_eq!(parse_memory_string("2GB").unwrap(), 2_147_483_648);
        assert_eq!(parse_memory_string("100b").unwrap(), 100);
    }

    #[test]
    fn test_parse_memory_fractional() {
        assert_eq!(parse_memory_string("1.5g").unwrap(), 1_610_612_736);
        assert_eq!(parse_memory_string("0.5m").unwrap(), 524_288);
    }

    #[test]
    fn test_parse_memory_invalid() {
        for input in ["abc", "12x", "m", "-1m", "1..2g", "b"] {
            let err = parse_memory_string(input).unwrap_err();
            assert!(err.is_user_error(), "{input} should be a validation error");
        }
    }

    #[test]
    fn test_cpus_to_shares() {
        assert_eq!(cpus_to_shares("").unwrap(), None);
        assert_eq!(cpus_to_shares("1").unwrap(), Some(1024));
        assert_eq!(cpus_to_shares("1.5").unwrap(), Some(1536));
        assert_eq!(cpus_to_shares("0.001").unwrap(), Some(2));
        assert!(cpus_to_shares("0").is_err());
        assert!(cpus_to_shares("two").is_err());
    }
}
