use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::VmError;

/// Parse a human-readable size string into bytes.
///
/// Accepts formats like `"20G"`, `"512M"`, `"100K"`, `"1073741824"`.
/// Uses binary units (1G = 1024³ = 1,073,741,824 bytes).
pub fn parse_size(s: &str) -> Result<u64, VmError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(VmError::Validation {
            message: "size cannot be empty".into(),
        });
    }

    // Split into numeric part and suffix
    let (num_str, suffix) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(i) => (&s[..i], s[i..].to_ascii_uppercase()),
        None => (s, String::new()),
    };

    let num: u64 = num_str.parse().map_err(|_| VmError::Validation {
        message: format!("invalid size number: '{num_str}'"),
    })?;

    let multiplier: u64 = match suffix.as_str() {
        "" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        "T" | "TB" => 1024 * 1024 * 1024 * 1024,
        _ => {
            return Err(VmError::Validation {
                message: format!("unknown size suffix: '{suffix}' (use G, M, K, or T)"),
            });
        }
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| VmError::Validation {
            message: format!("size overflows: '{s}'"),
        })
}

/// Locate an executable by name, honouring absolute/relative paths and `PATH`.
pub fn find_executable(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

/// Format the current UTC time as RFC 3339 (`YYYY-MM-DDTHH:MM:SSZ`) without
/// any external datetime dependency.
pub fn utc_timestamp() -> String {
    let dur = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    format_unix_secs(dur.as_secs())
}

fn format_unix_secs(secs: u64) -> String {
    let days = (secs / 86400) as i64;
    let time_of_day = secs % 86400;
    let hours = time_of_day / 3600;
    let minutes = (time_of_day % 3600) / 60;
    let seconds = time_of_day % 60;

    // Howard Hinnant's civil_from_days
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!("{y:04}-{m:02}-{d:02}T{hours:02}:{minutes:02}:{seconds:02}Z")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_gibibytes() {
        assert_eq!(parse_size("20G").unwrap(), 20 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("1GB").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn parse_size_mebibytes() {
        assert_eq!(parse_size("512M").unwrap(), 512 * 1024 * 1024);
    }

    #[test]
    fn parse_size_kibibytes() {
        assert_eq!(parse_size("100K").unwrap(), 100 * 1024);
    }

    #[test]
    fn parse_size_bytes() {
        assert_eq!(parse_size("1073741824").unwrap(), 1073741824);
    }

    #[test]
    fn parse_size_rejects_empty() {
        assert!(parse_size("").is_err());
    }

    #[test]
    fn parse_size_rejects_bad_suffix() {
        assert!(parse_size("10X").is_err());
    }

    #[test]
    fn format_epoch() {
        assert_eq!(format_unix_secs(0), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn format_leap_day() {
        // 2024-02-29T12:34:56Z
        assert_eq!(format_unix_secs(1_709_210_096), "2024-02-29T12:34:56Z");
    }

    #[test]
    fn find_executable_resolves_sh() {
        assert!(find_executable("sh").is_some());
        assert!(find_executable("definitely-not-a-real-binary-xyz").is_none());
    }
}
