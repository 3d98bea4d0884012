/// Print a size in a human readable format.
pub fn size_to_str(size: u64) -> String {
    if size >= 1024 * 1024 * 1024 {
        format!("{:.1} GiB ({} bytes)", size as f64 / (1024.0 * 1024.0 * 1024.0), size)
    } else if size >= 1024 * 1024 {
        format!("{:.1} MiB ({} bytes)", size as f64 / (1024.0 * 1024.0), size)
    } else if size >= 1024 {
        format!("{:.1} KiB ({} bytes)", size as f64 / 1024.0, size)
    } else {
        format!("{} bytes", size)
    }
}

/// Parse a size string with an optional binary unit (B, KiB, MiB, GiB).
pub fn parse_size(size_str: &str) -> Result<u64, String> {
    let size_val: String = size_str.chars().filter(|a| a.is_numeric()).collect();
    let size_val: u64 = size_val
        .parse()
        .map_err(|_| format!("invalid size value '{}'", size_str))?;
    let size_unit: String = size_str
        .chars()
        .filter(|a| !a.is_numeric())
        .collect::<String>()
        .trim()
        .to_string();
    if size_unit.is_empty() {
        return Ok(size_val);
    }
    match size_unit.as_str() {
        "GiB" => Ok(1024 * 1024 * 1024 * size_val),
        "MiB" => Ok(1024 * 1024 * size_val),
        "KiB" => Ok(1024 * size_val),
        "B" => Ok(size_val),
        unit => Err(format!("invalid size unit '{}'", unit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_and_units() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("16KiB").unwrap(), 16 * 1024);
        assert_eq!(parse_size("1MiB").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("2GiB").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_size("16KB").is_err());
        assert!(parse_size("abc").is_err());
    }

    #[test]
    fn format_sizes() {
        assert_eq!(size_to_str(512), "512 bytes");
        assert!(size_to_str(2048).starts_with("2.0 KiB"));
    }
}
