use super::ConfigError;

/// Parse a human-readable size ("200MB", "1.5GiB", "4096") into bytes.
///
/// Decimal suffixes (KB, MB, GB, TB) are powers of 1000, binary suffixes
/// (KiB, MiB, GiB, TiB) powers of 1024. Suffixes are case-insensitive.
pub fn parse_human_size(input: &str) -> Result<i64, ConfigError> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| ConfigError::InvalidSize(input.to_string()))?;

    let multiplier: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "kb" | "k" => 1e3,
        "mb" | "m" => 1e6,
        "gb" | "g" => 1e9,
        "tb" | "t" => 1e12,
        "kib" => 1024.0,
        "mib" => 1024.0 * 1024.0,
        "gib" => 1024.0 * 1024.0 * 1024.0,
        "tib" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return Err(ConfigError::InvalidSize(input.to_string())),
    };

    let bytes = value * multiplier;
    if !bytes.is_finite() || bytes < 0.0 || bytes > i64::MAX as f64 {
        return Err(ConfigError::InvalidSize(input.to_string()));
    }

    Ok(bytes.round() as i64)
}
