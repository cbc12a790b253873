use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;

/// Ask a yes/no question on the terminal, defaulting to no.
pub(crate) fn confirm(message: &str) -> Result<bool> {
    dialoguer::Confirm::new()
        .with_prompt(message)
        .default(false)
        .interact()
        .context("Reading confirmation")
}

/// Parse size string (e.g., "10G", "5120M", "1T") to bytes
pub(crate) fn parse_size(size_str: &str) -> Result<u64> {
    let size_str = size_str.trim().to_uppercase();

    if size_str.is_empty() {
        return Err(eyre!("Empty size string"));
    }

    let (number_part, unit_part) = if let Some(pos) = size_str.rfind(|c: char| c.is_ascii_digit()) {
        let (num, unit) = size_str.split_at(pos + 1);
        (num, unit)
    } else {
        return Err(eyre!("Invalid size format: {}", size_str));
    };

    let number: u64 = number_part
        .parse()
        .map_err(|_| eyre!("Invalid number in size: {}", number_part))?;

    let multiplier = match unit_part {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        "T" | "TB" => 1024_u64.pow(4),
        _ => return Err(eyre!("Unknown size unit: {}", unit_part)),
    };

    Ok(number * multiplier)
}

/// Parse a memory string (like "2G", "1024M", "512") to megabytes
pub(crate) fn parse_memory_to_mb(memory_str: &str) -> Result<u64> {
    let memory_str = memory_str.trim();

    if memory_str.is_empty() {
        return Err(eyre!("Memory string cannot be empty"));
    }

    // Check if it ends with a unit suffix
    if let Some(last_char) = memory_str.chars().last() {
        match last_char.to_ascii_uppercase() {
            'G' => {
                let number_part = &memory_str[..memory_str.len() - 1];
                let gb: f64 = number_part
                    .parse()
                    .context("Invalid number in memory specification")?;
                Ok((gb * 1024.0) as u64)
            }
            'M' => {
                let number_part = &memory_str[..memory_str.len() - 1];
                let mb: u64 = number_part
                    .parse()
                    .context("Invalid number in memory specification")?;
                Ok(mb)
            }
            'K' => {
                let number_part = &memory_str[..memory_str.len() - 1];
                let kb: u64 = number_part
                    .parse()
                    .context("Invalid number in memory specification")?;
                Ok(kb / 1024)
            }
            _ => {
                // No suffix, assume megabytes
                let mb: u64 = memory_str
                    .parse()
                    .context("Invalid number in memory specification")?;
                Ok(mb)
            }
        }
    } else {
        Err(eyre!("Memory specification cannot be empty - please provide a value like '2G', '1024M', or '512'"))
    }
}

/// Parse a disk size (like "100G" or "100") to whole GiB, rounding up.
pub(crate) fn parse_disk_to_gb(disk_str: &str) -> Result<u64> {
    let disk_str = disk_str.trim();
    let bytes = if disk_str.chars().all(|c| c.is_ascii_digit()) {
        let gb: u64 = disk_str
            .parse()
            .with_context(|| format!("Invalid disk size: {disk_str}"))?;
        gb * 1024 * 1024 * 1024
    } else {
        parse_size(disk_str)?
    };
    const GIB: u64 = 1024 * 1024 * 1024;
    Ok(bytes.div_ceil(GIB))
}
