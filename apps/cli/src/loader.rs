//! Firmware file loading.

use std::path::Path;

use anyhow::{Context, Result};
use samflash_core::FirmwareImage;
use tracing::info;

/// Read `path` into a firmware image, checking `checksum` (CRC-32) if given.
pub fn load_image(path: &Path, checksum: Option<u32>) -> Result<FirmwareImage> {
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read firmware file {}", path.display()))?;
    let mut image = FirmwareImage::from_bytes(data)
        .with_context(|| format!("Invalid firmware file {}", path.display()))?;
    if let Some(expected) = checksum {
        image = image.with_checksum(expected)?;
    }
    info!(
        path = %path.display(),
        bytes = image.len(),
        crc32 = %format!("0x{:08X}", image.crc32()),
        "Loaded firmware"
    );
    Ok(image)
}

/// Parse a CRC-32 given as hex, with or without `0x`.
pub fn parse_checksum(s: &str) -> Result<u32, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid checksum '{s}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_checksum() {
        assert_eq!(parse_checksum("0xCBF43926"), Ok(0xCBF4_3926));
        assert_eq!(parse_checksum("cbf43926"), Ok(0xCBF4_3926));
        assert!(parse_checksum("xyz").is_err());
    }

    #[test]
    fn test_load_image() {
        let path = std::env::temp_dir().join(format!("samflash-load-{}.bin", std::process::id()));
        std::fs::write(&path, b"123456789").unwrap();

        let image = load_image(&path, Some(0xCBF4_3926)).unwrap();
        assert_eq!(image.len(), 9);
        assert!(load_image(&path, Some(1)).is_err());

        std::fs::write(&path, b"").unwrap();
        assert!(load_image(&path, None).is_err());

        std::fs::remove_file(&path).unwrap();
        assert!(load_image(&path, None).is_err());
    }
}
