//! In-memory firmware image.
//!
//! The core never reads images from disk; a loader hands over the bytes.

use std::fmt;
use std::sync::Arc;

use crc::{CRC_32_ISO_HDLC, Crc};

use crate::error::FlashError;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Read-only firmware bytes plus metadata.
///
/// Cloning is cheap: the bytes are shared.
#[derive(Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Arc<[u8]>,
    checksum: Option<u32>,
}

impl FirmwareImage {
    /// Wrap raw bytes. Empty images are rejected.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Result<Self, FlashError> {
        let data: Vec<u8> = data.into();
        if data.is_empty() {
            return Err(FlashError::invalid_argument("firmware image is empty"));
        }
        Ok(Self {
            data: data.into(),
            checksum: None,
        })
    }

    /// Attach an expected CRC-32, failing if the bytes do not match it.
    pub fn with_checksum(mut self, expected: u32) -> Result<Self, FlashError> {
        let actual = self.crc32();
        if actual != expected {
            return Err(FlashError::invalid_argument(format!(
                "checksum mismatch: expected 0x{expected:08X}, got 0x{actual:08X}"
            )));
        }
        self.checksum = Some(expected);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Checksum supplied by the loader, if any.
    pub fn checksum(&self) -> Option<u32> {
        self.checksum
    }

    /// CRC-32 (ISO-HDLC) of the image bytes.
    pub fn crc32(&self) -> u32 {
        CRC32.checksum(&self.data)
    }

    /// Iterate `(offset, block)` pairs of at most `block_size` bytes.
    pub fn blocks(&self, block_size: usize) -> Blocks<'_> {
        Blocks::new(&self.data, block_size)
    }

    /// Number of blocks `blocks(block_size)` yields.
    pub fn block_count(&self, block_size: usize) -> usize {
        self.data.len().div_ceil(block_size.max(1))
    }
}

impl fmt::Debug for FirmwareImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwareImage")
            .field("len", &self.data.len())
            .field("checksum", &self.checksum.map(|c| format!("0x{c:08X}")))
            .finish()
    }
}

/// Iterator over fixed-size blocks of an image. Offsets are relative to the
/// start of the data.
#[derive(Debug, Clone)]
pub struct Blocks<'a> {
    data: &'a [u8],
    block_size: usize,
    offset: usize,
}

impl<'a> Blocks<'a> {
    pub(crate) fn new(data: &'a [u8], block_size: usize) -> Self {
        Self {
            data,
            block_size: block_size.max(1),
            offset: 0,
        }
    }
}

impl<'a> Iterator for Blocks<'a> {
    type Item = (usize, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        let end = (self.offset + self.block_size).min(self.data.len());
        let block = &self.data[self.offset..end];
        let offset = self.offset;
        self.offset = end;
        Some((offset, block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_rejected() {
        let err = FirmwareImage::from_bytes(Vec::new()).unwrap_err();
        assert!(matches!(err, FlashError::InvalidArgument(_)));
    }

    #[test]
    fn test_blocks() {
        let image = FirmwareImage::from_bytes(vec![7u8; 600]).unwrap();
        let blocks: Vec<_> = image.blocks(256).collect();

        assert_eq!(image.block_count(256), 3);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].0, 0);
        assert_eq!(blocks[1].0, 256);
        assert_eq!(blocks[2].0, 512);
        assert_eq!(blocks[2].1.len(), 88);
    }

    #[test]
    fn test_checksum() {
        // CRC-32 check value for "123456789".
        let image = FirmwareImage::from_bytes(b"123456789".to_vec()).unwrap();
        assert_eq!(image.crc32(), 0xCBF4_3926);

        let image = image.with_checksum(0xCBF4_3926).unwrap();
        assert_eq!(image.checksum(), Some(0xCBF4_3926));

        let err = image.clone().with_checksum(0).unwrap_err();
        assert!(matches!(err, FlashError::InvalidArgument(_)));
    }

    #[test]
    fn test_clone_shares_bytes() {
        let image = FirmwareImage::from_bytes(vec![1, 2, 3]).unwrap();
        let copy = image.clone();
        assert_eq!(image.as_bytes().as_ptr(), copy.as_bytes().as_ptr());
    }
}
