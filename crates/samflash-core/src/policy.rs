//! Flash policy: retries, timeouts and optional stages.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::FlashError;

/// Bytes per `write_block` call when no block size is configured.
pub const DEFAULT_BLOCK_SIZE: usize = 256;

/// Immutable policy governing a flash operation.
///
/// `retry_count` is the number of additional attempts after the first one,
/// so every stage runs at most `retry_count + 1` times. `timeout` bounds
/// each channel call of an attempt, not the whole operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PolicyFile", into = "PolicyFile")]
pub struct FlashPolicy {
    verify_after_write: bool,
    erase_before_write: bool,
    retry_count: u32,
    timeout: Duration,
    block_size: usize,
    progress_reporting: bool,
}

impl FlashPolicy {
    /// Create a policy, rejecting a zero timeout.
    pub fn new(
        verify_after_write: bool,
        erase_before_write: bool,
        retry_count: u32,
        timeout: Duration,
    ) -> Result<Self, FlashError> {
        Self::builder()
            .verify_after_write(verify_after_write)
            .erase_before_write(erase_before_write)
            .retry_count(retry_count)
            .timeout(timeout)
            .build()
    }

    pub fn builder() -> FlashPolicyBuilder {
        FlashPolicyBuilder::default()
    }

    pub fn verify_after_write(&self) -> bool {
        self.verify_after_write
    }

    pub fn erase_before_write(&self) -> bool {
        self.erase_before_write
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Total attempts a stage may make.
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn progress_reporting(&self) -> bool {
        self.progress_reporting
    }

    /// Load a policy from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let policy: FlashPolicy = toml::from_str(&content)?;
        Ok(policy)
    }

    /// Save the policy to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Start a builder seeded with this policy's values.
    pub fn to_builder(&self) -> FlashPolicyBuilder {
        FlashPolicyBuilder {
            file: PolicyFile::from(self.clone()),
        }
    }
}

impl Default for FlashPolicy {
    fn default() -> Self {
        let file = PolicyFile::default();
        Self {
            verify_after_write: file.verify_after_write,
            erase_before_write: file.erase_before_write,
            retry_count: file.retry_count,
            timeout: Duration::from_millis(file.timeout_ms),
            block_size: file.block_size,
            progress_reporting: file.progress_reporting,
        }
    }
}

/// On-disk shape of a [`FlashPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PolicyFile {
    verify_after_write: bool,
    erase_before_write: bool,
    retry_count: u32,
    timeout_ms: u64,
    block_size: usize,
    progress_reporting: bool,
}

impl Default for PolicyFile {
    fn default() -> Self {
        Self {
            verify_after_write: true,
            erase_before_write: true,
            retry_count: 3,
            timeout_ms: 5000,
            block_size: DEFAULT_BLOCK_SIZE,
            progress_reporting: true,
        }
    }
}

impl TryFrom<PolicyFile> for FlashPolicy {
    type Error = FlashError;

    fn try_from(file: PolicyFile) -> Result<Self, Self::Error> {
        if file.timeout_ms == 0 {
            return Err(FlashError::invalid_configuration(
                "timeout must be greater than zero",
            ));
        }
        if file.block_size == 0 {
            return Err(FlashError::invalid_configuration(
                "block size must be greater than zero",
            ));
        }
        Ok(Self {
            verify_after_write: file.verify_after_write,
            erase_before_write: file.erase_before_write,
            retry_count: file.retry_count,
            timeout: Duration::from_millis(file.timeout_ms),
            block_size: file.block_size,
            progress_reporting: file.progress_reporting,
        })
    }
}

impl From<FlashPolicy> for PolicyFile {
    fn from(policy: FlashPolicy) -> Self {
        Self {
            verify_after_write: policy.verify_after_write,
            erase_before_write: policy.erase_before_write,
            retry_count: policy.retry_count,
            timeout_ms: policy.timeout.as_millis().min(u64::MAX as u128) as u64,
            block_size: policy.block_size,
            progress_reporting: policy.progress_reporting,
        }
    }
}

/// Builder for [`FlashPolicy`]. Validation happens in [`build`](Self::build).
#[derive(Debug, Clone, Default)]
pub struct FlashPolicyBuilder {
    file: PolicyFile,
}

impl FlashPolicyBuilder {
    pub fn verify_after_write(mut self, enabled: bool) -> Self {
        self.file.verify_after_write = enabled;
        self
    }

    pub fn erase_before_write(mut self, enabled: bool) -> Self {
        self.file.erase_before_write = enabled;
        self
    }

    pub fn retry_count(mut self, retries: u32) -> Self {
        self.file.retry_count = retries;
        self
    }

    /// Timeout for each channel call. Sub-millisecond precision is dropped.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.file.timeout_ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub fn block_size(mut self, bytes: usize) -> Self {
        self.file.block_size = bytes;
        self
    }

    pub fn progress_reporting(mut self, enabled: bool) -> Self {
        self.file.progress_reporting = enabled;
        self
    }

    pub fn build(self) -> Result<FlashPolicy, FlashError> {
        FlashPolicy::try_from(self.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = FlashPolicy::default();
        assert!(policy.verify_after_write());
        assert!(policy.erase_before_write());
        assert_eq!(policy.retry_count(), 3);
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.timeout(), Duration::from_millis(5000));
        assert_eq!(policy.block_size(), DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = FlashPolicy::new(true, true, 1, Duration::ZERO).unwrap_err();
        assert!(matches!(err, FlashError::InvalidConfiguration(_)));

        // Sub-millisecond timeouts round down to zero.
        let err = FlashPolicy::builder()
            .timeout(Duration::from_micros(500))
            .build()
            .unwrap_err();
        assert!(matches!(err, FlashError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let err = FlashPolicy::builder().block_size(0).build().unwrap_err();
        assert!(matches!(err, FlashError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_toml_round_trip() {
        let policy = FlashPolicy::new(false, false, 5, Duration::from_secs(10)).unwrap();
        let text = toml::to_string_pretty(&policy).unwrap();
        assert!(text.contains("timeout_ms = 10000"));

        let parsed: FlashPolicy = toml::from_str(&text).unwrap();
        assert_eq!(parsed, policy);
    }

    #[test]
    fn test_file_round_trip() {
        let path = std::env::temp_dir().join(format!("samflash-policy-{}.toml", std::process::id()));
        let policy = FlashPolicy::builder()
            .retry_count(2)
            .timeout(Duration::from_millis(750))
            .block_size(128)
            .build()
            .unwrap();

        policy.save_to_file(&path).unwrap();
        let loaded = FlashPolicy::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(loaded, policy);
    }

    #[test]
    fn test_toml_partial_uses_defaults() {
        let parsed: FlashPolicy = toml::from_str("retry_count = 7\n").unwrap();
        assert_eq!(parsed.retry_count(), 7);
        assert!(parsed.verify_after_write());
        assert_eq!(parsed.timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn test_toml_invalid_rejected() {
        assert!(toml::from_str::<FlashPolicy>("timeout_ms = 0\n").is_err());
    }

    #[test]
    fn test_to_builder_preserves_values() {
        let policy = FlashPolicy::builder()
            .retry_count(9)
            .block_size(64)
            .progress_reporting(false)
            .build()
            .unwrap();
        let copy = policy.to_builder().erase_before_write(false).build().unwrap();
        assert_eq!(copy.retry_count(), 9);
        assert_eq!(copy.block_size(), 64);
        assert!(!copy.progress_reporting());
        assert!(!copy.erase_before_write());
    }
}
