//! Transport tunables.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Registration granularity bounds: 1 MiB to 256 MiB.
pub const CHUNK_SHIFT_MIN: u32 = 20;
pub const CHUNK_SHIFT_MAX: u32 = 28;

/// Tunables of a migration session.
///
/// Defaults match the values the transport was benchmarked with; every
/// field can be overridden from a TOML snippet, e.g.:
///
/// ```toml
/// chunk_shift = 21
/// unsignaled_max = 32
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// log2 of the chunk size used for dynamic registration.
    pub chunk_shift: u32,

    /// Hard upper bound on the size of one coalesced RDMA WRITE.
    pub merge_max: u64,

    /// Maximum number of consecutive unsignaled WRITEs before a post is
    /// forced to be signaled.
    pub unsignaled_max: u32,

    /// Send work request depth of the queue pair.
    pub qp_size: u32,

    /// Size of each pre-registered control buffer.
    pub control_max_buffer: usize,

    /// Largest byte-stream payload carried by one control SEND.
    pub send_increment: usize,

    /// Timeout for connection-manager address and route resolution.
    pub resolve_timeout_ms: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_shift: 20,
            merge_max: 4 * 1024 * 1024,
            unsignaled_max: 64,
            qp_size: 1000,
            control_max_buffer: 512 * 1024,
            send_increment: 32 * 1024,
            resolve_timeout_ms: 10_000,
        }
    }
}

impl Config {
    /// Completion queue depth derived from the send queue depth.
    #[inline]
    pub fn cq_size(&self) -> u32 {
        self.qp_size * 3
    }

    /// Chunk size in bytes.
    #[inline]
    pub fn chunk_size(&self) -> u64 {
        1u64 << self.chunk_shift
    }

    /// Parse a TOML snippet, falling back to defaults for absent fields.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(s).map_err(|e| Error::Config(format!("bad config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject tunable combinations the transport cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if !(CHUNK_SHIFT_MIN..=CHUNK_SHIFT_MAX).contains(&self.chunk_shift) {
            return Err(Error::Config(format!(
                "chunk_shift {} outside [{CHUNK_SHIFT_MIN}, {CHUNK_SHIFT_MAX}]",
                self.chunk_shift
            )));
        }
        if self.merge_max == 0 {
            return Err(Error::Config("merge_max must be nonzero".into()));
        }
        if self.unsignaled_max == 0 {
            return Err(Error::Config("unsignaled_max must be nonzero".into()));
        }
        if self.qp_size == 0 {
            return Err(Error::Config("qp_size must be nonzero".into()));
        }
        if self.send_increment + crate::proto::CONTROL_HEADER_SIZE > self.control_max_buffer {
            return Err(Error::Config(format!(
                "send_increment {} does not fit a control buffer of {}",
                self.send_increment, self.control_max_buffer
            )));
        }
        if self.resolve_timeout_ms <= 0 {
            return Err(Error::Config("resolve_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.cq_size(), 3000);
        assert_eq!(config.chunk_size(), 1 << 20);
    }

    #[test]
    fn toml_overrides() -> anyhow::Result<()> {
        let config = Config::from_toml_str("chunk_shift = 22\nunsignaled_max = 8\n")?;
        assert_eq!(config.chunk_shift, 22);
        assert_eq!(config.unsignaled_max, 8);
        assert_eq!(config.qp_size, 1000);
        Ok(())
    }

    #[test]
    fn chunk_shift_bounds() {
        assert!(Config::from_toml_str("chunk_shift = 19").is_err());
        assert!(Config::from_toml_str("chunk_shift = 29").is_err());
        assert!(Config::from_toml_str("chunk_shift = 28").is_ok());
    }

    #[test]
    fn send_increment_must_fit_control_buffer() {
        let toml = "control_max_buffer = 1024\nsend_increment = 2048";
        assert!(Config::from_toml_str(toml).is_err());
    }
}
