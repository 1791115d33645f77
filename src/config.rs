use serde::{Deserialize, Serialize};
use std::path::Path;

/// Runtime settings. Every field has a default, a config file only lists overrides.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Bytes of the graph region (static + dynamic)
    pub device_mem_size: usize,
    /// Bytes of the region served by the memory pool (single-op path)
    pub mem_pool_size: usize,
    pub enable_mem_reuse: bool,
    /// Pad communication buffers to the common alignment
    pub enable_hccl: bool,
    pub mem_align_size: usize,
    pub pool_align_size: usize,
    pub pool_reserved_size: usize,
    pub connector_capacity: usize,
    pub rows_per_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device_mem_size: 64 << 20,
            mem_pool_size: 16 << 20,
            enable_mem_reuse: false,
            enable_hccl: true,
            mem_align_size: 32,
            pool_align_size: 512,
            pool_reserved_size: 512,
            connector_capacity: 16,
            rows_per_buffer: 32,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: RuntimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        Self::from_json(&content)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mem_align_size == 0 || self.pool_align_size == 0 {
            anyhow::bail!("Alignment sizes must be non-zero");
        }
        if self.rows_per_buffer == 0 {
            anyhow::bail!("rows_per_buffer must be non-zero");
        }
        if self.pool_reserved_size >= self.mem_pool_size {
            anyhow::bail!(
                "Pool reserved size {} does not fit in pool of {} bytes",
                self.pool_reserved_size,
                self.mem_pool_size
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = RuntimeConfig::from_json(r#"{ "enable_mem_reuse": true, "mem_align_size": 64 }"#).unwrap();
        assert!(config.enable_mem_reuse);
        assert_eq!(config.mem_align_size, 64);
        assert_eq!(config.pool_align_size, 512);
        assert_eq!(config.connector_capacity, 16);
    }

    #[test]
    fn zero_alignment_is_rejected() {
        assert!(RuntimeConfig::from_json(r#"{ "mem_align_size": 0 }"#).is_err());
    }
}
