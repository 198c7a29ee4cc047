use serde::{Deserialize, Serialize};

/// Storage-profile hint used to scale pool sizes and chunking defaults when
/// the caller leaves the corresponding `EngineConfig` field unset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageProfile {
    #[default]
    Hdd,
    Ssd,
}

fn default_cache_cap_entries() -> usize {
    20
}

fn default_prefetch_back() -> usize {
    3
}

fn default_prefetch_ahead() -> usize {
    5
}

fn default_thumb_box_w() -> u32 {
    400
}

fn default_thumb_box_h() -> u32 {
    400
}

fn default_db_retry_max() -> u32 {
    5
}

fn default_db_retry_base_ms() -> u64 {
    10
}

fn default_db_vacuum_days() -> u32 {
    30
}

/// Engine-wide configuration. Unknown keys are rejected at load time so a
/// typo in a config file surfaces immediately rather than silently no-op'ing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default = "default_cache_cap_entries")]
    pub cache_cap_entries: usize,

    #[serde(default)]
    pub cache_cap_bytes: Option<u64>,

    #[serde(default = "default_prefetch_back")]
    pub prefetch_back: usize,

    #[serde(default = "default_prefetch_ahead")]
    pub prefetch_ahead: usize,

    #[serde(default = "default_thumb_box_w")]
    pub thumb_box_w: u32,

    #[serde(default = "default_thumb_box_h")]
    pub thumb_box_h: u32,

    #[serde(default)]
    pub worker_pool_size: Option<usize>,

    #[serde(default)]
    pub io_pool_size: Option<usize>,

    #[serde(default = "default_db_retry_max")]
    pub db_retry_max: u32,

    #[serde(default = "default_db_retry_base_ms")]
    pub db_retry_base_ms: u64,

    #[serde(default = "default_db_vacuum_days")]
    pub db_vacuum_days: u32,

    #[serde(default)]
    pub storage_profile: StorageProfile,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            cache_cap_entries: default_cache_cap_entries(),
            cache_cap_bytes: None,
            prefetch_back: default_prefetch_back(),
            prefetch_ahead: default_prefetch_ahead(),
            thumb_box_w: default_thumb_box_w(),
            thumb_box_h: default_thumb_box_h(),
            worker_pool_size: None,
            io_pool_size: None,
            db_retry_max: default_db_retry_max(),
            db_retry_base_ms: default_db_retry_base_ms(),
            db_vacuum_days: default_db_vacuum_days(),
            storage_profile: StorageProfile::default(),
        }
    }
}

impl EngineConfig {
    /// Parses a config object from JSON text, rejecting unknown keys.
    pub fn from_json(text: &str) -> Result<Self, crate::error::EngineError> {
        serde_json::from_str(text)
            .map_err(|error| crate::error::EngineError::InvalidConfig(error.to_string()))
    }

    pub fn worker_pool_size(&self) -> usize {
        self.worker_pool_size.unwrap_or_else(|| {
            let cpu_count = std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(4);
            cpu_count.saturating_sub(1).max(2)
        })
    }

    pub fn io_pool_size(&self) -> usize {
        self.io_pool_size.unwrap_or_else(|| {
            let cpu_count = std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(4);
            match self.storage_profile {
                StorageProfile::Hdd => cpu_count.min(4).max(2),
                StorageProfile::Ssd => cpu_count.min(12).max(4),
            }
        })
    }

    pub fn thumb_box(&self) -> (u32, u32) {
        (self.thumb_box_w, self.thumb_box_h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.cache_cap_entries, 20);
        assert_eq!(config.prefetch_back, 3);
        assert_eq!(config.prefetch_ahead, 5);
        assert_eq!(config.thumb_box(), (400, 400));
        assert_eq!(config.db_retry_max, 5);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let text = r#"{"cache_cap_entries": 10, "not_a_real_field": 1}"#;
        assert!(EngineConfig::from_json(text).is_err());
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let text = r#"{"cache_cap_entries": 50}"#;
        let config = EngineConfig::from_json(text).expect("should parse");
        assert_eq!(config.cache_cap_entries, 50);
        assert_eq!(config.prefetch_ahead, 5);
    }

    #[test]
    fn worker_pool_size_defaults_to_at_least_two() {
        let config = EngineConfig::default();
        assert!(config.worker_pool_size() >= 2);
    }
}
