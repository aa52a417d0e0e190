use std::env;

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "on" | "yes"))
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// Session-visible optimizer switches and variables from spec §6, modeled
/// as env-driven config the same way the teacher reads `HANA_BATCH_SIZE`
/// and friends in `HanaScanVTab::bind`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub partial_read_enabled: bool,
    pub scan_hint: Option<String>,
    pub bulk_batch_size: usize,
    pub limit_expand_factor: f64,
    pub primary_key_dml_level: u32,
    pub small_table_threshold: u64,
    pub cbo_with_actual_records: bool,
    pub cache_range_info: bool,
    pub max_retries: u32,
    pub metadata_ttl_secs: u64,
    pub metadata_delta_threshold: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            partial_read_enabled: env_flag("FEDTAB_PARTIAL_READ", true),
            scan_hint: env::var("FEDTAB_SCAN_HINT").ok().filter(|s| !s.is_empty()),
            bulk_batch_size: env_usize("FEDTAB_BULK_BATCH_SIZE", 1024),
            limit_expand_factor: env_f64("FEDTAB_LIMIT_EXPAND_FACTOR", 2.0),
            primary_key_dml_level: env_usize("FEDTAB_PK_DML_LEVEL", 1) as u32,
            small_table_threshold: env_u64("FEDTAB_SMALL_TABLE_THRESHOLD", 10_000),
            cbo_with_actual_records: env_flag("FEDTAB_CBO_ACTUAL_RECORDS", false),
            cache_range_info: env_flag("FEDTAB_CACHE_RANGE_INFO", true),
            max_retries: env_usize("FEDTAB_MAX_RETRIES", 3) as u32,
            metadata_ttl_secs: env_u64("FEDTAB_METADATA_TTL_SECS", 24 * 3600),
            metadata_delta_threshold: env_u64("FEDTAB_METADATA_DELTA_THRESHOLD", 1000),
        }
    }
}

impl SessionConfig {
    pub fn for_testing() -> Self {
        SessionConfig {
            partial_read_enabled: true,
            scan_hint: None,
            bulk_batch_size: 1024,
            limit_expand_factor: 2.0,
            primary_key_dml_level: 1,
            small_table_threshold: 10_000,
            cbo_with_actual_records: false,
            cache_range_info: true,
            max_retries: 3,
            metadata_ttl_secs: 24 * 3600,
            metadata_delta_threshold: 1000,
        }
    }
}
