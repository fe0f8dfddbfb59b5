use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::TtlPolicy;

pub const DEFAULT_UPDATE_FREQUENCY: u32 = 1;
pub const DEFAULT_TOP_PAGES_LIMIT: u32 = 50;
pub const DEFAULT_TTL_THRESHOLD: u64 = 100;
pub const DEFAULT_SHORT_TTL_SECS: u64 = 60;
pub const DEFAULT_LONG_TTL_SECS: u64 = 24 * 3600;
/// Main namespace; the only content namespace unless configured otherwise.
pub const DEFAULT_CONTENT_NAMESPACES: &[i32] = &[0];

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HitCountersConfig {
    #[serde(default)]
    pub counters: CountersSection,
    #[serde(default)]
    pub cache: CacheSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CountersSection {
    pub disable_counters: Option<bool>,
    pub counters_at_footer: Option<bool>,
    pub update_frequency: Option<u32>,
    pub top_pages_default_limit: Option<u32>,
    pub add_text_length: Option<bool>,
    pub add_page_id: Option<bool>,
    #[serde(default)]
    pub content_namespaces: Vec<i32>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CacheSection {
    pub ttl_threshold: Option<u64>,
    pub short_ttl_secs: Option<u64>,
    pub long_ttl_secs: Option<u64>,
}

/// Fully resolved counter settings handed to the service and the adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountersConfig {
    pub disable_counters: bool,
    pub counters_at_footer: bool,
    pub update_frequency: u32,
    pub top_pages_default_limit: u32,
    pub add_text_length: bool,
    pub add_page_id: bool,
    pub content_namespaces: Vec<i32>,
    pub ttl: TtlPolicy,
}

impl Default for CountersConfig {
    fn default() -> Self {
        Self {
            disable_counters: false,
            counters_at_footer: true,
            update_frequency: DEFAULT_UPDATE_FREQUENCY,
            top_pages_default_limit: DEFAULT_TOP_PAGES_LIMIT,
            add_text_length: false,
            add_page_id: false,
            content_namespaces: DEFAULT_CONTENT_NAMESPACES.to_vec(),
            ttl: TtlPolicy::default(),
        }
    }
}

impl HitCountersConfig {
    /// Resolve settings: env > config > default.
    pub fn resolve(&self) -> CountersConfig {
        self.resolve_with_lookup(|key| env::var(key).ok())
    }

    pub fn resolve_with_lookup<F>(&self, lookup_env: F) -> CountersConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        let counters = &self.counters;
        let disable_counters = lookup_env("HITCOUNTERS_DISABLE_COUNTERS")
            .and_then(|value| parse_flag(&value))
            .or(counters.disable_counters)
            .unwrap_or(false);
        // A frequency of 0 would never flush; treat it like 1.
        let update_frequency = lookup_env("HITCOUNTERS_UPDATE_FREQUENCY")
            .and_then(|value| value.trim().parse::<u32>().ok())
            .or(counters.update_frequency)
            .unwrap_or(DEFAULT_UPDATE_FREQUENCY)
            .max(1);
        let content_namespaces = if counters.content_namespaces.is_empty() {
            DEFAULT_CONTENT_NAMESPACES.to_vec()
        } else {
            counters.content_namespaces.clone()
        };

        CountersConfig {
            disable_counters,
            counters_at_footer: counters.counters_at_footer.unwrap_or(true),
            update_frequency,
            top_pages_default_limit: counters
                .top_pages_default_limit
                .unwrap_or(DEFAULT_TOP_PAGES_LIMIT),
            add_text_length: counters.add_text_length.unwrap_or(false),
            add_page_id: counters.add_page_id.unwrap_or(false),
            content_namespaces,
            ttl: TtlPolicy {
                threshold: self.cache.ttl_threshold.unwrap_or(DEFAULT_TTL_THRESHOLD),
                short_ttl: Duration::from_secs(
                    self.cache.short_ttl_secs.unwrap_or(DEFAULT_SHORT_TTL_SECS),
                ),
                long_ttl: Duration::from_secs(
                    self.cache.long_ttl_secs.unwrap_or(DEFAULT_LONG_TTL_SECS),
                ),
            },
        }
    }
}

/// Load and parse a HitCountersConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<HitCountersConfig> {
    if !config_path.exists() {
        return Ok(HitCountersConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: HitCountersConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
