//! Plane configuration loaded from `<store>/marshal.toml`.
//!
//! A missing file is not an error: every key has a default. A file that is
//! present but malformed is rejected so operators notice typos.

use crate::core::error::MarshalError;
use crate::plugins::policy::FsCapability;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "marshal.toml";

/// Hard ceiling on claims per poll regardless of configuration.
pub const MAX_CLAIMS_CEILING: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PlaneConfig {
    pub lease_ttl_seconds: i64,
    pub max_claims_per_poll: u32,
    pub poll_retry_after_seconds: i64,
    /// Upper bound on queued rows inspected per poll.
    pub poll_scan_limit: u32,
    pub token_ttl_seconds: i64,
    /// Combined stdout+stderr budget per directive.
    pub log_budget_bytes: i64,
    pub max_log_chunk_bytes: usize,
    pub max_diff_bytes: usize,
    pub reaper_interval_seconds: u64,
    pub stale_running_grace_seconds: i64,
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfig {
    /// sandbox profile -> isolation driver name
    pub drivers: BTreeMap<String, String>,
    /// Built-in fs grant per profile, used when no policy constrains fs.
    pub default_fs: BTreeMap<String, FsCapability>,
}

impl Default for PlaneConfig {
    fn default() -> Self {
        Self {
            lease_ttl_seconds: 300,
            max_claims_per_poll: MAX_CLAIMS_CEILING,
            poll_retry_after_seconds: 5,
            poll_scan_limit: 50,
            token_ttl_seconds: 600,
            log_budget_bytes: 8 * 1024 * 1024,
            max_log_chunk_bytes: 1024 * 1024,
            max_diff_bytes: 16 * 1024 * 1024,
            reaper_interval_seconds: 30,
            stale_running_grace_seconds: 900,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let drivers = [
            ("restricted", "bubblewrap"),
            ("standard", "bubblewrap"),
            ("container", "docker"),
            ("host", "host"),
        ]
        .into_iter()
        .map(|(p, d)| (p.to_string(), d.to_string()))
        .collect();

        let mut default_fs = BTreeMap::new();
        default_fs.insert(
            "restricted".to_string(),
            FsCapability::new(["/workspace"], Vec::<&str>::new()),
        );
        default_fs.insert(
            "standard".to_string(),
            FsCapability::new(["/workspace"], ["/workspace"]),
        );
        default_fs.insert(
            "container".to_string(),
            FsCapability::new(["/workspace"], ["/workspace"]),
        );
        default_fs.insert(
            "host".to_string(),
            FsCapability::new(["/"], ["/workspace"]),
        );

        Self {
            drivers,
            default_fs,
        }
    }
}

impl SandboxConfig {
    /// Driver for a profile; unknown profiles map to a driver of the same name.
    pub fn driver_for(&self, profile: &str) -> String {
        self.drivers
            .get(profile)
            .cloned()
            .unwrap_or_else(|| profile.to_string())
    }

    pub fn default_fs_for(&self, profile: &str) -> FsCapability {
        self.default_fs.get(profile).cloned().unwrap_or_default()
    }
}

impl PlaneConfig {
    pub fn config_path(store_root: &Path) -> PathBuf {
        store_root.join(CONFIG_FILE_NAME)
    }

    pub fn load(store_root: &Path) -> Result<Self, MarshalError> {
        let path = Self::config_path(store_root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path).map_err(MarshalError::IoError)?;
        let config: PlaneConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MarshalError> {
        if self.lease_ttl_seconds <= 0 {
            return Err(MarshalError::Config(
                "lease_ttl_seconds must be positive".to_string(),
            ));
        }
        if self.token_ttl_seconds <= 0 {
            return Err(MarshalError::Config(
                "token_ttl_seconds must be positive".to_string(),
            ));
        }
        if self.log_budget_bytes < 0 {
            return Err(MarshalError::Config(
                "log_budget_bytes cannot be negative".to_string(),
            ));
        }
        if self.max_claims_per_poll == 0 {
            return Err(MarshalError::Config(
                "max_claims_per_poll must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Server-side cap applied to a requested claim count.
    pub fn claim_cap(&self) -> u32 {
        self.max_claims_per_poll.min(MAX_CLAIMS_CEILING)
    }
}
