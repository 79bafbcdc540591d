//! Runtime options.
//!
//! Options are collected before initialization and frozen into an
//! `Arc<Options>` snapshot that every domain, stream and buffer reads from.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use hstreams_tracing::targets;

/// Dependency policy applied by every physical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DepPolicy {
    /// Every action depends on the previous one in its stream.
    #[default]
    Conservative,
    /// Transfers only depend on earlier actions touching the same buffers.
    Buffers,
    /// No dependencies are tracked and waits return immediately.
    None,
}

/// Wait timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Timeout {
    #[default]
    Infinite,
    Millis(u64),
}

impl Timeout {
    pub fn as_duration(self) -> Option<Duration> {
        match self {
            Timeout::Infinite => None,
            Timeout::Millis(ms) => Some(Duration::from_millis(ms)),
        }
    }
}

/// Thread placement hint forwarded to sink-side runtimes. Informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum KmpAffinity {
    #[default]
    Balanced,
    Compact,
    Scatter,
}

/// When sink-side thread pools are configured. Informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OpenMpPolicy {
    #[default]
    OnDemand,
    PreSetup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub dep_policy: DepPolicy,
    /// Maximum number of accelerator domains to bring up.
    pub phys_domains_limit: u32,
    pub time_out_ms: Timeout,
    pub kmp_affinity: KmpAffinity,
    pub openmp_policy: OpenMpPolicy,
    /// A buffer's completed actions are pruned every this many new actions.
    pub pending_action_prune_interval: u32,
    /// Sink buffers larger than this request huge-page backing.
    pub huge_page_threshold: u64,
    /// Libraries loaded into every accelerator domain at init.
    pub sink_libraries: Vec<String>,
    /// Libraries loaded into the host domain at init.
    pub host_libraries: Vec<String>,
    /// Accelerator domains emulated by the loopback engine.
    pub loopback_devices: u32,
    pub loopback_threads_per_device: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dep_policy: DepPolicy::Conservative,
            phys_domains_limit: u32::MAX,
            time_out_ms: Timeout::Infinite,
            kmp_affinity: KmpAffinity::Balanced,
            openmp_policy: OpenMpPolicy::OnDemand,
            pending_action_prune_interval: 100,
            huge_page_threshold: u64::MAX,
            sink_libraries: Vec::new(),
            host_libraries: Vec::new(),
            loopback_devices: 1,
            loopback_threads_per_device: 16,
        }
    }
}

impl Options {
    /// Check the option set for contradictions.
    pub fn validate(&self) -> Result<()> {
        if self.time_out_ms == Timeout::Millis(0) {
            return Err(Error::InconsistentArgs(
                "time_out_ms must be positive or infinite".to_string(),
            ));
        }
        if self.pending_action_prune_interval == 0 {
            return Err(Error::InconsistentArgs(
                "pending_action_prune_interval must be at least 1".to_string(),
            ));
        }
        if let Some(name) = self
            .sink_libraries
            .iter()
            .chain(self.host_libraries.iter())
            .find(|name| name.trim().is_empty())
        {
            return Err(Error::InconsistentArgs(format!(
                "library names must not be empty (got {name:?})"
            )));
        }
        Ok(())
    }

    /// Defaults overridden by environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `HSTREAMS_DEP_POLICY` - `conservative`, `buffers` or `none`
    /// - `HSTREAMS_TIMEOUT_MS` - milliseconds, or `-1` / `infinite`
    /// - `HSTREAMS_PHYS_DOMAINS_LIMIT`
    /// - `HSTREAMS_PRUNE_INTERVAL`
    /// - `HSTREAMS_LOOPBACK_DEVICES`, `HSTREAMS_LOOPBACK_THREADS`
    /// - `MIC_USE_2MB_BUFFERS` - huge-page threshold, `<int>[BKMGT]`
    ///
    /// Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut options = Self::default();

        if let Ok(value) = env::var("HSTREAMS_DEP_POLICY") {
            match value.trim().to_ascii_lowercase().as_str() {
                "conservative" => options.dep_policy = DepPolicy::Conservative,
                "buffers" => options.dep_policy = DepPolicy::Buffers,
                "none" => options.dep_policy = DepPolicy::None,
                other => tracing::warn!(target: targets::MISC, value = other, "ignoring HSTREAMS_DEP_POLICY"),
            }
        }

        if let Ok(value) = env::var("HSTREAMS_TIMEOUT_MS") {
            let value = value.trim();
            if value == "-1" || value.eq_ignore_ascii_case("infinite") {
                options.time_out_ms = Timeout::Infinite;
            } else {
                match value.parse::<u64>() {
                    Ok(ms) if ms > 0 => options.time_out_ms = Timeout::Millis(ms),
                    _ => tracing::warn!(target: targets::MISC, value, "ignoring HSTREAMS_TIMEOUT_MS"),
                }
            }
        }

        if let Some(limit) = parse_env_u32("HSTREAMS_PHYS_DOMAINS_LIMIT") {
            options.phys_domains_limit = limit;
        }
        if let Some(interval) = parse_env_u32("HSTREAMS_PRUNE_INTERVAL").filter(|v| *v > 0) {
            options.pending_action_prune_interval = interval;
        }
        if let Some(devices) = parse_env_u32("HSTREAMS_LOOPBACK_DEVICES") {
            options.loopback_devices = devices;
        }
        if let Some(threads) = parse_env_u32("HSTREAMS_LOOPBACK_THREADS").filter(|v| *v > 0) {
            options.loopback_threads_per_device = threads;
        }

        if let Ok(value) = env::var("MIC_USE_2MB_BUFFERS") {
            match parse_size_with_suffix(&value) {
                Some(bytes) => options.huge_page_threshold = bytes,
                None => tracing::warn!(
                    target: targets::MEM,
                    value = value.as_str(),
                    "MIC_USE_2MB_BUFFERS must be <int>[BKMGT]; ignoring"
                ),
            }
        }

        options
    }
}

fn parse_env_u32(key: &str) -> Option<u32> {
    let value = env::var(key).ok()?;
    match value.trim().parse::<u32>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(target: targets::MISC, key, value = value.as_str(), "ignoring unparsable option");
            None
        }
    }
}

/// Parse `<int>[BKMGT]` (case-insensitive suffix) into bytes.
pub fn parse_size_with_suffix(value: &str) -> Option<u64> {
    let value = value.trim();
    let digits_end = value.find(|c: char| !c.is_ascii_digit()).unwrap_or(value.len());
    if digits_end == 0 {
        return None;
    }
    let number: u64 = value[..digits_end].parse().ok()?;
    let shift = match value[digits_end..].to_ascii_uppercase().as_str() {
        "" | "B" => 0,
        "K" => 10,
        "M" => 20,
        "G" => 30,
        "T" => 40,
        _ => return None,
    };
    number.checked_mul(1u64 << shift)
}
