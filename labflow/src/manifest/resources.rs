//! Per-stage resource requests.
//!
//! Memory, disk, and wall time are written as human strings in the manifest
//! (`8 GB`, `2h`); they normalize to megabytes and seconds here.

use crate::errors::ValidationError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

/// Resource profile for a single stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// CPU cores requested.
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    /// Memory request, e.g. `8 GB` or `512 MB`.
    #[serde(default)]
    pub memory: Option<String>,
    /// GPU slots requested.
    #[serde(default)]
    pub gpus: u32,
    /// Scratch disk request, e.g. `20 GB`.
    #[serde(default)]
    pub disk: Option<String>,
    /// Wall time request, e.g. `2h` or `90m`.
    #[serde(default)]
    pub time: Option<String>,
}

fn default_cpus() -> u32 {
    1
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            memory: None,
            gpus: 0,
            disk: None,
            time: None,
        }
    }
}

impl ResourceSpec {
    /// The memory request in megabytes, defaulting to 1024 when absent.
    pub fn memory_mb(&self) -> Result<u64, ValidationError> {
        match &self.memory {
            None => Ok(1024),
            Some(raw) => parse_size_mb(raw),
        }
    }

    /// The disk request in megabytes, if declared.
    pub fn disk_mb(&self) -> Result<Option<u64>, ValidationError> {
        self.disk.as_deref().map(parse_size_mb).transpose()
    }

    /// The wall time request, if declared.
    pub fn wall_time(&self) -> Result<Option<Duration>, ValidationError> {
        self.time.as_deref().map(parse_duration).transpose()
    }

    /// Validates that every declared field parses.
    pub fn validate(&self, stage: &str) -> Result<(), ValidationError> {
        self.memory_mb()
            .and(self.disk_mb().map(|_| 0))
            .and(self.wall_time().map(|_| ()))
            .map_err(|err| {
                ValidationError::new(format!("stage '{stage}': {}", err.message))
                    .with_stages(vec![stage.to_string()])
            })
    }
}

fn size_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(\d+(?:\.\d+)?)\s*(MB|GB|TB|M|G|T)\s*$")
            .unwrap_or_else(|_| unreachable!("static size pattern"))
    })
}

fn duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(\d+)\s*(s|m|h|d)\s*$")
            .unwrap_or_else(|_| unreachable!("static duration pattern"))
    })
}

/// Parses a human size string into megabytes.
pub fn parse_size_mb(raw: &str) -> Result<u64, ValidationError> {
    let normalized = raw.to_uppercase();
    let caps = size_regex()
        .captures(&normalized)
        .ok_or_else(|| ValidationError::new(format!("unparseable size '{raw}'")))?;

    let amount: f64 = caps[1]
        .parse()
        .map_err(|_| ValidationError::new(format!("unparseable size '{raw}'")))?;
    let factor = match &caps[2] {
        "MB" | "M" => 1.0,
        "GB" | "G" => 1024.0,
        "TB" | "T" => 1024.0 * 1024.0,
        _ => return Err(ValidationError::new(format!("unparseable size '{raw}'"))),
    };

    Ok((amount * factor).round() as u64)
}

/// Parses a human duration string (`90s`, `30m`, `2h`, `1d`).
pub fn parse_duration(raw: &str) -> Result<Duration, ValidationError> {
    let normalized = raw.to_lowercase();
    let caps = duration_regex()
        .captures(&normalized)
        .ok_or_else(|| ValidationError::new(format!("unparseable duration '{raw}'")))?;

    let amount: u64 = caps[1]
        .parse()
        .map_err(|_| ValidationError::new(format!("unparseable duration '{raw}'")))?;
    let seconds = match &caps[2] {
        "s" => amount,
        "m" => amount * 60,
        "h" => amount * 3600,
        "d" => amount * 86_400,
        _ => return Err(ValidationError::new(format!("unparseable duration '{raw}'"))),
    };

    Ok(Duration::from_secs(seconds))
}
