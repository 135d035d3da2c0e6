//! TOML configuration: load-and-parse into typed structs.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    /// Empty disables persistence entirely.
    #[serde(default)]
    pub lease_file: String,
    pub networks: Vec<NetworkConfig>,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    pub interface: String,
    pub start_ip: Ipv4Addr,
    pub range: u32,
    pub net_mask: Ipv4Addr,
    #[serde(deserialize_with = "deserialize_duration")]
    pub lease_duration: Duration,
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
    #[serde(default)]
    pub static_leases: Vec<StaticLeaseConfig>,
}

#[derive(Debug, Deserialize)]
pub struct StaticLeaseConfig {
    pub mac: String,
    pub name: String,
    pub ip: Ipv4Addr,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config {}: {e}", path.display()))?;
        toml::from_str(&content).map_err(|e| format!("failed to parse config: {e}"))
    }
}

fn deserialize_duration<'de, D>(de: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(de)?;
    parse_duration_literal(&raw).map_err(serde::de::Error::custom)
}

/// `<n><unit>` where unit is `s`, `m`, or `h` — e.g. `"20m"`, `"1h"`.
/// Small enough a one-off parser beats a new dependency for a single field.
fn parse_duration_literal(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let (digits, unit) = raw.split_at(raw.len().saturating_sub(1));
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration literal: {raw}"))?;
    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        _ => return Err(format!("invalid duration unit in {raw:?}, want s/m/h")),
    };
    Ok(Duration::from_secs(secs))
}
