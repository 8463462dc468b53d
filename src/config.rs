//! Network descriptors and scan configuration
//!
//! `NetworkDescriptor` identifies a chain (loaded from a JSON networks file
//! or built from flags). `ScanConfig` is the operator-supplied scan request,
//! validated as a whole before the coordinator changes state.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Immutable identity of a chain to scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    /// Human-readable network name, also the storage namespace
    pub name: String,
    /// Chain id the endpoint must report
    pub chain_id: u64,
    /// JSON-RPC HTTP endpoint
    pub rpc_url: String,
    /// Optional WebSocket endpoint for newHeads subscriptions
    #[serde(default)]
    pub ws_url: Option<String>,
    /// Expected average block interval in milliseconds
    #[serde(default = "default_block_time_ms")]
    pub block_time_ms: u64,
}

fn default_block_time_ms() -> u64 {
    12_000
}

impl NetworkDescriptor {
    pub fn new(name: impl Into<String>, chain_id: u64, rpc_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chain_id,
            rpc_url: rpc_url.into(),
            ws_url: None,
            block_time_ms: default_block_time_ms(),
        }
    }

    pub fn with_ws_url(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = Some(ws_url.into());
        self
    }

    pub fn with_block_time(mut self, block_time: Duration) -> Self {
        self.block_time_ms = block_time.as_millis() as u64;
        self
    }

    /// Expected average block interval.
    pub fn block_time(&self) -> Duration {
        Duration::from_millis(self.block_time_ms.max(1))
    }

    fn check(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("network name is empty");
        }
        if self.chain_id == 0 {
            anyhow::bail!("network '{}' has chain_id 0", self.name);
        }
        if !self.rpc_url.starts_with("http://") && !self.rpc_url.starts_with("https://") {
            anyhow::bail!("network '{}' rpc_url must be http(s): {}", self.name, self.rpc_url);
        }
        if let Some(ws) = &self.ws_url {
            if !ws.starts_with("ws://") && !ws.starts_with("wss://") {
                anyhow::bail!("network '{}' ws_url must be ws(s): {}", self.name, ws);
            }
        }
        Ok(())
    }
}

/// Load network descriptors from a JSON file containing an array of descriptors.
///
/// # Example file format:
/// ```json
/// [
///   { "name": "mainnet", "chain_id": 1, "rpc_url": "https://eth.llamarpc.com",
///     "ws_url": "wss://eth.llamarpc.com", "block_time_ms": 12000 }
/// ]
/// ```
pub fn load_networks(path: &Path) -> Result<Vec<NetworkDescriptor>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read networks file: {:?}", path))?;
    let networks: Vec<NetworkDescriptor> =
        serde_json::from_str(&contents).context("Failed to parse networks file")?;

    if networks.is_empty() {
        anyhow::bail!("Networks file is empty (no networks defined)");
    }

    let mut seen = HashSet::new();
    for network in &networks {
        network.check()?;
        if !seen.insert(network.name.as_str()) {
            anyhow::bail!("Duplicate network name: {}", network.name);
        }
    }
    Ok(networks)
}

/// Which scanning strategy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    Realtime,
    Historical,
    Both,
}

impl ScanMode {
    /// Single-byte tag used in checkpoint keys.
    pub fn tag(self) -> u8 {
        match self {
            ScanMode::Realtime => b'r',
            ScanMode::Historical => b'h',
            ScanMode::Both => b'b',
        }
    }

    /// Whether this mode walks a fixed block range.
    pub fn has_range(self) -> bool {
        matches!(self, ScanMode::Historical | ScanMode::Both)
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScanMode::Realtime => "realtime",
            ScanMode::Historical => "historical",
            ScanMode::Both => "both",
        })
    }
}

impl FromStr for ScanMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "realtime" => Ok(ScanMode::Realtime),
            "historical" => Ok(ScanMode::Historical),
            "both" => Ok(ScanMode::Both),
            other => Err(format!("unknown scan mode: {other}")),
        }
    }
}

/// A block height or the `"latest"` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Number(u64),
    Latest,
}

impl BlockTag {
    /// Resolve against the current chain height.
    pub fn resolve(self, latest: u64) -> u64 {
        match self {
            BlockTag::Number(n) => n,
            BlockTag::Latest => latest,
        }
    }
}

impl fmt::Display for BlockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockTag::Number(n) => write!(f, "{n}"),
            BlockTag::Latest => f.write_str("latest"),
        }
    }
}

impl FromStr for BlockTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("latest") {
            return Ok(BlockTag::Latest);
        }
        s.parse::<u64>()
            .map(BlockTag::Number)
            .map_err(|_| format!("expected a block number or \"latest\", got {s}"))
    }
}

impl Serialize for BlockTag {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            BlockTag::Number(n) => s.serialize_u64(*n),
            BlockTag::Latest => s.serialize_str("latest"),
        }
    }
}

impl<'de> Deserialize<'de> for BlockTag {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(d)? {
            Raw::Number(n) => Ok(BlockTag::Number(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Operator-supplied scan configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    pub network: String,
    pub mode: ScanMode,
    pub start_block: BlockTag,
    pub end_block: BlockTag,
    pub batch_size: u64,
    #[serde(default)]
    pub batch_delay_ms: u64,
    pub max_retries: u32,
    #[serde(default)]
    pub analyze_bytecode: bool,
}

impl ScanConfig {
    /// Config for `network` covering `latest..=latest` with default batching.
    pub fn new(network: impl Into<String>, mode: ScanMode) -> Self {
        Self {
            network: network.into(),
            mode,
            start_block: BlockTag::Latest,
            end_block: BlockTag::Latest,
            batch_size: 10,
            batch_delay_ms: 1_000,
            max_retries: 3,
            analyze_bytecode: false,
        }
    }

    pub fn with_range(mut self, start: BlockTag, end: BlockTag) -> Self {
        self.start_block = start;
        self.end_block = end;
        self
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    /// Resolve `latest` sentinels against the chain height: `(start, end)`.
    pub fn resolve_range(&self, latest: u64) -> (u64, u64) {
        (self.start_block.resolve(latest), self.end_block.resolve(latest))
    }

    /// Check every field, reporting all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues = Vec::new();

        if self.network.trim().is_empty() {
            issues.push(ConfigIssue::new("network", "must not be empty"));
        }
        if self.batch_size == 0 {
            issues.push(ConfigIssue::new("batch_size", "must be greater than zero"));
        }
        if self.batch_size > MAX_BATCH_SIZE {
            issues.push(ConfigIssue::new(
                "batch_size",
                format!("must not exceed {MAX_BATCH_SIZE}"),
            ));
        }
        if self.mode.has_range() {
            if let (BlockTag::Number(start), BlockTag::Number(end)) =
                (self.start_block, self.end_block)
            {
                if start > end {
                    issues.push(ConfigIssue::new(
                        "start_block",
                        format!("{start} is after end_block {end}"),
                    ));
                }
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { issues })
        }
    }
}

/// Upper bound on blocks fetched concurrently in one batch.
pub const MAX_BATCH_SIZE: u64 = 1_000;

/// One invalid field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigIssue {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Every invalid field of a `ScanConfig`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid scan config: {}", render_issues(.issues))]
pub struct ConfigError {
    pub issues: Vec<ConfigIssue>,
}

impl ConfigError {
    pub fn has_field(&self, field: &str) -> bool {
        self.issues.iter().any(|i| i.field == field)
    }
}

fn render_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(|i| format!("{} {}", i.field, i.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_networks() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"[
                {{"name": "mainnet", "chain_id": 1, "rpc_url": "https://rpc.example", "ws_url": "wss://ws.example"}},
                {{"name": "base", "chain_id": 8453, "rpc_url": "http://127.0.0.1:8545", "block_time_ms": 2000}}
            ]"#
        )
        .unwrap();
        file.flush().unwrap();

        let networks = load_networks(file.path()).unwrap();
        assert_eq!(networks.len(), 2);
        assert_eq!(networks[0].block_time(), Duration::from_secs(12));
        assert_eq!(networks[1].block_time(), Duration::from_secs(2));
        assert_eq!(networks[0].ws_url.as_deref(), Some("wss://ws.example"));
    }

    #[test]
    fn test_network_builders() {
        let network = NetworkDescriptor::new("base", 8453, "http://127.0.0.1:8545")
            .with_ws_url("ws://127.0.0.1:8546")
            .with_block_time(Duration::from_millis(2_000));
        assert_eq!(network.ws_url.as_deref(), Some("ws://127.0.0.1:8546"));
        assert_eq!(network.block_time_ms, 2_000);
        assert_eq!(network.block_time(), Duration::from_secs(2));

        // A zero interval would spin the poller
        let zero = network.with_block_time(Duration::ZERO);
        assert_eq!(zero.block_time(), Duration::from_millis(1));
    }

    #[test]
    fn test_load_networks_rejects_duplicates() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"[
                {{"name": "a", "chain_id": 1, "rpc_url": "https://x"}},
                {{"name": "a", "chain_id": 2, "rpc_url": "https://y"}}
            ]"#
        )
        .unwrap();
        file.flush().unwrap();
        assert!(load_networks(file.path()).is_err());
    }

    #[test]
    fn test_load_networks_empty() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[]").unwrap();
        file.flush().unwrap();
        assert!(load_networks(file.path()).is_err());
    }

    #[test]
    fn test_block_tag_parsing() {
        assert_eq!("latest".parse::<BlockTag>().unwrap(), BlockTag::Latest);
        assert_eq!("42".parse::<BlockTag>().unwrap(), BlockTag::Number(42));
        assert!("-1".parse::<BlockTag>().is_err());

        let tags: Vec<BlockTag> = serde_json::from_str(r#"[100, "latest"]"#).unwrap();
        assert_eq!(tags, vec![BlockTag::Number(100), BlockTag::Latest]);
        assert_eq!(BlockTag::Latest.resolve(9), 9);
        assert_eq!(BlockTag::Number(3).resolve(9), 3);
    }

    #[test]
    fn test_validate_reports_every_issue() {
        let mut config = ScanConfig::new("", ScanMode::Historical)
            .with_range(BlockTag::Number(10), BlockTag::Number(5));
        config.batch_size = 0;

        let err = config.validate().unwrap_err();
        assert_eq!(err.issues.len(), 3);
        assert!(err.has_field("network"));
        assert!(err.has_field("batch_size"));
        assert!(err.has_field("start_block"));
    }

    #[test]
    fn test_realtime_ignores_range() {
        let config = ScanConfig::new("mainnet", ScanMode::Realtime)
            .with_range(BlockTag::Number(10), BlockTag::Number(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scan_mode_from_str() {
        assert_eq!("Both".parse::<ScanMode>().unwrap(), ScanMode::Both);
        assert!("sideways".parse::<ScanMode>().is_err());
        assert_ne!(ScanMode::Historical.tag(), ScanMode::Both.tag());
    }
}
